//! 结果聚合器
//!
//! 把成功终止的调用输出按描述符的输出模式折叠进会话槽位。冲突裁决优先级：
//! 用户口述值 > 权威工具值 > 较晚成功的工具值。折叠按调用 ID 幂等：同一终态结果
//! 重复折叠不产生任何变化。槽位类型冲突只废弃该字段的写入并记日志，不影响回合。

use serde_json::Value;

use crate::core::OrchestratorError;
use crate::session::{Session, SlotSource, SlotValue};
use crate::tools::{InvocationState, ToolDescriptor, ToolInvocation};

/// 结果聚合器（无状态；幂等性依赖会话内的已折叠集合）
#[derive(Debug, Default)]
pub struct ResultAggregator;

impl ResultAggregator {
    pub fn new() -> Self {
        Self
    }

    /// 折叠一个终态调用。非成功终态只登记（无输出可折叠）；重复折叠是 no-op。
    pub fn fold(
        &self,
        session: &mut Session,
        descriptor: &ToolDescriptor,
        invocation: &ToolInvocation,
    ) -> Result<(), OrchestratorError> {
        debug_assert!(invocation.state.is_terminal());

        if session.folded.contains(&invocation.id) {
            return Ok(());
        }
        session.folded.insert(invocation.id);

        if invocation.state != InvocationState::Succeeded {
            return Ok(());
        }
        let payload = match &invocation.output {
            Some(Value::Object(map)) => map,
            // 非对象负载没有可命名字段，无法进槽位
            _ => return Ok(()),
        };

        for spec in &descriptor.outputs {
            let Some(value) = payload.get(&spec.name) else {
                continue;
            };
            if value.is_null() {
                continue;
            }

            let authoritative = descriptor.is_authoritative_for(&spec.name);
            if let Some(existing) = session.slots.get(&spec.name) {
                if !should_overwrite(existing, authoritative) {
                    continue;
                }
            }

            let source = SlotSource::Tool {
                tool_id: descriptor.id.clone(),
                authoritative,
            };
            if let Err(e) = session.write_slot(&spec.name, value.clone(), source) {
                // 只废弃本字段写入，回合继续
                tracing::warn!(
                    tool = %descriptor.id,
                    slot = %spec.name,
                    error = %e,
                    "slot write discarded"
                );
            }
        }

        Ok(())
    }
}

/// 覆盖裁决：用户值永不被工具覆盖；权威值只被权威值（更晚的）覆盖；
/// 其余情况较晚成功者胜出。
fn should_overwrite(existing: &SlotValue, new_is_authoritative: bool) -> bool {
    match &existing.source {
        SlotSource::User => false,
        SlotSource::Tool { authoritative, .. } => {
            if *authoritative && !new_is_authoritative {
                return false;
            }
            true
        }
    }
}
