//! 工具注册表
//!
//! 按标识符存储 Arc<ToolDescriptor>。重注册按策略处理：默认原子替换（在飞调用持有旧
//! Arc，不受影响）；Deny 策略下重复注册报 DuplicateTool。list 返回调用时刻的快照，
//! 之后的注册不会出现在已返回的序列里。

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::core::OrchestratorError;
use crate::tools::ToolDescriptor;

/// 重注册策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverwritePolicy {
    /// 同名注册原子替换旧描述符（默认）
    Replace,
    /// 同名注册报 DuplicateTool
    Deny,
}

impl Default for OverwritePolicy {
    fn default() -> Self {
        OverwritePolicy::Replace
    }
}

/// 注册表快照：调用时刻一致，可重复迭代
#[derive(Debug, Clone)]
pub struct RegistrySnapshot {
    descriptors: Vec<Arc<ToolDescriptor>>,
}

impl RegistrySnapshot {
    pub fn iter(&self) -> impl Iterator<Item = &Arc<ToolDescriptor>> {
        self.descriptors.iter()
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}

impl IntoIterator for RegistrySnapshot {
    type Item = Arc<ToolDescriptor>;
    type IntoIter = std::vec::IntoIter<Arc<ToolDescriptor>>;

    fn into_iter(self) -> Self::IntoIter {
        self.descriptors.into_iter()
    }
}

/// 工具注册表
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, Arc<ToolDescriptor>>>,
    policy: OverwritePolicy,
}

impl ToolRegistry {
    pub fn new(policy: OverwritePolicy) -> Self {
        Self {
            tools: RwLock::new(HashMap::new()),
            policy,
        }
    }

    /// 注册描述符；Deny 策略且同名已存在时报 DuplicateTool
    pub fn register(&self, descriptor: ToolDescriptor) -> Result<(), OrchestratorError> {
        let mut tools = self.tools.write().expect("registry lock poisoned");
        if self.policy == OverwritePolicy::Deny && tools.contains_key(&descriptor.id) {
            return Err(OrchestratorError::DuplicateTool(descriptor.id));
        }
        let id = descriptor.id.clone();
        if tools.insert(id.clone(), Arc::new(descriptor)).is_some() {
            tracing::info!(tool = %id, "tool descriptor replaced");
        } else {
            tracing::info!(tool = %id, "tool descriptor registered");
        }
        Ok(())
    }

    /// 解析当前描述符
    pub fn resolve(&self, id: &str) -> Result<Arc<ToolDescriptor>, OrchestratorError> {
        self.tools
            .read()
            .expect("registry lock poisoned")
            .get(id)
            .cloned()
            .ok_or_else(|| OrchestratorError::UnknownTool(id.to_string()))
    }

    /// 当前全部描述符的快照
    pub fn list(&self) -> RegistrySnapshot {
        let mut descriptors: Vec<_> = self
            .tools
            .read()
            .expect("registry lock poisoned")
            .values()
            .cloned()
            .collect();
        descriptors.sort_by(|a, b| a.id.cmp(&b.id));
        RegistrySnapshot { descriptors }
    }

    /// 配置重载入口：逐个描述符走 register 的原子替换语义
    pub fn reload(&self, descriptors: Vec<ToolDescriptor>) -> Result<(), OrchestratorError> {
        for descriptor in descriptors {
            self.register(descriptor)?;
        }
        Ok(())
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new(OverwritePolicy::Replace)
    }
}
