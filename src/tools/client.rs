//! 工具调用客户端
//!
//! invoke 流程：按描述符输入模式校验实参（收集全部违规）-> 按描述符超时派发一次 ->
//! 状态迁移与错误归类（Timeout / Transport / Execution 严格区分）。每次调用恰好一次
//! 尝试，重试策略归编排器；每次调用输出结构化审计日志（JSON）。

use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::core::OrchestratorError;
use crate::tools::invocation::{FailureReason, ToolInvocation};
use crate::tools::transport::{ResponseStatus, ToolRequest, ToolTransport};
use crate::tools::ToolDescriptor;

/// 工具客户端：持有传输实现，对单个描述符做一次调用
pub struct ToolClient {
    transport: Arc<dyn ToolTransport>,
}

impl ToolClient {
    pub fn new(transport: Arc<dyn ToolTransport>) -> Self {
        Self { transport }
    }

    /// 调用一个工具：校验、派发、状态迁移。成功返回输出负载；
    /// 失败时 invocation 已处于对应终态，错误按税目返回。
    pub async fn invoke(
        &self,
        descriptor: &ToolDescriptor,
        invocation: &mut ToolInvocation,
        cancel: &CancellationToken,
    ) -> Result<Value, OrchestratorError> {
        let violations = descriptor.validate_args(&invocation.arguments);
        if !violations.is_empty() {
            invocation.mark_failed(
                FailureReason::Validation,
                format!("{} schema violation(s)", violations.len()),
            );
            return Err(OrchestratorError::SchemaValidation(violations));
        }

        let request = ToolRequest {
            tool_id: descriptor.id.clone(),
            arguments: invocation.arguments.clone(),
            invocation_id: invocation.id,
            deadline_ms: descriptor.timeout_ms,
        };

        invocation.mark_in_flight();
        let start = Instant::now();

        let outcome = tokio::select! {
            _ = cancel.cancelled() => {
                invocation.mark_failed(FailureReason::Cancelled, "session closed");
                self.audit(descriptor, invocation, "cancelled", start);
                return Err(OrchestratorError::Cancelled);
            }
            result = timeout(descriptor.timeout(), self.transport.send(&descriptor.endpoint, &request)) => result,
        };

        let result = match outcome {
            Err(_) => {
                invocation.mark_timed_out();
                self.audit(descriptor, invocation, "timeout", start);
                return Err(OrchestratorError::ToolTimeout(descriptor.id.clone()));
            }
            Ok(Err(transport_err)) => {
                invocation.mark_failed(FailureReason::Transport, transport_err.to_string());
                self.audit(descriptor, invocation, "transport_error", start);
                return Err(OrchestratorError::ToolTransport {
                    tool: descriptor.id.clone(),
                    detail: transport_err.to_string(),
                });
            }
            Ok(Ok(response)) => response,
        };

        // 响应必须回带同一 invocation_id，否则视为协议层失败
        if result.invocation_id != invocation.id {
            let detail = format!(
                "response invocation_id mismatch: expected {}, got {}",
                invocation.id, result.invocation_id
            );
            invocation.mark_failed(FailureReason::Transport, detail.clone());
            self.audit(descriptor, invocation, "transport_error", start);
            return Err(OrchestratorError::ToolTransport {
                tool: descriptor.id.clone(),
                detail,
            });
        }

        match result.status {
            ResponseStatus::Ok => {
                let payload = result.payload.unwrap_or(Value::Null);
                invocation.mark_succeeded(payload.clone());
                self.audit(descriptor, invocation, "ok", start);
                Ok(payload)
            }
            ResponseStatus::Timeout => {
                invocation.mark_timed_out();
                self.audit(descriptor, invocation, "timeout", start);
                Err(OrchestratorError::ToolTimeout(descriptor.id.clone()))
            }
            ResponseStatus::Error => {
                let detail = result
                    .error_detail
                    .unwrap_or_else(|| "unspecified tool error".to_string());
                invocation.mark_failed(FailureReason::Execution, detail.clone());
                self.audit(descriptor, invocation, "error", start);
                Err(OrchestratorError::ToolExecution {
                    tool: descriptor.id.clone(),
                    detail,
                })
            }
        }
    }

    fn audit(&self, descriptor: &ToolDescriptor, invocation: &ToolInvocation, outcome: &str, start: Instant) {
        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": descriptor.id,
            "invocation_id": invocation.id,
            "outcome": outcome,
            "duration_ms": start.elapsed().as_millis() as u64,
            "args_preview": args_preview(&invocation.arguments),
        });
        tracing::info!(audit = %audit.to_string(), "tool");
    }
}

fn args_preview(args: &Value) -> String {
    let s = args.to_string();
    if s.len() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}
