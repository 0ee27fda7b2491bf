//! 工具调用记录与生命周期
//!
//! 调用由编排器创建（Pending），客户端负责状态迁移（InFlight -> 终态），聚合器消费终态。
//! 调用不跨会话存活：会话结束或结果折叠后记录只留在回合审计日志里。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// 调用生命周期状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvocationState {
    /// 已创建，尚未派发
    Pending,
    /// 请求已发出，等待响应
    InFlight,
    /// 成功终态
    Succeeded,
    /// 失败终态（含依赖未满足，见 failure_reason）
    Failed,
    /// 超时终态
    TimedOut,
}

impl InvocationState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            InvocationState::Succeeded | InvocationState::Failed | InvocationState::TimedOut
        )
    }
}

/// 失败原因分类，随 Failed 终态记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// 依赖调用未成功终止，本调用从未派发
    DependencyUnmet,
    /// 派发前的参数校验失败，请求从未发出
    Validation,
    /// 传输层失败（连接拒绝、响应畸形）
    Transport,
    /// 工具自身返回错误
    Execution,
    /// 会话关闭导致取消
    Cancelled,
}

/// 一次工具调用
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub id: Uuid,
    pub tool_id: String,
    pub arguments: Value,
    pub state: InvocationState,
    /// Succeeded 时的输出负载
    pub output: Option<Value>,
    /// Failed / TimedOut 时的错误细节
    pub error_detail: Option<String>,
    pub failure_reason: Option<FailureReason>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl ToolInvocation {
    pub fn new(tool_id: &str, arguments: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            tool_id: tool_id.to_string(),
            arguments,
            state: InvocationState::Pending,
            output: None,
            error_detail: None,
            failure_reason: None,
            created_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn mark_in_flight(&mut self) {
        self.state = InvocationState::InFlight;
    }

    pub fn mark_succeeded(&mut self, output: Value) {
        self.state = InvocationState::Succeeded;
        self.output = Some(output);
        self.finished_at = Some(Utc::now());
    }

    pub fn mark_failed(&mut self, reason: FailureReason, detail: impl Into<String>) {
        self.state = InvocationState::Failed;
        self.failure_reason = Some(reason);
        self.error_detail = Some(detail.into());
        self.finished_at = Some(Utc::now());
    }

    pub fn mark_timed_out(&mut self) {
        self.state = InvocationState::TimedOut;
        self.error_detail = Some(format!("tool '{}' exceeded its deadline", self.tool_id));
        self.finished_at = Some(Utc::now());
    }
}
