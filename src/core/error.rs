//! 编排核心错误税目
//!
//! 身份/模式类错误（Duplicate* / Unknown* / SchemaValidation）同步抛给调用方，属配置或
//! 编程错误；工具类错误（Timeout / Transport / Execution）由编排器按描述符的回退策略
//! 就地恢复，仅 AbortTurn 时对终端用户可见。

use thiserror::Error;

/// 参数校验违规：一个字段一条记录，SchemaValidation 携带全部违规而非首个
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldViolation {
    pub field: String,
    pub reason: String,
}

impl std::fmt::Display for FieldViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.reason)
    }
}

/// 编排器运行过程中可能出现的错误
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Duplicate tool: {0}")]
    DuplicateTool(String),

    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    /// 携带全部违规字段；display 逐条列出
    #[error("Schema validation failed: [{}]", format_violations(.0))]
    SchemaValidation(Vec<FieldViolation>),

    #[error("Tool timeout: {0}")]
    ToolTimeout(String),

    #[error("Tool transport error: {tool}: {detail}")]
    ToolTransport { tool: String, detail: String },

    /// 工具侧应用级错误，携带工具自身的错误负载
    #[error("Tool execution failed: {tool}: {detail}")]
    ToolExecution { tool: String, detail: String },

    #[error("Duplicate session: {0}")]
    DuplicateSession(String),

    #[error("Unknown session: {0}")]
    UnknownSession(String),

    #[error("Slot type conflict on '{key}': expected {expected}, got {got}")]
    SlotTypeConflict {
        key: String,
        expected: String,
        got: String,
    },

    /// 会话在回合进行中被关闭
    #[error("Cancelled")]
    Cancelled,

    /// 同一会话同时只允许一个活动回合
    #[error("Turn already in progress for session: {0}")]
    TurnInProgress(String),

    #[error("Config error: {0}")]
    Config(String),
}

fn format_violations(violations: &[FieldViolation]) -> String {
    violations
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_validation_lists_every_field() {
        let err = OrchestratorError::SchemaValidation(vec![
            FieldViolation {
                field: "patientId".into(),
                reason: "missing required parameter".into(),
            },
            FieldViolation {
                field: "phone".into(),
                reason: "expected string, got number".into(),
            },
        ]);
        let msg = err.to_string();
        assert!(msg.contains("patientId"));
        assert!(msg.contains("phone"));
    }
}
