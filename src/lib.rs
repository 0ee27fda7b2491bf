//! Switchboard - IVR 工具编排核心
//!
//! MCP 风格的工具调用编排器：会话层（电话/语音）给出意图，编排器决定调用哪些
//! 外部工具服务（FHIR、CRM、邮件、语音等），并发调用后把结果折叠进会话状态。
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量），含声明式工具描述符与意图规则
//! - **core**: 错误税目、回合状态机、依赖图、规划器、结果聚合器
//! - **session**: 会话状态仓库（逐回合审计日志、槽位表、过期管理）
//! - **tools**: 工具描述符、注册表、传输层与调用客户端
//! - **transcript**: 通话转写导出（供外部摘要器消费）
//! - **observability**: tracing 初始化

pub mod config;
pub mod core;
pub mod observability;
pub mod session;
pub mod tools;
pub mod transcript;

pub use crate::core::{Orchestrator, OrchestratorError, TurnRequest, TurnResponse};
pub use crate::session::SessionStore;
pub use crate::tools::{ToolClient, ToolDescriptor, ToolRegistry};
