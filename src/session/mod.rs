//! 会话层：数据模型与状态仓库

pub mod store;
pub mod types;

pub use store::SessionStore;
pub use types::{DialoguePhase, Session, SessionId, SlotSource, SlotValue, Turn};
