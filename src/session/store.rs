//! 会话状态仓库
//!
//! 唯一的共享可变状态：session_id -> Session 的 arena。所有变更都限定在单个会话键下，
//! 不同会话互不竞争；同一会话只有该会话的编排任务写入（with_session 闭包即单写者），
//! 观察者拿 get 返回的快照，不阻塞写者。

use std::collections::HashMap;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::core::OrchestratorError;
use crate::session::types::{Session, SessionId, SlotSource, Turn};

/// 会话仓库
pub struct SessionStore {
    sessions: RwLock<HashMap<SessionId, Session>>,
    /// 空闲超时（秒），cleanup_expired 据此回收
    session_timeout_secs: u64,
}

impl SessionStore {
    pub fn new(session_timeout_secs: u64) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            session_timeout_secs,
        }
    }

    /// 新建会话；已存在报 DuplicateSession
    pub async fn create(&self, id: &str) -> Result<(), OrchestratorError> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(id) {
            return Err(OrchestratorError::DuplicateSession(id.to_string()));
        }
        sessions.insert(id.to_string(), Session::new(id));
        tracing::info!(session = %id, "session created");
        Ok(())
    }

    /// 快照读：克隆整个会话，不阻塞写者；不存在或已过期报 UnknownSession
    pub async fn get(&self, id: &str) -> Result<Session, OrchestratorError> {
        let sessions = self.sessions.read().await;
        match sessions.get(id) {
            Some(session) if !session.is_expired(self.session_timeout_secs) => {
                Ok(session.clone())
            }
            _ => Err(OrchestratorError::UnknownSession(id.to_string())),
        }
    }

    /// 单写者入口：写锁内对会话执行闭包
    pub async fn with_session<F, R>(&self, id: &str, f: F) -> Result<R, OrchestratorError>
    where
        F: FnOnce(&mut Session) -> R,
    {
        let mut sessions = self.sessions.write().await;
        sessions
            .get_mut(id)
            .map(f)
            .ok_or_else(|| OrchestratorError::UnknownSession(id.to_string()))
    }

    /// 追加回合：只追加，永不编辑或删除（完整审计轨迹）
    pub async fn append_turn(&self, id: &str, turn: Turn) -> Result<(), OrchestratorError> {
        self.with_session(id, |session| {
            session.turns.push(turn);
            session.touch();
        })
        .await
    }

    /// 用户来源的槽位写入；类型冲突只废弃该次写入
    pub async fn set_slot(
        &self,
        id: &str,
        key: &str,
        value: serde_json::Value,
    ) -> Result<(), OrchestratorError> {
        self.with_session(id, |session| session.write_slot(key, value, SlotSource::User))
            .await?
    }

    /// 会话的取消令牌（关闭时触发）
    pub async fn cancel_token(&self, id: &str) -> Result<CancellationToken, OrchestratorError> {
        self.with_session(id, |session| session.cancel_token.clone())
            .await
    }

    /// 过期/挂断回收：关闭并移除。幂等，总是成功（不存在即已过期）。
    pub async fn expire(&self, id: &str) {
        let mut sessions = self.sessions.write().await;
        if let Some(mut session) = sessions.remove(id) {
            session.close();
            tracing::info!(session = %id, turns = session.turns.len(), "session expired");
        }
    }

    /// 清理全部空闲超时的会话，返回回收数量
    pub async fn cleanup_expired(&self) -> usize {
        let mut sessions = self.sessions.write().await;
        let expired: Vec<SessionId> = sessions
            .iter()
            .filter(|(_, s)| s.is_expired(self.session_timeout_secs))
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            if let Some(mut session) = sessions.remove(id) {
                session.close();
                tracing::info!(session = %id, "idle session reclaimed");
            }
        }
        expired.len()
    }

    pub async fn active_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new(3600)
    }
}
