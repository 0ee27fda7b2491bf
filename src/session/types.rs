//! 会话数据模型
//!
//! 一次通话对应一个 Session：有序回合日志（只追加）、槽位表（类型单调）、对话阶段标签、
//! 已折叠调用集合与取消令牌。槽位写入带来源与序号，聚合器据此实现优先级裁决。

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::core::OrchestratorError;
use crate::tools::{ParamKind, ToolInvocation};

pub type SessionId = String;

/// 对话阶段标签（编排器状态机的投影，Closed 为终态）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DialoguePhase {
    Listening,
    Planning,
    Dispatching,
    Aggregating,
    Responding,
    Closed,
}

/// 槽位值来源：用户口述优先于一切工具写入
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotSource {
    User,
    Tool {
        tool_id: String,
        /// 该工具是否被配置为此槽位的权威来源
        authoritative: bool,
    },
}

/// 槽位值：负载、类型标签（会话内不可变）、来源与写入序号
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotValue {
    pub value: Value,
    pub kind: ParamKind,
    pub source: SlotSource,
    /// 会话内单调递增的写入序号，聚合器用它判定先后
    pub seq: u64,
}

/// 一个回合：双方话语、意图与触发的全部工具调用（审计日志，只追加）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub user_utterance: String,
    pub agent_utterance: String,
    pub intent: String,
    pub invocations: Vec<ToolInvocation>,
    pub started_at: DateTime<Utc>,
}

/// 单个会话（每通电话一个），由 SessionStore 独占持有；Clone 仅用于快照读
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub turns: Vec<Turn>,
    pub slots: HashMap<String, SlotValue>,
    pub phase: DialoguePhase,
    /// 已折叠的调用 ID：同一终态结果重复折叠是 no-op
    pub folded: HashSet<Uuid>,
    /// 槽位写入序号计数
    slot_seq: u64,
    /// 单活动回合守卫
    pub turn_active: bool,
    /// 会话关闭时取消全部在飞调用
    #[serde(skip)]
    pub cancel_token: CancellationToken,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
}

impl Session {
    pub fn new(id: impl Into<SessionId>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            turns: Vec::new(),
            slots: HashMap::new(),
            phase: DialoguePhase::Listening,
            folded: HashSet::new(),
            slot_seq: 0,
            turn_active: false,
            cancel_token: CancellationToken::new(),
            created_at: now,
            last_active: now,
        }
    }

    pub fn touch(&mut self) {
        self.last_active = Utc::now();
    }

    pub fn is_expired(&self, timeout_secs: u64) -> bool {
        let idle = Utc::now().signed_duration_since(self.last_active);
        idle.num_seconds() >= timeout_secs as i64 && !self.turn_active
    }

    pub fn is_closed(&self) -> bool {
        self.phase == DialoguePhase::Closed
    }

    /// 关闭会话：终态 Closed，取消在飞调用。幂等。
    pub fn close(&mut self) {
        self.phase = DialoguePhase::Closed;
        self.cancel_token.cancel();
    }

    /// 写槽位：对既有槽位强制类型一致（会话内类型永不变化），值可被覆盖。
    /// 冲突只废弃本次写入，由调用方记日志。
    pub fn write_slot(
        &mut self,
        key: &str,
        value: Value,
        source: SlotSource,
    ) -> Result<(), OrchestratorError> {
        let kind = ParamKind::of(&value).ok_or_else(|| OrchestratorError::SlotTypeConflict {
            key: key.to_string(),
            expected: self
                .slots
                .get(key)
                .map(|s| s.kind.name().to_string())
                .unwrap_or_else(|| "non-null".to_string()),
            got: "null".to_string(),
        })?;

        if let Some(existing) = self.slots.get(key) {
            if existing.kind != kind {
                return Err(OrchestratorError::SlotTypeConflict {
                    key: key.to_string(),
                    expected: existing.kind.name().to_string(),
                    got: kind.name().to_string(),
                });
            }
        }

        self.slot_seq += 1;
        self.slots.insert(
            key.to_string(),
            SlotValue {
                value,
                kind,
                source,
                seq: self.slot_seq,
            },
        );
        self.touch();
        Ok(())
    }

    /// 槽位当前值（裸 JSON），供规划器绑定实参
    pub fn slot_value(&self, key: &str) -> Option<&Value> {
        self.slots.get(key).map(|s| &s.value)
    }
}
