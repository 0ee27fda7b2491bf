//! 回合规划器
//!
//! 规划器决定一个回合调用哪些工具——编排器本身不含任何工具分支逻辑，新工具只需新增
//! 描述符与意图规则。默认实现 RulePlanner 完全由配置驱动：每个意图一张调用清单，
//! 实参用绑定语法从槽位 / 前序调用输出 / 字面量取值。会话层没给意图时退回关键词识别。

use std::collections::HashMap;

use serde_json::Value;

use crate::config::{CallRule, IntentRule};
use crate::core::OrchestratorError;
use crate::session::Session;

pub type CallId = String;

/// 实参绑定：字面量、槽位引用或前序调用输出引用
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArgBinding {
    Literal(Value),
    /// "{slot:phone}" —— 从会话槽位取值
    Slot(String),
    /// "{out:lookup.apptTime}" —— 从本回合某调用的输出字段取值
    Output { call: CallId, field: String },
}

impl ArgBinding {
    /// 解析配置里的绑定语法；非字符串与普通字符串都按字面量处理
    pub fn parse(raw: &Value) -> ArgBinding {
        let s = match raw {
            Value::String(s) => s,
            other => return ArgBinding::Literal(other.clone()),
        };
        if let Some(inner) = s.strip_prefix("{slot:").and_then(|r| r.strip_suffix('}')) {
            return ArgBinding::Slot(inner.to_string());
        }
        if let Some(inner) = s.strip_prefix("{out:").and_then(|r| r.strip_suffix('}')) {
            if let Some((call, field)) = inner.split_once('.') {
                return ArgBinding::Output {
                    call: call.to_string(),
                    field: field.to_string(),
                };
            }
        }
        ArgBinding::Literal(raw.clone())
    }
}

/// 规划出的单个调用
#[derive(Debug, Clone, Default)]
pub struct PlannedCall {
    /// 回合内唯一（同一工具可被计划多次）
    pub call_id: CallId,
    pub tool_id: String,
    pub args: HashMap<String, ArgBinding>,
    pub depends_on: Vec<CallId>,
}

/// 一个回合的完整计划；空计划表示直接进入应答
#[derive(Debug, Clone, Default)]
pub struct TurnPlan {
    pub calls: Vec<PlannedCall>,
}

/// 规划器接缝：意图 + 当前会话状态 -> 调用计划与应答文案
pub trait TurnPlanner: Send + Sync {
    fn plan(&self, intent: &str, session: &Session) -> Result<TurnPlan, OrchestratorError>;

    /// 回合正常完成时的应答话术
    fn respond(&self, intent: &str, session: &Session) -> String;
}

/// 配置驱动的规则规划器
pub struct RulePlanner {
    rules: HashMap<String, IntentRule>,
    /// 没有匹配规则时的应答
    default_reply: String,
}

impl RulePlanner {
    pub fn new(rules: Vec<IntentRule>, default_reply: impl Into<String>) -> Self {
        Self {
            rules: rules.into_iter().map(|r| (r.intent.clone(), r)).collect(),
            default_reply: default_reply.into(),
        }
    }

    fn build_call(rule: &CallRule) -> PlannedCall {
        PlannedCall {
            call_id: rule.id.clone(),
            tool_id: rule.tool.clone(),
            args: rule
                .args
                .iter()
                .map(|(name, raw)| (name.clone(), ArgBinding::parse(raw)))
                .collect(),
            depends_on: rule.depends_on.clone(),
        }
    }
}

impl TurnPlanner for RulePlanner {
    fn plan(&self, intent: &str, session: &Session) -> Result<TurnPlan, OrchestratorError> {
        let rule = match self.rules.get(intent) {
            Some(rule) => rule,
            None => return Ok(TurnPlan::default()),
        };

        // 按未填槽位筛选：目标槽位已有值的调用不再计划
        let included: Vec<&CallRule> = rule
            .calls
            .iter()
            .filter(|call| match &call.unless_slot {
                Some(slot) => session.slot_value(slot).is_none(),
                None => true,
            })
            .collect();
        let included_ids: Vec<&str> = included.iter().map(|c| c.id.as_str()).collect();

        let calls = included
            .iter()
            .map(|rule| {
                let mut call = Self::build_call(rule);
                // 被筛掉的依赖不再约束顺序；其输出改由槽位兜底（聚合器已折叠过）
                call.depends_on.retain(|dep| included_ids.contains(&dep.as_str()));
                call
            })
            .collect();

        Ok(TurnPlan { calls })
    }

    fn respond(&self, intent: &str, session: &Session) -> String {
        let template = self
            .rules
            .get(intent)
            .and_then(|r| r.reply.as_deref())
            .unwrap_or(&self.default_reply);
        let rendered = render_template(template, session);
        // 槽位缺失导致占位符没被替换：模板语法绝不能念给用户
        if has_unresolved_placeholder(&rendered) {
            return self.default_reply.clone();
        }
        rendered
    }
}

/// 模板渲染："{slot_name}" 用槽位值替换，缺失的占位符保留（由 respond 兜底）
fn render_template(template: &str, session: &Session) -> String {
    let mut out = template.to_string();
    for (key, slot) in &session.slots {
        let needle = format!("{{{key}}}");
        if out.contains(&needle) {
            let rendered = match &slot.value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            out = out.replace(&needle, &rendered);
        }
    }
    out
}

/// 文本里是否残留 "{slot_name}" 形式的占位符
fn has_unresolved_placeholder(text: &str) -> bool {
    let mut rest = text;
    while let Some(start) = rest.find('{') {
        rest = &rest[start + 1..];
        if let Some(end) = rest.find('}') {
            let inner = &rest[..end];
            if !inner.is_empty() && inner.chars().all(|c| c.is_alphanumeric() || c == '_') {
                return true;
            }
        } else {
            return false;
        }
    }
    false
}

/// 关键词意图识别：会话层未给出意图时的兜底
pub fn detect_intent(utterance: &str) -> &'static str {
    let text = utterance.to_lowercase();
    let hit = |keys: &[&str]| keys.iter().any(|k| text.contains(k));
    if hit(&["benefit", "eligible", "eligibility", "coverage"]) {
        "benefit_eligibility"
    } else if hit(&["doctor", "appointment", "schedule", "book"]) {
        "doctor_schedule"
    } else if hit(&["password", "reset", "sign in", "login"]) {
        "password_reset"
    } else {
        "general"
    }
}
