//! 工具描述符
//!
//! 描述符是注册表中的不可变条目（Arc 持有）：标识符、输入/输出参数模式、传输端点、
//! 声明超时、失败回退策略与权威槽位列表。注册后不再修改，重注册即整体替换。

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::error::FieldViolation;

/// 参数类型标签：槽位类型一致性与参数校验共用
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamKind {
    String,
    Number,
    Boolean,
    Object,
    Array,
}

impl ParamKind {
    /// JSON 值对应的类型标签；null 不属于任何类型
    pub fn of(value: &Value) -> Option<ParamKind> {
        match value {
            Value::String(_) => Some(ParamKind::String),
            Value::Number(_) => Some(ParamKind::Number),
            Value::Bool(_) => Some(ParamKind::Boolean),
            Value::Object(_) => Some(ParamKind::Object),
            Value::Array(_) => Some(ParamKind::Array),
            Value::Null => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ParamKind::String => "string",
            ParamKind::Number => "number",
            ParamKind::Boolean => "boolean",
            ParamKind::Object => "object",
            ParamKind::Array => "array",
        }
    }
}

impl std::fmt::Display for ParamKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// 单个命名参数：输入/输出模式均为有序参数列表
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ParamKind,
    #[serde(default = "default_required")]
    pub required: bool,
}

fn default_required() -> bool {
    true
}

/// 工具失败时编排器采用的回退策略（按描述符配置，不是客户端的职责）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackPolicy {
    /// 回合对用户可见地失败
    AbortTurn,
    /// 重新派发一次新调用，仍失败再按 AbortTurn 处理
    RetryOnce,
    /// 用配置的默认负载代替结果，用户只感知到延迟
    Degrade,
}

impl Default for FallbackPolicy {
    fn default() -> Self {
        FallbackPolicy::AbortTurn
    }
}

/// 工具描述符：注册表条目
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    /// 全局唯一标识，如 "fhir-lookup"
    pub id: String,
    /// 输入参数模式（有序）
    #[serde(default)]
    pub inputs: Vec<ParamSpec>,
    /// 输出参数模式（有序）；聚合器按输出名折叠进槽位
    #[serde(default)]
    pub outputs: Vec<ParamSpec>,
    /// 传输端点（HTTP URL 或测试用的内存地址）
    pub endpoint: String,
    /// 声明超时（毫秒）
    pub timeout_ms: u64,
    #[serde(default)]
    pub fallback: FallbackPolicy,
    /// Degrade 策略使用的默认负载
    #[serde(default)]
    pub degrade_default: Option<Value>,
    /// 对这些槽位，本工具的写入优先于更晚成功的非权威工具
    #[serde(default)]
    pub authoritative_slots: Vec<String>,
}

impl ToolDescriptor {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn is_authoritative_for(&self, slot: &str) -> bool {
        self.authoritative_slots.iter().any(|s| s == slot)
    }

    /// 校验实参：收集全部违规（缺失必填、类型不符、未声明字段），不在首个错误处停下
    pub fn validate_args(&self, args: &Value) -> Vec<FieldViolation> {
        let mut violations = Vec::new();

        let map = match args {
            Value::Object(map) => map,
            other => {
                violations.push(FieldViolation {
                    field: "<arguments>".into(),
                    reason: format!(
                        "expected object, got {}",
                        ParamKind::of(other).map(|k| k.name()).unwrap_or("null")
                    ),
                });
                return violations;
            }
        };

        for spec in &self.inputs {
            match map.get(&spec.name) {
                None | Some(Value::Null) if spec.required => violations.push(FieldViolation {
                    field: spec.name.clone(),
                    reason: "missing required parameter".into(),
                }),
                Some(value) if !value.is_null() => {
                    if ParamKind::of(value) != Some(spec.kind) {
                        violations.push(FieldViolation {
                            field: spec.name.clone(),
                            reason: format!(
                                "expected {}, got {}",
                                spec.kind,
                                ParamKind::of(value).map(|k| k.name()).unwrap_or("null")
                            ),
                        });
                    }
                }
                _ => {}
            }
        }

        for key in map.keys() {
            if !self.inputs.iter().any(|spec| &spec.name == key) {
                violations.push(FieldViolation {
                    field: key.clone(),
                    reason: "not declared in input schema".into(),
                });
            }
        }

        violations
    }
}
