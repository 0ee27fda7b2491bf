//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `SWITCHBOARD__*` 覆盖（双下划线表示嵌套，
//! 如 `SWITCHBOARD__APP__TURN_DEADLINE_MS=5000`）。工具描述符与意图规则都是声明式
//! 配置：接入一个新工具只需要新增 [[tools]] 条目，必要时配一条意图规则，不改任何代码。

use std::collections::HashMap;
use std::path::PathBuf;

use serde::Deserialize;
use serde_json::Value;

use crate::tools::{OverwritePolicy, ToolDescriptor};

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    #[serde(default)]
    pub app: AppSection,
    #[serde(default)]
    pub registry: RegistrySection,
    /// 声明式工具描述符清单，启动时整体注册，重载走原子替换
    #[serde(default)]
    pub tools: Vec<ToolDescriptor>,
    /// 每个意图一条规则：调用清单 + 应答模板
    #[serde(default)]
    pub intents: Vec<IntentRule>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            app: AppSection::default(),
            registry: RegistrySection::default(),
            tools: Vec::new(),
            intents: Vec::new(),
        }
    }
}

/// [app] 段：会话与回合的时限、应答兜底文案、转写目录
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub name: Option<String>,
    /// 会话空闲超时（秒）
    pub session_timeout_secs: u64,
    /// 单回合总预算（毫秒），超出后在飞调用判超时、降级应答
    pub turn_deadline_ms: u64,
    /// 通话转写落盘目录
    pub logs_dir: PathBuf,
    /// 无匹配意图规则时的应答
    pub default_reply: String,
    /// AbortTurn 时用户听到的话术（绝不暴露内部错误码）
    pub abort_reply: String,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: None,
            session_timeout_secs: 3600,
            turn_deadline_ms: 8000,
            logs_dir: PathBuf::from("logs"),
            default_reply:
                "I can help with checking benefits, scheduling doctors, or resetting passwords."
                    .to_string(),
            abort_reply: "Sorry, I could not complete this step.".to_string(),
        }
    }
}

/// [registry] 段：重注册策略
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct RegistrySection {
    /// "replace"（默认）或 "deny"
    pub overwrite: Overwrite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Overwrite {
    Replace,
    Deny,
}

impl Default for Overwrite {
    fn default() -> Self {
        Overwrite::Replace
    }
}

impl From<Overwrite> for OverwritePolicy {
    fn from(value: Overwrite) -> Self {
        match value {
            Overwrite::Replace => OverwritePolicy::Replace,
            Overwrite::Deny => OverwritePolicy::Deny,
        }
    }
}

/// [[intents]] 条目
#[derive(Debug, Clone, Deserialize)]
pub struct IntentRule {
    pub intent: String,
    /// 应答模板，"{slot}" 占位符用槽位值替换
    #[serde(default)]
    pub reply: Option<String>,
    #[serde(default)]
    pub calls: Vec<CallRule>,
}

/// 意图规则里的单个调用
#[derive(Debug, Clone, Deserialize)]
pub struct CallRule {
    /// 回合内唯一的调用 ID（依赖引用用它）
    pub id: String,
    /// 工具描述符标识
    pub tool: String,
    /// 实参绑定：值为字符串时支持 "{slot:name}" / "{out:call.field}" 语法
    #[serde(default)]
    pub args: HashMap<String, Value>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// 该槽位已填时跳过本调用（按未填槽位规划）
    #[serde(default)]
    pub unless_slot: Option<String>,
}

/// 从 config 目录加载配置，环境变量 SWITCHBOARD__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 SWITCHBOARD__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{name}.toml");
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("SWITCHBOARD")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

/// 重新从磁盘与环境变量加载配置；调用方把新的 tools 清单交给注册表 reload，
/// 即得到逐描述符的原子替换语义
pub fn reload_config() -> Result<AppConfig, config::ConfigError> {
    load_config(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
[app]
turn_deadline_ms = 5000
session_timeout_secs = 600

[registry]
overwrite = "deny"

[[tools]]
id = "fhir-lookup"
endpoint = "http://localhost:9200/fhir"
timeout_ms = 2000
fallback = "retry_once"
authoritative_slots = ["apptTime"]
inputs = [{ name = "patientId", type = "string" }]
outputs = [{ name = "apptTime", type = "string" }]

[[intents]]
intent = "doctor_schedule"
reply = "Your appointment is at {apptTime}."

[[intents.calls]]
id = "lookup"
tool = "fhir-lookup"
args = { patientId = "{slot:patient_id}" }
"#;

    #[test]
    fn test_load_sample_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("switchboard.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(SAMPLE.as_bytes()).unwrap();

        let cfg = load_config(Some(path)).unwrap();
        assert_eq!(cfg.app.turn_deadline_ms, 5000);
        assert_eq!(cfg.registry.overwrite, Overwrite::Deny);
        assert_eq!(cfg.tools.len(), 1);
        let tool = &cfg.tools[0];
        assert_eq!(tool.id, "fhir-lookup");
        assert_eq!(tool.timeout_ms, 2000);
        assert_eq!(tool.authoritative_slots, vec!["apptTime"]);
        assert_eq!(tool.inputs[0].name, "patientId");
        assert_eq!(cfg.intents.len(), 1);
        assert_eq!(cfg.intents[0].calls[0].tool, "fhir-lookup");
    }

    #[test]
    fn test_reload_config_feeds_registry_atomic_replace() {
        use crate::tools::{FallbackPolicy, ToolRegistry};

        let registry = ToolRegistry::default();
        registry
            .register(ToolDescriptor {
                id: "fhir-lookup".into(),
                inputs: vec![],
                outputs: vec![],
                endpoint: "mock://stale".into(),
                timeout_ms: 1,
                fallback: FallbackPolicy::default(),
                degrade_default: None,
                authoritative_slots: vec![],
            })
            .unwrap();
        let held = registry.resolve("fhir-lookup").unwrap();

        // 重读 config/default.toml，新描述符逐个替换旧条目
        let cfg = reload_config().unwrap();
        registry.reload(cfg.tools).unwrap();

        let fresh = registry.resolve("fhir-lookup").unwrap();
        assert_eq!(fresh.timeout_ms, 3000);
        // 在飞调用持有的旧描述符不受重载影响
        assert_eq!(held.timeout_ms, 1);
    }

    #[test]
    fn test_defaults_without_file() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.app.turn_deadline_ms, 8000);
        assert_eq!(cfg.registry.overwrite, Overwrite::Replace);
        assert!(cfg.tools.is_empty());
        assert!(cfg.app.abort_reply.contains("could not complete"));
    }
}
