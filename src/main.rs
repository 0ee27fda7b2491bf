//! Switchboard - IVR 工具编排核心
//!
//! 入口：初始化日志、加载配置、注册工具描述符，然后从标准输入逐行消费会话层事件：
//! 每行一个 TurnRequest JSON（{"session_id","utterance_text","detected_intent"?}），
//! 或 `close <session_id>` 挂断。应答写到标准输出，挂断时转写落盘。

use std::sync::Arc;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};

use switchboard::config::load_config;
use switchboard::core::{Orchestrator, RulePlanner, TurnRequest};
use switchboard::session::SessionStore;
use switchboard::tools::{HttpTransport, ToolClient, ToolRegistry};
use switchboard::{observability, transcript};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let cfg = load_config(None).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        Default::default()
    });
    if cfg.tools.is_empty() {
        tracing::warn!("No tool descriptors configured; only zero-tool intents will work");
    }

    let registry = Arc::new(ToolRegistry::new(cfg.registry.overwrite.into()));
    registry
        .reload(cfg.tools.clone())
        .context("Tool descriptor registration failed")?;

    let client = Arc::new(ToolClient::new(Arc::new(HttpTransport::new())));
    let store = Arc::new(SessionStore::new(cfg.app.session_timeout_secs));
    let planner = Arc::new(RulePlanner::new(
        cfg.intents.clone(),
        cfg.app.default_reply.clone(),
    ));
    let orchestrator = Orchestrator::new(
        registry,
        client,
        store.clone(),
        planner,
        cfg.app.turn_deadline_ms,
        cfg.app.abort_reply.clone(),
    );

    // 空闲会话回收
    {
        let store = store.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(60));
            loop {
                ticker.tick().await;
                let reclaimed = store.cleanup_expired().await;
                if reclaimed > 0 {
                    tracing::info!(reclaimed, "idle sessions reclaimed");
                }
            }
        });
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim().to_string();
        if line.is_empty() {
            continue;
        }

        // 运行期重载：重读配置，描述符逐个原子替换，在飞调用持旧描述符不受影响
        if line == "reload" {
            match switchboard::config::reload_config() {
                Ok(new_cfg) => match orchestrator.registry().reload(new_cfg.tools) {
                    Ok(()) => tracing::info!("tool descriptors reloaded"),
                    Err(e) => tracing::error!("Descriptor reload failed: {}", e),
                },
                Err(e) => tracing::error!("Config reload failed: {}", e),
            }
            continue;
        }

        if let Some(session_id) = line.strip_prefix("close ") {
            match orchestrator.close_call(session_id.trim()).await {
                Ok(session) => match transcript::write(&session, &cfg.app.logs_dir) {
                    Ok(path) => tracing::info!(path = %path.display(), "transcript written"),
                    Err(e) => tracing::error!("Transcript write failed: {}", e),
                },
                Err(e) => tracing::warn!("Close failed: {}", e),
            }
            continue;
        }

        let request: TurnRequest = match serde_json::from_str(&line) {
            Ok(req) => req,
            Err(e) => {
                tracing::warn!("Bad input line ({}), expected TurnRequest JSON", e);
                continue;
            }
        };

        // 首次出现的会话视为来电接通
        if store.get(&request.session_id).await.is_err() {
            if let Err(e) = orchestrator.begin_call(&request.session_id).await {
                tracing::error!("Session create failed: {}", e);
                continue;
            }
        }

        match orchestrator.run_turn(request).await {
            Ok(response) => {
                println!("[{}] {}", response.session_id, response.agent_utterance);
            }
            Err(e) => {
                // 身份/配置错误只进日志，终端用户永远听不到内部错误码
                tracing::error!("Turn failed: {}", e);
            }
        }
    }

    Ok(())
}
