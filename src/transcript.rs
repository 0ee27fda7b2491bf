//! 通话转写导出
//!
//! 会话关闭后把回合日志落成一份 JSON 转写（logs/<session>_<时间戳>.json），
//! 供外部摘要器/质检消费。转写只读快照，不反写会话。

use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::session::{Session, Turn};

/// 单条转写记录：一回合两条（caller / agent），工具调用计数随 agent 条目
#[derive(Debug, Serialize)]
struct TranscriptEntry<'a> {
    timestamp: String,
    role: &'static str,
    message: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    intent: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    invocations: Option<usize>,
}

fn entries(turns: &[Turn]) -> Vec<TranscriptEntry<'_>> {
    let mut out = Vec::with_capacity(turns.len() * 2);
    for turn in turns {
        let ts = turn.started_at.to_rfc3339();
        out.push(TranscriptEntry {
            timestamp: ts.clone(),
            role: "caller",
            message: &turn.user_utterance,
            intent: Some(&turn.intent),
            invocations: None,
        });
        out.push(TranscriptEntry {
            timestamp: ts,
            role: "agent",
            message: &turn.agent_utterance,
            intent: None,
            invocations: Some(turn.invocations.len()),
        });
    }
    out
}

/// 会话转写的 JSON 文本
pub fn render(session: &Session) -> String {
    serde_json::to_string_pretty(&entries(&session.turns)).unwrap_or_else(|_| "[]".to_string())
}

/// 落盘：返回写入的文件路径
pub fn write(session: &Session, logs_dir: &Path) -> std::io::Result<PathBuf> {
    std::fs::create_dir_all(logs_dir)?;
    let stamp = session.created_at.format("%Y-%m-%d_%H-%M-%S");
    let path = logs_dir.join(format!("{}_{stamp}.json", session.id));
    std::fs::write(&path, render(session))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn session_with_turn() -> Session {
        let mut session = Session::new("call-1");
        session.turns.push(Turn {
            user_utterance: "I need to book a doctor".into(),
            agent_utterance: "Your appointment is at 14:00.".into(),
            intent: "doctor_schedule".into(),
            invocations: vec![],
            started_at: Utc::now(),
        });
        session
    }

    #[test]
    fn test_render_pairs_caller_and_agent() {
        let rendered = render(&session_with_turn());
        let parsed: serde_json::Value = serde_json::from_str(&rendered).unwrap();
        let entries = parsed.as_array().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0]["role"], "caller");
        assert_eq!(entries[1]["role"], "agent");
        assert_eq!(entries[0]["intent"], "doctor_schedule");
    }

    #[test]
    fn test_write_creates_file_under_logs_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&session_with_turn(), dir.path()).unwrap();
        assert!(path.exists());
        let content = std::fs::read_to_string(path).unwrap();
        assert!(content.contains("book a doctor"));
    }
}
