//! 工具服务器传输层
//!
//! 线缆格式（请求/响应各一条，单次调用单次交换，无流式）：
//! 请求 {tool_id, arguments, invocation_id, deadline_ms}；
//! 响应 {invocation_id, status: ok|error|timeout, payload | error_detail}。
//! ToolTransport 是唯一接缝：HTTP 实现走 reqwest，测试与演示用 MockTransport。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use schemars::{schema_for, JsonSchema};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// 发往工具服务器的请求帧
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ToolRequest {
    /// 工具标识，如 fhir-lookup
    pub tool_id: String,
    /// 已按输入模式校验过的实参对象
    pub arguments: Value,
    /// 本次调用的唯一 ID，响应必须回带
    pub invocation_id: Uuid,
    /// 服务器侧应在此期限内完成（毫秒）
    pub deadline_ms: u64,
}

/// 响应状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Ok,
    Error,
    Timeout,
}

/// 工具服务器的响应帧
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ToolResponse {
    pub invocation_id: Uuid,
    pub status: ResponseStatus,
    /// status == ok 时的结果负载
    #[serde(default)]
    pub payload: Option<Value>,
    /// status == error / timeout 时的错误细节
    #[serde(default)]
    pub error_detail: Option<String>,
}

/// 线缆格式的 JSON Schema（请求 + 响应），供工具服务器实现方比对
pub fn wire_schema_json() -> String {
    let request = schema_for!(ToolRequest);
    let response = schema_for!(ToolResponse);
    serde_json::to_string_pretty(&serde_json::json!({
        "request": request,
        "response": response,
    }))
    .unwrap_or_else(|_| String::new())
}

/// 传输层错误：连接/协议层面，与工具应用级错误严格区分
#[derive(Debug, Clone)]
pub struct TransportError(pub String);

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for TransportError {}

/// 工具传输接缝：一次请求换一次响应；取消由调用方（客户端 select）处理
#[async_trait]
pub trait ToolTransport: Send + Sync {
    async fn send(&self, endpoint: &str, request: &ToolRequest) -> Result<ToolResponse, TransportError>;
}

/// HTTP 传输：POST JSON 到描述符端点
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ToolTransport for HttpTransport {
    async fn send(&self, endpoint: &str, request: &ToolRequest) -> Result<ToolResponse, TransportError> {
        let response = self
            .client
            .post(endpoint)
            .json(request)
            .send()
            .await
            .map_err(|e| TransportError(format!("request to {endpoint} failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError(format!("{endpoint} returned HTTP {status}")));
        }

        response
            .json::<ToolResponse>()
            .await
            .map_err(|e| TransportError(format!("malformed response from {endpoint}: {e}")))
    }
}

/// 按工具脚本化的响应行为，测试与演示共用
#[derive(Clone)]
pub enum MockBehavior {
    /// 固定负载成功
    Succeed(Value),
    /// 工具侧应用级错误
    Fail(String),
    /// 延迟指定时长后成功（配合短超时模拟 TimedOut）
    Delay(Duration, Value),
    /// 连接层失败
    Refuse,
    /// 回显收到的实参作为负载
    Echo,
}

/// 内存传输：endpoint 形如 mock://<tool_id>，行为按工具 ID 脚本化
#[derive(Default)]
pub struct MockTransport {
    behaviors: HashMap<String, MockBehavior>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, tool_id: &str, behavior: MockBehavior) -> Self {
        self.behaviors.insert(tool_id.to_string(), behavior);
        self
    }

    pub fn into_arc(self) -> Arc<dyn ToolTransport> {
        Arc::new(self)
    }
}

#[async_trait]
impl ToolTransport for MockTransport {
    async fn send(&self, endpoint: &str, request: &ToolRequest) -> Result<ToolResponse, TransportError> {
        let behavior = self
            .behaviors
            .get(&request.tool_id)
            .ok_or_else(|| TransportError(format!("no mock behavior for {endpoint}")))?;

        let ok = |payload: Value| ToolResponse {
            invocation_id: request.invocation_id,
            status: ResponseStatus::Ok,
            payload: Some(payload),
            error_detail: None,
        };

        match behavior {
            MockBehavior::Succeed(payload) => Ok(ok(payload.clone())),
            MockBehavior::Echo => Ok(ok(request.arguments.clone())),
            MockBehavior::Fail(detail) => Ok(ToolResponse {
                invocation_id: request.invocation_id,
                status: ResponseStatus::Error,
                payload: None,
                error_detail: Some(detail.clone()),
            }),
            MockBehavior::Delay(delay, payload) => {
                tokio::time::sleep(*delay).await;
                Ok(ok(payload.clone()))
            }
            MockBehavior::Refuse => Err(TransportError(format!("connection refused: {endpoint}"))),
        }
    }
}
