//! 回合编排器：主控状态机
//!
//! LISTENING -> PLANNING -> DISPATCHING -> AGGREGATING -> RESPONDING -> LISTENING，
//! 终态 CLOSED（挂断或空闲超时，任何状态可达）。计划内的调用并发派发，结果到达即折叠
//! （部分折叠不等慢工具）；只有向 RESPONDING 的转移等待全部调用终止或回合预算耗尽。
//! 失败按描述符的回退策略处理：AbortTurn / RetryOnce / Degrade，仅 AbortTurn 对用户可见。

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::core::aggregator::ResultAggregator;
use crate::core::graph::InvocationGraph;
use crate::core::planner::{ArgBinding, CallId, PlannedCall, TurnPlan, TurnPlanner};
use crate::core::OrchestratorError;
use crate::session::{DialoguePhase, Session, SessionStore, Turn};
use crate::tools::{
    FailureReason, FallbackPolicy, ToolClient, ToolDescriptor, ToolInvocation, ToolRegistry,
};

/// 会话层输入：一次用户话语
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnRequest {
    pub session_id: String,
    pub utterance_text: String,
    /// 会话层已识别的意图；缺省时编排器做关键词兜底识别
    #[serde(default)]
    pub detected_intent: Option<String>,
}

/// 会话层输出：应答话语与会话状态快照
#[derive(Debug, Clone, Serialize)]
pub struct TurnResponse {
    pub session_id: String,
    pub agent_utterance: String,
    pub session: Session,
}

/// 编排器：持有注册表、客户端、会话仓库、规划器与聚合器
pub struct Orchestrator {
    registry: Arc<ToolRegistry>,
    client: Arc<ToolClient>,
    store: Arc<SessionStore>,
    planner: Arc<dyn TurnPlanner>,
    aggregator: ResultAggregator,
    /// 单回合总预算
    turn_deadline: Duration,
    /// AbortTurn 时的用户话术
    abort_reply: String,
}

/// 一次派发任务的返回
type DispatchOutcome = (CallId, ToolInvocation, Result<Value, OrchestratorError>);

impl Orchestrator {
    pub fn new(
        registry: Arc<ToolRegistry>,
        client: Arc<ToolClient>,
        store: Arc<SessionStore>,
        planner: Arc<dyn TurnPlanner>,
        turn_deadline_ms: u64,
        abort_reply: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            client,
            store,
            planner,
            aggregator: ResultAggregator::new(),
            turn_deadline: Duration::from_millis(turn_deadline_ms),
            abort_reply: abort_reply.into(),
        }
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// 接通来电：建立会话
    pub async fn begin_call(&self, session_id: &str) -> Result<(), OrchestratorError> {
        self.store.create(session_id).await
    }

    /// 挂断：终态 CLOSED，取消在飞调用，移出仓库并返回末态快照（转写用）。
    /// 服务器侧迟到的结果因会话不在而被丢弃。
    pub async fn close_call(&self, session_id: &str) -> Result<Session, OrchestratorError> {
        let snapshot = self
            .store
            .with_session(session_id, |session| {
                session.close();
                session.clone()
            })
            .await?;
        self.store.expire(session_id).await;
        Ok(snapshot)
    }

    /// 执行一个回合。身份/模式错误同步返回；工具失败按策略就地恢复，用户只会
    /// 得到降级完成的应答或明确的失败话术，绝不挂起。
    pub async fn run_turn(&self, request: TurnRequest) -> Result<TurnResponse, OrchestratorError> {
        let session_id = request.session_id.clone();
        let (snapshot, cancel) = self.enter_turn(&session_id).await?;

        let result = self.drive_turn(&request, snapshot, cancel).await;

        // 无论回合成败都放开单回合守卫；会话可能已被关闭/移除，忽略 Unknown
        let _ = self
            .store
            .with_session(&session_id, |session| {
                session.turn_active = false;
                if !session.is_closed() {
                    session.phase = DialoguePhase::Listening;
                }
            })
            .await;

        result
    }

    /// 单活动回合守卫：占位并拿取消令牌与规划快照
    async fn enter_turn(
        &self,
        session_id: &str,
    ) -> Result<(Session, CancellationToken), OrchestratorError> {
        self.store
            .with_session(session_id, |session| {
                if session.is_closed() {
                    return Err(OrchestratorError::UnknownSession(session.id.clone()));
                }
                if session.turn_active {
                    return Err(OrchestratorError::TurnInProgress(session.id.clone()));
                }
                session.turn_active = true;
                session.phase = DialoguePhase::Planning;
                session.touch();
                Ok((session.clone(), session.cancel_token.clone()))
            })
            .await?
    }

    async fn drive_turn(
        &self,
        request: &TurnRequest,
        planning_snapshot: Session,
        cancel: CancellationToken,
    ) -> Result<TurnResponse, OrchestratorError> {
        let session_id = &request.session_id;
        let started_at = Utc::now();

        let intent = request
            .detected_intent
            .clone()
            .unwrap_or_else(|| crate::core::planner::detect_intent(&request.utterance_text).to_string());
        tracing::info!(session = %session_id, intent = %intent, "turn planning");

        let plan = self.planner.plan(&intent, &planning_snapshot)?;

        // 零工具快路径：直接应答
        if plan.calls.is_empty() {
            return self
                .finish_turn(session_id, request, &intent, started_at, vec![], false)
                .await;
        }

        // 描述符统一在派发前解析：UnknownTool 属配置错误，同步抛出
        let mut descriptors: HashMap<CallId, Arc<ToolDescriptor>> = HashMap::new();
        for call in &plan.calls {
            descriptors.insert(call.call_id.clone(), self.registry.resolve(&call.tool_id)?);
        }
        let calls: HashMap<CallId, PlannedCall> = plan
            .calls
            .iter()
            .map(|c| (c.call_id.clone(), c.clone()))
            .collect();

        let mut graph = InvocationGraph::new(&plan)?;
        self.set_phase(session_id, DialoguePhase::Dispatching).await;

        let mut join_set: JoinSet<DispatchOutcome> = JoinSet::new();
        // 已派发、未归来的调用记录副本（回合预算耗尽时据此补 TimedOut 终态）
        let mut pending: HashMap<CallId, ToolInvocation> = HashMap::new();
        // 本回合各调用的输出，供 {out:call.field} 绑定
        let mut outputs: HashMap<CallId, Value> = HashMap::new();
        // 终态调用记录，按计划顺序写进回合审计日志
        let mut records: HashMap<CallId, ToolInvocation> = HashMap::new();
        let mut retried: HashSet<CallId> = HashSet::new();
        let mut turn_aborted = false;
        let mut schema_error: Option<OrchestratorError> = None;

        for call_id in graph.take_ready() {
            self.dispatch(
                &calls[&call_id],
                descriptors[&call_id].clone(),
                session_id,
                &outputs,
                &cancel,
                &mut join_set,
                &mut pending,
            )
            .await;
        }

        self.set_phase(session_id, DialoguePhase::Aggregating).await;
        let deadline = tokio::time::Instant::now() + self.turn_deadline;

        'aggregate: while !join_set.is_empty() {
            let joined = tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    // 回合预算耗尽：在飞调用判超时，带着已折叠的部分结果去应答
                    join_set.abort_all();
                    while join_set.join_next().await.is_some() {}
                    for call_id in graph.in_flight() {
                        if let Some(mut invocation) = pending.remove(&call_id) {
                            invocation.mark_timed_out();
                            tracing::warn!(session = %session_id, call = %call_id, "turn deadline exceeded");
                            for unmet in graph.mark_terminal(&call_id, false).unmet {
                                records.insert(unmet.clone(), unmet_record(&calls[&unmet], &call_id));
                            }
                            records.insert(call_id, invocation);
                        }
                    }
                    break 'aggregate;
                }
                joined = join_set.join_next() => joined,
            };

            let (call_id, invocation, result) = match joined {
                Some(Ok(outcome)) => outcome,
                Some(Err(join_err)) => {
                    // 任务 panic 不拖垮会话；按传输层失败对待
                    tracing::error!(session = %session_id, error = %join_err, "dispatch task failed");
                    continue;
                }
                None => break,
            };
            pending.remove(&call_id);

            match result {
                Ok(payload) => {
                    self.fold(session_id, &descriptors[&call_id], &invocation).await;
                    outputs.insert(call_id.clone(), payload);
                    records.insert(call_id.clone(), invocation);
                    let progress = graph.mark_terminal(&call_id, true);
                    for ready in progress.newly_ready {
                        self.dispatch(
                            &calls[&ready],
                            descriptors[&ready].clone(),
                            session_id,
                            &outputs,
                            &cancel,
                            &mut join_set,
                            &mut pending,
                        )
                        .await;
                    }
                }
                Err(OrchestratorError::Cancelled) => {
                    // 会话已关闭：丢弃其余结果，同步上抛
                    join_set.abort_all();
                    return Err(OrchestratorError::Cancelled);
                }
                Err(err @ OrchestratorError::SchemaValidation(_)) => {
                    // 配置/编程错误：回合失败并同步上抛，不走回退策略
                    schema_error = Some(err);
                    turn_aborted = true;
                    for unmet in graph.mark_terminal(&call_id, false).unmet {
                        records.insert(unmet.clone(), unmet_record(&calls[&unmet], &call_id));
                    }
                    records.insert(call_id, invocation);
                }
                Err(tool_err) => {
                    let policy = descriptors[&call_id].fallback.clone();
                    tracing::warn!(
                        session = %session_id,
                        call = %call_id,
                        error = %tool_err,
                        policy = ?policy,
                        "invocation failed"
                    );
                    match policy {
                        FallbackPolicy::RetryOnce if !retried.contains(&call_id) => {
                            retried.insert(call_id.clone());
                            // 图节点保持已派发状态，重发一次新调用
                            self.dispatch(
                                &calls[&call_id],
                                descriptors[&call_id].clone(),
                                session_id,
                                &outputs,
                                &cancel,
                                &mut join_set,
                                &mut pending,
                            )
                            .await;
                        }
                        FallbackPolicy::Degrade => {
                            // 默认负载顶替结果：对用户只表现为延迟
                            let default = descriptors[&call_id]
                                .degrade_default
                                .clone()
                                .unwrap_or(Value::Object(Map::new()));
                            let mut degraded =
                                ToolInvocation::new(&invocation.tool_id, invocation.arguments.clone());
                            degraded.mark_in_flight();
                            degraded.mark_succeeded(default.clone());
                            self.fold(session_id, &descriptors[&call_id], &degraded).await;
                            outputs.insert(call_id.clone(), default);
                            records.insert(call_id.clone(), invocation);
                            let progress = graph.mark_terminal(&call_id, true);
                            for ready in progress.newly_ready {
                                self.dispatch(
                                    &calls[&ready],
                                    descriptors[&ready].clone(),
                                    session_id,
                                    &outputs,
                                    &cancel,
                                    &mut join_set,
                                    &mut pending,
                                )
                                .await;
                            }
                        }
                        _ => {
                            // AbortTurn，或 RetryOnce 的第二次失败
                            turn_aborted = true;
                            for unmet in graph.mark_terminal(&call_id, false).unmet {
                                records.insert(unmet.clone(), unmet_record(&calls[&unmet], &call_id));
                            }
                            records.insert(call_id, invocation);
                        }
                    }
                }
            }
        }

        if let Some(err) = schema_error {
            let ordered = order_records(&plan, records);
            let _ = self
                .finish_turn(session_id, request, &intent, started_at, ordered, true)
                .await;
            return Err(err);
        }

        let ordered = order_records(&plan, records);
        self.finish_turn(session_id, request, &intent, started_at, ordered, turn_aborted)
            .await
    }

    /// 派发单个调用：绑定实参、登记待归记录、spawn 客户端调用
    #[allow(clippy::too_many_arguments)]
    async fn dispatch(
        &self,
        call: &PlannedCall,
        descriptor: Arc<ToolDescriptor>,
        session_id: &str,
        outputs: &HashMap<CallId, Value>,
        cancel: &CancellationToken,
        join_set: &mut JoinSet<DispatchOutcome>,
        pending: &mut HashMap<CallId, ToolInvocation>,
    ) {
        let arguments = self.bind_args(session_id, call, outputs).await;
        let invocation = ToolInvocation::new(&call.tool_id, arguments);
        pending.insert(call.call_id.clone(), invocation.clone());

        let client = self.client.clone();
        let cancel = cancel.clone();
        let call_id = call.call_id.clone();
        tracing::debug!(session = %session_id, call = %call_id, tool = %descriptor.id, "dispatching");
        join_set.spawn(async move {
            let mut invocation = invocation;
            let result = client.invoke(&descriptor, &mut invocation, &cancel).await;
            (call_id, invocation, result)
        });
    }

    /// 实参绑定：字面量原样；槽位取会话当前值；输出取本回合前序调用结果，
    /// 缺席时退回同名槽位（前序结果已被折叠）。缺失的字段不出现在实参里，
    /// 必填缺失由客户端的模式校验兜底。
    async fn bind_args(
        &self,
        session_id: &str,
        call: &PlannedCall,
        outputs: &HashMap<CallId, Value>,
    ) -> Value {
        let snapshot = self.store.get(session_id).await.ok();
        let mut map = Map::new();
        for (name, binding) in &call.args {
            let value = match binding {
                ArgBinding::Literal(v) => Some(v.clone()),
                ArgBinding::Slot(slot) => snapshot
                    .as_ref()
                    .and_then(|s| s.slot_value(slot))
                    .cloned(),
                ArgBinding::Output { call, field } => outputs
                    .get(call)
                    .and_then(|payload| payload.get(field))
                    .cloned()
                    .or_else(|| snapshot.as_ref().and_then(|s| s.slot_value(field)).cloned()),
            };
            if let Some(value) = value {
                map.insert(name.clone(), value);
            }
        }
        Value::Object(map)
    }

    /// 结果到达即折叠；会话已关闭时丢弃（迟到结果）
    async fn fold(&self, session_id: &str, descriptor: &ToolDescriptor, invocation: &ToolInvocation) {
        let aggregator = &self.aggregator;
        let folded = self
            .store
            .with_session(session_id, |session| {
                if session.is_closed() {
                    return Ok(false);
                }
                aggregator
                    .fold(session, descriptor, invocation)
                    .map(|_| true)
            })
            .await;
        match folded {
            Ok(Ok(true)) => {}
            Ok(Ok(false)) | Err(_) => {
                tracing::debug!(session = %session_id, invocation = %invocation.id, "late result discarded");
            }
            Ok(Err(e)) => {
                tracing::warn!(session = %session_id, error = %e, "fold failed");
            }
        }
    }

    /// 收尾：写回合审计日志、生成应答、回到 LISTENING
    async fn finish_turn(
        &self,
        session_id: &str,
        request: &TurnRequest,
        intent: &str,
        started_at: chrono::DateTime<Utc>,
        invocations: Vec<ToolInvocation>,
        aborted: bool,
    ) -> Result<TurnResponse, OrchestratorError> {
        self.set_phase(session_id, DialoguePhase::Responding).await;

        let final_snapshot = self.store.get(session_id).await?;
        let agent_utterance = if aborted {
            self.abort_reply.clone()
        } else {
            self.planner.respond(intent, &final_snapshot)
        };

        let turn = Turn {
            user_utterance: request.utterance_text.clone(),
            agent_utterance: agent_utterance.clone(),
            intent: intent.to_string(),
            invocations,
            started_at,
        };
        self.store.append_turn(session_id, turn).await?;

        let session = self.store.get(session_id).await?;
        tracing::info!(
            session = %session_id,
            intent = %intent,
            aborted,
            turns = session.turns.len(),
            "turn finished"
        );
        Ok(TurnResponse {
            session_id: session_id.to_string(),
            agent_utterance,
            session,
        })
    }

    async fn set_phase(&self, session_id: &str, phase: DialoguePhase) {
        let _ = self
            .store
            .with_session(session_id, |session| {
                if !session.is_closed() {
                    session.phase = phase;
                }
            })
            .await;
    }
}

/// 依赖未满足的调用记录：从未派发，直接 Failed(DependencyUnmet)
fn unmet_record(call: &PlannedCall, failed_dependency: &str) -> ToolInvocation {
    let mut invocation = ToolInvocation::new(&call.tool_id, Value::Object(Map::new()));
    invocation.mark_failed(
        FailureReason::DependencyUnmet,
        format!("dependency '{failed_dependency}' did not succeed"),
    );
    invocation
}

/// 按计划顺序输出终态记录（审计日志稳定有序）
fn order_records(plan: &TurnPlan, mut records: HashMap<CallId, ToolInvocation>) -> Vec<ToolInvocation> {
    plan.calls
        .iter()
        .filter_map(|call| records.remove(&call.call_id))
        .collect()
}
