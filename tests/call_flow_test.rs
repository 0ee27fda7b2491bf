//! 通话流程集成测试

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::json;

    use switchboard::config::{CallRule, IntentRule};
    use switchboard::core::{Orchestrator, RulePlanner, TurnRequest};
    use switchboard::session::SessionStore;
    use switchboard::tools::descriptor::{FallbackPolicy, ParamKind, ParamSpec};
    use switchboard::tools::{
        FailureReason, InvocationState, MockBehavior, MockTransport, ToolClient, ToolDescriptor,
        ToolRegistry,
    };

    fn param(name: &str) -> ParamSpec {
        ParamSpec {
            name: name.into(),
            kind: ParamKind::String,
            required: true,
        }
    }

    fn descriptor(
        id: &str,
        inputs: &[&str],
        outputs: &[&str],
        timeout_ms: u64,
        fallback: FallbackPolicy,
    ) -> ToolDescriptor {
        ToolDescriptor {
            id: id.into(),
            inputs: inputs.iter().map(|n| param(n)).collect(),
            outputs: outputs.iter().map(|n| param(n)).collect(),
            endpoint: format!("mock://{id}"),
            timeout_ms,
            fallback,
            degrade_default: None,
            authoritative_slots: vec![],
        }
    }

    /// fhir-lookup -> sms-confirm 的预约意图规则（§ 数据依赖场景）
    fn schedule_rule() -> IntentRule {
        IntentRule {
            intent: "doctor_schedule".into(),
            reply: Some("Your appointment is at {appt_time}.".into()),
            calls: vec![
                CallRule {
                    id: "lookup".into(),
                    tool: "fhir-lookup".into(),
                    args: [("patientId".to_string(), json!("{slot:patient_id}"))]
                        .into_iter()
                        .collect(),
                    depends_on: vec![],
                    unless_slot: None,
                },
                CallRule {
                    id: "confirm".into(),
                    tool: "sms-confirm".into(),
                    args: [
                        ("phone".to_string(), json!("{slot:phone}")),
                        ("apptTime".to_string(), json!("{out:lookup.appt_time}")),
                    ]
                    .into_iter()
                    .collect(),
                    depends_on: vec!["lookup".into()],
                    unless_slot: None,
                },
            ],
        }
    }

    fn orchestrator(
        transport: MockTransport,
        tools: Vec<ToolDescriptor>,
        intents: Vec<IntentRule>,
        turn_deadline_ms: u64,
    ) -> Orchestrator {
        let registry = Arc::new(ToolRegistry::default());
        for tool in tools {
            registry.register(tool).unwrap();
        }
        Orchestrator::new(
            registry,
            Arc::new(ToolClient::new(transport.into_arc())),
            Arc::new(SessionStore::default()),
            Arc::new(RulePlanner::new(intents, "How can I help you today?")),
            turn_deadline_ms,
            "Sorry, I could not complete this step.",
        )
    }

    async fn start_schedule_call(orch: &Orchestrator) {
        orch.begin_call("call-1").await.unwrap();
        let store = orch.store();
        store.set_slot("call-1", "patient_id", json!("123")).await.unwrap();
        store.set_slot("call-1", "phone", json!("5551234567")).await.unwrap();
    }

    fn schedule_request() -> TurnRequest {
        TurnRequest {
            session_id: "call-1".into(),
            utterance_text: "I need to book a doctor".into(),
            detected_intent: Some("doctor_schedule".into()),
        }
    }

    #[tokio::test]
    async fn test_dependent_call_receives_upstream_output() {
        let transport = MockTransport::new()
            .with("fhir-lookup", MockBehavior::Succeed(json!({"appt_time": "14:00"})))
            .with("sms-confirm", MockBehavior::Succeed(json!({"status": "sent"})));
        let orch = orchestrator(
            transport,
            vec![
                descriptor("fhir-lookup", &["patientId"], &["appt_time"], 1000, FallbackPolicy::AbortTurn),
                descriptor("sms-confirm", &["phone", "apptTime"], &["status"], 1000, FallbackPolicy::AbortTurn),
            ],
            vec![schedule_rule()],
            5000,
        );
        start_schedule_call(&orch).await;

        let response = orch.run_turn(schedule_request()).await.unwrap();

        assert_eq!(response.agent_utterance, "Your appointment is at 14:00.");
        let turn = &response.session.turns[0];
        assert_eq!(turn.invocations.len(), 2);
        let confirm = turn
            .invocations
            .iter()
            .find(|i| i.tool_id == "sms-confirm")
            .unwrap();
        assert_eq!(confirm.state, InvocationState::Succeeded);
        // 依赖方的实参来自上游输出
        assert_eq!(confirm.arguments["apptTime"], json!("14:00"));
        assert_eq!(response.session.slot_value("appt_time"), Some(&json!("14:00")));
        assert_eq!(response.session.slot_value("status"), Some(&json!("sent")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_dependency_skips_dependent() {
        let transport = MockTransport::new()
            .with(
                "fhir-lookup",
                MockBehavior::Delay(Duration::from_secs(10), json!({"appt_time": "14:00"})),
            )
            .with("sms-confirm", MockBehavior::Succeed(json!({"status": "sent"})));
        let orch = orchestrator(
            transport,
            vec![
                descriptor("fhir-lookup", &["patientId"], &["appt_time"], 50, FallbackPolicy::AbortTurn),
                descriptor("sms-confirm", &["phone", "apptTime"], &["status"], 1000, FallbackPolicy::AbortTurn),
            ],
            vec![schedule_rule()],
            60_000,
        );
        start_schedule_call(&orch).await;

        let response = orch.run_turn(schedule_request()).await.unwrap();

        // AbortTurn：用户听到明确的失败话术，不是内部错误
        assert_eq!(response.agent_utterance, "Sorry, I could not complete this step.");
        let turn = &response.session.turns[0];
        let lookup = turn.invocations.iter().find(|i| i.tool_id == "fhir-lookup").unwrap();
        assert_eq!(lookup.state, InvocationState::TimedOut);
        // 依赖方从未派发，结局固定为 DependencyUnmet
        let confirm = turn.invocations.iter().find(|i| i.tool_id == "sms-confirm").unwrap();
        assert_eq!(confirm.state, InvocationState::Failed);
        assert_eq!(confirm.failure_reason, Some(FailureReason::DependencyUnmet));
        assert!(response.session.slot_value("status").is_none());
    }

    #[tokio::test]
    async fn test_zero_tool_intent_responds_directly() {
        let orch = orchestrator(MockTransport::new(), vec![], vec![], 5000);
        orch.begin_call("call-1").await.unwrap();
        let response = orch
            .run_turn(TurnRequest {
                session_id: "call-1".into(),
                utterance_text: "hello".into(),
                detected_intent: None,
            })
            .await
            .unwrap();
        assert_eq!(response.agent_utterance, "How can I help you today?");
        assert!(response.session.turns[0].invocations.is_empty());
    }

    #[tokio::test]
    async fn test_degrade_policy_recovers_invisibly() {
        let transport = MockTransport::new().with("fhir-lookup", MockBehavior::Refuse);
        let mut degraded =
            descriptor("fhir-lookup", &["patientId"], &["appt_time"], 100, FallbackPolicy::Degrade);
        degraded.degrade_default = Some(json!({"appt_time": "next available"}));
        let mut rule = schedule_rule();
        rule.calls.truncate(1);
        let orch = orchestrator(transport, vec![degraded], vec![rule], 5000);
        start_schedule_call(&orch).await;

        let response = orch.run_turn(schedule_request()).await.unwrap();

        // 降级负载顶替结果，对用户只是正常应答
        assert_eq!(response.agent_utterance, "Your appointment is at next available.");
        assert_eq!(
            response.session.slot_value("appt_time"),
            Some(&json!("next available"))
        );
        // 审计日志里保留真实的失败记录
        let lookup = &response.session.turns[0].invocations[0];
        assert_eq!(lookup.state, InvocationState::Failed);
        assert_eq!(lookup.failure_reason, Some(FailureReason::Transport));
    }

    #[tokio::test]
    async fn test_retry_once_exhausted_aborts_turn() {
        // 脚本化传输每次都 Refuse：重试一次后仍失败，回合中止
        let transport = MockTransport::new().with("fhir-lookup", MockBehavior::Refuse);
        let mut rule = schedule_rule();
        rule.calls.truncate(1);
        let orch = orchestrator(
            transport,
            vec![descriptor("fhir-lookup", &["patientId"], &["appt_time"], 1000, FallbackPolicy::RetryOnce)],
            vec![rule],
            5000,
        );
        start_schedule_call(&orch).await;

        let response = orch.run_turn(schedule_request()).await.unwrap();

        assert_eq!(response.agent_utterance, "Sorry, I could not complete this step.");
        let lookup = &response.session.turns[0].invocations[0];
        assert_eq!(lookup.state, InvocationState::Failed);
        assert_eq!(lookup.failure_reason, Some(FailureReason::Transport));
        assert!(response.session.slot_value("appt_time").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_turn_deadline_degrades_instead_of_hanging() {
        let transport = MockTransport::new().with(
            "fhir-lookup",
            MockBehavior::Delay(Duration::from_secs(30), json!({"appt_time": "14:00"})),
        );
        let mut rule = schedule_rule();
        rule.calls.truncate(1);
        let orch = orchestrator(
            transport,
            // 描述符超时远大于回合预算：回合预算先到
            vec![descriptor("fhir-lookup", &["patientId"], &["appt_time"], 60_000, FallbackPolicy::AbortTurn)],
            vec![rule],
            100,
        );
        start_schedule_call(&orch).await;

        let response = orch.run_turn(schedule_request()).await.unwrap();

        // 预算耗尽不是中止：降级应答。槽位缺失时模板占位符不得念给用户
        assert_eq!(response.agent_utterance, "How can I help you today?");
        assert!(!response.agent_utterance.contains('{'));
        let lookup = &response.session.turns[0].invocations[0];
        assert_eq!(lookup.state, InvocationState::TimedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn test_authoritative_slot_survives_later_write() {
        // A 权威且立刻返回；B 非权威、稍后返回同一槽位
        let transport = MockTransport::new()
            .with("tool-a", MockBehavior::Succeed(json!({"patientName": "From A"})))
            .with(
                "tool-b",
                MockBehavior::Delay(Duration::from_millis(50), json!({"patientName": "From B"})),
            );
        let mut a = descriptor("tool-a", &[], &["patientName"], 1000, FallbackPolicy::AbortTurn);
        a.authoritative_slots = vec!["patientName".into()];
        let b = descriptor("tool-b", &[], &["patientName"], 1000, FallbackPolicy::AbortTurn);
        let rule = IntentRule {
            intent: "identify".into(),
            reply: Some("Caller is {patientName}.".into()),
            calls: vec![
                CallRule {
                    id: "a".into(),
                    tool: "tool-a".into(),
                    args: Default::default(),
                    depends_on: vec![],
                    unless_slot: None,
                },
                CallRule {
                    id: "b".into(),
                    tool: "tool-b".into(),
                    args: Default::default(),
                    depends_on: vec![],
                    unless_slot: None,
                },
            ],
        };
        let orch = orchestrator(transport, vec![a, b], vec![rule], 5000);
        orch.begin_call("call-1").await.unwrap();

        let response = orch
            .run_turn(TurnRequest {
                session_id: "call-1".into(),
                utterance_text: "who am I".into(),
                detected_intent: Some("identify".into()),
            })
            .await
            .unwrap();

        // B 更晚成功，但 A 对该槽位权威：终值是 A 的
        assert_eq!(response.agent_utterance, "Caller is From A.");
        assert_eq!(
            response.session.slot_value("patientName"),
            Some(&json!("From A"))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_active_turn_guard() {
        let transport = MockTransport::new().with(
            "fhir-lookup",
            MockBehavior::Delay(Duration::from_secs(5), json!({"appt_time": "14:00"})),
        );
        let mut rule = schedule_rule();
        rule.calls.truncate(1);
        let orch = Arc::new(orchestrator(
            transport,
            vec![descriptor("fhir-lookup", &["patientId"], &["appt_time"], 60_000, FallbackPolicy::AbortTurn)],
            vec![rule],
            60_000,
        ));
        start_schedule_call(&orch).await;

        let first = {
            let orch = orch.clone();
            tokio::spawn(async move { orch.run_turn(schedule_request()).await })
        };
        // 让第一个回合占住会话
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        let second = orch.run_turn(schedule_request()).await;
        assert!(matches!(
            second,
            Err(switchboard::OrchestratorError::TurnInProgress(_))
        ));

        let first = first.await.unwrap().unwrap();
        assert_eq!(first.session.turns.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_during_turn_cancels_and_discards_result() {
        let transport = MockTransport::new().with(
            "fhir-lookup",
            MockBehavior::Delay(Duration::from_secs(10), json!({"appt_time": "14:00"})),
        );
        let mut rule = schedule_rule();
        rule.calls.truncate(1);
        let orch = Arc::new(orchestrator(
            transport,
            vec![descriptor("fhir-lookup", &["patientId"], &["appt_time"], 60_000, FallbackPolicy::AbortTurn)],
            vec![rule],
            60_000,
        ));
        start_schedule_call(&orch).await;

        let turn = {
            let orch = orch.clone();
            tokio::spawn(async move { orch.run_turn(schedule_request()).await })
        };
        // 让回合派发出在飞调用
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        // 通话中挂断：在飞调用被取消，迟到的结果绝不折叠进会话
        let final_session = orch.close_call("call-1").await.unwrap();
        assert!(final_session.is_closed());
        assert!(final_session.slot_value("appt_time").is_none());

        let result = turn.await.unwrap();
        assert!(matches!(
            result,
            Err(switchboard::OrchestratorError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn test_close_call_returns_final_snapshot_and_expires() {
        let orch = orchestrator(MockTransport::new(), vec![], vec![], 5000);
        orch.begin_call("call-1").await.unwrap();
        orch.run_turn(TurnRequest {
            session_id: "call-1".into(),
            utterance_text: "hello".into(),
            detected_intent: None,
        })
        .await
        .unwrap();

        let final_session = orch.close_call("call-1").await.unwrap();
        assert!(final_session.is_closed());
        assert_eq!(final_session.turns.len(), 1);
        // 会话已销毁：后续回合与重复关闭都报 UnknownSession
        assert!(orch.run_turn(schedule_request()).await.is_err());
        assert!(orch.close_call("call-1").await.is_err());
    }

    #[tokio::test]
    async fn test_keyword_intent_fallback_reaches_tools() {
        let transport = MockTransport::new()
            .with("fhir-lookup", MockBehavior::Succeed(json!({"appt_time": "09:30"})))
            .with("sms-confirm", MockBehavior::Succeed(json!({"status": "sent"})));
        let orch = orchestrator(
            transport,
            vec![
                descriptor("fhir-lookup", &["patientId"], &["appt_time"], 1000, FallbackPolicy::AbortTurn),
                descriptor("sms-confirm", &["phone", "apptTime"], &["status"], 1000, FallbackPolicy::AbortTurn),
            ],
            vec![schedule_rule()],
            5000,
        );
        start_schedule_call(&orch).await;

        // 不带 detected_intent：关键词识别兜底
        let response = orch
            .run_turn(TurnRequest {
                session_id: "call-1".into(),
                utterance_text: "I want to schedule an appointment".into(),
                detected_intent: None,
            })
            .await
            .unwrap();
        assert_eq!(response.session.turns[0].intent, "doctor_schedule");
        assert_eq!(response.agent_utterance, "Your appointment is at 09:30.");
    }
}
