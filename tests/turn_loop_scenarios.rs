//! 回合循环场景测试：终止、计数、空语句、工具失败、降级继续、取消、事件

mod common;

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use common::{echo_call, harness, harness_with_tools, test_tools, SecondSaveFails};
use hive::config::AppConfig;
use hive::core::{Orchestrator, OrchestratorBuilder, OrchestratorEvent, RunPhase, StatementOptions};
use hive::interaction::{ContentPart, Interaction, Role};
use hive::llm::{LlmError, LlmResponse, RequestPurpose, ScriptedLlmClient, ToolInvocation};
use hive::persistence::InteractionPersistence;
use hive::tools::{Tool, ToolContext, ToolRunResult};
use hive::OrchestratorError;

#[tokio::test]
async fn test_first_response_without_tools_answers_immediately() {
    let client = Arc::new(ScriptedLlmClient::new());
    client
        .push_text("<thinking>six times seven</thinking>The answer is 42.")
        .await;
    let h = harness(client.clone(), AppConfig::default()).await;

    let result = h
        .orchestrator
        .handle_statement(
            "What is six times seven?",
            &h.conversation_id,
            StatementOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(result.answer, "The answer is 42.");
    assert_eq!(result.thinking.as_deref(), Some("six times seven"));
    assert_eq!(result.stats.statement_turn_count, 0);
    assert_eq!(result.stats.statement_count, 1);
    assert!(!result.cancelled);
    assert_eq!(client.turn_requests().await.len(), 1);

    let interaction = h.interaction().await;
    assert_eq!(interaction.title.as_deref(), Some("What is six times seven?"));
    assert_eq!(
        interaction.objectives.conversation.as_deref(),
        Some("Help the user with: What is six times seven?")
    );
    // 用户语句 + 助手响应
    assert_eq!(interaction.messages().len(), 2);
    assert!(h.persistence.contains(&h.conversation_id).await);
}

#[tokio::test]
async fn test_secondary_calls_are_counted_in_totals() {
    let client = Arc::new(ScriptedLlmClient::new());
    client.push_text("hello").await;
    let h = harness(client.clone(), AppConfig::default()).await;

    let result = h
        .orchestrator
        .handle_statement("hi there", &h.conversation_id, StatementOptions::default())
        .await
        .unwrap();

    // 对话自身只有一次请求；标题与对话目标在聊天子交互中
    assert_eq!(result.token_usage.total_tokens, 15);
    let totals = h.orchestrator.totals().await;
    assert_eq!(totals.interaction_count, 2);
    assert_eq!(totals.token_usage.total_tokens, 45);
    let children = h.orchestrator.manager().children(&h.conversation_id).await;
    assert_eq!(children.len(), 1);
}

#[tokio::test]
async fn test_loop_ends_when_tools_stop() {
    let client = Arc::new(ScriptedLlmClient::new());
    client.push_response(LlmResponse::from_text("step 1").with_tool(echo_call("a"))).await;
    client.push_response(LlmResponse::from_text("step 2").with_tool(echo_call("b"))).await;
    client.push_text("final").await;
    let h = harness(client.clone(), AppConfig::default()).await;

    let result = h
        .orchestrator
        .handle_statement("do two things", &h.conversation_id, StatementOptions::default())
        .await
        .unwrap();

    assert_eq!(result.answer, "final");
    assert_eq!(result.stats.statement_turn_count, 2);
    let requests = client.turn_requests().await;
    assert_eq!(requests.len(), 3);
    assert_eq!(requests[0].purpose, RequestPurpose::Statement);
    assert_eq!(requests[1].purpose, RequestPurpose::ToolFeedback);
    let feedback = requests[1].last_user_text().unwrap();
    assert!(feedback.starts_with("[Turn 1/25]"));
    assert!(feedback.contains("--- echo ---\na"));
    assert!(feedback.contains("Tool usage: echo: 1 calls (1 ok, 0 failed)"));
}

#[tokio::test]
async fn test_unbounded_tool_calls_stop_at_max_turns() {
    let client = Arc::new(
        ScriptedLlmClient::new()
            .with_fallback(LlmResponse::from_text("again").with_tool(echo_call("loop"))),
    );
    let h = harness(client.clone(), AppConfig::default()).await;

    let result = h
        .orchestrator
        .handle_statement("never stop", &h.conversation_id, StatementOptions::with_max_turns(3))
        .await
        .unwrap();

    assert_eq!(result.stats.statement_turn_count, 3);
    assert_eq!(result.stats.interaction_turn_count, 3);
    assert_eq!(client.turn_requests().await.len(), 4);
    assert_eq!(result.answer, "again");
}

#[tokio::test]
async fn test_counters_across_statements() {
    let client = Arc::new(ScriptedLlmClient::new());
    // 语句 1：2 个回合；语句 2：0 个回合；语句 3：1 个回合
    client.push_response(LlmResponse::from_text("").with_tool(echo_call("1"))).await;
    client.push_response(LlmResponse::from_text("").with_tool(echo_call("2"))).await;
    client.push_text("a1").await;
    client.push_text("a2").await;
    client.push_response(LlmResponse::from_text("").with_tool(echo_call("3"))).await;
    client.push_text("a3").await;
    let h = harness(client.clone(), AppConfig::default()).await;

    let mut last = None;
    for statement in ["first", "second", "third"] {
        last = Some(
            h.orchestrator
                .handle_statement(statement, &h.conversation_id, StatementOptions::default())
                .await
                .unwrap(),
        );
    }
    let last = last.unwrap();

    assert_eq!(last.answer, "a3");
    assert_eq!(last.stats.statement_count, 3);
    assert_eq!(last.stats.interaction_turn_count, 3);
    assert_eq!(last.stats.statement_turn_count, 1);

    let interaction = h.interaction().await;
    assert_eq!(interaction.stats, last.stats);
    let tracked = h.orchestrator.interaction_stats(&h.conversation_id).await.unwrap();
    assert_eq!(tracked.stats, last.stats);
    // 第 2、3 条语句各生成一个语句级目标
    assert_eq!(
        interaction.objectives.statements,
        vec!["Address: second".to_string(), "Address: third".to_string()]
    );
}

#[tokio::test]
async fn test_objective_is_reinjected_into_feedback() {
    let client = Arc::new(ScriptedLlmClient::new());
    client.push_text("ok").await;
    client.push_response(LlmResponse::from_text("").with_tool(echo_call("x"))).await;
    client.push_text("done").await;
    let h = harness(client.clone(), AppConfig::default()).await;

    for statement in ["set up the project", "add a parser"] {
        h.orchestrator
            .handle_statement(statement, &h.conversation_id, StatementOptions::default())
            .await
            .unwrap();
    }

    let requests = client.turn_requests().await;
    let feedback = requests.last().unwrap();
    let text = feedback.last_user_text().unwrap();
    assert!(text.contains("Conversation objective: Help the user with: set up the project"));
    assert!(text.contains("Statement objective: Address: add a parser"));
    assert!(feedback.system.contains("Statement objective: Address: add a parser"));
}

#[tokio::test]
async fn test_empty_statement_is_rejected_without_side_effects() {
    let client = Arc::new(ScriptedLlmClient::new());
    let mut h = harness(client.clone(), AppConfig::default()).await;
    h.drain_events();

    let err = h
        .orchestrator
        .handle_statement("   ", &h.conversation_id, StatementOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(err, OrchestratorError::InvalidInput(_)));
    let events = h.drain_events();
    assert_eq!(events.len(), 1);
    assert!(matches!(
        events[0].event,
        OrchestratorEvent::Error { ref kind, .. } if kind == "invalid_input"
    ));
    assert!(client.requests().await.is_empty());
    let tracked = h.orchestrator.interaction_stats(&h.conversation_id).await.unwrap();
    assert_eq!(tracked.stats.statement_count, 0);
    assert!(h.interaction().await.messages().is_empty());
}

#[tokio::test]
async fn test_unknown_interaction_is_not_found() {
    let client = Arc::new(ScriptedLlmClient::new());
    let h = harness(client, AppConfig::default()).await;

    assert!(h.orchestrator.get_interaction("nope").await.is_none());
    let err = h
        .orchestrator
        .handle_statement("hello", "nope", StatementOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::NotFound { .. }));
    let err = h.orchestrator.cancel_current_operation("nope").await.unwrap_err();
    assert!(matches!(err, OrchestratorError::NotFound { .. }));
}

#[tokio::test]
async fn test_tool_failure_is_fed_back_and_loop_continues() {
    let client = Arc::new(ScriptedLlmClient::new());
    client
        .push_response(
            LlmResponse::from_text("trying")
                .with_tool(ToolInvocation::new("explode", serde_json::json!({})))
                .with_tool(echo_call("still runs")),
        )
        .await;
    client.push_text("recovered").await;
    let h = harness(client.clone(), AppConfig::default()).await;

    let result = h
        .orchestrator
        .handle_statement("break something", &h.conversation_id, StatementOptions::default())
        .await
        .unwrap();

    assert_eq!(result.answer, "recovered");
    assert_eq!(result.stats.statement_turn_count, 1);
    let requests = client.turn_requests().await;
    assert_eq!(requests.len(), 2);
    let feedback = requests[1].last_user_text().unwrap();
    assert!(feedback.contains("Error with explode: disk on fire"));
    // 工具按返回顺序执行
    let explode_at = feedback.find("--- explode ---").unwrap();
    let echo_at = feedback.find("--- echo ---").unwrap();
    assert!(explode_at < echo_at);

    let interaction = h.interaction().await;
    let tally = interaction.tool_usage.tools["explode"];
    assert_eq!((tally.invocations, tally.failures), (1, 1));
    assert_eq!(interaction.tool_usage.last_tool.as_deref(), Some("echo"));
}

#[tokio::test]
async fn test_mid_loop_provider_failure_degrades() {
    let client = Arc::new(ScriptedLlmClient::new());
    client.push_response(LlmResponse::from_text("").with_tool(echo_call("x"))).await;
    client.push_error(LlmError::Request("flaky".to_string())).await;
    client.push_text("final").await;
    let h = harness(client.clone(), AppConfig::default()).await;

    let result = h
        .orchestrator
        .handle_statement("work", &h.conversation_id, StatementOptions::default())
        .await
        .unwrap();

    assert_eq!(result.answer, "final");
    assert_eq!(result.stats.statement_turn_count, 2);
    let requests = client.turn_requests().await;
    assert_eq!(requests.len(), 3);
    let notice = requests[2].last_user_text().unwrap();
    assert!(notice.contains("Error with LLM request: request failed: flaky"));
}

#[tokio::test]
async fn test_provider_failure_on_last_turn_is_fatal() {
    let client = Arc::new(ScriptedLlmClient::new());
    client.push_response(LlmResponse::from_text("").with_tool(echo_call("x"))).await;
    client.push_error(LlmError::Timeout).await;
    let h = harness(client.clone(), AppConfig::default()).await;

    let err = h
        .orchestrator
        .handle_statement("work", &h.conversation_id, StatementOptions::with_max_turns(1))
        .await
        .unwrap_err();

    assert!(matches!(err, OrchestratorError::Provider(LlmError::Timeout)));

    // 开场的语句与首个响应已经落盘
    let stored = h
        .persistence
        .load(&h.conversation_id)
        .await
        .unwrap()
        .expect("conversation persisted");
    assert_eq!(stored.messages()[0].role, Role::User);
    assert_eq!(stored.messages()[0].text(), "work");
    assert_eq!(stored.messages()[1].role, Role::Assistant);
    assert!(stored.messages()[1]
        .content
        .iter()
        .any(|part| matches!(part, ContentPart::ToolUse { name, .. } if name == "echo")));
}

#[tokio::test]
async fn test_opening_exchange_is_durable_before_the_loop() {
    let client = Arc::new(ScriptedLlmClient::new());
    client.push_response(LlmResponse::from_text("first look").with_tool(echo_call("x"))).await;
    client.push_text("final").await;
    let store = Arc::new(SecondSaveFails::default());
    let orchestrator = OrchestratorBuilder::new(AppConfig::default())
        .with_llm(client)
        .with_persistence(store.clone())
        .build()
        .unwrap();
    let conversation = orchestrator.create_conversation(None).await.unwrap();
    let id = conversation.lock().await.id.clone();

    let err = orchestrator
        .handle_statement("inspect the logs", &id, StatementOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::Persistence(_)));

    // 循环结束时的保存失败，开场交换仍在存储中
    let stored = store.inner.load(&id).await.unwrap().expect("opening exchange saved");
    assert_eq!(stored.messages().len(), 2);
    assert_eq!(stored.messages()[0].text(), "inspect the logs");
    assert_eq!(stored.messages()[1].text(), "first look");
    assert_eq!(stored.stats.statement_count, 1);
}

#[tokio::test]
async fn test_secondary_calls_send_only_their_prompt() {
    let client = Arc::new(ScriptedLlmClient::new());
    let h = harness(client.clone(), AppConfig::default()).await;

    for statement in ["one", "two", "three", "four", "five"] {
        h.orchestrator
            .handle_statement(statement, &h.conversation_id, StatementOptions::default())
            .await
            .unwrap();
    }

    let secondary: Vec<_> = client
        .requests()
        .await
        .into_iter()
        .filter(|r| !r.purpose.is_turn())
        .collect();
    assert_eq!(secondary.len(), 6);
    for request in &secondary {
        assert_eq!(request.messages.len(), 1, "{} request", request.purpose);
    }
    assert!(secondary[5].last_user_text().unwrap().ends_with("five"));

    // 聊天子交互仍记录全部辅助调用
    let chat_id = h.interaction().await.chat_interaction_id.unwrap();
    let chat = h.orchestrator.get_interaction(&chat_id).await.unwrap();
    assert_eq!(chat.lock().await.messages().len(), 12);
}

#[tokio::test]
async fn test_first_request_failure_is_fatal() {
    let client = Arc::new(ScriptedLlmClient::new());
    client.push_error(LlmError::Request("down".to_string())).await;
    client.push_text("never used").await;
    let h = harness(client.clone(), AppConfig::default()).await;

    let err = h
        .orchestrator
        .handle_statement("hello", &h.conversation_id, StatementOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(err, OrchestratorError::Provider(_)));
    assert_eq!(client.remaining().await, 1);
}

/// 调用时通过编排器请求取消当前操作
struct CancelTool {
    orchestrator: Arc<OnceLock<Orchestrator>>,
}

#[async_trait]
impl Tool for CancelTool {
    fn name(&self) -> &str {
        "stop"
    }

    fn description(&self) -> &str {
        "Requests cancellation"
    }

    async fn run(
        &self,
        _interaction: &Interaction,
        _invocation: &ToolInvocation,
        ctx: &ToolContext,
    ) -> Result<ToolRunResult, String> {
        let orchestrator = self.orchestrator.get().ok_or("not wired")?;
        orchestrator
            .cancel_current_operation(&ctx.interaction_id)
            .await
            .map_err(|e| e.to_string())?;
        Ok(ToolRunResult::text("stopping"))
    }
}

#[tokio::test]
async fn test_cancellation_is_observed_at_iteration_boundary() {
    let client = Arc::new(ScriptedLlmClient::new().with_fallback(
        LlmResponse::from_text("keep going")
            .with_tool(ToolInvocation::new("stop", serde_json::json!({}))),
    ));
    let slot = Arc::new(OnceLock::new());
    let mut tools = test_tools();
    tools.register(CancelTool {
        orchestrator: slot.clone(),
    });
    let mut h = harness_with_tools(client.clone(), AppConfig::default(), tools).await;
    let _ = slot.set(h.orchestrator.clone());

    let result = h
        .orchestrator
        .handle_statement("run until stopped", &h.conversation_id, StatementOptions::default())
        .await
        .unwrap();

    assert!(result.cancelled);
    assert_eq!(result.stats.statement_turn_count, 1);
    // 进行中的反馈请求不会被抢占
    assert_eq!(client.turn_requests().await.len(), 2);
    let events = h.drain_events();
    assert!(events
        .iter()
        .any(|e| matches!(e.event, OrchestratorEvent::Cancelled { turn: 1, .. })));

    // 新语句重置取消标志
    client.push_text("fresh start").await;
    let next = h
        .orchestrator
        .handle_statement("again", &h.conversation_id, StatementOptions::default())
        .await
        .unwrap();
    assert!(!next.cancelled);
    assert_eq!(next.answer, "fresh start");
}

#[tokio::test]
async fn test_events_are_sequenced() {
    let client = Arc::new(ScriptedLlmClient::new());
    client.push_response(LlmResponse::from_text("").with_tool(echo_call("x"))).await;
    client.push_text("done").await;
    let mut h = harness(client, AppConfig::default()).await;

    h.orchestrator
        .handle_statement("go", &h.conversation_id, StatementOptions::default())
        .await
        .unwrap();

    let events = h.drain_events();
    let seqs: Vec<u64> = events.iter().map(|e| e.seq).collect();
    let expected: Vec<u64> = (1..=seqs.len() as u64).collect();
    assert_eq!(seqs, expected);

    let names: Vec<&str> = events.iter().map(|e| e.event.name()).collect();
    assert!(names.contains(&"new_interaction"));
    assert!(names.contains(&"ready"));
    assert!(names.contains(&"tool_invoked"));
    assert!(names.contains(&"tool_completed"));
    assert_eq!(names.last(), Some(&"answer"));
    assert!(events.iter().any(|e| matches!(
        e.event,
        OrchestratorEvent::CacheTimer { valid_for_secs: 300, .. }
    )));
    assert!(events.iter().any(|e| matches!(
        e.event,
        OrchestratorEvent::Status { phase: RunPhase::Done, turn: 1, .. }
    )));

    let ready_at = names.iter().position(|n| *n == "ready").unwrap();
    let first_tool = names.iter().position(|n| *n == "tool_invoked").unwrap();
    assert!(ready_at < first_tool);
}
