use std::{sync::Arc, time::Duration};

use serde_json::{Value, json};

use kora_domain::{
	chat::{ChatResponse, ToolCall},
	event::{EventData, EventKind},
};
use kora_service::{
	BoxFuture, QaRequest, Result,
	agent::{AgentOverrides, AgentTool, ToolContext, ToolOutput},
};

use super::{
	Harness, TENANT, assert_single_terminal, drain, recv_until, terminal_answers, test_config,
};

/// Never finishes; only cancellation ends a call.
struct PendingTool;
impl AgentTool for PendingTool {
	fn name(&self) -> &str {
		"slow_lookup"
	}

	fn description(&self) -> &str {
		"Looks something up, slowly."
	}

	fn parameters(&self) -> Value {
		json!({ "type": "object", "properties": {} })
	}

	fn execute<'a>(
		&'a self,
		_ctx: &'a ToolContext<'a>,
		_arguments: &'a Value,
	) -> BoxFuture<'a, Result<ToolOutput>> {
		Box::pin(futures::future::pending())
	}
}

fn thinking_call(id: &str) -> ChatResponse {
	ChatResponse {
		tool_calls: vec![ToolCall {
			id: id.to_string(),
			name: "thinking".to_string(),
			arguments: r#"{"thought":"Check once more."}"#.to_string(),
		}],
		..Default::default()
	}
}

#[tokio::test]
async fn agent_stops_at_the_iteration_cap() {
	let harness = Harness::new(test_config());
	let notice = harness.service.cfg.agent.iteration_cap_notice.clone();

	harness.chat.repeat(thinking_call("call"));

	let mut rx = harness.service.bus.subscribe("s-cap");
	let request = QaRequest {
		agent: Some(AgentOverrides { max_iterations: Some(3), ..Default::default() }),
		..QaRequest::new(TENANT, "s-cap", "keep thinking")
	};
	let handle = harness.service.agent_qa(request).await.expect("Starting the agent failed.");

	assert_eq!(handle.pipeline(), None);

	handle.wait().await.expect("The capped run still answers.");

	let events = drain(&mut rx);
	let calls = events.iter().filter(|event| event.kind == EventKind::ToolCall).count();
	let terminals = terminal_answers(&events);

	assert_eq!(harness.chat.chat_calls(), 3);
	assert_eq!(calls, 3);
	assert_eq!(terminals.len(), 1);
	assert_eq!(terminals[0].content(), Some(notice.as_str()));
	assert_single_terminal(&events);
}

#[tokio::test]
async fn agent_streams_tool_steps_before_the_answer() {
	let harness = Harness::new(test_config());

	harness.chat.reply(thinking_call("call-1"));
	harness.chat.reply(ChatResponse {
		content: "Ownership moves values.".to_string(),
		..Default::default()
	});

	let mut rx = harness.service.bus.subscribe("s-agent");

	harness
		.service
		.agent_qa(QaRequest::new(TENANT, "s-agent", "explain ownership"))
		.await
		.expect("Starting the agent failed.")
		.wait()
		.await
		.expect("Agent failed.");

	let events = drain(&mut rx);
	let kinds: Vec<EventKind> = events.iter().map(|event| event.kind).collect();

	assert_eq!(kinds, vec![EventKind::ToolCall, EventKind::ToolResult, EventKind::Answer]);
	assert!(matches!(
		&events[1].data,
		EventData::ToolResult { tool_name, success: true, .. } if tool_name == "thinking"
	));
	assert_eq!(events[2].content(), Some("Ownership moves values."));
	assert!(events[2].done);

	let history = harness.service.context.get_context("s-agent").await.expect("History failed.");

	assert_eq!(history.len(), 2);
}

#[tokio::test]
async fn agent_without_knowledge_scope_refuses_knowledge_tools() {
	let harness = Harness::new(test_config());

	harness.chat.reply(ChatResponse {
		tool_calls: vec![ToolCall {
			id: "call-1".to_string(),
			name: "knowledge_search".to_string(),
			arguments: r#"{"query":"ownership"}"#.to_string(),
		}],
		..Default::default()
	});
	harness
		.chat
		.reply(ChatResponse { content: "No sources.".to_string(), ..Default::default() });

	let mut rx = harness.service.bus.subscribe("s-scope");

	harness
		.service
		.agent_qa(QaRequest::new(TENANT, "s-scope", "explain ownership"))
		.await
		.expect("Starting the agent failed.")
		.wait()
		.await
		.expect("Agent failed.");

	let events = drain(&mut rx);
	let result = events
		.iter()
		.find_map(|event| match &event.data {
			EventData::ToolResult { success, .. } => Some(*success),
			_ => None,
		})
		.expect("The unknown tool call still gets a result.");

	assert!(!result, "Knowledge tools are withheld without a knowledge scope.");
	assert_eq!(terminal_answers(&events)[0].content(), Some("No sources."));
}

#[tokio::test]
async fn stopping_an_agent_run_emits_the_notice() {
	let tool: Arc<dyn AgentTool> = Arc::new(PendingTool);
	let harness = Harness::with_tools(test_config(), vec![tool]);
	let notice = harness.service.cfg.agent.stop_notice.clone();

	harness.chat.reply(ChatResponse {
		tool_calls: vec![ToolCall {
			id: "call-1".to_string(),
			name: "slow_lookup".to_string(),
			arguments: "{}".to_string(),
		}],
		..Default::default()
	});

	let mut rx = harness.service.bus.subscribe("s-agent-stop");
	let handle = harness
		.service
		.agent_qa(QaRequest::new(TENANT, "s-agent-stop", "look it up"))
		.await
		.expect("Starting the agent failed.");
	let mut events = recv_until(&mut rx, EventKind::ToolCall).await;

	harness.service.bus.stop("s-agent-stop", "user").await;
	handle.wait().await.expect("Stopping is not a failure.");
	events.extend(drain(&mut rx));

	let terminals = terminal_answers(&events);

	assert_eq!(terminals.len(), 1);
	assert_eq!(terminals[0].content(), Some(notice.as_str()));
	assert!(events.iter().all(|event| event.kind != EventKind::ToolResult));
	assert_single_terminal(&events);
}

#[tokio::test]
async fn stopping_an_agent_run_does_not_wait_on_a_stuck_subscriber() {
	let tool: Arc<dyn AgentTool> = Arc::new(PendingTool);
	let mut cfg = test_config();

	cfg.service.stream_channel_capacity = 1;

	let harness = Harness::with_tools(cfg, vec![tool]);

	harness.chat.reply(ChatResponse {
		tool_calls: vec![ToolCall {
			id: "call-1".to_string(),
			name: "slow_lookup".to_string(),
			arguments: "{}".to_string(),
		}],
		..Default::default()
	});

	let stuck = harness.service.bus.subscribe("s-agent-stuck");
	let handle = harness
		.service
		.agent_qa(QaRequest::new(TENANT, "s-agent-stuck", "look it up"))
		.await
		.expect("Starting the agent failed.");

	tokio::time::timeout(Duration::from_secs(1), async {
		while stuck.is_empty() {
			tokio::time::sleep(Duration::from_millis(5)).await;
		}
	})
	.await
	.expect("The agent never emitted its tool call.");
	tokio::time::timeout(Duration::from_secs(1), harness.service.bus.stop("s-agent-stuck", "user"))
		.await
		.expect("Stop waited on the stuck subscriber.");
	tokio::time::timeout(Duration::from_secs(1), handle.wait())
		.await
		.expect("The agent run kept waiting after the stop.")
		.expect("Stopping is not a failure.");

	assert_eq!(stuck.len(), 1);
}
