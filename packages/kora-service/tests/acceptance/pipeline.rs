use kora_config::FallbackStrategy;
use kora_domain::{
	chat::{ChatResponse, Role, StreamFrame},
	event::{EventData, EventKind},
};
use kora_service::{
	ConversationOverrides, Error, QaRequest,
	pipeline::{EventType, PipelineKind, StageErrorKind},
};

use super::{
	Harness, StreamScript, TENANT, assert_single_terminal, drain, recv_until, terminal_answers,
	test_config,
};

#[tokio::test]
async fn chat_only_stream_ends_once_without_references() {
	let harness = Harness::new(test_config());
	let mut rx = harness.service.bus.subscribe("s-chat");
	let handle = harness
		.service
		.knowledge_qa_with(
			QaRequest::new(TENANT, "s-chat", "hello"),
			vec![EventType::ChatCompletionStream],
		)
		.await
		.expect("Starting the answer failed.");

	assert_eq!(handle.pipeline(), None);

	handle.wait().await.expect("Answer failed.");

	let events = drain(&mut rx);
	let terminals = terminal_answers(&events);

	assert_eq!(terminals.len(), 1);
	assert_eq!(terminals[0].content(), Some(" there."));
	assert!(events.iter().all(|event| event.kind != EventKind::References));
	assert_single_terminal(&events);
}

#[tokio::test]
async fn empty_corpus_answers_with_the_fixed_fallback() {
	let harness = Harness::new(test_config());
	let fallback = harness.service.cfg.conversation.fallback_response.clone();
	let mut rx = harness.service.bus.subscribe("s-empty");
	let request = QaRequest {
		knowledge_base_ids: vec!["kb-empty".to_string()],
		..QaRequest::new(TENANT, "s-empty", "what is tokio")
	};
	let events = vec![
		EventType::ChunkSearch,
		EventType::ChunkRerank,
		EventType::ChunkMerge,
		EventType::FilterTopK,
		EventType::IntoChatMessage,
		EventType::ChatCompletionStream,
	];

	harness
		.service
		.knowledge_qa_with(request, events)
		.await
		.expect("Starting the answer failed.")
		.wait()
		.await
		.expect("Fallback answers are not failures.");

	let events = drain(&mut rx);
	let terminals = terminal_answers(&events);

	assert_eq!(terminals.len(), 1);
	assert_eq!(terminals[0].content(), Some(fallback.as_str()));
	assert!(harness.chat.stream_prompts().is_empty(), "No model stream may start.");
	assert_single_terminal(&events);

	let history = harness.service.context.get_context("s-empty").await.expect("History failed.");

	assert_eq!(history.last().map(|message| message.content.as_str()), Some(fallback.as_str()));
}

#[tokio::test]
async fn rag_stream_cites_indexed_chunks_and_records_history() {
	let harness = Harness::new(test_config());

	harness
		.seed("kb-rust", "doc-tokio", &[
			"Tokio schedules tasks on a pool of worker threads.",
			"Cooking pasta needs salted water.",
		])
		.await;

	let mut rx = harness.service.bus.subscribe("s-rag");
	let request = QaRequest {
		knowledge_base_ids: vec!["kb-rust".to_string()],
		..QaRequest::new(TENANT, "s-rag", "How does tokio schedule tasks")
	};
	let handle = harness.service.knowledge_qa(request).await.expect("Starting the answer failed.");

	assert_eq!(handle.pipeline(), Some(PipelineKind::RagStream));

	handle.wait().await.expect("Answer failed.");

	let events = drain(&mut rx);
	let references = events
		.iter()
		.find_map(|event| match &event.data {
			EventData::References { references } => Some(references.clone()),
			_ => None,
		})
		.expect("A references event must precede the answer.");

	assert!(references.iter().any(|result| result.content.contains("worker threads")));
	assert!(references.iter().all(|result| !result.content.contains("pasta")));
	assert_single_terminal(&events);

	let prompts = harness.chat.stream_prompts();
	let user_turn = prompts[0].last().expect("The prompt must end with the user turn.");

	assert_eq!(user_turn.role, Role::User);
	assert!(user_turn.content.contains("worker threads"));
	assert!(user_turn.content.contains("How does tokio schedule tasks"));

	let history = harness.service.context.get_context("s-rag").await.expect("History failed.");

	assert_eq!(history.len(), 2);
	assert_eq!(history[0].content, "How does tokio schedule tasks");
	assert_eq!(history[1].content, "Hello there.");
}

#[tokio::test]
async fn model_fallback_streams_one_completion() {
	let harness = Harness::new(test_config());

	harness.chat.stream(StreamScript::Frames(vec![
		StreamFrame::answer("Nothing on ", false),
		StreamFrame::answer("that topic.", true),
	]));

	let mut rx = harness.service.bus.subscribe("s-model");
	let request = QaRequest {
		knowledge_base_ids: vec!["kb-empty".to_string()],
		overrides: Some(ConversationOverrides {
			fallback_strategy: Some(FallbackStrategy::Model),
			fallback_prompt: Some("Apologize briefly: {{query}}".to_string()),
			..Default::default()
		}),
		..QaRequest::new(TENANT, "s-model", "weather tomorrow")
	};

	harness
		.service
		.knowledge_qa(request)
		.await
		.expect("Starting the answer failed.")
		.wait()
		.await
		.expect("Answer failed.");

	let events = drain(&mut rx);
	let terminals = terminal_answers(&events);

	assert_eq!(terminals.len(), 1);
	assert_eq!(terminals[0].content(), Some("that topic."));
	assert_single_terminal(&events);

	let prompts = harness.chat.stream_prompts();

	assert_eq!(prompts.len(), 1);
	assert_eq!(prompts[0][0].content, "Apologize briefly: weather tomorrow");
}

#[tokio::test]
async fn model_fallback_without_done_frame_ends_with_the_fixed_text() {
	let harness = Harness::new(test_config());
	let fallback = harness.service.cfg.conversation.fallback_response.clone();

	harness.chat.stream(StreamScript::Frames(vec![StreamFrame::answer("Nothing", false)]));

	let mut rx = harness.service.bus.subscribe("s-cut");
	let request = QaRequest {
		knowledge_base_ids: vec!["kb-empty".to_string()],
		overrides: Some(ConversationOverrides {
			fallback_strategy: Some(FallbackStrategy::Model),
			fallback_prompt: Some("Apologize: {{query}}".to_string()),
			..Default::default()
		}),
		..QaRequest::new(TENANT, "s-cut", "weather")
	};

	harness
		.service
		.knowledge_qa(request)
		.await
		.expect("Starting the answer failed.")
		.wait()
		.await
		.expect("Answer failed.");

	let events = drain(&mut rx);
	let terminals = terminal_answers(&events);

	assert_eq!(terminals.len(), 1);
	assert_eq!(terminals[0].content(), Some(fallback.as_str()));
	assert_single_terminal(&events);
}

#[tokio::test]
async fn model_fallback_that_cannot_start_uses_the_fixed_text() {
	let harness = Harness::new(test_config());
	let fallback = harness.service.cfg.conversation.fallback_response.clone();

	harness.chat.stream(StreamScript::Fails);

	let mut rx = harness.service.bus.subscribe("s-refused");
	let request = QaRequest {
		knowledge_base_ids: vec!["kb-empty".to_string()],
		overrides: Some(ConversationOverrides {
			fallback_strategy: Some(FallbackStrategy::Model),
			fallback_prompt: Some("Apologize: {{query}}".to_string()),
			..Default::default()
		}),
		..QaRequest::new(TENANT, "s-refused", "weather")
	};

	harness
		.service
		.knowledge_qa(request)
		.await
		.expect("Starting the answer failed.")
		.wait()
		.await
		.expect("Answer failed.");

	let events = drain(&mut rx);

	assert_eq!(terminal_answers(&events)[0].content(), Some(fallback.as_str()));
	assert_single_terminal(&events);
}

#[tokio::test]
async fn failing_stage_aborts_with_one_error_event() {
	let harness = Harness::new(test_config());
	let mut rx = harness.service.bus.subscribe("s-template");
	let request = QaRequest {
		overrides: Some(ConversationOverrides {
			context_template: Some("   ".to_string()),
			..Default::default()
		}),
		..QaRequest::new(TENANT, "s-template", "hello")
	};
	let outcome = harness
		.service
		.knowledge_qa_with(request, vec![EventType::IntoChatMessage, EventType::ChatCompletionStream])
		.await
		.expect("Starting the answer failed.")
		.wait()
		.await;

	assert!(matches!(outcome, Err(Error::Pipeline { kind: StageErrorKind::Template, .. })));

	let events = drain(&mut rx);
	let errors: Vec<_> = events.iter().filter(|event| event.kind == EventKind::Error).collect();

	assert_eq!(errors.len(), 1);
	assert!(errors[0].done);
	assert!(matches!(&errors[0].data, EventData::Error { stage, .. } if stage == "template"));
	assert!(terminal_answers(&events).is_empty());
	assert!(harness.chat.stream_prompts().is_empty());
}

#[tokio::test]
async fn stop_ends_a_streaming_answer_with_the_notice() {
	let harness = Harness::new(test_config());
	let notice = harness.service.cfg.agent.stop_notice.clone();

	harness.chat.stream(StreamScript::Held(vec![StreamFrame::answer("Partial", false)]));

	let mut rx = harness.service.bus.subscribe("s-stop");
	let handle = harness
		.service
		.knowledge_qa_with(
			QaRequest::new(TENANT, "s-stop", "tell me a long story"),
			vec![EventType::ChatCompletionStream],
		)
		.await
		.expect("Starting the answer failed.");
	let mut events = recv_until(&mut rx, EventKind::Answer).await;

	harness.service.bus.stop("s-stop", "user").await;
	handle.wait().await.expect("Stopping is not a failure.");
	events.extend(drain(&mut rx));

	let terminals = terminal_answers(&events);

	assert_eq!(terminals.len(), 1);
	assert_eq!(terminals[0].content(), Some(notice.as_str()));
	assert_single_terminal(&events);

	let history = harness.service.context.get_context("s-stop").await.expect("History failed.");

	assert!(history.is_empty(), "Stopped answers are not recorded.");
}

#[tokio::test]
async fn cancelled_handle_before_streaming_emits_the_notice() {
	let harness = Harness::new(test_config());
	let notice = harness.service.cfg.agent.stop_notice.clone();
	let mut rx = harness.service.bus.subscribe("s-early");

	harness.chat.reply(ChatResponse { content: "unused".to_string(), ..Default::default() });

	let handle = harness
		.service
		.knowledge_qa_with(
			QaRequest::new(TENANT, "s-early", "hello"),
			vec![EventType::LoadHistory, EventType::ChatCompletion],
		)
		.await
		.expect("Starting the answer failed.");

	handle.cancel();
	handle.wait().await.expect("Stopping is not a failure.");

	let events = drain(&mut rx);
	let terminals = terminal_answers(&events);

	assert_eq!(terminals.len(), 1);
	assert_single_terminal(&events);
	assert!(
		terminals[0].content() == Some(notice.as_str()) || terminals[0].content() == Some("unused"),
		"The request either stops first or completes normally."
	);
}

#[tokio::test]
async fn pipeline_follows_request_shape() {
	let harness = Harness::new(test_config());
	let plain = harness
		.service
		.knowledge_qa(QaRequest::new(TENANT, "s-shape", "hi"))
		.await
		.expect("Starting the answer failed.");

	assert_eq!(plain.pipeline(), Some(PipelineKind::ChatHistoryStream));

	plain.wait().await.expect("Answer failed.");

	let no_history = QaRequest {
		overrides: Some(ConversationOverrides { max_rounds: Some(0), ..Default::default() }),
		..QaRequest::new(TENANT, "s-shape-2", "hi")
	};
	let handle = harness.service.knowledge_qa(no_history).await.expect("Starting the answer failed.");

	assert_eq!(handle.pipeline(), Some(PipelineKind::ChatStream));

	handle.wait().await.expect("Answer failed.");

	let blank = harness.service.knowledge_qa(QaRequest::new(TENANT, "s-shape-3", " ")).await;

	assert!(matches!(blank, Err(Error::InvalidRequest { .. })));
}
