use kora_config::{CompressionStrategy, ContextSettings};
use kora_domain::chat::{ChatMessage, ChatResponse, Role};

use super::{Harness, test_config};

fn harness(strategy: CompressionStrategy) -> Harness {
	let mut cfg = test_config();

	cfg.context = ContextSettings {
		compression_strategy: strategy,
		recent_message_count: 4,
		summarize_threshold: 10,
		..Default::default()
	};

	Harness::new(cfg)
}

async fn seed_turns(harness: &Harness, session_id: &str, turns: usize) {
	for index in 0..turns {
		let message = if index % 2 == 0 {
			ChatMessage::user(format!("question {index} about ownership"))
		} else {
			ChatMessage::assistant(format!("answer {index} about borrowing"))
		};

		harness.service.context.add_message(session_id, message).await.expect("Add failed.");
	}
}

#[tokio::test]
async fn smart_compression_keeps_recent_turns_plus_summary() {
	let harness = harness(CompressionStrategy::Smart);

	harness.chat.reply(ChatResponse {
		content: "They discussed ownership and borrowing.".to_string(),
		..Default::default()
	});
	seed_turns(&harness, "s-ctx", 12).await;

	let context = harness.service.context.get_context("s-ctx").await.expect("Context failed.");

	assert_eq!(context.len(), 5);
	assert_eq!(context[0].role, Role::System);
	assert!(context[0].content.contains("They discussed ownership and borrowing."));
	assert_eq!(context[4].content, "answer 11 about borrowing");
	assert_eq!(harness.chat.chat_calls(), 1);

	let stats = harness.service.context.get_context_stats("s-ctx").await.expect("Stats failed.");

	assert!(stats.is_compressed);
}

#[tokio::test]
async fn sliding_window_drops_older_turns_without_a_model_call() {
	let harness = harness(CompressionStrategy::SlidingWindow);

	seed_turns(&harness, "s-window", 12).await;

	let context = harness.service.context.get_context("s-window").await.expect("Context failed.");

	assert_eq!(context.len(), 4);
	assert_eq!(context[0].content, "question 8 about ownership");
	assert_eq!(harness.chat.chat_calls(), 0);
}

#[tokio::test]
async fn system_prompt_and_summary_share_one_leading_message() {
	let harness = harness(CompressionStrategy::Smart);

	harness.chat.reply(ChatResponse { content: "Earlier talk.".to_string(), ..Default::default() });
	harness
		.service
		.context
		.set_system_prompt("s-prompt", "Answer tersely.")
		.await
		.expect("Setting the prompt failed.");
	seed_turns(&harness, "s-prompt", 12).await;

	let context = harness.service.context.get_context("s-prompt").await.expect("Context failed.");

	assert_eq!(context.len(), 5);
	assert!(context[0].content.contains("Answer tersely."));
	assert!(context[0].content.contains("Earlier talk."));
	assert!(context[1..].iter().all(|message| message.role != Role::System));
}

#[tokio::test]
async fn cleared_sessions_start_empty() {
	let harness = harness(CompressionStrategy::Smart);

	seed_turns(&harness, "s-clear", 2).await;
	harness.service.clear_context("s-clear").await.expect("Clearing failed.");

	let context = harness.service.context.get_context("s-clear").await.expect("Context failed.");

	assert!(context.is_empty());
}
