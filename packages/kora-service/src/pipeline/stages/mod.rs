//! Default stage plugins. Each handles one or more [`EventType`]s and calls `next` when done.

mod completion;
mod data_analysis;
mod entity;
mod filter;
mod history;
mod merge;
mod message;
mod rerank;
mod rewrite;
mod search;
mod stream;

pub use completion::ChatCompletion;
pub use data_analysis::DataAnalysis;
pub use entity::ExtractEntity;
pub use filter::FilterTopK;
pub use history::LoadHistory;
pub use merge::{ChunkMerge, merge_adjacent};
pub use message::{IntoChatMessage, render_contexts};
pub use rerank::ChunkRerank;
pub use rewrite::RewriteQuery;
pub use search::ChunkSearch;
pub use stream::ChatCompletionStream;

pub(crate) use stream::{AnswerRelay, RelayOutcome};

use std::sync::Arc;

use kora_config::Summary;
use kora_domain::chat::{ChatMessage, ChatOptions, Role};

use crate::pipeline::{ChatManage, EventManager, StageContext};

pub fn register_defaults(manager: &mut EventManager, ctx: Arc<StageContext>) {
	manager.register(Arc::new(LoadHistory::new(ctx.clone())));
	manager.register(Arc::new(RewriteQuery::new(ctx.clone())));
	manager.register(Arc::new(ExtractEntity::new(ctx.clone())));
	manager.register(Arc::new(ChunkSearch::new(ctx.clone())));
	manager.register(Arc::new(ChunkRerank::new(ctx.clone())));
	manager.register(Arc::new(ChunkMerge));
	manager.register(Arc::new(DataAnalysis::new(ctx.clone())));
	manager.register(Arc::new(FilterTopK));
	manager.register(Arc::new(IntoChatMessage));
	manager.register(Arc::new(ChatCompletion::new(ctx.clone())));
	manager.register(Arc::new(ChatCompletionStream::new(ctx)));
}

/// Replaces every `{{key}}` placeholder. Unknown placeholders are left alone.
pub fn render_template(template: &str, values: &[(&str, &str)]) -> String {
	let mut rendered = template.to_string();

	for (key, value) in values {
		rendered = rendered.replace(&format!("{{{{{key}}}}}"), value);
	}

	rendered
}

/// Drops a surrounding Markdown code fence, if the model added one.
pub fn strip_code_fence(text: &str) -> &str {
	let trimmed = text.trim();
	let Some(body) = trimmed.strip_prefix("```") else {
		return trimmed;
	};
	// The opening fence may carry a language tag.
	let body = body.split_once('\n').map_or("", |(_, rest)| rest);

	body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}

/// System prompt, folded history, then the user turn.
pub(crate) fn answer_messages(state: &ChatManage) -> Vec<ChatMessage> {
	let mut system = state.summary.prompt.trim().to_string();
	let mut messages = Vec::with_capacity(state.history.len() + 2);

	for message in &state.history {
		if message.role == Role::System {
			if !system.is_empty() {
				system.push_str("\n\n");
			}

			system.push_str(message.content.trim());
		} else {
			messages.push(message.clone());
		}
	}

	let user = if state.user_content.trim().is_empty() { &state.query } else { &state.user_content };

	messages.push(ChatMessage::user(user.clone()));

	if !system.is_empty() {
		messages.insert(0, ChatMessage::system(system));
	}

	messages
}

pub(crate) fn answer_options(summary: &Summary) -> ChatOptions {
	ChatOptions {
		temperature: Some(summary.temperature),
		max_completion_tokens: Some(summary.max_completion_tokens),
		thinking: Some(summary.thinking),
		tools: Vec::new(),
	}
}
