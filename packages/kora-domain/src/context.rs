use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{
	chat::{ChatMessage, Role},
	tokens,
};

/// Persisted conversation state for one session.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ContextEntry {
	pub session_id: String,
	pub system_prompt: Option<String>,
	pub summary: Option<String>,
	pub messages: Vec<ChatMessage>,
	pub compressed: bool,
	#[serde(with = "time::serde::rfc3339")]
	pub updated_at: OffsetDateTime,
}
impl ContextEntry {
	pub fn new(session_id: &str) -> Self {
		Self {
			session_id: session_id.to_string(),
			system_prompt: None,
			summary: None,
			messages: Vec::new(),
			compressed: false,
			updated_at: OffsetDateTime::now_utc(),
		}
	}

	/// System prompt and summary folded into one leading turn.
	pub fn leading_system_message(&self) -> Option<ChatMessage> {
		let content = match (&self.system_prompt, &self.summary) {
			(None, None) => return None,
			(Some(prompt), None) => prompt.clone(),
			(None, Some(summary)) => format!("Summary of the earlier conversation:\n{summary}"),
			(Some(prompt), Some(summary)) =>
				format!("{prompt}\n\nSummary of the earlier conversation:\n{summary}"),
		};

		Some(ChatMessage::new(Role::System, content))
	}

	/// Messages as handed to the model: the leading system turn, then stored turns.
	pub fn rendered(&self) -> Vec<ChatMessage> {
		let mut rendered = Vec::with_capacity(self.messages.len() + 1);

		rendered.extend(self.leading_system_message());
		rendered.extend(self.messages.iter().cloned());

		rendered
	}

	pub fn token_count(&self) -> usize {
		tokens::estimate_messages(&self.rendered())
	}

	pub fn stats(&self) -> ContextStats {
		let rendered = self.rendered();

		ContextStats {
			message_count: rendered.len(),
			token_count: tokens::estimate_messages(&rendered),
			is_compressed: self.compressed,
		}
	}
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct ContextStats {
	pub message_count: usize,
	pub token_count: usize,
	pub is_compressed: bool,
}
