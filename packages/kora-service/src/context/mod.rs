pub mod store;

use std::{sync::Arc, time::Duration};

use time::OffsetDateTime;

use kora_config::{CompressionStrategy, ContextSettings, LlmProviderConfig};
use kora_domain::{
	chat::{self, ChatMessage, ChatOptions, Role},
	context::{ContextEntry, ContextStats},
};

use crate::{ChatModel, Result, context::store::ContextStore};

/// Per-session conversation memory with token-bounded compression.
pub struct ContextManager {
	settings: ContextSettings,
	store: Arc<dyn ContextStore>,
	chat: Arc<dyn ChatModel>,
	chat_cfg: LlmProviderConfig,
}
impl ContextManager {
	pub fn new(
		settings: ContextSettings,
		store: Arc<dyn ContextStore>,
		chat: Arc<dyn ChatModel>,
		chat_cfg: LlmProviderConfig,
	) -> Self {
		Self { settings, store, chat, chat_cfg }
	}

	pub fn settings(&self) -> &ContextSettings {
		&self.settings
	}

	pub async fn add_message(&self, session_id: &str, message: ChatMessage) -> Result<()> {
		self.add_messages(session_id, vec![message]).await
	}

	pub async fn add_messages(&self, session_id: &str, messages: Vec<ChatMessage>) -> Result<()> {
		let mut entry = self.load(session_id).await?;

		for message in messages {
			// The system prompt lives outside the turn list.
			if message.role == Role::System {
				entry.system_prompt = Some(message.content);
			} else {
				entry.messages.push(message);
			}
		}

		self.save(&mut entry).await
	}

	/// Messages ready for the model, compressing first when the session has grown past the
	/// summarize threshold.
	pub async fn get_context(&self, session_id: &str) -> Result<Vec<ChatMessage>> {
		let mut entry = self.load(session_id).await?;

		if entry.token_count() > self.settings.summarize_threshold {
			self.compress(&mut entry).await;
			self.save(&mut entry).await?;
		}

		Ok(entry.rendered())
	}

	pub async fn set_system_prompt(&self, session_id: &str, prompt: &str) -> Result<()> {
		let mut entry = self.load(session_id).await?;

		entry.system_prompt = Some(prompt.to_string()).filter(|prompt| !prompt.trim().is_empty());

		self.save(&mut entry).await
	}

	pub async fn get_context_stats(&self, session_id: &str) -> Result<ContextStats> {
		Ok(self.load(session_id).await?.stats())
	}

	pub async fn clear_context(&self, session_id: &str) -> Result<()> {
		self.store.delete(&context_key(session_id)).await
	}

	async fn load(&self, session_id: &str) -> Result<ContextEntry> {
		match self.store.get(&context_key(session_id)).await? {
			Some(bytes) => match serde_json::from_slice::<ContextEntry>(&bytes) {
				Ok(entry) => Ok(entry),
				Err(err) => {
					tracing::warn!(session_id, error = %err, "Stored context is unreadable; starting fresh.");

					Ok(ContextEntry::new(session_id))
				},
			},
			None => Ok(ContextEntry::new(session_id)),
		}
	}

	async fn save(&self, entry: &mut ContextEntry) -> Result<()> {
		entry.updated_at = OffsetDateTime::now_utc();

		let bytes = serde_json::to_vec(entry)?;
		let ttl = match self.settings.ttl_seconds {
			0 => None,
			seconds => Some(Duration::from_secs(seconds)),
		};

		self.store.set(&context_key(&entry.session_id), bytes, ttl).await
	}

	/// Keeps the most recent turns, folds older ones into the summary when the strategy asks
	/// for it, then drops the oldest turns until the budget fits. At least one turn survives.
	async fn compress(&self, entry: &mut ContextEntry) {
		let recent = self.settings.recent_message_count;
		let before = entry.messages.len();

		if entry.messages.len() > recent {
			let mut split = entry.messages.len() - recent;

			// A tool result cannot lead the window without the call that produced it.
			while split < entry.messages.len() && entry.messages[split].role == Role::Tool {
				split += 1;
			}

			let older: Vec<ChatMessage> = entry.messages.drain(..split).collect();

			if self.settings.compression_strategy == CompressionStrategy::Smart {
				match self.summarize(entry.summary.as_deref(), &older).await {
					Ok(summary) if !summary.trim().is_empty() => entry.summary = Some(summary),
					Ok(_) => tracing::warn!(
						session_id = %entry.session_id,
						"Summary came back empty; older turns were dropped."
					),
					Err(err) => tracing::warn!(
						session_id = %entry.session_id,
						error = %err,
						"Summarizing older turns failed; they were dropped."
					),
				}
			}

			entry.compressed = true;
		}

		while entry.token_count() > self.settings.max_tokens && entry.messages.len() > 1 {
			entry.messages.remove(0);

			entry.compressed = true;
		}

		if entry.messages.len() != before {
			tracing::info!(
				session_id = %entry.session_id,
				before,
				after = entry.messages.len(),
				tokens = entry.token_count(),
				"Session context compressed."
			);
		}
	}

	async fn summarize(&self, previous: Option<&str>, older: &[ChatMessage]) -> Result<String> {
		let mut transcript = String::new();

		if let Some(previous) = previous {
			transcript.push_str("Earlier summary:\n");
			transcript.push_str(previous);
			transcript.push_str("\n\n");
		}

		transcript.push_str(&chat::render_transcript(older));

		let messages =
			vec![ChatMessage::system(self.settings.summary_prompt.clone()), ChatMessage::user(transcript)];
		let opts = ChatOptions { temperature: Some(0.2), ..Default::default() };
		let response = self.chat.chat(&self.chat_cfg, &messages, &opts).await?;

		Ok(response.content.trim().to_string())
	}
}

pub fn context_key(session_id: &str) -> String {
	format!("context:{session_id}")
}
