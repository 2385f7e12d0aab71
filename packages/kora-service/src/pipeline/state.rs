use std::sync::Arc;

use tokio::task::JoinHandle;

use kora_config::{Config, Conversation, FallbackStrategy, Summary};
use kora_domain::{
	chat::ChatMessage,
	search::{SearchResult, SearchTarget, Thresholds},
};

use crate::{
	bus::{EventBus, StopGuard},
	cancel::CancelToken,
};

#[derive(Clone, Debug, PartialEq)]
pub struct RetrievalSettings {
	pub keyword_threshold: f32,
	pub vector_threshold: f32,
	pub embedding_top_k: u32,
	pub rerank_top_k: u32,
	pub rerank_threshold: f32,
	pub enable_rewrite: bool,
	pub enable_rerank: bool,
	pub max_rounds: u32,
}
impl RetrievalSettings {
	pub fn thresholds(&self) -> Thresholds {
		Thresholds { keyword: self.keyword_threshold, vector: self.vector_threshold }
	}
}
impl From<&Conversation> for RetrievalSettings {
	fn from(conversation: &Conversation) -> Self {
		Self {
			keyword_threshold: conversation.keyword_threshold,
			vector_threshold: conversation.vector_threshold,
			embedding_top_k: conversation.embedding_top_k,
			rerank_top_k: conversation.rerank_top_k,
			rerank_threshold: conversation.rerank_threshold,
			enable_rewrite: conversation.enable_rewrite,
			enable_rerank: conversation.enable_rerank,
			max_rounds: conversation.max_rounds,
		}
	}
}

#[derive(Clone, Debug, PartialEq)]
pub struct FallbackSettings {
	pub strategy: FallbackStrategy,
	pub response: String,
	/// `{{query}}` is replaced with the user question.
	pub prompt: Option<String>,
}
impl From<&Conversation> for FallbackSettings {
	fn from(conversation: &Conversation) -> Self {
		Self {
			strategy: conversation.fallback_strategy,
			response: conversation.fallback_response.clone(),
			prompt: conversation.fallback_prompt.clone(),
		}
	}
}

/// Mutable state one request carries through its pipeline.
pub struct ChatManage {
	pub tenant_id: String,
	pub session_id: String,
	pub query: String,
	pub rewrite_query: String,
	pub user_content: String,
	pub history: Vec<ChatMessage>,
	pub knowledge_base_ids: Vec<String>,
	pub knowledge_ids: Vec<String>,
	pub search_targets: Vec<SearchTarget>,
	pub web_search_enabled: bool,
	pub retrieval: RetrievalSettings,
	pub summary: Summary,
	pub fallback: FallbackSettings,
	pub entities: Vec<String>,
	pub search_result: Vec<SearchResult>,
	pub rerank_result: Vec<SearchResult>,
	pub merge_result: Vec<SearchResult>,
	/// Set by the non-streaming completion stage.
	pub answer: Option<String>,
	pub bus: Arc<EventBus>,
	pub cancel: CancelToken,
	/// Streaming completions keep running here after the pipeline returns.
	pub stream_task: Option<JoinHandle<()>>,
	pub(crate) stop_guard: Option<StopGuard>,
}
impl ChatManage {
	pub fn new(
		cfg: &Config,
		tenant_id: &str,
		session_id: &str,
		query: &str,
		bus: Arc<EventBus>,
		cancel: CancelToken,
	) -> Self {
		let conversation = &cfg.conversation;

		Self {
			tenant_id: tenant_id.to_string(),
			session_id: session_id.to_string(),
			query: query.to_string(),
			rewrite_query: String::new(),
			user_content: String::new(),
			history: Vec::new(),
			knowledge_base_ids: Vec::new(),
			knowledge_ids: Vec::new(),
			search_targets: Vec::new(),
			web_search_enabled: false,
			retrieval: RetrievalSettings::from(conversation),
			summary: conversation.summary.clone(),
			fallback: FallbackSettings::from(conversation),
			entities: Vec::new(),
			search_result: Vec::new(),
			rerank_result: Vec::new(),
			merge_result: Vec::new(),
			answer: None,
			bus,
			cancel,
			stream_task: None,
			stop_guard: None,
		}
	}

	/// The rewritten query when rewriting produced one.
	pub fn search_query(&self) -> &str {
		if self.rewrite_query.trim().is_empty() { &self.query } else { &self.rewrite_query }
	}

	/// Ranked results from the furthest stage that produced any.
	pub fn best_results(&self) -> &[SearchResult] {
		if !self.merge_result.is_empty() {
			&self.merge_result
		} else if !self.rerank_result.is_empty() {
			&self.rerank_result
		} else {
			&self.search_result
		}
	}

	/// Hands the stop watch to a task that outlives the pipeline.
	pub(crate) fn take_stop_guard(&mut self) -> Option<StopGuard> {
		self.stop_guard.take()
	}
}
