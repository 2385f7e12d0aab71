pub mod stages;

mod state;

pub use state::{ChatManage, FallbackSettings, RetrievalSettings};

use std::{collections::HashMap, fmt, future::Future, sync::Arc};

use kora_config::Config;

use crate::{
	BoxFuture, Providers,
	analysis::TabularEngine,
	cancel::CancelToken,
	catalog::{GraphStore, KnowledgeCatalog},
	context::ContextManager,
	retrieval::RetrievalEngine,
};

/// Stages a pipeline can trigger. Each maps to zero or more registered plugins.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventType {
	LoadHistory,
	RewriteQuery,
	ExtractEntity,
	ChunkSearch,
	ChunkSearchParallel,
	ChunkRerank,
	ChunkMerge,
	DataAnalysis,
	FilterTopK,
	IntoChatMessage,
	ChatCompletion,
	ChatCompletionStream,
}
impl EventType {
	pub fn as_str(self) -> &'static str {
		match self {
			Self::LoadHistory => "load_history",
			Self::RewriteQuery => "rewrite_query",
			Self::ExtractEntity => "extract_entity",
			Self::ChunkSearch => "chunk_search",
			Self::ChunkSearchParallel => "chunk_search_parallel",
			Self::ChunkRerank => "chunk_rerank",
			Self::ChunkMerge => "chunk_merge",
			Self::DataAnalysis => "data_analysis",
			Self::FilterTopK => "filter_top_k",
			Self::IntoChatMessage => "into_chat_message",
			Self::ChatCompletion => "chat_completion",
			Self::ChatCompletionStream => "chat_completion_stream",
		}
	}
}
impl fmt::Display for EventType {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineKind {
	Chat,
	ChatStream,
	ChatHistoryStream,
	Rag,
	RagStream,
	Search,
}
impl PipelineKind {
	pub fn events(self) -> &'static [EventType] {
		use EventType::*;

		match self {
			Self::Chat => &[ChatCompletion],
			Self::ChatStream => &[ChatCompletionStream],
			Self::ChatHistoryStream => &[LoadHistory, ChatCompletionStream],
			Self::Rag =>
				&[ChunkSearch, ChunkRerank, ChunkMerge, FilterTopK, IntoChatMessage, ChatCompletion],
			Self::RagStream => &[
				RewriteQuery,
				ChunkSearchParallel,
				ChunkRerank,
				ChunkMerge,
				DataAnalysis,
				FilterTopK,
				IntoChatMessage,
				ChatCompletionStream,
			],
			Self::Search => &[ChunkSearch, ChunkRerank, ChunkMerge, FilterTopK],
		}
	}

	pub fn as_str(self) -> &'static str {
		match self {
			Self::Chat => "chat",
			Self::ChatStream => "chat_stream",
			Self::ChatHistoryStream => "chat_history_stream",
			Self::Rag => "rag",
			Self::RagStream => "rag_stream",
			Self::Search => "search",
		}
	}
}

/// Plain chat when there is nothing to retrieve from, retrieval-augmented otherwise.
pub fn select_pipeline(
	knowledge_base_ids: &[String],
	knowledge_ids: &[String],
	web_search_enabled: bool,
	max_rounds: u32,
) -> PipelineKind {
	if knowledge_base_ids.is_empty() && knowledge_ids.is_empty() && !web_search_enabled {
		if max_rounds > 0 { PipelineKind::ChatHistoryStream } else { PipelineKind::ChatStream }
	} else {
		PipelineKind::RagStream
	}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StageErrorKind {
	History,
	Rewrite,
	Search,
	Rerank,
	Merge,
	DataAnalysis,
	Template,
	ModelCall,
	EntityExtraction,
}
impl StageErrorKind {
	pub fn as_str(self) -> &'static str {
		match self {
			Self::History => "history",
			Self::Rewrite => "rewrite",
			Self::Search => "search",
			Self::Rerank => "rerank",
			Self::Merge => "merge",
			Self::DataAnalysis => "data_analysis",
			Self::Template => "template",
			Self::ModelCall => "model_call",
			Self::EntityExtraction => "entity_extraction",
		}
	}
}
impl fmt::Display for StageErrorKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

#[derive(Debug, thiserror::Error)]
pub enum PluginError {
	/// Retrieval found nothing usable; the orchestrator answers with the fallback.
	#[error("No relevant results were found.")]
	SearchNothing,
	#[error("Request was cancelled.")]
	Cancelled,
	#[error("{kind} stage failed: {description}")]
	Stage {
		kind: StageErrorKind,
		description: String,
		#[source]
		source: Option<crate::Error>,
	},
}
impl PluginError {
	pub fn stage(kind: StageErrorKind, description: impl Into<String>, source: crate::Error) -> Self {
		Self::Stage { kind, description: description.into(), source: Some(source) }
	}
}

pub type PluginResult = Result<(), PluginError>;

/// A stage handler. It may act before and after delegating to `next`, or skip the rest of the
/// chain for this event by not calling it.
pub trait Plugin
where
	Self: Send + Sync,
{
	fn name(&self) -> &'static str;

	fn activation_events(&self) -> &'static [EventType];

	fn on_event<'a>(
		&'a self,
		event: EventType,
		state: &'a mut ChatManage,
		next: Next<'a>,
	) -> BoxFuture<'a, PluginResult>;
}

/// The remaining handlers for the current event.
pub struct Next<'a> {
	event: EventType,
	handlers: &'a [Arc<dyn Plugin>],
}
impl<'a> Next<'a> {
	pub fn run(self, state: &'a mut ChatManage) -> BoxFuture<'a, PluginResult> {
		Box::pin(async move {
			match self.handlers.split_first() {
				Some((head, rest)) =>
					head.on_event(self.event, state, Next { event: self.event, handlers: rest }).await,
				None => Ok(()),
			}
		})
	}
}

/// Registered plugins keyed by the events they handle, in registration order.
#[derive(Default)]
pub struct EventManager {
	handlers: HashMap<EventType, Vec<Arc<dyn Plugin>>>,
}
impl EventManager {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn register(&mut self, plugin: Arc<dyn Plugin>) {
		for event in plugin.activation_events() {
			self.handlers.entry(*event).or_default().push(plugin.clone());
		}
	}

	pub fn handler_count(&self, event: EventType) -> usize {
		self.handlers.get(&event).map_or(0, Vec::len)
	}

	pub async fn trigger(&self, event: EventType, state: &mut ChatManage) -> PluginResult {
		let handlers = self.handlers.get(&event).map(Vec::as_slice).unwrap_or(&[]);

		if handlers.is_empty() {
			tracing::debug!(event = %event, "No plugin handles this event.");

			return Ok(());
		}

		Next { event, handlers }.run(state).await
	}

	/// Triggers `events` in order, stopping at the first error or cancellation.
	pub async fn run(&self, events: &[EventType], state: &mut ChatManage) -> PluginResult {
		for event in events {
			if state.cancel.is_cancelled() {
				return Err(PluginError::Cancelled);
			}

			tracing::debug!(event = %event, session_id = %state.session_id, "Pipeline stage started.");

			self.trigger(*event, state).await?;
		}

		Ok(())
	}
}

/// Shared handles every stage plugin reads from.
pub struct StageContext {
	pub cfg: Arc<Config>,
	pub providers: Providers,
	pub retrieval: Arc<RetrievalEngine>,
	pub context: Arc<ContextManager>,
	pub catalog: Arc<dyn KnowledgeCatalog>,
	pub graph: Option<Arc<dyn GraphStore>>,
	pub tabular: Arc<TabularEngine>,
}

/// Races `job` against cancellation of the request.
pub(crate) async fn cancellable<F>(cancel: &CancelToken, job: F) -> Result<F::Output, PluginError>
where
	F: Future,
{
	tokio::select! {
		biased;
		_ = cancel.cancelled() => Err(PluginError::Cancelled),
		output = job => Ok(output),
	}
}
