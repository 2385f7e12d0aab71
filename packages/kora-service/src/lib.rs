pub mod agent;
pub mod analysis;
pub mod bus;
pub mod cancel;
pub mod catalog;
pub mod context;
pub mod indexing;
pub mod pipeline;
pub mod pool;
pub mod qa;
pub mod retrieval;

mod error;

pub use error::{Error, Result};
pub use qa::{ConversationOverrides, QaHandle, QaRequest};

use std::{future::Future, pin::Pin, sync::Arc};

use serde_json::Value;
use tokio::sync::mpsc;

use kora_config::{Config, EmbeddingProviderConfig, ExternalTool, LlmProviderConfig, ProviderConfig};
use kora_domain::chat::{ChatMessage, ChatOptions, ChatResponse, StreamFrame};
use kora_providers::{embedding, rerank, web_search::WebSearchHit};

use crate::{
	agent::tools::AgentTool,
	analysis::TabularEngine,
	bus::EventBus,
	catalog::{ChunkRepository, GraphStore, KnowledgeCatalog, MemoryChunkRepository, StaticCatalog},
	context::{ContextManager, store::{ContextStore, MemoryContextStore}},
	pipeline::{EventManager, StageContext, stages},
	pool::WorkerPool,
	retrieval::{RetrievalEngine, registry::BackendRegistry},
};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub trait EmbeddingProvider
where
	Self: Send + Sync,
{
	fn embed<'a>(
		&'a self,
		cfg: &'a EmbeddingProviderConfig,
		texts: &'a [String],
	) -> BoxFuture<'a, color_eyre::Result<Vec<Vec<f32>>>>;
}

pub trait RerankProvider
where
	Self: Send + Sync,
{
	fn rerank<'a>(
		&'a self,
		cfg: &'a ProviderConfig,
		query: &'a str,
		docs: &'a [String],
	) -> BoxFuture<'a, color_eyre::Result<Vec<f32>>>;
}

pub trait ChatModel
where
	Self: Send + Sync,
{
	fn chat<'a>(
		&'a self,
		cfg: &'a LlmProviderConfig,
		messages: &'a [ChatMessage],
		opts: &'a ChatOptions,
	) -> BoxFuture<'a, color_eyre::Result<ChatResponse>>;

	/// Frames arrive in order; the series ends with a `done` frame or when the channel closes.
	fn chat_stream<'a>(
		&'a self,
		cfg: &'a LlmProviderConfig,
		messages: &'a [ChatMessage],
		opts: &'a ChatOptions,
		capacity: usize,
	) -> BoxFuture<'a, color_eyre::Result<mpsc::Receiver<StreamFrame>>>;
}

pub trait WebSearchProvider
where
	Self: Send + Sync,
{
	fn search<'a>(
		&'a self,
		cfg: &'a ProviderConfig,
		query: &'a str,
		max_results: u32,
	) -> BoxFuture<'a, color_eyre::Result<Vec<WebSearchHit>>>;
}

pub trait ToolInvoker
where
	Self: Send + Sync,
{
	fn invoke<'a>(
		&'a self,
		cfg: &'a ExternalTool,
		arguments: &'a Value,
	) -> BoxFuture<'a, color_eyre::Result<String>>;
}

#[derive(Clone)]
pub struct Providers {
	pub embedding: Arc<dyn EmbeddingProvider>,
	pub rerank: Arc<dyn RerankProvider>,
	pub chat: Arc<dyn ChatModel>,
	pub web_search: Arc<dyn WebSearchProvider>,
	pub tools: Arc<dyn ToolInvoker>,
}
impl Providers {
	pub fn new(
		embedding: Arc<dyn EmbeddingProvider>,
		rerank: Arc<dyn RerankProvider>,
		chat: Arc<dyn ChatModel>,
	) -> Self {
		let defaults = Arc::new(DefaultProviders);

		Self { embedding, rerank, chat, web_search: defaults.clone(), tools: defaults }
	}

	pub fn with_web_search(mut self, web_search: Arc<dyn WebSearchProvider>) -> Self {
		self.web_search = web_search;

		self
	}

	pub fn with_tool_invoker(mut self, tools: Arc<dyn ToolInvoker>) -> Self {
		self.tools = tools;

		self
	}
}
impl Default for Providers {
	fn default() -> Self {
		let provider = Arc::new(DefaultProviders);

		Self {
			embedding: provider.clone(),
			rerank: provider.clone(),
			chat: provider.clone(),
			web_search: provider.clone(),
			tools: provider,
		}
	}
}

/// Everything the service needs from outside the answering core.
pub struct Collaborators {
	pub backends: BackendRegistry,
	pub context_store: Arc<dyn ContextStore>,
	pub catalog: Arc<dyn KnowledgeCatalog>,
	pub chunks: Arc<dyn ChunkRepository>,
	pub graph: Option<Arc<dyn GraphStore>>,
	pub tools: Vec<Arc<dyn AgentTool>>,
}
impl Collaborators {
	pub fn new(backends: BackendRegistry) -> Self {
		Self {
			backends,
			context_store: Arc::new(MemoryContextStore::default()),
			catalog: Arc::new(StaticCatalog::default()),
			chunks: Arc::new(MemoryChunkRepository::default()),
			graph: None,
			tools: Vec::new(),
		}
	}

	pub fn with_context_store(mut self, store: Arc<dyn ContextStore>) -> Self {
		self.context_store = store;

		self
	}

	pub fn with_catalog(mut self, catalog: Arc<dyn KnowledgeCatalog>) -> Self {
		self.catalog = catalog;

		self
	}

	pub fn with_chunk_repository(mut self, chunks: Arc<dyn ChunkRepository>) -> Self {
		self.chunks = chunks;

		self
	}

	pub fn with_graph_store(mut self, graph: Arc<dyn GraphStore>) -> Self {
		self.graph = Some(graph);

		self
	}

	pub fn with_tool(mut self, tool: Arc<dyn AgentTool>) -> Self {
		self.tools.push(tool);

		self
	}
}

pub struct KoraService {
	pub cfg: Arc<Config>,
	pub providers: Providers,
	pub bus: Arc<EventBus>,
	pub retrieval: Arc<RetrievalEngine>,
	pub context: Arc<ContextManager>,
	pub catalog: Arc<dyn KnowledgeCatalog>,
	pub chunks: Arc<dyn ChunkRepository>,
	pub graph: Option<Arc<dyn GraphStore>>,
	pub tabular: Arc<TabularEngine>,
	pub pool: WorkerPool,
	pub(crate) pipeline: EventManager,
	pub(crate) stages: Arc<StageContext>,
	pub(crate) tools: Vec<Arc<dyn AgentTool>>,
}
impl KoraService {
	pub fn new(cfg: Config, collaborators: Collaborators) -> Self {
		Self::with_providers(cfg, Providers::default(), collaborators)
	}

	pub fn with_providers(cfg: Config, providers: Providers, collaborators: Collaborators) -> Self {
		let cfg = Arc::new(cfg);
		let pool = WorkerPool::new(cfg.service.worker_concurrency);
		let bus = Arc::new(EventBus::new(cfg.service.stream_channel_capacity));
		let retrieval = Arc::new(RetrievalEngine::new(
			cfg.clone(),
			collaborators.backends,
			providers.clone(),
			pool.clone(),
		));
		let context = Arc::new(ContextManager::new(
			cfg.context.clone(),
			collaborators.context_store,
			providers.chat.clone(),
			cfg.providers.chat.clone(),
		));
		let tabular = Arc::new(TabularEngine::default());
		let stage_context = Arc::new(StageContext {
			cfg: cfg.clone(),
			providers: providers.clone(),
			retrieval: retrieval.clone(),
			context: context.clone(),
			catalog: collaborators.catalog.clone(),
			graph: collaborators.graph.clone(),
			tabular: tabular.clone(),
		});
		let mut pipeline = EventManager::new();

		stages::register_defaults(&mut pipeline, stage_context.clone());

		Self {
			cfg,
			providers,
			bus,
			retrieval,
			context,
			catalog: collaborators.catalog,
			chunks: collaborators.chunks,
			graph: collaborators.graph,
			tabular,
			pool,
			pipeline,
			stages: stage_context,
			tools: collaborators.tools,
		}
	}
}

struct DefaultProviders;
impl EmbeddingProvider for DefaultProviders {
	fn embed<'a>(
		&'a self,
		cfg: &'a EmbeddingProviderConfig,
		texts: &'a [String],
	) -> BoxFuture<'a, color_eyre::Result<Vec<Vec<f32>>>> {
		Box::pin(embedding::embed(cfg, texts))
	}
}
impl RerankProvider for DefaultProviders {
	fn rerank<'a>(
		&'a self,
		cfg: &'a ProviderConfig,
		query: &'a str,
		docs: &'a [String],
	) -> BoxFuture<'a, color_eyre::Result<Vec<f32>>> {
		Box::pin(rerank::rerank(cfg, query, docs))
	}
}
impl ChatModel for DefaultProviders {
	fn chat<'a>(
		&'a self,
		cfg: &'a LlmProviderConfig,
		messages: &'a [ChatMessage],
		opts: &'a ChatOptions,
	) -> BoxFuture<'a, color_eyre::Result<ChatResponse>> {
		Box::pin(kora_providers::chat::chat(cfg, messages, opts))
	}

	fn chat_stream<'a>(
		&'a self,
		cfg: &'a LlmProviderConfig,
		messages: &'a [ChatMessage],
		opts: &'a ChatOptions,
		capacity: usize,
	) -> BoxFuture<'a, color_eyre::Result<mpsc::Receiver<StreamFrame>>> {
		Box::pin(kora_providers::chat::chat_stream(cfg, messages, opts, capacity))
	}
}
impl WebSearchProvider for DefaultProviders {
	fn search<'a>(
		&'a self,
		cfg: &'a ProviderConfig,
		query: &'a str,
		max_results: u32,
	) -> BoxFuture<'a, color_eyre::Result<Vec<WebSearchHit>>> {
		Box::pin(kora_providers::web_search::search(cfg, query, max_results))
	}
}
impl ToolInvoker for DefaultProviders {
	fn invoke<'a>(
		&'a self,
		cfg: &'a ExternalTool,
		arguments: &'a Value,
	) -> BoxFuture<'a, color_eyre::Result<String>> {
		Box::pin(kora_providers::tool::invoke(cfg, arguments))
	}
}
