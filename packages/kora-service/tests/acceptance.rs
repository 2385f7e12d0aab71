mod acceptance {
	mod agent;
	mod context;
	mod indexing;
	mod pipeline;
	mod retrieval;

	use std::{
		collections::{HashMap, VecDeque},
		sync::{
			Arc, Mutex,
			atomic::{AtomicUsize, Ordering},
		},
		time::Duration,
	};

	use serde_json::Map;
	use tokio::sync::mpsc;

	use kora_config::{
		Agent, Config, ContextSettings, Conversation, EmbeddingProviderConfig, FailurePolicy,
		LlmProviderConfig, ProviderConfig, Providers as ProviderConfigs, Retrieval,
		RetrievalDriver, Service, Storage,
	};
	use kora_domain::{
		chat::{ChatMessage, ChatOptions, ChatResponse, StreamFrame},
		event::{EventKind, StreamEvent},
		index::EmbeddedUnit,
		search::{ChunkType, KnowledgeBaseType, MatchType, SearchResult},
	};
	use kora_service::{
		BoxFuture, ChatModel, Collaborators, EmbeddingProvider, Error, KoraService, Providers,
		RerankProvider, Result,
		agent::AgentTool,
		catalog::{GraphStore, KnowledgeInfo, MemoryChunkRepository, StaticCatalog},
		retrieval::{
			BackendQuery, RetrievalBackend, memory::MemoryBackend, registry::BackendRegistry,
		},
	};

	pub const TENANT: &str = "tenant-a";
	pub const VECTOR_DIM: u32 = 4;

	const TOPICS: [&str; 3] = ["rust", "tokio", "cooking"];

	/// One axis per topic word plus a catch-all axis, so unrelated text is orthogonal.
	pub struct TopicEmbedding;
	impl EmbeddingProvider for TopicEmbedding {
		fn embed<'a>(
			&'a self,
			_cfg: &'a EmbeddingProviderConfig,
			texts: &'a [String],
		) -> BoxFuture<'a, color_eyre::Result<Vec<Vec<f32>>>> {
			Box::pin(async move { Ok(texts.iter().map(|text| topic_vector(text)).collect()) })
		}
	}

	fn topic_vector(text: &str) -> Vec<f32> {
		let lower = text.to_lowercase();
		let mut vector: Vec<f32> =
			TOPICS.iter().map(|topic| if lower.contains(topic) { 1.0 } else { 0.0 }).collect();
		let other = if vector.iter().all(|value| *value == 0.0) { 1.0 } else { 0.0 };

		vector.push(other);

		vector
	}

	pub struct FlatRerank;
	impl RerankProvider for FlatRerank {
		fn rerank<'a>(
			&'a self,
			_cfg: &'a ProviderConfig,
			_query: &'a str,
			docs: &'a [String],
		) -> BoxFuture<'a, color_eyre::Result<Vec<f32>>> {
			Box::pin(async move { Ok(vec![0.9; docs.len()]) })
		}
	}

	pub enum StreamScript {
		Frames(Vec<StreamFrame>),
		/// Sends the frames and keeps the channel open until the test ends.
		Held(Vec<StreamFrame>),
		Fails,
	}

	/// Replays queued responses. Blocking calls fall back to `repeat`, streams to a two-frame
	/// answer.
	#[derive(Default)]
	pub struct ScriptedChat {
		replies: Mutex<VecDeque<ChatResponse>>,
		repeat: Mutex<Option<ChatResponse>>,
		streams: Mutex<VecDeque<StreamScript>>,
		held: Mutex<Vec<mpsc::Sender<StreamFrame>>>,
		stream_prompts: Mutex<Vec<Vec<ChatMessage>>>,
		pub chat_calls: AtomicUsize,
	}
	impl ScriptedChat {
		pub fn reply(&self, response: ChatResponse) {
			self.replies.lock().expect("Reply lock failed.").push_back(response);
		}

		pub fn repeat(&self, response: ChatResponse) {
			*self.repeat.lock().expect("Repeat lock failed.") = Some(response);
		}

		pub fn stream(&self, script: StreamScript) {
			self.streams.lock().expect("Stream lock failed.").push_back(script);
		}

		pub fn stream_prompts(&self) -> Vec<Vec<ChatMessage>> {
			self.stream_prompts.lock().expect("Prompt lock failed.").clone()
		}

		pub fn chat_calls(&self) -> usize {
			self.chat_calls.load(Ordering::SeqCst)
		}
	}
	impl ChatModel for ScriptedChat {
		fn chat<'a>(
			&'a self,
			_cfg: &'a LlmProviderConfig,
			_messages: &'a [ChatMessage],
			_opts: &'a ChatOptions,
		) -> BoxFuture<'a, color_eyre::Result<ChatResponse>> {
			self.chat_calls.fetch_add(1, Ordering::SeqCst);

			let queued = self.replies.lock().expect("Reply lock failed.").pop_front();
			let response = queued
				.or_else(|| self.repeat.lock().expect("Repeat lock failed.").clone())
				.unwrap_or_else(|| ChatResponse { content: "ok".to_string(), ..Default::default() });

			Box::pin(async move { Ok(response) })
		}

		fn chat_stream<'a>(
			&'a self,
			_cfg: &'a LlmProviderConfig,
			messages: &'a [ChatMessage],
			_opts: &'a ChatOptions,
			capacity: usize,
		) -> BoxFuture<'a, color_eyre::Result<mpsc::Receiver<StreamFrame>>> {
			self.stream_prompts.lock().expect("Prompt lock failed.").push(messages.to_vec());

			let script = self.streams.lock().expect("Stream lock failed.").pop_front().unwrap_or_else(
				|| {
					StreamScript::Frames(vec![
						StreamFrame::answer("Hello", false),
						StreamFrame::answer(" there.", true),
					])
				},
			);
			let (tx, rx) = mpsc::channel(capacity);
			let (frames, hold) = match script {
				StreamScript::Frames(frames) => (frames, false),
				StreamScript::Held(frames) => (frames, true),
				StreamScript::Fails =>
					return Box::pin(async { Err(color_eyre::eyre::eyre!("Stream refused.")) }),
			};

			for frame in frames {
				tx.try_send(frame).expect("Scripted frames must fit the channel.");
			}

			if hold {
				self.held.lock().expect("Held lock failed.").push(tx);
			}

			Box::pin(async move { Ok(rx) })
		}
	}

	/// Fails every search and write; deletes succeed.
	pub struct FailingBackend {
		driver: RetrievalDriver,
		pub calls: AtomicUsize,
	}
	impl FailingBackend {
		pub fn new(driver: RetrievalDriver) -> Self {
			Self { driver, calls: AtomicUsize::new(0) }
		}
	}
	impl RetrievalBackend for FailingBackend {
		fn driver(&self) -> RetrievalDriver {
			self.driver
		}

		fn search<'a>(
			&'a self,
			_tenant_id: &'a str,
			_query: &'a BackendQuery<'a>,
		) -> BoxFuture<'a, Result<Vec<SearchResult>>> {
			self.calls.fetch_add(1, Ordering::SeqCst);

			Box::pin(async { Err(Error::Storage { message: "connection reset".to_string() }) })
		}

		fn batch_index<'a>(
			&'a self,
			_tenant_id: &'a str,
			_units: &'a [EmbeddedUnit],
		) -> BoxFuture<'a, Result<()>> {
			self.calls.fetch_add(1, Ordering::SeqCst);

			Box::pin(async { Err(Error::Storage { message: "disk full".to_string() }) })
		}

		fn delete_by_source_ids<'a>(
			&'a self,
			_tenant_id: &'a str,
			_source_ids: &'a [String],
			_embedding_dim: u32,
			_kb_type: KnowledgeBaseType,
		) -> BoxFuture<'a, Result<()>> {
			Box::pin(async { Ok(()) })
		}
	}

	/// Returns fixed hits for any entity list and records every lookup.
	pub struct StubGraph {
		hits: Vec<SearchResult>,
		lookups: Mutex<Vec<Vec<String>>>,
	}
	impl StubGraph {
		pub fn new(hits: Vec<SearchResult>) -> Self {
			Self { hits, lookups: Mutex::new(Vec::new()) }
		}

		pub fn lookups(&self) -> Vec<Vec<String>> {
			self.lookups.lock().expect("Lookup lock failed.").clone()
		}
	}
	impl GraphStore for StubGraph {
		fn related_chunks<'a>(
			&'a self,
			_tenant_id: &'a str,
			_knowledge_base_ids: &'a [String],
			entities: &'a [String],
			_top_k: u32,
		) -> BoxFuture<'a, Result<Vec<SearchResult>>> {
			self.lookups.lock().expect("Lookup lock failed.").push(entities.to_vec());

			let hits = self.hits.clone();

			Box::pin(async move { Ok(hits) })
		}
	}

	/// A graph neighbour in `knowledge_base_id`, reported with a vector match type.
	pub fn graph_hit(knowledge_base_id: &str, knowledge_id: &str, content: &str) -> SearchResult {
		SearchResult {
			id: format!("{knowledge_id}-g"),
			content: content.to_string(),
			knowledge_id: knowledge_id.to_string(),
			knowledge_base_id: knowledge_base_id.to_string(),
			chunk_id: format!("{knowledge_id}-g"),
			chunk_index: 7,
			knowledge_title: format!("{knowledge_id} title"),
			knowledge_filename: format!("{knowledge_id}.md"),
			chunk_type: ChunkType::Text,
			match_type: MatchType::Vector,
			score: 0.8,
		}
	}

	pub struct Harness {
		pub service: Arc<KoraService>,
		pub chat: Arc<ScriptedChat>,
		pub memory: Arc<MemoryBackend>,
		pub catalog: Arc<StaticCatalog>,
		pub chunks: Arc<MemoryChunkRepository>,
	}
	impl Harness {
		pub fn new(cfg: Config) -> Self {
			Self::with_backends(cfg, Vec::new())
		}

		pub fn with_backends(cfg: Config, extra: Vec<Arc<dyn RetrievalBackend>>) -> Self {
			Self::with_parts(cfg, extra, Vec::new(), None)
		}

		pub fn with_tools(cfg: Config, tools: Vec<Arc<dyn AgentTool>>) -> Self {
			Self::with_parts(cfg, Vec::new(), tools, None)
		}

		pub fn with_graph(cfg: Config, graph: Arc<dyn GraphStore>) -> Self {
			Self::with_parts(cfg, Vec::new(), Vec::new(), Some(graph))
		}

		fn with_parts(
			cfg: Config,
			extra: Vec<Arc<dyn RetrievalBackend>>,
			tools: Vec<Arc<dyn AgentTool>>,
			graph: Option<Arc<dyn GraphStore>>,
		) -> Self {
			let chat = Arc::new(ScriptedChat::default());
			let memory = Arc::new(MemoryBackend::new());
			let catalog = Arc::new(StaticCatalog::default());
			let chunks = Arc::new(MemoryChunkRepository::default());
			let mut backends = BackendRegistry::new().with(memory.clone());

			for backend in extra {
				backends.register(backend);
			}

			let providers =
				Providers::new(Arc::new(TopicEmbedding), Arc::new(FlatRerank), chat.clone());
			let mut collaborators = Collaborators::new(backends)
				.with_catalog(catalog.clone())
				.with_chunk_repository(chunks.clone());

			for tool in tools {
				collaborators = collaborators.with_tool(tool);
			}

			if let Some(graph) = graph {
				collaborators = collaborators.with_graph_store(graph);
			}

			let service = Arc::new(KoraService::with_providers(cfg, providers, collaborators));

			Self { service, chat, memory, catalog, chunks }
		}

		/// Registers the knowledge item and indexes its passages.
		pub async fn seed(&self, knowledge_base_id: &str, knowledge_id: &str, passages: &[&str]) {
			let info = knowledge(knowledge_base_id, knowledge_id);

			self.catalog.insert(TENANT, info.clone());

			let passages: Vec<String> = passages.iter().map(ToString::to_string).collect();

			self.service
				.index_knowledge(TENANT, &info, KnowledgeBaseType::Document, &passages)
				.await
				.expect("Seeding the corpus failed.");
		}
	}

	pub fn knowledge(knowledge_base_id: &str, knowledge_id: &str) -> KnowledgeInfo {
		KnowledgeInfo {
			knowledge_id: knowledge_id.to_string(),
			knowledge_base_id: knowledge_base_id.to_string(),
			title: format!("{knowledge_id} title"),
			filename: format!("{knowledge_id}.md"),
		}
	}

	pub fn test_config() -> Config {
		Config {
			service: Service {
				log_level: "info".to_string(),
				worker_concurrency: 4,
				stream_channel_capacity: 64,
			},
			storage: Storage::default(),
			retrieval: Retrieval {
				drivers: vec![RetrievalDriver::Memory],
				mandatory: None,
				failure_policy: FailurePolicy::FailFast,
				tenants: HashMap::new(),
			},
			providers: ProviderConfigs {
				embedding: EmbeddingProviderConfig {
					provider_id: "test".to_string(),
					api_base: "http://127.0.0.1:1".to_string(),
					api_key: String::new(),
					path: "/embeddings".to_string(),
					model: "embed".to_string(),
					dimensions: VECTOR_DIM,
					timeout_ms: 1_000,
					default_headers: Map::new(),
				},
				rerank: dummy_provider("/rerank"),
				chat: LlmProviderConfig {
					provider_id: "test".to_string(),
					api_base: "http://127.0.0.1:1".to_string(),
					api_key: String::new(),
					path: "/chat/completions".to_string(),
					model: "chat".to_string(),
					temperature: 0.3,
					timeout_ms: 1_000,
					default_headers: Map::new(),
				},
				web_search: None,
			},
			conversation: Conversation { enable_rewrite: false, ..Default::default() },
			context: ContextSettings::default(),
			agent: Agent::default(),
		}
	}

	/// Memory first, then `driver`, under `policy`.
	pub fn two_backend_config(driver: RetrievalDriver, policy: FailurePolicy) -> Config {
		let mut cfg = test_config();

		cfg.retrieval.drivers = vec![RetrievalDriver::Memory, driver];
		cfg.retrieval.failure_policy = policy;

		cfg
	}

	fn dummy_provider(path: &str) -> ProviderConfig {
		ProviderConfig {
			provider_id: "test".to_string(),
			api_base: "http://127.0.0.1:1".to_string(),
			api_key: String::new(),
			path: path.to_string(),
			model: "model".to_string(),
			timeout_ms: 1_000,
			default_headers: Map::new(),
		}
	}

	pub fn drain(rx: &mut mpsc::Receiver<StreamEvent>) -> Vec<StreamEvent> {
		let mut events = Vec::new();

		while let Ok(event) = rx.try_recv() {
			events.push(event);
		}

		events
	}

	/// Waits for the next event of `kind`, returning everything received up to and including it.
	pub async fn recv_until(
		rx: &mut mpsc::Receiver<StreamEvent>,
		kind: EventKind,
	) -> Vec<StreamEvent> {
		let mut events = Vec::new();

		loop {
			let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
				.await
				.expect("Timed out waiting for an event.")
				.expect("Event channel closed.");
			let matched = event.kind == kind;

			events.push(event);

			if matched {
				return events;
			}
		}
	}

	pub fn terminal_answers(events: &[StreamEvent]) -> Vec<&StreamEvent> {
		events.iter().filter(|event| event.kind == EventKind::Answer && event.done).collect()
	}

	/// Every answer series ends with exactly one `done` event, and nothing follows it.
	pub fn assert_single_terminal(events: &[StreamEvent]) {
		let mut by_id: HashMap<&str, Vec<&StreamEvent>> = HashMap::new();

		for event in events.iter().filter(|event| event.kind == EventKind::Answer) {
			by_id.entry(event.id.as_str()).or_default().push(event);
		}

		for (id, series) in by_id {
			let done = series.iter().filter(|event| event.done).count();

			assert_eq!(done, 1, "Answer series {id} must end exactly once.");
			assert!(
				series.last().is_some_and(|event| event.done),
				"Answer series {id} emitted after its terminal event."
			);
		}
	}
}
