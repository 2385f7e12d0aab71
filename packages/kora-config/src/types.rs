use std::{collections::HashMap, fmt};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const MAX_AGENT_ITERATIONS: u32 = 30;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
	pub service: Service,
	#[serde(default)]
	pub storage: Storage,
	pub retrieval: Retrieval,
	pub providers: Providers,
	#[serde(default)]
	pub conversation: Conversation,
	#[serde(default)]
	pub context: ContextSettings,
	#[serde(default)]
	pub agent: Agent,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Service {
	pub log_level: String,
	#[serde(default = "default_worker_concurrency")]
	pub worker_concurrency: usize,
	#[serde(default = "default_stream_channel_capacity")]
	pub stream_channel_capacity: usize,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Storage {
	pub postgres: Option<Postgres>,
	pub qdrant: Option<Qdrant>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Postgres {
	pub dsn: String,
	pub pool_max_conns: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Qdrant {
	pub url: String,
	pub collection: String,
	pub vector_dim: u32,
}

/// Retrieval backends known to this build. Activation is driven by `[retrieval]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalDriver {
	Postgres,
	Qdrant,
	Memory,
}
impl RetrievalDriver {
	pub fn as_str(self) -> &'static str {
		match self {
			Self::Postgres => "postgres",
			Self::Qdrant => "qdrant",
			Self::Memory => "memory",
		}
	}
}
impl fmt::Display for RetrievalDriver {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
	#[default]
	FailFast,
	Degrade,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Retrieval {
	pub drivers: Vec<RetrievalDriver>,
	/// Defaults to every active driver when omitted.
	pub mandatory: Option<Vec<RetrievalDriver>>,
	#[serde(default)]
	pub failure_policy: FailurePolicy,
	#[serde(default)]
	pub tenants: HashMap<String, TenantRetrieval>,
}
impl Retrieval {
	pub fn drivers_for(&self, tenant_id: &str) -> &[RetrievalDriver] {
		self.tenants.get(tenant_id).map(|tenant| tenant.drivers.as_slice()).unwrap_or(&self.drivers)
	}

	pub fn is_mandatory(&self, driver: RetrievalDriver) -> bool {
		match &self.mandatory {
			Some(mandatory) => mandatory.contains(&driver),
			None => true,
		}
	}
}

#[derive(Debug, Clone, Deserialize)]
pub struct TenantRetrieval {
	pub drivers: Vec<RetrievalDriver>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Providers {
	pub embedding: EmbeddingProviderConfig,
	pub rerank: ProviderConfig,
	pub chat: LlmProviderConfig,
	pub web_search: Option<ProviderConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EmbeddingProviderConfig {
	pub provider_id: String,
	pub api_base: String,
	pub api_key: String,
	pub path: String,
	pub model: String,
	pub dimensions: u32,
	pub timeout_ms: u64,
	#[serde(default)]
	pub default_headers: Map<String, Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
	pub provider_id: String,
	pub api_base: String,
	pub api_key: String,
	pub path: String,
	pub model: String,
	pub timeout_ms: u64,
	#[serde(default)]
	pub default_headers: Map<String, Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmProviderConfig {
	pub provider_id: String,
	pub api_base: String,
	pub api_key: String,
	pub path: String,
	pub model: String,
	pub temperature: f32,
	pub timeout_ms: u64,
	#[serde(default)]
	pub default_headers: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackStrategy {
	#[default]
	Fixed,
	Model,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Conversation {
	pub max_rounds: u32,
	pub keyword_threshold: f32,
	pub vector_threshold: f32,
	pub embedding_top_k: u32,
	pub rerank_top_k: u32,
	pub rerank_threshold: f32,
	pub enable_rewrite: bool,
	pub enable_rerank: bool,
	pub fallback_strategy: FallbackStrategy,
	pub fallback_response: String,
	/// `{{query}}` is replaced with the user question.
	pub fallback_prompt: Option<String>,
	pub rewrite_prompt_system: String,
	/// `{{conversation}}` and `{{query}}` are replaced before the call.
	pub rewrite_prompt_user: String,
	pub extract_entities_prompt: String,
	pub summary: Summary,
}
impl Default for Conversation {
	fn default() -> Self {
		Self {
			max_rounds: 5,
			keyword_threshold: 0.3,
			vector_threshold: 0.5,
			embedding_top_k: 10,
			rerank_top_k: 5,
			rerank_threshold: 0.5,
			enable_rewrite: true,
			enable_rerank: true,
			fallback_strategy: FallbackStrategy::Fixed,
			fallback_response:
				"Sorry, I could not find anything relevant in the knowledge base for this question."
					.to_string(),
			fallback_prompt: None,
			rewrite_prompt_system: "Rewrite the user's latest question into a standalone question \
				using the conversation for missing references. Reply with the question only."
				.to_string(),
			rewrite_prompt_user: "Conversation:\n{{conversation}}\n\nQuestion: {{query}}"
				.to_string(),
			extract_entities_prompt: "Extract the named entities from the question. Reply with a \
				JSON array of strings and nothing else."
				.to_string(),
			summary: Summary::default(),
		}
	}
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Summary {
	pub prompt: String,
	/// `{{query}}`, `{{contexts}}`, and `{{current_time}}` are replaced before the call.
	pub context_template: String,
	pub temperature: f32,
	pub max_completion_tokens: u32,
	pub thinking: bool,
}
impl Default for Summary {
	fn default() -> Self {
		Self {
			prompt: "You are a helpful assistant. Answer using the provided references and say so \
				when they do not contain the answer."
				.to_string(),
			context_template: "Current time: {{current_time}}\n\nReferences:\n{{contexts}}\n\n\
				Question: {{query}}"
				.to_string(),
			temperature: 0.3,
			max_completion_tokens: 2_048,
			thinking: false,
		}
	}
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionStrategy {
	SlidingWindow,
	#[default]
	Smart,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextStoreKind {
	#[default]
	Memory,
	Postgres,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ContextSettings {
	pub max_tokens: usize,
	pub compression_strategy: CompressionStrategy,
	pub recent_message_count: usize,
	pub summarize_threshold: usize,
	pub ttl_seconds: u64,
	pub store: ContextStoreKind,
	pub summary_prompt: String,
}
impl Default for ContextSettings {
	fn default() -> Self {
		Self {
			max_tokens: 8_192,
			compression_strategy: CompressionStrategy::Smart,
			recent_message_count: 10,
			summarize_threshold: 4_096,
			ttl_seconds: 86_400,
			store: ContextStoreKind::Memory,
			summary_prompt: "Summarize the conversation below. Keep names, numbers, decisions, \
				and open questions. Reply with the summary only."
				.to_string(),
		}
	}
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Agent {
	pub max_iterations: u32,
	pub reflection_enabled: bool,
	pub web_search_max_results: u32,
	/// Empty means every registered tool.
	pub allowed_tools: Vec<String>,
	pub system_prompt: Option<String>,
	pub temperature: f32,
	pub stop_notice: String,
	pub iteration_cap_notice: String,
	pub external_tools: Vec<ExternalTool>,
}
impl Default for Agent {
	fn default() -> Self {
		Self {
			max_iterations: 5,
			reflection_enabled: false,
			web_search_max_results: 5,
			allowed_tools: Vec::new(),
			system_prompt: None,
			temperature: 0.7,
			stop_notice: "The user stopped this answer.".to_string(),
			iteration_cap_notice:
				"I reached the step limit before finishing. Here is what I found so far.".to_string(),
			external_tools: Vec::new(),
		}
	}
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExternalTool {
	pub name: String,
	pub description: String,
	pub url: String,
	#[serde(default)]
	pub parameters: Map<String, Value>,
	#[serde(default = "default_external_tool_timeout_ms")]
	pub timeout_ms: u64,
}

fn default_worker_concurrency() -> usize {
	8
}

fn default_stream_channel_capacity() -> usize {
	64
}

fn default_external_tool_timeout_ms() -> u64 {
	15_000
}
