mod error;
mod types;

pub use error::{Error, Result};
pub use types::{
	Agent, CompressionStrategy, Config, ContextSettings, ContextStoreKind, Conversation,
	EmbeddingProviderConfig, ExternalTool, FailurePolicy, FallbackStrategy, LlmProviderConfig,
	MAX_AGENT_ITERATIONS, Postgres, ProviderConfig, Providers, Qdrant, Retrieval,
	RetrievalDriver, Service, Storage, Summary, TenantRetrieval,
};

use std::{collections::HashSet, fs, path::Path};

pub fn load(path: &Path) -> Result<Config> {
	let raw = fs::read_to_string(path)
		.map_err(|err| Error::ReadConfig { path: path.to_path_buf(), source: err })?;

	parse(path, &raw)
}

pub fn parse(path: &Path, raw: &str) -> Result<Config> {
	let mut cfg: Config = toml::from_str(raw)
		.map_err(|err| Error::ParseConfig { path: path.to_path_buf(), source: err })?;

	normalize(&mut cfg);

	validate(&cfg)?;

	Ok(cfg)
}

pub fn validate(cfg: &Config) -> Result<()> {
	if cfg.service.worker_concurrency == 0 {
		return Err(Error::Validation {
			message: "service.worker_concurrency must be greater than zero.".to_string(),
		});
	}
	if cfg.service.stream_channel_capacity == 0 {
		return Err(Error::Validation {
			message: "service.stream_channel_capacity must be greater than zero.".to_string(),
		});
	}

	validate_retrieval(cfg)?;

	if cfg.providers.embedding.dimensions == 0 {
		return Err(Error::Validation {
			message: "providers.embedding.dimensions must be greater than zero.".to_string(),
		});
	}
	if let Some(qdrant) = &cfg.storage.qdrant
		&& cfg.providers.embedding.dimensions != qdrant.vector_dim
	{
		return Err(Error::Validation {
			message: "providers.embedding.dimensions must match storage.qdrant.vector_dim."
				.to_string(),
		});
	}

	validate_conversation(&cfg.conversation)?;

	let context = &cfg.context;

	if context.recent_message_count == 0 {
		return Err(Error::Validation {
			message: "context.recent_message_count must be greater than zero.".to_string(),
		});
	}
	if context.max_tokens == 0 {
		return Err(Error::Validation {
			message: "context.max_tokens must be greater than zero.".to_string(),
		});
	}
	if context.summarize_threshold > context.max_tokens {
		return Err(Error::Validation {
			message: "context.summarize_threshold must not exceed context.max_tokens.".to_string(),
		});
	}
	if context.store == ContextStoreKind::Postgres && cfg.storage.postgres.is_none() {
		return Err(Error::Validation {
			message: "storage.postgres is required when context.store is postgres.".to_string(),
		});
	}
	if cfg.agent.max_iterations > MAX_AGENT_ITERATIONS {
		return Err(Error::Validation {
			message: format!("agent.max_iterations must not exceed {MAX_AGENT_ITERATIONS}."),
		});
	}

	let mut tool_names = HashSet::new();

	for tool in &cfg.agent.external_tools {
		if tool.name.trim().is_empty() || tool.url.trim().is_empty() {
			return Err(Error::Validation {
				message: "agent.external_tools entries require name and url.".to_string(),
			});
		}
		if !tool_names.insert(tool.name.as_str()) {
			return Err(Error::Validation {
				message: format!("agent.external_tools name {} is duplicated.", tool.name),
			});
		}
	}

	Ok(())
}

fn validate_retrieval(cfg: &Config) -> Result<()> {
	let retrieval = &cfg.retrieval;

	if retrieval.drivers.is_empty() {
		return Err(Error::Validation {
			message: "retrieval.drivers must be non-empty.".to_string(),
		});
	}

	let mut seen = HashSet::new();

	for driver in &retrieval.drivers {
		if !seen.insert(*driver) {
			return Err(Error::Validation {
				message: format!("retrieval.drivers lists {driver} more than once."),
			});
		}

		let configured = match driver {
			RetrievalDriver::Postgres => cfg.storage.postgres.is_some(),
			RetrievalDriver::Qdrant => cfg.storage.qdrant.is_some(),
			RetrievalDriver::Memory => true,
		};

		if !configured {
			return Err(Error::Validation {
				message: format!("storage.{driver} is required when retrieval.drivers lists it."),
			});
		}
	}

	if let Some(mandatory) = &retrieval.mandatory
		&& let Some(driver) = mandatory.iter().find(|driver| !seen.contains(*driver))
	{
		return Err(Error::Validation {
			message: format!("retrieval.mandatory lists {driver}, which is not an active driver."),
		});
	}

	for (tenant_id, tenant) in &retrieval.tenants {
		if tenant.drivers.is_empty() {
			return Err(Error::Validation {
				message: format!("retrieval.tenants.{tenant_id}.drivers must be non-empty."),
			});
		}
		if let Some(driver) = tenant.drivers.iter().find(|driver| !seen.contains(*driver)) {
			return Err(Error::Validation {
				message: format!(
					"retrieval.tenants.{tenant_id}.drivers lists {driver}, which is not an active driver."
				),
			});
		}
	}

	Ok(())
}

fn validate_conversation(conversation: &Conversation) -> Result<()> {
	for (name, value) in [
		("conversation.keyword_threshold", conversation.keyword_threshold),
		("conversation.vector_threshold", conversation.vector_threshold),
		("conversation.rerank_threshold", conversation.rerank_threshold),
	] {
		if !value.is_finite() || !(0.0..=1.0).contains(&value) {
			return Err(Error::Validation {
				message: format!("{name} must be in the range 0.0-1.0."),
			});
		}
	}

	if conversation.embedding_top_k == 0 {
		return Err(Error::Validation {
			message: "conversation.embedding_top_k must be greater than zero.".to_string(),
		});
	}
	if conversation.rerank_top_k == 0 {
		return Err(Error::Validation {
			message: "conversation.rerank_top_k must be greater than zero.".to_string(),
		});
	}
	if conversation.fallback_response.trim().is_empty() {
		return Err(Error::Validation {
			message: "conversation.fallback_response must be non-empty.".to_string(),
		});
	}

	Ok(())
}

fn normalize(cfg: &mut Config) {
	if cfg.conversation.fallback_prompt.as_deref().map(|p| p.trim().is_empty()).unwrap_or(false) {
		cfg.conversation.fallback_prompt = None;
	}
	if cfg.agent.system_prompt.as_deref().map(|p| p.trim().is_empty()).unwrap_or(false) {
		cfg.agent.system_prompt = None;
	}
	if cfg.agent.max_iterations == 0 {
		cfg.agent.max_iterations = Agent::default().max_iterations;
	}

	cfg.agent.allowed_tools.retain(|tool| !tool.trim().is_empty());
}
