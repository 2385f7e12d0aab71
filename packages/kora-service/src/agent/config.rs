use serde::{Deserialize, Serialize};

use kora_config::{Agent, MAX_AGENT_ITERATIONS};
use kora_domain::search::SearchTarget;

use crate::pipeline::RetrievalSettings;

pub const DEFAULT_MAX_ITERATIONS: u32 = 5;

/// Per-request adjustments to the deployment's `[agent]` section.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct AgentOverrides {
	pub max_iterations: Option<u32>,
	pub reflection_enabled: Option<bool>,
	pub allowed_tools: Option<Vec<String>>,
	pub web_search_max_results: Option<u32>,
	pub system_prompt: Option<String>,
	pub temperature: Option<f32>,
}

/// Fully resolved settings for one agent run. Read-only once built.
#[derive(Clone, Debug)]
pub struct AgentRunConfig {
	max_iterations: u32,
	reflection_enabled: bool,
	allowed_tools: Vec<String>,
	search_targets: Vec<SearchTarget>,
	web_search_enabled: bool,
	web_search_max_results: u32,
	system_prompt: Option<String>,
	temperature: f32,
	stop_notice: String,
	iteration_cap_notice: String,
	retrieval: RetrievalSettings,
}
impl AgentRunConfig {
	/// Request overrides win over the deployment section. An iteration count of zero means the
	/// default, and every count is capped at [`MAX_AGENT_ITERATIONS`].
	pub fn resolve(
		agent: &Agent,
		retrieval: RetrievalSettings,
		overrides: Option<&AgentOverrides>,
		search_targets: Vec<SearchTarget>,
		web_search_enabled: bool,
	) -> Self {
		let defaults = AgentOverrides::default();
		let overrides = overrides.unwrap_or(&defaults);
		let max_iterations = match overrides.max_iterations.unwrap_or(agent.max_iterations) {
			0 => DEFAULT_MAX_ITERATIONS,
			n => n,
		}
		.min(MAX_AGENT_ITERATIONS);
		let system_prompt = overrides
			.system_prompt
			.clone()
			.or_else(|| agent.system_prompt.clone())
			.filter(|prompt| !prompt.trim().is_empty());

		Self {
			max_iterations,
			reflection_enabled: overrides.reflection_enabled.unwrap_or(agent.reflection_enabled),
			allowed_tools: overrides.allowed_tools.clone().unwrap_or_else(|| agent.allowed_tools.clone()),
			search_targets,
			web_search_enabled,
			web_search_max_results: overrides
				.web_search_max_results
				.unwrap_or(agent.web_search_max_results)
				.max(1),
			system_prompt,
			temperature: overrides.temperature.unwrap_or(agent.temperature),
			stop_notice: agent.stop_notice.clone(),
			iteration_cap_notice: agent.iteration_cap_notice.clone(),
			retrieval,
		}
	}

	pub fn max_iterations(&self) -> u32 {
		self.max_iterations
	}

	pub fn reflection_enabled(&self) -> bool {
		self.reflection_enabled
	}

	/// Empty means every registered tool.
	pub fn allowed_tools(&self) -> &[String] {
		&self.allowed_tools
	}

	pub fn search_targets(&self) -> &[SearchTarget] {
		&self.search_targets
	}

	pub fn has_knowledge_scope(&self) -> bool {
		!self.search_targets.is_empty()
	}

	pub fn web_search_enabled(&self) -> bool {
		self.web_search_enabled
	}

	pub fn web_search_max_results(&self) -> u32 {
		self.web_search_max_results
	}

	pub fn system_prompt(&self) -> Option<&str> {
		self.system_prompt.as_deref()
	}

	pub fn temperature(&self) -> f32 {
		self.temperature
	}

	pub fn stop_notice(&self) -> &str {
		&self.stop_notice
	}

	pub fn iteration_cap_notice(&self) -> &str {
		&self.iteration_cap_notice
	}

	pub fn retrieval(&self) -> &RetrievalSettings {
		&self.retrieval
	}
}
