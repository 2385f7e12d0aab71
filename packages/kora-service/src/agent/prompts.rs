use kora_domain::search::{self, SearchTarget};

use crate::agent::config::AgentRunConfig;

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a careful research assistant. Work in steps: \
	use the tools to gather evidence, then answer. When the evidence is enough, reply with the \
	final answer and no tool call. Cite passages by their [n] markers and say plainly when \
	nothing relevant was found.";

pub const REFLECTION_PROMPT: &str = "Look back at the tool results so far. Note anything missing \
	or wrong in your approach and state the next step in one or two sentences. Do not answer yet.";

/// The run's system prompt followed by its scope and tool roster.
pub fn system_prompt(run: &AgentRunConfig, tool_names: &[String], now: &str) -> String {
	let mut prompt = run.system_prompt().unwrap_or(DEFAULT_SYSTEM_PROMPT).to_string();

	prompt.push_str("\n\nCurrent time: ");
	prompt.push_str(now);
	prompt.push_str("\nKnowledge scope: ");
	prompt.push_str(&describe_scope(run.search_targets()));

	if !tool_names.is_empty() {
		prompt.push_str("\nAvailable tools: ");
		prompt.push_str(&tool_names.join(", "));
	}

	prompt
}

fn describe_scope(targets: &[SearchTarget]) -> String {
	if targets.is_empty() {
		return "none".to_string();
	}

	let mut parts = Vec::new();

	for knowledge_base_id in search::knowledge_base_ids(targets) {
		let items: Vec<&str> = targets
			.iter()
			.filter(|target| target.knowledge_base_id() == knowledge_base_id)
			.flat_map(|target| target.knowledge_ids().iter().map(String::as_str))
			.collect();
		let full = targets
			.iter()
			.any(|target| target.knowledge_base_id() == knowledge_base_id && target.is_full_scope());

		if full || items.is_empty() {
			parts.push(format!("knowledge base {knowledge_base_id}"));
		} else {
			parts.push(format!("knowledge base {knowledge_base_id} (items {})", items.join(", ")));
		}
	}

	parts.join("; ")
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn scope_lists_full_and_partial_targets() {
		let targets = vec![
			SearchTarget::KnowledgeBase { knowledge_base_id: "A".to_string() },
			SearchTarget::Knowledge {
				knowledge_base_id: "B".to_string(),
				knowledge_ids: vec!["b1".to_string(), "b2".to_string()],
			},
		];

		assert_eq!(describe_scope(&targets), "knowledge base A; knowledge base B (items b1, b2)");
		assert_eq!(describe_scope(&[]), "none");
	}
}
