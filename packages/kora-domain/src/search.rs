use std::collections::HashSet;

use serde::{Deserialize, Serialize};

/// Retrieval scope: a whole knowledge base, or selected knowledge items inside one.
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum SearchTarget {
	KnowledgeBase { knowledge_base_id: String },
	Knowledge { knowledge_base_id: String, knowledge_ids: Vec<String> },
}
impl SearchTarget {
	pub fn knowledge_base_id(&self) -> &str {
		match self {
			Self::KnowledgeBase { knowledge_base_id } => knowledge_base_id,
			Self::Knowledge { knowledge_base_id, .. } => knowledge_base_id,
		}
	}

	/// Empty for full-scope targets.
	pub fn knowledge_ids(&self) -> &[String] {
		match self {
			Self::KnowledgeBase { .. } => &[],
			Self::Knowledge { knowledge_ids, .. } => knowledge_ids,
		}
	}

	pub fn is_full_scope(&self) -> bool {
		matches!(self, Self::KnowledgeBase { .. })
	}

	pub fn contains(&self, knowledge_base_id: &str, knowledge_id: &str) -> bool {
		self.knowledge_base_id() == knowledge_base_id
			&& (self.is_full_scope() || self.knowledge_ids().iter().any(|id| id == knowledge_id))
	}
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct KnowledgeRef {
	pub knowledge_id: String,
	pub knowledge_base_id: String,
}

/// Full-scope targets come first in input order. Knowledge items are grouped under their
/// knowledge base, and items whose knowledge base is already full-scope are dropped.
pub fn build_search_targets(
	knowledge_base_ids: &[String],
	knowledge: &[KnowledgeRef],
) -> Vec<SearchTarget> {
	let mut targets = Vec::new();
	let mut full_scope = HashSet::new();

	for knowledge_base_id in knowledge_base_ids {
		let knowledge_base_id = knowledge_base_id.trim();

		if knowledge_base_id.is_empty() || !full_scope.insert(knowledge_base_id.to_string()) {
			continue;
		}

		targets.push(SearchTarget::KnowledgeBase {
			knowledge_base_id: knowledge_base_id.to_string(),
		});
	}

	let mut grouped: Vec<(String, Vec<String>)> = Vec::new();

	for item in knowledge {
		if item.knowledge_base_id.is_empty() || full_scope.contains(&item.knowledge_base_id) {
			continue;
		}

		match grouped.iter_mut().find(|(kb, _)| *kb == item.knowledge_base_id) {
			Some((_, ids)) =>
				if !ids.contains(&item.knowledge_id) {
					ids.push(item.knowledge_id.clone());
				},
			None => grouped.push((item.knowledge_base_id.clone(), vec![item.knowledge_id.clone()])),
		}
	}

	targets.extend(grouped.into_iter().map(|(knowledge_base_id, knowledge_ids)| {
		SearchTarget::Knowledge { knowledge_base_id, knowledge_ids }
	}));

	targets
}

pub fn knowledge_base_ids(targets: &[SearchTarget]) -> Vec<String> {
	let mut ids: Vec<String> = Vec::new();

	for target in targets {
		if !ids.iter().any(|id| id == target.knowledge_base_id()) {
			ids.push(target.knowledge_base_id().to_string());
		}
	}

	ids
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalMode {
	Keyword,
	Vector,
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub struct Thresholds {
	pub keyword: f32,
	pub vector: f32,
}
impl Thresholds {
	pub fn for_mode(&self, mode: RetrievalMode) -> f32 {
		match mode {
			RetrievalMode::Keyword => self.keyword,
			RetrievalMode::Vector => self.vector,
		}
	}
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
	Keyword,
	Vector,
	Graph,
	WebSearch,
	DataAnalysis,
}
impl MatchType {
	pub fn as_str(self) -> &'static str {
		match self {
			Self::Keyword => "keyword",
			Self::Vector => "vector",
			Self::Graph => "graph",
			Self::WebSearch => "web_search",
			Self::DataAnalysis => "data_analysis",
		}
	}

	pub fn parse(raw: &str) -> Option<Self> {
		match raw {
			"keyword" => Some(Self::Keyword),
			"vector" => Some(Self::Vector),
			"graph" => Some(Self::Graph),
			"web_search" => Some(Self::WebSearch),
			"data_analysis" => Some(Self::DataAnalysis),
			_ => None,
		}
	}

	/// Retrieval mode whose threshold applies to this hit, if any.
	pub fn retrieval_mode(self) -> Option<RetrievalMode> {
		match self {
			Self::Keyword => Some(RetrievalMode::Keyword),
			Self::Vector => Some(RetrievalMode::Vector),
			_ => None,
		}
	}
}

impl From<RetrievalMode> for MatchType {
	fn from(mode: RetrievalMode) -> Self {
		match mode {
			RetrievalMode::Keyword => Self::Keyword,
			RetrievalMode::Vector => Self::Vector,
		}
	}
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkType {
	#[default]
	Text,
	Summary,
	TableSummary,
	TableColumn,
}
impl ChunkType {
	pub fn as_str(self) -> &'static str {
		match self {
			Self::Text => "text",
			Self::Summary => "summary",
			Self::TableSummary => "table_summary",
			Self::TableColumn => "table_column",
		}
	}

	pub fn parse(raw: &str) -> Option<Self> {
		match raw {
			"text" => Some(Self::Text),
			"summary" => Some(Self::Summary),
			"table_summary" => Some(Self::TableSummary),
			"table_column" => Some(Self::TableColumn),
			_ => None,
		}
	}

	pub fn is_table(self) -> bool {
		matches!(self, Self::TableSummary | Self::TableColumn)
	}
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KnowledgeBaseType {
	#[default]
	Document,
	Faq,
}
impl KnowledgeBaseType {
	pub fn as_str(self) -> &'static str {
		match self {
			Self::Document => "document",
			Self::Faq => "faq",
		}
	}
}

/// A scored hit with enough provenance to cite it.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct SearchResult {
	pub id: String,
	pub content: String,
	pub knowledge_id: String,
	pub knowledge_base_id: String,
	pub chunk_id: String,
	pub chunk_index: i32,
	pub knowledge_title: String,
	pub knowledge_filename: String,
	pub chunk_type: ChunkType,
	pub match_type: MatchType,
	pub score: f32,
}
impl SearchResult {
	pub fn dedup_key(&self) -> (&str, &str) {
		(self.knowledge_id.as_str(), self.chunk_id.as_str())
	}
}
