use std::{
	collections::{HashMap, HashSet},
	sync::{PoisonError, RwLock},
};

use unicode_normalization::UnicodeNormalization;
use unicode_segmentation::UnicodeSegmentation;

use kora_config::RetrievalDriver;
use kora_domain::{
	index::EmbeddedUnit,
	search::{KnowledgeBaseType, MatchType, RetrievalMode, SearchResult},
};

use crate::{
	BoxFuture, Result,
	retrieval::{BackendQuery, RetrievalBackend},
};

/// In-process index for development and tests. Keyword scores are the share of distinct query
/// terms found in the chunk; vector scores are cosine similarity.
#[derive(Default)]
pub struct MemoryBackend {
	tenants: RwLock<HashMap<String, HashMap<String, EmbeddedUnit>>>,
}
impl MemoryBackend {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn len(&self, tenant_id: &str) -> usize {
		self.tenants
			.read()
			.unwrap_or_else(PoisonError::into_inner)
			.get(tenant_id)
			.map_or(0, HashMap::len)
	}

	pub fn is_empty(&self, tenant_id: &str) -> bool {
		self.len(tenant_id) == 0
	}

	fn search_now(&self, tenant_id: &str, query: &BackendQuery<'_>) -> Vec<SearchResult> {
		let tenants = self.tenants.read().unwrap_or_else(PoisonError::into_inner);
		let Some(units) = tenants.get(tenant_id) else {
			return Vec::new();
		};
		let query_terms = terms(query.query);
		let mut hits: Vec<SearchResult> = units
			.values()
			.filter(|embedded| {
				query.target.contains(&embedded.unit.knowledge_base_id, &embedded.unit.knowledge_id)
			})
			.filter_map(|embedded| {
				let score = match query.mode {
					RetrievalMode::Keyword => keyword_score(&query_terms, &embedded.unit.content),
					RetrievalMode::Vector => cosine(query.embedding?, &embedded.embedding)?,
				};

				(score > 0.0 && score >= query.threshold).then(|| to_result(embedded, query.mode, score))
			})
			.collect();

		hits.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.chunk_id.cmp(&b.chunk_id)));
		hits.truncate(query.top_k as usize);

		hits
	}
}
impl RetrievalBackend for MemoryBackend {
	fn driver(&self) -> RetrievalDriver {
		RetrievalDriver::Memory
	}

	fn search<'a>(
		&'a self,
		tenant_id: &'a str,
		query: &'a BackendQuery<'a>,
	) -> BoxFuture<'a, Result<Vec<SearchResult>>> {
		Box::pin(async move { Ok(self.search_now(tenant_id, query)) })
	}

	fn batch_index<'a>(
		&'a self,
		tenant_id: &'a str,
		units: &'a [EmbeddedUnit],
	) -> BoxFuture<'a, Result<()>> {
		Box::pin(async move {
			let mut tenants = self.tenants.write().unwrap_or_else(PoisonError::into_inner);
			let entries = tenants.entry(tenant_id.to_string()).or_default();

			for embedded in units {
				entries.insert(embedded.unit.chunk_id.clone(), embedded.clone());
			}

			Ok(())
		})
	}

	fn delete_by_source_ids<'a>(
		&'a self,
		tenant_id: &'a str,
		source_ids: &'a [String],
		embedding_dim: u32,
		kb_type: KnowledgeBaseType,
	) -> BoxFuture<'a, Result<()>> {
		Box::pin(async move {
			let mut tenants = self.tenants.write().unwrap_or_else(PoisonError::into_inner);

			if let Some(entries) = tenants.get_mut(tenant_id) {
				entries.retain(|_, embedded| {
					let matches = source_ids.contains(&embedded.unit.source_id)
						&& embedded.unit.knowledge_base_type == kb_type
						&& embedded.embedding.len() == embedding_dim as usize;

					!matches
				});
			}

			Ok(())
		})
	}
}

fn terms(text: &str) -> HashSet<String> {
	let normalized: String = text.nfkc().collect::<String>().to_lowercase();

	normalized.unicode_words().map(ToString::to_string).collect()
}

fn keyword_score(query_terms: &HashSet<String>, content: &str) -> f32 {
	if query_terms.is_empty() {
		return 0.0;
	}

	let content_terms = terms(content);
	let matched = query_terms.iter().filter(|term| content_terms.contains(*term)).count();

	matched as f32 / query_terms.len() as f32
}

fn cosine(a: &[f32], b: &[f32]) -> Option<f32> {
	if a.len() != b.len() || a.is_empty() {
		return None;
	}

	let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
	let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
	let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();

	if norm_a == 0.0 || norm_b == 0.0 {
		return None;
	}

	Some(dot / (norm_a * norm_b))
}

fn to_result(embedded: &EmbeddedUnit, mode: RetrievalMode, score: f32) -> SearchResult {
	let unit = &embedded.unit;

	SearchResult {
		id: unit.chunk_id.clone(),
		content: unit.content.clone(),
		knowledge_id: unit.knowledge_id.clone(),
		knowledge_base_id: unit.knowledge_base_id.clone(),
		chunk_id: unit.chunk_id.clone(),
		chunk_index: unit.chunk_index,
		knowledge_title: unit.knowledge_title.clone(),
		knowledge_filename: unit.knowledge_filename.clone(),
		chunk_type: unit.chunk_type,
		match_type: MatchType::from(mode),
		score,
	}
}
