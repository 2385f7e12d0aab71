use kora_domain::search::{ChunkType, MatchType, SearchResult};

/// One retrieval hit as read from Postgres or Qdrant.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ChunkHit {
	pub chunk_id: String,
	pub knowledge_id: String,
	pub knowledge_base_id: String,
	pub knowledge_title: String,
	pub knowledge_filename: String,
	pub chunk_index: i32,
	pub chunk_type: String,
	pub content: String,
	pub score: f32,
}
impl ChunkHit {
	pub fn into_search_result(self, match_type: MatchType) -> SearchResult {
		SearchResult {
			id: self.chunk_id.clone(),
			content: self.content,
			knowledge_id: self.knowledge_id,
			knowledge_base_id: self.knowledge_base_id,
			chunk_id: self.chunk_id,
			chunk_index: self.chunk_index,
			knowledge_title: self.knowledge_title,
			knowledge_filename: self.knowledge_filename,
			chunk_type: ChunkType::parse(&self.chunk_type).unwrap_or_default(),
			match_type,
			score: self.score,
		}
	}
}

/// Maps an unbounded relevance score into `[0, 1)` so keyword thresholds are comparable.
pub fn squash_score(raw: f32) -> f32 {
	if raw <= 0.0 { 0.0 } else { raw / (raw + 1.0) }
}

/// pgvector text literal, e.g. `[0.1,0.2]`.
pub fn vector_literal(embedding: &[f32]) -> String {
	let parts: Vec<String> = embedding.iter().map(|value| value.to_string()).collect();

	format!("[{}]", parts.join(","))
}
