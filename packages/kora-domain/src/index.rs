use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::search::{ChunkType, KnowledgeBaseType};

const CHUNK_ID_NAMESPACE: Uuid = Uuid::from_u128(0x6b6f_7261_2d63_6875_6e6b_2d69_6473_0001);

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
	#[default]
	Chunk,
	Question,
	TableSchema,
}
impl SourceType {
	pub fn as_str(self) -> &'static str {
		match self {
			Self::Chunk => "chunk",
			Self::Question => "question",
			Self::TableSchema => "table_schema",
		}
	}

	pub fn parse(raw: &str) -> Option<Self> {
		match raw {
			"chunk" => Some(Self::Chunk),
			"question" => Some(Self::Question),
			"table_schema" => Some(Self::TableSchema),
			_ => None,
		}
	}
}

/// One record submitted for embedding and storage.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct IndexWriteUnit {
	pub content: String,
	pub source_type: SourceType,
	pub source_id: String,
	pub chunk_id: String,
	pub chunk_index: i32,
	pub chunk_type: ChunkType,
	pub knowledge_id: String,
	pub knowledge_base_id: String,
	pub knowledge_base_type: KnowledgeBaseType,
	pub knowledge_title: String,
	pub knowledge_filename: String,
}
impl IndexWriteUnit {
	pub fn content_hash(&self) -> String {
		content_hash(&self.content)
	}
}

/// An [`IndexWriteUnit`] paired with its embedding, ready for backend writes.
#[derive(Clone, Debug, PartialEq)]
pub struct EmbeddedUnit {
	pub unit: IndexWriteUnit,
	pub embedding: Vec<f32>,
}

/// Stable across retries, so re-indexing the same input upserts instead of duplicating.
pub fn chunk_id(knowledge_id: &str, source_type: SourceType, chunk_index: i32) -> String {
	let name = format!("{knowledge_id}:{}:{chunk_index}", source_type.as_str());

	Uuid::new_v5(&CHUNK_ID_NAMESPACE, name.as_bytes()).to_string()
}

pub fn content_hash(content: &str) -> String {
	blake3::hash(content.as_bytes()).to_hex().to_string()
}
