use std::{
	collections::HashMap,
	sync::{PoisonError, RwLock},
};

use serde::{Deserialize, Serialize};

use kora_domain::{
	index::IndexWriteUnit,
	search::{KnowledgeRef, SearchResult},
};

use crate::{BoxFuture, Result};

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct KnowledgeInfo {
	pub knowledge_id: String,
	pub knowledge_base_id: String,
	pub title: String,
	pub filename: String,
}
impl KnowledgeInfo {
	pub fn to_ref(&self) -> KnowledgeRef {
		KnowledgeRef {
			knowledge_id: self.knowledge_id.clone(),
			knowledge_base_id: self.knowledge_base_id.clone(),
		}
	}
}

/// Raw CSV text of a tabular knowledge document.
#[derive(Clone, Debug, PartialEq)]
pub struct TableSource {
	pub filename: String,
	pub content: String,
}

/// Knowledge metadata owned by the surrounding system.
pub trait KnowledgeCatalog
where
	Self: Send + Sync,
{
	/// Unknown IDs are skipped, not reported.
	fn knowledge_batch<'a>(
		&'a self,
		tenant_id: &'a str,
		knowledge_ids: &'a [String],
	) -> BoxFuture<'a, Result<Vec<KnowledgeInfo>>>;

	fn load_table<'a>(
		&'a self,
		tenant_id: &'a str,
		knowledge_id: &'a str,
	) -> BoxFuture<'a, Result<Option<TableSource>>>;
}

/// Durable chunk records that mirror what the retrieval backends index.
pub trait ChunkRepository
where
	Self: Send + Sync,
{
	/// Re-creating an existing chunk ID replaces it.
	fn create_chunks<'a>(
		&'a self,
		tenant_id: &'a str,
		units: &'a [IndexWriteUnit],
	) -> BoxFuture<'a, Result<()>>;

	/// Missing IDs are not an error.
	fn delete_chunks<'a>(
		&'a self,
		tenant_id: &'a str,
		chunk_ids: &'a [String],
	) -> BoxFuture<'a, Result<()>>;
}

pub trait GraphStore
where
	Self: Send + Sync,
{
	fn related_chunks<'a>(
		&'a self,
		tenant_id: &'a str,
		knowledge_base_ids: &'a [String],
		entities: &'a [String],
		top_k: u32,
	) -> BoxFuture<'a, Result<Vec<SearchResult>>>;
}

/// In-process catalog, keyed by tenant.
#[derive(Default)]
pub struct StaticCatalog {
	knowledge: RwLock<HashMap<(String, String), KnowledgeInfo>>,
	tables: RwLock<HashMap<(String, String), TableSource>>,
}
impl StaticCatalog {
	pub fn insert(&self, tenant_id: &str, info: KnowledgeInfo) {
		self.knowledge
			.write()
			.unwrap_or_else(PoisonError::into_inner)
			.insert((tenant_id.to_string(), info.knowledge_id.clone()), info);
	}

	pub fn insert_table(&self, tenant_id: &str, knowledge_id: &str, table: TableSource) {
		self.tables
			.write()
			.unwrap_or_else(PoisonError::into_inner)
			.insert((tenant_id.to_string(), knowledge_id.to_string()), table);
	}
}
impl KnowledgeCatalog for StaticCatalog {
	fn knowledge_batch<'a>(
		&'a self,
		tenant_id: &'a str,
		knowledge_ids: &'a [String],
	) -> BoxFuture<'a, Result<Vec<KnowledgeInfo>>> {
		let knowledge = self.knowledge.read().unwrap_or_else(PoisonError::into_inner);
		let found = knowledge_ids
			.iter()
			.filter_map(|id| knowledge.get(&(tenant_id.to_string(), id.clone())).cloned())
			.collect();

		Box::pin(async move { Ok(found) })
	}

	fn load_table<'a>(
		&'a self,
		tenant_id: &'a str,
		knowledge_id: &'a str,
	) -> BoxFuture<'a, Result<Option<TableSource>>> {
		let table = self
			.tables
			.read()
			.unwrap_or_else(PoisonError::into_inner)
			.get(&(tenant_id.to_string(), knowledge_id.to_string()))
			.cloned();

		Box::pin(async move { Ok(table) })
	}
}

/// In-process chunk records, keyed by tenant and chunk ID.
#[derive(Default)]
pub struct MemoryChunkRepository {
	chunks: RwLock<HashMap<(String, String), IndexWriteUnit>>,
}
impl MemoryChunkRepository {
	pub fn count(&self, tenant_id: &str) -> usize {
		self.chunks
			.read()
			.unwrap_or_else(PoisonError::into_inner)
			.keys()
			.filter(|(tenant, _)| tenant == tenant_id)
			.count()
	}
}
impl ChunkRepository for MemoryChunkRepository {
	fn create_chunks<'a>(
		&'a self,
		tenant_id: &'a str,
		units: &'a [IndexWriteUnit],
	) -> BoxFuture<'a, Result<()>> {
		let mut chunks = self.chunks.write().unwrap_or_else(PoisonError::into_inner);

		for unit in units {
			chunks.insert((tenant_id.to_string(), unit.chunk_id.clone()), unit.clone());
		}

		drop(chunks);

		Box::pin(async { Ok(()) })
	}

	fn delete_chunks<'a>(
		&'a self,
		tenant_id: &'a str,
		chunk_ids: &'a [String],
	) -> BoxFuture<'a, Result<()>> {
		let mut chunks = self.chunks.write().unwrap_or_else(PoisonError::into_inner);

		for chunk_id in chunk_ids {
			chunks.remove(&(tenant_id.to_string(), chunk_id.clone()));
		}

		drop(chunks);

		Box::pin(async { Ok(()) })
	}
}
