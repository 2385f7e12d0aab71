use kora_config::RetrievalDriver;
use kora_domain::{
	index::EmbeddedUnit,
	search::{KnowledgeBaseType, MatchType, SearchResult},
};
use kora_storage::qdrant::QdrantStore;

use crate::{
	BoxFuture, Result,
	retrieval::{BackendQuery, RetrievalBackend},
};

/// Dense and BM25 retrieval over one Qdrant collection.
pub struct QdrantBackend {
	store: QdrantStore,
}
impl QdrantBackend {
	pub fn new(store: QdrantStore) -> Self {
		Self { store }
	}
}
impl RetrievalBackend for QdrantBackend {
	fn driver(&self) -> RetrievalDriver {
		RetrievalDriver::Qdrant
	}

	fn search<'a>(
		&'a self,
		tenant_id: &'a str,
		query: &'a BackendQuery<'a>,
	) -> BoxFuture<'a, Result<Vec<SearchResult>>> {
		Box::pin(async move {
			let hits = self
				.store
				.search(
					tenant_id,
					query.target,
					query.mode,
					query.query,
					query.embedding,
					query.threshold,
					query.top_k,
				)
				.await?;
			let match_type = MatchType::from(query.mode);

			Ok(hits.into_iter().map(|hit| hit.into_search_result(match_type)).collect())
		})
	}

	fn batch_index<'a>(
		&'a self,
		tenant_id: &'a str,
		units: &'a [EmbeddedUnit],
	) -> BoxFuture<'a, Result<()>> {
		Box::pin(async move {
			self.store.upsert_units(tenant_id, units).await?;

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
			self.store.delete_by_source_ids(tenant_id, source_ids, embedding_dim, kb_type).await?;

			Ok(())
		})
	}
}
