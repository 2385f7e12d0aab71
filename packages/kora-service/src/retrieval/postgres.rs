use kora_config::RetrievalDriver;
use kora_domain::{
	index::EmbeddedUnit,
	search::{KnowledgeBaseType, MatchType, RetrievalMode, SearchResult},
};
use kora_storage::{chunks, db::Db};

use crate::{
	BoxFuture, Error, Result,
	retrieval::{BackendQuery, RetrievalBackend},
};

/// Full-text and pgvector retrieval over `chunk_index`.
pub struct PostgresBackend {
	db: Db,
}
impl PostgresBackend {
	pub fn new(db: Db) -> Self {
		Self { db }
	}

	async fn search_now(&self, tenant_id: &str, query: &BackendQuery<'_>) -> Result<Vec<SearchResult>> {
		let hits = match query.mode {
			RetrievalMode::Keyword =>
				chunks::keyword_search(
					&self.db.pool,
					tenant_id,
					query.target,
					query.query,
					query.threshold,
					query.top_k,
				)
				.await?,
			RetrievalMode::Vector => {
				let embedding = query.embedding.ok_or_else(|| Error::InvalidRequest {
					message: "Vector search requires a query embedding.".to_string(),
				})?;

				chunks::vector_search(
					&self.db.pool,
					tenant_id,
					query.target,
					embedding,
					query.threshold,
					query.top_k,
				)
				.await?
			},
		};
		let match_type = MatchType::from(query.mode);

		Ok(hits.into_iter().map(|hit| hit.into_search_result(match_type)).collect())
	}
}
impl RetrievalBackend for PostgresBackend {
	fn driver(&self) -> RetrievalDriver {
		RetrievalDriver::Postgres
	}

	fn search<'a>(
		&'a self,
		tenant_id: &'a str,
		query: &'a BackendQuery<'a>,
	) -> BoxFuture<'a, Result<Vec<SearchResult>>> {
		Box::pin(self.search_now(tenant_id, query))
	}

	fn batch_index<'a>(
		&'a self,
		tenant_id: &'a str,
		units: &'a [EmbeddedUnit],
	) -> BoxFuture<'a, Result<()>> {
		Box::pin(async move {
			chunks::upsert_units(&self.db.pool, tenant_id, units).await?;

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
			let removed = chunks::delete_by_source_ids(
				&self.db.pool,
				tenant_id,
				source_ids,
				embedding_dim,
				kb_type,
			)
			.await?;

			tracing::debug!(tenant_id, removed, "Postgres index entries removed.");

			Ok(())
		})
	}
}
