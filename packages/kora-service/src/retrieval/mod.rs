pub mod memory;
pub mod postgres;
pub mod qdrant;
pub mod registry;

use std::{collections::BTreeMap, sync::Arc};

use ahash::AHashMap;

use kora_config::{Config, FailurePolicy, ProviderConfig, RetrievalDriver};
use kora_domain::{
	index::{EmbeddedUnit, IndexWriteUnit},
	search::{KnowledgeBaseType, RetrievalMode, SearchResult, SearchTarget, Thresholds},
};

use crate::{
	BoxFuture, Error, Providers, Result, pool::WorkerPool, retrieval::registry::BackendRegistry,
};

const EMBED_BATCH_SIZE: usize = 32;

/// One backend call: a single target searched in a single mode.
#[derive(Clone, Debug)]
pub struct BackendQuery<'a> {
	pub query: &'a str,
	pub embedding: Option<&'a [f32]>,
	pub target: &'a SearchTarget,
	pub mode: RetrievalMode,
	pub threshold: f32,
	pub top_k: u32,
}

pub trait RetrievalBackend
where
	Self: Send + Sync,
{
	fn driver(&self) -> RetrievalDriver;

	fn supports(&self, mode: RetrievalMode) -> bool {
		let _ = mode;

		true
	}

	fn search<'a>(
		&'a self,
		tenant_id: &'a str,
		query: &'a BackendQuery<'a>,
	) -> BoxFuture<'a, Result<Vec<SearchResult>>>;

	/// Writing a chunk ID that already exists replaces it.
	fn batch_index<'a>(
		&'a self,
		tenant_id: &'a str,
		units: &'a [EmbeddedUnit],
	) -> BoxFuture<'a, Result<()>>;

	/// Missing IDs are not an error.
	fn delete_by_source_ids<'a>(
		&'a self,
		tenant_id: &'a str,
		source_ids: &'a [String],
		embedding_dim: u32,
		kb_type: KnowledgeBaseType,
	) -> BoxFuture<'a, Result<()>>;
}

#[derive(Clone, Debug)]
pub struct SearchParams {
	pub query: String,
	pub targets: Vec<SearchTarget>,
	pub thresholds: Thresholds,
	pub top_k: u32,
	pub modes: Vec<RetrievalMode>,
}
impl SearchParams {
	pub fn new(
		query: impl Into<String>,
		targets: Vec<SearchTarget>,
		thresholds: Thresholds,
		top_k: u32,
	) -> Self {
		Self {
			query: query.into(),
			targets,
			thresholds,
			top_k,
			modes: vec![RetrievalMode::Keyword, RetrievalMode::Vector],
		}
	}
}

#[derive(Clone)]
pub(crate) struct ActiveBackend {
	pub(crate) backend: Arc<dyn RetrievalBackend>,
	pub(crate) mandatory: bool,
}

/// Fans searches and writes out to the backends active for a tenant.
pub struct RetrievalEngine {
	cfg: Arc<Config>,
	registry: BackendRegistry,
	providers: Providers,
	pool: WorkerPool,
}
impl RetrievalEngine {
	pub fn new(
		cfg: Arc<Config>,
		registry: BackendRegistry,
		providers: Providers,
		pool: WorkerPool,
	) -> Self {
		Self { cfg, registry, providers, pool }
	}

	pub fn registry(&self) -> &BackendRegistry {
		&self.registry
	}

	pub async fn embed_query(&self, query: &str) -> Result<Vec<f32>> {
		let texts = vec![query.to_string()];
		let mut vectors = self
			.pool
			.run(self.providers.embedding.embed(&self.cfg.providers.embedding, &texts))
			.await??;

		vectors.pop().ok_or_else(|| Error::Provider {
			message: "Embedding provider returned no vectors.".to_string(),
		})
	}

	/// Merged, deduplicated hits across every active backend, target, and mode.
	pub async fn search(&self, tenant_id: &str, params: &SearchParams) -> Result<Vec<SearchResult>> {
		if params.targets.is_empty() || params.query.trim().is_empty() {
			return Ok(Vec::new());
		}

		let active = self.active_for(tenant_id)?;
		let needs_embedding = params.modes.contains(&RetrievalMode::Vector)
			&& active.iter().any(|entry| entry.backend.supports(RetrievalMode::Vector));
		let embedding =
			if needs_embedding { Some(self.embed_query(&params.query).await?) } else { None };
		let mut calls = Vec::new();

		for entry in &active {
			for target in &params.targets {
				for mode in &params.modes {
					if !entry.backend.supports(*mode) {
						continue;
					}

					calls.push((
						entry,
						BackendQuery {
							query: &params.query,
							embedding: embedding.as_deref(),
							target,
							mode: *mode,
							threshold: params.thresholds.for_mode(*mode),
							top_k: params.top_k,
						},
					));
				}
			}
		}

		let outcomes = futures::future::join_all(calls.iter().map(|(entry, query)| async move {
			let outcome = self.pool.run(entry.backend.search(tenant_id, query)).await;

			(entry.backend.driver(), outcome.and_then(|inner| inner))
		}))
		.await;
		let mut hits = Vec::new();

		for (driver, outcome) in outcomes {
			match outcome {
				Ok(mut found) => hits.append(&mut found),
				Err(err) => match self.cfg.retrieval.failure_policy {
					FailurePolicy::FailFast => return Err(Error::backend(driver, err)),
					FailurePolicy::Degrade => tracing::warn!(
						driver = %driver,
						tenant_id,
						error = %err,
						"Retrieval backend failed; continuing with the remaining backends."
					),
				},
			}
		}

		Ok(merge_hits(hits, params.thresholds, params.top_k as usize))
	}

	/// Scores `results` with the rerank model, drops those under `threshold`, and keeps `top_k`.
	pub async fn rerank(
		&self,
		cfg: &ProviderConfig,
		query: &str,
		results: Vec<SearchResult>,
		top_k: usize,
		threshold: f32,
	) -> Result<Vec<SearchResult>> {
		if results.is_empty() {
			return Ok(results);
		}

		let docs: Vec<String> = results.iter().map(|result| result.content.clone()).collect();
		let scores = self.pool.run(self.providers.rerank.rerank(cfg, query, &docs)).await??;

		if scores.len() != results.len() {
			return Err(Error::Provider {
				message: format!(
					"Rerank returned {} scores for {} documents.",
					scores.len(),
					results.len()
				),
			});
		}

		Ok(apply_rerank_scores(results, &scores, top_k, threshold))
	}

	/// Embeds and writes `units` to every active backend. Only mandatory backends can fail the
	/// call; optional failures are logged.
	pub async fn batch_index(&self, tenant_id: &str, units: &[IndexWriteUnit]) -> Result<()> {
		let units = dedup_units(units);

		if units.is_empty() {
			return Ok(());
		}

		let embedded = self.embed_units(units).await?;
		let active = self.active_for(tenant_id)?;
		let outcomes = futures::future::join_all(active.iter().map(|entry| {
			let embedded = &embedded;

			async move {
				let outcome = self.pool.run(entry.backend.batch_index(tenant_id, embedded)).await;

				(entry, outcome.and_then(|inner| inner))
			}
		}))
		.await;
		let mut first_failure = None;

		for (entry, outcome) in outcomes {
			let driver = entry.backend.driver();

			match outcome {
				Ok(()) => tracing::debug!(driver = %driver, count = embedded.len(), "Units indexed."),
				Err(err) if entry.mandatory => {
					tracing::error!(driver = %driver, tenant_id, error = %err, "Mandatory index write failed.");

					first_failure.get_or_insert(Error::backend(driver, err));
				},
				Err(err) => tracing::warn!(
					driver = %driver,
					tenant_id,
					error = %err,
					"Optional index write failed."
				),
			}
		}

		match first_failure {
			Some(err) => Err(err),
			None => Ok(()),
		}
	}

	/// Removes entries from every active backend. Safe to repeat.
	pub async fn delete_by_source_ids(
		&self,
		tenant_id: &str,
		source_ids: &[String],
		embedding_dim: u32,
		kb_type: KnowledgeBaseType,
	) -> Result<()> {
		if source_ids.is_empty() {
			return Ok(());
		}

		let active = self.active_for(tenant_id)?;
		let outcomes = futures::future::join_all(active.iter().map(|entry| async move {
			let outcome = self
				.pool
				.run(entry.backend.delete_by_source_ids(tenant_id, source_ids, embedding_dim, kb_type))
				.await;

			(entry.backend.driver(), outcome.and_then(|inner| inner))
		}))
		.await;
		let mut first_failure = None;

		for (driver, outcome) in outcomes {
			if let Err(err) = outcome {
				tracing::warn!(driver = %driver, tenant_id, error = %err, "Index delete failed.");

				first_failure.get_or_insert(Error::backend(driver, err));
			}
		}

		match first_failure {
			Some(err) => Err(err),
			None => Ok(()),
		}
	}

	pub(crate) fn active_for(&self, tenant_id: &str) -> Result<Vec<ActiveBackend>> {
		let active = self.registry.active_for(&self.cfg.retrieval, tenant_id);

		if active.is_empty() {
			return Err(Error::InvalidRequest {
				message: format!("No retrieval backend is available for tenant {tenant_id}."),
			});
		}

		Ok(active)
	}

	async fn embed_units(&self, units: Vec<IndexWriteUnit>) -> Result<Vec<EmbeddedUnit>> {
		let cfg = &self.cfg.providers.embedding;
		let batches: Vec<Vec<String>> = units
			.chunks(EMBED_BATCH_SIZE)
			.map(|batch| batch.iter().map(|unit| unit.content.clone()).collect())
			.collect();
		let outcomes = futures::future::join_all(
			batches.iter().map(|texts| self.pool.run(self.providers.embedding.embed(cfg, texts))),
		)
		.await;
		let mut vectors = Vec::with_capacity(units.len());

		for outcome in outcomes {
			vectors.extend(outcome??);
		}

		if vectors.len() != units.len() {
			return Err(Error::Provider {
				message: format!(
					"Embedding provider returned {} vectors for {} units.",
					vectors.len(),
					units.len()
				),
			});
		}

		Ok(units
			.into_iter()
			.zip(vectors)
			.map(|(unit, embedding)| EmbeddedUnit { unit, embedding })
			.collect())
	}
}

/// Applies per-mode thresholds, keeps the best score per `(knowledge_id, chunk_id)`, orders by
/// score descending with a stable tie-break, and truncates to `top_k`.
pub fn merge_hits(hits: Vec<SearchResult>, thresholds: Thresholds, top_k: usize) -> Vec<SearchResult> {
	let mut best: AHashMap<(String, String), SearchResult> = AHashMap::new();

	for hit in hits {
		if !hit.score.is_finite() {
			continue;
		}
		if let Some(mode) = hit.match_type.retrieval_mode()
			&& hit.score < thresholds.for_mode(mode)
		{
			continue;
		}

		let key = (hit.knowledge_id.clone(), hit.chunk_id.clone());

		match best.get(&key) {
			Some(existing) if existing.score >= hit.score => {},
			_ => {
				best.insert(key, hit);
			},
		}
	}

	let mut merged: Vec<SearchResult> = best.into_values().collect();

	merged.sort_by(|a, b| {
		b.score
			.total_cmp(&a.score)
			.then_with(|| a.knowledge_id.cmp(&b.knowledge_id))
			.then_with(|| a.chunk_id.cmp(&b.chunk_id))
	});
	merged.truncate(top_k);

	merged
}

/// Ties keep their input order.
pub fn apply_rerank_scores(
	results: Vec<SearchResult>,
	scores: &[f32],
	top_k: usize,
	threshold: f32,
) -> Vec<SearchResult> {
	let mut kept: Vec<SearchResult> = results
		.into_iter()
		.zip(scores.iter().copied())
		.filter(|(_, score)| score.is_finite() && *score >= threshold)
		.map(|(mut result, score)| {
			result.score = score;

			result
		})
		.collect();

	kept.sort_by(|a, b| b.score.total_cmp(&a.score));
	kept.truncate(top_k);

	kept
}

/// The last unit wins when a batch repeats a chunk ID.
fn dedup_units(units: &[IndexWriteUnit]) -> Vec<IndexWriteUnit> {
	let mut by_id: BTreeMap<&str, (usize, &IndexWriteUnit)> = BTreeMap::new();

	for (position, unit) in units.iter().enumerate() {
		by_id.insert(&unit.chunk_id, (position, unit));
	}

	let mut ordered: Vec<(usize, &IndexWriteUnit)> = by_id.into_values().collect();

	ordered.sort_by_key(|(position, _)| *position);

	ordered.into_iter().map(|(_, unit)| unit.clone()).collect()
}
