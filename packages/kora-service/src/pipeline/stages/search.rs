use std::sync::Arc;

use kora_domain::search::{self, ChunkType, MatchType, SearchResult};
use kora_providers::web_search::WebSearchHit;

use crate::{
	BoxFuture,
	pipeline::{
		ChatManage, EventType, Next, Plugin, PluginError, PluginResult, StageContext,
		StageErrorKind, cancellable, stages::entity,
	},
	retrieval::{SearchParams, merge_hits},
};

/// Hybrid chunk retrieval, plus graph and web hits when available. The parallel variant runs
/// graph retrieval alongside chunk retrieval.
pub struct ChunkSearch {
	ctx: Arc<StageContext>,
}
impl ChunkSearch {
	pub fn new(ctx: Arc<StageContext>) -> Self {
		Self { ctx }
	}

	/// Entities and related chunks. Failures only cost the graph hits.
	async fn graph_search(&self, state: &ChatManage) -> (Vec<String>, Vec<SearchResult>) {
		let Some(graph) = &self.ctx.graph else {
			return (Vec::new(), Vec::new());
		};

		if state.search_targets.is_empty() {
			return (Vec::new(), Vec::new());
		}

		let entities = if state.entities.is_empty() {
			match entity::extract_entities(&self.ctx, state.search_query()).await {
				Ok(entities) => entities,
				Err(err) => {
					tracing::warn!(
						session_id = %state.session_id,
						error = %err,
						"Entity extraction failed; skipping graph search."
					);

					return (Vec::new(), Vec::new());
				},
			}
		} else {
			state.entities.clone()
		};

		if entities.is_empty() {
			return (entities, Vec::new());
		}

		let knowledge_base_ids = search::knowledge_base_ids(&state.search_targets);

		match graph
			.related_chunks(
				&state.tenant_id,
				&knowledge_base_ids,
				&entities,
				state.retrieval.embedding_top_k,
			)
			.await
		{
			Ok(mut hits) => {
				hits.retain(|hit| {
					state
						.search_targets
						.iter()
						.any(|target| target.contains(&hit.knowledge_base_id, &hit.knowledge_id))
				});

				for hit in &mut hits {
					hit.match_type = MatchType::Graph;
				}

				(entities, hits)
			},
			Err(err) => {
				tracing::warn!(
					session_id = %state.session_id,
					error = %err,
					"Graph search failed; continuing without graph hits."
				);

				(entities, Vec::new())
			},
		}
	}

	async fn web_search(&self, state: &ChatManage) -> Vec<SearchResult> {
		if !state.web_search_enabled {
			return Vec::new();
		}

		let Some(cfg) = &self.ctx.cfg.providers.web_search else {
			tracing::warn!(
				session_id = %state.session_id,
				"Web search was requested but no provider is configured."
			);

			return Vec::new();
		};

		match self
			.ctx
			.providers
			.web_search
			.search(cfg, state.search_query(), self.ctx.cfg.agent.web_search_max_results)
			.await
		{
			Ok(hits) => web_results(hits),
			Err(err) => {
				tracing::warn!(
					session_id = %state.session_id,
					error = %err,
					"Web search failed; continuing without web hits."
				);

				Vec::new()
			},
		}
	}
}
impl Plugin for ChunkSearch {
	fn name(&self) -> &'static str {
		"chunk_search"
	}

	fn activation_events(&self) -> &'static [EventType] {
		&[EventType::ChunkSearch, EventType::ChunkSearchParallel]
	}

	fn on_event<'a>(
		&'a self,
		event: EventType,
		state: &'a mut ChatManage,
		next: Next<'a>,
	) -> BoxFuture<'a, PluginResult> {
		Box::pin(async move {
			let params = SearchParams::new(
				state.search_query(),
				state.search_targets.clone(),
				state.retrieval.thresholds(),
				state.retrieval.embedding_top_k,
			);
			let shared: &ChatManage = state;
			let (chunks, (entities, graph), web) = cancellable(&shared.cancel, async {
				let chunks = self.ctx.retrieval.search(&shared.tenant_id, &params);

				if event == EventType::ChunkSearchParallel {
					tokio::join!(chunks, self.graph_search(shared), self.web_search(shared))
				} else {
					let (chunks, web) = tokio::join!(chunks, self.web_search(shared));

					(chunks, (Vec::new(), Vec::new()), web)
				}
			})
			.await?;
			let chunks = chunks.map_err(|err| {
				PluginError::stage(StageErrorKind::Search, "Knowledge search failed.", err)
			})?;
			let (chunk_count, graph_count, web_count) = (chunks.len(), graph.len(), web.len());
			let mut hits = chunks;

			hits.extend(graph);
			hits.extend(web);

			if !entities.is_empty() {
				state.entities = entities;
			}

			state.search_result = merge_hits(hits, state.retrieval.thresholds(), usize::MAX);

			tracing::info!(
				session_id = %state.session_id,
				chunks = chunk_count,
				graph = graph_count,
				web = web_count,
				total = state.search_result.len(),
				"Search finished."
			);

			if state.search_result.is_empty() {
				return Err(PluginError::SearchNothing);
			}

			next.run(state).await
		})
	}
}

/// Provider order is kept through a decaying score.
fn web_results(hits: Vec<WebSearchHit>) -> Vec<SearchResult> {
	hits.into_iter()
		.enumerate()
		.map(|(rank, hit)| SearchResult {
			id: hit.url.clone(),
			content: format!("{}\n{}", hit.title, hit.snippet),
			knowledge_id: hit.url.clone(),
			knowledge_base_id: String::new(),
			chunk_id: hit.url.clone(),
			chunk_index: 0,
			knowledge_title: hit.title,
			knowledge_filename: hit.url,
			chunk_type: ChunkType::Text,
			match_type: MatchType::WebSearch,
			score: 1.0 / (rank as f32 + 1.0),
		})
		.collect()
}
