use std::sync::Arc;

use kora_domain::search::{ChunkType, MatchType, SearchResult};

use crate::{
	BoxFuture, Result,
	analysis::TableData,
	catalog::TableSource,
	pipeline::{
		ChatManage, EventType, Next, Plugin, PluginError, PluginResult, StageContext,
		StageErrorKind, cancellable,
	},
};

const MAX_TABLES: usize = 3;

/// Answers table questions with SQL over the tables behind table-schema hits. The query output
/// is prepended to the results as a `data_analysis` hit.
pub struct DataAnalysis {
	ctx: Arc<StageContext>,
}
impl DataAnalysis {
	pub fn new(ctx: Arc<StageContext>) -> Self {
		Self { ctx }
	}

	async fn analyse(
		&self,
		hit: &SearchResult,
		table: TableSource,
		question: &str,
	) -> Result<SearchResult> {
		let data = TableData::from_csv(&table.filename, &table.content)?;
		let (sql, output) = self
			.ctx
			.tabular
			.ask(self.ctx.providers.chat.as_ref(), &self.ctx.cfg.providers.chat, data, question)
			.await?;

		Ok(SearchResult {
			id: format!("{}-analysis", hit.knowledge_id),
			content: format!("SQL: {sql}\n{}", output.render()),
			knowledge_id: hit.knowledge_id.clone(),
			knowledge_base_id: hit.knowledge_base_id.clone(),
			chunk_id: format!("{}-analysis", hit.knowledge_id),
			chunk_index: 0,
			knowledge_title: hit.knowledge_title.clone(),
			knowledge_filename: hit.knowledge_filename.clone(),
			chunk_type: ChunkType::Text,
			match_type: MatchType::DataAnalysis,
			score: 1.0,
		})
	}
}
impl Plugin for DataAnalysis {
	fn name(&self) -> &'static str {
		"data_analysis"
	}

	fn activation_events(&self) -> &'static [EventType] {
		&[EventType::DataAnalysis]
	}

	fn on_event<'a>(
		&'a self,
		_event: EventType,
		state: &'a mut ChatManage,
		next: Next<'a>,
	) -> BoxFuture<'a, PluginResult> {
		Box::pin(async move {
			let tables = table_hits(state.best_results());
			let mut analysed = Vec::new();

			for hit in tables {
				let loaded = cancellable(
					&state.cancel,
					self.ctx.catalog.load_table(&state.tenant_id, &hit.knowledge_id),
				)
				.await?
				.map_err(|err| {
					PluginError::stage(StageErrorKind::DataAnalysis, "Loading table failed.", err)
				})?;
				let Some(table) = loaded else {
					tracing::debug!(knowledge_id = %hit.knowledge_id, "No table source; skipping analysis.");

					continue;
				};

				match cancellable(&state.cancel, self.analyse(&hit, table, &state.query)).await? {
					Ok(result) => analysed.push(result),
					Err(err) => tracing::warn!(
						session_id = %state.session_id,
						knowledge_id = %hit.knowledge_id,
						error = %err,
						"Table analysis failed; continuing without it."
					),
				}
			}

			if !analysed.is_empty() {
				let mut results = analysed;

				results.extend(state.best_results().iter().cloned());

				state.merge_result = results;
			}

			next.run(state).await
		})
	}
}

/// The first hit of each distinct table, in result order.
fn table_hits(results: &[SearchResult]) -> Vec<SearchResult> {
	let mut hits: Vec<SearchResult> = Vec::new();

	for result in results {
		if hits.len() == MAX_TABLES {
			break;
		}
		if result.chunk_type.is_table()
			&& !hits.iter().any(|hit| hit.knowledge_id == result.knowledge_id)
		{
			hits.push(result.clone());
		}
	}

	hits
}
