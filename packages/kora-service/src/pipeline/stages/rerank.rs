use std::sync::Arc;

use crate::{
	BoxFuture,
	pipeline::{
		ChatManage, EventType, Next, Plugin, PluginError, PluginResult, StageContext,
		StageErrorKind, cancellable,
	},
};

pub struct ChunkRerank {
	ctx: Arc<StageContext>,
}
impl ChunkRerank {
	pub fn new(ctx: Arc<StageContext>) -> Self {
		Self { ctx }
	}
}
impl Plugin for ChunkRerank {
	fn name(&self) -> &'static str {
		"chunk_rerank"
	}

	fn activation_events(&self) -> &'static [EventType] {
		&[EventType::ChunkRerank]
	}

	fn on_event<'a>(
		&'a self,
		_event: EventType,
		state: &'a mut ChatManage,
		next: Next<'a>,
	) -> BoxFuture<'a, PluginResult> {
		Box::pin(async move {
			if !state.retrieval.enable_rerank || state.search_result.is_empty() {
				state.rerank_result = state.search_result.clone();

				return next.run(state).await;
			}

			let candidates = state.search_result.clone();
			let reranked = cancellable(
				&state.cancel,
				self.ctx.retrieval.rerank(
					&self.ctx.cfg.providers.rerank,
					state.search_query(),
					candidates,
					state.retrieval.rerank_top_k as usize,
					state.retrieval.rerank_threshold,
				),
			)
			.await?;

			state.rerank_result = reranked.map_err(|err| {
				PluginError::stage(StageErrorKind::Rerank, "Reranking failed.", err)
			})?;

			tracing::debug!(
				session_id = %state.session_id,
				before = state.search_result.len(),
				after = state.rerank_result.len(),
				"Results reranked."
			);

			if state.rerank_result.is_empty() {
				return Err(PluginError::SearchNothing);
			}

			next.run(state).await
		})
	}
}
