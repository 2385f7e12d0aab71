use crate::{
	BoxFuture,
	pipeline::{ChatManage, EventType, Next, Plugin, PluginResult},
};

/// Caps the final result list at the rerank top-K.
pub struct FilterTopK;
impl Plugin for FilterTopK {
	fn name(&self) -> &'static str {
		"filter_top_k"
	}

	fn activation_events(&self) -> &'static [EventType] {
		&[EventType::FilterTopK]
	}

	fn on_event<'a>(
		&'a self,
		_event: EventType,
		state: &'a mut ChatManage,
		next: Next<'a>,
	) -> BoxFuture<'a, PluginResult> {
		Box::pin(async move {
			let mut results = state.best_results().to_vec();

			results.truncate(state.retrieval.rerank_top_k as usize);

			state.merge_result = results;

			next.run(state).await
		})
	}
}
