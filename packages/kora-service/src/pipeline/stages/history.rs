use std::sync::Arc;

use kora_domain::chat::{ChatMessage, Role};

use crate::{
	BoxFuture,
	pipeline::{
		ChatManage, EventType, Next, Plugin, PluginError, PluginResult, StageContext,
		StageErrorKind, cancellable,
	},
};

pub struct LoadHistory {
	ctx: Arc<StageContext>,
}
impl LoadHistory {
	pub fn new(ctx: Arc<StageContext>) -> Self {
		Self { ctx }
	}
}
impl Plugin for LoadHistory {
	fn name(&self) -> &'static str {
		"load_history"
	}

	fn activation_events(&self) -> &'static [EventType] {
		&[EventType::LoadHistory]
	}

	fn on_event<'a>(
		&'a self,
		_event: EventType,
		state: &'a mut ChatManage,
		next: Next<'a>,
	) -> BoxFuture<'a, PluginResult> {
		Box::pin(async move {
			let context = cancellable(&state.cancel, self.ctx.context.get_context(&state.session_id))
				.await?
				.map_err(|err| {
					PluginError::stage(StageErrorKind::History, "Loading session history failed.", err)
				})?;

			state.history = recent_turns(context, state.retrieval.max_rounds);

			tracing::debug!(
				session_id = %state.session_id,
				turns = state.history.len(),
				"Session history loaded."
			);

			next.run(state).await
		})
	}
}

/// Keeps the leading system turn and the last `max_rounds` question/answer pairs.
pub(crate) fn recent_turns(messages: Vec<ChatMessage>, max_rounds: u32) -> Vec<ChatMessage> {
	let (system, turns): (Vec<ChatMessage>, Vec<ChatMessage>) =
		messages.into_iter().partition(|message| message.role == Role::System);
	let keep = max_rounds as usize * 2;
	let skip = turns.len().saturating_sub(keep);
	let mut recent: Vec<ChatMessage> = turns.into_iter().skip(skip).collect();

	// A window must not open on a dangling tool result.
	while recent.first().is_some_and(|message| message.role == Role::Tool) {
		recent.remove(0);
	}

	system.into_iter().chain(recent).collect()
}
