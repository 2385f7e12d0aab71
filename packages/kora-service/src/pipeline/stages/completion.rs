use std::sync::Arc;

use kora_domain::{
	chat::ChatMessage,
	event::{self, StreamEvent},
};

use crate::{
	BoxFuture,
	pipeline::{
		ChatManage, EventType, Next, Plugin, PluginError, PluginResult, StageContext,
		StageErrorKind, cancellable,
		stages::{answer_messages, answer_options},
	},
};

/// One blocking completion, emitted as a single terminal answer event.
pub struct ChatCompletion {
	ctx: Arc<StageContext>,
}
impl ChatCompletion {
	pub fn new(ctx: Arc<StageContext>) -> Self {
		Self { ctx }
	}
}
impl Plugin for ChatCompletion {
	fn name(&self) -> &'static str {
		"chat_completion"
	}

	fn activation_events(&self) -> &'static [EventType] {
		&[EventType::ChatCompletion]
	}

	fn on_event<'a>(
		&'a self,
		_event: EventType,
		state: &'a mut ChatManage,
		next: Next<'a>,
	) -> BoxFuture<'a, PluginResult> {
		Box::pin(async move {
			let messages = answer_messages(state);
			let opts = answer_options(&state.summary);
			let response = cancellable(
				&state.cancel,
				self.ctx.providers.chat.chat(&self.ctx.cfg.providers.chat, &messages, &opts),
			)
			.await?
			.map_err(|err| {
				PluginError::stage(StageErrorKind::ModelCall, "Chat completion failed.", err.into())
			})?;

			if !state.merge_result.is_empty() {
				state
					.bus
					.emit_until(
						StreamEvent::references(&state.session_id, state.merge_result.clone()),
						&state.cancel,
					)
					.await;
			}

			let answer = response.content;
			let answer_id = event::event_id("answer");

			state
				.bus
				.emit_until(
					StreamEvent::answer(&answer_id, &state.session_id, answer.clone(), true),
					&state.cancel,
				)
				.await;

			let turns = vec![ChatMessage::user(state.query.clone()), ChatMessage::assistant(answer.clone())];

			if let Err(err) = self.ctx.context.add_messages(&state.session_id, turns).await {
				tracing::warn!(
					session_id = %state.session_id,
					error = %err,
					"Recording the answer in session history failed."
				);
			}

			state.answer = Some(answer);

			next.run(state).await
		})
	}
}
