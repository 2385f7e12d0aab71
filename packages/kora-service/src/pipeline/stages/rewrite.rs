use std::sync::Arc;

use kora_domain::chat::{self, ChatMessage, ChatOptions, Role};

use crate::{
	BoxFuture, Result,
	pipeline::{
		ChatManage, EventType, Next, Plugin, PluginResult, StageContext, cancellable,
		stages::{history, render_template},
	},
};

/// Rewrites a follow-up question into a standalone one. Never fails the pipeline.
pub struct RewriteQuery {
	ctx: Arc<StageContext>,
}
impl RewriteQuery {
	pub fn new(ctx: Arc<StageContext>) -> Self {
		Self { ctx }
	}

	async fn rewrite(&self, query: &str, turns: &[ChatMessage]) -> Result<String> {
		let conversation = &self.ctx.cfg.conversation;
		let transcript = chat::render_transcript(turns);
		let user = render_template(
			&conversation.rewrite_prompt_user,
			&[("conversation", transcript.as_str()), ("query", query)],
		);
		let messages =
			vec![ChatMessage::system(conversation.rewrite_prompt_system.clone()), ChatMessage::user(user)];
		let opts = ChatOptions { temperature: Some(0.1), thinking: Some(false), ..Default::default() };
		let response =
			self.ctx.providers.chat.chat(&self.ctx.cfg.providers.chat, &messages, &opts).await?;

		Ok(response.content.trim().to_string())
	}
}
impl Plugin for RewriteQuery {
	fn name(&self) -> &'static str {
		"rewrite_query"
	}

	fn activation_events(&self) -> &'static [EventType] {
		&[EventType::RewriteQuery]
	}

	fn on_event<'a>(
		&'a self,
		_event: EventType,
		state: &'a mut ChatManage,
		next: Next<'a>,
	) -> BoxFuture<'a, PluginResult> {
		Box::pin(async move {
			if !state.retrieval.enable_rewrite || state.retrieval.max_rounds == 0 {
				return next.run(state).await;
			}

			if state.history.is_empty() {
				let loaded =
					cancellable(&state.cancel, self.ctx.context.get_context(&state.session_id)).await?;

				match loaded {
					Ok(context) => state.history = history::recent_turns(context, state.retrieval.max_rounds),
					Err(err) => tracing::warn!(
						session_id = %state.session_id,
						error = %err,
						"Loading history for rewrite failed; keeping the original query."
					),
				}
			}

			let turns: Vec<ChatMessage> =
				state.history.iter().filter(|message| message.role != Role::System).cloned().collect();

			if !turns.is_empty() {
				let rewritten = cancellable(&state.cancel, self.rewrite(&state.query, &turns)).await?;

				match rewritten {
					Ok(rewritten) if !rewritten.is_empty() => {
						tracing::debug!(
							session_id = %state.session_id,
							rewritten = %rewritten,
							"Query rewritten."
						);

						state.rewrite_query = rewritten;
					},
					Ok(_) => {},
					Err(err) => tracing::warn!(
						session_id = %state.session_id,
						error = %err,
						"Query rewrite failed; keeping the original query."
					),
				}
			}

			next.run(state).await
		})
	}
}
