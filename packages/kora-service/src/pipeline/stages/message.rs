use time::{OffsetDateTime, format_description::well_known::Rfc3339};

use kora_domain::search::SearchResult;

use crate::{
	BoxFuture, Error,
	pipeline::{
		ChatManage, EventType, Next, Plugin, PluginError, PluginResult, StageErrorKind,
		stages::render_template,
	},
};

/// Renders the final results into the user turn through the context template.
pub struct IntoChatMessage;
impl Plugin for IntoChatMessage {
	fn name(&self) -> &'static str {
		"into_chat_message"
	}

	fn activation_events(&self) -> &'static [EventType] {
		&[EventType::IntoChatMessage]
	}

	fn on_event<'a>(
		&'a self,
		_event: EventType,
		state: &'a mut ChatManage,
		next: Next<'a>,
	) -> BoxFuture<'a, PluginResult> {
		Box::pin(async move {
			let template = state.summary.context_template.clone();

			if template.trim().is_empty() {
				return Err(PluginError::stage(
					StageErrorKind::Template,
					"The context template is empty.",
					Error::InvalidRequest { message: "summary.context_template is empty.".to_string() },
				));
			}

			let now = OffsetDateTime::now_utc().format(&Rfc3339).map_err(|err| {
				PluginError::stage(
					StageErrorKind::Template,
					"Formatting the current time failed.",
					Error::Internal { message: err.to_string() },
				)
			})?;
			let contexts = render_contexts(&state.merge_result);

			state.user_content = render_template(
				&template,
				&[
					("query", state.query.as_str()),
					("contexts", contexts.as_str()),
					("current_time", now.as_str()),
				],
			);

			next.run(state).await
		})
	}
}

/// `[n] title` followed by the passage, one block per result.
pub fn render_contexts(results: &[SearchResult]) -> String {
	results
		.iter()
		.enumerate()
		.map(|(index, result)| {
			let title = if result.knowledge_title.is_empty() {
				&result.knowledge_filename
			} else {
				&result.knowledge_title
			};

			format!("[{}] {title}\n{}", index + 1, result.content.trim())
		})
		.collect::<Vec<_>>()
		.join("\n\n")
}
