use std::sync::Arc;

use serde_json::Value;

use kora_domain::chat::{ChatMessage, ChatOptions};

use crate::{
	BoxFuture, Error, Result,
	pipeline::{
		ChatManage, EventType, Next, Plugin, PluginError, PluginResult, StageContext,
		StageErrorKind, cancellable, stages::strip_code_fence,
	},
};

const MAX_ENTITIES: usize = 16;

/// Fills `entities` for graph retrieval. Skipped when no graph store is configured.
pub struct ExtractEntity {
	ctx: Arc<StageContext>,
}
impl ExtractEntity {
	pub fn new(ctx: Arc<StageContext>) -> Self {
		Self { ctx }
	}
}
impl Plugin for ExtractEntity {
	fn name(&self) -> &'static str {
		"extract_entity"
	}

	fn activation_events(&self) -> &'static [EventType] {
		&[EventType::ExtractEntity]
	}

	fn on_event<'a>(
		&'a self,
		_event: EventType,
		state: &'a mut ChatManage,
		next: Next<'a>,
	) -> BoxFuture<'a, PluginResult> {
		Box::pin(async move {
			if self.ctx.graph.is_none() || !state.entities.is_empty() {
				return next.run(state).await;
			}

			let extracted =
				cancellable(&state.cancel, extract_entities(&self.ctx, state.search_query())).await?;

			state.entities = extracted.map_err(|err| {
				PluginError::stage(StageErrorKind::EntityExtraction, "Entity extraction failed.", err)
			})?;

			tracing::debug!(
				session_id = %state.session_id,
				entities = ?state.entities,
				"Entities extracted."
			);

			next.run(state).await
		})
	}
}

pub(crate) async fn extract_entities(ctx: &StageContext, query: &str) -> Result<Vec<String>> {
	let messages = vec![
		ChatMessage::system(ctx.cfg.conversation.extract_entities_prompt.clone()),
		ChatMessage::user(query.to_string()),
	];
	let opts = ChatOptions { temperature: Some(0.0), thinking: Some(false), ..Default::default() };
	let response = ctx.providers.chat.chat(&ctx.cfg.providers.chat, &messages, &opts).await?;

	parse_entities(&response.content)
}

/// Accepts a JSON array of strings, or an object holding one under `entities`.
pub(crate) fn parse_entities(raw: &str) -> Result<Vec<String>> {
	let value: Value = serde_json::from_str(strip_code_fence(raw)).map_err(|err| Error::Provider {
		message: format!("Entity reply is not JSON: {err}."),
	})?;
	let items = match &value {
		Value::Array(items) => items,
		Value::Object(object) => match object.get("entities") {
			Some(Value::Array(items)) => items,
			_ => {
				return Err(Error::Provider {
					message: "Entity reply has no entities array.".to_string(),
				});
			},
		},
		_ => {
			return Err(Error::Provider {
				message: "Entity reply must be a JSON array.".to_string(),
			});
		},
	};
	let mut entities: Vec<String> = Vec::new();

	for item in items {
		let Some(name) = item.as_str().map(str::trim).filter(|name| !name.is_empty()) else {
			continue;
		};

		if !entities.iter().any(|existing| existing.eq_ignore_ascii_case(name)) {
			entities.push(name.to_string());
		}
		if entities.len() == MAX_ENTITIES {
			break;
		}
	}

	Ok(entities)
}
