use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::search::SearchResult;

#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
	Answer,
	Thought,
	ToolCall,
	ToolResult,
	Reflection,
	References,
	Error,
	Stop,
}
impl EventKind {
	pub fn as_str(self) -> &'static str {
		match self {
			Self::Answer => "answer",
			Self::Thought => "thought",
			Self::ToolCall => "tool_call",
			Self::ToolResult => "tool_result",
			Self::Reflection => "reflection",
			Self::References => "references",
			Self::Error => "error",
			Self::Stop => "stop",
		}
	}
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventData {
	Text { content: String },
	ToolCall { tool_call_id: String, tool_name: String, arguments: String, iteration: u32 },
	ToolResult { tool_call_id: String, tool_name: String, output: String, success: bool },
	References { references: Vec<SearchResult> },
	Error { stage: String, message: String },
	Stop { reason: String },
}

/// One frame of the outbound stream. Events sharing an `id` form one logical series that ends
/// with exactly one `done = true` event.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct StreamEvent {
	pub id: String,
	pub kind: EventKind,
	pub session_id: String,
	pub data: EventData,
	pub done: bool,
}
impl StreamEvent {
	pub fn answer(id: &str, session_id: &str, content: impl Into<String>, done: bool) -> Self {
		Self {
			id: id.to_string(),
			kind: EventKind::Answer,
			session_id: session_id.to_string(),
			data: EventData::Text { content: content.into() },
			done,
		}
	}

	pub fn text(kind: EventKind, session_id: &str, content: impl Into<String>) -> Self {
		Self {
			id: event_id(kind.as_str()),
			kind,
			session_id: session_id.to_string(),
			data: EventData::Text { content: content.into() },
			done: true,
		}
	}

	pub fn references(session_id: &str, references: Vec<SearchResult>) -> Self {
		Self {
			id: event_id("references"),
			kind: EventKind::References,
			session_id: session_id.to_string(),
			data: EventData::References { references },
			done: true,
		}
	}

	pub fn tool_call(
		session_id: &str,
		tool_call_id: &str,
		tool_name: &str,
		arguments: &str,
		iteration: u32,
	) -> Self {
		Self {
			id: event_id("tool-call"),
			kind: EventKind::ToolCall,
			session_id: session_id.to_string(),
			data: EventData::ToolCall {
				tool_call_id: tool_call_id.to_string(),
				tool_name: tool_name.to_string(),
				arguments: arguments.to_string(),
				iteration,
			},
			done: true,
		}
	}

	pub fn tool_result(
		session_id: &str,
		tool_call_id: &str,
		tool_name: &str,
		output: impl Into<String>,
		success: bool,
	) -> Self {
		Self {
			id: event_id("tool-result"),
			kind: EventKind::ToolResult,
			session_id: session_id.to_string(),
			data: EventData::ToolResult {
				tool_call_id: tool_call_id.to_string(),
				tool_name: tool_name.to_string(),
				output: output.into(),
				success,
			},
			done: true,
		}
	}

	pub fn error(id: &str, session_id: &str, stage: &str, message: impl Into<String>) -> Self {
		Self {
			id: id.to_string(),
			kind: EventKind::Error,
			session_id: session_id.to_string(),
			data: EventData::Error { stage: stage.to_string(), message: message.into() },
			done: true,
		}
	}

	pub fn stop(session_id: &str, reason: impl Into<String>) -> Self {
		Self {
			id: event_id("stop"),
			kind: EventKind::Stop,
			session_id: session_id.to_string(),
			data: EventData::Stop { reason: reason.into() },
			done: true,
		}
	}

	pub fn content(&self) -> Option<&str> {
		match &self.data {
			EventData::Text { content } => Some(content),
			EventData::ToolResult { output, .. } => Some(output),
			EventData::Error { message, .. } => Some(message),
			_ => None,
		}
	}
}

/// `{8 hex chars}-{suffix}`, unique per logical series.
pub fn event_id(suffix: &str) -> String {
	let raw = Uuid::new_v4().simple().to_string();

	format!("{}-{suffix}", &raw[..8])
}
