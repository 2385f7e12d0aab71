use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
	System,
	User,
	Assistant,
	Tool,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ChatMessage {
	pub role: Role,
	pub content: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub name: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub tool_call_id: Option<String>,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub tool_calls: Vec<ToolCall>,
}
impl ChatMessage {
	pub fn new(role: Role, content: impl Into<String>) -> Self {
		Self { role, content: content.into(), name: None, tool_call_id: None, tool_calls: Vec::new() }
	}

	pub fn system(content: impl Into<String>) -> Self {
		Self::new(Role::System, content)
	}

	pub fn user(content: impl Into<String>) -> Self {
		Self::new(Role::User, content)
	}

	pub fn assistant(content: impl Into<String>) -> Self {
		Self::new(Role::Assistant, content)
	}

	pub fn tool(
		tool_call_id: impl Into<String>,
		name: impl Into<String>,
		content: impl Into<String>,
	) -> Self {
		Self {
			role: Role::Tool,
			content: content.into(),
			name: Some(name.into()),
			tool_call_id: Some(tool_call_id.into()),
			tool_calls: Vec::new(),
		}
	}
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ToolCall {
	pub id: String,
	pub name: String,
	/// Raw JSON arguments as produced by the model.
	pub arguments: String,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ToolDefinition {
	pub name: String,
	pub description: String,
	pub parameters: Value,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct ChatOptions {
	pub temperature: Option<f32>,
	pub max_completion_tokens: Option<u32>,
	pub thinking: Option<bool>,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub tools: Vec<ToolDefinition>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct ChatResponse {
	pub content: String,
	#[serde(default)]
	pub reasoning: Option<String>,
	#[serde(default)]
	pub tool_calls: Vec<ToolCall>,
	#[serde(default)]
	pub finish_reason: Option<String>,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameKind {
	Thinking,
	Answer,
	Error,
}

/// One frame read from a streaming chat completion.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct StreamFrame {
	pub kind: FrameKind,
	pub content: String,
	pub done: bool,
}
impl StreamFrame {
	pub fn answer(content: impl Into<String>, done: bool) -> Self {
		Self { kind: FrameKind::Answer, content: content.into(), done }
	}

	pub fn thinking(content: impl Into<String>) -> Self {
		Self { kind: FrameKind::Thinking, content: content.into(), done: false }
	}

	pub fn error(content: impl Into<String>, done: bool) -> Self {
		Self { kind: FrameKind::Error, content: content.into(), done }
	}
}

/// Renders turns as plain `role: content` lines for prompts that embed a transcript.
pub fn render_transcript(messages: &[ChatMessage]) -> String {
	messages
		.iter()
		.filter(|message| !message.content.trim().is_empty())
		.map(|message| {
			let role = match message.role {
				Role::System => "system",
				Role::User => "user",
				Role::Assistant => "assistant",
				Role::Tool => "tool",
			};

			format!("{role}: {}", message.content.trim())
		})
		.collect::<Vec<_>>()
		.join("\n")
}
