use std::time::Duration;

use color_eyre::{Result, eyre};
use futures::StreamExt;
use reqwest::Client;
use serde_json::{Map, Value};
use tokio::sync::mpsc;

use kora_config::LlmProviderConfig;
use kora_domain::chat::{ChatMessage, ChatOptions, ChatResponse, Role, StreamFrame, ToolCall};

pub async fn chat(
	cfg: &LlmProviderConfig,
	messages: &[ChatMessage],
	opts: &ChatOptions,
) -> Result<ChatResponse> {
	let client = Client::builder().timeout(Duration::from_millis(cfg.timeout_ms)).build()?;
	let url = format!("{}{}", cfg.api_base, cfg.path);
	let res = client
		.post(url)
		.headers(crate::auth_headers(&cfg.api_key, &cfg.default_headers)?)
		.json(&request_body(cfg, messages, opts, false))
		.send()
		.await?;
	let json: Value = res.error_for_status()?.json().await?;

	parse_chat_response(json)
}

/// Starts a streaming completion. The reader task ends when the stream finishes, fails, or the
/// receiver is dropped.
pub async fn chat_stream(
	cfg: &LlmProviderConfig,
	messages: &[ChatMessage],
	opts: &ChatOptions,
	capacity: usize,
) -> Result<mpsc::Receiver<StreamFrame>> {
	let client =
		Client::builder().connect_timeout(Duration::from_millis(cfg.timeout_ms)).build()?;
	let url = format!("{}{}", cfg.api_base, cfg.path);
	let res = client
		.post(url)
		.headers(crate::auth_headers(&cfg.api_key, &cfg.default_headers)?)
		.json(&request_body(cfg, messages, opts, true))
		.send()
		.await?
		.error_for_status()?;
	let (tx, rx) = mpsc::channel(capacity.max(1));

	tokio::spawn(async move {
		let mut stream = Box::pin(res.bytes_stream());
		let mut decoder = SseDecoder::default();

		loop {
			let next = tokio::select! {
				_ = tx.closed() => return,
				next = stream.next() => next,
			};

			match next {
				Some(Ok(bytes)) =>
					for data in decoder.push(&bytes) {
						if data == "[DONE]" {
							let _ = tx.send(StreamFrame::answer("", true)).await;

							return;
						}

						let frames = match parse_stream_chunk(&data) {
							Ok(frames) => frames,
							Err(err) => vec![StreamFrame::error(err.to_string(), false)],
						};

						for frame in frames {
							let done = frame.done;

							if tx.send(frame).await.is_err() || done {
								return;
							}
						}
					},
				Some(Err(err)) => {
					let _ = tx.send(StreamFrame::error(err.to_string(), true)).await;

					return;
				},
				None => return,
			}
		}
	});

	Ok(rx)
}

/// Parses the first message of a completion as JSON, tolerating Markdown code fences.
pub fn parse_json_content(content: &str) -> Result<Value> {
	let trimmed = content.trim();
	let unfenced = trimmed
		.strip_prefix("```json")
		.or_else(|| trimmed.strip_prefix("```"))
		.and_then(|rest| rest.strip_suffix("```"))
		.unwrap_or(trimmed)
		.trim();

	serde_json::from_str(unfenced).map_err(|_| eyre::eyre!("Chat content is not valid JSON."))
}

fn request_body(
	cfg: &LlmProviderConfig,
	messages: &[ChatMessage],
	opts: &ChatOptions,
	stream: bool,
) -> Value {
	let mut body = Map::new();

	body.insert("model".to_string(), Value::from(cfg.model.clone()));
	body.insert("messages".to_string(), Value::Array(messages.iter().map(message_json).collect()));
	body.insert("temperature".to_string(), Value::from(opts.temperature.unwrap_or(cfg.temperature)));
	body.insert("stream".to_string(), Value::Bool(stream));

	if let Some(max) = opts.max_completion_tokens {
		body.insert("max_completion_tokens".to_string(), Value::from(max));
	}
	if let Some(thinking) = opts.thinking {
		body.insert("enable_thinking".to_string(), Value::Bool(thinking));
	}
	if !opts.tools.is_empty() {
		let tools = opts
			.tools
			.iter()
			.map(|tool| {
				serde_json::json!({
					"type": "function",
					"function": {
						"name": tool.name,
						"description": tool.description,
						"parameters": tool.parameters,
					},
				})
			})
			.collect();

		body.insert("tools".to_string(), Value::Array(tools));
		body.insert("tool_choice".to_string(), Value::from("auto"));
	}

	Value::Object(body)
}

fn message_json(message: &ChatMessage) -> Value {
	let role = match message.role {
		Role::System => "system",
		Role::User => "user",
		Role::Assistant => "assistant",
		Role::Tool => "tool",
	};
	let mut json = serde_json::json!({ "role": role, "content": message.content });

	if let Some(name) = &message.name {
		json["name"] = Value::from(name.clone());
	}
	if let Some(tool_call_id) = &message.tool_call_id {
		json["tool_call_id"] = Value::from(tool_call_id.clone());
	}
	if !message.tool_calls.is_empty() {
		json["tool_calls"] = Value::Array(
			message
				.tool_calls
				.iter()
				.map(|call| {
					serde_json::json!({
						"id": call.id,
						"type": "function",
						"function": { "name": call.name, "arguments": call.arguments },
					})
				})
				.collect(),
		);
	}

	json
}

fn parse_chat_response(json: Value) -> Result<ChatResponse> {
	let choice = json
		.get("choices")
		.and_then(|v| v.as_array())
		.and_then(|arr| arr.first())
		.ok_or_else(|| eyre::eyre!("Chat response is missing choices."))?;
	let message =
		choice.get("message").ok_or_else(|| eyre::eyre!("Chat choice is missing message."))?;
	let content = message.get("content").and_then(|v| v.as_str()).unwrap_or_default();
	let reasoning =
		message.get("reasoning_content").and_then(|v| v.as_str()).map(ToString::to_string);
	let tool_calls = message
		.get("tool_calls")
		.and_then(|v| v.as_array())
		.map(|calls| calls.iter().filter_map(parse_tool_call).collect())
		.unwrap_or_default();
	let finish_reason =
		choice.get("finish_reason").and_then(|v| v.as_str()).map(ToString::to_string);

	Ok(ChatResponse { content: content.to_string(), reasoning, tool_calls, finish_reason })
}

fn parse_tool_call(value: &Value) -> Option<ToolCall> {
	let function = value.get("function")?;
	let name = function.get("name")?.as_str()?;
	let arguments = match function.get("arguments") {
		Some(Value::String(raw)) => raw.clone(),
		Some(other) => other.to_string(),
		None => "{}".to_string(),
	};
	let id = value.get("id").and_then(|v| v.as_str()).unwrap_or(name);

	Some(ToolCall { id: id.to_string(), name: name.to_string(), arguments })
}

fn parse_stream_chunk(data: &str) -> Result<Vec<StreamFrame>> {
	let json: Value = serde_json::from_str(data)
		.map_err(|err| eyre::eyre!("Stream chunk is not valid JSON: {err}."))?;

	if let Some(message) =
		json.get("error").and_then(|err| err.get("message")).and_then(|m| m.as_str())
	{
		return Ok(vec![StreamFrame::error(message, true)]);
	}

	let Some(choice) = json.get("choices").and_then(|v| v.as_array()).and_then(|arr| arr.first())
	else {
		return Ok(Vec::new());
	};
	let delta = choice.get("delta");
	let mut frames = Vec::new();

	if let Some(reasoning) = delta
		.and_then(|d| d.get("reasoning_content"))
		.and_then(|v| v.as_str())
		.filter(|s| !s.is_empty())
	{
		frames.push(StreamFrame::thinking(reasoning));
	}
	if let Some(content) =
		delta.and_then(|d| d.get("content")).and_then(|v| v.as_str()).filter(|s| !s.is_empty())
	{
		frames.push(StreamFrame::answer(content, false));
	}
	if choice.get("finish_reason").and_then(|v| v.as_str()).is_some() {
		frames.push(StreamFrame::answer("", true));
	}

	Ok(frames)
}

/// Splits a server-sent-event byte stream into `data:` payloads.
#[derive(Debug, Default)]
struct SseDecoder {
	buffer: Vec<u8>,
}
impl SseDecoder {
	/// Only complete lines are decoded, so a character split across chunks stays intact.
	fn push(&mut self, bytes: &[u8]) -> Vec<String> {
		self.buffer.extend_from_slice(bytes);

		let mut payloads = Vec::new();

		while let Some(pos) = self.buffer.iter().position(|byte| *byte == b'\n') {
			let line: Vec<u8> = self.buffer.drain(..=pos).collect();
			let line = String::from_utf8_lossy(&line);

			if let Some(data) = line.trim().strip_prefix("data:") {
				let data = data.trim();

				if !data.is_empty() {
					payloads.push(data.to_string());
				}
			}
		}

		payloads
	}
}
