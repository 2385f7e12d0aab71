use std::sync::Arc;

use serde_json::Value;
use time::{OffsetDateTime, format_description::well_known::Rfc3339};

use kora_domain::{
	chat::{ChatMessage, ChatOptions, ChatResponse, Role, ToolCall},
	event::{self, EventKind, StreamEvent},
	search::SearchResult,
};

use crate::{
	Error, Result,
	agent::{
		config::AgentRunConfig,
		prompts::{self, REFLECTION_PROMPT},
		tools::{ToolContext, ToolOutput, ToolRegistry},
	},
	bus::EventBus,
	cancel::CancelToken,
	pipeline::StageContext,
};

/// How a run ended. Every outcome has already emitted its terminal answer event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AgentOutcome {
	Answered(String),
	IterationCapReached(String),
	Cancelled,
}

/// One agent run: think, call tools, observe, repeat until an answer, the iteration cap, or a
/// stop.
pub struct AgentEngine {
	ctx: Arc<StageContext>,
	bus: Arc<EventBus>,
	tools: ToolRegistry,
	run: AgentRunConfig,
	tenant_id: String,
	session_id: String,
	cancel: CancelToken,
	answer_id: String,
}
impl AgentEngine {
	pub fn new(
		ctx: Arc<StageContext>,
		bus: Arc<EventBus>,
		tools: ToolRegistry,
		run: AgentRunConfig,
		tenant_id: &str,
		session_id: &str,
		cancel: CancelToken,
	) -> Self {
		Self {
			ctx,
			bus,
			tools,
			run,
			tenant_id: tenant_id.to_string(),
			session_id: session_id.to_string(),
			cancel,
			answer_id: event::event_id("answer"),
		}
	}

	pub fn run_config(&self) -> &AgentRunConfig {
		&self.run
	}

	pub async fn run(&self, query: &str) -> Result<AgentOutcome> {
		let Some(mut messages) = self.initial_messages(query).await else {
			return Ok(self.stopped().await);
		};
		let opts = ChatOptions {
			temperature: Some(self.run.temperature()),
			tools: self.tools.definitions(),
			..Default::default()
		};
		let mut references: Vec<SearchResult> = Vec::new();
		let mut last_text = String::new();

		for iteration in 1..=self.run.max_iterations() {
			let Some(response) = self.think(&messages, &opts).await? else {
				return Ok(self.stopped().await);
			};

			if let Some(reasoning) = response.reasoning.as_deref().filter(|text| !text.trim().is_empty()) {
				self.emit(StreamEvent::text(EventKind::Thought, &self.session_id, reasoning)).await;
			}

			if response.tool_calls.is_empty() {
				let answer = response.content;

				self.finish(&references, &answer).await;
				self.record(query, &answer).await;

				tracing::info!(session_id = %self.session_id, iteration, "Agent answered.");

				return Ok(AgentOutcome::Answered(answer));
			}

			if !response.content.trim().is_empty() {
				self.emit(StreamEvent::text(EventKind::Thought, &self.session_id, response.content.clone()))
					.await;

				last_text = response.content.clone();
			}

			let mut turn = ChatMessage::assistant(response.content);

			turn.tool_calls = response.tool_calls.clone();
			messages.push(turn);

			for call in &response.tool_calls {
				self.emit(StreamEvent::tool_call(
					&self.session_id,
					&call.id,
					&call.name,
					&call.arguments,
					iteration,
				))
				.await;

				let Some(output) = self.call_tool(call).await else {
					return Ok(self.stopped().await);
				};

				self.emit(StreamEvent::tool_result(
					&self.session_id,
					&call.id,
					&call.name,
					output.content.clone(),
					output.success,
				))
				.await;

				for reference in output.references {
					if !references.iter().any(|known| known.dedup_key() == reference.dedup_key()) {
						references.push(reference);
					}
				}

				messages.push(ChatMessage::tool(call.id.clone(), call.name.clone(), output.content));
			}

			if self.run.reflection_enabled() && iteration < self.run.max_iterations() {
				let Some(reflection) = self.reflect(&messages).await else {
					return Ok(self.stopped().await);
				};

				if let Some(reflection) = reflection {
					self.emit(StreamEvent::text(EventKind::Reflection, &self.session_id, reflection.clone()))
						.await;

					messages.push(ChatMessage::assistant(reflection));
				}
			}
		}

		tracing::warn!(
			session_id = %self.session_id,
			max_iterations = self.run.max_iterations(),
			"Agent reached its iteration cap."
		);

		let content = if last_text.trim().is_empty() {
			self.run.iteration_cap_notice().to_string()
		} else {
			last_text
		};

		self.finish(&references, &content).await;

		Ok(AgentOutcome::IterationCapReached(content))
	}

	/// `None` when the run was stopped while loading history.
	async fn initial_messages(&self, query: &str) -> Option<Vec<ChatMessage>> {
		let history = tokio::select! {
			biased;
			_ = self.cancel.cancelled() => return None,
			history = self.ctx.context.get_context(&self.session_id) => history,
		};
		let history = history.unwrap_or_else(|err| {
			tracing::warn!(
				session_id = %self.session_id,
				error = %err,
				"Loading history for the agent failed; starting without it."
			);

			Vec::new()
		});
		let now = OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_default();
		let mut system = prompts::system_prompt(&self.run, &self.tools.names(), &now);
		let mut messages = Vec::with_capacity(history.len() + 2);

		for message in history {
			if message.role == Role::System {
				system.push_str("\n\n");
				system.push_str(&message.content);
			} else {
				messages.push(message);
			}
		}

		messages.insert(0, ChatMessage::system(system));
		messages.push(ChatMessage::user(query.to_string()));

		Some(messages)
	}

	/// `Ok(None)` when stopped. A failed model call ends the series with an error event.
	async fn think(
		&self,
		messages: &[ChatMessage],
		opts: &ChatOptions,
	) -> Result<Option<ChatResponse>> {
		let response = tokio::select! {
			biased;
			_ = self.cancel.cancelled() => return Ok(None),
			response = self.ctx.providers.chat.chat(&self.ctx.cfg.providers.chat, messages, opts) => response,
		};

		match response {
			Ok(response) => Ok(Some(response)),
			Err(err) => {
				let message = err.to_string();

				tracing::error!(session_id = %self.session_id, error = %message, "Agent model call failed.");

				self.emit(StreamEvent::error(&self.answer_id, &self.session_id, "model_call", message.clone()))
					.await;

				Err(Error::Provider { message })
			},
		}
	}

	/// `None` when stopped. Tool failures become unsuccessful outputs the model can read.
	async fn call_tool(&self, call: &ToolCall) -> Option<ToolOutput> {
		let Some(tool) = self.tools.get(&call.name) else {
			return Some(ToolOutput::failed(format!("Unknown tool {}.", call.name)));
		};
		let arguments = if call.arguments.trim().is_empty() {
			Value::Object(Default::default())
		} else {
			match serde_json::from_str::<Value>(&call.arguments) {
				Ok(arguments) => arguments,
				Err(err) =>
					return Some(ToolOutput::failed(format!("Arguments are not valid JSON: {err}."))),
			}
		};
		let ctx = ToolContext { tenant_id: &self.tenant_id, session_id: &self.session_id, run: &self.run };
		let outcome = tokio::select! {
			biased;
			_ = self.cancel.cancelled() => return None,
			outcome = tool.execute(&ctx, &arguments) => outcome,
		};

		Some(outcome.unwrap_or_else(|err| {
			tracing::warn!(
				session_id = %self.session_id,
				tool = %call.name,
				error = %err,
				"Agent tool failed."
			);

			ToolOutput::failed(err.to_string())
		}))
	}

	/// `None` when stopped, `Some(None)` when reflection produced nothing usable.
	async fn reflect(&self, messages: &[ChatMessage]) -> Option<Option<String>> {
		let mut prompt = messages.to_vec();

		prompt.push(ChatMessage::user(REFLECTION_PROMPT));

		let opts = ChatOptions { temperature: Some(self.run.temperature()), ..Default::default() };
		let response = tokio::select! {
			biased;
			_ = self.cancel.cancelled() => return None,
			response = self.ctx.providers.chat.chat(&self.ctx.cfg.providers.chat, &prompt, &opts) => response,
		};

		match response {
			Ok(response) if !response.content.trim().is_empty() => Some(Some(response.content)),
			Ok(_) => Some(None),
			Err(err) => {
				tracing::warn!(session_id = %self.session_id, error = %err, "Agent reflection failed.");

				Some(None)
			},
		}
	}

	async fn finish(&self, references: &[SearchResult], content: &str) {
		if !references.is_empty() {
			self.emit(StreamEvent::references(&self.session_id, references.to_vec())).await;
		}

		self.emit(StreamEvent::answer(&self.answer_id, &self.session_id, content, true)).await;
	}

	async fn stopped(&self) -> AgentOutcome {
		tracing::info!(session_id = %self.session_id, "Agent run stopped by the user.");

		self.emit(StreamEvent::answer(&self.answer_id, &self.session_id, self.run.stop_notice(), true))
			.await;

		AgentOutcome::Cancelled
	}

	/// A stop never waits behind a subscriber that stopped draining.
	async fn emit(&self, event: StreamEvent) {
		self.bus.emit_until(event, &self.cancel).await;
	}

	async fn record(&self, query: &str, answer: &str) {
		if answer.trim().is_empty() {
			return;
		}

		let turns = vec![ChatMessage::user(query.to_string()), ChatMessage::assistant(answer.to_string())];

		if let Err(err) = self.ctx.context.add_messages(&self.session_id, turns).await {
			tracing::warn!(
				session_id = %self.session_id,
				error = %err,
				"Recording the agent answer in session history failed."
			);
		}
	}
}
