//! Request orchestration: pipeline selection, fallback answers, agent runs, and stop handling.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use kora_config::FallbackStrategy;
use kora_domain::{
	chat::ChatMessage,
	event::{self, StreamEvent},
	search::{self, KnowledgeRef, SearchResult, SearchTarget},
};

use crate::{
	Error, KoraService, Result,
	agent::{AgentEngine, AgentOutcome, AgentOverrides, AgentRunConfig, ToolRegistry},
	cancel::CancelToken,
	pipeline::{
		ChatManage, EventType, PipelineKind, PluginError, RetrievalSettings, select_pipeline,
		stages::{self, AnswerRelay},
	},
};

/// Per-request adjustments to the `[conversation]` defaults. Unset fields keep the default.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct ConversationOverrides {
	pub max_rounds: Option<u32>,
	pub keyword_threshold: Option<f32>,
	pub vector_threshold: Option<f32>,
	pub embedding_top_k: Option<u32>,
	pub rerank_top_k: Option<u32>,
	pub rerank_threshold: Option<f32>,
	pub enable_rewrite: Option<bool>,
	pub enable_rerank: Option<bool>,
	pub fallback_strategy: Option<FallbackStrategy>,
	pub fallback_response: Option<String>,
	pub fallback_prompt: Option<String>,
	pub summary_prompt: Option<String>,
	pub context_template: Option<String>,
	pub temperature: Option<f32>,
	pub max_completion_tokens: Option<u32>,
	pub thinking: Option<bool>,
}
impl ConversationOverrides {
	pub fn validate(&self) -> Result<()> {
		for (name, value) in [
			("keyword_threshold", self.keyword_threshold),
			("vector_threshold", self.vector_threshold),
			("rerank_threshold", self.rerank_threshold),
		] {
			if let Some(value) = value
				&& !(0.0..=1.0).contains(&value)
			{
				return Err(Error::InvalidRequest {
					message: format!("{name} must be between 0 and 1."),
				});
			}
		}
		for (name, value) in
			[("embedding_top_k", self.embedding_top_k), ("rerank_top_k", self.rerank_top_k)]
		{
			if value == Some(0) {
				return Err(Error::InvalidRequest {
					message: format!("{name} must be greater than zero."),
				});
			}
		}

		if self.fallback_response.as_deref().is_some_and(|response| response.trim().is_empty()) {
			return Err(Error::InvalidRequest {
				message: "fallback_response must not be empty.".to_string(),
			});
		}

		Ok(())
	}

	pub fn apply_retrieval(&self, settings: &mut RetrievalSettings) {
		if let Some(value) = self.max_rounds {
			settings.max_rounds = value;
		}
		if let Some(value) = self.keyword_threshold {
			settings.keyword_threshold = value;
		}
		if let Some(value) = self.vector_threshold {
			settings.vector_threshold = value;
		}
		if let Some(value) = self.embedding_top_k {
			settings.embedding_top_k = value;
		}
		if let Some(value) = self.rerank_top_k {
			settings.rerank_top_k = value;
		}
		if let Some(value) = self.rerank_threshold {
			settings.rerank_threshold = value;
		}
		if let Some(value) = self.enable_rewrite {
			settings.enable_rewrite = value;
		}
		if let Some(value) = self.enable_rerank {
			settings.enable_rerank = value;
		}
	}

	pub fn apply(&self, state: &mut ChatManage) {
		self.apply_retrieval(&mut state.retrieval);

		if let Some(value) = self.fallback_strategy {
			state.fallback.strategy = value;
		}
		if let Some(value) = &self.fallback_response {
			state.fallback.response = value.clone();
		}
		if let Some(value) = &self.fallback_prompt {
			state.fallback.prompt = Some(value.clone());
		}
		if let Some(value) = &self.summary_prompt {
			state.summary.prompt = value.clone();
		}
		if let Some(value) = &self.context_template {
			state.summary.context_template = value.clone();
		}
		if let Some(value) = self.temperature {
			state.summary.temperature = value;
		}
		if let Some(value) = self.max_completion_tokens {
			state.summary.max_completion_tokens = value;
		}
		if let Some(value) = self.thinking {
			state.summary.thinking = value;
		}
	}
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct QaRequest {
	pub tenant_id: String,
	pub session_id: String,
	pub query: String,
	#[serde(default)]
	pub knowledge_base_ids: Vec<String>,
	#[serde(default)]
	pub knowledge_ids: Vec<String>,
	#[serde(default)]
	pub web_search_enabled: bool,
	#[serde(default)]
	pub overrides: Option<ConversationOverrides>,
	#[serde(default)]
	pub agent: Option<AgentOverrides>,
}
impl QaRequest {
	pub fn new(tenant_id: &str, session_id: &str, query: &str) -> Self {
		Self {
			tenant_id: tenant_id.to_string(),
			session_id: session_id.to_string(),
			query: query.to_string(),
			..Default::default()
		}
	}

	fn validate(&self) -> Result<()> {
		for (name, value) in
			[("tenant_id", &self.tenant_id), ("session_id", &self.session_id), ("query", &self.query)]
		{
			if value.trim().is_empty() {
				return Err(Error::InvalidRequest { message: format!("{name} is required.") });
			}
		}

		match &self.overrides {
			Some(overrides) => overrides.validate(),
			None => Ok(()),
		}
	}
}

/// A running answer. Events arrive on the bus; the handle only tracks completion.
pub struct QaHandle {
	session_id: String,
	pipeline: Option<PipelineKind>,
	cancel: CancelToken,
	task: JoinHandle<Result<()>>,
}
impl QaHandle {
	pub fn session_id(&self) -> &str {
		&self.session_id
	}

	/// `None` for agent runs and custom event sequences.
	pub fn pipeline(&self) -> Option<PipelineKind> {
		self.pipeline
	}

	/// Same effect as a stop event for this request only.
	pub fn cancel(&self) {
		self.cancel.cancel();
	}

	/// Resolves once the terminal event has been emitted.
	pub async fn wait(self) -> Result<()> {
		self.task
			.await
			.map_err(|err| Error::Internal { message: format!("Answer task failed: {err}.") })?
	}
}

impl KoraService {
	/// Selects a pipeline from the request shape, starts it in the background, and returns.
	pub async fn knowledge_qa(self: &Arc<Self>, request: QaRequest) -> Result<QaHandle> {
		request.validate()?;

		let state = self.new_state(&request).await;
		let kind = select_pipeline(
			&request.knowledge_base_ids,
			&request.knowledge_ids,
			request.web_search_enabled,
			state.retrieval.max_rounds,
		);

		tracing::info!(
			tenant_id = %request.tenant_id,
			session_id = %request.session_id,
			pipeline = kind.as_str(),
			targets = state.search_targets.len(),
			"Answer requested."
		);

		Ok(self.start(state, Some(kind), kind.events().to_vec()))
	}

	/// Runs an explicit stage sequence instead of a selected pipeline.
	pub async fn knowledge_qa_with(
		self: &Arc<Self>,
		request: QaRequest,
		events: Vec<EventType>,
	) -> Result<QaHandle> {
		request.validate()?;

		let state = self.new_state(&request).await;

		Ok(self.start(state, None, events))
	}

	/// Runs the search stages only and returns the final ranked results.
	pub async fn search_knowledge(
		&self,
		tenant_id: &str,
		query: &str,
		knowledge_base_ids: &[String],
		knowledge_ids: &[String],
	) -> Result<Vec<SearchResult>> {
		if query.trim().is_empty() {
			return Err(Error::InvalidRequest { message: "query is required.".to_string() });
		}

		let mut state = ChatManage::new(
			&self.cfg,
			tenant_id,
			&event::event_id("search"),
			query,
			self.bus.clone(),
			CancelToken::new(),
		);

		state.search_targets =
			self.build_search_targets(tenant_id, knowledge_base_ids, knowledge_ids).await;

		match self.pipeline.run(PipelineKind::Search.events(), &mut state).await {
			Ok(()) => Ok(state.merge_result),
			Err(PluginError::SearchNothing) => Ok(Vec::new()),
			Err(PluginError::Cancelled) => Err(Error::Cancelled),
			Err(PluginError::Stage { kind, description, source }) => {
				tracing::error!(
					kind = %kind,
					description = %description,
					error = ?source,
					"Search stage failed."
				);

				Err(Error::Pipeline { kind, description })
			},
		}
	}

	/// Full-scope knowledge bases first, then knowledge items grouped by knowledge base. A catalog
	/// failure keeps the full-scope targets.
	pub async fn build_search_targets(
		&self,
		tenant_id: &str,
		knowledge_base_ids: &[String],
		knowledge_ids: &[String],
	) -> Vec<SearchTarget> {
		let knowledge: Vec<KnowledgeRef> = if knowledge_ids.is_empty() {
			Vec::new()
		} else {
			match self.catalog.knowledge_batch(tenant_id, knowledge_ids).await {
				Ok(infos) => infos.iter().map(|info| info.to_ref()).collect(),
				Err(err) => {
					tracing::warn!(
						tenant_id,
						error = %err,
						"Resolving knowledge items failed; searching full-scope targets only."
					);

					Vec::new()
				},
			}
		};

		search::build_search_targets(knowledge_base_ids, &knowledge)
	}

	/// Starts an agent run in the background and returns.
	pub async fn agent_qa(self: &Arc<Self>, request: QaRequest) -> Result<QaHandle> {
		request.validate()?;

		let targets = self
			.build_search_targets(
				&request.tenant_id,
				&request.knowledge_base_ids,
				&request.knowledge_ids,
			)
			.await;
		let mut retrieval = RetrievalSettings::from(&self.cfg.conversation);

		if let Some(overrides) = &request.overrides {
			overrides.apply_retrieval(&mut retrieval);
		}

		let run = AgentRunConfig::resolve(
			&self.cfg.agent,
			retrieval,
			request.agent.as_ref(),
			targets,
			request.web_search_enabled,
		);
		let tools = ToolRegistry::for_run(&self.stages, &self.tools, &run);

		tracing::info!(
			tenant_id = %request.tenant_id,
			session_id = %request.session_id,
			tools = ?tools.names(),
			max_iterations = run.max_iterations(),
			"Agent run requested."
		);

		let cancel = CancelToken::new();
		let guard = self.bus.watch_stop(&request.session_id, cancel.clone());
		let engine = AgentEngine::new(
			self.stages.clone(),
			self.bus.clone(),
			tools,
			run,
			&request.tenant_id,
			&request.session_id,
			cancel.clone(),
		);
		let query = request.query;
		let task = tokio::spawn(async move {
			let _guard = guard;
			let outcome = engine.run(&query).await?;

			if let AgentOutcome::IterationCapReached(_) = outcome {
				tracing::debug!("Agent run ended at the iteration cap.");
			}

			Ok(())
		});

		Ok(QaHandle { session_id: request.session_id, pipeline: None, cancel, task })
	}

	pub async fn clear_context(&self, session_id: &str) -> Result<()> {
		self.context.clear_context(session_id).await
	}

	async fn new_state(&self, request: &QaRequest) -> ChatManage {
		let mut state = ChatManage::new(
			&self.cfg,
			&request.tenant_id,
			&request.session_id,
			&request.query,
			self.bus.clone(),
			CancelToken::new(),
		);

		state.knowledge_base_ids = request.knowledge_base_ids.clone();
		state.knowledge_ids = request.knowledge_ids.clone();
		state.web_search_enabled = request.web_search_enabled;
		state.search_targets = self
			.build_search_targets(
				&request.tenant_id,
				&request.knowledge_base_ids,
				&request.knowledge_ids,
			)
			.await;

		if let Some(overrides) = &request.overrides {
			overrides.apply(&mut state);
		}

		state
	}

	fn start(
		self: &Arc<Self>,
		mut state: ChatManage,
		pipeline: Option<PipelineKind>,
		events: Vec<EventType>,
	) -> QaHandle {
		let cancel = state.cancel.clone();
		let session_id = state.session_id.clone();

		state.stop_guard = Some(self.bus.watch_stop(&session_id, cancel.clone()));

		let service = self.clone();
		let task = tokio::spawn(async move {
			let outcome = service.run_pipeline(&mut state, &events).await;
			let stream = state.stream_task.take();

			drop(state);

			if let Some(stream) = stream {
				stream.await.map_err(|err| Error::Internal {
					message: format!("Answer stream task failed: {err}."),
				})?;
			}

			outcome
		});

		QaHandle { session_id, pipeline, cancel, task }
	}

	/// Drives `events` and turns the pipeline outcome into exactly one terminal event.
	pub(crate) async fn run_pipeline(
		&self,
		state: &mut ChatManage,
		events: &[EventType],
	) -> Result<()> {
		match self.pipeline.run(events, state).await {
			Ok(()) => Ok(()),
			Err(PluginError::SearchNothing) => {
				self.respond_with_fallback(state).await;

				Ok(())
			},
			Err(PluginError::Cancelled) => {
				tracing::info!(
					session_id = %state.session_id,
					"Request stopped before the answer started."
				);

				state
					.bus
					.emit(StreamEvent::answer(
						&event::event_id("answer"),
						&state.session_id,
						self.cfg.agent.stop_notice.clone(),
						true,
					))
					.await;

				Ok(())
			},
			Err(PluginError::Stage { kind, description, source }) => {
				tracing::error!(
					session_id = %state.session_id,
					kind = %kind,
					description = %description,
					error = ?source,
					"Pipeline stage failed."
				);

				state
					.bus
					.emit(StreamEvent::error(
						&event::event_id("answer"),
						&state.session_id,
						kind.as_str(),
						description.clone(),
					))
					.await;

				Err(Error::Pipeline { kind, description })
			},
		}
	}

	/// The fixed response, or a short model answer when configured. Either way the series ends
	/// with one terminal event.
	async fn respond_with_fallback(&self, state: &mut ChatManage) {
		let fixed = state.fallback.response.clone();

		tracing::info!(
			session_id = %state.session_id,
			strategy = ?state.fallback.strategy,
			"No relevant results; answering with the fallback."
		);

		if state.fallback.strategy == FallbackStrategy::Model {
			match state.fallback.prompt.as_deref().filter(|prompt| !prompt.trim().is_empty()) {
				Some(prompt) =>
					if self.stream_model_fallback(state, prompt, &fixed).await {
						return;
					},
				None => tracing::warn!(
					session_id = %state.session_id,
					"Model fallback has no prompt; using the fixed response."
				),
			}
		}

		let answer_id = event::event_id("answer");

		state
			.bus
			.emit_until(
				StreamEvent::answer(&answer_id, &state.session_id, fixed.clone(), true),
				&state.cancel,
			)
			.await;

		let turns = vec![ChatMessage::user(state.query.clone()), ChatMessage::assistant(fixed)];

		if let Err(err) = self.context.add_messages(&state.session_id, turns).await {
			tracing::warn!(
				session_id = %state.session_id,
				error = %err,
				"Recording the fallback in session history failed."
			);
		}
	}

	/// Returns false when the stream could not start, leaving the terminal event to the caller.
	async fn stream_model_fallback(&self, state: &ChatManage, prompt: &str, fixed: &str) -> bool {
		let prompt = stages::render_template(prompt, &[("query", state.query.as_str())]);
		let messages = vec![ChatMessage::user(prompt)];
		let opts = stages::answer_options(&state.summary);
		let opened = tokio::select! {
			biased;
			_ = state.cancel.cancelled() => {
				state
					.bus
					.emit(StreamEvent::answer(
						&event::event_id("answer"),
						&state.session_id,
						self.cfg.agent.stop_notice.clone(),
						true,
					))
					.await;

				return true;
			},
			opened = self.providers.chat.chat_stream(
				&self.cfg.providers.chat,
				&messages,
				&opts,
				self.cfg.service.stream_channel_capacity,
			) => opened,
		};
		let mut frames = match opened {
			Ok(frames) => frames,
			Err(err) => {
				tracing::warn!(
					session_id = %state.session_id,
					error = %err,
					"Fallback stream failed to start; using the fixed response."
				);

				return false;
			},
		};
		let relay = AnswerRelay::new(
			state.bus.clone(),
			&state.session_id,
			state.cancel.clone(),
			&self.cfg.agent.stop_notice,
		)
		.on_incomplete(fixed)
		.recording(self.context.clone(), &state.query);

		match relay.relay(&mut frames).await {
			stages::RelayOutcome::Failed(message) => tracing::warn!(
				session_id = %state.session_id,
				error = %message,
				"Fallback stream failed."
			),
			outcome => {
				tracing::debug!(session_id = %state.session_id, outcome = ?outcome, "Fallback answered.")
			},
		}

		true
	}
}

#[cfg(test)]
mod tests {
	use kora_config::Conversation;

	use super::*;

	#[test]
	fn overrides_reject_out_of_range_values() {
		let overrides = ConversationOverrides { vector_threshold: Some(1.5), ..Default::default() };

		assert!(overrides.validate().is_err());

		let overrides = ConversationOverrides { rerank_top_k: Some(0), ..Default::default() };

		assert!(overrides.validate().is_err());
		assert!(ConversationOverrides::default().validate().is_ok());
	}

	#[test]
	fn retrieval_overrides_replace_only_set_fields() {
		let conversation = Conversation::default();
		let mut settings = RetrievalSettings::from(&conversation);
		let overrides = ConversationOverrides {
			enable_rerank: Some(false),
			embedding_top_k: Some(3),
			..Default::default()
		};

		overrides.apply_retrieval(&mut settings);

		assert!(!settings.enable_rerank);
		assert_eq!(settings.embedding_top_k, 3);
		assert_eq!(settings.rerank_top_k, conversation.rerank_top_k);
	}

	#[test]
	fn requests_need_tenant_session_and_query() {
		assert!(QaRequest::new("t", "s", "q").validate().is_ok());
		assert!(QaRequest::new("t", "", "q").validate().is_err());
		assert!(QaRequest::new("t", "s", "  ").validate().is_err());
	}
}
