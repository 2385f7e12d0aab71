use std::sync::Arc;

use tokio::sync::mpsc;

use kora_domain::{
	chat::{ChatMessage, FrameKind, StreamFrame},
	event::{self, StreamEvent},
};

use crate::{
	BoxFuture,
	bus::{EventBus, StopGuard},
	cancel::CancelToken,
	context::ContextManager,
	pipeline::{
		ChatManage, EventType, Next, Plugin, PluginError, PluginResult, StageContext,
		StageErrorKind, cancellable,
		stages::{answer_messages, answer_options},
	},
};

/// Starts a streaming completion and hands the frames to a background [`AnswerRelay`]. The
/// pipeline continues as soon as the stream is open.
pub struct ChatCompletionStream {
	ctx: Arc<StageContext>,
}
impl ChatCompletionStream {
	pub fn new(ctx: Arc<StageContext>) -> Self {
		Self { ctx }
	}
}
impl Plugin for ChatCompletionStream {
	fn name(&self) -> &'static str {
		"chat_completion_stream"
	}

	fn activation_events(&self) -> &'static [EventType] {
		&[EventType::ChatCompletionStream]
	}

	fn on_event<'a>(
		&'a self,
		_event: EventType,
		state: &'a mut ChatManage,
		next: Next<'a>,
	) -> BoxFuture<'a, PluginResult> {
		Box::pin(async move {
			if !state.merge_result.is_empty() {
				state
					.bus
					.emit_until(
						StreamEvent::references(&state.session_id, state.merge_result.clone()),
						&state.cancel,
					)
					.await;
			}

			let messages = answer_messages(state);
			let opts = answer_options(&state.summary);
			let frames = cancellable(
				&state.cancel,
				self.ctx.providers.chat.chat_stream(
					&self.ctx.cfg.providers.chat,
					&messages,
					&opts,
					self.ctx.cfg.service.stream_channel_capacity,
				),
			)
			.await?
			.map_err(|err| {
				PluginError::stage(StageErrorKind::ModelCall, "Opening the answer stream failed.", err.into())
			})?;
			let relay = AnswerRelay::new(
				state.bus.clone(),
				&state.session_id,
				state.cancel.clone(),
				&self.ctx.cfg.agent.stop_notice,
			)
			.recording(self.ctx.context.clone(), &state.query)
			.holding(state.take_stop_guard());

			state.stream_task = Some(tokio::spawn(relay.run(frames)));

			next.run(state).await
		})
	}
}

/// How an answer series ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum RelayOutcome {
	Completed(String),
	Failed(String),
	Stopped,
	Incomplete,
}

/// Re-emits model frames as one answer series. Thinking is wrapped in `<think>` tags, error
/// frames become error events, and the series always ends with exactly one `done` event: the
/// final answer, a terminal error, the stop notice, or the fallback text when the stream closes
/// early.
pub(crate) struct AnswerRelay {
	bus: Arc<EventBus>,
	session_id: String,
	answer_id: String,
	cancel: CancelToken,
	stop_notice: String,
	on_incomplete: String,
	history: Option<(Arc<ContextManager>, String)>,
	_stop_guard: Option<StopGuard>,
}
impl AnswerRelay {
	pub(crate) fn new(
		bus: Arc<EventBus>,
		session_id: &str,
		cancel: CancelToken,
		stop_notice: &str,
	) -> Self {
		Self {
			bus,
			session_id: session_id.to_string(),
			answer_id: event::event_id("answer"),
			cancel,
			stop_notice: stop_notice.to_string(),
			on_incomplete: String::new(),
			history: None,
			_stop_guard: None,
		}
	}

	/// Appends the question and a completed answer to the session history.
	pub(crate) fn recording(mut self, context: Arc<ContextManager>, query: &str) -> Self {
		self.history = Some((context, query.to_string()));

		self
	}

	/// Terminal content used when the stream closes without a done frame.
	pub(crate) fn on_incomplete(mut self, content: &str) -> Self {
		self.on_incomplete = content.to_string();

		self
	}

	/// Keeps the stop watch alive for as long as the relay runs.
	pub(crate) fn holding(mut self, guard: Option<StopGuard>) -> Self {
		self._stop_guard = guard;

		self
	}

	pub(crate) async fn run(self, mut frames: mpsc::Receiver<StreamFrame>) {
		self.relay(&mut frames).await;
	}

	pub(crate) async fn relay(&self, frames: &mut mpsc::Receiver<StreamFrame>) -> RelayOutcome {
		let mut answer = String::new();
		let mut thinking = false;

		loop {
			let frame = tokio::select! {
				biased;
				_ = self.cancel.cancelled() => {
					tracing::info!(session_id = %self.session_id, "Answer stream stopped by the user.");
					self.emit(&self.stop_notice, true).await;

					return RelayOutcome::Stopped;
				},
				frame = frames.recv() => frame,
			};
			let Some(frame) = frame else {
				if thinking {
					self.emit("</think>", false).await;
				}

				tracing::warn!(
					session_id = %self.session_id,
					"Answer stream closed without a done frame."
				);
				self.emit(&self.on_incomplete, true).await;

				return RelayOutcome::Incomplete;
			};

			match frame.kind {
				FrameKind::Thinking => {
					if !thinking {
						self.emit("<think>", false).await;

						thinking = true;
					}
					if !frame.content.is_empty() {
						self.emit(&frame.content, false).await;
					}
				},
				FrameKind::Answer => {
					if thinking {
						self.emit("</think>", false).await;

						thinking = false;
					}

					answer.push_str(&frame.content);

					if frame.done {
						self.emit(&frame.content, true).await;
						self.record(&answer).await;

						return RelayOutcome::Completed(answer);
					}
					if !frame.content.is_empty() {
						self.emit(&frame.content, false).await;
					}
				},
				FrameKind::Error => {
					tracing::warn!(
						session_id = %self.session_id,
						error = %frame.content,
						terminal = frame.done,
						"Model stream reported an error."
					);

					if frame.done {
						self.bus
							.emit_until(
								StreamEvent::error(
									&self.answer_id,
									&self.session_id,
									StageErrorKind::ModelCall.as_str(),
									frame.content.clone(),
								),
								&self.cancel,
							)
							.await;

						return RelayOutcome::Failed(frame.content);
					}

					self.bus
						.emit_until(
							StreamEvent::error(
								&event::event_id("error"),
								&self.session_id,
								StageErrorKind::ModelCall.as_str(),
								frame.content,
							),
							&self.cancel,
						)
						.await;

					continue;
				},
			}

			if frame.done {
				if thinking {
					self.emit("</think>", false).await;
				}

				self.emit("", true).await;
				self.record(&answer).await;

				return RelayOutcome::Completed(answer);
			}
		}
	}

	/// Never outwaits a stop: once cancelled, a subscriber without room misses the event.
	async fn emit(&self, content: &str, done: bool) {
		self.bus
			.emit_until(
				StreamEvent::answer(&self.answer_id, &self.session_id, content, done),
				&self.cancel,
			)
			.await;
	}

	async fn record(&self, answer: &str) {
		let Some((context, query)) = &self.history else {
			return;
		};

		if answer.trim().is_empty() {
			return;
		}

		let turns = vec![ChatMessage::user(query.clone()), ChatMessage::assistant(answer.to_string())];

		if let Err(err) = context.add_messages(&self.session_id, turns).await {
			tracing::warn!(
				session_id = %self.session_id,
				error = %err,
				"Recording the answer in session history failed."
			);
		}
	}
}
