//! Terminal rendering of a session's event stream.

use std::{
	io::{self, Write},
	sync::Arc,
};

use kora_domain::event::{EventData, EventKind, StreamEvent};
use kora_service::{KoraService, QaRequest};

const STOP_REASON: &str = "user";

/// Starts the answer, prints events until the run ends, and stops the session on Ctrl-C.
pub async fn stream_answer(
	service: &Arc<KoraService>,
	request: QaRequest,
	agent: bool,
) -> color_eyre::Result<()> {
	let session_id = request.session_id.clone();
	let mut rx = service.bus.subscribe(&session_id);
	let handle = if agent {
		service.agent_qa(request).await?
	} else {
		service.knowledge_qa(request).await?
	};

	if let Some(pipeline) = handle.pipeline() {
		tracing::debug!(session_id = %session_id, pipeline = ?pipeline, "Pipeline selected.");
	}

	let stopper = {
		let bus = service.bus.clone();
		let session_id = session_id.clone();

		tokio::spawn(async move {
			if tokio::signal::ctrl_c().await.is_ok() {
				bus.stop(&session_id, STOP_REASON).await;
			}
		})
	};
	let wait = handle.wait();

	tokio::pin!(wait);

	let outcome = loop {
		tokio::select! {
			Some(event) = rx.recv() => print_event(&event)?,
			outcome = &mut wait => break outcome,
		}
	};

	while let Ok(event) = rx.try_recv() {
		print_event(&event)?;
	}

	stopper.abort();
	service.bus.unsubscribe(&session_id);
	outcome?;

	Ok(())
}

fn print_event(event: &StreamEvent) -> io::Result<()> {
	let mut out = io::stdout().lock();

	match (&event.kind, &event.data) {
		(EventKind::Answer, EventData::Text { content }) => {
			write!(out, "{content}")?;

			if event.done {
				writeln!(out)?;
			}

			out.flush()
		},
		(_, data) => {
			let line = describe(event.kind, data);

			eprintln!("{line}");

			Ok(())
		},
	}
}

fn describe(kind: EventKind, data: &EventData) -> String {
	match data {
		EventData::Text { content } => format!("[{}] {content}", kind.as_str()),
		EventData::ToolCall { tool_name, arguments, iteration, .. } =>
			format!("[tool_call #{iteration}] {tool_name} {arguments}"),
		EventData::ToolResult { tool_name, success, .. } => {
			let status = if *success { "ok" } else { "failed" };

			format!("[tool_result] {tool_name} {status}")
		},
		EventData::References { references } => references
			.iter()
			.enumerate()
			.map(|(index, reference)| {
				format!(
					"[{}] {} ({:.3})",
					index + 1,
					reference.knowledge_title,
					reference.score
				)
			})
			.collect::<Vec<_>>()
			.join("\n"),
		EventData::Error { stage, message } => format!("[error:{stage}] {message}"),
		EventData::Stop { reason } => format!("[stop] {reason}"),
	}
}
