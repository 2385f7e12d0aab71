use std::{
	collections::{HashMap, HashSet, VecDeque},
	sync::{
		Arc, Mutex, PoisonError, RwLock,
		atomic::{AtomicU64, Ordering},
	},
};

use tokio::sync::mpsc::{self, error::TrySendError};

use kora_domain::event::{EventKind, StreamEvent};

use crate::{Result, cancel::CancelToken};

const COMPLETED_CAPACITY: usize = 4_096;

type Handler = Arc<dyn Fn(&StreamEvent) -> Result<()> + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// Session-scoped event fan-out. Handlers run inline on `emit`; subscribers receive clones over
/// bounded channels and must keep draining them.
pub struct EventBus {
	capacity: usize,
	next_handler: AtomicU64,
	handlers: RwLock<Vec<(HandlerId, EventKind, Handler)>>,
	subscribers: RwLock<HashMap<String, Vec<mpsc::Sender<StreamEvent>>>>,
	completed: Mutex<CompletedIds>,
}
impl EventBus {
	pub fn new(capacity: usize) -> Self {
		Self {
			capacity: capacity.max(1),
			next_handler: AtomicU64::new(1),
			handlers: RwLock::new(Vec::new()),
			subscribers: RwLock::new(HashMap::new()),
			completed: Mutex::new(CompletedIds::default()),
		}
	}

	pub fn on<F>(&self, kind: EventKind, handler: F) -> HandlerId
	where
		F: Fn(&StreamEvent) -> Result<()> + Send + Sync + 'static,
	{
		let id = HandlerId(self.next_handler.fetch_add(1, Ordering::Relaxed));

		self.handlers
			.write()
			.unwrap_or_else(PoisonError::into_inner)
			.push((id, kind, Arc::new(handler)));

		id
	}

	pub fn off(&self, id: HandlerId) {
		self.handlers
			.write()
			.unwrap_or_else(PoisonError::into_inner)
			.retain(|(handler_id, _, _)| *handler_id != id);
	}

	pub fn subscribe(&self, session_id: &str) -> mpsc::Receiver<StreamEvent> {
		let (tx, rx) = mpsc::channel(self.capacity);

		self.subscribers
			.write()
			.unwrap_or_else(PoisonError::into_inner)
			.entry(session_id.to_string())
			.or_default()
			.push(tx);

		rx
	}

	pub fn unsubscribe(&self, session_id: &str) {
		self.subscribers.write().unwrap_or_else(PoisonError::into_inner).remove(session_id);
	}

	pub fn subscriber_count(&self, session_id: &str) -> usize {
		self.subscribers
			.read()
			.unwrap_or_else(PoisonError::into_inner)
			.get(session_id)
			.map_or(0, Vec::len)
	}

	/// Handler failures are logged and never reach the emitter. Waits for room on every
	/// subscriber channel.
	pub async fn emit(&self, event: StreamEvent) {
		self.publish(event, Delivery::Wait).await;
	}

	/// Like [`emit`](Self::emit), but stops waiting on full subscribers once `cancel` fires.
	/// After that the event only reaches subscribers with room left.
	pub async fn emit_until(&self, event: StreamEvent, cancel: &CancelToken) {
		self.publish(event, Delivery::Until(cancel)).await;
	}

	/// Stop handlers run before any delivery, and a full subscriber misses the stop event
	/// rather than holding up the cancellation.
	pub async fn stop(&self, session_id: &str, reason: &str) {
		self.publish(StreamEvent::stop(session_id, reason), Delivery::NoWait).await;
	}

	/// Cancels `cancel` when a stop event for `session_id` is emitted, until the guard drops.
	pub fn watch_stop(self: &Arc<Self>, session_id: &str, cancel: CancelToken) -> StopGuard {
		let session_id = session_id.to_string();
		let id = self.on(EventKind::Stop, move |event| {
			if event.session_id == session_id {
				cancel.cancel();
			}

			Ok(())
		});

		StopGuard { bus: self.clone(), id }
	}

	async fn publish(&self, event: StreamEvent, delivery: Delivery<'_>) {
		if !self.admit(&event) {
			tracing::warn!(
				event_id = %event.id,
				kind = event.kind.as_str(),
				session_id = %event.session_id,
				"Dropped an event emitted after its series completed."
			);

			return;
		}

		let handlers: Vec<Handler> = self
			.handlers
			.read()
			.unwrap_or_else(PoisonError::into_inner)
			.iter()
			.filter(|(_, kind, _)| *kind == event.kind)
			.map(|(_, _, handler)| handler.clone())
			.collect();

		for handler in handlers {
			if let Err(err) = handler(&event) {
				tracing::warn!(
					kind = event.kind.as_str(),
					session_id = %event.session_id,
					error = %err,
					"Event handler failed."
				);
			}
		}

		let senders = self
			.subscribers
			.read()
			.unwrap_or_else(PoisonError::into_inner)
			.get(&event.session_id)
			.cloned()
			.unwrap_or_default();
		let mut saw_closed = false;

		for sender in &senders {
			match deliver(sender, &event, delivery).await {
				Sent::Delivered => {},
				Sent::Closed => saw_closed = true,
				Sent::Dropped => tracing::warn!(
					event_id = %event.id,
					kind = event.kind.as_str(),
					session_id = %event.session_id,
					"Subscriber is full; dropped the event."
				),
			}
		}

		if saw_closed {
			self.prune(&event.session_id);
		}
	}

	fn admit(&self, event: &StreamEvent) -> bool {
		let mut completed = self.completed.lock().unwrap_or_else(PoisonError::into_inner);

		if completed.contains(&event.id) {
			return false;
		}
		if event.done {
			completed.insert(event.id.clone());
		}

		true
	}

	fn prune(&self, session_id: &str) {
		let mut subscribers = self.subscribers.write().unwrap_or_else(PoisonError::into_inner);

		if let Some(senders) = subscribers.get_mut(session_id) {
			senders.retain(|sender| !sender.is_closed());

			if senders.is_empty() {
				subscribers.remove(session_id);
			}
		}
	}
}

pub struct StopGuard {
	bus: Arc<EventBus>,
	id: HandlerId,
}
impl Drop for StopGuard {
	fn drop(&mut self) {
		self.bus.off(self.id);
	}
}

#[derive(Clone, Copy)]
enum Delivery<'a> {
	Wait,
	Until(&'a CancelToken),
	NoWait,
}

enum Sent {
	Delivered,
	Closed,
	Dropped,
}

async fn deliver(
	sender: &mpsc::Sender<StreamEvent>,
	event: &StreamEvent,
	delivery: Delivery<'_>,
) -> Sent {
	let cancel = match delivery {
		Delivery::Wait =>
			return match sender.send(event.clone()).await {
				Ok(()) => Sent::Delivered,
				Err(_) => Sent::Closed,
			},
		Delivery::Until(cancel) => Some(cancel),
		Delivery::NoWait => None,
	};

	match sender.try_send(event.clone()) {
		Ok(()) => return Sent::Delivered,
		Err(TrySendError::Closed(_)) => return Sent::Closed,
		Err(TrySendError::Full(_)) => {},
	}

	let Some(cancel) = cancel.filter(|cancel| !cancel.is_cancelled()) else {
		return Sent::Dropped;
	};

	tokio::select! {
		biased;
		sent = sender.send(event.clone()) => match sent {
			Ok(()) => Sent::Delivered,
			Err(_) => Sent::Closed,
		},
		_ = cancel.cancelled() => Sent::Dropped,
	}
}

/// Bounded memory of finished series. IDs are random, so evicting the oldest is harmless.
#[derive(Default)]
struct CompletedIds {
	order: VecDeque<String>,
	ids: HashSet<String>,
}
impl CompletedIds {
	fn contains(&self, id: &str) -> bool {
		self.ids.contains(id)
	}

	fn insert(&mut self, id: String) {
		if !self.ids.insert(id.clone()) {
			return;
		}

		self.order.push_back(id);

		while self.order.len() > COMPLETED_CAPACITY {
			if let Some(oldest) = self.order.pop_front() {
				self.ids.remove(&oldest);
			}
		}
	}
}
