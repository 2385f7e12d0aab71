use std::sync::Arc;

use tokio::sync::watch;

/// Cooperative cancellation shared by every task serving one request.
#[derive(Clone, Debug)]
pub struct CancelToken {
	tx: Arc<watch::Sender<bool>>,
}
impl CancelToken {
	pub fn new() -> Self {
		let (tx, _rx) = watch::channel(false);

		Self { tx: Arc::new(tx) }
	}

	pub fn cancel(&self) {
		self.tx.send_replace(true);
	}

	pub fn is_cancelled(&self) -> bool {
		*self.tx.borrow()
	}

	/// Resolves once `cancel` has been called; immediately if it already was.
	pub async fn cancelled(&self) {
		let mut rx = self.tx.subscribe();

		// The sender lives in `self`, so the channel cannot close while we wait.
		let _ = rx.wait_for(|cancelled| *cancelled).await;
	}
}
impl Default for CancelToken {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use std::time::Duration;

	use super::*;

	#[tokio::test]
	async fn cancel_wakes_waiters() {
		let token = CancelToken::new();
		let waiter = token.clone();
		let task = tokio::spawn(async move { waiter.cancelled().await });

		assert!(!token.is_cancelled());

		token.cancel();

		tokio::time::timeout(Duration::from_secs(1), task)
			.await
			.expect("Waiter did not wake.")
			.expect("Waiter panicked.");

		assert!(token.is_cancelled());
	}

	#[tokio::test]
	async fn already_cancelled_resolves_immediately() {
		let token = CancelToken::new();

		token.cancel();

		tokio::time::timeout(Duration::from_millis(100), token.cancelled())
			.await
			.expect("Cancelled token should resolve immediately.");
	}
}
