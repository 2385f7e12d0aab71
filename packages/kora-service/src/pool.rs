use std::{future::Future, sync::Arc};

use tokio::sync::Semaphore;

use crate::{Error, Result};

/// Bounds how many provider and backend calls run at once across all requests.
#[derive(Clone, Debug)]
pub struct WorkerPool {
	permits: Arc<Semaphore>,
	size: usize,
}
impl WorkerPool {
	pub fn new(size: usize) -> Self {
		let size = size.max(1);

		Self { permits: Arc::new(Semaphore::new(size)), size }
	}

	pub fn size(&self) -> usize {
		self.size
	}

	pub fn available(&self) -> usize {
		self.permits.available_permits()
	}

	pub async fn run<F>(&self, job: F) -> Result<F::Output>
	where
		F: Future,
	{
		let _permit = self
			.permits
			.acquire()
			.await
			.map_err(|_| Error::Internal { message: "Worker pool is closed.".to_string() })?;

		Ok(job.await)
	}
}
