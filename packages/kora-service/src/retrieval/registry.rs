use std::sync::Arc;

use kora_config::{Config, Retrieval, RetrievalDriver};
use kora_storage::{db::Db, qdrant::QdrantStore};

use crate::{
	Error, Result,
	retrieval::{
		ActiveBackend, RetrievalBackend, memory::MemoryBackend, postgres::PostgresBackend,
		qdrant::QdrantBackend,
	},
};

/// Backends available to this process, at most one per driver.
#[derive(Clone, Default)]
pub struct BackendRegistry {
	backends: Vec<Arc<dyn RetrievalBackend>>,
}
impl BackendRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	/// Connects every configured driver. A driver that cannot connect is logged and left out so
	/// the remaining drivers still serve.
	pub async fn connect(cfg: &Config) -> Self {
		let mut registry = Self::new();

		for driver in &cfg.retrieval.drivers {
			match connect_driver(cfg, *driver).await {
				Ok(backend) => {
					tracing::info!(driver = %driver, "Retrieval backend connected.");
					registry.register(backend);
				},
				Err(err) => tracing::warn!(
					driver = %driver,
					error = %err,
					"Retrieval backend unavailable; skipping."
				),
			}
		}

		registry
	}

	/// Replaces any backend already registered for the same driver.
	pub fn register(&mut self, backend: Arc<dyn RetrievalBackend>) {
		let driver = backend.driver();

		self.backends.retain(|existing| existing.driver() != driver);
		self.backends.push(backend);
	}

	pub fn with(mut self, backend: Arc<dyn RetrievalBackend>) -> Self {
		self.register(backend);

		self
	}

	pub fn get(&self, driver: RetrievalDriver) -> Option<&Arc<dyn RetrievalBackend>> {
		self.backends.iter().find(|backend| backend.driver() == driver)
	}

	pub fn drivers(&self) -> Vec<RetrievalDriver> {
		self.backends.iter().map(|backend| backend.driver()).collect()
	}

	/// Registered backends the tenant's configuration activates, in configuration order.
	pub(crate) fn active_for(&self, retrieval: &Retrieval, tenant_id: &str) -> Vec<ActiveBackend> {
		retrieval
			.drivers_for(tenant_id)
			.iter()
			.filter_map(|driver| {
				let backend = self.get(*driver)?;

				Some(ActiveBackend {
					backend: backend.clone(),
					mandatory: retrieval.is_mandatory(*driver),
				})
			})
			.collect()
	}
}

async fn connect_driver(cfg: &Config, driver: RetrievalDriver) -> Result<Arc<dyn RetrievalBackend>> {
	match driver {
		RetrievalDriver::Memory => Ok(Arc::new(MemoryBackend::new())),
		RetrievalDriver::Postgres => {
			let Some(postgres) = &cfg.storage.postgres else {
				return Err(Error::InvalidRequest {
					message: "storage.postgres is not configured.".to_string(),
				});
			};
			let db = Db::connect(postgres).await?;

			db.ensure_schema(cfg.providers.embedding.dimensions).await?;

			Ok(Arc::new(PostgresBackend::new(db)))
		},
		RetrievalDriver::Qdrant => {
			let Some(qdrant) = &cfg.storage.qdrant else {
				return Err(Error::InvalidRequest {
					message: "storage.qdrant is not configured.".to_string(),
				});
			};
			let store = QdrantStore::new(qdrant)?;

			store.ensure_collection().await?;

			Ok(Arc::new(QdrantBackend::new(store)))
		},
	}
}
