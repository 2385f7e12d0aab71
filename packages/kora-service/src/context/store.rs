use std::{
	sync::Arc,
	time::{Duration, Instant},
};

use moka::{Expiry, future::Cache};
use sqlx::PgPool;
use time::OffsetDateTime;

use kora_storage::contexts;

use crate::{BoxFuture, Result};

const MEMORY_STORE_CAPACITY: u64 = 10_000;

/// Byte storage for serialized session contexts.
pub trait ContextStore
where
	Self: Send + Sync,
{
	fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Vec<u8>>>>;

	/// `None` keeps the value until it is deleted.
	fn set<'a>(
		&'a self,
		key: &'a str,
		value: Vec<u8>,
		ttl: Option<Duration>,
	) -> BoxFuture<'a, Result<()>>;

	fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<()>>;
}

#[derive(Clone)]
struct StoredValue {
	bytes: Arc<Vec<u8>>,
	ttl: Option<Duration>,
}

struct PerEntryTtl;
impl Expiry<String, StoredValue> for PerEntryTtl {
	fn expire_after_create(
		&self,
		_key: &String,
		value: &StoredValue,
		_created_at: Instant,
	) -> Option<Duration> {
		value.ttl
	}

	fn expire_after_update(
		&self,
		_key: &String,
		value: &StoredValue,
		_updated_at: Instant,
		_duration_until_expiry: Option<Duration>,
	) -> Option<Duration> {
		value.ttl
	}
}

/// Process-local store; contents are lost on restart.
pub struct MemoryContextStore {
	cache: Cache<String, StoredValue>,
}
impl MemoryContextStore {
	pub fn new(max_capacity: u64) -> Self {
		let cache = Cache::builder().max_capacity(max_capacity).expire_after(PerEntryTtl).build();

		Self { cache }
	}
}
impl Default for MemoryContextStore {
	fn default() -> Self {
		Self::new(MEMORY_STORE_CAPACITY)
	}
}
impl ContextStore for MemoryContextStore {
	fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Vec<u8>>>> {
		Box::pin(async move {
			Ok(self.cache.get(key).await.map(|stored| stored.bytes.as_ref().clone()))
		})
	}

	fn set<'a>(
		&'a self,
		key: &'a str,
		value: Vec<u8>,
		ttl: Option<Duration>,
	) -> BoxFuture<'a, Result<()>> {
		Box::pin(async move {
			self.cache.insert(key.to_string(), StoredValue { bytes: Arc::new(value), ttl }).await;

			Ok(())
		})
	}

	fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<()>> {
		Box::pin(async move {
			self.cache.invalidate(key).await;

			Ok(())
		})
	}
}

/// Durable store backed by the `session_contexts` table.
pub struct PgContextStore {
	pool: PgPool,
}
impl PgContextStore {
	pub fn new(pool: PgPool) -> Self {
		Self { pool }
	}

	/// Removes rows whose TTL has passed; expired rows are already invisible to `get`.
	pub async fn purge_expired(&self) -> Result<u64> {
		Ok(contexts::purge_expired(&self.pool, OffsetDateTime::now_utc()).await?)
	}
}
impl ContextStore for PgContextStore {
	fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Vec<u8>>>> {
		Box::pin(async move { Ok(contexts::fetch(&self.pool, key, OffsetDateTime::now_utc()).await?) })
	}

	fn set<'a>(
		&'a self,
		key: &'a str,
		value: Vec<u8>,
		ttl: Option<Duration>,
	) -> BoxFuture<'a, Result<()>> {
		Box::pin(async move {
			let now = OffsetDateTime::now_utc();
			let expires_at = ttl.map(|ttl| now + ttl);

			contexts::store(&self.pool, key, &value, now, expires_at).await?;

			Ok(())
		})
	}

	fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<()>> {
		Box::pin(async move {
			contexts::delete(&self.pool, key).await?;

			Ok(())
		})
	}
}
