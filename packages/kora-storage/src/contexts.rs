use sqlx::{PgPool, Row};
use time::OffsetDateTime;

use crate::Result;

pub async fn fetch(pool: &PgPool, key: &str, now: OffsetDateTime) -> Result<Option<Vec<u8>>> {
	let row = sqlx::query(
		"\
SELECT payload
FROM session_contexts
WHERE context_key = $1
	AND (expires_at IS NULL OR expires_at > $2)",
	)
	.bind(key)
	.bind(now)
	.fetch_optional(pool)
	.await?;
	let Some(row) = row else {
		return Ok(None);
	};

	Ok(Some(row.try_get("payload")?))
}

pub async fn store(
	pool: &PgPool,
	key: &str,
	payload: &[u8],
	now: OffsetDateTime,
	expires_at: Option<OffsetDateTime>,
) -> Result<()> {
	sqlx::query(
		"\
INSERT INTO session_contexts (context_key, payload, updated_at, expires_at)
VALUES ($1, $2, $3, $4)
ON CONFLICT (context_key) DO UPDATE
SET
	payload = EXCLUDED.payload,
	updated_at = EXCLUDED.updated_at,
	expires_at = EXCLUDED.expires_at",
	)
	.bind(key)
	.bind(payload)
	.bind(now)
	.bind(expires_at)
	.execute(pool)
	.await?;

	Ok(())
}

pub async fn delete(pool: &PgPool, key: &str) -> Result<()> {
	sqlx::query("DELETE FROM session_contexts WHERE context_key = $1")
		.bind(key)
		.execute(pool)
		.await?;

	Ok(())
}

pub async fn purge_expired(pool: &PgPool, now: OffsetDateTime) -> Result<u64> {
	let result = sqlx::query("DELETE FROM session_contexts WHERE expires_at <= $1")
		.bind(now)
		.execute(pool)
		.await?;

	Ok(result.rows_affected())
}
