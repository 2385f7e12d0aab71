use sqlx::PgPool;

use kora_domain::{
	index::EmbeddedUnit,
	search::{KnowledgeBaseType, SearchTarget},
};

use crate::{
	Result,
	models::{self, ChunkHit},
};

const HIT_COLUMNS: &str = "chunk_id, knowledge_id, knowledge_base_id, knowledge_title, \
	knowledge_filename, chunk_index, chunk_type, content";

pub async fn upsert_units(pool: &PgPool, tenant_id: &str, units: &[EmbeddedUnit]) -> Result<()> {
	let mut tx = pool.begin().await?;

	for embedded in units {
		let unit = &embedded.unit;

		sqlx::query(
			"\
INSERT INTO chunk_index (
	tenant_id,
	chunk_id,
	source_id,
	source_type,
	knowledge_id,
	knowledge_base_id,
	knowledge_base_type,
	knowledge_title,
	knowledge_filename,
	chunk_index,
	chunk_type,
	content,
	content_hash,
	embedding_dim,
	embedding,
	updated_at
)
VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15::text::vector, now())
ON CONFLICT (tenant_id, chunk_id) DO UPDATE
SET
	source_id = EXCLUDED.source_id,
	source_type = EXCLUDED.source_type,
	knowledge_id = EXCLUDED.knowledge_id,
	knowledge_base_id = EXCLUDED.knowledge_base_id,
	knowledge_base_type = EXCLUDED.knowledge_base_type,
	knowledge_title = EXCLUDED.knowledge_title,
	knowledge_filename = EXCLUDED.knowledge_filename,
	chunk_index = EXCLUDED.chunk_index,
	chunk_type = EXCLUDED.chunk_type,
	content = EXCLUDED.content,
	content_hash = EXCLUDED.content_hash,
	embedding_dim = EXCLUDED.embedding_dim,
	embedding = EXCLUDED.embedding,
	updated_at = now()",
		)
		.bind(tenant_id)
		.bind(unit.chunk_id.as_str())
		.bind(unit.source_id.as_str())
		.bind(unit.source_type.as_str())
		.bind(unit.knowledge_id.as_str())
		.bind(unit.knowledge_base_id.as_str())
		.bind(unit.knowledge_base_type.as_str())
		.bind(unit.knowledge_title.as_str())
		.bind(unit.knowledge_filename.as_str())
		.bind(unit.chunk_index)
		.bind(unit.chunk_type.as_str())
		.bind(unit.content.as_str())
		.bind(unit.content_hash())
		.bind(embedded.embedding.len() as i32)
		.bind(models::vector_literal(&embedded.embedding))
		.execute(&mut *tx)
		.await?;
	}

	tx.commit().await?;

	Ok(())
}

/// Returns the number of removed rows. Missing IDs are not an error.
pub async fn delete_by_source_ids(
	pool: &PgPool,
	tenant_id: &str,
	source_ids: &[String],
	embedding_dim: u32,
	kb_type: KnowledgeBaseType,
) -> Result<u64> {
	if source_ids.is_empty() {
		return Ok(0);
	}

	let result = sqlx::query(
		"\
DELETE FROM chunk_index
WHERE tenant_id = $1
	AND source_id = ANY($2)
	AND embedding_dim = $3
	AND knowledge_base_type = $4",
	)
	.bind(tenant_id)
	.bind(source_ids)
	.bind(embedding_dim as i32)
	.bind(kb_type.as_str())
	.execute(pool)
	.await?;

	Ok(result.rows_affected())
}

pub async fn keyword_search(
	pool: &PgPool,
	tenant_id: &str,
	target: &SearchTarget,
	query: &str,
	threshold: f32,
	top_k: u32,
) -> Result<Vec<ChunkHit>> {
	let sql = format!(
		"\
SELECT *
FROM (
	SELECT
		{HIT_COLUMNS},
		ts_rank_cd(content_tsv, plainto_tsquery('simple', $4), 32)::real AS score
	FROM chunk_index
	WHERE tenant_id = $1
		AND knowledge_base_id = $2
		AND (cardinality($3::text[]) = 0 OR knowledge_id = ANY($3))
		AND content_tsv @@ plainto_tsquery('simple', $4)
) ranked
WHERE score >= $5
ORDER BY score DESC, chunk_id ASC
LIMIT $6"
	);
	let hits = sqlx::query_as::<_, ChunkHit>(&sql)
		.bind(tenant_id)
		.bind(target.knowledge_base_id())
		.bind(target.knowledge_ids())
		.bind(query)
		.bind(threshold)
		.bind(top_k as i64)
		.fetch_all(pool)
		.await?;

	Ok(hits)
}

pub async fn vector_search(
	pool: &PgPool,
	tenant_id: &str,
	target: &SearchTarget,
	embedding: &[f32],
	threshold: f32,
	top_k: u32,
) -> Result<Vec<ChunkHit>> {
	let sql = format!(
		"\
SELECT *
FROM (
	SELECT
		{HIT_COLUMNS},
		(1 - (embedding <=> $4::text::vector))::real AS score
	FROM chunk_index
	WHERE tenant_id = $1
		AND knowledge_base_id = $2
		AND (cardinality($3::text[]) = 0 OR knowledge_id = ANY($3))
		AND embedding_dim = $7
) ranked
WHERE score >= $5
ORDER BY score DESC, chunk_id ASC
LIMIT $6"
	);
	let hits = sqlx::query_as::<_, ChunkHit>(&sql)
		.bind(tenant_id)
		.bind(target.knowledge_base_id())
		.bind(target.knowledge_ids())
		.bind(models::vector_literal(embedding))
		.bind(threshold)
		.bind(top_k as i64)
		.bind(embedding.len() as i32)
		.fetch_all(pool)
		.await?;

	Ok(hits)
}
