use time::{Duration, OffsetDateTime};

use kora_domain::{
	index::{self, EmbeddedUnit, IndexWriteUnit, SourceType},
	search::{ChunkType, KnowledgeBaseType, SearchTarget},
};
use kora_storage::{chunks, contexts, db::Db};
use kora_testkit::TestDatabase;

const VECTOR_DIM: u32 = 4;

fn unit(knowledge_id: &str, chunk_index: i32, content: &str) -> IndexWriteUnit {
	let chunk_id = index::chunk_id(knowledge_id, SourceType::Chunk, chunk_index);

	IndexWriteUnit {
		content: content.to_string(),
		source_type: SourceType::Chunk,
		source_id: chunk_id.clone(),
		chunk_id,
		chunk_index,
		chunk_type: ChunkType::Text,
		knowledge_id: knowledge_id.to_string(),
		knowledge_base_id: "kb".to_string(),
		knowledge_base_type: KnowledgeBaseType::Document,
		knowledge_title: "Handbook".to_string(),
		knowledge_filename: "handbook.md".to_string(),
	}
}

#[tokio::test]
#[ignore = "Requires external Postgres with pgvector. Set KORA_PG_DSN to run."]
async fn chunks_round_trip_through_keyword_vector_and_delete() {
	let Some(base_dsn) = kora_testkit::env_dsn() else {
		eprintln!("Skipping chunks_round_trip_through_keyword_vector_and_delete; set KORA_PG_DSN.");

		return;
	};
	let test_db = TestDatabase::new(&base_dsn).await.expect("Failed to create test database.");
	let db = Db::connect(&test_db.postgres_config()).await.expect("Failed to connect to Postgres.");

	db.ensure_schema(VECTOR_DIM).await.expect("Failed to ensure schema.");

	let units = vec![
		EmbeddedUnit {
			unit: unit("k1", 0, "vacation policy allows twenty days"),
			embedding: vec![1.0, 0.0, 0.0, 0.0],
		},
		EmbeddedUnit {
			unit: unit("k1", 1, "expense reports are due monthly"),
			embedding: vec![0.0, 1.0, 0.0, 0.0],
		},
	];

	chunks::upsert_units(&db.pool, "t1", &units).await.expect("Failed to upsert units.");
	chunks::upsert_units(&db.pool, "t1", &units).await.expect("Retry upsert must succeed.");

	let count: i64 = sqlx::query_scalar("SELECT count(*) FROM chunk_index")
		.fetch_one(&db.pool)
		.await
		.expect("Failed to count chunks.");

	assert_eq!(count, 2);

	let target = SearchTarget::KnowledgeBase { knowledge_base_id: "kb".to_string() };
	let keyword = chunks::keyword_search(&db.pool, "t1", &target, "vacation", 0.0, 5)
		.await
		.expect("Keyword search failed.");

	assert_eq!(keyword.len(), 1);
	assert_eq!(keyword[0].chunk_index, 0);

	let vector =
		chunks::vector_search(&db.pool, "t1", &target, &[1.0, 0.0, 0.0, 0.0], 0.9, 5)
			.await
			.expect("Vector search failed.");

	assert_eq!(vector.len(), 1);
	assert!(vector[0].score >= 0.9);

	let ids: Vec<String> = units.iter().map(|u| u.unit.source_id.clone()).collect();
	let removed =
		chunks::delete_by_source_ids(&db.pool, "t1", &ids, VECTOR_DIM, KnowledgeBaseType::Document)
			.await
			.expect("Delete failed.");

	assert_eq!(removed, 2);

	let removed =
		chunks::delete_by_source_ids(&db.pool, "t1", &ids, VECTOR_DIM, KnowledgeBaseType::Document)
			.await
			.expect("Repeated delete must succeed.");

	assert_eq!(removed, 0);

	test_db.cleanup().await.expect("Failed to clean up test database.");
}

#[tokio::test]
#[ignore = "Requires external Postgres with pgvector. Set KORA_PG_DSN to run."]
async fn session_contexts_honor_expiry() {
	let Some(base_dsn) = kora_testkit::env_dsn() else {
		eprintln!("Skipping session_contexts_honor_expiry; set KORA_PG_DSN to run this test.");

		return;
	};
	let test_db = TestDatabase::new(&base_dsn).await.expect("Failed to create test database.");
	let db = Db::connect(&test_db.postgres_config()).await.expect("Failed to connect to Postgres.");

	db.ensure_schema(VECTOR_DIM).await.expect("Failed to ensure schema.");

	let now = OffsetDateTime::now_utc();

	contexts::store(&db.pool, "context:s1", b"{}", now, Some(now + Duration::minutes(5)))
		.await
		.expect("Failed to store context.");
	contexts::store(&db.pool, "context:s2", b"{}", now, Some(now - Duration::minutes(5)))
		.await
		.expect("Failed to store context.");

	assert!(contexts::fetch(&db.pool, "context:s1", now).await.expect("Fetch failed.").is_some());
	assert!(contexts::fetch(&db.pool, "context:s2", now).await.expect("Fetch failed.").is_none());
	assert_eq!(contexts::purge_expired(&db.pool, now).await.expect("Purge failed."), 1);

	contexts::delete(&db.pool, "context:s1").await.expect("Delete failed.");

	assert!(contexts::fetch(&db.pool, "context:s1", now).await.expect("Fetch failed.").is_none());

	test_db.cleanup().await.expect("Failed to clean up test database.");
}
