use std::sync::Arc;

use kora_config::{FailurePolicy, RetrievalDriver};
use kora_domain::{
	chat::{ChatResponse, Role},
	search::KnowledgeBaseType,
};
use kora_service::{QaRequest, catalog::TableSource, retrieval::RetrievalBackend};

use super::{
	FailingBackend, Harness, TENANT, drain, knowledge, terminal_answers, test_config,
	two_backend_config,
};

fn passages() -> Vec<String> {
	vec![
		"Rust traits describe shared behavior.".to_string(),
		"Tokio drives futures to completion.".to_string(),
	]
}

#[tokio::test]
async fn failed_index_write_is_compensated() {
	let cfg = two_backend_config(RetrievalDriver::Postgres, FailurePolicy::FailFast);
	let failing: Arc<dyn RetrievalBackend> = Arc::new(FailingBackend::new(RetrievalDriver::Postgres));
	let harness = Harness::with_backends(cfg, vec![failing]);
	let info = knowledge("kb-rust", "doc-rust");
	let outcome = harness
		.service
		.index_knowledge(TENANT, &info, KnowledgeBaseType::Document, &passages())
		.await;

	assert!(outcome.is_err(), "A mandatory backend failure must surface.");
	assert!(harness.memory.is_empty(TENANT), "Index entries written before the failure remain.");
	assert_eq!(harness.chunks.count(TENANT), 0, "Chunk records written before the failure remain.");
}

#[tokio::test]
async fn repeated_indexing_upserts_instead_of_duplicating() {
	let harness = Harness::new(test_config());
	let info = knowledge("kb-rust", "doc-rust");
	let first = harness
		.service
		.index_knowledge(TENANT, &info, KnowledgeBaseType::Document, &passages())
		.await
		.expect("First indexing failed.");
	let second = harness
		.service
		.index_knowledge(TENANT, &info, KnowledgeBaseType::Document, &passages())
		.await
		.expect("Retry failed.");

	assert_eq!(first, second);
	assert_eq!(harness.memory.len(TENANT), 2);
	assert_eq!(harness.chunks.count(TENANT), 2);
}

#[tokio::test]
async fn indexed_table_answers_through_sql() {
	let harness = Harness::new(test_config());
	let info = knowledge("kb-sales", "doc-sales");

	harness.catalog.insert(TENANT, info.clone());
	harness.catalog.insert_table(TENANT, "doc-sales", TableSource {
		filename: "sales.csv".to_string(),
		content: "region,amount\nnorth,10\nsouth,20\n".to_string(),
	});

	let ids = harness
		.service
		.index_table(TENANT, &info, KnowledgeBaseType::Document)
		.await
		.expect("Indexing the table failed.");

	assert_eq!(ids.len(), 3, "One summary plus one unit per column.");

	harness.chat.reply(ChatResponse {
		content: "```sql\nSELECT region, amount FROM sales ORDER BY region\n```".to_string(),
		..Default::default()
	});

	let mut rx = harness.service.bus.subscribe("s-sales");
	let request = QaRequest {
		knowledge_base_ids: vec!["kb-sales".to_string()],
		..QaRequest::new(TENANT, "s-sales", "total amount by region in sales")
	};

	harness
		.service
		.knowledge_qa(request)
		.await
		.expect("Starting the answer failed.")
		.wait()
		.await
		.expect("Answer failed.");

	assert_eq!(terminal_answers(&drain(&mut rx)).len(), 1);

	let prompts = harness.chat.stream_prompts();
	let user_turn = prompts[0].last().expect("The prompt must end with the user turn.");

	assert_eq!(user_turn.role, Role::User);
	assert!(user_turn.content.contains("SELECT region, amount FROM sales"));
	assert!(user_turn.content.contains("record 1: "));
	assert!(user_turn.content.contains("north"));
}
