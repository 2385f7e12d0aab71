use std::sync::{Arc, atomic::Ordering};

use kora_config::{FailurePolicy, RetrievalDriver};
use kora_domain::{
	chat::ChatResponse,
	event::{EventData, StreamEvent},
	search::{MatchType, SearchResult, SearchTarget},
};
use kora_service::{
	Error, QaRequest,
	pipeline::{EventType, StageErrorKind},
	retrieval::RetrievalBackend,
};

use super::{
	FailingBackend, Harness, StubGraph, TENANT, drain, graph_hit, knowledge, test_config,
	two_backend_config,
};

fn ids(values: &[&str]) -> Vec<String> {
	values.iter().map(ToString::to_string).collect()
}

#[tokio::test]
async fn knowledge_inside_a_full_scope_base_adds_no_partial_target() {
	let harness = Harness::new(test_config());

	harness.catalog.insert(TENANT, knowledge("A", "docInA"));
	harness.catalog.insert(TENANT, knowledge("B", "docInB"));

	let targets =
		harness.service.build_search_targets(TENANT, &ids(&["A"]), &ids(&["docInA"])).await;

	assert_eq!(targets, vec![SearchTarget::KnowledgeBase { knowledge_base_id: "A".to_string() }]);

	let targets = harness
		.service
		.build_search_targets(TENANT, &ids(&["A"]), &ids(&["docInA", "docInB", "unknown"]))
		.await;

	assert_eq!(targets, vec![
		SearchTarget::KnowledgeBase { knowledge_base_id: "A".to_string() },
		SearchTarget::Knowledge {
			knowledge_base_id: "B".to_string(),
			knowledge_ids: vec!["docInB".to_string()],
		},
	]);
}

#[tokio::test]
async fn indexed_content_is_found_above_threshold() {
	let mut cfg = test_config();

	cfg.conversation.enable_rerank = false;

	let floor = cfg.conversation.keyword_threshold.min(cfg.conversation.vector_threshold);
	let harness = Harness::new(cfg);

	harness.seed("kb-rust", "doc-rust", &["Rust ownership moves values between bindings."]).await;

	let hits = harness
		.service
		.search_knowledge(TENANT, "rust ownership", &ids(&["kb-rust"]), &[])
		.await
		.expect("Search failed.");

	assert_eq!(hits.len(), 1);
	assert!(hits[0].score >= floor);
	assert_eq!(hits[0].knowledge_id, "doc-rust");

	let other_tenant = harness
		.service
		.search_knowledge("tenant-b", "rust ownership", &ids(&["kb-rust"]), &[])
		.await
		.expect("Search failed.");

	assert!(other_tenant.is_empty(), "Tenants never see each other's chunks.");
}

#[tokio::test]
async fn fail_fast_aborts_search_when_a_backend_fails() {
	let mut cfg = two_backend_config(RetrievalDriver::Postgres, FailurePolicy::FailFast);

	cfg.retrieval.mandatory = Some(vec![RetrievalDriver::Memory]);

	let failing = Arc::new(FailingBackend::new(RetrievalDriver::Postgres));
	let harness = Harness::with_backends(cfg, vec![failing.clone() as Arc<dyn RetrievalBackend>]);

	harness.seed("kb-rust", "doc-rust", &["Rust ownership moves values."]).await;

	let outcome =
		harness.service.search_knowledge(TENANT, "rust ownership", &ids(&["kb-rust"]), &[]).await;

	assert!(matches!(outcome, Err(Error::Pipeline { kind: StageErrorKind::Search, .. })));
	assert!(failing.calls.load(Ordering::SeqCst) > 0);
}

#[tokio::test]
async fn degrade_keeps_results_from_healthy_backends() {
	let mut cfg = two_backend_config(RetrievalDriver::Qdrant, FailurePolicy::Degrade);

	cfg.retrieval.mandatory = Some(vec![RetrievalDriver::Memory]);

	let failing: Arc<dyn RetrievalBackend> = Arc::new(FailingBackend::new(RetrievalDriver::Qdrant));
	let harness = Harness::with_backends(cfg, vec![failing]);

	harness.seed("kb-rust", "doc-rust", &["Rust ownership moves values."]).await;

	let hits = harness
		.service
		.search_knowledge(TENANT, "rust ownership", &ids(&["kb-rust"]), &[])
		.await
		.expect("Degraded search must still answer.");

	assert_eq!(hits.len(), 1);
	assert_eq!(hits[0].knowledge_id, "doc-rust");
}

#[tokio::test]
async fn tenant_override_limits_active_backends() {
	let mut cfg = two_backend_config(RetrievalDriver::Postgres, FailurePolicy::FailFast);

	cfg.retrieval.mandatory = Some(vec![RetrievalDriver::Memory]);
	cfg.retrieval.tenants.insert(TENANT.to_string(), kora_config::TenantRetrieval {
		drivers: vec![RetrievalDriver::Memory],
	});

	let failing = Arc::new(FailingBackend::new(RetrievalDriver::Postgres));
	let harness = Harness::with_backends(cfg, vec![failing.clone() as Arc<dyn RetrievalBackend>]);

	harness.seed("kb-rust", "doc-rust", &["Rust ownership moves values."]).await;

	let hits = harness
		.service
		.search_knowledge(TENANT, "rust ownership", &ids(&["kb-rust"]), &[])
		.await
		.expect("Search failed.");

	assert_eq!(hits.len(), 1);
	assert_eq!(failing.calls.load(Ordering::SeqCst), 0);
}

fn references(events: &[StreamEvent]) -> Vec<SearchResult> {
	events
		.iter()
		.find_map(|event| match &event.data {
			EventData::References { references } => Some(references.clone()),
			_ => None,
		})
		.expect("A references event must precede the answer.")
}

async fn graph_harness() -> (Harness, Arc<StubGraph>) {
	let graph = Arc::new(StubGraph::new(vec![
		graph_hit("kb-rust", "doc-runtime", "The runtime drives futures to completion."),
		graph_hit("kb-private", "doc-secret", "Private notes about the runtime."),
	]));
	let harness = Harness::with_graph(test_config(), graph.clone());

	harness.seed("kb-rust", "doc-tokio", &["Tokio schedules tasks on a pool of worker threads."]).await;

	(harness, graph)
}

#[tokio::test]
async fn parallel_search_adds_in_scope_graph_hits() {
	let (harness, graph) = graph_harness().await;

	harness.chat.reply(ChatResponse { content: r#"["Tokio"]"#.to_string(), ..Default::default() });

	let mut rx = harness.service.bus.subscribe("s-graph");
	let request = QaRequest {
		knowledge_base_ids: vec!["kb-rust".to_string()],
		..QaRequest::new(TENANT, "s-graph", "How does tokio schedule tasks")
	};

	harness
		.service
		.knowledge_qa_with(request, vec![
			EventType::ExtractEntity,
			EventType::ChunkSearchParallel,
			EventType::ChunkMerge,
			EventType::ChatCompletionStream,
		])
		.await
		.expect("Starting the answer failed.")
		.wait()
		.await
		.expect("Answer failed.");

	let references = references(&drain(&mut rx));

	assert_eq!(graph.lookups(), vec![vec!["Tokio".to_string()]]);
	assert_eq!(harness.chat.chat_calls(), 1, "Search must reuse the extracted entities.");
	assert!(
		references
			.iter()
			.any(|hit| hit.match_type == MatchType::Graph && hit.content.contains("drives futures"))
	);
	assert!(references.iter().any(|hit| hit.content.contains("worker threads")));
	assert!(references.iter().all(|hit| hit.knowledge_base_id != "kb-private"));
}

#[tokio::test]
async fn failed_entity_extraction_leaves_chunk_hits() {
	let (harness, graph) = graph_harness().await;

	harness.chat.reply(ChatResponse { content: "Tokio, probably.".to_string(), ..Default::default() });

	let mut rx = harness.service.bus.subscribe("s-graph-down");
	let request = QaRequest {
		knowledge_base_ids: vec!["kb-rust".to_string()],
		..QaRequest::new(TENANT, "s-graph-down", "How does tokio schedule tasks")
	};

	harness
		.service
		.knowledge_qa_with(request, vec![
			EventType::ChunkSearchParallel,
			EventType::ChunkMerge,
			EventType::ChatCompletionStream,
		])
		.await
		.expect("Starting the answer failed.")
		.wait()
		.await
		.expect("A failed extraction only costs the graph hits.");

	let references = references(&drain(&mut rx));

	assert!(graph.lookups().is_empty());
	assert!(references.iter().any(|hit| hit.content.contains("worker threads")));
	assert!(references.iter().all(|hit| hit.match_type != MatchType::Graph));
}

#[tokio::test]
async fn sequential_search_skips_the_graph() {
	let (harness, graph) = graph_harness().await;
	let results = harness
		.service
		.search_knowledge(TENANT, "How does tokio schedule tasks", &ids(&["kb-rust"]), &[])
		.await
		.expect("Search failed.");

	assert!(graph.lookups().is_empty());
	assert_eq!(harness.chat.chat_calls(), 0);
	assert!(results.iter().all(|hit| hit.match_type != MatchType::Graph));
}
