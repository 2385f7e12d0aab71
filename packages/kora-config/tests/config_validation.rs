use std::path::Path;

use toml::Value;

use kora_config::{
	CompressionStrategy, Config, Error, FailurePolicy, FallbackStrategy, RetrievalDriver,
};

const SAMPLE_CONFIG_TEMPLATE_TOML: &str = include_str!("fixtures/sample_config.template.toml");

fn sample_value() -> Value {
	toml::from_str(SAMPLE_CONFIG_TEMPLATE_TOML).expect("Failed to parse template config.")
}

fn parse_value(value: &Value) -> kora_config::Result<Config> {
	let raw = toml::to_string(value).expect("Failed to render template config.");

	kora_config::parse(Path::new("test.toml"), &raw)
}

fn table_mut<'a>(value: &'a mut Value, key: &str) -> &'a mut toml::Table {
	value
		.as_table_mut()
		.expect("Template config must be a table.")
		.get_mut(key)
		.and_then(Value::as_table_mut)
		.expect("Template config must include the requested table.")
}

fn assert_validation(value: &Value, expected: &str) {
	match parse_value(value) {
		Err(Error::Validation { message }) => assert!(
			message.contains(expected),
			"Unexpected validation message: {message}."
		),
		Err(err) => panic!("Unexpected error: {err}."),
		Ok(_) => panic!("Expected validation to fail with {expected}."),
	}
}

#[test]
fn sample_config_parses_with_typed_enums() {
	let cfg = parse_value(&sample_value()).expect("Sample config must be valid.");

	assert_eq!(cfg.retrieval.drivers, vec![RetrievalDriver::Postgres, RetrievalDriver::Qdrant]);
	assert_eq!(cfg.retrieval.failure_policy, FailurePolicy::FailFast);
	assert!(cfg.retrieval.is_mandatory(RetrievalDriver::Postgres));
	assert!(!cfg.retrieval.is_mandatory(RetrievalDriver::Qdrant));
	assert_eq!(cfg.retrieval.drivers_for("acme"), &[RetrievalDriver::Qdrant]);
	assert_eq!(cfg.retrieval.drivers_for("other").len(), 2);
	assert_eq!(cfg.conversation.fallback_strategy, FallbackStrategy::Fixed);
	assert_eq!(cfg.context.compression_strategy, CompressionStrategy::Smart);
	assert_eq!(cfg.context.recent_message_count, 4);
	assert_eq!(cfg.agent.external_tools.len(), 1);
}

#[test]
fn omitted_sections_fall_back_to_defaults() {
	let mut value = sample_value();
	let root = value.as_table_mut().expect("Template config must be a table.");

	root.remove("agent");
	root.remove("context");

	let cfg = parse_value(&value).expect("Config without optional sections must be valid.");

	assert_eq!(cfg.agent.max_iterations, 5);
	assert_eq!(cfg.context.recent_message_count, 10);
	assert!(cfg.retrieval.mandatory.is_some());
}

#[test]
fn unknown_driver_is_rejected_at_parse_time() {
	let mut value = sample_value();

	table_mut(&mut value, "retrieval").insert(
		"drivers".to_string(),
		Value::Array(vec![Value::String("elasticsearch".to_string())]),
	);

	assert!(matches!(parse_value(&value), Err(Error::ParseConfig { .. })));
}

#[test]
fn duplicate_driver_is_rejected() {
	let mut value = sample_value();

	table_mut(&mut value, "retrieval").insert(
		"drivers".to_string(),
		Value::Array(vec![
			Value::String("postgres".to_string()),
			Value::String("postgres".to_string()),
		]),
	);

	assert_validation(&value, "more than once");
}

#[test]
fn driver_without_storage_is_rejected() {
	let mut value = sample_value();

	table_mut(&mut value, "storage").remove("qdrant");

	assert_validation(&value, "storage.qdrant is required");
}

#[test]
fn mandatory_driver_must_be_active() {
	let mut value = sample_value();

	table_mut(&mut value, "retrieval").insert(
		"mandatory".to_string(),
		Value::Array(vec![Value::String("memory".to_string())]),
	);

	assert_validation(&value, "retrieval.mandatory lists memory");
}

#[test]
fn tenant_override_must_use_active_drivers() {
	let mut value = sample_value();
	let retrieval = table_mut(&mut value, "retrieval");
	let tenants = retrieval
		.get_mut("tenants")
		.and_then(Value::as_table_mut)
		.expect("Template config must include [retrieval.tenants].");

	tenants.insert(
		"globex".to_string(),
		Value::Table(
			toml::from_str::<toml::Table>("drivers = [\"memory\"]")
				.expect("Failed to parse tenant table."),
		),
	);

	assert_validation(&value, "retrieval.tenants.globex.drivers lists memory");
}

#[test]
fn thresholds_must_be_within_unit_range() {
	let mut value = sample_value();

	table_mut(&mut value, "conversation")
		.insert("vector_threshold".to_string(), Value::Float(1.5));

	assert_validation(&value, "conversation.vector_threshold must be in the range 0.0-1.0.");
}

#[test]
fn empty_fallback_response_is_rejected() {
	let mut value = sample_value();

	table_mut(&mut value, "conversation")
		.insert("fallback_response".to_string(), Value::String("  ".to_string()));

	assert_validation(&value, "conversation.fallback_response must be non-empty.");
}

#[test]
fn summarize_threshold_must_not_exceed_max_tokens() {
	let mut value = sample_value();

	table_mut(&mut value, "context").insert("summarize_threshold".to_string(), Value::Integer(9_000));

	assert_validation(&value, "context.summarize_threshold must not exceed context.max_tokens.");
}

#[test]
fn agent_iterations_are_capped() {
	let mut value = sample_value();

	table_mut(&mut value, "agent").insert("max_iterations".to_string(), Value::Integer(31));

	assert_validation(&value, "agent.max_iterations must not exceed 30.");
}

#[test]
fn zero_agent_iterations_normalize_to_default() {
	let mut value = sample_value();

	table_mut(&mut value, "agent").insert("max_iterations".to_string(), Value::Integer(0));

	let cfg = parse_value(&value).expect("Zero iterations must normalize.");

	assert_eq!(cfg.agent.max_iterations, 5);
}

#[test]
fn embedding_dimensions_must_match_qdrant() {
	let mut value = sample_value();
	let storage = table_mut(&mut value, "storage");
	let qdrant = storage
		.get_mut("qdrant")
		.and_then(Value::as_table_mut)
		.expect("Template config must include [storage.qdrant].");

	qdrant.insert("vector_dim".to_string(), Value::Integer(768));

	assert_validation(&value, "providers.embedding.dimensions must match storage.qdrant.vector_dim.");
}
