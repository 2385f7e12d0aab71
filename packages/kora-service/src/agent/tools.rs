use std::sync::Arc;

use serde_json::{Value, json};

use kora_config::ExternalTool;
use kora_domain::{chat::ToolDefinition, search::SearchResult};

use crate::{
	BoxFuture, Error, Result,
	agent::config::AgentRunConfig,
	analysis::TableData,
	pipeline::{
		StageContext,
		stages::{merge_adjacent, render_contexts},
	},
	retrieval::SearchParams,
};

/// What the model sees after a tool call, plus citations for the references event.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ToolOutput {
	pub content: String,
	pub success: bool,
	pub references: Vec<SearchResult>,
}
impl ToolOutput {
	pub fn ok(content: impl Into<String>) -> Self {
		Self { content: content.into(), success: true, references: Vec::new() }
	}

	pub fn failed(content: impl Into<String>) -> Self {
		Self { content: content.into(), success: false, references: Vec::new() }
	}

	pub fn with_references(mut self, references: Vec<SearchResult>) -> Self {
		self.references = references;

		self
	}
}

/// Request-scoped inputs a tool may read.
pub struct ToolContext<'a> {
	pub tenant_id: &'a str,
	pub session_id: &'a str,
	pub run: &'a AgentRunConfig,
}

pub trait AgentTool
where
	Self: Send + Sync,
{
	fn name(&self) -> &str;

	fn description(&self) -> &str;

	/// JSON schema of the arguments object.
	fn parameters(&self) -> Value;

	/// Tools that read the knowledge scope are withheld from runs without one.
	fn requires_knowledge(&self) -> bool {
		false
	}

	fn execute<'a>(
		&'a self,
		ctx: &'a ToolContext<'a>,
		arguments: &'a Value,
	) -> BoxFuture<'a, Result<ToolOutput>>;

	fn definition(&self) -> ToolDefinition {
		ToolDefinition {
			name: self.name().to_string(),
			description: self.description().to_string(),
			parameters: self.parameters(),
		}
	}
}

/// Tools offered to one run, in registration order. The first tool registered under a name wins.
#[derive(Clone, Default)]
pub struct ToolRegistry {
	tools: Vec<Arc<dyn AgentTool>>,
}
impl ToolRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	/// Built-ins, configured external services, then `extra`, filtered to what `run` allows.
	pub fn for_run(ctx: &Arc<StageContext>, extra: &[Arc<dyn AgentTool>], run: &AgentRunConfig) -> Self {
		let mut registry = Self::new();

		registry.register(Arc::new(ThinkingTool));
		registry.register(Arc::new(KnowledgeSearchTool { ctx: ctx.clone() }));
		registry.register(Arc::new(DataAnalysisTool { ctx: ctx.clone() }));

		if run.web_search_enabled() {
			registry.register(Arc::new(WebSearchTool { ctx: ctx.clone() }));
		}

		for tool in &ctx.cfg.agent.external_tools {
			registry.register(Arc::new(ExternalHttpTool { ctx: ctx.clone(), cfg: tool.clone() }));
		}
		for tool in extra {
			registry.register(tool.clone());
		}

		registry.restrict(run);

		registry
	}

	/// Returns false when the name is already taken.
	pub fn register(&mut self, tool: Arc<dyn AgentTool>) -> bool {
		if self.get(tool.name()).is_some() {
			tracing::warn!(tool = tool.name(), "Tool name already registered; keeping the first.");

			return false;
		}

		self.tools.push(tool);

		true
	}

	pub fn get(&self, name: &str) -> Option<&Arc<dyn AgentTool>> {
		self.tools.iter().find(|tool| tool.name() == name)
	}

	pub fn names(&self) -> Vec<String> {
		self.tools.iter().map(|tool| tool.name().to_string()).collect()
	}

	pub fn definitions(&self) -> Vec<ToolDefinition> {
		self.tools.iter().map(|tool| tool.definition()).collect()
	}

	pub fn len(&self) -> usize {
		self.tools.len()
	}

	pub fn is_empty(&self) -> bool {
		self.tools.is_empty()
	}

	fn restrict(&mut self, run: &AgentRunConfig) {
		let knowledge = run.has_knowledge_scope();
		let allowed = run.allowed_tools();

		self.tools.retain(|tool| {
			(knowledge || !tool.requires_knowledge())
				&& (allowed.is_empty() || allowed.iter().any(|name| name == tool.name()))
		});
	}
}

/// Lets the model write down its reasoning as a visible step.
struct ThinkingTool;
impl AgentTool for ThinkingTool {
	fn name(&self) -> &str {
		"thinking"
	}

	fn description(&self) -> &str {
		"Write down your reasoning or plan before acting. Nothing is looked up."
	}

	fn parameters(&self) -> Value {
		json!({
			"type": "object",
			"properties": { "thought": { "type": "string", "description": "Your reasoning." } },
			"required": ["thought"]
		})
	}

	fn execute<'a>(
		&'a self,
		_ctx: &'a ToolContext<'a>,
		arguments: &'a Value,
	) -> BoxFuture<'a, Result<ToolOutput>> {
		Box::pin(async move {
			let thought = string_argument(arguments, "thought")?;

			Ok(ToolOutput::ok(thought))
		})
	}
}

struct KnowledgeSearchTool {
	ctx: Arc<StageContext>,
}
impl AgentTool for KnowledgeSearchTool {
	fn name(&self) -> &str {
		"knowledge_search"
	}

	fn description(&self) -> &str {
		"Search the knowledge bases in scope and return the most relevant passages."
	}

	fn parameters(&self) -> Value {
		json!({
			"type": "object",
			"properties": { "query": { "type": "string", "description": "What to look for." } },
			"required": ["query"]
		})
	}

	fn requires_knowledge(&self) -> bool {
		true
	}

	fn execute<'a>(
		&'a self,
		ctx: &'a ToolContext<'a>,
		arguments: &'a Value,
	) -> BoxFuture<'a, Result<ToolOutput>> {
		Box::pin(async move {
			let query = string_argument(arguments, "query")?;
			let settings = ctx.run.retrieval();
			let params = SearchParams::new(
				query.as_str(),
				ctx.run.search_targets().to_vec(),
				settings.thresholds(),
				settings.embedding_top_k,
			);
			let mut results = self.ctx.retrieval.search(ctx.tenant_id, &params).await?;

			if settings.enable_rerank && !results.is_empty() {
				let candidates = results.clone();

				match self
					.ctx
					.retrieval
					.rerank(
						&self.ctx.cfg.providers.rerank,
						&query,
						candidates,
						settings.rerank_top_k as usize,
						settings.rerank_threshold,
					)
					.await
				{
					Ok(reranked) => results = reranked,
					Err(err) => {
						tracing::warn!(error = %err, "Rerank failed inside knowledge search; using raw order.");

						results.truncate(settings.rerank_top_k as usize);
					},
				}
			} else {
				results.truncate(settings.rerank_top_k as usize);
			}

			let results = merge_adjacent(&results);

			if results.is_empty() {
				return Ok(ToolOutput::ok("No relevant passages were found."));
			}

			Ok(ToolOutput::ok(render_contexts(&results)).with_references(results))
		})
	}
}

struct WebSearchTool {
	ctx: Arc<StageContext>,
}
impl AgentTool for WebSearchTool {
	fn name(&self) -> &str {
		"web_search"
	}

	fn description(&self) -> &str {
		"Search the public web for recent or general information."
	}

	fn parameters(&self) -> Value {
		json!({
			"type": "object",
			"properties": { "query": { "type": "string", "description": "Search terms." } },
			"required": ["query"]
		})
	}

	fn execute<'a>(
		&'a self,
		ctx: &'a ToolContext<'a>,
		arguments: &'a Value,
	) -> BoxFuture<'a, Result<ToolOutput>> {
		Box::pin(async move {
			let query = string_argument(arguments, "query")?;
			let Some(cfg) = &self.ctx.cfg.providers.web_search else {
				return Ok(ToolOutput::failed("Web search is not configured."));
			};
			let hits = self
				.ctx
				.providers
				.web_search
				.search(cfg, &query, ctx.run.web_search_max_results())
				.await?;

			if hits.is_empty() {
				return Ok(ToolOutput::ok("The web search returned nothing."));
			}

			let content = hits
				.iter()
				.enumerate()
				.map(|(index, hit)| format!("[{}] {} ({})\n{}", index + 1, hit.title, hit.url, hit.snippet))
				.collect::<Vec<_>>()
				.join("\n\n");

			Ok(ToolOutput::ok(content))
		})
	}
}

struct DataAnalysisTool {
	ctx: Arc<StageContext>,
}
impl AgentTool for DataAnalysisTool {
	fn name(&self) -> &str {
		"data_analysis"
	}

	fn description(&self) -> &str {
		"Answer a question about a tabular knowledge item (CSV) by running SQL over it."
	}

	fn parameters(&self) -> Value {
		json!({
			"type": "object",
			"properties": {
				"knowledge_id": { "type": "string", "description": "The table's knowledge ID." },
				"question": { "type": "string", "description": "What to compute." }
			},
			"required": ["knowledge_id", "question"]
		})
	}

	fn requires_knowledge(&self) -> bool {
		true
	}

	fn execute<'a>(
		&'a self,
		ctx: &'a ToolContext<'a>,
		arguments: &'a Value,
	) -> BoxFuture<'a, Result<ToolOutput>> {
		Box::pin(async move {
			let knowledge_id = string_argument(arguments, "knowledge_id")?;
			let question = string_argument(arguments, "question")?;
			let ids = vec![knowledge_id.clone()];
			let known = self.ctx.catalog.knowledge_batch(ctx.tenant_id, &ids).await?;
			let in_scope = known.iter().any(|info| {
				ctx.run
					.search_targets()
					.iter()
					.any(|target| target.contains(&info.knowledge_base_id, &info.knowledge_id))
			});

			if !in_scope {
				return Ok(ToolOutput::failed(format!("{knowledge_id} is not in the searchable scope.")));
			}

			let Some(table) = self.ctx.catalog.load_table(ctx.tenant_id, &knowledge_id).await? else {
				return Ok(ToolOutput::failed(format!("{knowledge_id} is not a table.")));
			};
			let data = TableData::from_csv(&table.filename, &table.content)?;
			let (sql, output) = self
				.ctx
				.tabular
				.ask(self.ctx.providers.chat.as_ref(), &self.ctx.cfg.providers.chat, data, &question)
				.await?;

			Ok(ToolOutput::ok(format!("SQL: {sql}\n{}", output.render())))
		})
	}
}

/// A configured HTTP tool service.
struct ExternalHttpTool {
	ctx: Arc<StageContext>,
	cfg: ExternalTool,
}
impl AgentTool for ExternalHttpTool {
	fn name(&self) -> &str {
		&self.cfg.name
	}

	fn description(&self) -> &str {
		&self.cfg.description
	}

	fn parameters(&self) -> Value {
		if self.cfg.parameters.is_empty() {
			json!({ "type": "object", "properties": {} })
		} else {
			Value::Object(self.cfg.parameters.clone())
		}
	}

	fn execute<'a>(
		&'a self,
		_ctx: &'a ToolContext<'a>,
		arguments: &'a Value,
	) -> BoxFuture<'a, Result<ToolOutput>> {
		Box::pin(async move {
			let output = self.ctx.providers.tools.invoke(&self.cfg, arguments).await?;

			Ok(ToolOutput::ok(output))
		})
	}
}

fn string_argument(arguments: &Value, key: &str) -> Result<String> {
	arguments
		.get(key)
		.and_then(Value::as_str)
		.map(str::trim)
		.filter(|value| !value.is_empty())
		.map(str::to_string)
		.ok_or_else(|| Error::InvalidRequest { message: format!("Argument {key} is required.") })
}
