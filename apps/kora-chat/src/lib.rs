pub mod render;

use std::{
	fs,
	path::{Path, PathBuf},
	sync::Arc,
};

use clap::Parser;
use color_eyre::eyre;
use tracing_subscriber::EnvFilter;

use kora_config::{Config, ContextStoreKind};
use kora_domain::search::KnowledgeBaseType;
use kora_service::{
	Collaborators, KoraService, QaRequest,
	catalog::{KnowledgeInfo, StaticCatalog, TableSource},
	context::store::PgContextStore,
	retrieval::registry::BackendRegistry,
};
use kora_storage::db::Db;

const DEFAULT_KNOWLEDGE_BASE: &str = "local";

#[derive(Debug, Parser)]
#[command(
	version = kora_cli::VERSION,
	rename_all = "kebab",
	styles = kora_cli::styles(),
)]
pub struct Args {
	#[arg(long, short = 'c', value_name = "FILE")]
	pub config: PathBuf,
	#[arg(long, default_value = "default")]
	pub tenant: String,
	#[arg(long, short = 's', default_value = "cli")]
	pub session: String,
	/// Knowledge bases to search; `--doc` files land in the first one.
	#[arg(long = "kb", value_name = "ID")]
	pub knowledge_bases: Vec<String>,
	/// Individual knowledge items to search.
	#[arg(long = "knowledge", value_name = "ID")]
	pub knowledge: Vec<String>,
	/// Text or CSV files to index before answering.
	#[arg(long = "doc", value_name = "FILE")]
	pub docs: Vec<PathBuf>,
	#[arg(long)]
	pub web: bool,
	/// Answer through the tool-using agent instead of the fixed pipeline.
	#[arg(long)]
	pub agent: bool,
	pub query: String,
}

pub async fn run(mut args: Args) -> color_eyre::Result<()> {
	let config = kora_config::load(&args.config)?;

	init_tracing(&config)?;

	let backends = BackendRegistry::connect(&config).await;
	let catalog = Arc::new(StaticCatalog::default());
	let mut collaborators = Collaborators::new(backends).with_catalog(catalog.clone());

	if config.context.store == ContextStoreKind::Postgres
		&& let Some(postgres) = &config.storage.postgres
	{
		let db = Db::connect(postgres).await?;

		db.ensure_schema(config.providers.embedding.dimensions).await?;

		collaborators = collaborators.with_context_store(Arc::new(PgContextStore::new(db.pool)));
	}

	let service = Arc::new(KoraService::new(config, collaborators));

	if !args.docs.is_empty() && args.knowledge_bases.is_empty() {
		args.knowledge_bases.push(DEFAULT_KNOWLEDGE_BASE.to_string());
	}

	for path in &args.docs {
		index_doc(&service, &catalog, &args.tenant, &args.knowledge_bases[0], path).await?;
	}

	let request = QaRequest {
		knowledge_base_ids: args.knowledge_bases.clone(),
		knowledge_ids: args.knowledge.clone(),
		web_search_enabled: args.web,
		..QaRequest::new(&args.tenant, &args.session, &args.query)
	};

	render::stream_answer(&service, request, args.agent).await
}

async fn index_doc(
	service: &KoraService,
	catalog: &StaticCatalog,
	tenant_id: &str,
	knowledge_base_id: &str,
	path: &Path,
) -> color_eyre::Result<()> {
	let content = fs::read_to_string(path)?;
	let filename = path
		.file_name()
		.map(|name| name.to_string_lossy().into_owned())
		.ok_or_else(|| eyre::eyre!("{} is not a file.", path.display()))?;
	let knowledge_id = path
		.file_stem()
		.map(|stem| stem.to_string_lossy().into_owned())
		.unwrap_or_else(|| filename.clone());
	let info = KnowledgeInfo {
		knowledge_id: knowledge_id.clone(),
		knowledge_base_id: knowledge_base_id.to_string(),
		title: knowledge_id.clone(),
		filename: filename.clone(),
	};

	catalog.insert(tenant_id, info.clone());

	let ids = if is_csv(path) {
		catalog.insert_table(tenant_id, &knowledge_id, TableSource { filename, content });

		service.index_table(tenant_id, &info, KnowledgeBaseType::Document).await?
	} else {
		service
			.index_knowledge(tenant_id, &info, KnowledgeBaseType::Document, &paragraphs(&content))
			.await?
	};

	tracing::info!(path = %path.display(), chunks = ids.len(), "Document indexed.");

	Ok(())
}

fn init_tracing(config: &Config) -> color_eyre::Result<()> {
	let filter =
		EnvFilter::try_new(&config.service.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

	tracing_subscriber::fmt().with_writer(std::io::stderr).with_env_filter(filter).init();

	Ok(())
}

fn is_csv(path: &Path) -> bool {
	path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("csv"))
}

/// Blank-line separated blocks, trimmed.
fn paragraphs(text: &str) -> Vec<String> {
	text.split("\n\n")
		.map(str::trim)
		.filter(|block| !block.is_empty())
		.map(ToString::to_string)
		.collect()
}
