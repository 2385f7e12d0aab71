use std::collections::BTreeMap;

use kora_domain::{
	index::{self, IndexWriteUnit, SourceType},
	search::{ChunkType, KnowledgeBaseType},
};

use crate::{
	Error, KoraService, Result,
	analysis::{TableData, TabularEngine},
	catalog::KnowledgeInfo,
};

impl KoraService {
	/// `chunks` are passages in document order. Returned chunk IDs are stable per knowledge item
	/// and position.
	pub async fn index_knowledge(
		&self,
		tenant_id: &str,
		knowledge: &KnowledgeInfo,
		kb_type: KnowledgeBaseType,
		chunks: &[String],
	) -> Result<Vec<String>> {
		let units: Vec<IndexWriteUnit> = chunks
			.iter()
			.enumerate()
			.filter(|(_, content)| !content.trim().is_empty())
			.map(|(position, content)| {
				let chunk_index = position as i32;
				let chunk_id = index::chunk_id(&knowledge.knowledge_id, SourceType::Chunk, chunk_index);

				IndexWriteUnit {
					content: content.clone(),
					source_type: SourceType::Chunk,
					source_id: chunk_id.clone(),
					chunk_id,
					chunk_index,
					chunk_type: ChunkType::Text,
					knowledge_id: knowledge.knowledge_id.clone(),
					knowledge_base_id: knowledge.knowledge_base_id.clone(),
					knowledge_base_type: kb_type,
					knowledge_title: knowledge.title.clone(),
					knowledge_filename: knowledge.filename.clone(),
				}
			})
			.collect();

		self.index_units(tenant_id, &units).await
	}

	/// Indexes the schema of a tabular knowledge item: one summary unit plus one unit per column.
	pub async fn index_table(
		&self,
		tenant_id: &str,
		knowledge: &KnowledgeInfo,
		kb_type: KnowledgeBaseType,
	) -> Result<Vec<String>> {
		let Some(source) = self.catalog.load_table(tenant_id, &knowledge.knowledge_id).await? else {
			return Err(Error::NotFound {
				message: format!("No table content for knowledge {}.", knowledge.knowledge_id),
			});
		};
		let table = TableData::from_csv(&source.filename, &source.content)?;
		let units = TabularEngine::schema_units(&table, knowledge, kb_type);

		self.index_units(tenant_id, &units).await
	}

	/// Creates chunk records, then writes the index. Any failure removes what this call created
	/// before the error is returned.
	pub async fn index_units(&self, tenant_id: &str, units: &[IndexWriteUnit]) -> Result<Vec<String>> {
		if units.is_empty() {
			return Ok(Vec::new());
		}

		let chunk_ids: Vec<String> = units.iter().map(|unit| unit.chunk_id.clone()).collect();
		let outcome = match self.chunks.create_chunks(tenant_id, units).await {
			Ok(()) => self.retrieval.batch_index(tenant_id, units).await,
			Err(err) => Err(err),
		};

		match outcome {
			Ok(()) => {
				tracing::info!(tenant_id, count = units.len(), "Knowledge indexed.");

				Ok(chunk_ids)
			},
			Err(err) => {
				tracing::error!(tenant_id, error = %err, "Indexing failed; removing partial writes.");

				self.compensate(tenant_id, units, &chunk_ids).await;

				Err(err)
			},
		}
	}

	async fn compensate(&self, tenant_id: &str, units: &[IndexWriteUnit], chunk_ids: &[String]) {
		let dimensions = self.cfg.providers.embedding.dimensions;
		let mut by_type: BTreeMap<&str, (KnowledgeBaseType, Vec<String>)> = BTreeMap::new();

		for unit in units {
			by_type
				.entry(unit.knowledge_base_type.as_str())
				.or_insert_with(|| (unit.knowledge_base_type, Vec::new()))
				.1
				.push(unit.source_id.clone());
		}

		for (kb_type, source_ids) in by_type.into_values() {
			match self.retrieval.delete_by_source_ids(tenant_id, &source_ids, dimensions, kb_type).await
			{
				Ok(()) => tracing::info!(
					tenant_id,
					kb_type = kb_type.as_str(),
					count = source_ids.len(),
					"Compensating index delete finished."
				),
				Err(err) => tracing::error!(
					tenant_id,
					kb_type = kb_type.as_str(),
					error = %err,
					"Compensating index delete failed."
				),
			}
		}

		match self.chunks.delete_chunks(tenant_id, chunk_ids).await {
			Ok(()) => tracing::info!(
				tenant_id,
				count = chunk_ids.len(),
				"Compensating chunk delete finished."
			),
			Err(err) =>
				tracing::error!(tenant_id, error = %err, "Compensating chunk delete failed."),
		}
	}
}
