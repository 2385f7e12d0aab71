pub const DENSE_VECTOR_NAME: &str = "dense";
pub const BM25_VECTOR_NAME: &str = "bm25";
pub const BM25_MODEL: &str = "qdrant/bm25";

use std::collections::HashMap;

use qdrant_client::{
	Payload,
	qdrant::{
		Condition, CreateCollectionBuilder, DeletePointsBuilder, Distance, Document, Filter,
		Modifier, PointStruct, Query, QueryPointsBuilder, ScoredPoint, SparseVectorParamsBuilder,
		SparseVectorsConfigBuilder, UpsertPointsBuilder, Value, Vector, VectorParamsBuilder,
		VectorsConfigBuilder, value::Kind,
	},
};

use kora_domain::{
	index::EmbeddedUnit,
	search::{KnowledgeBaseType, RetrievalMode, SearchTarget},
};

use crate::{
	Result,
	models::{self, ChunkHit},
};

pub struct QdrantStore {
	pub client: qdrant_client::Qdrant,
	pub collection: String,
	pub vector_dim: u32,
}
impl QdrantStore {
	pub fn new(cfg: &kora_config::Qdrant) -> Result<Self> {
		let client = qdrant_client::Qdrant::from_url(&cfg.url).build()?;

		Ok(Self { client, collection: cfg.collection.clone(), vector_dim: cfg.vector_dim })
	}

	/// Creates the collection with dense and BM25 vectors when it is missing.
	pub async fn ensure_collection(&self) -> Result<()> {
		if self.client.collection_exists(&self.collection).await? {
			return Ok(());
		}

		let mut vectors = VectorsConfigBuilder::default();

		vectors.add_named_vector_params(
			DENSE_VECTOR_NAME,
			VectorParamsBuilder::new(self.vector_dim as u64, Distance::Cosine),
		);

		let mut sparse = SparseVectorsConfigBuilder::default();

		sparse.add_named_vector_params(
			BM25_VECTOR_NAME,
			SparseVectorParamsBuilder::default().modifier(Modifier::Idf),
		);

		self.client
			.create_collection(
				CreateCollectionBuilder::new(self.collection.clone())
					.vectors_config(vectors)
					.sparse_vectors_config(sparse),
			)
			.await?;

		tracing::info!(collection = %self.collection, "Qdrant collection created.");

		Ok(())
	}

	pub async fn upsert_units(&self, tenant_id: &str, units: &[EmbeddedUnit]) -> Result<()> {
		if units.is_empty() {
			return Ok(());
		}

		let mut points = Vec::with_capacity(units.len());

		for embedded in units {
			let unit = &embedded.unit;
			let mut payload_map = HashMap::new();

			payload_map.insert("tenant_id".to_string(), Value::from(tenant_id.to_string()));
			payload_map.insert("chunk_id".to_string(), Value::from(unit.chunk_id.clone()));
			payload_map.insert("source_id".to_string(), Value::from(unit.source_id.clone()));
			payload_map
				.insert("source_type".to_string(), Value::from(unit.source_type.as_str().to_string()));
			payload_map.insert("knowledge_id".to_string(), Value::from(unit.knowledge_id.clone()));
			payload_map
				.insert("knowledge_base_id".to_string(), Value::from(unit.knowledge_base_id.clone()));
			payload_map.insert(
				"knowledge_base_type".to_string(),
				Value::from(unit.knowledge_base_type.as_str().to_string()),
			);
			payload_map
				.insert("knowledge_title".to_string(), Value::from(unit.knowledge_title.clone()));
			payload_map.insert(
				"knowledge_filename".to_string(),
				Value::from(unit.knowledge_filename.clone()),
			);
			payload_map.insert("chunk_index".to_string(), Value::from(unit.chunk_index as i64));
			payload_map
				.insert("chunk_type".to_string(), Value::from(unit.chunk_type.as_str().to_string()));
			payload_map.insert("content".to_string(), Value::from(unit.content.clone()));
			payload_map.insert("content_hash".to_string(), Value::from(unit.content_hash()));
			payload_map
				.insert("embedding_dim".to_string(), Value::from(embedded.embedding.len() as i64));

			let mut vector_map = HashMap::new();

			vector_map.insert(DENSE_VECTOR_NAME.to_string(), Vector::from(embedded.embedding.clone()));
			vector_map.insert(
				BM25_VECTOR_NAME.to_string(),
				Vector::from(Document::new(unit.content.clone(), BM25_MODEL)),
			);

			points.push(PointStruct::new(unit.chunk_id.clone(), vector_map, Payload::from(payload_map)));
		}

		let upsert = UpsertPointsBuilder::new(self.collection.clone(), points).wait(true);

		self.client.upsert_points(upsert).await?;

		Ok(())
	}

	/// Missing points are not an error.
	pub async fn delete_by_source_ids(
		&self,
		tenant_id: &str,
		source_ids: &[String],
		embedding_dim: u32,
		kb_type: KnowledgeBaseType,
	) -> Result<()> {
		if source_ids.is_empty() || embedding_dim != self.vector_dim {
			return Ok(());
		}

		let filter = Filter::must([
			Condition::matches("tenant_id", tenant_id.to_string()),
			Condition::matches("source_id", source_ids.to_vec()),
			Condition::matches("knowledge_base_type", kb_type.as_str().to_string()),
		]);
		let delete = DeletePointsBuilder::new(self.collection.clone()).points(filter).wait(true);

		match self.client.delete_points(delete).await {
			Ok(_) => {},
			Err(err) =>
				if is_not_found_error(&err) {
					tracing::info!(
						collection = %self.collection,
						count = source_ids.len(),
						"Qdrant points missing during delete."
					);
				} else {
					return Err(err.into());
				},
		}

		Ok(())
	}

	pub async fn search(
		&self,
		tenant_id: &str,
		target: &SearchTarget,
		mode: RetrievalMode,
		query: &str,
		embedding: Option<&[f32]>,
		threshold: f32,
		top_k: u32,
	) -> Result<Vec<ChunkHit>> {
		let filter = target_filter(tenant_id, target);
		let search = match mode {
			RetrievalMode::Vector => {
				let Some(embedding) = embedding else {
					return Err(crate::Error::InvalidArgument(
						"Vector search requires a query embedding.".to_string(),
					));
				};

				QueryPointsBuilder::new(self.collection.clone())
					.query(Query::new_nearest(embedding.to_vec()))
					.using(DENSE_VECTOR_NAME)
					.score_threshold(threshold)
			},
			RetrievalMode::Keyword => QueryPointsBuilder::new(self.collection.clone())
				.query(Query::new_nearest(Document::new(query.to_string(), BM25_MODEL)))
				.using(BM25_VECTOR_NAME),
		};
		let search = search.filter(filter).with_payload(true).limit(top_k as u64);
		let response = self.client.query(search).await?;
		let hits = response
			.result
			.iter()
			.filter_map(|point| hit_from_point(point, mode))
			.filter(|hit| hit.score >= threshold)
			.collect();

		Ok(hits)
	}
}

fn target_filter(tenant_id: &str, target: &SearchTarget) -> Filter {
	let mut conditions = vec![
		Condition::matches("tenant_id", tenant_id.to_string()),
		Condition::matches("knowledge_base_id", target.knowledge_base_id().to_string()),
	];

	if !target.is_full_scope() {
		conditions.push(Condition::matches("knowledge_id", target.knowledge_ids().to_vec()));
	}

	Filter::must(conditions)
}

fn hit_from_point(point: &ScoredPoint, mode: RetrievalMode) -> Option<ChunkHit> {
	let payload = &point.payload;
	let score = match mode {
		RetrievalMode::Vector => point.score,
		RetrievalMode::Keyword => models::squash_score(point.score),
	};

	Some(ChunkHit {
		chunk_id: payload_str(payload, "chunk_id")?,
		knowledge_id: payload_str(payload, "knowledge_id")?,
		knowledge_base_id: payload_str(payload, "knowledge_base_id")?,
		knowledge_title: payload_str(payload, "knowledge_title").unwrap_or_default(),
		knowledge_filename: payload_str(payload, "knowledge_filename").unwrap_or_default(),
		chunk_index: payload_i32(payload, "chunk_index").unwrap_or_default(),
		chunk_type: payload_str(payload, "chunk_type").unwrap_or_default(),
		content: payload_str(payload, "content").unwrap_or_default(),
		score,
	})
}

fn payload_str(payload: &HashMap<String, Value>, key: &str) -> Option<String> {
	match &payload.get(key)?.kind {
		Some(Kind::StringValue(text)) => Some(text.clone()),
		_ => None,
	}
}

fn payload_i32(payload: &HashMap<String, Value>, key: &str) -> Option<i32> {
	match &payload.get(key)?.kind {
		Some(Kind::IntegerValue(value)) => i32::try_from(*value).ok(),
		Some(Kind::DoubleValue(value)) if value.fract() == 0.0 => i32::try_from(*value as i64).ok(),
		_ => None,
	}
}

fn is_not_found_error(err: &qdrant_client::QdrantError) -> bool {
	let message = err.to_string().to_lowercase();
	let point_not_found =
		(message.contains("not found") || message.contains("404")) && message.contains("point");
	let no_point_found = message.contains("no point") && message.contains("found");

	point_not_found || no_point_found
}
