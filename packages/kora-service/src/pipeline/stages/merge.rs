use kora_domain::search::{ChunkType, MatchType, SearchResult};

use crate::{
	BoxFuture,
	pipeline::{ChatManage, EventType, Next, Plugin, PluginResult},
};

pub struct ChunkMerge;
impl Plugin for ChunkMerge {
	fn name(&self) -> &'static str {
		"chunk_merge"
	}

	fn activation_events(&self) -> &'static [EventType] {
		&[EventType::ChunkMerge]
	}

	fn on_event<'a>(
		&'a self,
		_event: EventType,
		state: &'a mut ChatManage,
		next: Next<'a>,
	) -> BoxFuture<'a, PluginResult> {
		Box::pin(async move {
			let source =
				if state.rerank_result.is_empty() { &state.search_result } else { &state.rerank_result };
			let merged = merge_adjacent(source);

			tracing::debug!(
				session_id = %state.session_id,
				before = source.len(),
				after = merged.len(),
				"Adjacent chunks merged."
			);

			state.merge_result = merged;

			next.run(state).await
		})
	}
}

/// Joins hits on consecutive chunks of the same knowledge item into one passage scored by its
/// best chunk. Web, analysis, and table hits pass through untouched. Output is ordered by score.
pub fn merge_adjacent(results: &[SearchResult]) -> Vec<SearchResult> {
	let mut groups: Vec<(String, Vec<SearchResult>)> = Vec::new();
	let mut passthrough = Vec::new();

	for result in results {
		if !is_mergeable(result) {
			passthrough.push(result.clone());

			continue;
		}

		match groups.iter_mut().find(|(knowledge_id, _)| *knowledge_id == result.knowledge_id) {
			Some((_, members)) => members.push(result.clone()),
			None => groups.push((result.knowledge_id.clone(), vec![result.clone()])),
		}
	}

	let mut merged = Vec::with_capacity(results.len());

	for (_, mut members) in groups {
		members.sort_by_key(|member| member.chunk_index);

		let mut current: Option<SearchResult> = None;
		let mut last_index = 0;

		for member in members {
			if let Some(passage) = current.as_mut()
				&& member.chunk_index <= last_index + 1
			{
				if member.chunk_index == last_index + 1 {
					passage.content.push('\n');
					passage.content.push_str(&member.content);

					last_index = member.chunk_index;
				}

				passage.score = passage.score.max(member.score);

				continue;
			}

			last_index = member.chunk_index;

			if let Some(done) = current.replace(member) {
				merged.push(done);
			}
		}

		merged.extend(current);
	}

	merged.extend(passthrough);
	// Stable, so equal scores keep first-seen order.
	merged.sort_by(|a, b| b.score.total_cmp(&a.score));

	merged
}

fn is_mergeable(result: &SearchResult) -> bool {
	matches!(result.match_type, MatchType::Keyword | MatchType::Vector | MatchType::Graph)
		&& matches!(result.chunk_type, ChunkType::Text | ChunkType::Summary)
}

#[cfg(test)]
mod tests {
	use super::*;

	fn hit(knowledge_id: &str, chunk_index: i32, score: f32, match_type: MatchType) -> SearchResult {
		SearchResult {
			id: format!("{knowledge_id}-{chunk_index}"),
			content: format!("{knowledge_id} part {chunk_index}"),
			knowledge_id: knowledge_id.to_string(),
			knowledge_base_id: "kb".to_string(),
			chunk_id: format!("{knowledge_id}-{chunk_index}"),
			chunk_index,
			knowledge_title: knowledge_id.to_string(),
			knowledge_filename: format!("{knowledge_id}.md"),
			chunk_type: ChunkType::Text,
			match_type,
			score,
		}
	}

	#[test]
	fn consecutive_chunks_become_one_passage() {
		let merged = merge_adjacent(&[
			hit("k1", 2, 0.4, MatchType::Vector),
			hit("k1", 1, 0.9, MatchType::Keyword),
			hit("k1", 5, 0.6, MatchType::Vector),
			hit("k2", 0, 0.7, MatchType::Vector),
		]);

		assert_eq!(merged.len(), 3);
		assert_eq!(merged[0].content, "k1 part 1\nk1 part 2");
		assert!((merged[0].score - 0.9).abs() < f32::EPSILON);
		assert_eq!(merged[1].knowledge_id, "k2");
		assert_eq!(merged[2].chunk_index, 5);
	}

	#[test]
	fn web_hits_pass_through() {
		let merged = merge_adjacent(&[
			hit("https://a.example", 0, 0.5, MatchType::WebSearch),
			hit("https://a.example", 1, 0.4, MatchType::WebSearch),
		]);

		assert_eq!(merged.len(), 2);
	}
}
