use std::time::Duration;

use color_eyre::{Result, eyre};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct WebSearchHit {
	pub title: String,
	pub url: String,
	pub snippet: String,
}

pub async fn search(
	cfg: &kora_config::ProviderConfig,
	query: &str,
	max_results: u32,
) -> Result<Vec<WebSearchHit>> {
	let client = Client::builder().timeout(Duration::from_millis(cfg.timeout_ms)).build()?;
	let url = format!("{}{}", cfg.api_base, cfg.path);
	let body = serde_json::json!({ "query": query, "max_results": max_results });
	let res = client
		.post(url)
		.headers(crate::auth_headers(&cfg.api_key, &cfg.default_headers)?)
		.json(&body)
		.send()
		.await?;
	let json: Value = res.error_for_status()?.json().await?;
	let mut hits = parse_search_response(json)?;

	hits.truncate(max_results as usize);

	Ok(hits)
}

fn parse_search_response(json: Value) -> Result<Vec<WebSearchHit>> {
	let results = json
		.get("results")
		.and_then(|v| v.as_array())
		.ok_or_else(|| eyre::eyre!("Web search response is missing results array."))?;

	Ok(results
		.iter()
		.filter_map(|item| {
			let url = item.get("url").and_then(|v| v.as_str())?;
			let title = item.get("title").and_then(|v| v.as_str()).unwrap_or(url);
			let snippet = item
				.get("content")
				.or_else(|| item.get("snippet"))
				.and_then(|v| v.as_str())
				.unwrap_or_default();

			Some(WebSearchHit {
				title: title.to_string(),
				url: url.to_string(),
				snippet: snippet.to_string(),
			})
		})
		.collect())
}
