use std::time::Duration;

use color_eyre::Result;
use reqwest::Client;
use serde_json::Value;

/// Calls an external tool service with the model-produced arguments and returns its output
/// as text.
pub async fn invoke(cfg: &kora_config::ExternalTool, arguments: &Value) -> Result<String> {
	let client = Client::builder().timeout(Duration::from_millis(cfg.timeout_ms)).build()?;
	let res = client.post(&cfg.url).json(arguments).send().await?.error_for_status()?;
	let raw = res.text().await?;

	Ok(extract_output(&raw))
}

fn extract_output(raw: &str) -> String {
	let Ok(json) = serde_json::from_str::<Value>(raw) else {
		return raw.to_string();
	};

	for key in ["output", "result", "content"] {
		match json.get(key) {
			Some(Value::String(text)) => return text.clone(),
			Some(other) if !other.is_null() => return other.to_string(),
			_ => {},
		}
	}

	json.to_string()
}
