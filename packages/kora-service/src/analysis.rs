use std::collections::HashSet;

use regex::Regex;
use rusqlite::{
	Connection,
	types::{Value as SqlValue, ValueRef},
};
use serde_json::{Map, Value};

use kora_config::LlmProviderConfig;
use kora_domain::{
	chat::{ChatMessage, ChatOptions},
	index::{self, IndexWriteUnit, SourceType},
	search::{ChunkType, KnowledgeBaseType},
};

use crate::{ChatModel, Error, Result, catalog::KnowledgeInfo, pipeline::stages::strip_code_fence};

pub const DEFAULT_MAX_ROWS: usize = 200;

const SQL_PROMPT: &str = "You write one read-only SQLite query that answers the question about \
	the table below. Use only that table. Reply with the SQL statement only.";

const READ_ONLY_PREFIXES: [&str; 3] = ["select", "with", "explain"];
const FORBIDDEN_KEYWORDS: &str = concat!(
	r"(?i)\b(insert|update|delete|drop|create|alter|attach|detach|vacuum|reindex|pragma",
	r"|load_extension)\b",
);
const TABLE_REFERENCE: &str = r#"(?i)\b(?:from|join)\s+"?([A-Za-z_][A-Za-z0-9_]*)"?"#;
const CTE_NAME: &str = r"(?i)(?:\bwith|,)\s*([A-Za-z_][A-Za-z0-9_]*)\s+as\s*\(";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ColumnType {
	Integer,
	Real,
	Text,
}
impl ColumnType {
	pub fn as_sql(self) -> &'static str {
		match self {
			Self::Integer => "INTEGER",
			Self::Real => "REAL",
			Self::Text => "TEXT",
		}
	}

	fn parse_cell(self, cell: &str) -> SqlValue {
		let cell = cell.trim();

		if cell.is_empty() {
			return SqlValue::Null;
		}

		match self {
			Self::Integer => cell.parse().map(SqlValue::Integer).unwrap_or(SqlValue::Null),
			Self::Real => cell.parse().map(SqlValue::Real).unwrap_or(SqlValue::Null),
			Self::Text => SqlValue::Text(cell.to_string()),
		}
	}
}

/// A parsed CSV document, ready to load into a scratch database.
#[derive(Clone, Debug, PartialEq)]
pub struct TableData {
	pub name: String,
	pub columns: Vec<String>,
	pub rows: Vec<Vec<String>>,
}
impl TableData {
	/// The first record is the header. Short rows are padded and long rows truncated.
	pub fn from_csv(filename: &str, text: &str) -> Result<Self> {
		let mut records = parse_csv(text).into_iter();
		let header = records.next().ok_or_else(|| Error::Analysis {
			message: format!("{filename} has no header row."),
		})?;
		let columns = column_names(&header);
		let rows = records
			.filter(|record| record.iter().any(|cell| !cell.trim().is_empty()))
			.map(|mut record| {
				record.resize(columns.len(), String::new());

				record
			})
			.collect();

		Ok(Self { name: table_name(filename), columns, rows })
	}

	pub fn column_types(&self) -> Vec<ColumnType> {
		(0..self.columns.len())
			.map(|index| {
				let cells = self
					.rows
					.iter()
					.map(|row| row[index].trim())
					.filter(|cell| !cell.is_empty());
				let mut kind = ColumnType::Integer;

				for cell in cells {
					if kind == ColumnType::Integer && cell.parse::<i64>().is_err() {
						kind = ColumnType::Real;
					}
					if kind == ColumnType::Real && cell.parse::<f64>().is_err() {
						return ColumnType::Text;
					}
				}

				kind
			})
			.collect()
	}

	/// Table name, typed columns, and a few sample rows, for prompting.
	pub fn describe(&self, sample_rows: usize) -> String {
		let columns: Vec<String> = self
			.columns
			.iter()
			.zip(self.column_types())
			.map(|(column, kind)| format!("{column} {}", kind.as_sql()))
			.collect();
		let mut description =
			format!("Table {} ({} rows): {}", self.name, self.rows.len(), columns.join(", "));

		for row in self.rows.iter().take(sample_rows) {
			description.push('\n');
			description.push_str(&row.join(" | "));
		}

		description
	}
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct QueryOutput {
	pub columns: Vec<String>,
	pub records: Vec<Map<String, Value>>,
	pub truncated: bool,
}
impl QueryOutput {
	/// One `record N: {json}` line per row.
	pub fn render(&self) -> String {
		let mut lines: Vec<String> = self
			.records
			.iter()
			.enumerate()
			.map(|(index, record)| format!("record {}: {}", index + 1, Value::Object(record.clone())))
			.collect();

		if self.truncated {
			lines.push(format!("(showing the first {} rows)", self.records.len()));
		}

		lines.join("\n")
	}
}

/// Runs validated read-only SQL over one table in a throwaway in-memory SQLite database.
#[derive(Clone, Debug)]
pub struct TabularEngine {
	max_rows: usize,
}
impl TabularEngine {
	pub fn new(max_rows: usize) -> Self {
		Self { max_rows: max_rows.max(1) }
	}

	pub async fn query(&self, table: TableData, sql: &str) -> Result<QueryOutput> {
		let sql = validate_sql(&table.name, sql)?;
		let max_rows = self.max_rows;

		tokio::task::spawn_blocking(move || run_query(&table, &sql, max_rows))
			.await
			.map_err(|err| Error::Internal { message: format!("Analysis task failed: {err}.") })?
	}

	/// Asks the model for one statement over `table` and runs it.
	pub async fn ask(
		&self,
		chat: &dyn ChatModel,
		chat_cfg: &LlmProviderConfig,
		table: TableData,
		question: &str,
	) -> Result<(String, QueryOutput)> {
		let messages = vec![
			ChatMessage::system(SQL_PROMPT),
			ChatMessage::user(format!("{}\n\nQuestion: {question}", table.describe(3))),
		];
		let opts = ChatOptions { temperature: Some(0.1), thinking: Some(false), ..Default::default() };
		let response = chat.chat(chat_cfg, &messages, &opts).await?;
		let sql = strip_code_fence(&response.content).to_string();

		tracing::debug!(table = %table.name, sql = %sql, "Analysis SQL generated.");

		let output = self.query(table, &sql).await?;

		Ok((sql, output))
	}

	/// One table summary plus one unit per column, so schema questions can be retrieved.
	pub fn schema_units(
		table: &TableData,
		knowledge: &KnowledgeInfo,
		kb_type: KnowledgeBaseType,
	) -> Vec<IndexWriteUnit> {
		let types = table.column_types();
		let unit = |chunk_index: i32, chunk_type: ChunkType, content: String| {
			let chunk_id = index::chunk_id(&knowledge.knowledge_id, SourceType::TableSchema, chunk_index);

			IndexWriteUnit {
				content,
				source_type: SourceType::TableSchema,
				source_id: chunk_id.clone(),
				chunk_id,
				chunk_index,
				chunk_type,
				knowledge_id: knowledge.knowledge_id.clone(),
				knowledge_base_id: knowledge.knowledge_base_id.clone(),
				knowledge_base_type: kb_type,
				knowledge_title: knowledge.title.clone(),
				knowledge_filename: knowledge.filename.clone(),
			}
		};
		let mut units = vec![unit(0, ChunkType::TableSummary, table.describe(3))];

		for (offset, (column, kind)) in table.columns.iter().zip(types).enumerate() {
			let samples: Vec<&str> = table
				.rows
				.iter()
				.map(|row| row[offset].trim())
				.filter(|cell| !cell.is_empty())
				.take(5)
				.collect();
			let content = format!(
				"Column {column} of table {} in {}: type {}, sample values: {}",
				table.name,
				knowledge.filename,
				kind.as_sql(),
				samples.join(", ")
			);

			units.push(unit(offset as i32 + 1, ChunkType::TableColumn, content));
		}

		units
	}
}
impl Default for TabularEngine {
	fn default() -> Self {
		Self::new(DEFAULT_MAX_ROWS)
	}
}

/// Accepts a single read-only statement that only reads `table_name` or its own CTEs.
pub fn validate_sql(table_name: &str, sql: &str) -> Result<String> {
	let statement = sql.trim().trim_end_matches(';').trim();
	let reject = |message: &str| Error::Analysis { message: message.to_string() };

	if statement.is_empty() {
		return Err(reject("The query is empty."));
	}
	if statement.contains(';') {
		return Err(reject("Only one statement is allowed."));
	}

	let lowered = statement.to_lowercase();

	if !READ_ONLY_PREFIXES.iter().any(|prefix| lowered.starts_with(prefix)) {
		return Err(reject("Only read-only queries are allowed."));
	}
	if compile(FORBIDDEN_KEYWORDS)?.is_match(statement) {
		return Err(reject("The query uses a forbidden keyword."));
	}

	let ctes: HashSet<String> = compile(CTE_NAME)?
		.captures_iter(statement)
		.filter_map(|captures| captures.get(1))
		.map(|name| name.as_str().to_lowercase())
		.collect();

	for captures in compile(TABLE_REFERENCE)?.captures_iter(statement) {
		let Some(name) = captures.get(1) else {
			continue;
		};
		let name = name.as_str().to_lowercase();

		if name != table_name.to_lowercase() && !ctes.contains(&name) {
			return Err(Error::Analysis { message: format!("Table {name} is not available.") });
		}
	}

	Ok(statement.to_string())
}

/// Minimal RFC 4180 reader: quoted fields, doubled quotes, and CRLF line endings.
pub fn parse_csv(text: &str) -> Vec<Vec<String>> {
	let mut records = Vec::new();
	let mut record = Vec::new();
	let mut field = String::new();
	let mut in_quotes = false;
	let mut chars = text.trim_start_matches('\u{feff}').chars().peekable();

	while let Some(c) = chars.next() {
		match (c, in_quotes) {
			('"', true) if chars.peek() == Some(&'"') => {
				field.push('"');
				chars.next();
			},
			('"', true) => in_quotes = false,
			('"', false) if field.is_empty() => in_quotes = true,
			(',', false) => record.push(std::mem::take(&mut field)),
			('\r', false) => {},
			('\n', false) => {
				record.push(std::mem::take(&mut field));
				records.push(std::mem::take(&mut record));
			},
			(c, _) => field.push(c),
		}
	}

	if !field.is_empty() || !record.is_empty() {
		record.push(field);
		records.push(record);
	}

	records
}

fn compile(pattern: &str) -> Result<Regex> {
	Regex::new(pattern).map_err(|err| Error::Internal { message: err.to_string() })
}

fn table_name(filename: &str) -> String {
	let stem = filename.rsplit_once('.').map_or(filename, |(stem, _)| stem);
	let mut name: String = stem
		.chars()
		.map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
		.collect();

	name = name.trim_matches('_').to_string();

	if name.is_empty() {
		return "data".to_string();
	}
	if name.starts_with(|c: char| c.is_ascii_digit()) {
		name.insert_str(0, "t_");
	}

	name
}

fn column_names(header: &[String]) -> Vec<String> {
	let mut seen = HashSet::new();

	header
		.iter()
		.enumerate()
		.map(|(index, raw)| {
			let base = match raw.trim() {
				"" => format!("column_{}", index + 1),
				trimmed => trimmed.to_string(),
			};
			let mut name = base.clone();
			let mut suffix = 2;

			while !seen.insert(name.to_lowercase()) {
				name = format!("{base}_{suffix}");
				suffix += 1;
			}

			name
		})
		.collect()
}

fn quote_identifier(identifier: &str) -> String {
	format!("\"{}\"", identifier.replace('"', "\"\""))
}

fn run_query(table: &TableData, sql: &str, max_rows: usize) -> Result<QueryOutput> {
	let conn = Connection::open_in_memory()?;

	load_table(&conn, table)?;
	conn.execute_batch("PRAGMA query_only = ON;")?;

	let mut statement = conn.prepare(sql)?;
	let columns: Vec<String> = statement.column_names().into_iter().map(String::from).collect();
	let mut rows = statement.query([])?;
	let mut output = QueryOutput { columns, ..Default::default() };

	while let Some(row) = rows.next()? {
		if output.records.len() == max_rows {
			output.truncated = true;

			break;
		}

		let mut record = Map::new();

		for (index, column) in output.columns.iter().enumerate() {
			record.insert(column.clone(), to_json(row.get_ref(index)?));
		}

		output.records.push(record);
	}

	Ok(output)
}

fn load_table(conn: &Connection, table: &TableData) -> Result<()> {
	let types = table.column_types();
	let definitions: Vec<String> = table
		.columns
		.iter()
		.zip(&types)
		.map(|(column, kind)| format!("{} {}", quote_identifier(column), kind.as_sql()))
		.collect();
	let placeholders: Vec<String> = (1..=table.columns.len()).map(|i| format!("?{i}")).collect();

	conn.execute_batch(&format!(
		"CREATE TABLE {} ({});",
		quote_identifier(&table.name),
		definitions.join(", ")
	))?;

	let tx = conn.unchecked_transaction()?;

	{
		let mut insert = tx.prepare(&format!(
			"INSERT INTO {} VALUES ({})",
			quote_identifier(&table.name),
			placeholders.join(", ")
		))?;

		for row in &table.rows {
			let values = row.iter().zip(&types).map(|(cell, kind)| kind.parse_cell(cell));

			insert.execute(rusqlite::params_from_iter(values))?;
		}
	}

	tx.commit()?;

	Ok(())
}

fn to_json(value: ValueRef<'_>) -> Value {
	match value {
		ValueRef::Null => Value::Null,
		ValueRef::Integer(number) => Value::from(number),
		ValueRef::Real(number) =>
			serde_json::Number::from_f64(number).map(Value::Number).unwrap_or(Value::Null),
		ValueRef::Text(bytes) => Value::from(String::from_utf8_lossy(bytes).into_owned()),
		ValueRef::Blob(bytes) => Value::from(format!("<{} bytes>", bytes.len())),
	}
}
