use kora_config::RetrievalDriver;

use crate::pipeline::StageErrorKind;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error("Invalid request: {message}")]
	InvalidRequest { message: String },
	#[error("Not found: {message}")]
	NotFound { message: String },
	#[error("Provider error: {message}")]
	Provider { message: String },
	#[error("Storage error: {message}")]
	Storage { message: String },
	#[error("Qdrant error: {message}")]
	Qdrant { message: String },
	#[error("Retrieval backend {driver} failed: {message}")]
	Backend { driver: RetrievalDriver, message: String },
	#[error("Data analysis failed: {message}")]
	Analysis { message: String },
	#[error("Pipeline stage {kind} failed: {description}")]
	Pipeline { kind: StageErrorKind, description: String },
	#[error("Request was cancelled.")]
	Cancelled,
	#[error("Internal error: {message}")]
	Internal { message: String },
}
impl Error {
	pub(crate) fn backend(driver: RetrievalDriver, err: impl std::fmt::Display) -> Self {
		Self::Backend { driver, message: err.to_string() }
	}
}
impl From<sqlx::Error> for Error {
	fn from(err: sqlx::Error) -> Self {
		Self::Storage { message: err.to_string() }
	}
}
impl From<kora_storage::Error> for Error {
	fn from(err: kora_storage::Error) -> Self {
		match err {
			kora_storage::Error::Sqlx(inner) => Self::Storage { message: inner.to_string() },
			kora_storage::Error::InvalidArgument(message) => Self::InvalidRequest { message },
			kora_storage::Error::Qdrant(inner) => Self::Qdrant { message: inner.to_string() },
		}
	}
}
impl From<color_eyre::Report> for Error {
	fn from(err: color_eyre::Report) -> Self {
		Self::Provider { message: err.to_string() }
	}
}
impl From<rusqlite::Error> for Error {
	fn from(err: rusqlite::Error) -> Self {
		Self::Analysis { message: err.to_string() }
	}
}
impl From<serde_json::Error> for Error {
	fn from(err: serde_json::Error) -> Self {
		Self::Internal { message: err.to_string() }
	}
}
