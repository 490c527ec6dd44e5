use datafusion::{arrow::error::ArrowError, error::DataFusionError};
use reqwest::StatusCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("DataFusion: {0}")]
    DataFusion(#[from] DataFusionError),

    #[error("Arrow: {0}")]
    Arrow(#[from] ArrowError),

    #[error("API request failed: {0}")]
    ApiFailure(#[from] reqwest::Error),

    #[error("Failed to parse URL: {0}")]
    UrlParsingFailed(#[from] url::ParseError),

    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Missing credential: environment variable {variable} is not set")]
    MissingCredential { variable: &'static str },

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("API {url} responded with status {status}")]
    UnexpectedStatus { url: String, status: StatusCode },

    #[error("No staged batch found at '{location}'")]
    StagingBatchNotFound { location: String },

    #[error("Schema mismatch for table {table}: {detail}")]
    SchemaMismatch { table: String, detail: String },

    #[error("{message}")]
    NoData { message: String },
}
