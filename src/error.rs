//! Error types for Parley

use std::time::Duration;
use thiserror::Error;

/// Result type alias for Parley operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in Parley
#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl Error {
    pub fn invalid(message: impl Into<String>) -> Self {
        Error::InvalidInput(message.into())
    }

    pub fn not_found(what: &str, id: i64) -> Self {
        Error::NotFound(format!("{what} with id {id}"))
    }

    /// Stable category used at the request boundary.
    pub fn category(&self) -> StatusCategory {
        match self {
            Error::InvalidInput(_) => StatusCategory::InvalidInput,
            Error::NotFound(_) => StatusCategory::NotFound,
            Error::Llm(LlmError::Timeout(_)) => StatusCategory::UpstreamTimeout,
            Error::Llm(_) => StatusCategory::UpstreamUnavailable,
            Error::Database(_)
            | Error::Config(_)
            | Error::Io(_)
            | Error::Json(_)
            | Error::Http(_) => StatusCategory::Internal,
        }
    }
}

/// Failures surfaced by the LLM client.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LlmError {
    #[error("LLM API request timed out after {0:?}")]
    Timeout(Duration),

    #[error("LLM API error ({status}): {message}")]
    Upstream { status: u16, message: String },

    #[error("Invalid LLM response: {0}")]
    MalformedResponse(String),

    #[error("LLM API request failed: {0}")]
    Transport(String),
}

/// Outcome class a caller can act on.
///
/// Keeps "your input was rejected" apart from "the assistant is unavailable".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCategory {
    InvalidInput,
    NotFound,
    UpstreamUnavailable,
    UpstreamTimeout,
    Internal,
}

impl StatusCategory {
    /// HTTP status code for this category.
    pub fn http_status(self) -> u16 {
        match self {
            StatusCategory::InvalidInput => 422,
            StatusCategory::NotFound => 404,
            StatusCategory::UpstreamUnavailable => 502,
            StatusCategory::UpstreamTimeout => 504,
            StatusCategory::Internal => 500,
        }
    }

    /// Machine-readable error code.
    pub fn code(self) -> &'static str {
        match self {
            StatusCategory::InvalidInput => "VALIDATION_ERROR",
            StatusCategory::NotFound => "NOT_FOUND",
            StatusCategory::UpstreamUnavailable => "UPSTREAM_UNAVAILABLE",
            StatusCategory::UpstreamTimeout => "UPSTREAM_TIMEOUT",
            StatusCategory::Internal => "INTERNAL_ERROR",
        }
    }
}
