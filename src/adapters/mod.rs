//! Adapters module — how results leave the crate.
//!
//! - **CLI** — interactive chat over one conversation ([`cli::ChatRepl`])
//! - **Envelope** — [`ApiResponse`], the `{success, data, error}` shape used
//!   for machine-readable output

pub mod cli;

use serde::Serialize;

use crate::error::{Error, StatusCategory};

/// Error half of the envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorDetail {
    pub code: &'static str,
    pub message: String,
}

/// Uniform response envelope.
///
/// Exactly one of `data` and `error` is set.
#[derive(Debug, Clone, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<ErrorDetail>,
    #[serde(skip)]
    status: u16,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            status: 200,
        }
    }

    pub fn fail(err: &Error) -> Self {
        let category = err.category();
        Self {
            success: false,
            data: None,
            error: Some(ErrorDetail {
                code: category.code(),
                message: err.to_string(),
            }),
            status: category.http_status(),
        }
    }

    /// HTTP status a web front end would answer with.
    pub fn http_status(&self) -> u16 {
        self.status
    }

    pub fn to_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

impl<T: Serialize> From<crate::Result<T>> for ApiResponse<T> {
    fn from(result: crate::Result<T>) -> Self {
        match result {
            Ok(data) => Self::ok(data),
            Err(err) => Self::fail(&err),
        }
    }
}

impl StatusCategory {
    /// True when the caller's request, not the system, was at fault.
    pub fn is_client_error(self) -> bool {
        matches!(self, StatusCategory::InvalidInput | StatusCategory::NotFound)
    }
}
