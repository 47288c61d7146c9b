//! Error types shared by every cache tier and data source.

use serde::Serialize;
use thiserror::Error;

/// Failure of a producer or of a raw HTTP fetch.
///
/// `Clone` because one in-flight result is handed to every deduplicated
/// caller waiting on the same key.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("Not configured: {0}")]
    Configuration(String),

    #[error("Network unavailable: {0}")]
    NetworkUnavailable(String),

    #[error("Upstream error (status {status}): {message}")]
    Upstream { status: u16, message: String },

    #[error("Rate limited - please wait before retrying")]
    RateLimited,

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Coarse classification used for the terminal error shown to a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FetchErrorKind {
    NotConfigured,
    TemporarilyUnreachable,
    Upstream,
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

impl FetchError {
    /// Truncate a response body to avoid logging excessive data
    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            body.to_string()
        } else {
            let mut end = MAX_ERROR_BODY_LENGTH;
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            format!(
                "{}... (truncated, {} total bytes)",
                &body[..end],
                body.len()
            )
        }
    }

    pub fn from_status(status: u16, body: &str) -> Self {
        match status {
            429 => FetchError::RateLimited,
            _ => FetchError::Upstream {
                status,
                message: Self::truncate_body(body),
            },
        }
    }

    pub fn is_network_unavailable(&self) -> bool {
        matches!(self, FetchError::NetworkUnavailable(_))
    }

    pub fn kind(&self) -> FetchErrorKind {
        match self {
            FetchError::Configuration(_) => FetchErrorKind::NotConfigured,
            FetchError::NetworkUnavailable(_) => FetchErrorKind::TemporarilyUnreachable,
            _ => FetchErrorKind::Upstream,
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() || err.is_timeout() || err.is_request() {
            FetchError::NetworkUnavailable(err.to_string())
        } else if err.is_decode() || err.is_body() {
            FetchError::InvalidResponse(err.to_string())
        } else if let Some(status) = err.status() {
            FetchError::from_status(status.as_u16(), &err.to_string())
        } else {
            FetchError::NetworkUnavailable(err.to_string())
        }
    }
}

impl From<serde_json::Error> for FetchError {
    fn from(err: serde_json::Error) -> Self {
        FetchError::InvalidResponse(err.to_string())
    }
}

/// Failure of the durable fallback tier. Never fatal to a read.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Storage quota exceeded writing {namespace}/{id}: need {needed} bytes, quota {quota}")]
    QuotaExceeded {
        namespace: String,
        id: String,
        needed: u64,
        quota: u64,
    },

    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type FetchResult<T> = std::result::Result<T, FetchError>;
