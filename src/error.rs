use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum LyoError {
    #[error("invalid application number: {0}")]
    InvalidApplicationNumber(String),

    #[error("invalid SPL set id: {0}")]
    InvalidSetId(String),

    #[error("invalid date: {0}")]
    InvalidDate(String),

    #[error("config file not found at {0}")]
    MissingConfig(PathBuf),

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("HTTP client setup failed: {0}")]
    HttpSetup(String),

    #[error("network failure for {url}: {message}")]
    TransientNetwork { url: String, message: String },

    #[error("{url} returned status {status}: {body}")]
    HttpStatus {
        url: String,
        status: u16,
        body: String,
    },

    #[error("failed to parse {context}: {message}")]
    Parse { context: String, message: String },

    #[error("unexpected archive layout: {0}")]
    ArchiveLayout(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("store unreachable: {0}")]
    StoreConnectivity(String),

    #[error("store operation failed: {0}")]
    Store(String),
}

impl LyoError {
    pub fn parse(context: impl Into<String>, message: impl ToString) -> Self {
        LyoError::Parse {
            context: context.into(),
            message: message.to_string(),
        }
    }

    /// Server-side status failures are the only HTTP errors worth repeating.
    pub fn is_server_error(&self) -> bool {
        matches!(self, LyoError::HttpStatus { status, .. } if *status >= 500)
    }

    pub fn is_transient_network(&self) -> bool {
        matches!(self, LyoError::TransientNetwork { .. })
    }

    pub fn is_store_connectivity(&self) -> bool {
        matches!(self, LyoError::StoreConnectivity(_))
    }
}
