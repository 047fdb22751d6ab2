//! Error taxonomy shared by the resolver, the adapters and the dispatcher.

use serde::{Deserialize, Serialize};

/// Coarse classification of a backend failure.
///
/// Only `Timeout` and `Connection` are retried on the same backend; every
/// other kind exhausts the backend immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Config,
    Timeout,
    Connection,
    Protocol,
    Decode,
}

impl ErrorKind {
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::Timeout | ErrorKind::Connection)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Config => "config",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Connection => "connection",
            ErrorKind::Protocol => "protocol",
            ErrorKind::Decode => "decode",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A success payload that did not match the adapter's declared decoding rule.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{backend_id}: {message}")]
pub struct DecodeError {
    pub backend_id: String,
    pub message: String,
}

impl DecodeError {
    pub fn new(backend_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            backend_id: backend_id.into(),
            message: message.into(),
        }
    }
}

/// Terminal outcome of a single adapter invocation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    #[error("backend not configured: {0}")]
    Config(String),

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("unexpected backend response: {0}")]
    Protocol(String),

    #[error("malformed payload: {0}")]
    Decode(#[from] DecodeError),
}

impl BackendError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BackendError::Config(_) => ErrorKind::Config,
            BackendError::Timeout(_) => ErrorKind::Timeout,
            BackendError::Connection(_) => ErrorKind::Connection,
            BackendError::Protocol(_) => ErrorKind::Protocol,
            BackendError::Decode(_) => ErrorKind::Decode,
        }
    }

    pub fn message(&self) -> String {
        match self {
            BackendError::Config(message)
            | BackendError::Timeout(message)
            | BackendError::Connection(message)
            | BackendError::Protocol(message) => message.clone(),
            BackendError::Decode(err) => err.message.clone(),
        }
    }
}

/// Failure to load or validate read-only configuration data.
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("failed to parse {source_name}: {reason}")]
    Parse { source_name: String, reason: String },

    #[error("parameter table entry {style}/{sketch_type} is missing tier {tier}")]
    MissingTier {
        style: String,
        sketch_type: String,
        tier: String,
    },

    #[error("parameter table entry {style}/{sketch_type} declares unknown tier {tier:?}")]
    UnknownTier {
        style: String,
        sketch_type: String,
        tier: String,
    },

    #[error("parameter table has no {style}/{sketch_type} entry to fall back on")]
    MissingFallback { style: String, sketch_type: String },

    #[error("invalid theme entry: {0}")]
    InvalidTheme(String),

    #[error("invalid backend config: {0}")]
    InvalidBackend(String),
}

/// An inbound request that cannot become a `GenerationRequest`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    #[error("sketch image is empty")]
    EmptyImage,

    #[error("sketch image is not valid base64: {0}")]
    InvalidImage(String),

    #[error("unknown sketch_type {0:?} (expected face or full_body)")]
    UnknownSketchType(String),

    #[error("unknown art_style {0:?} (expected realistic, cartoon or ultra_realistic)")]
    UnknownArtStyle(String),

    #[error("unknown subject category {0:?}")]
    UnknownSubject(String),

    #[error("theme must not be empty")]
    EmptyTheme,
}
