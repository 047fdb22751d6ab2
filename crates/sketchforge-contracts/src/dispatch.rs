//! Records produced by one dispatch: the attempt trail and exactly one of a
//! result or a failure.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    Timeout,
    ConnectionError,
    ProtocolError,
    DecodeError,
    ConfigError,
}

impl AttemptOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            AttemptOutcome::Success => "success",
            AttemptOutcome::Timeout => "timeout",
            AttemptOutcome::ConnectionError => "connection_error",
            AttemptOutcome::ProtocolError => "protocol_error",
            AttemptOutcome::DecodeError => "decode_error",
            AttemptOutcome::ConfigError => "config_error",
        }
    }

    pub fn is_success(self) -> bool {
        self == AttemptOutcome::Success
    }
}

impl From<ErrorKind> for AttemptOutcome {
    fn from(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::Config => AttemptOutcome::ConfigError,
            ErrorKind::Timeout => AttemptOutcome::Timeout,
            ErrorKind::Connection => AttemptOutcome::ConnectionError,
            ErrorKind::Protocol => AttemptOutcome::ProtocolError,
            ErrorKind::Decode => AttemptOutcome::DecodeError,
        }
    }
}

/// One invocation of one adapter. `attempt` is 1-based per backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchAttempt {
    pub backend_id: String,
    pub attempt: u32,
    pub outcome: AttemptOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GenerationResult {
    #[serde(skip)]
    pub image: Vec<u8>,
    pub backend_id: String,
    pub elapsed_ms: u64,
    pub attempts: Vec<DispatchAttempt>,
}

impl GenerationResult {
    pub fn attempts_for(&self, backend_id: &str) -> Vec<&DispatchAttempt> {
        self.attempts
            .iter()
            .filter(|attempt| attempt.backend_id == backend_id)
            .collect()
    }
}

/// Terminal error of one backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendFailure {
    pub backend_id: String,
    pub error_kind: ErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GenerationFailure {
    /// One entry per backend tried, in registry order.
    pub attempts: Vec<BackendFailure>,
    pub trail: Vec<DispatchAttempt>,
    pub elapsed_ms: u64,
}

impl GenerationFailure {
    pub fn last(&self) -> Option<&BackendFailure> {
        self.attempts.last()
    }

    pub fn user_message(&self) -> String {
        let Some(last) = self.last() else {
            return "Image generation failed: no backends are configured.".to_string();
        };
        let mut message = format!(
            "Image generation failed. Last backend tried: '{}' ({} error): {}.",
            last.backend_id, last.error_kind, last.message
        );
        if self.attempts.len() > 1 {
            message.push_str(&format!(
                " {} backends were tried in order, including the local fallback '{}'.",
                self.attempts.len(),
                last.backend_id
            ));
        } else {
            message.push_str(" It was the only configured backend.");
        }
        message
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("all backends exhausted: {}", .0.user_message())]
    AllBackendsExhausted(GenerationFailure),

    #[error("generation cancelled after {} backend(s)", .0.attempts.len())]
    Cancelled(GenerationFailure),
}

impl DispatchError {
    pub fn failure(&self) -> &GenerationFailure {
        match self {
            DispatchError::AllBackendsExhausted(failure) | DispatchError::Cancelled(failure) => {
                failure
            }
        }
    }

    pub fn into_failure(self) -> GenerationFailure {
        match self {
            DispatchError::AllBackendsExhausted(failure) | DispatchError::Cancelled(failure) => {
                failure
            }
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, DispatchError::Cancelled(_))
    }
}

/// Response shape returned to a UI or other caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum OutboundResponse {
    Success {
        image: String,
        backend_id: String,
        elapsed_ms: u64,
    },
    Failure {
        attempts: Vec<BackendFailure>,
        message: String,
        cancelled: bool,
    },
}

impl OutboundResponse {
    pub fn from_result(result: &GenerationResult) -> Self {
        OutboundResponse::Success {
            image: BASE64.encode(&result.image),
            backend_id: result.backend_id.clone(),
            elapsed_ms: result.elapsed_ms,
        }
    }

    pub fn from_error(err: &DispatchError) -> Self {
        let failure = err.failure();
        OutboundResponse::Failure {
            attempts: failure.attempts.clone(),
            message: if err.is_cancelled() {
                err.to_string()
            } else {
                failure.user_message()
            },
            cancelled: err.is_cancelled(),
        }
    }
}
