use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// How a remote failure should be treated by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureClass {
    /// Timeouts, 5xx, rate limiting. Eligible for a caller-driven retry.
    Transient,
    /// 4xx, validation rejections, undecodable payloads. Retrying will not help.
    Permanent,
}

impl FailureClass {
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::Transient => "TRANSIENT",
            Self::Permanent => "PERMANENT",
        }
    }

    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::Transient)
    }

    /// Classify a non-success HTTP status.
    #[must_use]
    pub const fn from_status(status: u16) -> Self {
        match status {
            408 | 429 | 500..=599 => Self::Transient,
            _ => Self::Permanent,
        }
    }
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Failure reported by a remote collaborator (listing, mutation, asset fetch).
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("[{class}] {message}")]
pub struct RemoteError {
    pub class: FailureClass,
    pub message: String,
    pub status: Option<u16>,
}

impl RemoteError {
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            class: FailureClass::Transient,
            message: message.into(),
            status: None,
        }
    }

    #[must_use]
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            class: FailureClass::Permanent,
            message: message.into(),
            status: None,
        }
    }

    #[must_use]
    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        self.class.is_retryable()
    }

    /// Build an error from a non-2xx response. The message comes from the
    /// server's error envelope when it can be decoded.
    #[must_use]
    pub fn from_http_status(status: u16, body: Option<&[u8]>) -> Self {
        let message = body
            .and_then(|b| serde_json::from_slice::<ApiErrorEnvelope>(b).ok())
            .and_then(ApiErrorEnvelope::into_message)
            .unwrap_or_else(|| format!("HTTP error: {status}"));

        Self {
            class: FailureClass::from_status(status),
            message,
            status: Some(status),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct ApiErrorEnvelope {
    #[serde(default)]
    error: Option<ApiErrorDetail>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct ApiErrorDetail {
    #[serde(default)]
    message: String,
}

impl ApiErrorEnvelope {
    fn into_message(self) -> Option<String> {
        self.error
            .map(|e| e.message)
            .or(self.message)
            .filter(|m| !m.trim().is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CredentialError {
    #[error("not authenticated")]
    NotAuthenticated,

    #[error("credential store unavailable: {0}")]
    Unavailable(String),
}

impl From<CredentialError> for RemoteError {
    fn from(e: CredentialError) -> Self {
        RemoteError::permanent(e.to_string()).with_status(401)
    }
}

/// Rejections and surfaced failures of the sync coordinator.
///
/// Gating states of a page fetch (already fetching, exhausted, stale) are not
/// errors; see [`crate::cursor::FetchStatus`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("entity not found in collection: {key}")]
    NotFound { key: String },

    #[error("a mutation is already in flight for {key}")]
    MutationInProgress { key: String },

    #[error("entity already present in collection: {key}")]
    AlreadyExists { key: String },

    /// The task confirming a mutation panicked or its runtime shut down
    /// before the outcome was recorded.
    #[error("mutation for {key} did not complete: {reason}")]
    Interrupted { key: String, reason: String },

    #[error(transparent)]
    Remote(#[from] RemoteError),
}

impl SyncError {
    pub(crate) fn not_found(key: &impl fmt::Display) -> Self {
        Self::NotFound {
            key: key.to_string(),
        }
    }

    /// Whether the caller may reasonably try the same call again later.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::MutationInProgress { .. } => true,
            Self::Remote(e) => e.is_retryable(),
            Self::NotFound { .. } | Self::AlreadyExists { .. } | Self::Interrupted { .. } => {
                false
            }
        }
    }
}
