//! Error types for the client.

use crate::bulk::BulkOutcome;
use crate::document::PutResponse;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Result type for client operations.
pub type KouchResult<T> = Result<T, KouchError>;

/// Error body returned by the server (`{"error": ..., "reason": ...}`).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(default)]
    pub reason: Option<String>,
}

impl fmt::Display for ErrorResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.reason {
            Some(reason) => write!(f, "{}: {}", self.error, reason),
            None => f.write_str(&self.error),
        }
    }
}

/// A non-success reply: status, parsed error body when present, raw text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerReply {
    pub status: u16,
    pub body: Option<ErrorResponse>,
    pub text: String,
}

impl ServerReply {
    pub(crate) fn new(status: StatusCode, text: String) -> Self {
        let body = serde_json::from_str::<ErrorResponse>(&text).ok();
        Self {
            status: status.as_u16(),
            body,
            text,
        }
    }

    /// The server's reason string, if it sent one.
    pub fn reason(&self) -> Option<&str> {
        self.body.as_ref().and_then(|b| b.reason.as_deref())
    }
}

impl fmt::Display for ServerReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.body {
            Some(body) => write!(f, "{} {}", self.status, body),
            None => write!(f, "{} {}", self.status, self.text),
        }
    }
}

/// Errors that can occur in client operations.
#[derive(Debug, Error)]
pub enum KouchError {
    /// Caller misuse: blank id, missing or unexpected revision. Never retried.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("bad request: {0}")]
    BadRequest(ServerReply),

    #[error("unauthorized: {0}")]
    Unauthorized(ServerReply),

    #[error("forbidden: {0}")]
    Forbidden(ServerReply),

    #[error("not found: {0}")]
    NotFound(ServerReply),

    /// Revision mismatch on write. Retrying is the caller's decision.
    #[error("conflict: {0}")]
    Conflict(ServerReply),

    #[error("not modified: {0}")]
    NotModified(ServerReply),

    #[error("precondition failed: {0}")]
    PreconditionFailed(ServerReply),

    #[error("unsupported media type: {0}")]
    UnsupportedMediaType(ServerReply),

    /// Any status the operation does not recognise.
    #[error("unsupported status: {0}")]
    UnsupportedStatus(ServerReply),

    /// Entity type was never registered with the metadata resolver.
    #[error("no metadata registered for entity type {type_name}")]
    MissingMetadata { type_name: &'static str },

    #[error("invalid metadata: {0}")]
    InvalidMetadata(String),

    /// Discriminator names a class outside the caller's type registry.
    #[error("unknown class discriminator {class:?} on document {id}")]
    UnknownClass { class: String, id: String },

    #[error("document {id} has no {field:?} discriminator")]
    MissingClassField { id: String, field: String },

    #[error("write response carried no revision: {0}")]
    ResponseRevisionMissing(String),

    #[error("write failed: {0:?}")]
    WriteFailed(PutResponse),

    /// At least one bulk outcome was not ok; carries only the failures.
    #[error("bulk write failed for {} document(s)", failed.len())]
    BulkFailed { failed: Vec<BulkOutcome> },

    #[error("bulk response does not line up with request: {0}")]
    BulkMismatch(String),

    #[error("view row has no embedded document: {0}")]
    MissingDocument(String),

    #[error("envelope error: {0}")]
    Codec(String),

    /// Change-feed connection or read failure. Handled by the reconnect loop.
    #[error("change feed interrupted: {0}")]
    StreamTransient(String),

    /// The change-feed worker task panicked or was aborted.
    #[error("change feed worker stopped abnormally: {0}")]
    WorkerFailed(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl KouchError {
    /// Maps a non-success status to its domain variant. Statuses without a
    /// variant become [`KouchError::UnsupportedStatus`].
    pub(crate) fn from_status(status: StatusCode, text: String) -> Self {
        let reply = ServerReply::new(status, text);
        match status {
            StatusCode::BAD_REQUEST => KouchError::BadRequest(reply),
            StatusCode::UNAUTHORIZED => KouchError::Unauthorized(reply),
            StatusCode::FORBIDDEN => KouchError::Forbidden(reply),
            StatusCode::NOT_FOUND => KouchError::NotFound(reply),
            StatusCode::CONFLICT => KouchError::Conflict(reply),
            StatusCode::NOT_MODIFIED => KouchError::NotModified(reply),
            StatusCode::PRECONDITION_FAILED => KouchError::PreconditionFailed(reply),
            StatusCode::UNSUPPORTED_MEDIA_TYPE => KouchError::UnsupportedMediaType(reply),
            _ => KouchError::UnsupportedStatus(reply),
        }
    }

    pub(crate) fn unsupported(status: StatusCode, text: String) -> Self {
        KouchError::UnsupportedStatus(ServerReply::new(status, text))
    }

    /// Maps `status` to its domain variant when the operation documents it
    /// (`expected`), otherwise to [`KouchError::UnsupportedStatus`].
    pub(crate) fn for_operation(status: StatusCode, text: String, expected: &[StatusCode]) -> Self {
        if expected.contains(&status) {
            Self::from_status(status, text)
        } else {
            Self::unsupported(status, text)
        }
    }

    /// Returns true if this error represents a revision conflict.
    pub fn is_conflict(&self) -> bool {
        matches!(self, KouchError::Conflict(_))
    }

    /// Returns true if this error represents a missing document or database.
    pub fn is_not_found(&self) -> bool {
        matches!(self, KouchError::NotFound(_))
    }

    /// Returns true for caller misuse detected before any request was sent.
    pub fn is_invariant_violation(&self) -> bool {
        matches!(self, KouchError::InvariantViolation(_))
    }

    /// HTTP status behind this error, if it came from a server reply.
    pub fn status(&self) -> Option<u16> {
        self.reply().map(|r| r.status)
    }

    /// The server reply behind this error, if any.
    pub fn reply(&self) -> Option<&ServerReply> {
        match self {
            KouchError::BadRequest(r)
            | KouchError::Unauthorized(r)
            | KouchError::Forbidden(r)
            | KouchError::NotFound(r)
            | KouchError::Conflict(r)
            | KouchError::NotModified(r)
            | KouchError::PreconditionFailed(r)
            | KouchError::UnsupportedMediaType(r)
            | KouchError::UnsupportedStatus(r) => Some(r),
            _ => None,
        }
    }
}
