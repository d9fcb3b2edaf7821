//! Core type definitions for the kouch client.
//!
//! This crate defines the plain types shared by every layer of the client:
//! - Document identity ([`DocId`]) and revision tokens ([`Revision`])
//! - Database and class names used to route and tag stored documents
//! - Change-log sequence cursors ([`Sequence`])
//! - The [`Entity`] contract every domain type implements
//!
//! Nothing here performs I/O.

mod entity;
mod ids;

pub use entity::{Entity, EntityState};
pub use ids::{ClassName, DatabaseName, DocId, Revision, Sequence};

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in type operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{kind} must not be blank")]
    Blank { kind: &'static str },
}
