//! Typed client for CouchDB-style document databases.
//!
//! Maps strongly-typed entities to stored JSON documents and back, enforces
//! revision-based optimistic concurrency on writes, runs bulk writes with
//! per-document outcomes and follows a database's change feed with
//! automatic reconnection.
//!
//! # Architecture
//!
//! - **Metadata**: [`MetadataResolver`] maps each registered entity type to
//!   a database and a class discriminator
//! - **Codec**: [`codec`] renames `id`/`revision` to `_id`/`_rev` and tags
//!   documents with their class
//! - **Documents**: [`DocumentService`] for get, insert, update, upsert and
//!   delete
//! - **Bulk**: [`DatabaseService`] for `_bulk_docs` and `_bulk_get`
//! - **Changes**: [`ChangeSubscription`] and [`ChangeHandle`] for the
//!   continuous change feed
//! - **Design**: [`DesignService`] for design documents and views
//!
//! # Example
//!
//! ```no_run
//! use kouch_client::{EntityRegistration, KouchClient, KouchConfig};
//! use kouch_types::{impl_entity, DocId, Revision};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, Clone, Serialize, Deserialize)]
//! struct Note {
//!     id: DocId,
//!     revision: Option<Revision>,
//!     label: String,
//! }
//! impl_entity!(Note);
//!
//! # async fn run() -> kouch_client::KouchResult<()> {
//! let client = KouchClient::new(KouchConfig::new("http://localhost:5984"))?;
//! client.register::<Note>(EntityRegistration::new())?;
//!
//! let note = Note { id: DocId::new("a1"), revision: None, label: "x".into() };
//! let written = client.doc().insert(&note).await?;
//! let note = written.updated_entity(true)?;
//! # let _ = note;
//! # Ok(())
//! # }
//! ```

mod bulk;
mod changes;
mod client;
pub mod codec;
mod config;
mod context;
mod design;
mod document;
mod error;
mod metadata;
mod registry;

pub use bulk::{
    BulkGetError, BulkGetResult, BulkOutcome, BulkUpsertResult, DatabaseService, DeleteStub,
};
pub use changes::{
    ChangeEvent, ChangeHandle, ChangeSubscription, ChangesRequest, ChangesStyle,
    DEFAULT_HEARTBEAT_MS,
};
pub use client::KouchClient;
pub use config::{
    ChangeFeedConfig, DEFAULT_CLASS_FIELD, DatabaseNaming, KouchConfig, NullFieldPolicy,
};
pub use design::{
    DesignDocument, DesignService, RawViewResult, RawViewRow, View, ViewRequest, ViewResult,
    ViewRow, ViewUpdate,
};
pub use document::{
    DocumentService, GetQueryParameters, PutQueryParameters, PutResponse, PutResult,
    RevisionInfo, Revisions, SystemFields,
};
pub use error::{ErrorResponse, KouchError, KouchResult, ServerReply};
pub use metadata::{EntityMetadata, EntityRegistration, MetadataResolver, camel_to_snake_case};
pub use registry::TypeRegistry;

pub use kouch_types::{ClassName, DatabaseName, DocId, Entity, EntityState, Revision, Sequence};
