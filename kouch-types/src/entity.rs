//! The entity contract.

use crate::ids::{DocId, Revision};
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Lifecycle of an entity as seen by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityState {
    /// Never written: no revision yet.
    New,
    /// Written at least once: carries the server's revision.
    Persisted,
}

/// A domain type stored as one document.
///
/// Domain JSON uses `id` and `revision` keys; the codec renames them to
/// `_id`/`_rev` on the way out. Implementations must serialize the revision
/// as `null` (or omit it) when absent.
///
/// The [`impl_entity!`](crate::impl_entity) macro covers the usual case of a
/// struct with `id: DocId` and `revision: Option<Revision>` fields.
pub trait Entity: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Type name used for naming conventions (for example `"TestEntity"`).
    const TYPE_NAME: &'static str;

    fn id(&self) -> &DocId;

    fn revision(&self) -> Option<&Revision>;

    /// Returns a copy carrying `revision`. Writes never mutate in place;
    /// callers replace their reference with the returned value.
    fn with_revision(self, revision: Revision) -> Self;

    fn state(&self) -> EntityState {
        match self.revision() {
            Some(_) => EntityState::Persisted,
            None => EntityState::New,
        }
    }
}

/// Implements [`Entity`] for a struct with `id: DocId` and
/// `revision: Option<Revision>` fields.
///
/// ```
/// use kouch_types::{impl_entity, DocId, Revision};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Debug, Clone, Serialize, Deserialize)]
/// struct Note {
///     id: DocId,
///     revision: Option<Revision>,
///     body: String,
/// }
///
/// impl_entity!(Note);
/// ```
#[macro_export]
macro_rules! impl_entity {
    ($ty:ty, $name:expr) => {
        impl $crate::Entity for $ty {
            const TYPE_NAME: &'static str = $name;

            fn id(&self) -> &$crate::DocId {
                &self.id
            }

            fn revision(&self) -> ::std::option::Option<&$crate::Revision> {
                self.revision.as_ref()
            }

            fn with_revision(mut self, revision: $crate::Revision) -> Self {
                self.revision = ::std::option::Option::Some(revision);
                self
            }
        }
    };
    ($ty:ty) => {
        $crate::impl_entity!($ty, stringify!($ty));
    };
}
