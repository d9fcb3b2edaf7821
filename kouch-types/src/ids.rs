//! Identifier newtypes.
//!
//! All identifiers are opaque strings on the wire. Wrapping them keeps a
//! document id from being passed where a revision or database is expected.

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident, $kind:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wraps a raw string without validation.
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Wraps a raw string, rejecting blank (empty or whitespace-only) values.
            pub fn parse(value: impl Into<String>) -> crate::Result<Self> {
                let value = value.into();
                if value.trim().is_empty() {
                    return Err(crate::Error::Blank { kind: $kind });
                }
                Ok(Self(value))
            }

            /// Returns the raw string.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Returns true for empty or whitespace-only values.
            #[must_use]
            pub fn is_blank(&self) -> bool {
                self.0.trim().is_empty()
            }

            /// Consumes the wrapper, returning the raw string.
            #[must_use]
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

string_id!(
    /// Identity of a stored document (`_id` on the wire).
    DocId,
    "document id"
);

string_id!(
    /// Server-assigned version token (`_rev` on the wire).
    ///
    /// Presence and equality of the revision is what makes writes
    /// optimistic: a stale token is rejected with a conflict.
    Revision,
    "revision"
);

string_id!(
    /// Name of a database on the server.
    DatabaseName,
    "database name"
);

string_id!(
    /// Discriminator value embedded in every stored entity document so that
    /// several entity types can share one database.
    ClassName,
    "class name"
);

/// Opaque position in a database's change log.
///
/// Servers have emitted both integer and string sequences over time, so
/// deserialization accepts either and keeps the textual form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct Sequence(String);

impl Sequence {
    /// The special cursor meaning "only changes after this moment".
    pub const NOW: &'static str = "now";

    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Cursor that starts at the current end of the log.
    pub fn now() -> Self {
        Self(Self::NOW.to_string())
    }

    /// Cursor that replays the log from the beginning.
    pub fn zero() -> Self {
        Self("0".to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for Sequence {
    fn default() -> Self {
        Self::now()
    }
}

impl fmt::Display for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Sequence {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl<'de> Deserialize<'de> for Sequence {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct SequenceVisitor;

        impl Visitor<'_> for SequenceVisitor {
            type Value = Sequence;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a string or integer sequence")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Sequence, E> {
                Ok(Sequence(v.to_string()))
            }

            fn visit_string<E: de::Error>(self, v: String) -> Result<Sequence, E> {
                Ok(Sequence(v))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Sequence, E> {
                Ok(Sequence(v.to_string()))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Sequence, E> {
                Ok(Sequence(v.to_string()))
            }
        }

        deserializer.deserialize_any(SequenceVisitor)
    }
}
