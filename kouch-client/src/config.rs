//! Client configuration.

use kouch_types::DatabaseName;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default discriminator key embedded in stored entity documents.
pub const DEFAULT_CLASS_FIELD: &str = "class__";

/// How entity types are mapped to databases.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum DatabaseNaming {
    #[default]
    /// Each type gets its own database: an explicit override, or the
    /// snake_case form of its type name.
    PerType,
    /// Every type without an explicit override shares one database and is
    /// told apart by its discriminator.
    Predefined { database: DatabaseName },
}

/// What the envelope codec does with `null` entity fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NullFieldPolicy {
    /// Encode `null` fields as-is.
    #[default]
    Keep,
    /// Leave `null` fields out of the stored document.
    Omit,
}

/// Configuration for a [`KouchClient`](crate::KouchClient).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KouchConfig {
    /// Server base URL (e.g. `http://localhost:5984`).
    pub base_url: String,
    /// Basic-auth user name.
    pub username: Option<String>,
    /// Basic-auth password.
    pub password: Option<String>,
    pub database_naming: DatabaseNaming,
    /// Discriminator key injected into every stored entity.
    pub class_field: String,
    pub null_fields: NullFieldPolicy,
    /// Total timeout for single-shot requests (seconds).
    pub request_timeout_secs: u64,
    /// Connect timeout for every request, including the change feed (seconds).
    pub connect_timeout_secs: u64,
}

impl Default for KouchConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:5984".to_string(),
            username: None,
            password: None,
            database_naming: DatabaseNaming::default(),
            class_field: DEFAULT_CLASS_FIELD.to_string(),
            null_fields: NullFieldPolicy::default(),
            request_timeout_secs: 60,
            connect_timeout_secs: 60,
        }
    }
}

impl KouchConfig {
    /// Shorthand for a config pointing at `base_url` with default settings.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Default::default()
        }
    }

    /// Sets basic-auth credentials.
    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Routes every type without an override to `database`.
    pub fn with_predefined_database(mut self, database: impl Into<DatabaseName>) -> Self {
        self.database_naming = DatabaseNaming::Predefined {
            database: database.into(),
        };
        self
    }

    /// The shared database, when [`DatabaseNaming::Predefined`] is configured.
    pub fn predefined_database(&self) -> Option<&DatabaseName> {
        match &self.database_naming {
            DatabaseNaming::Predefined { database } => Some(database),
            DatabaseNaming::PerType => None,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// Settings for a change-feed subscription.
#[derive(Debug, Clone)]
pub struct ChangeFeedConfig {
    /// Delay before the first reconnect attempt.
    pub reconnect_delay: Duration,
    /// Upper bound for the doubling reconnect delay.
    pub max_reconnect_delay: Duration,
    /// Longest wait for response headers or the next line before reconnecting.
    /// `None` derives it from the request's heartbeat (twice the interval).
    pub idle_timeout: Option<Duration>,
    /// Events buffered between the reader and the consumer.
    pub channel_capacity: usize,
}

impl Default for ChangeFeedConfig {
    fn default() -> Self {
        Self {
            reconnect_delay: Duration::from_secs(2),
            max_reconnect_delay: Duration::from_secs(30),
            idle_timeout: None,
            channel_capacity: 64,
        }
    }
}
