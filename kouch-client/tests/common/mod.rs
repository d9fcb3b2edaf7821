//! Shared entities and client builders for integration tests.

#![allow(dead_code)]

use kouch_client::{ChangeFeedConfig, EntityRegistration, KouchClient, KouchConfig};
use kouch_types::{DocId, Revision, impl_entity};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use wiremock::MockServer;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestEntity {
    pub id: DocId,
    pub revision: Option<Revision>,
    pub label: String,
    #[serde(default)]
    pub count: i64,
}

impl_entity!(TestEntity);

impl TestEntity {
    pub fn new(id: &str, label: &str) -> Self {
        Self {
            id: DocId::new(id),
            revision: None,
            label: label.to_string(),
            count: 0,
        }
    }

    pub fn persisted(id: &str, rev: &str, label: &str) -> Self {
        Self {
            revision: Some(Revision::new(rev)),
            ..Self::new(id, label)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OtherEntity {
    pub id: DocId,
    pub revision: Option<Revision>,
    pub title: String,
}

impl_entity!(OtherEntity);

/// Union used by heterogeneous reads.
#[derive(Debug, Clone, PartialEq)]
pub enum AnyEntity {
    Test(TestEntity),
    Other(OtherEntity),
}

/// Routes client logs to the test harness output. Safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("kouch_client=debug")
        .with_test_writer()
        .try_init();
}

pub fn mock_config(server: &MockServer) -> KouchConfig {
    KouchConfig::new(server.uri())
}

/// Client against `server` with both test entities registered by convention.
pub fn mock_client(server: &MockServer) -> KouchClient {
    init_tracing();
    let client = KouchClient::new(mock_config(server)).unwrap();
    client.register::<TestEntity>(EntityRegistration::new()).unwrap();
    client.register::<OtherEntity>(EntityRegistration::new()).unwrap();
    client
}

/// Feed settings with short delays so reconnects happen within a test.
pub fn fast_feed() -> ChangeFeedConfig {
    ChangeFeedConfig {
        reconnect_delay: Duration::from_millis(10),
        max_reconnect_delay: Duration::from_millis(50),
        idle_timeout: Some(Duration::from_secs(5)),
        channel_capacity: 16,
    }
}
