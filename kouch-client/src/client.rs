//! Client entry point.

use crate::bulk::DatabaseService;
use crate::config::KouchConfig;
use crate::context::HttpContext;
use crate::design::DesignService;
use crate::document::DocumentService;
use crate::error::KouchResult;
use crate::metadata::{EntityRegistration, MetadataResolver};
use kouch_types::Entity;
use std::sync::Arc;
use tracing::info;

/// A configured client. Cheap to clone; clones share the HTTP pool and the
/// metadata cache.
#[derive(Debug, Clone)]
pub struct KouchClient {
    ctx: Arc<HttpContext>,
    metadata: Arc<MetadataResolver>,
}

impl KouchClient {
    pub fn new(config: KouchConfig) -> KouchResult<Self> {
        let metadata = Arc::new(MetadataResolver::new(config.database_naming.clone()));
        let ctx = Arc::new(HttpContext::new(config)?);
        info!("kouch client for {}", ctx.url(&[]));
        Ok(Self { ctx, metadata })
    }

    pub fn config(&self) -> &KouchConfig {
        self.ctx.config()
    }

    pub fn metadata(&self) -> &MetadataResolver {
        &self.metadata
    }

    /// Registers `T` with the metadata resolver.
    pub fn register<T: Entity>(&self, registration: EntityRegistration) -> KouchResult<()> {
        self.metadata.register::<T>(registration)
    }

    pub fn doc(&self) -> DocumentService {
        DocumentService::new(Arc::clone(&self.ctx), Arc::clone(&self.metadata))
    }

    pub fn db(&self) -> DatabaseService {
        DatabaseService::new(Arc::clone(&self.ctx), Arc::clone(&self.metadata))
    }

    pub fn design(&self) -> DesignService {
        DesignService::new(Arc::clone(&self.ctx))
    }
}
