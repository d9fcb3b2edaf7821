//! Multi-document writes and reads.
//!
//! `_bulk_docs` answers with one outcome per submitted document in
//! submission order. Outcomes are matched to inputs by position, never by
//! id, since the same id may legitimately appear as both an upsert and a
//! delete in one request.

use crate::codec::{self, JsonMap};
use crate::context::HttpContext;
use crate::document::require_id;
use crate::error::{KouchError, KouchResult};
use crate::metadata::MetadataResolver;
use crate::registry::TypeRegistry;
use kouch_types::{DatabaseName, DocId, Entity, Revision};
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{debug, warn};

const BULK_DOCS_ERRORS: &[StatusCode] = &[
    StatusCode::BAD_REQUEST,
    StatusCode::UNAUTHORIZED,
    StatusCode::NOT_FOUND,
];

const BULK_GET_ERRORS: &[StatusCode] = &[
    StatusCode::BAD_REQUEST,
    StatusCode::UNAUTHORIZED,
    StatusCode::NOT_FOUND,
    StatusCode::UNSUPPORTED_MEDIA_TYPE,
];

/// Per-document result of a bulk write.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BulkOutcome {
    #[serde(default)]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<Revision>,
    #[serde(default)]
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl BulkOutcome {
    /// Applied: no error and a new revision (or an explicit `ok`).
    pub fn is_ok(&self) -> bool {
        self.error.is_none() && (self.ok || self.rev.is_some())
    }

    pub fn is_conflict(&self) -> bool {
        self.error.as_deref() == Some("conflict")
    }
}

/// Minimal tombstone for a bulk delete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteStub {
    pub id: DocId,
    pub revision: Revision,
}

impl DeleteStub {
    pub fn new(id: impl Into<DocId>, revision: impl Into<Revision>) -> Self {
        Self {
            id: id.into(),
            revision: revision.into(),
        }
    }

    /// Stub for a persisted entity.
    pub fn of<T: Entity>(entity: &T) -> KouchResult<Self> {
        let revision = entity.revision().cloned().ok_or_else(|| {
            KouchError::InvariantViolation(format!(
                "delete of {} requires an entity with revision",
                entity.id()
            ))
        })?;
        Ok(Self {
            id: entity.id().clone(),
            revision,
        })
    }

    fn to_wire(&self) -> Value {
        let mut stub = JsonMap::with_capacity(3);
        stub.insert(codec::ID_FIELD.to_string(), Value::from(self.id.as_str()));
        stub.insert(codec::REV_FIELD.to_string(), Value::from(self.revision.as_str()));
        stub.insert(codec::DELETED_FIELD.to_string(), Value::Bool(true));
        Value::Object(stub)
    }
}

/// Result of [`DatabaseService::bulk_upsert`].
///
/// The first `upserts.len()` outcomes belong to the upserts, the rest to
/// the deletes, both in the order they were submitted.
#[derive(Debug, Clone)]
pub struct BulkUpsertResult<T> {
    response: Vec<BulkOutcome>,
    upserts: Vec<T>,
    deletes: Vec<DeleteStub>,
}

impl<T: Entity> BulkUpsertResult<T> {
    /// Every outcome, in submission order.
    pub fn response(&self) -> &[BulkOutcome] {
        &self.response
    }

    pub fn upsert_outcomes(&self) -> &[BulkOutcome] {
        &self.response[..self.upserts.len()]
    }

    pub fn delete_outcomes(&self) -> &[BulkOutcome] {
        &self.response[self.upserts.len()..]
    }

    /// Delete stubs the server accepted.
    pub fn deleted(&self) -> Vec<&DeleteStub> {
        self.deletes
            .iter()
            .zip(self.delete_outcomes())
            .filter(|(_, outcome)| outcome.is_ok())
            .map(|(stub, _)| stub)
            .collect()
    }

    pub fn failed(&self) -> impl Iterator<Item = &BulkOutcome> {
        self.response.iter().filter(|o| !o.is_ok())
    }

    pub fn is_ok(&self) -> bool {
        self.failed().next().is_none()
    }

    /// Upserted entities carrying their new revisions.
    ///
    /// With `fail_on_error` any failed outcome (upsert or delete) raises
    /// [`KouchError::BulkFailed`] with the failing subset; without it only
    /// the applied upserts are returned.
    pub fn get_updated_entities(&self, fail_on_error: bool) -> KouchResult<Vec<T>> {
        if fail_on_error && !self.is_ok() {
            return Err(KouchError::BulkFailed {
                failed: self.failed().cloned().collect(),
            });
        }
        let mut updated = Vec::with_capacity(self.upserts.len());
        for (entity, outcome) in self.upserts.iter().zip(self.upsert_outcomes()) {
            if !outcome.is_ok() {
                continue;
            }
            let rev = outcome
                .rev
                .clone()
                .ok_or_else(|| KouchError::ResponseRevisionMissing(outcome.id.clone()))?;
            updated.push(entity.clone().with_revision(rev));
        }
        Ok(updated)
    }
}

/// An error entry of a `_bulk_get` reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkGetError {
    pub id: String,
    #[serde(default)]
    pub rev: Option<String>,
    pub error: String,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Classified `_bulk_get` reply. Together the three lists account for
/// every requested id.
#[derive(Debug, Clone, PartialEq)]
pub struct BulkGetResult<E> {
    pub entities: Vec<E>,
    pub errors: Vec<BulkGetError>,
    /// Ids whose latest revision is a tombstone.
    pub deleted: Vec<DocId>,
}

impl<E> Default for BulkGetResult<E> {
    fn default() -> Self {
        Self {
            entities: Vec::new(),
            errors: Vec::new(),
            deleted: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct BulkGetResponse {
    results: Vec<BulkGetItem>,
}

#[derive(Debug, Deserialize)]
struct BulkGetItem {
    id: String,
    docs: Vec<BulkGetDoc>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
enum BulkGetDoc {
    Ok(JsonMap),
    Error(BulkGetError),
}

/// Database-scoped operations: bulk writes, bulk reads and change feeds.
#[derive(Debug, Clone)]
pub struct DatabaseService {
    pub(crate) ctx: Arc<HttpContext>,
    pub(crate) metadata: Arc<MetadataResolver>,
}

impl DatabaseService {
    pub(crate) fn new(ctx: Arc<HttpContext>, metadata: Arc<MetadataResolver>) -> Self {
        Self { ctx, metadata }
    }

    /// Bulk write into `T`'s database.
    pub async fn bulk_upsert<T: Entity>(
        &self,
        upserts: Vec<T>,
        deletes: Vec<DeleteStub>,
    ) -> KouchResult<BulkUpsertResult<T>> {
        let db = self.metadata.resolve::<T>()?.database_name;
        self.bulk_upsert_in(&db, upserts, deletes).await
    }

    /// Bulk write into an explicit database. Upserts are encoded with `T`'s
    /// discriminator; deletes become tombstone stubs appended after them.
    pub async fn bulk_upsert_in<T: Entity>(
        &self,
        db: &DatabaseName,
        upserts: Vec<T>,
        deletes: Vec<DeleteStub>,
    ) -> KouchResult<BulkUpsertResult<T>> {
        for entity in &upserts {
            require_id(entity.id())?;
        }
        for stub in &deletes {
            require_id(&stub.id)?;
            if stub.revision.is_blank() {
                return Err(KouchError::InvariantViolation(format!(
                    "delete of {} requires a revision",
                    stub.id
                )));
            }
        }

        if upserts.is_empty() && deletes.is_empty() {
            return Ok(BulkUpsertResult {
                response: Vec::new(),
                upserts,
                deletes,
            });
        }

        let class = self.metadata.resolve::<T>()?.class_name;
        let options = self.ctx.codec();
        let mut docs = Vec::with_capacity(upserts.len() + deletes.len());
        for entity in &upserts {
            docs.push(Value::Object(codec::encode_entity(entity, &class, &options)?));
        }
        docs.extend(deletes.iter().map(DeleteStub::to_wire));

        debug!(
            "bulk write to {}: {} upserts, {} deletes",
            db,
            upserts.len(),
            deletes.len()
        );
        let request = self
            .ctx
            .request(Method::POST, &[db.as_str(), "_bulk_docs"])
            .json(&json!({ "docs": docs, "new_edits": true }));
        let (status, text) = self.ctx.send(request).await?;
        if status != StatusCode::CREATED {
            return Err(KouchError::for_operation(status, text, BULK_DOCS_ERRORS));
        }

        let response: Vec<BulkOutcome> = serde_json::from_str(&text)?;
        let expected: Vec<&DocId> = upserts
            .iter()
            .map(|e| e.id())
            .chain(deletes.iter().map(|d| &d.id))
            .collect();
        check_alignment(&response, &expected)?;

        let result = BulkUpsertResult {
            response,
            upserts,
            deletes,
        };
        let failures = result.failed().count();
        if failures > 0 {
            warn!("bulk write to {}: {} of {} failed", db, failures, result.response.len());
        }
        Ok(result)
    }

    /// Latest revision of each id from `T`'s database.
    pub async fn bulk_get<T: Entity>(&self, ids: &[DocId]) -> KouchResult<BulkGetResult<T>> {
        let db = self.metadata.resolve::<T>()?.database_name;
        let registry = TypeRegistry::<T>::single(&self.metadata)?;
        self.bulk_get_in(&db, ids, &registry).await
    }

    /// Latest revision of each id, decoded through `registry`.
    ///
    /// Tombstones are listed in [`BulkGetResult::deleted`]; a live document
    /// whose discriminator is missing or unknown fails the whole call.
    pub async fn bulk_get_in<E: 'static>(
        &self,
        db: &DatabaseName,
        ids: &[DocId],
        registry: &TypeRegistry<E>,
    ) -> KouchResult<BulkGetResult<E>> {
        for id in ids {
            require_id(id)?;
        }
        if ids.is_empty() {
            return Ok(BulkGetResult::default());
        }

        let docs: Vec<Value> = ids.iter().map(|id| json!({ "id": id })).collect();
        let request = self
            .ctx
            .request(Method::POST, &[db.as_str(), "_bulk_get"])
            .json(&json!({ "docs": docs }));
        let (status, text) = self.ctx.send(request).await?;
        if status != StatusCode::OK {
            return Err(KouchError::for_operation(status, text, BULK_GET_ERRORS));
        }

        let response: BulkGetResponse = serde_json::from_str(&text)?;
        let class_field = &self.ctx.config().class_field;
        let mut result = BulkGetResult::default();
        for item in response.results {
            for doc in item.docs {
                match doc {
                    BulkGetDoc::Ok(document) if codec::is_tombstone(&document) => {
                        debug!("bulk get {}: latest revision is deleted", item.id);
                        result.deleted.push(DocId::new(item.id.clone()));
                    }
                    BulkGetDoc::Ok(document) => {
                        result.entities.push(registry.decode(document, class_field)?);
                    }
                    BulkGetDoc::Error(error) => result.errors.push(error),
                }
            }
        }
        Ok(result)
    }
}

fn check_alignment(response: &[BulkOutcome], expected: &[&DocId]) -> KouchResult<()> {
    if response.len() != expected.len() {
        return Err(KouchError::BulkMismatch(format!(
            "submitted {} documents, got {} outcomes",
            expected.len(),
            response.len()
        )));
    }
    for (position, (outcome, id)) in response.iter().zip(expected).enumerate() {
        if outcome.id != id.as_str() {
            return Err(KouchError::BulkMismatch(format!(
                "outcome {position} is for {:?}, expected {:?}",
                outcome.id,
                id.as_str()
            )));
        }
    }
    Ok(())
}
