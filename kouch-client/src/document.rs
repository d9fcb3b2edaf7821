//! Single-document reads and optimistic writes.
//!
//! Writes follow the revision protocol: a new entity has no revision and is
//! created, a persisted entity carries the revision it was read at and the
//! server rejects the write with a conflict if that revision is stale.
//! Nothing here caches entities; callers replace their copy with the one
//! returned by each write.

use crate::codec::{self, JsonMap};
use crate::context::HttpContext;
use crate::error::{ErrorResponse, KouchError, KouchResult};
use crate::metadata::MetadataResolver;
use kouch_types::{DatabaseName, DocId, Entity, Revision, Sequence};
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

const GET_ERRORS: &[StatusCode] = &[
    StatusCode::NOT_MODIFIED,
    StatusCode::BAD_REQUEST,
    StatusCode::UNAUTHORIZED,
    StatusCode::FORBIDDEN,
];

const WRITE_ERRORS: &[StatusCode] = &[
    StatusCode::BAD_REQUEST,
    StatusCode::UNAUTHORIZED,
    StatusCode::NOT_FOUND,
    StatusCode::CONFLICT,
];

/// Reply to a single-document write (PUT or DELETE).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PutResponse {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<Revision>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Outcome of a write: the raw reply and the entity with its new revision.
#[derive(Debug, Clone, PartialEq)]
pub struct PutResult<T> {
    response: PutResponse,
    entity: Option<T>,
}

impl<T: Clone> PutResult<T> {
    pub fn response(&self) -> &PutResponse {
        &self.response
    }

    /// The written entity carrying its new revision.
    ///
    /// When the server did not acknowledge the write, `fail_on_error`
    /// selects between [`KouchError::WriteFailed`] and `Ok(None)`.
    pub fn updated_entity(&self, fail_on_error: bool) -> KouchResult<Option<T>> {
        match &self.entity {
            Some(entity) if self.response.ok => Ok(Some(entity.clone())),
            _ if fail_on_error => Err(KouchError::WriteFailed(self.response.clone())),
            _ => Ok(None),
        }
    }

    pub fn into_parts(self) -> (PutResponse, Option<T>) {
        (self.response, self.entity)
    }
}

/// Query options for document reads. Unset options are not sent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GetQueryParameters {
    pub attachments: bool,
    pub att_encoding_info: bool,
    pub atts_since: Vec<Revision>,
    pub conflicts: bool,
    pub deleted_conflicts: bool,
    pub latest: bool,
    pub local_seq: bool,
    pub meta: bool,
    pub open_revs: Vec<Revision>,
    pub rev: Option<Revision>,
    pub revs: bool,
    pub revs_info: bool,
}

impl GetQueryParameters {
    pub fn with_rev(mut self, rev: impl Into<Revision>) -> Self {
        self.rev = Some(rev.into());
        self
    }

    pub fn with_conflicts(mut self) -> Self {
        self.conflicts = true;
        self
    }

    pub fn with_revs(mut self) -> Self {
        self.revs = true;
        self
    }

    pub fn with_revs_info(mut self) -> Self {
        self.revs_info = true;
        self
    }

    /// Query pairs in wire form. Revision lists are JSON arrays.
    pub fn to_query(&self) -> KouchResult<Vec<(&'static str, String)>> {
        let flags = [
            ("attachments", self.attachments),
            ("att_encoding_info", self.att_encoding_info),
            ("conflicts", self.conflicts),
            ("deleted_conflicts", self.deleted_conflicts),
            ("latest", self.latest),
            ("local_seq", self.local_seq),
            ("meta", self.meta),
            ("revs", self.revs),
            ("revs_info", self.revs_info),
        ];
        let mut query: Vec<(&'static str, String)> = flags
            .into_iter()
            .filter(|(_, on)| *on)
            .map(|(key, _)| (key, "true".to_string()))
            .collect();
        if !self.atts_since.is_empty() {
            query.push(("atts_since", serde_json::to_string(&self.atts_since)?));
        }
        if !self.open_revs.is_empty() {
            query.push(("open_revs", serde_json::to_string(&self.open_revs)?));
        }
        if let Some(rev) = &self.rev {
            query.push(("rev", rev.to_string()));
        }
        Ok(query)
    }
}

/// Query options for document writes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PutQueryParameters {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rev: Option<Revision>,
    /// Ask for a deferred, low-durability write (`batch=ok`).
    #[serde(skip_serializing_if = "is_false", serialize_with = "batch_ok")]
    pub batch: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_edits: Option<bool>,
}

impl PutQueryParameters {
    pub fn batch() -> Self {
        Self {
            batch: true,
            ..Self::default()
        }
    }
}

fn is_false(value: &bool) -> bool {
    !*value
}

fn batch_ok<S: serde::Serializer>(_: &bool, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str("ok")
}

/// Revision history returned with `revs=true`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Revisions {
    pub ids: Vec<String>,
    pub start: u64,
}

/// One entry of `_revs_info`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisionInfo {
    pub rev: Revision,
    pub status: String,
}

/// Server-managed fields of a read, kept apart from the typed entity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemFields {
    #[serde(rename = "_deleted", default)]
    pub deleted: Option<bool>,
    #[serde(rename = "_attachments", default)]
    pub attachments: Option<JsonMap>,
    #[serde(rename = "_conflicts", default)]
    pub conflicts: Option<Vec<Revision>>,
    #[serde(rename = "_deleted_conflicts", default)]
    pub deleted_conflicts: Option<Vec<Revision>>,
    #[serde(rename = "_local_seq", default)]
    pub local_seq: Option<Sequence>,
    #[serde(rename = "_revs_info", default)]
    pub revs_info: Option<Vec<RevisionInfo>>,
    #[serde(rename = "_revisions", default)]
    pub revisions: Option<Revisions>,
    /// Set on a 404 reply.
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Reads and writes single entity documents.
#[derive(Debug, Clone)]
pub struct DocumentService {
    ctx: Arc<HttpContext>,
    metadata: Arc<MetadataResolver>,
}

impl DocumentService {
    pub(crate) fn new(ctx: Arc<HttpContext>, metadata: Arc<MetadataResolver>) -> Self {
        Self { ctx, metadata }
    }

    fn database_of<T: Entity>(&self) -> KouchResult<DatabaseName> {
        Ok(self.metadata.resolve::<T>()?.database_name)
    }

    /// Fetches `id`, returning `None` when the document does not exist.
    pub async fn get<T: Entity>(
        &self,
        id: &DocId,
        params: &GetQueryParameters,
    ) -> KouchResult<Option<T>> {
        let (_, entity) = self.get_with_response(id, params).await?;
        Ok(entity)
    }

    /// Fetches `id` along with its system fields.
    pub async fn get_with_response<T: Entity>(
        &self,
        id: &DocId,
        params: &GetQueryParameters,
    ) -> KouchResult<(SystemFields, Option<T>)> {
        require_id(id)?;
        let db = self.database_of::<T>()?;
        let (system, fields) =
            read_document(&self.ctx, &[db.as_str(), id.as_str()], params).await?;
        let entity = match fields {
            Some(fields) => Some(codec::decode_entity(fields, &self.ctx.config().class_field)?),
            None => None,
        };
        Ok((system, entity))
    }

    /// Creates a new document. The entity must not carry a revision.
    pub async fn insert<T: Entity>(&self, entity: &T) -> KouchResult<PutResult<T>> {
        require_id(entity.id())?;
        if entity.revision().is_some() {
            return Err(KouchError::InvariantViolation(format!(
                "insert of {} requires an entity without revision",
                entity.id()
            )));
        }
        self.upsert(entity).await
    }

    /// Writes a new version of a persisted document. The revision is the
    /// concurrency token; a stale one yields [`KouchError::Conflict`].
    pub async fn update<T: Entity>(&self, entity: &T) -> KouchResult<PutResult<T>> {
        require_id(entity.id())?;
        match entity.revision() {
            Some(rev) if !rev.is_blank() => self.upsert(entity).await,
            _ => Err(KouchError::InvariantViolation(format!(
                "update of {} requires an entity with revision",
                entity.id()
            ))),
        }
    }

    /// Writes `entity` as-is: created without a revision, updated with one.
    pub async fn upsert<T: Entity>(&self, entity: &T) -> KouchResult<PutResult<T>> {
        self.upsert_with(entity, &PutQueryParameters::default()).await
    }

    pub async fn upsert_with<T: Entity>(
        &self,
        entity: &T,
        params: &PutQueryParameters,
    ) -> KouchResult<PutResult<T>> {
        require_id(entity.id())?;
        let metadata = self.metadata.resolve::<T>()?;
        let body = codec::encode_entity(entity, &metadata.class_name, &self.ctx.codec())?;
        put_document(
            &self.ctx,
            &[metadata.database_name.as_str(), entity.id().as_str()],
            &body,
            params,
            entity,
        )
        .await
    }

    /// Deletes `id` at `revision`. `batch` trades durability for latency.
    pub async fn delete(
        &self,
        db: &DatabaseName,
        id: &DocId,
        revision: &Revision,
        batch: bool,
    ) -> KouchResult<PutResponse> {
        require_id(id)?;
        if revision.is_blank() {
            return Err(KouchError::InvariantViolation(format!(
                "delete of {id} requires a revision"
            )));
        }
        delete_document(&self.ctx, &[db.as_str(), id.as_str()], revision, batch).await
    }

    /// Deletes a persisted entity from its type's database.
    pub async fn delete_entity<T: Entity>(
        &self,
        entity: &T,
        batch: bool,
    ) -> KouchResult<PutResponse> {
        require_id(entity.id())?;
        let revision = entity.revision().ok_or_else(|| {
            KouchError::InvariantViolation(format!(
                "delete of {} requires an entity with revision",
                entity.id()
            ))
        })?;
        let db = self.database_of::<T>()?;
        self.delete(&db, entity.id(), revision, batch).await
    }
}

/// GETs a document and splits it into system fields and entity fields.
/// A 404 yields the error body in the system fields and no entity fields.
pub(crate) async fn read_document(
    ctx: &HttpContext,
    segments: &[&str],
    params: &GetQueryParameters,
) -> KouchResult<(SystemFields, Option<JsonMap>)> {
    let request = ctx.request(Method::GET, segments).query(&params.to_query()?);
    let (status, text) = ctx.send(request).await?;

    match status {
        StatusCode::OK => {
            let document: JsonMap = serde_json::from_str(&text)?;
            let (system, fields) = codec::split_system_fields(document);
            let system: SystemFields = serde_json::from_value(Value::Object(system))?;
            Ok((system, Some(fields)))
        }
        StatusCode::NOT_FOUND => {
            debug!("{} not found", segments.join("/"));
            let body: ErrorResponse = serde_json::from_str(&text).unwrap_or_default();
            let system = SystemFields {
                error: Some(body.error).filter(|e| !e.is_empty()),
                reason: body.reason,
                ..SystemFields::default()
            };
            Ok((system, None))
        }
        _ => Err(KouchError::for_operation(status, text, GET_ERRORS)),
    }
}

/// DELETEs a document at `revision`, optionally with `batch=ok`.
pub(crate) async fn delete_document(
    ctx: &HttpContext,
    segments: &[&str],
    revision: &Revision,
    batch: bool,
) -> KouchResult<PutResponse> {
    let mut request = ctx
        .request(Method::DELETE, segments)
        .query(&[("rev", revision.as_str())]);
    if batch {
        request = request.query(&[("batch", "ok")]);
    }
    let (status, text) = ctx.send(request).await?;

    match status {
        StatusCode::OK | StatusCode::ACCEPTED => {
            let response: PutResponse = serde_json::from_str(&text)?;
            if !response.ok {
                warn!("delete of {} not acknowledged: {:?}", segments.join("/"), response.error);
            }
            Ok(response)
        }
        _ => Err(KouchError::for_operation(status, text, WRITE_ERRORS)),
    }
}

/// PUTs an encoded document and pairs the reply with `entity`.
pub(crate) async fn put_document<T: Entity>(
    ctx: &HttpContext,
    segments: &[&str],
    body: &JsonMap,
    params: &PutQueryParameters,
    entity: &T,
) -> KouchResult<PutResult<T>> {
    let request = ctx.request(Method::PUT, segments).query(params).json(body);
    let (status, text) = ctx.send(request).await?;

    match status {
        StatusCode::CREATED | StatusCode::ACCEPTED => {
            let response: PutResponse = serde_json::from_str(&text)?;
            write_result(entity.clone(), response)
        }
        _ => Err(KouchError::for_operation(status, text, WRITE_ERRORS)),
    }
}

pub(crate) fn require_id(id: &DocId) -> KouchResult<()> {
    if id.is_blank() {
        return Err(KouchError::InvariantViolation(
            "document id must not be blank".to_string(),
        ));
    }
    Ok(())
}

/// Pairs a write reply with the entity at its new revision.
fn write_result<T: Entity>(entity: T, response: PutResponse) -> KouchResult<PutResult<T>> {
    if !response.ok {
        return Ok(PutResult {
            response,
            entity: None,
        });
    }
    let rev = response
        .rev
        .clone()
        .ok_or_else(|| KouchError::ResponseRevisionMissing(response.id.clone()))?;
    Ok(PutResult {
        response,
        entity: Some(entity.with_revision(rev)),
    })
}
