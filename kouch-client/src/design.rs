//! Design documents and view queries.
//!
//! Design documents live under `_design/<name>`. The domain id is the bare
//! name; the codec adds and strips the prefix. They carry no discriminator.

use crate::codec::{self, DESIGN_PREFIX, JsonMap};
use crate::context::HttpContext;
use crate::document::{
    GetQueryParameters, PutQueryParameters, PutResponse, PutResult, SystemFields, delete_document,
    put_document, read_document, require_id,
};
use crate::error::{KouchError, KouchResult};
use kouch_types::{DatabaseName, DocId, Revision, Sequence, impl_entity};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

const VIEW_ERRORS: &[StatusCode] = &[
    StatusCode::NOT_MODIFIED,
    StatusCode::BAD_REQUEST,
    StatusCode::UNAUTHORIZED,
    StatusCode::FORBIDDEN,
    StatusCode::NOT_FOUND,
];

fn javascript() -> String {
    "javascript".to_string()
}

/// A map function and optional reduce function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct View {
    pub map: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reduce: Option<String>,
}

impl View {
    pub fn map(map: impl Into<String>) -> Self {
        Self {
            map: map.into(),
            reduce: None,
        }
    }

    pub fn with_reduce(mut self, reduce: impl Into<String>) -> Self {
        self.reduce = Some(reduce.into());
        self
    }
}

/// A design document. `id` excludes the `_design/` prefix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DesignDocument {
    pub id: DocId,
    #[serde(default)]
    pub revision: Option<Revision>,
    #[serde(default = "javascript")]
    pub language: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub autoupdate: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<JsonMap>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub filters: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub updates: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validate_doc_update: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub views: BTreeMap<String, View>,
}

impl_entity!(DesignDocument);

impl DesignDocument {
    pub fn new(id: impl Into<DocId>) -> Self {
        Self {
            id: id.into(),
            revision: None,
            language: javascript(),
            autoupdate: None,
            options: None,
            filters: BTreeMap::new(),
            updates: BTreeMap::new(),
            validate_doc_update: None,
            views: BTreeMap::new(),
        }
    }

    pub fn with_view(mut self, name: impl Into<String>, view: View) -> Self {
        self.views.insert(name.into(), view);
        self
    }

    pub fn with_filter(mut self, name: impl Into<String>, function: impl Into<String>) -> Self {
        self.filters.insert(name.into(), function.into());
        self
    }
}

/// `update` option of a view query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ViewUpdate {
    True,
    False,
    Lazy,
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// View query options, posted as the request body. Unset options are not
/// sent and the server applies its defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ViewRequest {
    #[serde(default, skip_serializing_if = "is_false")]
    pub conflicts: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub descending: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub startkey: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub startkey_docid: Option<DocId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endkey: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endkey_docid: Option<DocId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_level: Option<u32>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub include_docs: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub attachments: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub att_encoding_info: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inclusive_end: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keys: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reduce: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sorted: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stable: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update: Option<ViewUpdate>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub update_seq: bool,
}

impl ViewRequest {
    pub fn with_include_docs(mut self) -> Self {
        self.include_docs = true;
        self
    }

    pub fn with_key(mut self, key: impl Into<Value>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_reduce(mut self, reduce: bool) -> Self {
        self.reduce = Some(reduce);
        self
    }
}

/// An undecoded view row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawViewRow {
    #[serde(default)]
    pub id: Option<DocId>,
    #[serde(default)]
    pub key: Value,
    #[serde(default)]
    pub value: Value,
    #[serde(default)]
    pub doc: Option<JsonMap>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawViewResult {
    pub rows: Vec<RawViewRow>,
    #[serde(default)]
    pub offset: Option<u64>,
    #[serde(default)]
    pub total_rows: Option<u64>,
    #[serde(default)]
    pub update_seq: Option<Sequence>,
}

/// A decoded view row. `value` is the embedded document with
/// `include_docs`, otherwise the emitted value; `None` for a null value.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewRow<T> {
    pub id: Option<DocId>,
    pub key: Value,
    pub value: Option<T>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ViewResult<T> {
    pub rows: Vec<ViewRow<T>>,
    pub offset: Option<u64>,
    pub total_rows: Option<u64>,
    pub update_seq: Option<Sequence>,
}

impl<T> ViewResult<T> {
    /// Non-null row values in row order.
    pub fn values(&self) -> impl Iterator<Item = &T> {
        self.rows.iter().filter_map(|row| row.value.as_ref())
    }

    pub fn into_values(self) -> Vec<T> {
        self.rows.into_iter().filter_map(|row| row.value).collect()
    }
}

/// Design document CRUD and view queries.
#[derive(Debug, Clone)]
pub struct DesignService {
    ctx: Arc<HttpContext>,
}

impl DesignService {
    pub(crate) fn new(ctx: Arc<HttpContext>) -> Self {
        Self { ctx }
    }

    pub async fn get_design(
        &self,
        db: &DatabaseName,
        id: &DocId,
    ) -> KouchResult<Option<DesignDocument>> {
        let (_, design) = self
            .get_design_with_response(db, id, &GetQueryParameters::default())
            .await?;
        Ok(design)
    }

    pub async fn get_design_with_response(
        &self,
        db: &DatabaseName,
        id: &DocId,
        params: &GetQueryParameters,
    ) -> KouchResult<(SystemFields, Option<DesignDocument>)> {
        let name = design_name(id)?;
        let (system, fields) =
            read_document(&self.ctx, &[db.as_str(), "_design", name], params).await?;
        let design = match fields {
            Some(fields) => Some(codec::decode_design(fields)?),
            None => None,
        };
        Ok((system, design))
    }

    /// Creates or updates a design document (revision decides which).
    pub async fn upsert_design(
        &self,
        db: &DatabaseName,
        design: &DesignDocument,
    ) -> KouchResult<PutResult<DesignDocument>> {
        let name = design_name(&design.id)?;
        let body = codec::encode_design(design)?;
        put_document(
            &self.ctx,
            &[db.as_str(), "_design", name],
            &body,
            &PutQueryParameters::default(),
            design,
        )
        .await
    }

    pub async fn delete_design(
        &self,
        db: &DatabaseName,
        id: &DocId,
        revision: &Revision,
        batch: bool,
    ) -> KouchResult<PutResponse> {
        let name = design_name(id)?;
        if revision.is_blank() {
            return Err(KouchError::InvariantViolation(format!(
                "delete of design {id} requires a revision"
            )));
        }
        delete_document(&self.ctx, &[db.as_str(), "_design", name], revision, batch).await
    }

    /// Queries a view without decoding rows.
    pub async fn get_raw_view(
        &self,
        db: &DatabaseName,
        design: &DocId,
        view: &str,
        request: &ViewRequest,
    ) -> KouchResult<RawViewResult> {
        let name = design_name(design)?;
        if view.trim().is_empty() {
            return Err(KouchError::InvariantViolation(
                "view name must not be blank".to_string(),
            ));
        }
        let http = self
            .ctx
            .request(Method::POST, &[db.as_str(), "_design", name, "_view", view])
            .json(request);
        let (status, text) = self.ctx.send(http).await?;
        if status != StatusCode::OK {
            return Err(KouchError::for_operation(status, text, VIEW_ERRORS));
        }
        let result: RawViewResult = serde_json::from_str(&text)?;
        debug!("view {}/{}: {} rows", name, view, result.rows.len());
        Ok(result)
    }

    /// Queries a view, decoding each row's document (`include_docs`) or
    /// emitted value as `T`.
    pub async fn get_view<T: DeserializeOwned>(
        &self,
        db: &DatabaseName,
        design: &DocId,
        view: &str,
        request: &ViewRequest,
    ) -> KouchResult<ViewResult<T>> {
        let raw = self.get_raw_view(db, design, view, request).await?;
        let class_field = &self.ctx.config().class_field;

        let mut rows = Vec::with_capacity(raw.rows.len());
        for row in raw.rows {
            let value = if request.include_docs {
                match row.doc {
                    Some(doc) => Some(codec::decode_entity(doc, class_field)?),
                    None => {
                        let id = row.id.map(DocId::into_inner).unwrap_or_default();
                        return Err(KouchError::MissingDocument(id));
                    }
                }
            } else if row.value.is_null() {
                None
            } else {
                Some(codec::decode_value(row.value, class_field)?)
            };
            rows.push(ViewRow {
                id: row.id,
                key: row.key,
                value,
            });
        }

        Ok(ViewResult {
            rows,
            offset: raw.offset,
            total_rows: raw.total_rows,
            update_seq: raw.update_seq,
        })
    }
}

/// Bare design name; a leading `_design/` is tolerated.
fn design_name(id: &DocId) -> KouchResult<&str> {
    require_id(id)?;
    let name = id.as_str().strip_prefix(DESIGN_PREFIX).unwrap_or(id.as_str());
    if name.trim().is_empty() {
        return Err(KouchError::InvariantViolation(
            "design document name must not be blank".to_string(),
        ));
    }
    Ok(name)
}
