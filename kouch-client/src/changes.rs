//! Continuous change-feed consumer.
//!
//! A subscription owns one worker task that keeps a `feed=continuous`
//! request open, splits the body into lines and forwards decoded events over
//! a channel. The worker reconnects on any connection or read failure,
//! resuming from the last cursor it forwarded, until it is cancelled.
//!
//! ```text
//! Connecting ──ok──> Streaming ──eof/error/idle──> Disconnected
//!     ^                                                 │
//!     └──────────────────── delay ──────────────────────┘
//! any state ──cancel──> Cancelled
//! ```
//!
//! The cursor moves before an event is handed over, so an event whose
//! consumer fails is not requested again after a reconnect. Rows without a
//! sequence (see `seq_interval`) are delivered but leave the cursor where it
//! was, so a reconnect may replay them. Lines that are not change records
//! are logged and skipped.

use crate::bulk::DatabaseService;
use crate::codec::{self, JsonMap};
use crate::config::ChangeFeedConfig;
use crate::context::HttpContext;
use crate::error::{KouchError, KouchResult};
use crate::registry::TypeRegistry;
use futures::{FutureExt, TryStreamExt};
use kouch_types::{DatabaseName, DocId, Entity, Revision, Sequence};
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncBufReadExt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Default heartbeat interval in milliseconds.
pub const DEFAULT_HEARTBEAT_MS: u64 = 60_000;

/// Which leaf revisions each change lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangesStyle {
    /// Only the winning revision.
    #[default]
    MainOnly,
    /// Every leaf, conflicts and deleted conflicts included.
    AllDocs,
}

impl ChangesStyle {
    pub fn as_str(self) -> &'static str {
        match self {
            ChangesStyle::MainOnly => "main_only",
            ChangesStyle::AllDocs => "all_docs",
        }
    }
}

/// Options of a change-feed subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangesRequest {
    /// Restrict the feed to these ids. Sent in the request body.
    pub doc_ids: Vec<DocId>,
    pub conflicts: bool,
    pub descending: bool,
    /// Server-side filter. Defaults to `_doc_ids` when `doc_ids` is set.
    pub filter: Option<String>,
    /// Heartbeat interval (ms). Empty lines keep idle connections alive.
    pub heartbeat: u64,
    /// Embed the document in each change.
    pub include_docs: bool,
    pub attachments: bool,
    pub att_encoding_info: bool,
    pub last_event_id: Option<Sequence>,
    pub limit: Option<u64>,
    /// Where the first connection starts. Reconnects use the live cursor.
    pub since: Sequence,
    pub style: ChangesStyle,
    pub timeout: Option<u64>,
    pub view: Option<String>,
    pub seq_interval: Option<u64>,
}

impl Default for ChangesRequest {
    fn default() -> Self {
        Self {
            doc_ids: Vec::new(),
            conflicts: false,
            descending: false,
            filter: None,
            heartbeat: DEFAULT_HEARTBEAT_MS,
            include_docs: false,
            attachments: false,
            att_encoding_info: false,
            last_event_id: None,
            limit: None,
            since: Sequence::now(),
            style: ChangesStyle::MainOnly,
            timeout: None,
            view: None,
            seq_interval: None,
        }
    }
}

impl ChangesRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_doc_ids(mut self, ids: impl IntoIterator<Item = DocId>) -> Self {
        self.doc_ids = ids.into_iter().collect();
        self
    }

    pub fn with_include_docs(mut self, include_docs: bool) -> Self {
        self.include_docs = include_docs;
        self
    }

    pub fn with_since(mut self, since: impl Into<Sequence>) -> Self {
        self.since = since.into();
        self
    }

    pub fn with_heartbeat(mut self, heartbeat: Duration) -> Self {
        self.heartbeat = u64::try_from(heartbeat.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    pub fn with_style(mut self, style: ChangesStyle) -> Self {
        self.style = style;
        self
    }

    pub fn with_conflicts(mut self) -> Self {
        self.conflicts = true;
        self
    }

    /// Query pairs for a connection resuming at `since`.
    pub fn to_query(&self, since: &Sequence) -> Vec<(&'static str, String)> {
        let mut query = vec![
            ("feed", "continuous".to_string()),
            ("heartbeat", self.heartbeat.to_string()),
            ("since", since.to_string()),
            ("style", self.style.as_str().to_string()),
        ];
        let flags = [
            ("conflicts", self.conflicts),
            ("descending", self.descending),
            ("include_docs", self.include_docs),
            ("attachments", self.attachments),
            ("att_encoding_info", self.att_encoding_info),
        ];
        query.extend(
            flags
                .into_iter()
                .filter(|(_, on)| *on)
                .map(|(key, _)| (key, "true".to_string())),
        );
        if let Some(filter) = self.effective_filter() {
            query.push(("filter", filter.to_string()));
        }
        if let Some(id) = &self.last_event_id {
            query.push(("last-event-id", id.to_string()));
        }
        let numbers = [
            ("limit", self.limit),
            ("timeout", self.timeout),
            ("seq_interval", self.seq_interval),
        ];
        query.extend(
            numbers
                .into_iter()
                .filter_map(|(key, value)| value.map(|v| (key, v.to_string()))),
        );
        if let Some(view) = &self.view {
            query.push(("view", view.clone()));
        }
        query
    }

    fn effective_filter(&self) -> Option<&str> {
        match &self.filter {
            Some(filter) => Some(filter),
            None if !self.doc_ids.is_empty() => Some("_doc_ids"),
            None => None,
        }
    }

    /// Request body: the id filter, or an empty object.
    pub fn body(&self) -> Value {
        if self.doc_ids.is_empty() {
            json!({})
        } else {
            json!({ "doc_ids": self.doc_ids })
        }
    }

    fn idle_timeout(&self, config: &ChangeFeedConfig) -> Duration {
        config
            .idle_timeout
            .unwrap_or_else(|| Duration::from_millis(self.heartbeat.max(1).saturating_mul(2)))
    }
}

/// One entry of the change log.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent<E> {
    /// `None` on rows the server skipped when `seq_interval` is set.
    pub seq: Option<Sequence>,
    pub id: DocId,
    /// Leaf revisions after the change.
    pub changes: Vec<Revision>,
    pub deleted: bool,
    /// Decoded document, present only with `include_docs` on a live document
    /// that carries a discriminator.
    pub doc: Option<E>,
}

#[derive(Debug, Deserialize)]
struct ChangeLine {
    #[serde(default)]
    seq: Option<Sequence>,
    id: DocId,
    #[serde(default)]
    changes: Vec<ChangeRev>,
    #[serde(default)]
    deleted: bool,
    #[serde(default)]
    doc: Option<JsonMap>,
}

#[derive(Debug, Deserialize)]
struct ChangeRev {
    rev: Revision,
}

enum StreamEnd {
    /// Server closed the body.
    Closed,
    /// The consumer dropped its receiver.
    ConsumerGone,
}

struct FeedWorker<E> {
    ctx: Arc<HttpContext>,
    db: DatabaseName,
    request: ChangesRequest,
    registry: TypeRegistry<E>,
    config: ChangeFeedConfig,
    cursor: watch::Sender<Sequence>,
    events: mpsc::Sender<ChangeEvent<E>>,
    cancel: CancellationToken,
}

impl<E: Send + 'static> FeedWorker<E> {
    async fn run(self) -> KouchResult<()> {
        let mut delay = self.config.reconnect_delay;
        loop {
            let since = self.cursor.borrow().clone();
            info!(db = %self.db, since = %since, "connecting change feed");

            let mut delivered = 0u64;
            let attempt = tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!(db = %self.db, "change feed cancelled");
                    return Ok(());
                }
                result = self.stream_once(&since, &mut delivered) => result,
            };

            if delivered > 0 {
                delay = self.config.reconnect_delay;
            }
            let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
            match attempt {
                Ok(StreamEnd::ConsumerGone) => {
                    debug!(db = %self.db, "change feed receiver dropped");
                    return Ok(());
                }
                Ok(StreamEnd::Closed) => {
                    info!(db = %self.db, delay_ms, "change feed closed by server");
                }
                Err(KouchError::StreamTransient(reason)) => {
                    warn!(
                        db = %self.db,
                        delay_ms,
                        error = %reason,
                        "change feed interrupted, reconnecting"
                    );
                }
                Err(fatal) => {
                    error!(db = %self.db, error = %fatal, "change feed stopped");
                    return Err(fatal);
                }
            }

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!(db = %self.db, "change feed cancelled");
                    return Ok(());
                }
                _ = tokio::time::sleep(delay) => {}
            }
            delay = (delay * 2).min(self.config.max_reconnect_delay);
        }
    }

    async fn stream_once(&self, since: &Sequence, delivered: &mut u64) -> KouchResult<StreamEnd> {
        let idle = self.request.idle_timeout(&self.config);
        let send = self
            .ctx
            .stream_request(Method::POST, &[self.db.as_str(), "_changes"])
            .query(&self.request.to_query(since))
            .json(&self.request.body())
            .send();
        let response = tokio::time::timeout(idle, send)
            .await
            .map_err(|_| {
                KouchError::StreamTransient(format!("no response for {} ms", idle.as_millis()))
            })?
            .map_err(|e| KouchError::StreamTransient(format!("connect failed: {e}")))?;

        let status = response.status();
        if status != StatusCode::OK {
            let text = response.text().await.unwrap_or_default();
            return Err(KouchError::StreamTransient(format!(
                "unexpected status {status}: {text}"
            )));
        }

        let body = response.bytes_stream().map_err(std::io::Error::other);
        let mut lines = StreamReader::new(Box::pin(body)).lines();

        loop {
            let line = match tokio::time::timeout(idle, lines.next_line()).await {
                Err(_) => {
                    return Err(KouchError::StreamTransient(format!(
                        "no data for {} ms",
                        idle.as_millis()
                    )));
                }
                Ok(Err(e)) => {
                    return Err(KouchError::StreamTransient(format!("read failed: {e}")));
                }
                Ok(Ok(None)) => return Ok(StreamEnd::Closed),
                Ok(Ok(Some(line))) => line,
            };

            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let Some(event) = self.parse_line(line)? else {
                continue;
            };

            if let Some(seq) = &event.seq {
                self.cursor.send_replace(seq.clone());
            }
            if self.events.send(event).await.is_err() {
                return Ok(StreamEnd::ConsumerGone);
            }
            *delivered += 1;
        }
    }

    /// `Ok(None)` for lines that carry no change (errors, `last_seq`,
    /// anything that is not a change record).
    fn parse_line(&self, line: &str) -> KouchResult<Option<ChangeEvent<E>>> {
        let object: JsonMap = match serde_json::from_str(line) {
            Ok(object) => object,
            Err(e) => {
                warn!(db = %self.db, error = %e, "skipping malformed change line");
                return Ok(None);
            }
        };

        if let Some(err) = object.get("error") {
            warn!(
                db = %self.db,
                error = %err,
                reason = ?object.get("reason"),
                "change feed reported an error"
            );
            return Ok(None);
        }
        if object.contains_key("last_seq") {
            debug!(db = %self.db, last_seq = ?object.get("last_seq"), "change feed end marker");
            return Ok(None);
        }

        let change: ChangeLine = match serde_json::from_value(Value::Object(object)) {
            Ok(change) => change,
            Err(e) => {
                warn!(db = %self.db, error = %e, "skipping malformed change");
                return Ok(None);
            }
        };

        let doc = match change.doc {
            Some(document) if self.request.include_docs && !change.deleted => {
                let class_field = &self.ctx.config().class_field;
                if codec::class_of(&document, class_field).is_some() {
                    Some(self.registry.decode(document, class_field)?)
                } else {
                    debug!(db = %self.db, id = %change.id, "change without discriminator");
                    None
                }
            }
            _ => None,
        };

        Ok(Some(ChangeEvent {
            seq: change.seq,
            id: change.id,
            changes: change.changes.into_iter().map(|c| c.rev).collect(),
            deleted: change.deleted,
            doc,
        }))
    }
}

/// Pull-style handle to a running change feed.
///
/// Dropping the subscription cancels its worker.
#[derive(Debug)]
pub struct ChangeSubscription<E> {
    events: mpsc::Receiver<ChangeEvent<E>>,
    cursor: watch::Receiver<Sequence>,
    cancel: CancellationToken,
    worker: Option<JoinHandle<KouchResult<()>>>,
}

impl<E: Send + 'static> ChangeSubscription<E> {
    /// Next event in server order. `None` once the worker has stopped and
    /// buffered events are drained.
    pub async fn next(&mut self) -> Option<ChangeEvent<E>> {
        self.events.recv().await
    }

    /// Cursor of the last event handed to the channel.
    pub fn cursor(&self) -> Sequence {
        self.cursor.borrow().clone()
    }

    /// Requests shutdown. The worker stops at its next suspension point.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Waits for the worker to stop. Returns the decode failure that ended
    /// the feed, if any. Runs until cancelled otherwise.
    pub async fn join(mut self) -> KouchResult<()> {
        match self.worker.take() {
            Some(worker) => worker
                .await
                .map_err(|e| KouchError::WorkerFailed(e.to_string()))?,
            None => Ok(()),
        }
    }

    /// Cancels and waits for the worker.
    pub async fn shutdown(self) -> KouchResult<()> {
        self.cancel();
        self.join().await
    }
}

impl<E> Drop for ChangeSubscription<E> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Push-style handle returned by [`DatabaseService::changes_continuous`].
#[derive(Debug)]
pub struct ChangeHandle {
    cursor: watch::Receiver<Sequence>,
    cancel: CancellationToken,
    task: JoinHandle<KouchResult<()>>,
}

impl ChangeHandle {
    pub fn cursor(&self) -> Sequence {
        self.cursor.borrow().clone()
    }

    /// Stops the feed. A handler call in progress runs to completion.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Waits for the handler loop to end.
    pub async fn join(self) -> KouchResult<()> {
        self.task
            .await
            .map_err(|e| KouchError::WorkerFailed(e.to_string()))?
    }
}

impl DatabaseService {
    /// Follows `T`'s database with the default feed settings.
    pub fn changes<T: Entity>(
        &self,
        request: ChangesRequest,
    ) -> KouchResult<ChangeSubscription<T>> {
        let db = self.metadata.resolve::<T>()?.database_name;
        let registry = TypeRegistry::<T>::single(&self.metadata)?;
        self.subscribe(&db, request, registry, ChangeFeedConfig::default())
    }

    /// Starts a worker following `db`. Must be called inside a tokio runtime.
    pub fn subscribe<E: Send + 'static>(
        &self,
        db: &DatabaseName,
        request: ChangesRequest,
        registry: TypeRegistry<E>,
        config: ChangeFeedConfig,
    ) -> KouchResult<ChangeSubscription<E>> {
        if db.is_blank() {
            return Err(KouchError::InvariantViolation(
                "database name must not be blank".to_string(),
            ));
        }
        if request.doc_ids.iter().any(DocId::is_blank) {
            return Err(KouchError::InvariantViolation(
                "change feed doc_ids must not contain blank ids".to_string(),
            ));
        }

        let (events_tx, events_rx) = mpsc::channel(config.channel_capacity.max(1));
        let (cursor_tx, cursor_rx) = watch::channel(request.since.clone());
        let cancel = CancellationToken::new();

        let worker = FeedWorker {
            ctx: Arc::clone(&self.ctx),
            db: db.clone(),
            request,
            registry,
            config,
            cursor: cursor_tx,
            events: events_tx,
            cancel: cancel.clone(),
        };
        let handle = tokio::spawn(worker.run());

        Ok(ChangeSubscription {
            events: events_rx,
            cursor: cursor_rx,
            cancel,
            worker: Some(handle),
        })
    }

    /// Runs `handler` for every event, one call at a time in server order.
    ///
    /// A panicking handler is logged and the feed continues with the next
    /// event. Cancellation is observed between handler calls.
    pub fn changes_continuous<E, F, Fut>(
        &self,
        db: &DatabaseName,
        request: ChangesRequest,
        registry: TypeRegistry<E>,
        config: ChangeFeedConfig,
        mut handler: F,
    ) -> KouchResult<ChangeHandle>
    where
        E: Send + 'static,
        F: FnMut(ChangeEvent<E>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let mut subscription = self.subscribe(db, request, registry, config)?;
        let cancel = subscription.cancellation_token();
        let cursor = subscription.cursor.clone();
        let db = db.clone();

        let token = cancel.clone();
        let task = tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    event = subscription.next() => event,
                };
                let Some(event) = event else { break };
                let seq = event.seq.clone();
                if AssertUnwindSafe(async { handler(event).await })
                    .catch_unwind()
                    .await
                    .is_err()
                {
                    error!(db = %db, seq = ?seq, "change handler panicked");
                }
            }
            subscription.shutdown().await
        });

        Ok(ChangeHandle {
            cursor,
            cancel,
            task,
        })
    }
}
