//! Argument handling and output formatting for `kouch-tail`.

use anyhow::{Context, Result};
use clap::Parser;
use kouch_client::codec::JsonMap;
use kouch_client::{
    ChangeEvent, ChangeFeedConfig, ChangesRequest, ChangesStyle, DatabaseName, DocId,
    KouchClient, KouchConfig, Sequence, TypeRegistry,
};
use serde_json::{Value, json};
use std::io::Write;
use std::time::Duration;
use tracing::info;

#[derive(Parser, Debug, Clone)]
#[command(name = "kouch-tail")]
#[command(about = "Follow a database's change feed and print one JSON line per change")]
pub struct Args {
    /// Database to follow
    pub db: String,

    /// Server base URL
    #[arg(long, default_value = "http://localhost:5984")]
    pub url: String,

    /// Basic-auth user name
    #[arg(short, long)]
    pub user: Option<String>,

    /// Basic-auth password
    #[arg(short, long, env = "KOUCH_PASSWORD")]
    pub password: Option<String>,

    /// Start position ("now", "0" or a sequence)
    #[arg(long, default_value = "now")]
    pub since: String,

    /// Embed documents in the output
    #[arg(long)]
    pub include_docs: bool,

    /// Only follow these document ids (repeatable)
    #[arg(long = "doc-id")]
    pub doc_ids: Vec<String>,

    /// Server-side filter function (`ddoc/name`)
    #[arg(long)]
    pub filter: Option<String>,

    /// List every leaf revision instead of the winner only
    #[arg(long)]
    pub all_docs: bool,

    /// Heartbeat interval in milliseconds
    #[arg(long, default_value = "60000")]
    pub heartbeat_ms: u64,

    /// Discriminator key of stored entities
    #[arg(long, default_value = kouch_client::DEFAULT_CLASS_FIELD)]
    pub class_field: String,

    /// Exit after printing this many changes
    #[arg(short = 'n', long)]
    pub max_events: Option<usize>,

    /// Enable verbose debug logging
    #[arg(short, long)]
    pub verbose: bool,
}

impl Args {
    pub fn client_config(&self) -> KouchConfig {
        let mut config = KouchConfig::new(self.url.clone());
        config.username = self.user.clone();
        config.password = self.password.clone();
        config.class_field = self.class_field.clone();
        config
    }

    pub fn changes_request(&self) -> ChangesRequest {
        let mut request = ChangesRequest::new()
            .with_since(Sequence::new(self.since.clone()))
            .with_include_docs(self.include_docs)
            .with_heartbeat(Duration::from_millis(self.heartbeat_ms))
            .with_doc_ids(self.doc_ids.iter().map(|id| DocId::new(id.as_str())));
        if let Some(filter) = &self.filter {
            request = request.with_filter(filter.clone());
        }
        if self.all_docs {
            request = request.with_style(ChangesStyle::AllDocs);
        }
        request
    }
}

/// One output line. `doc` is present only when the change embedded a
/// document with a discriminator.
pub fn format_event(event: &ChangeEvent<JsonMap>) -> Value {
    let mut line = json!({
        "seq": event.seq,
        "id": event.id,
        "changes": event.changes,
        "deleted": event.deleted,
    });
    if let (Some(doc), Value::Object(map)) = (&event.doc, &mut line) {
        map.insert("doc".to_string(), Value::Object(doc.clone()));
    }
    line
}

/// Follows the feed, writing one line per change to `out`, until
/// `max_events` is reached, the feed fails or `shutdown` resolves.
pub async fn tail<W, S>(args: &Args, out: &mut W, shutdown: S) -> Result<usize>
where
    W: Write,
    S: std::future::Future<Output = ()>,
{
    let client = KouchClient::new(args.client_config()).context("invalid client settings")?;
    let db = DatabaseName::parse(args.db.as_str()).context("database name")?;
    let registry = TypeRegistry::<JsonMap>::new().with_fallback(|doc| doc);
    let mut subscription = client
        .db()
        .subscribe(&db, args.changes_request(), registry, ChangeFeedConfig::default())
        .context("failed to start change feed")?;

    info!("following {} from {}", db, args.since);
    tokio::pin!(shutdown);

    let mut printed = 0usize;
    while args.max_events.is_none_or(|max| printed < max) {
        let event = tokio::select! {
            _ = &mut shutdown => break,
            event = subscription.next() => event,
        };
        let Some(event) = event else { break };
        writeln!(out, "{}", format_event(&event)).context("failed to write output")?;
        out.flush().context("failed to flush output")?;
        printed += 1;
    }

    info!("stopping at {} after {} changes", subscription.cursor(), printed);
    subscription
        .shutdown()
        .await
        .context("change feed stopped with an error")?;
    Ok(printed)
}
