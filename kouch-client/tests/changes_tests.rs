mod common;

use common::{TestEntity, fast_feed, mock_client};
use kouch_client::{
    ChangeEvent, ChangeFeedConfig, ChangeSubscription, ChangesRequest, ChangesStyle, DatabaseName,
    DocId, KouchError, Revision, Sequence, TypeRegistry,
};
use pretty_assertions::assert_eq;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use wiremock::matchers::{body_json, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const WAIT: Duration = Duration::from_secs(5);

fn line(seq: &str, id: &str, rev: &str) -> String {
    format!(r#"{{"seq":"{seq}","id":"{id}","changes":[{{"rev":"{rev}"}}]}}"#)
}

fn feed_body(lines: &[String]) -> String {
    let mut body = lines.join("\n");
    body.push('\n');
    body
}

async fn mount_feed(server: &MockServer, since: &str, body: String) {
    Mock::given(method("POST"))
        .and(path("/test_entity/_changes"))
        .and(query_param("feed", "continuous"))
        .and(query_param("since", since))
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .mount(server)
        .await;
}

async fn next_event<E: Send + 'static>(sub: &mut ChangeSubscription<E>) -> ChangeEvent<E> {
    tokio::time::timeout(WAIT, sub.next())
        .await
        .expect("timed out waiting for change")
        .expect("feed ended")
}

fn subscribe(
    server: &MockServer,
    request: ChangesRequest,
) -> ChangeSubscription<TestEntity> {
    let client = mock_client(server);
    let registry = TypeRegistry::<TestEntity>::single(client.metadata()).unwrap();
    client
        .db()
        .subscribe(&DatabaseName::new("test_entity"), request, registry, fast_feed())
        .unwrap()
}

async fn since_values(server: &MockServer) -> Vec<String> {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter_map(|r| {
            r.url
                .query_pairs()
                .find(|(k, _)| k == "since")
                .map(|(_, v)| v.into_owned())
        })
        .collect()
}

// ── Request shape ───────────────────────────────────────────────

#[test]
fn changes_request_defaults() {
    let request = ChangesRequest::default();
    assert_eq!(request.heartbeat, 60_000);
    assert_eq!(request.since, Sequence::now());
    assert_eq!(request.style, ChangesStyle::MainOnly);
    assert_eq!(
        request.to_query(&request.since),
        vec![
            ("feed", "continuous".to_string()),
            ("heartbeat", "60000".to_string()),
            ("since", "now".to_string()),
            ("style", "main_only".to_string()),
        ]
    );
    assert_eq!(request.body(), serde_json::json!({}));
}

#[test]
fn doc_ids_imply_filter_unless_set() {
    let request = ChangesRequest::new().with_doc_ids([DocId::new("a")]);
    let query = request.to_query(&Sequence::zero());
    assert!(query.contains(&("filter", "_doc_ids".to_string())));
    assert!(query.contains(&("since", "0".to_string())));

    let custom = request.clone().with_filter("app/by_type");
    assert!(custom
        .to_query(&Sequence::zero())
        .contains(&("filter", "app/by_type".to_string())));
}

#[test]
fn optional_parameters_are_sent() {
    let request = ChangesRequest {
        include_docs: true,
        conflicts: true,
        limit: Some(10),
        seq_interval: Some(5),
        last_event_id: Some(Sequence::new("7-x")),
        style: ChangesStyle::AllDocs,
        ..ChangesRequest::default()
    };
    let query = request.to_query(&Sequence::now());
    for pair in [
        ("include_docs", "true"),
        ("conflicts", "true"),
        ("limit", "10"),
        ("seq_interval", "5"),
        ("last-event-id", "7-x"),
        ("style", "all_docs"),
    ] {
        assert!(query.contains(&(pair.0, pair.1.to_string())), "{pair:?}");
    }
}

#[tokio::test]
async fn doc_ids_are_posted_in_body() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/test_entity/_changes"))
        .and(query_param("filter", "_doc_ids"))
        .and(body_json(serde_json::json!({"doc_ids": ["a", "b"]})))
        .respond_with(
            ResponseTemplate::new(200).set_body_string(feed_body(&[line("1-x", "a", "1-a")])),
        )
        .mount(&server)
        .await;

    let mut sub = subscribe(
        &server,
        ChangesRequest::new().with_doc_ids([DocId::new("a"), DocId::new("b")]),
    );
    let event = next_event(&mut sub).await;
    assert_eq!(event.id, DocId::new("a"));
    sub.shutdown().await.unwrap();
}

// ── Delivery ────────────────────────────────────────────────────

#[tokio::test]
async fn five_changes_arrive_in_order() {
    let server = MockServer::start().await;
    let lines: Vec<String> = (1..=5)
        .map(|i| line(&format!("{i}-s"), &format!("doc{i}"), &format!("1-{i}")))
        .collect();
    mount_feed(&server, "now", feed_body(&lines)).await;
    mount_feed(&server, "5-s", String::new()).await;

    let mut sub = subscribe(&server, ChangesRequest::new());
    let mut seen = Vec::new();
    for _ in 0..5 {
        let event = next_event(&mut sub).await;
        assert_eq!(event.changes.len(), 1);
        assert!(!event.deleted);
        assert_eq!(event.doc, None);
        seen.push(event.seq.unwrap().to_string());
    }

    assert_eq!(seen, vec!["1-s", "2-s", "3-s", "4-s", "5-s"]);
    assert_eq!(sub.cursor(), Sequence::new("5-s"));
    sub.shutdown().await.unwrap();
}

#[tokio::test]
async fn reconnect_resumes_from_cursor() {
    let server = MockServer::start().await;
    mount_feed(
        &server,
        "now",
        feed_body(&[line("1-a", "x", "1-x"), line("2-b", "y", "1-y")]),
    )
    .await;
    mount_feed(&server, "2-b", feed_body(&[line("3-c", "z", "1-z")])).await;
    mount_feed(&server, "3-c", String::new()).await;

    let mut sub = subscribe(&server, ChangesRequest::new());
    let seqs: Vec<String> = {
        let mut out = Vec::new();
        for _ in 0..3 {
            out.push(next_event(&mut sub).await.seq.unwrap().to_string());
        }
        out
    };
    assert_eq!(seqs, vec!["1-a", "2-b", "3-c"]);
    sub.shutdown().await.unwrap();

    let since = since_values(&server).await;
    assert_eq!(since[0], "now");
    assert_eq!(since[1], "2-b");
    assert!(since[2..].iter().all(|s| s == "3-c"), "{since:?}");
}

#[tokio::test]
async fn server_errors_trigger_reconnect() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/test_entity/_changes"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .with_priority(1)
        .mount(&server)
        .await;
    mount_feed(&server, "now", feed_body(&[line("1-a", "x", "1-x")])).await;
    mount_feed(&server, "1-a", String::new()).await;

    let mut sub = subscribe(&server, ChangesRequest::new());
    let event = next_event(&mut sub).await;
    assert_eq!(event.seq, Some(Sequence::new("1-a")));
    sub.shutdown().await.unwrap();
}

#[tokio::test]
async fn error_lines_and_heartbeats_are_skipped() {
    let server = MockServer::start().await;
    let body = [
        String::new(),
        r#"{"error":"unauthorized","reason":"nope"}"#.to_string(),
        String::new(),
        line("1-a", "x", "1-x"),
        r#"{"last_seq":"1-a","pending":0}"#.to_string(),
    ];
    mount_feed(&server, "now", feed_body(&body)).await;
    mount_feed(&server, "1-a", String::new()).await;

    let mut sub = subscribe(&server, ChangesRequest::new());
    let event = next_event(&mut sub).await;
    assert_eq!(event.id, DocId::new("x"));
    assert_eq!(event.changes, vec![Revision::new("1-x")]);
    assert_eq!(sub.cursor(), Sequence::new("1-a"));
    sub.shutdown().await.unwrap();
}

#[tokio::test]
async fn numeric_sequences_are_accepted() {
    let server = MockServer::start().await;
    mount_feed(
        &server,
        "now",
        feed_body(&[r#"{"seq":42,"id":"x","changes":[{"rev":"1-x"}]}"#.to_string()]),
    )
    .await;
    mount_feed(&server, "42", String::new()).await;

    let mut sub = subscribe(&server, ChangesRequest::new());
    assert_eq!(next_event(&mut sub).await.seq, Some(Sequence::new("42")));
    sub.shutdown().await.unwrap();
}

#[tokio::test]
async fn null_sequences_are_delivered_without_moving_cursor() {
    let server = MockServer::start().await;
    let body = [
        r#"{"seq":null,"id":"a","changes":[{"rev":"1-a"}]}"#.to_string(),
        line("2-b", "b", "1-b"),
    ];
    mount_feed(&server, "now", feed_body(&body)).await;
    mount_feed(&server, "2-b", String::new()).await;

    let request = ChangesRequest {
        seq_interval: Some(2),
        ..ChangesRequest::new()
    };
    let mut sub = subscribe(&server, request);

    let unnumbered = next_event(&mut sub).await;
    assert_eq!(unnumbered.id, DocId::new("a"));
    assert_eq!(unnumbered.seq, None);

    let numbered = next_event(&mut sub).await;
    assert_eq!(numbered.id, DocId::new("b"));
    assert_eq!(numbered.seq, Some(Sequence::new("2-b")));
    assert_eq!(sub.cursor(), Sequence::new("2-b"));
    sub.shutdown().await.unwrap();
}

#[tokio::test]
async fn malformed_lines_are_skipped_without_reconnecting() {
    let server = MockServer::start().await;
    let body = [
        "{not json".to_string(),
        "[1, 2, 3]".to_string(),
        r#"{"seq":"0-z","changes":"oops"}"#.to_string(),
        line("1-a", "x", "1-x"),
    ];
    mount_feed(&server, "now", feed_body(&body)).await;
    mount_feed(&server, "1-a", String::new()).await;

    let mut sub = subscribe(&server, ChangesRequest::new());
    let event = next_event(&mut sub).await;
    assert_eq!(event.id, DocId::new("x"));
    assert_eq!(sub.cursor(), Sequence::new("1-a"));
    sub.shutdown().await.unwrap();

    let since = since_values(&server).await;
    assert_eq!(since.iter().filter(|s| *s == "now").count(), 1, "{since:?}");
}

#[tokio::test]
async fn idle_stream_reconnects_from_cursor() {
    let server = MockServer::start().await;
    mount_feed(&server, "now", feed_body(&[line("1-a", "x", "1-x")])).await;
    Mock::given(method("POST"))
        .and(path("/test_entity/_changes"))
        .and(query_param("since", "1-a"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(feed_body(&[line("2-b", "y", "1-y")]))
                .set_delay(Duration::from_secs(30)),
        )
        .mount(&server)
        .await;

    let client = mock_client(&server);
    let registry = TypeRegistry::<TestEntity>::single(client.metadata()).unwrap();
    let config = ChangeFeedConfig {
        idle_timeout: Some(Duration::from_millis(100)),
        ..fast_feed()
    };
    let mut sub = client
        .db()
        .subscribe(&DatabaseName::new("test_entity"), ChangesRequest::new(), registry, config)
        .unwrap();

    assert_eq!(next_event(&mut sub).await.seq, Some(Sequence::new("1-a")));

    tokio::time::timeout(WAIT, async {
        while since_values(&server).await.iter().filter(|s| *s == "1-a").count() < 2 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("stalled stream was not retried");

    assert_eq!(sub.cursor(), Sequence::new("1-a"));
    sub.shutdown().await.unwrap();
}

// ── Embedded documents ──────────────────────────────────────────

#[tokio::test]
async fn include_docs_decodes_live_documents() {
    let server = MockServer::start().await;
    let body = [
        r#"{"seq":"1-a","id":"a1","changes":[{"rev":"1-r"}],"doc":{"_id":"a1","_rev":"1-r","label":"x","count":2,"class__":"TestEntity"}}"#.to_string(),
        r#"{"seq":"2-a","id":"a2","changes":[{"rev":"2-r"}],"deleted":true,"doc":{"_id":"a2","_rev":"2-r","_deleted":true}}"#.to_string(),
        r#"{"seq":"3-a","id":"_design/app","changes":[{"rev":"1-d"}],"doc":{"_id":"_design/app","_rev":"1-d","views":{}}}"#.to_string(),
    ];
    mount_feed(&server, "now", feed_body(&body)).await;
    mount_feed(&server, "3-a", String::new()).await;

    let mut sub = subscribe(&server, ChangesRequest::new().with_include_docs(true));

    let live = next_event(&mut sub).await;
    assert_eq!(
        live.doc,
        Some(TestEntity {
            count: 2,
            ..TestEntity::persisted("a1", "1-r", "x")
        })
    );

    let deleted = next_event(&mut sub).await;
    assert!(deleted.deleted);
    assert_eq!(deleted.doc, None);

    let design = next_event(&mut sub).await;
    assert_eq!(design.id, DocId::new("_design/app"));
    assert_eq!(design.doc, None);

    sub.shutdown().await.unwrap();
}

#[tokio::test]
async fn unknown_class_ends_subscription() {
    let server = MockServer::start().await;
    let body = [
        line("1-a", "ok", "1-o"),
        r#"{"seq":"2-a","id":"g","changes":[{"rev":"1-g"}],"doc":{"_id":"g","_rev":"1-g","class__":"Ghost"}}"#.to_string(),
    ];
    mount_feed(&server, "now", feed_body(&body)).await;

    let mut sub = subscribe(&server, ChangesRequest::new().with_include_docs(true));
    assert_eq!(next_event(&mut sub).await.seq, Some(Sequence::new("1-a")));

    let end = tokio::time::timeout(WAIT, sub.next()).await.unwrap();
    assert!(end.is_none());

    let err = sub.join().await.unwrap_err();
    assert!(matches!(err, KouchError::UnknownClass { class, .. } if class == "Ghost"));
}

// ── Cancellation ────────────────────────────────────────────────

#[tokio::test]
async fn cancel_stops_reconnect_loop() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let sub = subscribe(&server, ChangesRequest::new());
    tokio::time::sleep(Duration::from_millis(50)).await;
    sub.cancel();
    assert!(sub.is_cancelled());

    let joined = tokio::time::timeout(WAIT, sub.join()).await.unwrap();
    assert!(joined.is_ok());
}

#[tokio::test]
async fn cancel_interrupts_open_stream() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(feed_body(&[line("1-a", "x", "1-x")]))
                .set_delay(Duration::from_secs(30)),
        )
        .mount(&server)
        .await;

    let sub = subscribe(&server, ChangesRequest::new());
    tokio::time::sleep(Duration::from_millis(50)).await;

    let started = std::time::Instant::now();
    tokio::time::timeout(WAIT, sub.shutdown()).await.unwrap().unwrap();
    assert!(started.elapsed() < WAIT);
}

// ── Push-style handler ──────────────────────────────────────────

#[tokio::test]
async fn continuous_handler_survives_panics() {
    let server = MockServer::start().await;
    let body = [
        line("1-a", "boom", "1-x"),
        line("2-a", "y", "1-y"),
        line("3-a", "z", "1-z"),
    ];
    mount_feed(&server, "now", feed_body(&body)).await;
    mount_feed(&server, "3-a", String::new()).await;

    let client = mock_client(&server);
    let registry = TypeRegistry::<TestEntity>::single(client.metadata()).unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);

    let handle = client
        .db()
        .changes_continuous(
            &DatabaseName::new("test_entity"),
            ChangesRequest::new(),
            registry,
            fast_feed(),
            move |event: ChangeEvent<TestEntity>| {
                let sink = Arc::clone(&sink);
                async move {
                    if event.id.as_str() == "boom" {
                        panic!("handler failure");
                    }
                    sink.lock().unwrap().push(event.seq.unwrap().to_string());
                }
            },
        )
        .unwrap();

    tokio::time::timeout(WAIT, async {
        while seen.lock().unwrap().len() < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    assert_eq!(*seen.lock().unwrap(), vec!["2-a", "3-a"]);
    assert_eq!(handle.cursor(), Sequence::new("3-a"));

    handle.cancel();
    tokio::time::timeout(WAIT, handle.join()).await.unwrap().unwrap();
}

#[tokio::test]
async fn typed_changes_use_resolved_database() {
    let server = MockServer::start().await;
    mount_feed(&server, "0", feed_body(&[line("1-a", "x", "1-x")])).await;
    mount_feed(&server, "1-a", String::new()).await;

    let client = mock_client(&server);
    let mut sub = client
        .db()
        .changes::<TestEntity>(ChangesRequest::new().with_since(Sequence::zero()))
        .unwrap();
    assert_eq!(next_event(&mut sub).await.id, DocId::new("x"));
    sub.shutdown().await.unwrap();
}
