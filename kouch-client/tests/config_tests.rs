use kouch_client::{
    DEFAULT_CLASS_FIELD, DatabaseName, DatabaseNaming, ErrorResponse, KouchClient, KouchConfig,
    KouchError, NullFieldPolicy,
};
use pretty_assertions::assert_eq;

// ── Config defaults ─────────────────────────────────────────────

#[test]
fn kouch_config_default() {
    let cfg = KouchConfig::default();
    assert_eq!(cfg.base_url, "http://localhost:5984");
    assert_eq!(cfg.class_field, DEFAULT_CLASS_FIELD);
    assert_eq!(cfg.database_naming, DatabaseNaming::PerType);
    assert_eq!(cfg.null_fields, NullFieldPolicy::Keep);
    assert_eq!(cfg.request_timeout_secs, 60);
    assert!(cfg.username.is_none());
    assert!(cfg.predefined_database().is_none());
}

#[test]
fn kouch_config_serde_fills_defaults() {
    let cfg: KouchConfig = serde_json::from_str(
        r#"{"base_url":"http://db:5984","database_naming":{"mode":"predefined","database":"app"}}"#,
    )
    .unwrap();
    assert_eq!(cfg.base_url, "http://db:5984");
    assert_eq!(cfg.predefined_database(), Some(&DatabaseName::new("app")));
    assert_eq!(cfg.class_field, "class__");
    assert_eq!(cfg.connect_timeout_secs, 60);
}

#[test]
fn kouch_config_builders() {
    let cfg = KouchConfig::new("http://x")
        .with_credentials("admin", "secret")
        .with_predefined_database("shared");
    assert_eq!(cfg.username.as_deref(), Some("admin"));
    assert_eq!(cfg.password.as_deref(), Some("secret"));
    assert_eq!(cfg.predefined_database(), Some(&DatabaseName::new("shared")));
}

#[test]
fn client_rejects_blank_settings() {
    let err = KouchClient::new(KouchConfig::new("")).unwrap_err();
    assert!(matches!(err, KouchError::Config(_)));

    let cfg = KouchConfig {
        class_field: " ".to_string(),
        ..KouchConfig::default()
    };
    assert!(matches!(KouchClient::new(cfg), Err(KouchError::Config(_))));
}

// ── Errors ──────────────────────────────────────────────────────

#[test]
fn error_response_display() {
    let with_reason = ErrorResponse {
        error: "conflict".to_string(),
        reason: Some("Document update conflict.".to_string()),
    };
    assert_eq!(with_reason.to_string(), "conflict: Document update conflict.");

    let bare = ErrorResponse {
        error: "not_found".to_string(),
        reason: None,
    };
    assert_eq!(bare.to_string(), "not_found");
}

#[test]
fn non_server_errors_have_no_status() {
    let err = KouchError::InvariantViolation("blank id".to_string());
    assert_eq!(err.status(), None);
    assert!(!err.is_conflict());
    assert!(!err.is_not_found());
    assert_eq!(err.to_string(), "invariant violation: blank id");
}
