use super::*;
use clap::CommandFactory;
use std::path::Path;

#[test]
fn cli_definition_is_valid() {
    Cli::command().debug_assert();
}

#[test]
fn defaults_to_run_when_no_subcommand() {
    let cli = Cli::parse_from(["fanout"]);
    assert!(cli.command.is_none());
    assert!(cli.config.is_none());
}

#[test]
fn config_flag_is_global() {
    let cli = Cli::parse_from(["fanout", "status", "--config", "/tmp/fanout.json"]);
    assert!(matches!(cli.command, Some(Commands::Status)));
    assert_eq!(cli.config.as_deref(), Some(Path::new("/tmp/fanout.json")));
}

#[test]
fn ingest_record_fills_omitted_fields() {
    let record: IngestRecord =
        serde_json::from_str(r#"{"source_channel_id":"src-1","content":"hi"}"#).unwrap();
    let message = record.into_message();
    assert!(!message.id.is_empty());
    assert_eq!(message.source_channel_id, "src-1");
    assert_eq!(message.content, "hi");
    assert!(message.attachments.is_empty());
    assert_eq!(message.sender.id, "unknown");
}

#[test]
fn ingest_record_keeps_producer_id() {
    let record: IngestRecord = serde_json::from_str(
        r#"{"id":"m1","source_channel_id":"src-1","content":"hi",
            "sender":{"id":"u1","display_name":"User"},
            "created_at":"2026-01-02T03:04:05Z"}"#,
    )
    .unwrap();
    let message = record.into_message();
    assert_eq!(message.id, "m1");
    assert_eq!(message.sender.display_name, "User");
    assert_eq!(message.created_at.to_rfc3339(), "2026-01-02T03:04:05+00:00");
}

#[test]
fn build_senders_skips_disabled_platforms() {
    let mut config = Config::default();
    config.senders.insert(
        "discord".to_string(),
        crate::config::WebhookSenderConfig {
            url: "http://localhost/hook".to_string(),
            enabled: true,
        },
    );
    config.senders.insert(
        "telegram".to_string(),
        crate::config::WebhookSenderConfig {
            url: "http://localhost/hook".to_string(),
            enabled: false,
        },
    );

    let registry = build_senders(&config).unwrap();
    assert_eq!(registry.platforms(), vec!["discord"]);
}

#[test]
fn unreadable_config_maps_to_config_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fanout.json");
    std::fs::write(&path, "{ not json").unwrap();

    let err = load_cli_config(Some(&path)).unwrap_err();
    assert!(matches!(err, FanoutError::Config(_)));
    assert!(err.to_string().contains("Failed to parse config JSON"));
}

#[tokio::test]
async fn pipeline_startup_maps_store_failure() {
    // A regular file where the db's parent directory should be makes the
    // store unopenable.
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("data");
    std::fs::write(&blocker, "").unwrap();

    let mut config = Config::default();
    config.storage.db_path = blocker.join("fanout.db");
    config.storage.fallback_dir = dir.path().join("fallback");
    config.storage.snapshot_dir = dir.path().join("snapshots");

    let err = run_pipeline(config).await.unwrap_err();
    assert!(matches!(err, FanoutError::Store(_)));
}
