use super::*;

fn sample_message(id: &str) -> Message {
    Message {
        id: id.to_string(),
        source_channel_id: "src-1".to_string(),
        content: "hello world".to_string(),
        attachments: vec![],
        sender: SenderInfo {
            id: "u1".to_string(),
            display_name: "User One".to_string(),
        },
        created_at: Utc::now(),
    }
}

#[test]
fn envelope_round_trip() {
    let msg = sample_message("m1");
    let payload = Envelope::encode(&msg).unwrap();
    let decoded = Envelope::decode(&payload).unwrap();
    assert_eq!(decoded.id, "m1");
    assert_eq!(decoded.content, "hello world");
    assert_eq!(decoded, msg);
}

#[test]
fn envelope_rejects_unknown_version() {
    let msg = sample_message("m2");
    let mut value: serde_json::Value =
        serde_json::from_str(&Envelope::encode(&msg).unwrap()).unwrap();
    value["version"] = serde_json::json!(99);
    let err = Envelope::decode(&value.to_string()).unwrap_err();
    assert!(err.to_string().contains("Unsupported envelope version"));
}

#[test]
fn envelope_rejects_garbage() {
    assert!(Envelope::decode("not json").is_err());
    assert!(Envelope::decode("{}").is_err());
}

#[test]
fn message_optional_fields_default() {
    let raw = serde_json::json!({
        "id": "m3",
        "source_channel_id": "src-2",
        "content": "hi",
        "sender": {"id": "u2"},
        "created_at": "2026-01-02T03:04:05Z",
    });
    let msg: Message = serde_json::from_value(raw).unwrap();
    assert!(msg.attachments.is_empty());
    assert_eq!(msg.sender.display_name, "");
}

#[test]
fn message_status_round_trip() {
    for status in [
        MessageStatus::Pending,
        MessageStatus::Processing,
        MessageStatus::Success,
        MessageStatus::Failed,
    ] {
        assert_eq!(MessageStatus::parse(status.as_str()), Some(status));
    }
    assert_eq!(MessageStatus::parse("bogus"), None);
}
