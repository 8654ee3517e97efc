use super::*;

fn msg(id: i64, from: i64, to: i64) -> Message {
    Message {
        id: MessageId(id),
        sender_id: UserId(from),
        recipient_id: UserId(to),
        content: "x".into(),
        created_at: String::new(),
    }
}

#[test]
fn conversation_key_is_unordered() {
    assert_eq!(ConversationKey::new(UserId(1), UserId(2)), ConversationKey::new(UserId(2), UserId(1)));
    assert_ne!(ConversationKey::new(UserId(1), UserId(2)), ConversationKey::new(UserId(1), UserId(3)));
}

#[test]
fn conversation_key_contains_both_directions() {
    let key = ConversationKey::new(UserId(1), UserId(2));
    assert!(key.contains(&msg(1, 1, 2)));
    assert!(key.contains(&msg(2, 2, 1)));
    assert!(!key.contains(&msg(3, 2, 3)));
    assert!(!key.contains(&msg(4, 1, 1)));
}

#[test]
fn message_accepts_snake_and_camel_case() {
    let rest: Message = serde_json::from_value(serde_json::json!({
        "id": 10, "sender_id": 2, "recipient_id": 1, "content": "hi", "created_at": "2024-01-01T00:00:00Z"
    }))
    .unwrap();
    let live: Message = serde_json::from_value(serde_json::json!({
        "id": 10, "senderId": 2, "recipientId": 1, "content": "hi", "createdAt": "2024-01-01T00:00:00Z"
    }))
    .unwrap();
    assert_eq!(rest, live);
    assert_eq!(rest.sender_id, UserId(2));
}

#[test]
fn message_created_at_is_optional() {
    let m: Message = serde_json::from_value(serde_json::json!({
        "id": 1, "sender_id": 2, "recipient_id": 1, "content": "hi"
    }))
    .unwrap();
    assert!(m.created_at.is_empty());
}

#[test]
fn session_debug_redacts_token() {
    let session = Session::new(UserId(1), "ann", "secret-token");
    let rendered = format!("{session:?}");
    assert!(!rendered.contains("secret-token"));
    assert!(rendered.contains("ann"));
}

#[test]
fn session_requires_non_blank_token() {
    assert!(Session::new(UserId(1), "ann", "t").is_authenticated());
    assert!(!Session::new(UserId(1), "ann", "   ").is_authenticated());
}

#[test]
fn defaults_are_conservative() {
    assert_eq!(PresenceState::default(), PresenceState::Offline);
    assert_eq!(TypingState::default(), TypingState::Idle);
    assert_eq!(ConnectionState::default(), ConnectionState::Disconnected);
}

#[test]
fn presence_state_parses_lowercase() {
    let online: PresenceState = serde_json::from_value(serde_json::json!("online")).unwrap();
    assert_eq!(online, PresenceState::Online);
    assert_eq!(PresenceState::Offline.to_string(), "offline");
}
