//! End-to-end flows through the public store API
//!
//! Each test drives a [`ConversationStore`] against the scripted mock API and
//! checks what a renderer would see afterwards.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use pretty_assertions::assert_eq;

use parley_core::test_utils::{remote_message, MockChatApi, StreamScript};
use parley_core::{
    ClientConfig, Conversation, ConversationId, ConversationStore, PersistedState, PromptType,
    SessionState, StoreEvent,
};

fn setup() -> (Arc<MockChatApi>, ConversationStore) {
    let mut config = ClientConfig::new();
    config.store.settle_pause = Duration::ZERO;
    config.pagination.min_fetch_spacing = Duration::ZERO;

    let api = Arc::new(MockChatApi::new());
    let store = ConversationStore::new(api.clone(), &config, PersistedState::in_memory());
    (api, store)
}

fn frame(event: &str, data: &str) -> Vec<u8> {
    format!("event: {event}\ndata: {data}\n\n").into_bytes()
}

fn push(tx: &StreamScript, bytes: Vec<u8>) {
    tx.send(Ok(bytes)).expect("session dropped its body");
}

// =============================================================================
// A reply streams into a fresh conversation
// =============================================================================

#[tokio::test]
async fn test_reply_streams_into_fresh_conversation() {
    let (api, store) = setup();
    let tx = api.script_stream();

    let ticket = store
        .send_message(None, "Hello", Vec::new(), PromptType::Default)
        .await
        .unwrap();

    push(&tx, frame("ai_start", "{}"));
    push(&tx, frame("ai_chunk", r#"{"content":"Hi","fullContent":"Hi"}"#));
    push(&tx, frame("ai_chunk", r#"{"content":" there!","fullContent":"Hi there!"}"#));
    push(&tx, frame("ai_complete", r#"{"text":"Hi there!"}"#));

    assert_eq!(ticket.handle.finished().await, SessionState::Completed);

    let messages = store.messages(&ticket.conversation_id);
    let summary: Vec<(bool, &str)> = messages.iter().map(|m| (m.is_user, m.text.as_str())).collect();
    assert_eq!(summary, vec![(true, "Hello"), (false, "Hi there!")]);
    assert!(messages.iter().all(|m| !m.is_streaming && !m.is_thinking));
    assert!(!messages.iter().any(|m| m.id.as_str().starts_with("stream_")));

    // The first user text named the conversation
    let conversation = store.conversation(&ticket.conversation_id).unwrap();
    assert_eq!(conversation.title, "Hello");
}

#[tokio::test]
async fn test_completion_split_across_reads_without_delimiter() {
    let (api, store) = setup();
    let id = ConversationId::new("c1");
    store.upsert_conversation(Conversation::new(id.clone(), "Split"));
    let tx = api.script_stream();

    let ticket = store
        .send_message(Some(id.clone()), "Hello", Vec::new(), PromptType::Default)
        .await
        .unwrap();

    push(&tx, b"event: ai_comp".to_vec());
    push(&tx, b"lete\ndata: {\"fullContent\":\"Do".to_vec());
    push(&tx, "ne ✓\"}".as_bytes().to_vec());
    drop(tx);

    assert_eq!(ticket.handle.finished().await, SessionState::Completed);
    let messages = store.messages(&id);
    assert_eq!(messages.last().map(|m| m.text.as_str()), Some("Done ✓"));
}

// =============================================================================
// Paging back through history
// =============================================================================

#[tokio::test]
async fn test_two_pages_merge_in_order() {
    let (api, store) = setup();
    let id = ConversationId::new("c1");
    let base = Utc::now() - ChronoDuration::hours(1);
    let at = |minutes: i64| base + ChronoDuration::minutes(minutes);

    api.set_messages(
        &id,
        1,
        2,
        vec![
            remote_message("m4", "four", false, at(4)),
            remote_message("m5", "five", true, at(5)),
            remote_message("m6", "six", false, at(6)),
        ],
    );
    api.set_messages(
        &id,
        2,
        2,
        vec![
            remote_message("m1", "one", true, at(1)),
            remote_message("m2", "two", false, at(2)),
            remote_message("m3", "three", true, at(3)),
        ],
    );

    let first = store.load_messages(&id, 1, 3, false).await.unwrap();
    assert_eq!(first.len(), 3);
    assert!(store.cursor(&id).has_more);

    let merged = store.load_messages(&id, 2, 3, false).await.unwrap();
    assert!(!store.cursor(&id).has_more);

    let order: Vec<&str> = merged.iter().map(|m| m.text.as_str()).collect();
    assert_eq!(order, vec!["one", "two", "three", "four", "five", "six"]);
    assert_eq!(store.conversation(&id).unwrap().total_message_count, 6);
}

// =============================================================================
// Cancelling mid-stream
// =============================================================================

#[tokio::test]
async fn test_cancel_mid_stream_leaves_no_assistant_message() {
    let (api, store) = setup();
    let id = ConversationId::new("c1");
    store.upsert_conversation(Conversation::new(id.clone(), "Cancel"));
    let tx = api.script_stream();
    let mut events = store.subscribe();

    let ticket = store
        .send_message(Some(id.clone()), "Hello", Vec::new(), PromptType::Default)
        .await
        .unwrap();
    push(&tx, frame("ai_chunk", r#"{"fullContent":"Partial answ"}"#));
    while !store.messages(&id).iter().any(|m| !m.is_user) {
        tokio::task::yield_now().await;
    }

    assert!(store.cancel_stream());
    // Anything the server still sends is ignored
    let _ = tx.send(Ok(frame("ai_complete", r#"{"fullContent":"Partial answer"}"#)));
    drop(tx);
    assert_eq!(ticket.handle.finished().await, SessionState::Cancelled);
    tokio::task::yield_now().await;

    assert!(store.messages(&id).iter().all(|m| m.is_user));
    while let Ok(event) = events.try_recv() {
        assert!(
            !matches!(event, StoreEvent::SendFailed { .. } | StoreEvent::Alert(_)),
            "cancellation must be silent, got {event:?}"
        );
    }
}

// =============================================================================
// Mis-tagged success frame
// =============================================================================

#[tokio::test]
async fn test_success_error_frame_confirms_user_message() {
    let (api, store) = setup();
    let id = ConversationId::new("c1");
    store.upsert_conversation(Conversation::new(id.clone(), "Tagging"));
    let tx = api.script_stream();
    let mut events = store.subscribe();

    let ticket = store
        .send_message(Some(id.clone()), "Hello", Vec::new(), PromptType::Default)
        .await
        .unwrap();
    push(
        &tx,
        frame(
            "error",
            r#"{"success":true,"user_message":{"_id":"u1","text":"Hello","isUser":true}}"#,
        ),
    );
    push(&tx, frame("ai_complete", r#"{"_id":"a1","fullContent":"Hi"}"#));

    assert_eq!(ticket.handle.finished().await, SessionState::Completed);
    let ids: Vec<String> = store.messages(&id).iter().map(|m| m.id.to_string()).collect();
    assert_eq!(ids, vec!["u1".to_string(), "a1".to_string()]);
    while let Ok(event) = events.try_recv() {
        assert!(!matches!(event, StoreEvent::SendFailed { .. }));
    }
}

// =============================================================================
// Failures
// =============================================================================

#[tokio::test]
async fn test_rate_limit_alerts_and_restores_input() {
    let (api, store) = setup();
    let id = ConversationId::new("c1");
    store.upsert_conversation(Conversation::new(id.clone(), "Busy"));
    let tx = api.script_stream();
    let mut events = store.subscribe();

    let ticket = store
        .send_message(Some(id.clone()), "Hello", Vec::new(), PromptType::Default)
        .await
        .unwrap();
    push(&tx, frame("error", r#"{"message":"Too many requests","status":429}"#));

    assert_eq!(ticket.handle.finished().await, SessionState::Failed);

    let mut restored = None;
    let mut alerted = false;
    while let Ok(event) = events.try_recv() {
        match event {
            StoreEvent::SendFailed { text, .. } => restored = Some(text),
            StoreEvent::Alert(_) => alerted = true,
            _ => {}
        }
    }
    assert_eq!(restored.as_deref(), Some("Hello"));
    assert!(alerted);
    assert!(store.messages(&id).is_empty());
}

#[tokio::test]
async fn test_connection_loss_is_silent() {
    let (api, store) = setup();
    let id = ConversationId::new("c1");
    store.upsert_conversation(Conversation::new(id.clone(), "Offline"));
    api.fail_stream(parley_core::TransportError::Connection("network down".to_string()));
    let mut events = store.subscribe();

    let ticket = store
        .send_message(Some(id.clone()), "Hello", Vec::new(), PromptType::Default)
        .await
        .unwrap();
    assert_eq!(ticket.handle.finished().await, SessionState::Failed);

    while let Ok(event) = events.try_recv() {
        assert!(!matches!(event, StoreEvent::Alert(_)), "unexpected alert");
    }
}
