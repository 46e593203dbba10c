use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures_util::StreamExt;

use v_connect_chat::broker::{Broker, IntakeLog, MemoryBroker, PendingQueue, PresenceSet, PubSub};
use v_connect_chat::config::{AckPolicy, WorkerConfig};
use v_connect_chat::domain::{ConversationKind, OutgoingMessage, ParticipantRole};
use v_connect_chat::error::ChatError;
use v_connect_chat::storage::{MemoryConversationStore, MemoryMessageSink};
use v_connect_chat::worker::PersistenceWorker;
use v_connect_chat::ChatServer;

fn setup() -> (ChatServer, Arc<MemoryBroker>, Arc<MemoryConversationStore>) {
    let (broker, memory) = Broker::memory();
    let store = Arc::new(MemoryConversationStore::new());
    store.add_user("alice", "Alice");
    store.insert_direct("d1", "alice", "bob");
    store.insert_conversation(
        "g1",
        ConversationKind::Group,
        Some("team"),
        &[
            ("alice", Some(ParticipantRole::Admin)),
            ("bob", Some(ParticipantRole::Member)),
            ("carol", Some(ParticipantRole::Member)),
        ],
    );
    let server = ChatServer::new(broker, store.clone()).with_node_id("node-a");
    (server, memory, store)
}

#[tokio::test]
async fn test_group_message_fans_out_by_presence() -> Result<()> {
    let (server, memory, _) = setup();
    // bob 在另一节点在线 / bob is connected to another node
    memory.add("bob").await?;
    let mut bob = memory.subscribe("user:bob").await?;

    let report = server
        .chat
        .handle_frame("alice", r#"{"conversation_id":"g1","content":"standup?","type":"text"}"#)
        .await?;
    assert_eq!(report.published, vec!["bob"]);
    assert_eq!(report.queued, vec!["carol"]);
    assert_eq!(report.intake_id.as_deref(), Some("1-0"));

    let live: OutgoingMessage = serde_json::from_str(&bob.next().await.unwrap())?;
    assert_eq!(live.id, report.message.id);
    assert_eq!(live.sender_username.as_deref(), Some("Alice"));

    let queued: OutgoingMessage = serde_json::from_str(&memory.queued("carol")[0])?;
    assert_eq!(queued.id, report.message.id);
    assert!(memory.queued("alice").is_empty());
    Ok(())
}

#[tokio::test]
async fn test_offline_queue_keeps_send_order() -> Result<()> {
    let (server, memory, _) = setup();
    for text in ["one", "two", "three"] {
        let frame = serde_json::json!({ "conversation_id": "d1", "content": text }).to_string();
        server.chat.handle_frame("alice", &frame).await?;
    }

    let drained = memory.drain_all("bob").await?;
    let contents: Vec<String> = drained
        .iter()
        .map(|raw| serde_json::from_str::<OutgoingMessage>(raw).map(|m| m.content))
        .collect::<Result<_, _>>()?;
    assert_eq!(contents, vec!["one", "two", "three"]);
    assert!(memory.drain_all("bob").await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_rejected_frames_leave_no_trace() -> Result<()> {
    let (server, memory, _) = setup();
    let cases = [
        ("carol", r#"{"conversation_id":"d1","content":"hi"}"#),
        ("alice", r#"{"conversation_id":"nope","content":"hi"}"#),
        ("alice", r#"{"conversation_id":"d1","content":"   "}"#),
        ("alice", "not json"),
    ];
    let mut messages = Vec::new();
    for (sender, raw) in cases {
        let err = server.chat.handle_frame(sender, raw).await.unwrap_err();
        messages.push(err.client_message());
    }
    assert_eq!(
        messages,
        vec![
            "You are not a participant of this conversation",
            "Conversation not found",
            "content is required",
            "Invalid message format",
        ]
    );
    assert_eq!(memory.log_len(), 0);
    assert!(memory.queued("bob").is_empty());
    Ok(())
}

#[tokio::test]
async fn test_left_participant_stops_receiving() -> Result<()> {
    let (server, memory, store) = setup();
    store.leave("g1", "carol");
    let report = server
        .chat
        .handle_frame("bob", r#"{"conversation_id":"g1","content":"bye carol"}"#)
        .await?;
    assert_eq!(report.queued, vec!["alice"]);
    assert!(memory.queued("carol").is_empty());

    let err = server
        .chat
        .handle_frame("carol", r#"{"conversation_id":"g1","content":"wait"}"#)
        .await
        .unwrap_err();
    assert!(matches!(err, ChatError::NotParticipant));
    Ok(())
}

#[tokio::test]
async fn test_routed_messages_reach_the_sink_once() -> Result<()> {
    let (server, memory, _) = setup();
    let mut sent = Vec::new();
    for i in 0..5 {
        let frame = serde_json::json!({ "conversation_id": "g1", "content": format!("m{}", i) }).to_string();
        sent.push(server.chat.handle_frame("alice", &frame).await?.message.id);
    }

    let sink = Arc::new(MemoryMessageSink::new());
    let config = WorkerConfig {
        batch_size: 2,
        read_block: Duration::from_millis(10),
        ack_policy: AckPolicy::AfterFlush,
        ..WorkerConfig::default()
    };
    let worker = PersistenceWorker::new(server.broker.intake.clone(), sink.clone(), config);
    server.broker.intake.create_group("message-workers").await?;
    while worker.poll_once().await? > 0 {}
    worker.flush().await?;

    let stored: Vec<String> = sink.stored().into_iter().map(|m| m.id).collect();
    assert_eq!(stored, sent);
    assert_eq!(sink.attempts(), vec![(2, true), (2, true), (1, true)]);
    assert_eq!(memory.pending_count("message-workers"), 0);
    Ok(())
}
