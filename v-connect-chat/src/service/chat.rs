use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::broker::{user_channel, Broker};
use crate::domain::{
    Conversation, ConversationKind, CreateConversationRequest, InboundFrame, OutgoingMessage,
};
use crate::error::ChatError;
use crate::registry::ConnectionRegistry;
use crate::storage::ConversationStore;
use v::DbError;

/// 单条消息的路由结果 / Routing outcome of one message
#[derive(Debug, Clone)]
pub struct DeliveryReport {
    pub message: OutgoingMessage,
    /// 入库日志位置；追加失败时为空 / Intake log position, `None` when the append failed
    pub intake_id: Option<String>,
    pub published: Vec<String>,
    pub queued: Vec<String>,
}

/// 消息路由 / Message router
pub struct ChatService {
    conversations: Arc<dyn ConversationStore>,
    broker: Broker,
    registry: Arc<ConnectionRegistry>,
}

impl ChatService {
    pub fn new(
        conversations: Arc<dyn ConversationStore>,
        broker: Broker,
        registry: Arc<ConnectionRegistry>,
    ) -> Self {
        Self {
            conversations,
            broker,
            registry,
        }
    }

    /// 处理一条客户端文本帧 / Handle one inbound text frame
    pub async fn handle_frame(&self, sender_id: &str, raw: &str) -> Result<DeliveryReport, ChatError> {
        let frame = InboundFrame::parse(raw)?;
        self.send(sender_id, frame).await
    }

    pub async fn send(&self, sender_id: &str, frame: InboundFrame) -> Result<DeliveryReport, ChatError> {
        let participants = match self.conversations.participants(&frame.conversation_id).await {
            Ok(participants) => participants,
            Err(DbError::NotFound) => return Err(ChatError::ConversationNotFound),
            Err(e) => {
                warn!(
                    conversation_id = %frame.conversation_id,
                    "⚠️ participant lookup failed: {}",
                    v::describe_error(&e)
                );
                return Err(ChatError::ConversationNotFound);
            }
        };
        let active: Vec<_> = participants.into_iter().filter(|p| p.is_active()).collect();
        if active.is_empty() {
            return Err(ChatError::ConversationNotFound);
        }
        let sender = active
            .iter()
            .find(|p| p.user_id == sender_id)
            .ok_or(ChatError::NotParticipant)?;

        let message = OutgoingMessage::new(
            frame.conversation_id,
            sender_id,
            sender.username.clone(),
            frame.content,
            frame.msg_type.unwrap_or_default(),
        );
        let payload = message.to_json()?;
        let intake_id = self.append_to_intake(&message).await;

        let mut published = Vec::new();
        let mut queued = Vec::new();
        for recipient in active.iter().filter(|p| p.user_id != sender_id) {
            let user_id = recipient.user_id.as_str();
            if self.is_online(user_id).await {
                match self.broker.pubsub.publish(&user_channel(user_id), &payload).await {
                    Ok(receivers) if receivers > 0 => {
                        published.push(user_id.to_string());
                        continue;
                    }
                    // 在线标记过期：频道无人订阅，转入离线队列
                    // Stale online mark: nobody is subscribed, fall back to the queue
                    Ok(_) => {
                        warn!(message_id = %message.id, recipient = user_id, "⚠️ no live subscriber, queueing instead");
                    }
                    Err(e) => {
                        warn!(message_id = %message.id, recipient = user_id, "⚠️ live publish failed: {}", e);
                        continue;
                    }
                }
            }
            if let Err(e) = self.broker.pending.enqueue(user_id, &payload).await {
                error!(message_id = %message.id, recipient = user_id, "❌ pending enqueue failed: {}", e);
                continue;
            }
            queued.push(user_id.to_string());
        }
        debug!(
            message_id = %message.id,
            conversation_id = %message.conversation_id,
            published = published.len(),
            queued = queued.len(),
            "📨 message routed"
        );
        Ok(DeliveryReport {
            message,
            intake_id,
            published,
            queued,
        })
    }

    /// 本节点注册表优先，其次共享在线集合；读取失败视为离线
    /// Local registry first, then the shared online set; a failed read counts as offline
    async fn is_online(&self, user_id: &str) -> bool {
        if self.registry.is_online(user_id) {
            return true;
        }
        match self.broker.presence.contains(user_id).await {
            Ok(online) => online,
            Err(e) => {
                warn!(user_id, "⚠️ online set read failed, queueing instead: {}", e);
                false
            }
        }
    }

    async fn append_to_intake(&self, message: &OutgoingMessage) -> Option<String> {
        let fields = match message.to_intake_fields() {
            Ok(fields) => fields,
            Err(e) => {
                error!(message_id = %message.id, "❌ failed to flatten message: {}", e);
                return None;
            }
        };
        match self.broker.intake.append(&fields).await {
            Ok(id) => Some(id),
            Err(e) => {
                error!(message_id = %message.id, "❌ intake log append failed: {}", e);
                None
            }
        }
    }

    /// 打开会话：单聊已存在则复用 / Open a conversation, reusing an existing direct chat
    pub async fn open_conversation(
        &self,
        creator: &str,
        request: CreateConversationRequest,
    ) -> Result<Conversation, ChatError> {
        let new = request.resolve(creator)?;
        if new.kind == ConversationKind::Direct {
            if let Some((other, _)) = new.members.iter().find(|(id, _)| id != creator) {
                if let Some(existing) = self
                    .conversations
                    .find_direct_conversation(creator, other)
                    .await?
                {
                    return Ok(existing);
                }
            }
        }
        Ok(self.conversations.create_conversation(&new).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{MemoryBroker, PresenceSet};
    use crate::storage::MemoryConversationStore;

    fn service() -> (ChatService, Arc<MemoryBroker>, Arc<MemoryConversationStore>) {
        let (broker, memory) = Broker::memory();
        let store = Arc::new(MemoryConversationStore::new());
        store.add_user("alice", "Alice");
        store.insert_direct("c1", "alice", "bob");
        let registry = Arc::new(ConnectionRegistry::default());
        (ChatService::new(store.clone(), broker, registry), memory, store)
    }

    #[tokio::test]
    async fn test_offline_recipient_is_queued() {
        let (chat, memory, _) = service();
        let report = chat
            .handle_frame("alice", r#"{"conversation_id":"c1","content":"hi"}"#)
            .await
            .unwrap();
        assert_eq!(report.queued, vec!["bob"]);
        assert!(report.published.is_empty());
        assert!(report.intake_id.is_some());

        let queued = memory.queued("bob");
        assert_eq!(queued.len(), 1);
        let msg: OutgoingMessage = serde_json::from_str(&queued[0]).unwrap();
        assert_eq!(msg.sender_id, "alice");
        assert_eq!(msg.sender_username.as_deref(), Some("Alice"));
        assert_eq!(msg.content, "hi");
        assert_eq!(msg.msg_type.as_str(), "text");
        assert!(memory.queued("alice").is_empty());
    }

    #[tokio::test]
    async fn test_stale_online_mark_falls_back_to_queue() {
        let (chat, memory, _) = service();
        // 集合里有 bob，但没有任何节点订阅他的频道 / bob is in the set but nobody subscribes to his channel
        memory.add("bob").await.unwrap();
        let report = chat
            .handle_frame("alice", r#"{"conversation_id":"c1","content":"hi"}"#)
            .await
            .unwrap();
        assert!(report.published.is_empty());
        assert_eq!(report.queued, vec!["bob"]);
        let queued = memory.queued("bob");
        assert_eq!(queued.len(), 1);
        let msg: OutgoingMessage = serde_json::from_str(&queued[0]).unwrap();
        assert_eq!(msg.id, report.message.id);
    }

    #[tokio::test]
    async fn test_rejections() {
        let (chat, memory, store) = service();
        assert!(matches!(
            chat.handle_frame("mallory", r#"{"conversation_id":"c1","content":"hi"}"#).await,
            Err(ChatError::NotParticipant)
        ));
        assert!(matches!(
            chat.handle_frame("alice", r#"{"conversation_id":"c9","content":"hi"}"#).await,
            Err(ChatError::ConversationNotFound)
        ));
        store.leave("c1", "alice");
        assert!(matches!(
            chat.handle_frame("alice", r#"{"conversation_id":"c1","content":"hi"}"#).await,
            Err(ChatError::NotParticipant)
        ));
        assert_eq!(memory.log_len(), 0);
    }

    #[tokio::test]
    async fn test_open_direct_conversation_reuses_existing() {
        let (chat, _, _) = service();
        let existing = chat
            .open_conversation(
                "bob",
                CreateConversationRequest::Direct {
                    participant_id: "alice".into(),
                },
            )
            .await
            .unwrap();
        assert_eq!(existing.id, "c1");

        let created = chat
            .open_conversation(
                "bob",
                CreateConversationRequest::Group {
                    name: "team".into(),
                    participant_ids: vec!["alice".into()],
                },
            )
            .await
            .unwrap();
        assert_ne!(created.id, "c1");
        assert_eq!(created.participants.len(), 2);
    }
}
