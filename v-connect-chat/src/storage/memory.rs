use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;

use super::{ConversationStore, MessageSink};
use crate::domain::{
    ChatMessage, Conversation, ConversationKind, NewConversation, Participant, ParticipantRole,
};
use v::DbError;

/// 内存会话存储 / In-memory conversation store
#[derive(Default)]
pub struct MemoryConversationStore {
    conversations: DashMap<String, Conversation>,
    usernames: DashMap<String, String>,
}

impl MemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_user(&self, user_id: &str, username: &str) {
        self.usernames.insert(user_id.to_string(), username.to_string());
    }

    /// 以指定 id 插入会话 / Insert a conversation under a caller-chosen id
    pub fn insert_conversation(
        &self,
        id: &str,
        kind: ConversationKind,
        name: Option<&str>,
        members: &[(&str, Option<ParticipantRole>)],
    ) -> Conversation {
        let now = Utc::now();
        let conversation = Conversation {
            id: id.to_string(),
            kind,
            name: name.map(str::to_string),
            created_by: members.first().map(|(u, _)| u.to_string()),
            created_at: now,
            participants: members
                .iter()
                .map(|(user_id, role)| Participant {
                    conversation_id: id.to_string(),
                    user_id: user_id.to_string(),
                    username: None,
                    role: *role,
                    joined_at: now,
                    left_at: None,
                })
                .collect(),
        };
        self.conversations.insert(id.to_string(), conversation.clone());
        conversation
    }

    pub fn insert_direct(&self, id: &str, a: &str, b: &str) -> Conversation {
        self.insert_conversation(id, ConversationKind::Direct, None, &[(a, None), (b, None)])
    }

    /// 标记参与者退出 / Mark a participant as having left
    pub fn leave(&self, conversation_id: &str, user_id: &str) {
        if let Some(mut conversation) = self.conversations.get_mut(conversation_id) {
            for p in conversation.participants.iter_mut() {
                if p.user_id == user_id {
                    p.left_at = Some(Utc::now());
                }
            }
        }
    }

    fn with_usernames(&self, mut participants: Vec<Participant>) -> Vec<Participant> {
        for p in participants.iter_mut() {
            p.username = self.usernames.get(&p.user_id).map(|u| u.value().clone());
        }
        participants
    }

    fn hydrate(&self, mut conversation: Conversation) -> Conversation {
        conversation.participants = self.with_usernames(conversation.participants);
        conversation
    }
}

#[async_trait]
impl ConversationStore for MemoryConversationStore {
    async fn participants(&self, conversation_id: &str) -> v::Result<Vec<Participant>> {
        let conversation = self
            .conversations
            .get(conversation_id)
            .map(|c| c.participants.clone())
            .ok_or(DbError::NotFound)?;
        Ok(self.with_usernames(conversation))
    }

    async fn conversations_for_user(&self, user_id: &str) -> v::Result<Vec<Conversation>> {
        let mut found: Vec<Conversation> = self
            .conversations
            .iter()
            .filter(|c| {
                c.participants
                    .iter()
                    .any(|p| p.user_id == user_id && p.is_active())
            })
            .map(|c| c.value().clone())
            .collect();
        found.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(found.into_iter().map(|c| self.hydrate(c)).collect())
    }

    async fn find_direct_conversation(&self, a: &str, b: &str) -> v::Result<Option<Conversation>> {
        let found = self
            .conversations
            .iter()
            .find(|c| {
                c.kind == ConversationKind::Direct
                    && c.participants.iter().any(|p| p.user_id == a)
                    && c.participants.iter().any(|p| p.user_id == b)
            })
            .map(|c| c.value().clone());
        Ok(found.map(|c| self.hydrate(c)))
    }

    async fn create_conversation(&self, new: &NewConversation) -> v::Result<Conversation> {
        let id = uuid::Uuid::new_v4().to_string();
        let members: Vec<(&str, Option<ParticipantRole>)> = new
            .members
            .iter()
            .map(|(user_id, role)| (user_id.as_str(), *role))
            .collect();
        // 创建者位于成员首位 / the creator is always the first member
        let conversation = self.insert_conversation(&id, new.kind, new.name.as_deref(), &members);
        Ok(self.hydrate(conversation))
    }
}

/// 内存消息落库，记录每次写入尝试 / In-memory sink that records every attempt
#[derive(Default)]
pub struct MemoryMessageSink {
    stored: Mutex<Vec<ChatMessage>>,
    attempts: Mutex<Vec<(usize, bool)>>,
    fail_next: AtomicUsize,
}

impl MemoryMessageSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// 让接下来的 n 次写入失败 / Make the next `n` batches fail
    pub fn fail_next(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// 每次写入的 (批大小, 是否成功) / (batch size, succeeded) per call
    pub fn attempts(&self) -> Vec<(usize, bool)> {
        self.attempts.lock().clone()
    }

    pub fn stored(&self) -> Vec<ChatMessage> {
        self.stored.lock().clone()
    }
}

#[async_trait]
impl MessageSink for MemoryMessageSink {
    async fn create_batch(&self, messages: &[ChatMessage]) -> v::Result<()> {
        let fail = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        self.attempts.lock().push((messages.len(), !fail));
        if fail {
            return Err(DbError::Tx("injected batch failure".to_string()));
        }
        let mut stored = self.stored.lock();
        for message in messages {
            if !stored.iter().any(|m| m.id == message.id) {
                stored.push(message.clone());
            }
        }
        Ok(())
    }
}
