//! 外部协作方：会话存储与消息落库 / External collaborators: conversation store and message sink

pub mod memory;
pub mod postgres;

pub use memory::{MemoryConversationStore, MemoryMessageSink};
pub use postgres::{PgConversationStore, PgMessageRepository};

use async_trait::async_trait;

use crate::domain::{ChatMessage, Conversation, NewConversation, Participant};

#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// 会话全部参与者（含已退出者）/ Every participant of a conversation, including ones who left
    async fn participants(&self, conversation_id: &str) -> v::Result<Vec<Participant>>;

    /// 用户仍在其中的会话（含参与者）/ Conversations the user is active in, participants populated
    async fn conversations_for_user(&self, user_id: &str) -> v::Result<Vec<Conversation>>;

    async fn find_direct_conversation(&self, a: &str, b: &str) -> v::Result<Option<Conversation>>;

    async fn create_conversation(&self, new: &NewConversation) -> v::Result<Conversation>;
}

#[async_trait]
pub trait MessageSink: Send + Sync {
    /// 整批原子写入 / Insert the whole batch atomically
    async fn create_batch(&self, messages: &[ChatMessage]) -> v::Result<()>;
}
