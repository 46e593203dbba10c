use std::sync::Arc;

use crate::broker::Broker;
use crate::presence::PresenceTracker;
use crate::registry::{ConnectionRegistry, DuplicatePolicy};
use crate::service::{Authenticator, ChatService, DevAuthenticator};
use crate::storage::ConversationStore;

/// 服务端状态：由 main 显式构造并注入各组件 / Server state, built once and handed to every consumer
#[derive(Clone)]
pub struct ChatServer {
    pub node_id: String,                               // 当前节点ID / Current node ID
    pub registry: Arc<ConnectionRegistry>,             // 本节点连接 / Local connections
    pub broker: Broker,                                // 消息中间件 / Broker substrate
    pub conversations: Arc<dyn ConversationStore>,     // 会话存储 / Conversation store
    pub presence: Arc<PresenceTracker>,                // 在线状态 / Presence tracker
    pub chat: Arc<ChatService>,                        // 消息路由 / Message router
    pub authenticator: Arc<dyn Authenticator>,         // 鉴权 / Token validation
}

impl ChatServer {
    /// 构建默认服务器实例 / Build default server instance
    pub fn new(broker: Broker, conversations: Arc<dyn ConversationStore>) -> Self {
        let registry = Arc::new(ConnectionRegistry::new(DuplicatePolicy::default()));
        let presence = Arc::new(PresenceTracker::new(
            broker.presence.clone(),
            broker.pubsub.clone(),
            conversations.clone(),
        ));
        let chat = Arc::new(ChatService::new(
            conversations.clone(),
            broker.clone(),
            registry.clone(),
        ));
        Self {
            node_id: "node-local".to_string(),
            registry,
            broker,
            conversations,
            presence,
            chat,
            authenticator: Arc::new(DevAuthenticator),
        }
    }

    /// 配置节点 / Configure node id
    pub fn with_node_id(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = node_id.into();
        self
    }

    /// 配置重复连接策略 / Configure the duplicate connection policy
    pub fn with_duplicate_policy(mut self, policy: DuplicatePolicy) -> Self {
        self.registry = Arc::new(ConnectionRegistry::new(policy));
        self.chat = Arc::new(ChatService::new(
            self.conversations.clone(),
            self.broker.clone(),
            self.registry.clone(),
        ));
        self
    }

    /// 配置鉴权 / Configure auth
    pub fn with_authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = authenticator;
        self
    }
}
