use async_trait::async_trait;
use v::{HealthCheck, HealthStatus};

use crate::ChatServer;

// 为聊天服务实现统一健康检查接口
// Implement unified HealthCheck for the chat service
#[async_trait]
impl HealthCheck for ChatServer {
    /// 本节点在线连接数与中间件后端 / Local online sessions and broker backend
    async fn check_health(&self) -> HealthStatus {
        let online = self.registry.len();
        let backend = self.broker.backend_name();
        match self.broker.presence.members().await {
            Ok(members) => HealthStatus::now(
                "chat_server",
                true,
                Some(format!(
                    "node={} online_local={} online_total={} broker={}",
                    self.node_id,
                    online,
                    members.len(),
                    backend
                )),
            ),
            Err(e) => HealthStatus::now(
                "chat_server",
                false,
                Some(format!("node={} broker={} error={}", self.node_id, backend, e)),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::Broker;
    use crate::storage::MemoryConversationStore;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_health_reports_backend() {
        let (broker, _) = Broker::memory();
        let server = ChatServer::new(broker, Arc::new(MemoryConversationStore::new()));
        let status = server.check_health().await;
        assert!(status.healthy);
        assert_eq!(status.component, "chat_server");
        assert!(status.message.unwrap().contains("broker=memory"));
    }
}
