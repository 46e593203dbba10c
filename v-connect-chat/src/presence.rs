use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, warn};

use crate::broker::{user_channel, PresenceSet, PubSub};
use crate::domain::{PresenceEvent, PresenceList, PresenceStatus};
use crate::storage::ConversationStore;

/// 在线状态跟踪 / Presence tracker
///
/// 尽力而为：任何错误只记录日志，不阻塞消息投递；状态事件不进入离线队列
/// Best effort: errors are logged and never block delivery, presence is never queued
pub struct PresenceTracker {
    online: Arc<dyn PresenceSet>,
    pubsub: Arc<dyn PubSub>,
    conversations: Arc<dyn ConversationStore>,
}

impl PresenceTracker {
    pub fn new(
        online: Arc<dyn PresenceSet>,
        pubsub: Arc<dyn PubSub>,
        conversations: Arc<dyn ConversationStore>,
    ) -> Self {
        Self {
            online,
            pubsub,
            conversations,
        }
    }

    pub async fn set_online(&self, user_id: &str) -> Result<()> {
        self.online.add(user_id).await
    }

    pub async fn set_offline(&self, user_id: &str) -> Result<()> {
        self.online.remove(user_id).await
    }

    pub async fn is_online(&self, user_id: &str) -> Result<bool> {
        self.online.contains(user_id).await
    }

    pub async fn list_online(&self, candidates: &[String]) -> Result<Vec<String>> {
        self.online.filter_members(candidates).await
    }

    /// 联系人：所在会话的其他活跃参与者（去重）/ Active co-participants across the user's conversations, deduplicated
    pub async fn contacts_of(&self, user_id: &str) -> v::Result<Vec<String>> {
        let conversations = self.conversations.conversations_for_user(user_id).await?;
        let contacts: BTreeSet<String> = conversations
            .into_iter()
            .flat_map(|c| c.participants)
            .filter(|p| p.is_active() && p.user_id != user_id)
            .map(|p| p.user_id)
            .collect();
        Ok(contacts.into_iter().collect())
    }

    /// 上线：标记、计算在线联系人快照并广播 / Mark online, build the snapshot and notify online contacts
    pub async fn announce_online(&self, user_id: &str, username: Option<&str>) -> PresenceList {
        if let Err(e) = self.set_online(user_id).await {
            warn!(user_id, "⚠️ failed to mark user online: {}", e);
        }
        let online_contacts = self.online_contacts(user_id).await;
        self.broadcast(user_id, username, PresenceStatus::Online, &online_contacts)
            .await;
        PresenceList::new(online_contacts)
    }

    /// 下线：清除标记并广播 / Clear the mark and notify online contacts
    pub async fn announce_offline(&self, user_id: &str, username: Option<&str>) {
        if let Err(e) = self.set_offline(user_id).await {
            warn!(user_id, "⚠️ failed to mark user offline: {}", e);
        }
        let online_contacts = self.online_contacts(user_id).await;
        self.broadcast(user_id, username, PresenceStatus::Offline, &online_contacts)
            .await;
    }

    async fn online_contacts(&self, user_id: &str) -> Vec<String> {
        let contacts = match self.contacts_of(user_id).await {
            Ok(contacts) => contacts,
            Err(e) => {
                warn!(user_id, "⚠️ failed to resolve contacts: {}", v::describe_error(&e));
                return Vec::new();
            }
        };
        match self.list_online(&contacts).await {
            Ok(online) => online,
            Err(e) => {
                warn!(user_id, "⚠️ failed to read online set: {}", e);
                Vec::new()
            }
        }
    }

    async fn broadcast(
        &self,
        user_id: &str,
        username: Option<&str>,
        status: PresenceStatus,
        targets: &[String],
    ) {
        let event = PresenceEvent::new(user_id, username.map(str::to_string), status);
        let payload = match serde_json::to_string(&event) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(user_id, "⚠️ failed to encode presence event: {}", e);
                return;
            }
        };
        for target in targets {
            if let Err(e) = self.pubsub.publish(&user_channel(target), &payload).await {
                warn!(user_id, target = %target, "⚠️ presence publish failed: {}", e);
            }
        }
        debug!(user_id, ?status, notified = targets.len(), "📣 presence broadcast");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Broker, MemoryBroker};
    use crate::domain::{ConversationKind, ParticipantRole};
    use crate::storage::MemoryConversationStore;
    use futures_util::StreamExt;

    fn tracker() -> (PresenceTracker, Arc<MemoryBroker>, Arc<MemoryConversationStore>) {
        let (broker, memory) = Broker::memory();
        let store = Arc::new(MemoryConversationStore::new());
        store.insert_direct("c1", "alice", "bob");
        store.insert_conversation(
            "g1",
            ConversationKind::Group,
            Some("team"),
            &[
                ("alice", Some(ParticipantRole::Admin)),
                ("bob", Some(ParticipantRole::Member)),
                ("carol", Some(ParticipantRole::Member)),
                ("dave", Some(ParticipantRole::Member)),
            ],
        );
        store.leave("g1", "dave");
        let tracker = PresenceTracker::new(broker.presence, broker.pubsub, store.clone());
        (tracker, memory, store)
    }

    #[tokio::test]
    async fn test_contacts_are_deduplicated_and_active() {
        let (tracker, _, _) = tracker();
        assert_eq!(tracker.contacts_of("alice").await.unwrap(), vec!["bob", "carol"]);
    }

    #[tokio::test]
    async fn test_set_online_is_idempotent() {
        let (tracker, _, _) = tracker();
        tracker.set_online("alice").await.unwrap();
        tracker.set_online("alice").await.unwrap();
        tracker.set_offline("alice").await.unwrap();
        assert!(!tracker.is_online("alice").await.unwrap());
    }

    #[tokio::test]
    async fn test_announce_online_snapshot_and_broadcast() {
        let (tracker, memory, _) = tracker();
        tracker.set_online("bob").await.unwrap();
        let mut bob = memory.subscribe("user:bob").await.unwrap();

        let snapshot = tracker.announce_online("alice", Some("Alice")).await;
        assert_eq!(snapshot.online_users, vec!["bob"]);

        let event: PresenceEvent = serde_json::from_str(&bob.next().await.unwrap()).unwrap();
        assert_eq!(event.user_id, "alice");
        assert_eq!(event.status, PresenceStatus::Online);

        tracker.announce_offline("alice", Some("Alice")).await;
        let event: PresenceEvent = serde_json::from_str(&bob.next().await.unwrap()).unwrap();
        assert_eq!(event.status, PresenceStatus::Offline);
        assert!(!tracker.is_online("alice").await.unwrap());
    }

    #[tokio::test]
    async fn test_snapshot_is_empty_without_online_contacts() {
        let (tracker, _, _) = tracker();
        let snapshot = tracker.announce_online("carol", None).await;
        assert!(snapshot.online_users.is_empty());
        let online = tracker
            .list_online(&["alice".to_string(), "carol".to_string()])
            .await
            .unwrap();
        assert_eq!(online, vec!["carol"]);
    }
}
