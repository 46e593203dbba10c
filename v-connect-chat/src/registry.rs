use std::net::SocketAddr;
use std::str::FromStr;

use anyhow::{anyhow, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::RegistryError;
use crate::ws::frames::close_message;

/// 同一用户重复连接的处理策略 / What happens when a user connects twice
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum DuplicatePolicy {
    /// 踢掉旧连接 / Evict the old session
    #[default]
    Replace,
    /// 拒绝新连接 / Refuse the new session
    Reject,
}

impl FromStr for DuplicatePolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "replace" => Ok(DuplicatePolicy::Replace),
            "reject" => Ok(DuplicatePolicy::Reject),
            other => Err(anyhow!(
                "session.duplicate_policy 取值无效 / invalid session.duplicate_policy '{}' (replace|reject)",
                other
            )),
        }
    }
}

/// 连接句柄 / Handle to one live session
#[derive(Clone, Debug)]
pub struct ConnectionHandle {
    pub session_id: String,
    pub addr: Option<SocketAddr>,
    pub connected_at: i64,
    sender: mpsc::UnboundedSender<Message>,
    cancel: CancellationToken,
}

impl ConnectionHandle {
    pub fn new(
        session_id: impl Into<String>,
        addr: Option<SocketAddr>,
        sender: mpsc::UnboundedSender<Message>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            addr,
            connected_at: chrono::Utc::now().timestamp_millis(),
            sender,
            cancel,
        }
    }

    pub fn send(&self, message: Message) -> Result<()> {
        self.sender
            .send(message)
            .map_err(|e| anyhow!("Failed to send message: {}", e))
    }

    pub fn send_text(&self, text: impl Into<String>) -> Result<()> {
        self.send(Message::Text(text.into()))
    }

    /// 发送关闭帧并取消会话 / Send a close frame and cancel the session
    pub fn close(&self, reason: &str) {
        if self.send(close_message(CloseCode::Normal, reason)).is_err() {
            debug!(session_id = %self.session_id, "🔒 close frame skipped, writer already gone");
        }
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// 连接注册表：用户 -> 当前会话 / Connection registry: user -> live session
///
/// 任意时刻每个用户至多一个条目 / At most one entry per user at any instant
#[derive(Debug)]
pub struct ConnectionRegistry {
    inner: DashMap<String, ConnectionHandle>,
    policy: DuplicatePolicy,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new(DuplicatePolicy::default())
    }
}

impl ConnectionRegistry {
    pub fn new(policy: DuplicatePolicy) -> Self {
        Self {
            inner: DashMap::new(),
            policy,
        }
    }

    pub fn policy(&self) -> DuplicatePolicy {
        self.policy
    }

    /// 注册会话；替换策略下返回被挤掉的旧会话 / Register a session, returning the evicted one under `Replace`
    ///
    /// 已取消的旧条目总是可以被覆盖 / A cancelled leftover entry is always overwritten
    pub fn add(
        &self,
        user_id: &str,
        handle: ConnectionHandle,
    ) -> std::result::Result<Option<ConnectionHandle>, RegistryError> {
        let session_id = handle.session_id.clone();
        let evicted = match self.inner.entry(user_id.to_string()) {
            Entry::Occupied(mut entry) => {
                if self.policy == DuplicatePolicy::Reject && !entry.get().is_closed() {
                    return Err(RegistryError::AlreadyConnected {
                        user_id: user_id.to_string(),
                    });
                }
                Some(entry.insert(handle))
            }
            Entry::Vacant(entry) => {
                entry.insert(handle);
                None
            }
        };
        info!(
            user_id,
            session_id = %session_id,
            replaced = evicted.is_some(),
            "✅ user connected"
        );
        Ok(evicted)
    }

    /// 无条件移除 / Remove whatever session the user has
    pub fn remove(&self, user_id: &str) -> Option<ConnectionHandle> {
        let removed = self.inner.remove(user_id).map(|(_, handle)| handle);
        if let Some(handle) = &removed {
            info!(user_id, session_id = %handle.session_id, "👋 user disconnected");
        }
        removed
    }

    /// 仅当条目仍属于该会话时移除 / Remove only if the entry still belongs to `session_id`
    pub fn remove_session(&self, user_id: &str, session_id: &str) -> bool {
        let removed = self
            .inner
            .remove_if(user_id, |_, handle| handle.session_id == session_id)
            .is_some();
        if removed {
            info!(user_id, session_id, "👋 user disconnected");
        } else {
            debug!(user_id, session_id, "registry entry owned by a newer session, kept");
        }
        removed
    }

    pub fn get(&self, user_id: &str) -> Option<ConnectionHandle> {
        self.inner.get(user_id).map(|h| h.value().clone())
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        self.inner.contains_key(user_id)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// 关闭所有会话（进程退出时）/ Close every session, used on shutdown
    pub fn close_all(&self, reason: &str) {
        let handles: Vec<ConnectionHandle> = self.inner.iter().map(|e| e.value().clone()).collect();
        for handle in handles {
            handle.close(reason);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn handle(session: &str) -> (ConnectionHandle, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ConnectionHandle::new(session, None, tx, CancellationToken::new()), rx)
    }

    #[test]
    fn test_replace_keeps_single_entry() {
        let registry = ConnectionRegistry::new(DuplicatePolicy::Replace);
        let (first, _rx1) = handle("s1");
        let (second, _rx2) = handle("s2");
        assert!(registry.add("alice", first).unwrap().is_none());
        let evicted = registry.add("alice", second).unwrap().unwrap();
        assert_eq!(evicted.session_id, "s1");
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("alice").unwrap().session_id, "s2");

        assert!(!registry.remove_session("alice", "s1"));
        assert!(registry.is_online("alice"));
        assert!(registry.remove_session("alice", "s2"));
        assert!(!registry.is_online("alice"));
        assert!(registry.remove("alice").is_none());
    }

    #[test]
    fn test_reject_refuses_live_duplicate() {
        let registry = ConnectionRegistry::new(DuplicatePolicy::Reject);
        let (first, _rx1) = handle("s1");
        let (second, _rx2) = handle("s2");
        registry.add("alice", first.clone()).unwrap();
        assert!(matches!(
            registry.add("alice", second.clone()),
            Err(RegistryError::AlreadyConnected { ref user_id }) if user_id == "alice"
        ));
        assert_eq!(registry.get("alice").unwrap().session_id, "s1");

        first.close("bye");
        assert!(registry.add("alice", second).is_ok());
        assert_eq!(registry.get("alice").unwrap().session_id, "s2");
    }

    #[test]
    fn test_close_sends_frame_and_cancels() {
        let (h, mut rx) = handle("s1");
        h.close("replaced");
        assert!(h.is_closed());
        assert!(matches!(rx.try_recv(), Ok(Message::Close(Some(_)))));
    }

    #[tokio::test]
    async fn test_concurrent_adds_leave_one_entry_per_user() {
        let registry = Arc::new(ConnectionRegistry::new(DuplicatePolicy::Replace));
        let mut tasks = Vec::new();
        for i in 0..64 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                let (tx, _rx) = mpsc::unbounded_channel();
                let h = ConnectionHandle::new(format!("s{}", i), None, tx, CancellationToken::new());
                registry.add(&format!("user{}", i % 8), h).unwrap();
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        assert_eq!(registry.len(), 8);
    }
}
