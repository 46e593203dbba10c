//! 消息中间件抽象 / Broker substrate
//!
//! 实时投递、离线队列、入库日志与在线集合四类原语，
//! 由同一个后端（Redis 或进程内内存）提供。
//! Publish/subscribe, per-user pending queues, the intake log and the online set,
//! all served by one backend (Redis or in-process memory).

pub mod memory;
pub mod redis_backend;

pub use memory::MemoryBroker;
pub use redis_backend::RedisBroker;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use futures_util::stream::BoxStream;

/// 入库日志流名 / Intake log stream key
pub const INTAKE_STREAM: &str = "messages:stream";
/// 在线用户集合 / Online user set key
pub const ONLINE_SET: &str = "online:users";

/// 用户实时频道 / Per-user live channel
pub fn user_channel(user_id: &str) -> String {
    format!("user:{}", user_id)
}

/// 用户离线队列 / Per-user pending list
pub fn pending_key(user_id: &str) -> String {
    format!("pending:{}", user_id)
}

/// 订阅流：频道上收到的原始载荷 / Stream of payloads received on a channel
pub type Subscription = BoxStream<'static, String>;

#[async_trait]
pub trait PubSub: Send + Sync {
    /// 返回收到该帧的订阅者数量，0 表示无人在听 / Returns how many subscribers received it, 0 means nobody is listening
    async fn publish(&self, channel: &str, payload: &str) -> Result<usize>;

    /// 订阅成功返回后，后续发布必定可见 / Publishes after this returns are observed
    async fn subscribe(&self, channel: &str) -> Result<Subscription>;
}

#[async_trait]
pub trait PendingQueue: Send + Sync {
    /// 追加到队尾 / Append to the tail of the user's queue
    async fn enqueue(&self, user_id: &str, payload: &str) -> Result<()>;

    /// 原子地读出并清空整个队列 / Atomically read and delete the whole queue
    async fn drain_all(&self, user_id: &str) -> Result<Vec<String>>;
}

/// 入库日志条目 / Intake log entry
#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub id: String,
    pub fields: HashMap<String, String>,
}

/// 消费组读取位置 / Where a group read starts
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadCursor {
    /// 从未投递过的新条目 / Entries never delivered to the group
    New,
    /// 本消费者已投递未确认的条目（id 之后）/ This consumer's unacked entries after `after`
    Pending { after: String },
}

impl ReadCursor {
    pub fn pending_from_start() -> Self {
        ReadCursor::Pending {
            after: "0".to_string(),
        }
    }
}

#[async_trait]
pub trait IntakeLog: Send + Sync {
    /// 追加并返回日志分配的位置 / Append and return the assigned entry id
    async fn append(&self, fields: &[(String, String)]) -> Result<String>;

    /// 幂等创建消费组 / Create the consumer group, existing groups are fine
    async fn create_group(&self, group: &str) -> Result<()>;

    async fn read_group(
        &self,
        group: &str,
        consumer: &str,
        cursor: &ReadCursor,
        count: usize,
        block: Duration,
    ) -> Result<Vec<LogEntry>>;

    /// 确认条目，返回实际确认的数量 / Acknowledge entries, returns how many were pending
    async fn ack(&self, group: &str, ids: &[String]) -> Result<usize>;
}

#[async_trait]
pub trait PresenceSet: Send + Sync {
    async fn add(&self, user_id: &str) -> Result<()>;
    async fn remove(&self, user_id: &str) -> Result<()>;
    async fn contains(&self, user_id: &str) -> Result<bool>;
    async fn members(&self) -> Result<Vec<String>>;

    /// 返回候选中在线的子集，保持候选顺序 / Online subset of `candidates`, order kept
    async fn filter_members(&self, candidates: &[String]) -> Result<Vec<String>> {
        let mut online = Vec::new();
        for candidate in candidates {
            if self.contains(candidate).await? {
                online.push(candidate.clone());
            }
        }
        Ok(online)
    }
}

/// 后端组合 / One backend exposed through the four primitives
#[derive(Clone)]
pub struct Broker {
    pub pubsub: Arc<dyn PubSub>,
    pub pending: Arc<dyn PendingQueue>,
    pub intake: Arc<dyn IntakeLog>,
    pub presence: Arc<dyn PresenceSet>,
    backend: &'static str,
}

impl Broker {
    pub fn from_backend<B>(backend: Arc<B>, name: &'static str) -> Self
    where
        B: PubSub + PendingQueue + IntakeLog + PresenceSet + 'static,
    {
        Self {
            pubsub: backend.clone(),
            pending: backend.clone(),
            intake: backend.clone(),
            presence: backend,
            backend: name,
        }
    }

    /// 进程内后端 / In-process backend
    pub fn memory() -> (Self, Arc<MemoryBroker>) {
        let backend = Arc::new(MemoryBroker::new());
        (Self::from_backend(backend.clone(), "memory"), backend)
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_names() {
        assert_eq!(user_channel("42"), "user:42");
        assert_eq!(pending_key("42"), "pending:42");
        assert_eq!(ReadCursor::pending_from_start(), ReadCursor::Pending { after: "0".into() });
    }
}
