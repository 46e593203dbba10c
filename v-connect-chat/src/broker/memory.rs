use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use futures_util::stream::{self, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{broadcast, Notify};
use tracing::warn;

use super::{
    IntakeLog, LogEntry, PendingQueue, PresenceSet, PubSub, ReadCursor, Subscription,
};

const CHANNEL_CAPACITY: usize = 1024;

#[derive(Default)]
struct GroupState {
    /// 下一条未投递条目的下标 / Index of the next never-delivered entry
    next: usize,
    /// 已投递未确认：下标 -> 消费者 / Delivered but unacked: index -> consumer
    pending: BTreeMap<usize, String>,
}

#[derive(Default)]
struct LogState {
    entries: Vec<LogEntry>,
    groups: HashMap<String, GroupState>,
}

/// 进程内后端，语义与 Redis 后端一致 / In-process backend with the Redis backend's semantics
pub struct MemoryBroker {
    channels: DashMap<String, broadcast::Sender<String>>,
    queues: DashMap<String, Vec<String>>,
    online: DashSet<String>,
    log: Mutex<LogState>,
    appended: Notify,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

/// 条目 id 形如 `<seq>-0`，seq 从 1 开始 / Entry ids look like `<seq>-0`, seq starts at 1
fn entry_seq(id: &str) -> Option<usize> {
    id.split('-').next()?.parse().ok()
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
            queues: DashMap::new(),
            online: DashSet::new(),
            log: Mutex::new(LogState::default()),
            appended: Notify::new(),
        }
    }

    /// 日志条目总数 / Number of entries ever appended
    pub fn log_len(&self) -> usize {
        self.log.lock().entries.len()
    }

    /// 日志快照 / Copy of every appended entry
    pub fn log_entries(&self) -> Vec<LogEntry> {
        self.log.lock().entries.clone()
    }

    /// 组内已投递未确认数量 / Delivered-but-unacked count for a group
    pub fn pending_count(&self, group: &str) -> usize {
        self.log
            .lock()
            .groups
            .get(group)
            .map(|g| g.pending.len())
            .unwrap_or(0)
    }

    /// 查看离线队列但不清空 / Peek a user's pending queue
    pub fn queued(&self, user_id: &str) -> Vec<String> {
        self.queues
            .get(user_id)
            .map(|q| q.value().clone())
            .unwrap_or_default()
    }

    /// 频道当前订阅者数量 / Live subscribers on a channel
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .get(channel)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }

    fn take_new(state: &mut LogState, group: &str, consumer: &str, count: usize) -> Result<Vec<LogEntry>> {
        let LogState { entries, groups } = state;
        let Some(g) = groups.get_mut(group) else {
            bail!("NOGROUP no such consumer group '{}'", group);
        };
        let end = entries.len().min(g.next + count.max(1));
        let batch: Vec<LogEntry> = entries[g.next..end].to_vec();
        for index in g.next..end {
            g.pending.insert(index, consumer.to_string());
        }
        g.next = end;
        Ok(batch)
    }
}

#[async_trait]
impl PubSub for MemoryBroker {
    async fn publish(&self, channel: &str, payload: &str) -> Result<usize> {
        let receivers = match self.channels.get(channel) {
            Some(tx) => tx.send(payload.to_string()).unwrap_or(0),
            None => 0,
        };
        if receivers == 0 {
            self.channels.remove_if(channel, |_, tx| tx.receiver_count() == 0);
        }
        Ok(receivers)
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        let rx = self
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe();
        let channel = channel.to_string();
        let stream = stream::unfold((rx, channel), |(mut rx, channel)| async move {
            loop {
                match rx.recv().await {
                    Ok(payload) => return Some((payload, (rx, channel))),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(channel = %channel, skipped, "⚠️ subscriber lagged, frames dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(stream.boxed())
    }
}

#[async_trait]
impl PendingQueue for MemoryBroker {
    async fn enqueue(&self, user_id: &str, payload: &str) -> Result<()> {
        self.queues
            .entry(user_id.to_string())
            .or_default()
            .push(payload.to_string());
        Ok(())
    }

    async fn drain_all(&self, user_id: &str) -> Result<Vec<String>> {
        Ok(self
            .queues
            .remove(user_id)
            .map(|(_, queue)| queue)
            .unwrap_or_default())
    }
}

#[async_trait]
impl IntakeLog for MemoryBroker {
    async fn append(&self, fields: &[(String, String)]) -> Result<String> {
        let id = {
            let mut state = self.log.lock();
            let id = format!("{}-0", state.entries.len() + 1);
            state.entries.push(LogEntry {
                id: id.clone(),
                fields: fields.iter().cloned().collect(),
            });
            id
        };
        self.appended.notify_waiters();
        Ok(id)
    }

    async fn create_group(&self, group: &str) -> Result<()> {
        self.log.lock().groups.entry(group.to_string()).or_default();
        Ok(())
    }

    async fn read_group(
        &self,
        group: &str,
        consumer: &str,
        cursor: &ReadCursor,
        count: usize,
        block: Duration,
    ) -> Result<Vec<LogEntry>> {
        if let ReadCursor::Pending { after } = cursor {
            let after = entry_seq(after).unwrap_or(0);
            let state = self.log.lock();
            let Some(g) = state.groups.get(group) else {
                bail!("NOGROUP no such consumer group '{}'", group);
            };
            return Ok(g
                .pending
                .iter()
                .filter(|(index, owner)| **index + 1 > after && owner.as_str() == consumer)
                .take(count.max(1))
                .map(|(index, _)| state.entries[*index].clone())
                .collect());
        }

        let deadline = tokio::time::Instant::now() + block;
        loop {
            let notified = self.appended.notified();
            {
                let mut state = self.log.lock();
                let batch = Self::take_new(&mut state, group, consumer, count)?;
                if !batch.is_empty() {
                    return Ok(batch);
                }
            }
            if block.is_zero() || tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn ack(&self, group: &str, ids: &[String]) -> Result<usize> {
        let mut state = self.log.lock();
        let Some(g) = state.groups.get_mut(group) else {
            return Ok(0);
        };
        Ok(ids
            .iter()
            .filter_map(|id| entry_seq(id))
            .filter(|seq| *seq > 0 && g.pending.remove(&(seq - 1)).is_some())
            .count())
    }
}

#[async_trait]
impl PresenceSet for MemoryBroker {
    async fn add(&self, user_id: &str) -> Result<()> {
        self.online.insert(user_id.to_string());
        Ok(())
    }

    async fn remove(&self, user_id: &str) -> Result<()> {
        self.online.remove(user_id);
        Ok(())
    }

    async fn contains(&self, user_id: &str) -> Result<bool> {
        Ok(self.online.contains(user_id))
    }

    async fn members(&self) -> Result<Vec<String>> {
        let mut members: Vec<String> = self.online.iter().map(|u| u.key().clone()).collect();
        members.sort();
        Ok(members)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(content: &str) -> Vec<(String, String)> {
        vec![("content".to_string(), content.to_string())]
    }

    #[tokio::test]
    async fn test_drain_is_fifo_and_exactly_once() {
        let broker = MemoryBroker::new();
        broker.enqueue("bob", "A").await.unwrap();
        broker.enqueue("bob", "B").await.unwrap();
        assert_eq!(broker.drain_all("bob").await.unwrap(), vec!["A", "B"]);
        assert!(broker.drain_all("bob").await.unwrap().is_empty());
        assert!(broker.drain_all("nobody").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_presence_set_is_idempotent() {
        let broker = MemoryBroker::new();
        broker.add("alice").await.unwrap();
        broker.add("alice").await.unwrap();
        broker.remove("alice").await.unwrap();
        assert!(!broker.contains("alice").await.unwrap());
        broker.remove("alice").await.unwrap();
        broker.add("bob").await.unwrap();
        let online = broker
            .filter_members(&["alice".to_string(), "bob".to_string()])
            .await
            .unwrap();
        assert_eq!(online, vec!["bob"]);
    }

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let broker = MemoryBroker::new();
        assert_eq!(broker.publish("user:bob", "dropped").await.unwrap(), 0);
        let mut sub = broker.subscribe("user:bob").await.unwrap();
        assert_eq!(broker.publish("user:bob", "hello").await.unwrap(), 1);
        assert_eq!(sub.next().await.as_deref(), Some("hello"));
        drop(sub);
        assert_eq!(broker.publish("user:bob", "gone").await.unwrap(), 0);
        assert_eq!(broker.subscriber_count("user:bob"), 0);
    }

    #[tokio::test]
    async fn test_group_read_ack_and_redelivery() {
        let broker = MemoryBroker::new();
        assert!(broker
            .read_group("g", "w1", &ReadCursor::New, 10, Duration::ZERO)
            .await
            .is_err());
        broker.create_group("g").await.unwrap();
        broker.create_group("g").await.unwrap();
        for i in 0..3 {
            broker.append(&fields(&i.to_string())).await.unwrap();
        }

        let first = broker
            .read_group("g", "w1", &ReadCursor::New, 2, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(broker.ack("g", &[first[0].id.clone()]).await.unwrap(), 1);
        assert_eq!(broker.ack("g", &[first[0].id.clone()]).await.unwrap(), 0);

        let pending = broker
            .read_group("g", "w1", &ReadCursor::pending_from_start(), 10, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(pending, vec![first[1].clone()]);
        let other = broker
            .read_group("g", "w2", &ReadCursor::pending_from_start(), 10, Duration::ZERO)
            .await
            .unwrap();
        assert!(other.is_empty());

        let rest = broker
            .read_group("g", "w1", &ReadCursor::New, 10, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].fields["content"], "2");
        assert_eq!(broker.pending_count("g"), 2);
    }

    #[tokio::test]
    async fn test_blocking_read_wakes_on_append() {
        let broker = std::sync::Arc::new(MemoryBroker::new());
        broker.create_group("g").await.unwrap();
        let reader = {
            let broker = broker.clone();
            tokio::spawn(async move {
                broker
                    .read_group("g", "w1", &ReadCursor::New, 10, Duration::from_secs(5))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        broker.append(&fields("late")).await.unwrap();
        let entries = reader.await.unwrap().unwrap();
        assert_eq!(entries.len(), 1);

        let empty = broker
            .read_group("g", "w1", &ReadCursor::New, 10, Duration::from_millis(10))
            .await
            .unwrap();
        assert!(empty.is_empty());
    }
}
