use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use tracing::{debug, info, warn};

use super::{
    pending_key, IntakeLog, LogEntry, PendingQueue, PresenceSet, PubSub, ReadCursor, Subscription,
    INTAKE_STREAM, ONLINE_SET,
};

/// Redis 后端 / Redis-backed broker
///
/// 阻塞式 XREADGROUP 使用独立连接，避免阻塞多路复用连接上的其它命令
/// Blocking XREADGROUP runs on its own connection so it never stalls
/// commands multiplexed on the shared one
#[derive(Clone)]
pub struct RedisBroker {
    client: redis::Client,
    conn: ConnectionManager,
    reader: ConnectionManager,
}

impl RedisBroker {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).with_context(|| format!("invalid redis url {}", url))?;
        let conn = ConnectionManager::new(client.clone())
            .await
            .context("connect redis")?;
        let reader = ConnectionManager::new(client.clone())
            .await
            .context("connect redis stream reader")?;
        info!("🔌 Redis broker connected: {}", url);
        Ok(Self {
            client,
            conn,
            reader,
        })
    }

    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

fn to_string_map(map: HashMap<String, redis::Value>) -> HashMap<String, String> {
    map.into_iter()
        .filter_map(|(k, v)| redis::from_redis_value::<String>(&v).ok().map(|v| (k, v)))
        .collect()
}

#[async_trait]
impl PubSub for RedisBroker {
    async fn publish(&self, channel: &str, payload: &str) -> Result<usize> {
        let mut conn = self.conn.clone();
        let receivers: i64 = conn.publish(channel, payload).await?;
        debug!(channel, receivers, "📤 published");
        Ok(usize::try_from(receivers).unwrap_or(0))
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .context("open redis pubsub connection")?;
        pubsub.subscribe(channel).await?;
        let channel = channel.to_string();
        let stream = pubsub.into_on_message().filter_map(move |msg| {
            let payload = msg.get_payload::<String>();
            let channel = channel.clone();
            async move {
                match payload {
                    Ok(payload) => Some(payload),
                    Err(e) => {
                        warn!(channel = %channel, "⚠️ non-text pubsub payload: {}", e);
                        None
                    }
                }
            }
        });
        Ok(stream.boxed())
    }
}

#[async_trait]
impl PendingQueue for RedisBroker {
    async fn enqueue(&self, user_id: &str, payload: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.rpush(pending_key(user_id), payload).await?;
        Ok(())
    }

    async fn drain_all(&self, user_id: &str) -> Result<Vec<String>> {
        let key = pending_key(user_id);
        let mut conn = self.conn.clone();
        let (items,): (Vec<String>,) = redis::pipe()
            .atomic()
            .lrange(&key, 0, -1)
            .del(&key)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(items)
    }
}

#[async_trait]
impl IntakeLog for RedisBroker {
    async fn append(&self, fields: &[(String, String)]) -> Result<String> {
        let mut conn = self.conn.clone();
        let id: String = conn.xadd(INTAKE_STREAM, "*", fields).await?;
        Ok(id)
    }

    async fn create_group(&self, group: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let created: redis::RedisResult<()> =
            conn.xgroup_create_mkstream(INTAKE_STREAM, group, "0").await;
        match created {
            Ok(()) => {
                info!(group, "🆕 consumer group created");
                Ok(())
            }
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn read_group(
        &self,
        group: &str,
        consumer: &str,
        cursor: &ReadCursor,
        count: usize,
        block: Duration,
    ) -> Result<Vec<LogEntry>> {
        let mut options = StreamReadOptions::default()
            .group(group, consumer)
            .count(count.max(1));
        let id = match cursor {
            ReadCursor::New => {
                if !block.is_zero() {
                    options = options.block(block.as_millis() as usize);
                }
                ">".to_string()
            }
            ReadCursor::Pending { after } => after.clone(),
        };
        let mut conn = self.reader.clone();
        let reply: Option<StreamReadReply> = conn
            .xread_options(&[INTAKE_STREAM], &[id.as_str()], &options)
            .await?;
        Ok(reply
            .map(|reply| {
                reply
                    .keys
                    .into_iter()
                    .flat_map(|key| key.ids)
                    .map(|entry| LogEntry {
                        id: entry.id,
                        fields: to_string_map(entry.map),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn ack(&self, group: &str, ids: &[String]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.clone();
        let acked: usize = conn.xack(INTAKE_STREAM, group, ids).await?;
        Ok(acked)
    }
}

#[async_trait]
impl PresenceSet for RedisBroker {
    async fn add(&self, user_id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.sadd(ONLINE_SET, user_id).await?;
        Ok(())
    }

    async fn remove(&self, user_id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.srem(ONLINE_SET, user_id).await?;
        Ok(())
    }

    async fn contains(&self, user_id: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        Ok(conn.sismember(ONLINE_SET, user_id).await?)
    }

    async fn members(&self) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let mut members: Vec<String> = conn.smembers(ONLINE_SET).await?;
        members.sort();
        Ok(members)
    }

    async fn filter_members(&self, candidates: &[String]) -> Result<Vec<String>> {
        if candidates.is_empty() {
            return Ok(Vec::new());
        }
        let mut pipe = redis::pipe();
        for candidate in candidates {
            pipe.sismember(ONLINE_SET, candidate);
        }
        let mut conn = self.conn.clone();
        let flags: Vec<bool> = pipe.query_async(&mut conn).await?;
        Ok(candidates
            .iter()
            .zip(flags)
            .filter_map(|(candidate, online)| online.then(|| candidate.clone()))
            .collect())
    }
}
