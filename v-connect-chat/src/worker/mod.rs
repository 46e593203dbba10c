//! 持久化 worker：消费入库日志，批量写入消息表 / Persistence worker: consumes the intake log and batches rows into the sink

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::{watch, Mutex};
use tokio::time::{interval_at, Instant};
use tracing::{debug, error, info, warn};

use crate::broker::{IntakeLog, LogEntry, ReadCursor};
use crate::config::{AckPolicy, WorkerConfig};
use crate::domain::ChatMessage;
use crate::storage::MessageSink;

/// 读取失败后的退避 / Backoff after a failed read
const READ_BACKOFF: Duration = Duration::from_secs(1);

struct Buffered {
    entry_id: String,
    message: ChatMessage,
}

pub struct PersistenceWorker {
    intake: Arc<dyn IntakeLog>,
    sink: Arc<dyn MessageSink>,
    config: WorkerConfig,
    buffer: Mutex<Vec<Buffered>>,
}

impl PersistenceWorker {
    pub fn new(intake: Arc<dyn IntakeLog>, sink: Arc<dyn MessageSink>, config: WorkerConfig) -> Self {
        Self {
            intake,
            sink,
            config,
            buffer: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub async fn buffered(&self) -> usize {
        self.buffer.lock().await.len()
    }

    /// 运行直到收到关闭信号，退出前冲刷剩余缓冲 / Run until shutdown, flushing what is left before returning
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            group = %self.config.consumer_group,
            consumer = %self.config.consumer_name,
            batch_size = self.config.batch_size,
            ack_policy = ?self.config.ack_policy,
            "🚀 persistence worker starting"
        );
        if let Err(e) = self.intake.create_group(&self.config.consumer_group).await {
            error!("❌ failed to create consumer group: {}", e);
        }

        let ticker = {
            let worker = self.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { worker.tick_loop(shutdown).await })
        };

        if let Err(e) = self.recover_pending().await {
            warn!("⚠️ pending entry recovery failed: {}", e);
        }

        while !*shutdown.borrow() {
            if let Err(e) = self.poll_once().await {
                warn!("⚠️ intake read failed: {}", e);
                tokio::select! {
                    _ = tokio::time::sleep(READ_BACKOFF) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() { break; }
                    }
                }
            }
        }

        if let Err(e) = ticker.await {
            warn!("flush ticker ended abnormally: {}", e);
        }
        match self.flush().await {
            Ok(n) => info!(flushed = n, "🛑 persistence worker drained and stopped"),
            Err(e) => error!("❌ final flush failed, buffered entries stay pending: {}", e),
        }
    }

    async fn tick_loop(&self, mut shutdown: watch::Receiver<bool>) {
        let period = self.config.flush_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let _ = self.flush().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() { break; }
                }
            }
        }
    }

    /// 重放本消费者已投递未确认的条目 / Replay entries delivered to this consumer but never acknowledged
    pub async fn recover_pending(&self) -> Result<usize> {
        let mut after = "0".to_string();
        let mut total = 0;
        loop {
            let entries = self
                .intake
                .read_group(
                    &self.config.consumer_group,
                    &self.config.consumer_name,
                    &ReadCursor::Pending { after },
                    self.config.batch_size,
                    Duration::ZERO,
                )
                .await?;
            let Some(last) = entries.last() else { break };
            after = last.id.clone();
            total += entries.len();
            self.ingest(entries).await;
        }
        if total > 0 {
            info!(recovered = total, "♻️ recovered unacknowledged intake entries");
        }
        Ok(total)
    }

    /// 读取一批新条目 / Read one batch of new entries
    pub async fn poll_once(&self) -> Result<usize> {
        let entries = self
            .intake
            .read_group(
                &self.config.consumer_group,
                &self.config.consumer_name,
                &ReadCursor::New,
                self.config.batch_size,
                self.config.read_block,
            )
            .await?;
        let read = entries.len();
        if read > 0 {
            debug!(read, "📥 intake entries read");
            self.ingest(entries).await;
        }
        Ok(read)
    }

    async fn ingest(&self, entries: Vec<LogEntry>) {
        let mut parsed = Vec::with_capacity(entries.len());
        let mut dropped = Vec::new();
        for entry in entries {
            match ChatMessage::from_intake_fields(&entry.fields) {
                Some(message) => parsed.push(Buffered {
                    entry_id: entry.id,
                    message,
                }),
                None => {
                    warn!(entry_id = %entry.id, "🗑️ dropping malformed intake entry");
                    dropped.push(entry.id);
                }
            }
        }
        self.ack(&dropped).await;

        let parsed_ids: Vec<String> = match self.config.ack_policy {
            AckPolicy::AfterParse => parsed.iter().map(|b| b.entry_id.clone()).collect(),
            AckPolicy::AfterFlush => Vec::new(),
        };
        self.buffer_messages(parsed).await;
        self.ack(&parsed_ids).await;
    }

    async fn buffer_messages(&self, messages: Vec<Buffered>) {
        let mut buffer = self.buffer.lock().await;
        let mut flush_failed = false;
        for message in messages {
            buffer.push(message);
            if !flush_failed && buffer.len() >= self.config.batch_size {
                flush_failed = self.flush_locked(&mut buffer).await.is_err();
            }
        }
    }

    /// 冲刷缓冲；失败时保留缓冲等待下次触发 / Flush the buffer, keeping it for the next trigger on failure
    pub async fn flush(&self) -> Result<usize> {
        let mut buffer = self.buffer.lock().await;
        self.flush_locked(&mut buffer).await
    }

    async fn flush_locked(&self, buffer: &mut Vec<Buffered>) -> Result<usize> {
        if buffer.is_empty() {
            return Ok(0);
        }
        let messages: Vec<ChatMessage> = buffer.iter().map(|b| b.message.clone()).collect();
        if let Err(e) = self.sink.create_batch(&messages).await {
            error!(
                batch = messages.len(),
                transient = e.is_transient(),
                "❌ batch insert failed, buffer retained: {}",
                v::describe_error(&e)
            );
            return Err(e.into());
        }
        if self.config.ack_policy == AckPolicy::AfterFlush {
            let ids: Vec<String> = buffer.iter().map(|b| b.entry_id.clone()).collect();
            self.ack(&ids).await;
        }
        buffer.clear();
        info!(batch = messages.len(), "💾 flushed message batch");
        Ok(messages.len())
    }

    async fn ack(&self, ids: &[String]) {
        if ids.is_empty() {
            return;
        }
        if let Err(e) = self.intake.ack(&self.config.consumer_group, ids).await {
            warn!(count = ids.len(), "⚠️ intake ack failed, entries will be redelivered: {}", e);
        }
    }
}
