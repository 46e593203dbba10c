use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use serde::Deserialize;
use v::{ConfigManager, DbSettings};

use crate::domain::{ConversationKind, ParticipantRole};
use crate::registry::DuplicatePolicy;

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub ws_port: u16,
    pub node_id: String,
}

#[derive(Clone, Debug)]
pub struct AuthConfigLite {
    pub enabled: bool,
    pub center_url: String,
    pub timeout_ms: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BrokerBackend {
    Redis,
    Memory,
}

impl FromStr for BrokerBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "redis" => Ok(BrokerBackend::Redis),
            "memory" => Ok(BrokerBackend::Memory),
            other => Err(anyhow!("broker.backend 取值无效 / invalid broker.backend '{}' (redis|memory)", other)),
        }
    }
}

#[derive(Clone, Debug)]
pub struct BrokerConfig {
    pub backend: BrokerBackend,
    pub redis_url: String,
}

/// 入库日志确认时机 / When intake log entries are acknowledged
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AckPolicy {
    /// 批次提交成功后确认 / After the batch holding the entry is committed
    AfterFlush,
    /// 解析入缓冲后立即确认 / Right after the entry is parsed and buffered
    AfterParse,
}

impl FromStr for AckPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "after_flush" => Ok(AckPolicy::AfterFlush),
            "after_parse" => Ok(AckPolicy::AfterParse),
            other => Err(anyhow!(
                "worker.ack_policy 取值无效 / invalid worker.ack_policy '{}' (after_flush|after_parse)",
                other
            )),
        }
    }
}

#[derive(Clone, Debug)]
pub struct WorkerConfig {
    pub enabled: bool,
    pub consumer_group: String,
    pub consumer_name: String,
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub read_block: Duration,
    pub ack_policy: AckPolicy,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            consumer_group: "message-workers".to_string(),
            consumer_name: "node-local".to_string(),
            batch_size: 100,
            flush_interval: Duration::from_millis(500),
            read_block: Duration::from_millis(1000),
            ack_policy: AckPolicy::AfterFlush,
        }
    }
}

/// 内存存储的预置会话（`[[memory.conversations]]`）
/// Conversation preloaded into the memory store, from `[[memory.conversations]]`
#[derive(Clone, Debug, Deserialize)]
pub struct SeedConversation {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: ConversationKind,
    #[serde(default)]
    pub name: Option<String>,
    /// 首位成员为创建者，群聊中为管理员 / First member is the creator, admin in groups
    pub members: Vec<String>,
}

impl SeedConversation {
    fn validate(&self) -> Result<()> {
        match self.kind {
            ConversationKind::Direct if self.members.len() != 2 => {
                bail!("会话 {} 必须恰好两人 / direct conversation {} needs exactly two members", self.id, self.id)
            }
            ConversationKind::Group if self.members.len() < 2 => {
                bail!("会话 {} 至少两人 / group conversation {} needs at least two members", self.id, self.id)
            }
            _ => Ok(()),
        }
    }

    pub fn members_with_roles(&self) -> Vec<(&str, Option<ParticipantRole>)> {
        self.members
            .iter()
            .enumerate()
            .map(|(i, user_id)| {
                let role = match (self.kind, i) {
                    (ConversationKind::Direct, _) => None,
                    (ConversationKind::Group, 0) => Some(ParticipantRole::Admin),
                    (ConversationKind::Group, _) => Some(ParticipantRole::Member),
                };
                (user_id.as_str(), role)
            })
            .collect()
    }
}

/// 读取整数并检查目标类型的取值范围 / Read an integer and check it fits the target type
fn int_setting<T: TryFrom<i64>>(cm: &ConfigManager, key: &str, default: i64) -> Result<T> {
    let raw: i64 = cm.get_or(key, default);
    T::try_from(raw).map_err(|_| anyhow!("{} 超出范围 / {} is out of range: {}", key, key, raw))
}

/// 服务配置 / Service settings
#[derive(Clone, Debug)]
pub struct ChatConfig {
    pub server: ServerConfig,
    pub duplicate_policy: DuplicatePolicy,
    pub auth: AuthConfigLite,
    pub broker: BrokerConfig,
    /// 未配置 `database.url` 时为空，使用内存存储 / `None` without `database.url`, memory stores are used
    pub database: Option<DbSettings>,
    pub worker: WorkerConfig,
    /// 仅在未配置数据库时载入 / Only loaded into the memory store when no database is set
    pub seed_conversations: Vec<SeedConversation>,
    pub log_level: String,
}

impl ChatConfig {
    pub fn load(cm: &ConfigManager) -> Result<Self> {
        let node_id: String = cm.get_or("server.node_id", "node-local".to_string());
        let server = ServerConfig {
            host: cm.get_or("server.host", "127.0.0.1".to_string()),
            ws_port: int_setting(cm, "server.ws_port", 5200)?,
            node_id: node_id.clone(),
        };
        let duplicate_policy =
            cm.get_or("session.duplicate_policy", "replace".to_string()).parse()?;
        let auth = AuthConfigLite {
            enabled: cm.get_or("auth.enabled", false),
            center_url: cm.get_or("auth.center_url", "http://127.0.0.1:8090".to_string()),
            timeout_ms: int_setting(cm, "auth.timeout_ms", 1000)?,
        };
        let broker = BrokerConfig {
            backend: cm.get_or("broker.backend", "redis".to_string()).parse()?,
            redis_url: cm.get_or("redis.url", "redis://127.0.0.1:6379".to_string()),
        };
        let database = if cm.exists("database.url") {
            Some(DbSettings::from_config(cm).map_err(|e| anyhow!(v::describe_error(&e)))?)
        } else {
            None
        };
        let batch_size: usize = int_setting(cm, "worker.batch_size", 100)?;
        if batch_size == 0 {
            return Err(anyhow!("worker.batch_size 必须为正数 / worker.batch_size must be positive"));
        }
        let worker = WorkerConfig {
            enabled: cm.get_or("worker.enabled", true),
            consumer_group: cm.get_or("worker.consumer_group", "message-workers".to_string()),
            consumer_name: cm.get_or("worker.consumer_name", node_id),
            batch_size,
            flush_interval: Duration::from_millis(int_setting(cm, "worker.flush_interval_ms", 500)?),
            read_block: Duration::from_millis(int_setting(cm, "worker.read_block_ms", 1000)?),
            ack_policy: cm.get_or("worker.ack_policy", "after_flush".to_string()).parse()?,
        };
        let seed_conversations: Vec<SeedConversation> = if cm.exists("memory.conversations") {
            cm.get("memory.conversations")?
        } else {
            Vec::new()
        };
        for seed in &seed_conversations {
            seed.validate()?;
        }
        Ok(Self {
            server,
            duplicate_policy,
            auth,
            broker,
            database,
            worker,
            seed_conversations,
            log_level: cm.get_or("logging.level", "info".to_string()),
        })
    }
}
