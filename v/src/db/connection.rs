use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{Pool, Postgres};

use crate::comm::config::ConfigManager;
use crate::db::error::{DbError, Result};
use crate::{HealthCheck, HealthStatus};

/// 数据库连接设置 / PostgreSQL connection settings
#[derive(Debug, Clone)]
pub struct DbSettings {
    pub url: String,
    pub max_connections: u32,
    pub connect_timeout: Duration,
}

impl DbSettings {
    /// 从配置读取 / Read from configuration
    ///
    /// 读取配置键 / Reads keys: `database.url`, `database.max_connections`,
    /// `database.connect_timeout_ms`
    pub fn from_config(cm: &ConfigManager) -> Result<Self> {
        let url: String = cm
            .get("database.url")
            .map_err(|_| DbError::Config("database.url 未配置 / database.url is not set".into()))?;
        if url.trim().is_empty() {
            return Err(DbError::Config("database.url 为空 / database.url is empty".into()));
        }
        let raw = cm.get_or::<i64>("database.max_connections", 10);
        let max_connections = u32::try_from(raw)
            .ok()
            .filter(|n| *n > 0)
            .ok_or_else(|| {
                DbError::Config(format!(
                    "database.max_connections 超出范围 / database.max_connections out of range: {}",
                    raw
                ))
            })?;
        Ok(Self {
            url,
            max_connections,
            connect_timeout: cm.get_duration_ms("database.connect_timeout_ms", 5000),
        })
    }
}

/// 建立 PostgreSQL 连接池 / Open a PostgreSQL pool
pub async fn connect_pg(settings: &DbSettings) -> Result<Pool<Postgres>> {
    PgPoolOptions::new()
        .max_connections(settings.max_connections)
        .min_connections(1)
        .max_lifetime(Some(Duration::from_secs(1800)))
        .idle_timeout(Some(Duration::from_secs(300)))
        .acquire_timeout(settings.connect_timeout)
        .connect(&settings.url)
        .await
        .map_err(|e| DbError::Pool(e.to_string()))
}

/// 健康检查 / Health check
///
/// 执行 `SELECT 1` 验证连接可用 / runs `SELECT 1`
pub async fn check_health(pool: &Pool<Postgres>) -> Result<()> {
    sqlx::query("SELECT 1")
        .execute(pool)
        .await
        .map(|_| ())
        .map_err(DbError::from)
}

#[async_trait]
impl HealthCheck for Pool<Postgres> {
    async fn check_health(&self) -> HealthStatus {
        match check_health(self).await {
            Ok(()) => HealthStatus::now("postgres_pool", true, Some("OK".to_string())),
            Err(e) => HealthStatus::now("postgres_pool", false, Some(e.to_string())),
        }
    }
}

/// 开启事务 / Begin transaction
pub async fn begin_tx(pool: &Pool<Postgres>) -> Result<sqlx::Transaction<'_, Postgres>> {
    pool.begin().await.map_err(|e| DbError::Tx(e.to_string()))
}
