// v 基础库：分层配置、日志、健康检查与 PostgreSQL 启动
// v base library: layered config, logging, health checks and PostgreSQL bootstrap

pub mod comm;
pub use crate::comm::config::*;
pub use crate::comm::tracing::init_tracing;
pub use config::FileFormat;

pub mod db;
pub use crate::db::connection::*;
pub use crate::db::error::*;

use async_trait::async_trait;

/// 组件健康快照 / Point-in-time health of one component
#[derive(Debug, serde::Serialize)]
pub struct HealthStatus {
    /// 组件名 / Component name, e.g. `postgres_pool`, `chat_server`
    pub component: String,
    pub healthy: bool,
    /// 细节或错误 / Details or the failure reason
    pub message: Option<String>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl HealthStatus {
    /// 以当前时间打点 / Stamp a status with the current time
    pub fn now(component: impl Into<String>, healthy: bool, message: Option<String>) -> Self {
        Self {
            component: component.into(),
            healthy,
            message,
            timestamp: chrono::Utc::now(),
        }
    }
}

/// 可自检的资源或服务 / A resource or service that can report its own health
#[async_trait]
pub trait HealthCheck {
    async fn check_health(&self) -> HealthStatus;
}
