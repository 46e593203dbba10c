use thiserror::Error;

pub type Result<T> = std::result::Result<T, DbError>;

/// 存储层错误 / Storage error shared by every store and sink
#[derive(Debug, Error)]
pub enum DbError {
    #[error("数据库配置无效 / invalid database config: {0}")]
    Config(String),
    #[error("无法获取连接 / pool unavailable: {0}")]
    Pool(String),
    #[error("查询失败 / query failed: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("记录不存在 / record not found")]
    NotFound,
    #[error("事务失败 / transaction failed: {0}")]
    Tx(String),
    #[error("JSON 编解码失败 / json codec failed: {0}")]
    Serde(#[from] serde_json::Error),
}

impl DbError {
    /// 重试可能成功（连接或事务层面的失败）/ Whether a retry may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            DbError::Pool(_) | DbError::Tx(_) => true,
            DbError::Sqlx(err) => matches!(
                err,
                sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed
            ),
            DbError::Config(_) | DbError::NotFound | DbError::Serde(_) => false,
        }
    }
}

/// 日志用的中英文描述 / Bilingual description for log lines
pub fn describe_error(e: &DbError) -> String {
    let kind = match e {
        DbError::Config(_) => "config",
        DbError::Pool(_) => "pool",
        DbError::Sqlx(_) => "query",
        DbError::NotFound => "not_found",
        DbError::Tx(_) => "tx",
        DbError::Serde(_) => "serde",
    };
    format!("[{}] {}", kind, e)
}
