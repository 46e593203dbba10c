use thiserror::Error;
use v::DbError;

/// 错误分类 / Error classes as seen by the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// 客户端协议错误 / Malformed frame or missing field
    Protocol,
    /// 授权错误 / Sender is not allowed to post here
    Authorization,
    /// 协作方查询失败 / Conversation store unreachable or conversation missing
    Lookup,
    /// 内部错误 / Serialization and other internal failures
    Internal,
}

/// 聊天处理错误 / Errors raised while handling one inbound frame
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("消息格式无效 / invalid message format")]
    InvalidFormat,
    #[error("缺少字段 / missing field: {0}")]
    MissingField(&'static str),
    #[error("非会话参与者 / sender is not a participant")]
    NotParticipant,
    #[error("会话不存在 / conversation not found")]
    ConversationNotFound,
    #[error("存储错误 / store error: {0}")]
    Store(#[from] DbError),
    #[error("请求校验失败 / validation failed: {0}")]
    Validation(String),
    #[error("序列化错误 / encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

impl ChatError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ChatError::InvalidFormat | ChatError::MissingField(_) | ChatError::Validation(_) => {
                ErrorClass::Protocol
            }
            ChatError::NotParticipant => ErrorClass::Authorization,
            ChatError::ConversationNotFound | ChatError::Store(_) => ErrorClass::Lookup,
            ChatError::Encode(_) => ErrorClass::Internal,
        }
    }

    /// 写入错误帧的文本 / Text placed in the client error frame
    pub fn client_message(&self) -> String {
        match self {
            ChatError::InvalidFormat => "Invalid message format".to_string(),
            ChatError::MissingField(field) => format!("{} is required", field),
            ChatError::NotParticipant => "You are not a participant of this conversation".to_string(),
            ChatError::ConversationNotFound => "Conversation not found".to_string(),
            ChatError::Store(_) | ChatError::Encode(_) => "Internal server error".to_string(),
            ChatError::Validation(msg) => msg.clone(),
        }
    }
}

/// 鉴权错误 / Token validation errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("缺少令牌 / missing token")]
    Missing,
    #[error("令牌已过期 / token has expired")]
    Expired,
    #[error("令牌无效 / invalid token")]
    Invalid,
    #[error("鉴权服务不可用 / auth service unavailable: {0}")]
    Unavailable(String),
}

impl AuthError {
    pub fn client_message(&self) -> &'static str {
        match self {
            AuthError::Missing => "Missing token",
            AuthError::Expired => "Token has expired",
            AuthError::Invalid => "Invalid token",
            AuthError::Unavailable(_) => "Authentication unavailable",
        }
    }
}

/// 连接注册表错误 / Connection registry errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("用户已连接 / user {user_id} is already connected")]
    AlreadyConnected { user_id: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_messages() {
        assert_eq!(ChatError::MissingField("content").client_message(), "content is required");
        assert_eq!(ChatError::InvalidFormat.client_message(), "Invalid message format");
        assert_eq!(ChatError::ConversationNotFound.class(), ErrorClass::Lookup);
        assert_eq!(ChatError::NotParticipant.class(), ErrorClass::Authorization);
        let store = ChatError::Store(DbError::Pool("timeout".into()));
        assert_eq!(store.client_message(), "Internal server error");
        assert_eq!(AuthError::Expired.client_message(), "Token has expired");
    }
}
