use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ChatError;

/// 消息类型 / Message content type
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    #[default]
    Text,
    Image,
    File,
    Audio,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Text => "text",
            MessageType::Image => "image",
            MessageType::File => "file",
            MessageType::Audio => "audio",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(MessageType::Text),
            "image" => Ok(MessageType::Image),
            "file" => Ok(MessageType::File),
            "audio" => Ok(MessageType::Audio),
            other => Err(format!("unknown message type: {}", other)),
        }
    }
}

/// 客户端上行帧 / Inbound client frame
#[derive(Deserialize, Debug, Clone)]
pub struct InboundFrame {
    #[serde(default)]
    pub conversation_id: String,
    #[serde(default)]
    pub content: String,
    #[serde(rename = "type", default)]
    pub msg_type: Option<MessageType>,
}

impl InboundFrame {
    /// 解析并校验上行帧 / Parse and validate a raw text frame
    pub fn parse(raw: &str) -> Result<Self, ChatError> {
        let frame: InboundFrame = serde_json::from_str(raw).map_err(|_| ChatError::InvalidFormat)?;
        if frame.conversation_id.trim().is_empty() {
            return Err(ChatError::MissingField("conversation_id"));
        }
        if frame.content.trim().is_empty() {
            return Err(ChatError::MissingField("content"));
        }
        Ok(frame)
    }
}

/// 下行消息（构造后不可变）/ Outgoing message, immutable once built
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct OutgoingMessage {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_username: Option<String>,
    pub content: String,
    #[serde(rename = "type")]
    pub msg_type: MessageType,
    pub sent_at: i64,
}

impl OutgoingMessage {
    pub fn new(
        conversation_id: impl Into<String>,
        sender_id: impl Into<String>,
        sender_username: Option<String>,
        content: impl Into<String>,
        msg_type: MessageType,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id: conversation_id.into(),
            sender_id: sender_id.into(),
            sender_username,
            content: content.into(),
            msg_type,
            sent_at: Utc::now().timestamp_millis(),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// 展开为入库日志字段 / Flatten into intake log fields
    ///
    /// `data` 保存完整 JSON，其余字段供 worker 直接读取
    /// `data` carries the full JSON, the remaining fields are read by the worker
    pub fn to_intake_fields(&self) -> Result<Vec<(String, String)>, serde_json::Error> {
        let mut fields = vec![
            ("data".to_string(), self.to_json()?),
            ("id".to_string(), self.id.clone()),
            ("conversation_id".to_string(), self.conversation_id.clone()),
            ("sender_id".to_string(), self.sender_id.clone()),
            ("content".to_string(), self.content.clone()),
            ("type".to_string(), self.msg_type.to_string()),
            ("sent_at".to_string(), self.sent_at.to_string()),
        ];
        if let Some(name) = &self.sender_username {
            fields.push(("sender_username".to_string(), name.clone()));
        }
        Ok(fields)
    }
}

/// 持久化消息 / Message row in the system of record
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ChatMessage {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub content: String,
    pub msg_type: MessageType,
    pub sent_at: DateTime<Utc>,
}

impl ChatMessage {
    /// 从入库日志字段解析 / Parse from intake log fields
    ///
    /// 缺少 id / conversation_id / sender_id / content 时返回 `None`；
    /// 类型缺省为 text，`sent_at` 无法解析时取当前时间
    /// Returns `None` when a required field is missing; type defaults to text and
    /// an unparsable `sent_at` falls back to now
    pub fn from_intake_fields(fields: &HashMap<String, String>) -> Option<Self> {
        let required = |key: &str| fields.get(key).filter(|v| !v.is_empty()).cloned();
        let id = required("id")?;
        let conversation_id = required("conversation_id")?;
        let sender_id = required("sender_id")?;
        let content = required("content")?;

        let msg_type = fields
            .get("type")
            .and_then(|t| t.parse::<MessageType>().ok())
            .unwrap_or_default();
        let sent_at = fields
            .get("sent_at")
            .and_then(|s| s.parse::<i64>().ok())
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .unwrap_or_else(Utc::now);

        Some(Self {
            id,
            conversation_id,
            sender_id,
            content,
            msg_type,
            sent_at,
        })
    }
}

impl From<&OutgoingMessage> for ChatMessage {
    fn from(msg: &OutgoingMessage) -> Self {
        Self {
            id: msg.id.clone(),
            conversation_id: msg.conversation_id.clone(),
            sender_id: msg.sender_id.clone(),
            content: msg.content.clone(),
            msg_type: msg.msg_type,
            sent_at: Utc
                .timestamp_millis_opt(msg.sent_at)
                .single()
                .unwrap_or_else(Utc::now),
        }
    }
}

/// 错误帧 / Error frame
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ErrorFrame {
    pub error: bool,
    pub message: String,
}

impl ErrorFrame {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            error: true,
            message: message.into(),
        }
    }
}

/// 在线状态 / Presence status
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Offline,
}

/// 在线状态事件 / Presence transition event
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PresenceEvent {
    #[serde(rename = "type")]
    pub kind: String,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    pub status: PresenceStatus,
}

impl PresenceEvent {
    pub fn new(user_id: impl Into<String>, username: Option<String>, status: PresenceStatus) -> Self {
        Self {
            kind: "presence".to_string(),
            user_id: user_id.into(),
            username,
            status,
        }
    }
}

/// 在线联系人快照 / Snapshot of online contacts
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PresenceList {
    #[serde(rename = "type")]
    pub kind: String,
    pub online_users: Vec<String>,
}

impl PresenceList {
    pub fn new(online_users: Vec<String>) -> Self {
        Self {
            kind: "presence_list".to_string(),
            online_users,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_inbound_frame() {
        let frame = InboundFrame::parse(r#"{"conversation_id":"c1","content":"hi"}"#).unwrap();
        assert_eq!(frame.conversation_id, "c1");
        assert_eq!(frame.msg_type, None);

        let frame = InboundFrame::parse(r#"{"conversation_id":"c1","content":"x","type":"image"}"#).unwrap();
        assert_eq!(frame.msg_type, Some(MessageType::Image));
    }

    #[test]
    fn test_parse_rejects_bad_frames() {
        assert!(matches!(InboundFrame::parse("not json"), Err(ChatError::InvalidFormat)));
        assert!(matches!(
            InboundFrame::parse(r#"{"content":"hi"}"#),
            Err(ChatError::MissingField("conversation_id"))
        ));
        assert!(matches!(
            InboundFrame::parse(r#"{"conversation_id":"c1","content":""}"#),
            Err(ChatError::MissingField("content"))
        ));
        assert!(matches!(
            InboundFrame::parse(r#"{"conversation_id":"c1","content":"x","type":"video"}"#),
            Err(ChatError::InvalidFormat)
        ));
    }

    #[test]
    fn test_outgoing_wire_shape() {
        let msg = OutgoingMessage::new("c1", "alice", None, "hi", MessageType::Text);
        let value: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(value["type"], "text");
        assert_eq!(value["sender_id"], "alice");
        assert!(value.get("sender_username").is_none());
        assert!(value["sent_at"].is_i64());
    }

    #[test]
    fn test_intake_fields_parse_into_chat_message() {
        let msg = OutgoingMessage::new("c1", "alice", Some("Alice".into()), "hi", MessageType::Audio);
        let fields: HashMap<String, String> = msg.to_intake_fields().unwrap().into_iter().collect();
        let parsed = ChatMessage::from_intake_fields(&fields).unwrap();
        assert_eq!(parsed, ChatMessage::from(&msg));
    }

    #[test]
    fn test_intake_fields_defaults_and_missing() {
        let mut fields = HashMap::new();
        fields.insert("id".to_string(), "m1".to_string());
        fields.insert("conversation_id".to_string(), "c1".to_string());
        fields.insert("sender_id".to_string(), "alice".to_string());
        fields.insert("content".to_string(), "hi".to_string());
        fields.insert("sent_at".to_string(), "not-a-number".to_string());
        let parsed = ChatMessage::from_intake_fields(&fields).unwrap();
        assert_eq!(parsed.msg_type, MessageType::Text);

        fields.remove("content");
        assert!(ChatMessage::from_intake_fields(&fields).is_none());
    }

    #[test]
    fn test_presence_frames() {
        let event = PresenceEvent::new("bob", Some("Bob".into()), PresenceStatus::Offline);
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "presence");
        assert_eq!(value["status"], "offline");
        let list = serde_json::to_value(PresenceList::new(vec![])).unwrap();
        assert_eq!(list["type"], "presence_list");
        assert_eq!(list["online_users"], serde_json::json!([]));
    }
}
