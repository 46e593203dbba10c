use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ChatError;

const MAX_GROUP_NAME_LEN: usize = 255;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConversationKind {
    Direct,
    Group,
}

impl ConversationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationKind::Direct => "direct",
            ConversationKind::Group => "group",
        }
    }
}

/// 群组角色；单聊为空 / Group role, absent for direct chats
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantRole {
    Admin,
    Member,
}

impl ParticipantRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParticipantRole::Admin => "admin",
            ParticipantRole::Member => "member",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "admin" => Some(ParticipantRole::Admin),
            "member" => Some(ParticipantRole::Member),
            _ => None,
        }
    }
}

/// 会话参与者 / Conversation participant
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Participant {
    pub conversation_id: String,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    pub role: Option<ParticipantRole>,
    pub joined_at: DateTime<Utc>,
    pub left_at: Option<DateTime<Utc>>,
}

impl Participant {
    pub fn is_active(&self) -> bool {
        self.left_at.is_none()
    }
}

/// 会话 / Conversation
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Conversation {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: ConversationKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub participants: Vec<Participant>,
}

/// 创建会话请求（带判别字段）/ Tagged conversation creation request
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum CreateConversationRequest {
    Direct {
        participant_id: String,
    },
    Group {
        name: String,
        participant_ids: Vec<String>,
    },
}

/// 解析后的新会话 / Resolved conversation to create
#[derive(Debug, Clone, PartialEq)]
pub struct NewConversation {
    pub kind: ConversationKind,
    pub name: Option<String>,
    pub created_by: String,
    /// (user_id, role)，创建者在首位 / creator first
    pub members: Vec<(String, Option<ParticipantRole>)>,
}

impl CreateConversationRequest {
    /// 在边界处一次性解析 / Resolve once at the boundary
    pub fn resolve(self, creator: &str) -> Result<NewConversation, ChatError> {
        match self {
            CreateConversationRequest::Direct { participant_id } => {
                let other = participant_id.trim();
                if other.is_empty() {
                    return Err(ChatError::MissingField("participant_id"));
                }
                if other == creator {
                    return Err(ChatError::Validation(
                        "Cannot create a conversation with yourself".to_string(),
                    ));
                }
                Ok(NewConversation {
                    kind: ConversationKind::Direct,
                    name: None,
                    created_by: creator.to_string(),
                    members: vec![(creator.to_string(), None), (other.to_string(), None)],
                })
            }
            CreateConversationRequest::Group {
                name,
                participant_ids,
            } => {
                let name = name.trim().to_string();
                if name.is_empty() {
                    return Err(ChatError::MissingField("name"));
                }
                if name.chars().count() > MAX_GROUP_NAME_LEN {
                    return Err(ChatError::Validation(format!(
                        "Group name must be at most {} characters",
                        MAX_GROUP_NAME_LEN
                    )));
                }
                let mut members = vec![(creator.to_string(), Some(ParticipantRole::Admin))];
                for id in participant_ids {
                    let id = id.trim();
                    if id.is_empty() || members.iter().any(|(m, _)| m == id) {
                        continue;
                    }
                    members.push((id.to_string(), Some(ParticipantRole::Member)));
                }
                if members.len() < 2 {
                    return Err(ChatError::Validation(
                        "A group needs at least one other participant".to_string(),
                    ));
                }
                Ok(NewConversation {
                    kind: ConversationKind::Group,
                    name: Some(name),
                    created_by: creator.to_string(),
                    members,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tagged_request_parsing() {
        let direct: CreateConversationRequest =
            serde_json::from_str(r#"{"type":"direct","participant_id":"bob"}"#).unwrap();
        assert_eq!(
            direct,
            CreateConversationRequest::Direct {
                participant_id: "bob".into()
            }
        );
        let untagged = serde_json::from_str::<CreateConversationRequest>(r#"{"participant_id":"bob"}"#);
        assert!(untagged.is_err());
    }

    #[test]
    fn test_resolve_direct() {
        let conv = CreateConversationRequest::Direct {
            participant_id: "bob".into(),
        }
        .resolve("alice")
        .unwrap();
        assert_eq!(conv.kind, ConversationKind::Direct);
        assert_eq!(conv.members, vec![("alice".into(), None), ("bob".into(), None)]);

        let own = CreateConversationRequest::Direct {
            participant_id: "alice".into(),
        }
        .resolve("alice");
        assert!(matches!(own, Err(ChatError::Validation(_))));
    }

    #[test]
    fn test_resolve_group_dedupes_and_assigns_roles() {
        let conv = CreateConversationRequest::Group {
            name: " team ".into(),
            participant_ids: vec!["bob".into(), "alice".into(), "bob".into(), "carol".into()],
        }
        .resolve("alice")
        .unwrap();
        assert_eq!(conv.name.as_deref(), Some("team"));
        assert_eq!(
            conv.members,
            vec![
                ("alice".into(), Some(ParticipantRole::Admin)),
                ("bob".into(), Some(ParticipantRole::Member)),
                ("carol".into(), Some(ParticipantRole::Member)),
            ]
        );

        let lonely = CreateConversationRequest::Group {
            name: "solo".into(),
            participant_ids: vec!["alice".into()],
        }
        .resolve("alice");
        assert!(matches!(lonely, Err(ChatError::Validation(_))));
    }
}
