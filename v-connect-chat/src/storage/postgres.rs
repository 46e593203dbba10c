use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, QueryBuilder};
use tracing::debug;

use super::{ConversationStore, MessageSink};
use crate::domain::{
    ChatMessage, Conversation, ConversationKind, NewConversation, Participant, ParticipantRole,
};
use v::DbError;

/// 单条 INSERT 的最大行数（6 列，受 65535 参数上限约束）
/// Max rows per INSERT statement (6 binds per row, 65535 bind limit)
const INSERT_CHUNK: usize = 1000;

#[derive(sqlx::FromRow)]
struct ConversationRow {
    id: String,
    #[sqlx(rename = "type")]
    kind: String,
    name: Option<String>,
    created_by: Option<String>,
    created_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct ParticipantRow {
    conversation_id: String,
    user_id: String,
    username: Option<String>,
    role: Option<String>,
    joined_at: DateTime<Utc>,
    left_at: Option<DateTime<Utc>>,
}

impl From<ParticipantRow> for Participant {
    fn from(row: ParticipantRow) -> Self {
        Self {
            conversation_id: row.conversation_id,
            user_id: row.user_id,
            username: row.username,
            role: row.role.as_deref().and_then(ParticipantRole::parse),
            joined_at: row.joined_at,
            left_at: row.left_at,
        }
    }
}

impl ConversationRow {
    fn into_conversation(self, participants: Vec<Participant>) -> Conversation {
        Conversation {
            id: self.id,
            kind: if self.kind == "group" {
                ConversationKind::Group
            } else {
                ConversationKind::Direct
            },
            name: self.name,
            created_by: self.created_by,
            created_at: self.created_at,
            participants,
        }
    }
}

const PARTICIPANT_COLUMNS: &str = "p.conversation_id, p.user_id, u.username, p.role, p.joined_at, p.left_at";

/// PostgreSQL 会话存储 / PostgreSQL conversation store
#[derive(Clone)]
pub struct PgConversationStore {
    pool: PgPool,
}

impl PgConversationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn participants_of(&self, ids: &[String]) -> v::Result<HashMap<String, Vec<Participant>>> {
        let rows: Vec<ParticipantRow> = sqlx::query_as(&format!(
            "SELECT {} FROM conversation_participants p \
             LEFT JOIN users u ON u.id = p.user_id \
             WHERE p.conversation_id = ANY($1) ORDER BY p.joined_at",
            PARTICIPANT_COLUMNS
        ))
        .bind(ids)
        .fetch_all(&self.pool)
        .await?;
        let mut grouped: HashMap<String, Vec<Participant>> = HashMap::new();
        for row in rows {
            grouped
                .entry(row.conversation_id.clone())
                .or_default()
                .push(row.into());
        }
        Ok(grouped)
    }
}

#[async_trait]
impl ConversationStore for PgConversationStore {
    async fn participants(&self, conversation_id: &str) -> v::Result<Vec<Participant>> {
        let rows: Vec<ParticipantRow> = sqlx::query_as(&format!(
            "SELECT {} FROM conversation_participants p \
             LEFT JOIN users u ON u.id = p.user_id \
             WHERE p.conversation_id = $1 ORDER BY p.joined_at",
            PARTICIPANT_COLUMNS
        ))
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Participant::from).collect())
    }

    async fn conversations_for_user(&self, user_id: &str) -> v::Result<Vec<Conversation>> {
        let rows: Vec<ConversationRow> = sqlx::query_as(
            "SELECT c.id, c.type, c.name, c.created_by, c.created_at FROM conversations c \
             JOIN conversation_participants p ON p.conversation_id = c.id \
             WHERE p.user_id = $1 AND p.left_at IS NULL \
             ORDER BY c.updated_at DESC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        let ids: Vec<String> = rows.iter().map(|r| r.id.clone()).collect();
        let mut participants = self.participants_of(&ids).await?;
        Ok(rows
            .into_iter()
            .map(|row| {
                let members = participants.remove(&row.id).unwrap_or_default();
                row.into_conversation(members)
            })
            .collect())
    }

    async fn find_direct_conversation(&self, a: &str, b: &str) -> v::Result<Option<Conversation>> {
        let row: Option<ConversationRow> = sqlx::query_as(
            "SELECT c.id, c.type, c.name, c.created_by, c.created_at FROM conversations c \
             JOIN conversation_participants pa ON pa.conversation_id = c.id AND pa.user_id = $1 \
             JOIN conversation_participants pb ON pb.conversation_id = c.id AND pb.user_id = $2 \
             WHERE c.type = 'direct' LIMIT 1",
        )
        .bind(a)
        .bind(b)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => {
                let members = self.participants(&row.id).await?;
                Ok(Some(row.into_conversation(members)))
            }
            None => Ok(None),
        }
    }

    async fn create_conversation(&self, new: &NewConversation) -> v::Result<Conversation> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();
        let mut tx = v::begin_tx(&self.pool).await?;
        sqlx::query(
            "INSERT INTO conversations (id, type, name, created_by, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $5)",
        )
        .bind(&id)
        .bind(new.kind.as_str())
        .bind(new.name.as_deref())
        .bind(&new.created_by)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO conversation_participants (conversation_id, user_id, role, joined_at) ",
        );
        builder.push_values(new.members.iter(), |mut b, (user_id, role)| {
            b.push_bind(id.clone())
                .push_bind(user_id.clone())
                .push_bind(role.map(|r| r.as_str()))
                .push_bind(now);
        });
        builder.build().execute(&mut *tx).await?;
        tx.commit().await.map_err(|e| DbError::Tx(e.to_string()))?;

        let participants = new
            .members
            .iter()
            .map(|(user_id, role)| Participant {
                conversation_id: id.clone(),
                user_id: user_id.clone(),
                username: None,
                role: *role,
                joined_at: now,
                left_at: None,
            })
            .collect();
        Ok(Conversation {
            id,
            kind: new.kind,
            name: new.name.clone(),
            created_by: Some(new.created_by.clone()),
            created_at: now,
            participants,
        })
    }
}

/// PostgreSQL 消息仓库 / PostgreSQL message repository
#[derive(Clone)]
pub struct PgMessageRepository {
    pool: PgPool,
}

impl PgMessageRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MessageSink for PgMessageRepository {
    async fn create_batch(&self, messages: &[ChatMessage]) -> v::Result<()> {
        if messages.is_empty() {
            return Ok(());
        }
        let mut tx = v::begin_tx(&self.pool).await?;
        for chunk in messages.chunks(INSERT_CHUNK) {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO messages (id, conversation_id, sender_id, content, type, sent_at) ",
            );
            builder.push_values(chunk.iter(), |mut b, m| {
                b.push_bind(m.id.clone())
                    .push_bind(m.conversation_id.clone())
                    .push_bind(m.sender_id.clone())
                    .push_bind(m.content.clone())
                    .push_bind(m.msg_type.as_str())
                    .push_bind(m.sent_at);
            });
            builder.push(" ON CONFLICT (id) DO NOTHING");
            builder.build().execute(&mut *tx).await?;
        }
        tx.commit().await.map_err(|e| DbError::Tx(e.to_string()))?;
        debug!(batch = messages.len(), "💾 message batch committed");
        Ok(())
    }
}
