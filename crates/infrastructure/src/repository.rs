//! PostgreSQL 仓储实现
//!
//! 行记录与领域实体之间经 `TryFrom` 转换；嵌套集合（成员、回执、
//! 表态、内容载荷）以 JSONB 存储，标量字段按列存储。
//! 消息写入与会话摘要推进在同一事务内完成。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use application::{ConversationRepository, MessageRepository};
use domain::{
    Conversation, ConversationId, ConversationKind, ConversationStatus, Message, MessageId,
    MessageStatus, Receipt, RepositoryError, Timestamp, UserId,
};

fn map_sqlx_err(err: sqlx::Error) -> RepositoryError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => RepositoryError::Conflict,
        sqlx::Error::RowNotFound => RepositoryError::NotFound,
        _ => RepositoryError::storage(err.to_string()),
    }
}

fn invalid_data(message: impl Into<String>) -> RepositoryError {
    RepositoryError::storage(message)
}

fn kind_to_str(kind: ConversationKind) -> &'static str {
    match kind {
        ConversationKind::Direct => "direct",
        ConversationKind::Group => "group",
    }
}

fn kind_from_str(value: &str) -> Result<ConversationKind, RepositoryError> {
    match value {
        "direct" => Ok(ConversationKind::Direct),
        "group" => Ok(ConversationKind::Group),
        other => Err(invalid_data(format!("unknown conversation kind: {other}"))),
    }
}

fn conversation_status_to_str(status: ConversationStatus) -> &'static str {
    match status {
        ConversationStatus::Active => "active",
        ConversationStatus::Archived => "archived",
        ConversationStatus::Deleted => "deleted",
    }
}

fn conversation_status_from_str(value: &str) -> Result<ConversationStatus, RepositoryError> {
    match value {
        "active" => Ok(ConversationStatus::Active),
        "archived" => Ok(ConversationStatus::Archived),
        "deleted" => Ok(ConversationStatus::Deleted),
        other => Err(invalid_data(format!("unknown conversation status: {other}"))),
    }
}

fn message_status_to_str(status: MessageStatus) -> &'static str {
    match status {
        MessageStatus::Sent => "sent",
        MessageStatus::Delivered => "delivered",
        MessageStatus::Read => "read",
        MessageStatus::Failed => "failed",
    }
}

fn message_status_from_str(value: &str) -> Result<MessageStatus, RepositoryError> {
    match value {
        "sent" => Ok(MessageStatus::Sent),
        "delivered" => Ok(MessageStatus::Delivered),
        "read" => Ok(MessageStatus::Read),
        "failed" => Ok(MessageStatus::Failed),
        other => Err(invalid_data(format!("unknown message status: {other}"))),
    }
}

fn from_json<T: serde::de::DeserializeOwned>(
    value: serde_json::Value,
) -> Result<T, RepositoryError> {
    serde_json::from_value(value).map_err(|err| invalid_data(err.to_string()))
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<serde_json::Value, RepositoryError> {
    serde_json::to_value(value).map_err(|err| invalid_data(err.to_string()))
}

#[derive(Debug, FromRow)]
struct ConversationRecord {
    id: Uuid,
    kind: String,
    title: Option<String>,
    creator_id: Uuid,
    status: String,
    members: serde_json::Value,
    last_message: Option<serde_json::Value>,
    message_count: i64,
    settings: Option<serde_json::Value>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<ConversationRecord> for Conversation {
    type Error = RepositoryError;

    fn try_from(value: ConversationRecord) -> Result<Self, Self::Error> {
        Ok(Conversation {
            id: ConversationId::from(value.id),
            kind: kind_from_str(&value.kind)?,
            title: value.title,
            members: from_json(value.members)?,
            creator_id: UserId::from(value.creator_id),
            status: conversation_status_from_str(&value.status)?,
            last_message: value.last_message.map(from_json).transpose()?,
            message_count: value.message_count.max(0) as u64,
            settings: value.settings.map(from_json).transpose()?,
            created_at: value.created_at,
            updated_at: value.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct MessageRecord {
    id: Uuid,
    conversation_id: Uuid,
    sender_id: Uuid,
    content: serde_json::Value,
    status: String,
    reactions: serde_json::Value,
    delivered_to: serde_json::Value,
    read_by: serde_json::Value,
    reply_to: Option<serde_json::Value>,
    forwarded_from: Option<serde_json::Value>,
    is_edited: bool,
    edited_at: Option<DateTime<Utc>>,
    is_deleted: bool,
    hidden_for: serde_json::Value,
    expires_at: Option<DateTime<Utc>>,
    sent_at: DateTime<Utc>,
    updated_at: Option<DateTime<Utc>>,
}

impl TryFrom<MessageRecord> for Message {
    type Error = RepositoryError;

    fn try_from(value: MessageRecord) -> Result<Self, Self::Error> {
        Ok(Message {
            id: MessageId::from(value.id),
            conversation_id: ConversationId::from(value.conversation_id),
            sender_id: UserId::from(value.sender_id),
            content: from_json(value.content)?,
            status: message_status_from_str(&value.status)?,
            reactions: from_json(value.reactions)?,
            delivered_to: from_json(value.delivered_to)?,
            read_by: from_json(value.read_by)?,
            reply_to: value.reply_to.map(from_json).transpose()?,
            forwarded_from: value.forwarded_from.map(from_json).transpose()?,
            is_edited: value.is_edited,
            edited_at: value.edited_at,
            is_deleted: value.is_deleted,
            hidden_for: from_json(value.hidden_for)?,
            expires_at: value.expires_at,
            sent_at: value.sent_at,
            updated_at: value.updated_at,
        })
    }
}

const CONVERSATION_COLUMNS: &str = "id, kind, title, creator_id, status, members, last_message, \
     message_count, settings, created_at, updated_at";

const MESSAGE_COLUMNS: &str = "id, conversation_id, sender_id, content, status, reactions, \
     delivered_to, read_by, reply_to, forwarded_from, is_edited, edited_at, is_deleted, \
     hidden_for, expires_at, sent_at, updated_at";

pub struct PgConversationRepository {
    pool: PgPool,
}

impl PgConversationRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

async fn upsert_conversation<'e, E>(
    executor: E,
    conversation: &Conversation,
) -> Result<u64, RepositoryError>
where
    E: sqlx::PgExecutor<'e>,
{
    let result = sqlx::query(
        "UPDATE conversations SET kind = $2, title = $3, creator_id = $4, status = $5, \
         members = $6, last_message = $7, message_count = $8, settings = $9, updated_at = $10 \
         WHERE id = $1",
    )
    .bind(Uuid::from(conversation.id))
    .bind(kind_to_str(conversation.kind))
    .bind(&conversation.title)
    .bind(Uuid::from(conversation.creator_id))
    .bind(conversation_status_to_str(conversation.status))
    .bind(to_json(&conversation.members)?)
    .bind(conversation.last_message.as_ref().map(to_json).transpose()?)
    .bind(conversation.message_count as i64)
    .bind(conversation.settings.as_ref().map(to_json).transpose()?)
    .bind(conversation.updated_at)
    .execute(executor)
    .await
    .map_err(map_sqlx_err)?;
    Ok(result.rows_affected())
}

#[async_trait]
impl ConversationRepository for PgConversationRepository {
    async fn create(&self, conversation: Conversation) -> Result<Conversation, RepositoryError> {
        sqlx::query(
            "INSERT INTO conversations \
             (id, kind, title, creator_id, status, members, last_message, message_count, \
              settings, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
        )
        .bind(Uuid::from(conversation.id))
        .bind(kind_to_str(conversation.kind))
        .bind(&conversation.title)
        .bind(Uuid::from(conversation.creator_id))
        .bind(conversation_status_to_str(conversation.status))
        .bind(to_json(&conversation.members)?)
        .bind(conversation.last_message.as_ref().map(to_json).transpose()?)
        .bind(conversation.message_count as i64)
        .bind(conversation.settings.as_ref().map(to_json).transpose()?)
        .bind(conversation.created_at)
        .bind(conversation.updated_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(conversation)
    }

    async fn update(&self, conversation: Conversation) -> Result<Conversation, RepositoryError> {
        let affected = upsert_conversation(&self.pool, &conversation).await?;
        if affected == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(conversation)
    }

    async fn find_by_id(
        &self,
        id: ConversationId,
    ) -> Result<Option<Conversation>, RepositoryError> {
        let record = sqlx::query_as::<_, ConversationRecord>(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = $1"
        ))
        .bind(Uuid::from(id))
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        record.map(Conversation::try_from).transpose()
    }

    async fn find_by_member(&self, user_id: UserId) -> Result<Vec<Conversation>, RepositoryError> {
        let membership = json!([{ "user_id": user_id, "is_active": true }]);
        let records = sqlx::query_as::<_, ConversationRecord>(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations \
             WHERE members @> $1 ORDER BY updated_at DESC"
        ))
        .bind(membership)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        records.into_iter().map(Conversation::try_from).collect()
    }

    async fn find_direct_between(
        &self,
        a: UserId,
        b: UserId,
    ) -> Result<Option<Conversation>, RepositoryError> {
        let record = sqlx::query_as::<_, ConversationRecord>(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations \
             WHERE kind = 'direct' AND status <> 'deleted' \
               AND members @> $1 AND members @> $2 \
             LIMIT 1"
        ))
        .bind(json!([{ "user_id": a }]))
        .bind(json!([{ "user_id": b }]))
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        record.map(Conversation::try_from).transpose()
    }
}

pub struct PgMessageRepository {
    pool: PgPool,
}

impl PgMessageRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn update_message<'e, E>(
        executor: E,
        message: &Message,
    ) -> Result<u64, RepositoryError>
    where
        E: sqlx::PgExecutor<'e>,
    {
        let result = sqlx::query(
            "UPDATE messages SET content = $2, status = $3, reactions = $4, delivered_to = $5, \
             read_by = $6, is_edited = $7, edited_at = $8, is_deleted = $9, hidden_for = $10, \
             updated_at = $11 \
             WHERE id = $1",
        )
        .bind(Uuid::from(message.id))
        .bind(to_json(&message.content)?)
        .bind(message_status_to_str(message.status))
        .bind(to_json(&message.reactions)?)
        .bind(to_json(&message.delivered_to)?)
        .bind(to_json(&message.read_by)?)
        .bind(message.is_edited)
        .bind(message.edited_at)
        .bind(message.is_deleted)
        .bind(to_json(&message.hidden_for)?)
        .bind(message.updated_at)
        .execute(executor)
        .await
        .map_err(map_sqlx_err)?;
        Ok(result.rows_affected())
    }

    /// 回执追加为 0 行时区分「消息不存在」与「幂等 no-op」
    async fn resolve_noop(&self, message_id: MessageId) -> Result<bool, RepositoryError> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM messages WHERE id = $1)")
                .bind(Uuid::from(message_id))
                .fetch_one(&self.pool)
                .await
                .map_err(map_sqlx_err)?;
        if exists {
            Ok(false)
        } else {
            Err(RepositoryError::NotFound)
        }
    }
}

#[async_trait]
impl MessageRepository for PgMessageRepository {
    async fn create(
        &self,
        message: Message,
        conversation: &Conversation,
    ) -> Result<Message, RepositoryError> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_err)?;

        sqlx::query(
            "INSERT INTO messages \
             (id, conversation_id, sender_id, content, status, reactions, delivered_to, read_by, \
              reply_to, forwarded_from, is_edited, edited_at, is_deleted, hidden_for, expires_at, \
              sent_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)",
        )
        .bind(Uuid::from(message.id))
        .bind(Uuid::from(message.conversation_id))
        .bind(Uuid::from(message.sender_id))
        .bind(to_json(&message.content)?)
        .bind(message_status_to_str(message.status))
        .bind(to_json(&message.reactions)?)
        .bind(to_json(&message.delivered_to)?)
        .bind(to_json(&message.read_by)?)
        .bind(message.reply_to.as_ref().map(to_json).transpose()?)
        .bind(message.forwarded_from.as_ref().map(to_json).transpose()?)
        .bind(message.is_edited)
        .bind(message.edited_at)
        .bind(message.is_deleted)
        .bind(to_json(&message.hidden_for)?)
        .bind(message.expires_at)
        .bind(message.sent_at)
        .bind(message.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_err)?;

        let affected = upsert_conversation(&mut *tx, conversation).await?;
        if affected == 0 {
            return Err(RepositoryError::NotFound);
        }

        tx.commit().await.map_err(map_sqlx_err)?;
        Ok(message)
    }

    async fn update(&self, message: Message) -> Result<Message, RepositoryError> {
        let affected = Self::update_message(&self.pool, &message).await?;
        if affected == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(message)
    }

    // 回执以单条条件更新追加：判定与写入在同一语句内，
    // 并发追加各自只拼接自己的数组元素，互不覆盖。
    async fn append_delivery_receipt(
        &self,
        message_id: MessageId,
        receipt: Receipt,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            "UPDATE messages SET delivered_to = delivered_to || $2, \
             status = CASE WHEN status = 'sent' THEN 'delivered' ELSE status END, \
             updated_at = $3 \
             WHERE id = $1 AND sender_id <> $4 AND NOT delivered_to @> $5",
        )
        .bind(Uuid::from(message_id))
        .bind(to_json(&[receipt])?)
        .bind(receipt.at)
        .bind(Uuid::from(receipt.user_id))
        .bind(json!([{ "user_id": receipt.user_id }]))
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }
        self.resolve_noop(message_id).await
    }

    async fn append_read_receipt(
        &self,
        message_id: MessageId,
        receipt: Receipt,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            "UPDATE messages SET read_by = read_by || $2, \
             status = CASE WHEN status IN ('sent', 'delivered') THEN 'read' ELSE status END, \
             updated_at = $3 \
             WHERE id = $1 AND sender_id <> $4 AND NOT read_by @> $5",
        )
        .bind(Uuid::from(message_id))
        .bind(to_json(&[receipt])?)
        .bind(receipt.at)
        .bind(Uuid::from(receipt.user_id))
        .bind(json!([{ "user_id": receipt.user_id }]))
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }
        self.resolve_noop(message_id).await
    }

    async fn find_by_id(&self, id: MessageId) -> Result<Option<Message>, RepositoryError> {
        let record = sqlx::query_as::<_, MessageRecord>(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = $1"
        ))
        .bind(Uuid::from(id))
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        record.map(Message::try_from).transpose()
    }

    async fn list_recent(
        &self,
        conversation_id: ConversationId,
        limit: u32,
        before: Option<MessageId>,
    ) -> Result<Vec<Message>, RepositoryError> {
        // 游标消息的时间戳作为分页边界
        let cursor: Option<DateTime<Utc>> = match before {
            Some(before_id) => sqlx::query_scalar("SELECT sent_at FROM messages WHERE id = $1")
                .bind(Uuid::from(before_id))
                .fetch_optional(&self.pool)
                .await
                .map_err(map_sqlx_err)?,
            None => None,
        };

        let records = sqlx::query_as::<_, MessageRecord>(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages \
             WHERE conversation_id = $1 AND ($2::timestamptz IS NULL OR sent_at < $2) \
             ORDER BY sent_at DESC LIMIT $3"
        ))
        .bind(Uuid::from(conversation_id))
        .bind(cursor)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        records.into_iter().map(Message::try_from).collect()
    }

    async fn list_unread(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<Vec<Message>, RepositoryError> {
        // 粗筛在数据库侧，已读回执与隐藏集的判定复用领域逻辑
        let records = sqlx::query_as::<_, MessageRecord>(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages \
             WHERE conversation_id = $1 AND sender_id <> $2 AND is_deleted = FALSE"
        ))
        .bind(Uuid::from(conversation_id))
        .bind(Uuid::from(user_id))
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        let messages: Result<Vec<Message>, RepositoryError> =
            records.into_iter().map(Message::try_from).collect();
        Ok(messages?
            .into_iter()
            .filter(|m| m.is_unread_for(user_id))
            .collect())
    }

    async fn list_expired(&self, now: Timestamp) -> Result<Vec<Message>, RepositoryError> {
        let records = sqlx::query_as::<_, MessageRecord>(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages \
             WHERE expires_at IS NOT NULL AND expires_at <= $1 AND is_deleted = FALSE"
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        records.into_iter().map(Message::try_from).collect()
    }
}
