//! 持久化端口定义
//!
//! 会话与消息的仓储接口。持久化正确性从不依赖内存中的连接映射；
//! 这里的接口即外部持久化协作者的全部查询形状。

use async_trait::async_trait;
use domain::{
    Conversation, ConversationId, Message, MessageId, Receipt, RepositoryError, Timestamp, UserId,
};

#[async_trait]
pub trait ConversationRepository: Send + Sync {
    async fn create(&self, conversation: Conversation) -> Result<Conversation, RepositoryError>;
    async fn update(&self, conversation: Conversation) -> Result<Conversation, RepositoryError>;
    async fn find_by_id(&self, id: ConversationId)
        -> Result<Option<Conversation>, RepositoryError>;
    /// 某用户作为活跃成员参与的全部会话
    async fn find_by_member(&self, user_id: UserId) -> Result<Vec<Conversation>, RepositoryError>;
    /// 单聊去重查询：两名参与者之间已存在的单聊
    async fn find_direct_between(
        &self,
        a: UserId,
        b: UserId,
    ) -> Result<Option<Conversation>, RepositoryError>;
}

#[async_trait]
pub trait MessageRepository: Send + Sync {
    /// 持久化消息，并在同一事务内落盘会话的摘要/计数推进
    async fn create(
        &self,
        message: Message,
        conversation: &Conversation,
    ) -> Result<Message, RepositoryError>;

    async fn update(&self, message: Message) -> Result<Message, RepositoryError>;

    /// 原子追加送达回执并推进状态。判定与写入在同一临界区/同一条语句内
    /// 完成，并发追加互不覆盖。返回是否新增（发送者本人或已有回执为 false）。
    async fn append_delivery_receipt(
        &self,
        message_id: MessageId,
        receipt: Receipt,
    ) -> Result<bool, RepositoryError>;

    /// 原子追加已读回执，语义同 `append_delivery_receipt`
    async fn append_read_receipt(
        &self,
        message_id: MessageId,
        receipt: Receipt,
    ) -> Result<bool, RepositoryError>;

    async fn find_by_id(&self, id: MessageId) -> Result<Option<Message>, RepositoryError>;

    /// 房间内分页拉取最近消息（时间倒序，`before` 为游标）
    async fn list_recent(
        &self,
        conversation_id: ConversationId,
        limit: u32,
        before: Option<MessageId>,
    ) -> Result<Vec<Message>, RepositoryError>;

    /// 某用户在会话内的未读消息：非其发送、对其可见、且无其已读回执
    async fn list_unread(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<Vec<Message>, RepositoryError>;

    /// 过期时间已到且尚未墓碑化的消息
    async fn list_expired(&self, now: Timestamp) -> Result<Vec<Message>, RepositoryError>;
}

/// 内存实现（用于测试和本地运行）
pub mod memory {
    use super::*;
    use std::collections::HashMap;
    use tokio::sync::RwLock;

    #[derive(Default)]
    struct StoreInner {
        conversations: HashMap<ConversationId, Conversation>,
        messages: HashMap<MessageId, Message>,
        // 保持每个会话内消息的插入顺序
        conversation_messages: HashMap<ConversationId, Vec<MessageId>>,
    }

    /// 会话与消息共用一把锁，消息写入与会话摘要推进天然原子
    #[derive(Default)]
    pub struct InMemoryChatStore {
        inner: RwLock<StoreInner>,
    }

    impl InMemoryChatStore {
        pub fn new() -> Self {
            Self::default()
        }
    }

    #[async_trait]
    impl ConversationRepository for InMemoryChatStore {
        async fn create(
            &self,
            conversation: Conversation,
        ) -> Result<Conversation, RepositoryError> {
            let mut inner = self.inner.write().await;
            if inner.conversations.contains_key(&conversation.id) {
                return Err(RepositoryError::Conflict);
            }
            inner
                .conversations
                .insert(conversation.id, conversation.clone());
            Ok(conversation)
        }

        async fn update(
            &self,
            conversation: Conversation,
        ) -> Result<Conversation, RepositoryError> {
            let mut inner = self.inner.write().await;
            if !inner.conversations.contains_key(&conversation.id) {
                return Err(RepositoryError::NotFound);
            }
            inner
                .conversations
                .insert(conversation.id, conversation.clone());
            Ok(conversation)
        }

        async fn find_by_id(
            &self,
            id: ConversationId,
        ) -> Result<Option<Conversation>, RepositoryError> {
            let inner = self.inner.read().await;
            Ok(inner.conversations.get(&id).cloned())
        }

        async fn find_by_member(
            &self,
            user_id: UserId,
        ) -> Result<Vec<Conversation>, RepositoryError> {
            let inner = self.inner.read().await;
            Ok(inner
                .conversations
                .values()
                .filter(|c| c.is_member(user_id))
                .cloned()
                .collect())
        }

        async fn find_direct_between(
            &self,
            a: UserId,
            b: UserId,
        ) -> Result<Option<Conversation>, RepositoryError> {
            let inner = self.inner.read().await;
            Ok(inner
                .conversations
                .values()
                .find(|c| {
                    c.kind == domain::ConversationKind::Direct
                        && c.status != domain::ConversationStatus::Deleted
                        && c.member(a).is_some()
                        && c.member(b).is_some()
                })
                .cloned())
        }
    }

    #[async_trait]
    impl MessageRepository for InMemoryChatStore {
        async fn create(
            &self,
            message: Message,
            conversation: &Conversation,
        ) -> Result<Message, RepositoryError> {
            let mut inner = self.inner.write().await;
            if inner.messages.contains_key(&message.id) {
                return Err(RepositoryError::Conflict);
            }
            inner
                .conversations
                .insert(conversation.id, conversation.clone());
            inner
                .conversation_messages
                .entry(message.conversation_id)
                .or_default()
                .push(message.id);
            inner.messages.insert(message.id, message.clone());
            Ok(message)
        }

        async fn update(&self, message: Message) -> Result<Message, RepositoryError> {
            let mut inner = self.inner.write().await;
            if !inner.messages.contains_key(&message.id) {
                return Err(RepositoryError::NotFound);
            }
            inner.messages.insert(message.id, message.clone());
            Ok(message)
        }

        async fn append_delivery_receipt(
            &self,
            message_id: MessageId,
            receipt: Receipt,
        ) -> Result<bool, RepositoryError> {
            let mut inner = self.inner.write().await;
            let message = inner
                .messages
                .get_mut(&message_id)
                .ok_or(RepositoryError::NotFound)?;
            Ok(message.mark_delivered_by(receipt.user_id, receipt.at))
        }

        async fn append_read_receipt(
            &self,
            message_id: MessageId,
            receipt: Receipt,
        ) -> Result<bool, RepositoryError> {
            let mut inner = self.inner.write().await;
            let message = inner
                .messages
                .get_mut(&message_id)
                .ok_or(RepositoryError::NotFound)?;
            Ok(message.mark_read_by(receipt.user_id, receipt.at))
        }

        async fn find_by_id(&self, id: MessageId) -> Result<Option<Message>, RepositoryError> {
            let inner = self.inner.read().await;
            Ok(inner.messages.get(&id).cloned())
        }

        async fn list_recent(
            &self,
            conversation_id: ConversationId,
            limit: u32,
            before: Option<MessageId>,
        ) -> Result<Vec<Message>, RepositoryError> {
            let inner = self.inner.read().await;
            let ids = inner
                .conversation_messages
                .get(&conversation_id)
                .cloned()
                .unwrap_or_default();
            let mut messages: Vec<Message> = ids
                .into_iter()
                .filter_map(|id| inner.messages.get(&id).cloned())
                .collect();
            messages.sort_by(|a, b| b.sent_at.cmp(&a.sent_at));

            if let Some(before_id) = before {
                if let Some(cursor) = inner.messages.get(&before_id) {
                    messages.retain(|m| m.sent_at < cursor.sent_at);
                }
            }
            messages.truncate(limit as usize);
            Ok(messages)
        }

        async fn list_unread(
            &self,
            conversation_id: ConversationId,
            user_id: UserId,
        ) -> Result<Vec<Message>, RepositoryError> {
            let inner = self.inner.read().await;
            let ids = inner
                .conversation_messages
                .get(&conversation_id)
                .cloned()
                .unwrap_or_default();
            Ok(ids
                .into_iter()
                .filter_map(|id| inner.messages.get(&id))
                .filter(|m| m.is_unread_for(user_id))
                .cloned()
                .collect())
        }

        async fn list_expired(&self, now: Timestamp) -> Result<Vec<Message>, RepositoryError> {
            let inner = self.inner.read().await;
            Ok(inner
                .messages
                .values()
                .filter(|m| !m.is_deleted && m.is_expired(now))
                .cloned()
                .collect())
        }
    }
}
