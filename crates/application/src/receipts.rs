//! 送达/已读追踪
//!
//! 回执按用户幂等，重复确认返回 false 且不触发广播。回执追加在仓储
//! 边界原子完成（单条条件更新 / 单个临界区），并发确认互不覆盖。
//! 「整会话已读」一次性为全部未读消息补写已读回执，未读计数
//! 始终从回执推导，不单独维护计数器。

use std::sync::Arc;

use tracing::debug;

use domain::{ConversationId, Message, MessageId, Receipt, UserId};

use crate::clock::Clock;
use crate::error::{ApplicationError, ApplicationResult};
use crate::repository::{ConversationRepository, MessageRepository};

pub struct DeliveryReadTracker {
    conversations: Arc<dyn ConversationRepository>,
    messages: Arc<dyn MessageRepository>,
    clock: Arc<dyn Clock>,
}

impl DeliveryReadTracker {
    pub fn new(
        conversations: Arc<dyn ConversationRepository>,
        messages: Arc<dyn MessageRepository>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            conversations,
            messages,
            clock,
        }
    }

    async fn load(&self, message_id: MessageId) -> ApplicationResult<Message> {
        self.messages
            .find_by_id(message_id)
            .await?
            .ok_or_else(|| ApplicationError::not_found("message does not exist"))
    }

    /// 确认者必须是会话的成员，消息必须属于其声称的会话
    async fn authorize(
        &self,
        user_id: UserId,
        conversation_id: ConversationId,
        message: &Message,
    ) -> ApplicationResult<()> {
        if message.conversation_id != conversation_id {
            return Err(ApplicationError::validation(
                "message does not belong to this conversation",
            ));
        }
        self.require_member(user_id, conversation_id).await
    }

    async fn require_member(
        &self,
        user_id: UserId,
        conversation_id: ConversationId,
    ) -> ApplicationResult<()> {
        let conversation = self
            .conversations
            .find_by_id(conversation_id)
            .await?
            .ok_or_else(|| ApplicationError::not_found("conversation does not exist"))?;
        if !conversation.is_member(user_id) {
            return Err(ApplicationError::authorization(
                "user is not a member of this conversation",
            ));
        }
        Ok(())
    }

    /// 记录送达回执，返回是否为该用户的首次送达
    pub async fn mark_delivered(
        &self,
        user_id: UserId,
        conversation_id: ConversationId,
        message_id: MessageId,
    ) -> ApplicationResult<bool> {
        let message = self.load(message_id).await?;
        self.authorize(user_id, conversation_id, &message).await?;
        let receipt = Receipt {
            user_id,
            at: self.clock.now(),
        };
        Ok(self
            .messages
            .append_delivery_receipt(message_id, receipt)
            .await?)
    }

    /// 记录已读回执，返回是否为该用户的首次已读
    pub async fn mark_read(
        &self,
        user_id: UserId,
        conversation_id: ConversationId,
        message_id: MessageId,
    ) -> ApplicationResult<bool> {
        let message = self.load(message_id).await?;
        self.authorize(user_id, conversation_id, &message).await?;
        let receipt = Receipt {
            user_id,
            at: self.clock.now(),
        };
        Ok(self
            .messages
            .append_read_receipt(message_id, receipt)
            .await?)
    }

    /// 整会话已读：为全部未读消息补写已读回执，返回实际补写条数
    pub async fn mark_chat_read(
        &self,
        user_id: UserId,
        conversation_id: ConversationId,
    ) -> ApplicationResult<u64> {
        self.require_member(user_id, conversation_id).await?;
        let now = self.clock.now();
        let unread = self.messages.list_unread(conversation_id, user_id).await?;
        let mut marked = 0u64;
        for message in unread {
            let receipt = Receipt { user_id, at: now };
            if self.messages.append_read_receipt(message.id, receipt).await? {
                marked += 1;
            }
        }
        debug!(
            user_id = %user_id,
            conversation_id = %conversation_id,
            count = marked,
            "marked chat read"
        );
        Ok(marked)
    }

    /// 未读计数：从回执推导
    pub async fn unread_count(
        &self,
        user_id: UserId,
        conversation_id: ConversationId,
    ) -> ApplicationResult<u64> {
        self.require_member(user_id, conversation_id).await?;
        let unread = self.messages.list_unread(conversation_id, user_id).await?;
        Ok(unread.len() as u64)
    }
}
