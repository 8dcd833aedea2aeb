//! 消息生命周期引擎
//!
//! 创建、编辑、删除（全员/单人）、表态、过期清扫与历史拉取。
//! 消息写入与会话摘要推进由仓储在同一事务内完成，
//! 广播由调用方（WebSocket 层 / REST 层）通过事件网关进行。

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{info, warn};
use uuid::Uuid;

use domain::{
    Conversation, ConversationId, LastMessagePreview, MemberRole, Message, MessageContent,
    MessageId, MessageRef, UserId,
};

use crate::clock::Clock;
use crate::error::{ApplicationError, ApplicationResult};
use crate::repository::{ConversationRepository, MessageRepository};

/// 历史拉取单页上限
pub const HISTORY_MAX_LIMIT: u32 = 100;

/// 待发送消息的输入
#[derive(Debug, Clone)]
pub struct MessageDraft {
    pub content: MessageContent,
    pub reply_to: Option<MessageId>,
    pub forward_of: Option<MessageId>,
}

impl MessageDraft {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: MessageContent::Text { text: text.into() },
            reply_to: None,
            forward_of: None,
        }
    }
}

/// 表态操作的结果：落盘后的消息与按表情聚合的视图
#[derive(Debug)]
pub struct ReactionOutcome {
    pub message: Message,
    pub grouped: BTreeMap<String, Vec<UserId>>,
    /// 是否确有变化（移除不存在的表态时为 false）
    pub changed: bool,
}

pub struct MessageLifecycleDependencies {
    pub conversations: Arc<dyn ConversationRepository>,
    pub messages: Arc<dyn MessageRepository>,
    pub clock: Arc<dyn Clock>,
}

pub struct MessageLifecycleEngine {
    conversations: Arc<dyn ConversationRepository>,
    messages: Arc<dyn MessageRepository>,
    clock: Arc<dyn Clock>,
}

impl MessageLifecycleEngine {
    pub fn new(deps: MessageLifecycleDependencies) -> Self {
        Self {
            conversations: deps.conversations,
            messages: deps.messages,
            clock: deps.clock,
        }
    }

    async fn load_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> ApplicationResult<Conversation> {
        self.conversations
            .find_by_id(conversation_id)
            .await?
            .ok_or_else(|| ApplicationError::not_found("conversation does not exist"))
    }

    async fn load_message(&self, message_id: MessageId) -> ApplicationResult<Message> {
        self.messages
            .find_by_id(message_id)
            .await?
            .ok_or_else(|| ApplicationError::not_found("message does not exist"))
    }

    /// 引用目标必须存在、属于同一会话且未被删除
    async fn resolve_ref(
        &self,
        conversation_id: ConversationId,
        message_id: MessageId,
        purpose: &str,
    ) -> ApplicationResult<MessageRef> {
        let target = self.load_message(message_id).await?;
        if target.conversation_id != conversation_id {
            return Err(ApplicationError::validation(format!(
                "{purpose} target belongs to another conversation"
            )));
        }
        if target.is_deleted {
            return Err(ApplicationError::validation(format!(
                "{purpose} target has been deleted"
            )));
        }
        Ok(MessageRef {
            message_id: target.id,
            preview: target.content.preview(),
            sender_id: target.sender_id,
        })
    }

    /// 创建消息：成员资格与发言权限校验、引用解析、过期时间戳、
    /// 会话摘要推进，消息与会话在同一事务内落盘
    pub async fn create(
        &self,
        sender_id: UserId,
        conversation_id: ConversationId,
        draft: MessageDraft,
    ) -> ApplicationResult<Message> {
        let mut conversation = self.load_conversation(conversation_id).await?;
        if !conversation.is_member(sender_id) {
            return Err(ApplicationError::authorization(
                "user is not a member of this conversation",
            ));
        }
        if !conversation.can_send_messages(sender_id) {
            return Err(ApplicationError::authorization(
                "user is not allowed to send messages in this conversation",
            ));
        }

        let reply_to = match draft.reply_to {
            Some(id) => Some(self.resolve_ref(conversation_id, id, "reply").await?),
            None => None,
        };
        // 转发来源可以在任何会话里，但转发者必须看得到它
        let forwarded_from = match draft.forward_of {
            Some(id) => {
                let source = self.load_message(id).await?;
                let source_conversation = self.load_conversation(source.conversation_id).await?;
                if !source_conversation.is_member(sender_id) || !source.visible_to(sender_id) {
                    return Err(ApplicationError::authorization(
                        "forward source is not visible to this user",
                    ));
                }
                Some(MessageRef {
                    message_id: source.id,
                    preview: source.content.preview(),
                    sender_id: source.sender_id,
                })
            }
            None => None,
        };

        let now = self.clock.now();
        let message = Message::new(
            MessageId::new(Uuid::new_v4()),
            conversation_id,
            sender_id,
            draft.content,
            reply_to,
            forwarded_from,
            conversation.expiry_for(now),
            now,
        )?;

        let preview = LastMessagePreview::new(
            message.id,
            message.content.preview(),
            message.kind(),
            sender_id,
            message.sent_at,
        );
        conversation.record_message(preview, now);

        let stored = self.messages.create(message, &conversation).await?;
        info!(
            message_id = %stored.id,
            conversation_id = %conversation_id,
            sender_id = %sender_id,
            "message created"
        );
        Ok(stored)
    }

    /// 编辑消息，仅发送者本人，且发送者仍须是会话成员
    pub async fn edit(
        &self,
        user_id: UserId,
        message_id: MessageId,
        new_text: String,
    ) -> ApplicationResult<Message> {
        let mut message = self.load_message(message_id).await?;
        if message.sender_id != user_id {
            return Err(ApplicationError::authorization(
                "only the sender can edit a message",
            ));
        }
        let conversation = self.load_conversation(message.conversation_id).await?;
        if !conversation.is_member(user_id) {
            return Err(ApplicationError::authorization(
                "user is not a member of this conversation",
            ));
        }
        message.edit(new_text, self.clock.now())?;
        Ok(self.messages.update(message).await?)
    }

    /// 全员删除：发送者本人，或会话中的管理员/协管员
    pub async fn delete_for_everyone(
        &self,
        user_id: UserId,
        message_id: MessageId,
    ) -> ApplicationResult<Message> {
        let mut message = self.load_message(message_id).await?;
        if message.sender_id != user_id {
            let conversation = self.load_conversation(message.conversation_id).await?;
            let allowed = matches!(
                conversation.role_of(user_id),
                Some(MemberRole::Admin | MemberRole::Moderator)
            );
            if !allowed {
                return Err(ApplicationError::authorization(
                    "only the sender or a moderator can delete for everyone",
                ));
            }
        }
        message.delete_for_everyone(self.clock.now());
        Ok(self.messages.update(message).await?)
    }

    /// 仅对自己删除（隐藏），返回是否新增隐藏
    pub async fn delete_for_user(
        &self,
        user_id: UserId,
        message_id: MessageId,
    ) -> ApplicationResult<bool> {
        let mut message = self.load_message(message_id).await?;
        let conversation = self.load_conversation(message.conversation_id).await?;
        if !conversation.is_member(user_id) {
            return Err(ApplicationError::authorization(
                "user is not a member of this conversation",
            ));
        }
        let added = message.hide_for(user_id, self.clock.now());
        if added {
            self.messages.update(message).await?;
        }
        Ok(added)
    }

    /// 添加表态（同一用户的旧表态被替换）
    pub async fn add_reaction(
        &self,
        user_id: UserId,
        message_id: MessageId,
        emoji: String,
    ) -> ApplicationResult<ReactionOutcome> {
        let mut message = self.load_message(message_id).await?;
        let conversation = self.load_conversation(message.conversation_id).await?;
        if !conversation.is_member(user_id) {
            return Err(ApplicationError::authorization(
                "user is not a member of this conversation",
            ));
        }
        message.add_reaction(user_id, emoji, self.clock.now())?;
        let stored = self.messages.update(message).await?;
        let grouped = stored.reactions_by_emoji();
        Ok(ReactionOutcome {
            message: stored,
            grouped,
            changed: true,
        })
    }

    /// 移除表态，不存在时为幂等 no-op
    pub async fn remove_reaction(
        &self,
        user_id: UserId,
        message_id: MessageId,
    ) -> ApplicationResult<ReactionOutcome> {
        let mut message = self.load_message(message_id).await?;
        let conversation = self.load_conversation(message.conversation_id).await?;
        if !conversation.is_member(user_id) {
            return Err(ApplicationError::authorization(
                "user is not a member of this conversation",
            ));
        }
        let removed = message.remove_reaction(user_id, self.clock.now());
        let stored = if removed {
            self.messages.update(message).await?
        } else {
            message
        };
        let grouped = stored.reactions_by_emoji();
        Ok(ReactionOutcome {
            message: stored,
            grouped,
            changed: removed,
        })
    }

    /// 历史拉取：成员校验 + 可见性过滤，时间倒序
    pub async fn history(
        &self,
        user_id: UserId,
        conversation_id: ConversationId,
        limit: u32,
        before: Option<MessageId>,
    ) -> ApplicationResult<Vec<Message>> {
        let conversation = self.load_conversation(conversation_id).await?;
        if !conversation.is_member(user_id) {
            return Err(ApplicationError::authorization(
                "user is not a member of this conversation",
            ));
        }
        let limit = limit.clamp(1, HISTORY_MAX_LIMIT);
        let messages = self
            .messages
            .list_recent(conversation_id, limit, before)
            .await?;
        // 墓碑保留在历史里（以删除标记示人），单人隐藏的消息被过滤掉
        Ok(messages
            .into_iter()
            .filter(|m| !m.hidden_for.contains(&user_id))
            .collect())
    }

    /// 过期清扫：把到期消息转换为墓碑，返回清扫条数。
    /// 单条失败只记日志，不中断整轮。
    pub async fn sweep_expired(&self) -> ApplicationResult<u64> {
        let now = self.clock.now();
        let expired = self.messages.list_expired(now).await?;
        let mut swept = 0u64;
        for mut message in expired {
            message.expire(now);
            match self.messages.update(message).await {
                Ok(_) => swept += 1,
                Err(error) => {
                    warn!(error = %error, "failed to tombstone expired message");
                }
            }
        }
        if swept > 0 {
            info!(count = swept, "swept expired messages");
        }
        Ok(swept)
    }
}
