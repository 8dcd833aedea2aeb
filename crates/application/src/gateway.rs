//! 事件推送网关
//!
//! 用例层发布领域事件的唯一出口。网关自身无状态，仅持有连接注册表，
//! 由上层显式注入，空房间/离线用户的发布是静默 no-op。

use std::sync::Arc;

use tracing::debug;

use domain::{ConnectionId, Conversation, ConversationId, Message, MessageId, UserId};

use crate::events::{ConversationUpdateKind, MessageUpdateKind, ServerEvent};
use crate::registry::{ConnectionRegistry, RoomKey};

#[derive(Clone)]
pub struct EventGateway {
    registry: Arc<ConnectionRegistry>,
}

impl EventGateway {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// 新消息广播到会话房间（发送者自身的连接也收到，用于多端同步）。
    /// 不在房间里的在线成员经个人房间补发通知，静音成员除外。
    pub async fn publish_new_message(&self, message: Message, conversation: &Conversation) {
        let room = RoomKey::Conversation(message.conversation_id);
        debug!(message_id = %message.id, conversation_id = %message.conversation_id, "publish new message");
        self.registry
            .send_to_room(
                room,
                ServerEvent::NewMessage {
                    message: message.clone(),
                },
            )
            .await;

        for member in conversation.members.iter().filter(|m| m.is_active) {
            if member.user_id == message.sender_id || member.notifications.muted {
                continue;
            }
            if self.registry.is_user_in_room(member.user_id, room).await {
                continue;
            }
            self.registry
                .send_to_room(
                    RoomKey::User(member.user_id),
                    ServerEvent::NewMessage {
                        message: message.clone(),
                    },
                )
                .await;
        }
    }

    /// 消息级更新（编辑/删除/表态）广播到会话房间
    pub async fn publish_message_update(
        &self,
        conversation_id: ConversationId,
        message_id: MessageId,
        update_kind: MessageUpdateKind,
        payload: serde_json::Value,
    ) {
        self.registry
            .send_to_room(
                RoomKey::Conversation(conversation_id),
                ServerEvent::MessageUpdate {
                    conversation_id,
                    message_id,
                    update_kind,
                    payload,
                },
            )
            .await;
    }

    /// 会话级更新（成员/信息/设置变化）广播到会话房间
    pub async fn publish_conversation_update(
        &self,
        conversation_id: ConversationId,
        update_kind: ConversationUpdateKind,
        payload: serde_json::Value,
    ) {
        self.registry
            .send_to_room(
                RoomKey::Conversation(conversation_id),
                ServerEvent::ConversationUpdate {
                    conversation_id,
                    update_kind,
                    payload,
                },
            )
            .await;
    }

    /// 定向推送到某用户的全部连接，用户离线时静默丢弃
    pub async fn publish_to_user(&self, user_id: UserId, event: ServerEvent) {
        self.registry
            .send_to_room(RoomKey::User(user_id), event)
            .await;
    }

    pub async fn publish_to_room(&self, room: RoomKey, event: ServerEvent) {
        self.registry.send_to_room(room, event).await;
    }

    pub async fn publish_to_room_except(
        &self,
        room: RoomKey,
        except: ConnectionId,
        event: ServerEvent,
    ) {
        self.registry
            .send_to_room_except(room, Some(except), event)
            .await;
    }
}
