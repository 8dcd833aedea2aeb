//! 在线与输入状态广播
//!
//! 输入指示与自定义在线状态都是即发即弃的瞬态信号：不落盘、不排队、
//! 不补发，未订阅房间的信号直接忽略，离线接收方永远不会收到。

use std::sync::Arc;

use domain::{ConnectionId, ConversationId};

use crate::events::ServerEvent;
use crate::registry::{ConnectionRegistry, RoomKey};

pub struct PresenceBroadcaster {
    registry: Arc<ConnectionRegistry>,
}

impl PresenceBroadcaster {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    /// 开始输入，仅广播给房间内其他人
    pub async fn typing_started(&self, connection_id: ConnectionId, conversation_id: ConversationId) {
        self.broadcast_typing(connection_id, conversation_id, true).await;
    }

    /// 停止输入
    pub async fn typing_stopped(&self, connection_id: ConnectionId, conversation_id: ConversationId) {
        self.broadcast_typing(connection_id, conversation_id, false).await;
    }

    async fn broadcast_typing(
        &self,
        connection_id: ConnectionId,
        conversation_id: ConversationId,
        started: bool,
    ) {
        let room = RoomKey::Conversation(conversation_id);
        // 没进房间的连接发来的输入信号直接丢弃
        if !self.registry.is_subscribed(connection_id, room).await {
            return;
        }
        let Some(identity) = self.registry.identity_of(connection_id).await else {
            return;
        };
        let event = if started {
            ServerEvent::UserTyping {
                user_id: identity.user_id,
                conversation_id,
            }
        } else {
            ServerEvent::UserStoppedTyping {
                user_id: identity.user_id,
                conversation_id,
            }
        };
        self.registry
            .send_to_room_except(room, Some(connection_id), event)
            .await;
    }

    /// 自定义在线状态变化，广播到该连接订阅的全部房间
    pub async fn presence_changed(&self, connection_id: ConnectionId, status: String) {
        let Some(identity) = self.registry.identity_of(connection_id).await else {
            return;
        };
        let rooms = self.registry.rooms_of(connection_id).await;
        for room in rooms {
            self.registry
                .send_to_room_except(
                    room,
                    Some(connection_id),
                    ServerEvent::PresenceUpdate {
                        user_id: identity.user_id,
                        status: status.clone(),
                    },
                )
                .await;
        }
    }
}
