//! 房间成员控制
//!
//! 连接与会话房间之间的进出闸门：加入前校验成员资格与权限，
//! 加入/离开/断连时维护注册表订阅并广播上线/离线事件。
//! 校验失败时房间状态保持不变。

use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tracing::{debug, warn};

use domain::{ConnectionId, ConversationId, Timestamp, UserId};

use crate::clock::Clock;
use crate::error::{ApplicationError, ApplicationResult};
use crate::events::ServerEvent;
use crate::gateway::EventGateway;
use crate::registry::{ConnectionIdentity, ConnectionRegistry, RoomKey};
use crate::repository::ConversationRepository;

/// 断连后离线广播的默认并发上限
pub const DEFAULT_DISCONNECT_FANOUT_LIMIT: usize = 16;

pub struct RoomMembershipDependencies {
    pub registry: Arc<ConnectionRegistry>,
    pub gateway: EventGateway,
    pub conversations: Arc<dyn ConversationRepository>,
    pub clock: Arc<dyn Clock>,
    /// 断连时并发广播离线事件的房间数上限
    pub disconnect_fanout_limit: usize,
}

pub struct RoomMembershipController {
    registry: Arc<ConnectionRegistry>,
    gateway: EventGateway,
    conversations: Arc<dyn ConversationRepository>,
    clock: Arc<dyn Clock>,
    disconnect_fanout_limit: usize,
}

impl RoomMembershipController {
    pub fn new(deps: RoomMembershipDependencies) -> Self {
        Self {
            registry: deps.registry,
            gateway: deps.gateway,
            conversations: deps.conversations,
            clock: deps.clock,
            disconnect_fanout_limit: deps.disconnect_fanout_limit.max(1),
        }
    }

    async fn identity(&self, connection_id: ConnectionId) -> ApplicationResult<ConnectionIdentity> {
        self.registry
            .identity_of(connection_id)
            .await
            .ok_or_else(|| ApplicationError::authentication("connection is not registered"))
    }

    /// 连接加入会话房间
    pub async fn join(
        &self,
        connection_id: ConnectionId,
        conversation_id: ConversationId,
    ) -> ApplicationResult<()> {
        let identity = self.identity(connection_id).await?;
        let mut conversation = self
            .conversations
            .find_by_id(conversation_id)
            .await?
            .ok_or_else(|| ApplicationError::not_found("conversation does not exist"))?;

        if !conversation.is_member(identity.user_id) {
            return Err(ApplicationError::authorization(
                "user is not a member of this conversation",
            ));
        }

        let previous_last_seen: Option<Timestamp> = conversation
            .member(identity.user_id)
            .and_then(|m| m.last_seen_at);

        let room = RoomKey::Conversation(conversation_id);
        let newly = self.registry.subscribe(connection_id, room).await?;

        if newly {
            self.gateway
                .publish_to_room_except(
                    room,
                    connection_id,
                    ServerEvent::UserOnline {
                        user_id: identity.user_id,
                        display_name: identity.display_name.clone(),
                        last_seen_at: previous_last_seen,
                    },
                )
                .await;
        }

        conversation.touch_last_seen(identity.user_id, self.clock.now());
        self.conversations.update(conversation).await?;

        self.registry
            .send_to_connection(connection_id, ServerEvent::JoinedChat { conversation_id })
            .await;
        debug!(user_id = %identity.user_id, conversation_id = %conversation_id, "joined chat room");
        Ok(())
    }

    /// 连接离开会话房间
    pub async fn leave(
        &self,
        connection_id: ConnectionId,
        conversation_id: ConversationId,
    ) -> ApplicationResult<()> {
        let identity = self.identity(connection_id).await?;
        let room = RoomKey::Conversation(conversation_id);
        let fully_left = self.registry.unsubscribe(connection_id, room).await?;

        self.registry
            .send_to_connection(connection_id, ServerEvent::LeftChat { conversation_id })
            .await;

        if fully_left {
            let last_seen = self.persist_last_seen(identity.user_id, conversation_id).await;
            self.gateway
                .publish_to_room(
                    room,
                    ServerEvent::UserOffline {
                        user_id: identity.user_id,
                        display_name: identity.display_name.clone(),
                        last_seen_at: last_seen,
                    },
                )
                .await;
        }
        debug!(user_id = %identity.user_id, conversation_id = %conversation_id, "left chat room");
        Ok(())
    }

    /// 某用户是否可在会话中发消息（WebSocket 层发送前的闸门）
    pub async fn can_send_messages(
        &self,
        user_id: UserId,
        conversation_id: ConversationId,
    ) -> ApplicationResult<bool> {
        let conversation = self
            .conversations
            .find_by_id(conversation_id)
            .await?
            .ok_or_else(|| ApplicationError::not_found("conversation does not exist"))?;
        Ok(conversation.can_send_messages(user_id))
    }

    /// 连接断开：注销并向其订阅过的会话房间广播离线
    ///
    /// 仅当这是该用户最后一条连接时才广播，多端登录下其余连接仍在线。
    pub async fn disconnect(&self, connection_id: ConnectionId) {
        let Some(summary) = self.registry.unregister(connection_id).await else {
            return;
        };
        if !summary.was_last_connection {
            return;
        }

        let user_id = summary.user_id;
        let display_name = summary.display_name;
        stream::iter(summary.conversation_rooms)
            .for_each_concurrent(self.disconnect_fanout_limit, |conversation_id| {
                let display_name = display_name.clone();
                async move {
                    let last_seen = self.persist_last_seen(user_id, conversation_id).await;
                    self.gateway
                        .publish_to_room(
                            RoomKey::Conversation(conversation_id),
                            ServerEvent::UserOffline {
                                user_id,
                                display_name,
                                last_seen_at: last_seen,
                            },
                        )
                        .await;
                }
            })
            .await;
        debug!(user_id = %user_id, "broadcast offline presence after disconnect");
    }

    /// 尽力落盘 last_seen，失败只记日志不阻断离线广播
    async fn persist_last_seen(
        &self,
        user_id: UserId,
        conversation_id: ConversationId,
    ) -> Option<Timestamp> {
        let now = self.clock.now();
        match self.conversations.find_by_id(conversation_id).await {
            Ok(Some(mut conversation)) => {
                conversation.touch_last_seen(user_id, now);
                if let Err(error) = self.conversations.update(conversation).await {
                    warn!(
                        user_id = %user_id,
                        conversation_id = %conversation_id,
                        error = %error,
                        "failed to persist last seen timestamp"
                    );
                }
                Some(now)
            }
            Ok(None) => None,
            Err(error) => {
                warn!(
                    conversation_id = %conversation_id,
                    error = %error,
                    "failed to load conversation while persisting last seen"
                );
                Some(now)
            }
        }
    }
}
