//! 实时协议事件定义
//!
//! 客户端到服务端、服务端到客户端的全部事件，事件名即序列化标签。
//! 服务端事件同时被 WebSocket 层和事件推送网关使用。

use serde::{Deserialize, Serialize};

use domain::{ConversationId, Message, MessageId, Timestamp, UserId};

/// 客户端发来的事件
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ClientEvent {
    JoinChat {
        conversation_id: ConversationId,
    },
    LeaveChat {
        conversation_id: ConversationId,
    },
    TypingStart {
        conversation_id: ConversationId,
    },
    TypingStop {
        conversation_id: ConversationId,
    },
    MessageDelivered {
        message_id: MessageId,
        conversation_id: ConversationId,
    },
    MessageRead {
        message_id: MessageId,
        conversation_id: ConversationId,
    },
    MarkChatRead {
        conversation_id: ConversationId,
    },
    UpdatePresence {
        status: String,
    },
}

/// 消息级更新的种类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageUpdateKind {
    Edited,
    Deleted,
    ReactionAdded,
    ReactionRemoved,
}

/// 会话级更新的种类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationUpdateKind {
    MemberAdded,
    MemberRemoved,
    InfoUpdated,
    SettingsChanged,
}

/// 服务端推送的事件
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ServerEvent {
    JoinedChat {
        conversation_id: ConversationId,
    },
    LeftChat {
        conversation_id: ConversationId,
    },
    UserOnline {
        user_id: UserId,
        display_name: String,
        last_seen_at: Option<Timestamp>,
    },
    UserOffline {
        user_id: UserId,
        display_name: String,
        last_seen_at: Option<Timestamp>,
    },
    UserTyping {
        user_id: UserId,
        conversation_id: ConversationId,
    },
    UserStoppedTyping {
        user_id: UserId,
        conversation_id: ConversationId,
    },
    /// 自定义在线状态广播
    PresenceUpdate {
        user_id: UserId,
        status: String,
    },
    MessageDeliveryUpdate {
        message_id: MessageId,
        user_id: UserId,
    },
    MessageReadUpdate {
        message_id: MessageId,
        user_id: UserId,
    },
    ChatReadUpdate {
        conversation_id: ConversationId,
        user_id: UserId,
        message_count: u64,
    },
    NewMessage {
        message: Message,
    },
    MessageUpdate {
        conversation_id: ConversationId,
        message_id: MessageId,
        update_kind: MessageUpdateKind,
        payload: serde_json::Value,
    },
    ConversationUpdate {
        conversation_id: ConversationId,
        update_kind: ConversationUpdateKind,
        payload: serde_json::Value,
    },
    Error {
        message: String,
    },
}
