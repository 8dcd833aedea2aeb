//! 消息实体定义
//!
//! 内容为带类型标签的联合体（每种消息类型一个变体），在构造时校验，
//! 不存在「某字段在某类型下必填」的散落检查。
//! 状态机：sent → delivered → read 单向前进；read 可以直接从 sent 到达
//! （已读蕴含送达）；failed 仅能从 sent 进入且为终态。

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::errors::{DomainError, DomainResult};
use crate::value_objects::{ConversationId, MessageId, Timestamp, UserId};

/// 消息类型标签
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    Image,
    Video,
    Audio,
    Gif,
    Sticker,
    File,
    Location,
    Contact,
    System,
}

/// 媒体消息的公共元数据
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaMetadata {
    pub url: String,
    pub mime_type: String,
    pub size_bytes: u64,
    /// 音视频时长（秒）
    pub duration_secs: Option<u32>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub caption: Option<String>,
    pub thumbnail_url: Option<String>,
}

/// 消息内容联合体，类型标签与载荷结构始终一致
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageContent {
    Text {
        text: String,
    },
    Image {
        media: MediaMetadata,
    },
    Video {
        media: MediaMetadata,
    },
    Audio {
        media: MediaMetadata,
    },
    Gif {
        media: MediaMetadata,
    },
    Sticker {
        media: MediaMetadata,
    },
    File {
        media: MediaMetadata,
    },
    Location {
        latitude: f64,
        longitude: f64,
        label: Option<String>,
    },
    Contact {
        name: String,
        phone: String,
        contact_user_id: Option<UserId>,
    },
    System {
        code: String,
        #[serde(default)]
        data: serde_json::Value,
    },
}

impl MessageContent {
    pub fn kind(&self) -> MessageKind {
        match self {
            MessageContent::Text { .. } => MessageKind::Text,
            MessageContent::Image { .. } => MessageKind::Image,
            MessageContent::Video { .. } => MessageKind::Video,
            MessageContent::Audio { .. } => MessageKind::Audio,
            MessageContent::Gif { .. } => MessageKind::Gif,
            MessageContent::Sticker { .. } => MessageKind::Sticker,
            MessageContent::File { .. } => MessageKind::File,
            MessageContent::Location { .. } => MessageKind::Location,
            MessageContent::Contact { .. } => MessageKind::Contact,
            MessageContent::System { .. } => MessageKind::System,
        }
    }

    /// 构造时的载荷校验
    pub fn validate(&self) -> DomainResult<()> {
        match self {
            MessageContent::Text { text } => {
                if text.trim().is_empty() {
                    return Err(DomainError::validation_error("text", "cannot be empty"));
                }
                if text.chars().count() > 10_000 {
                    return Err(DomainError::validation_error("text", "too long"));
                }
            }
            MessageContent::Image { media }
            | MessageContent::Video { media }
            | MessageContent::Audio { media }
            | MessageContent::Gif { media }
            | MessageContent::Sticker { media }
            | MessageContent::File { media } => {
                if media.url.trim().is_empty() {
                    return Err(DomainError::validation_error("media.url", "cannot be empty"));
                }
                if media.mime_type.trim().is_empty() {
                    return Err(DomainError::validation_error(
                        "media.mime_type",
                        "cannot be empty",
                    ));
                }
            }
            MessageContent::Location {
                latitude,
                longitude,
                ..
            } => {
                if !(-90.0..=90.0).contains(latitude) {
                    return Err(DomainError::validation_error("latitude", "out of range"));
                }
                if !(-180.0..=180.0).contains(longitude) {
                    return Err(DomainError::validation_error("longitude", "out of range"));
                }
            }
            MessageContent::Contact { name, .. } => {
                if name.trim().is_empty() {
                    return Err(DomainError::validation_error("name", "cannot be empty"));
                }
            }
            MessageContent::System { code, .. } => {
                if code.trim().is_empty() {
                    return Err(DomainError::validation_error("code", "cannot be empty"));
                }
            }
        }
        Ok(())
    }

    /// 生成会话列表摘要文本
    pub fn preview(&self) -> String {
        match self {
            MessageContent::Text { text } => text.clone(),
            MessageContent::Image { media } => media
                .caption
                .clone()
                .unwrap_or_else(|| "[image]".to_string()),
            MessageContent::Video { media } => media
                .caption
                .clone()
                .unwrap_or_else(|| "[video]".to_string()),
            MessageContent::Audio { .. } => "[audio]".to_string(),
            MessageContent::Gif { .. } => "[gif]".to_string(),
            MessageContent::Sticker { .. } => "[sticker]".to_string(),
            MessageContent::File { media } => media
                .caption
                .clone()
                .unwrap_or_else(|| "[file]".to_string()),
            MessageContent::Location { label, .. } => label
                .clone()
                .unwrap_or_else(|| "[location]".to_string()),
            MessageContent::Contact { name, .. } => name.clone(),
            MessageContent::System { code, .. } => format!("[{code}]"),
        }
    }
}

/// 消息状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Sent,
    Delivered,
    Read,
    /// 仅能从 sent 进入，终态
    Failed,
}

/// 单用户回执记录（送达或已读）
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Receipt {
    pub user_id: UserId,
    pub at: Timestamp,
}

/// 单用户表情回应，每用户至多一条
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reaction {
    pub emoji: String,
    pub at: Timestamp,
}

/// 回复/转发引用，含反规范化的预览
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRef {
    pub message_id: MessageId,
    pub preview: String,
    pub sender_id: UserId,
}

/// 消息实体
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub content: MessageContent,
    pub status: MessageStatus,
    /// 以用户为键的回应表，「每用户一条」是结构不变量
    #[serde(default)]
    pub reactions: HashMap<UserId, Reaction>,
    #[serde(default)]
    pub delivered_to: Vec<Receipt>,
    #[serde(default)]
    pub read_by: Vec<Receipt>,
    pub reply_to: Option<MessageRef>,
    pub forwarded_from: Option<MessageRef>,
    pub is_edited: bool,
    pub edited_at: Option<Timestamp>,
    /// 全员删除标记（墓碑）
    pub is_deleted: bool,
    /// 「仅对我隐藏」集合，独立于全员删除
    #[serde(default)]
    pub hidden_for: HashSet<UserId>,
    pub expires_at: Option<Timestamp>,
    pub sent_at: Timestamp,
    pub updated_at: Option<Timestamp>,
}

impl Message {
    pub fn new(
        id: MessageId,
        conversation_id: ConversationId,
        sender_id: UserId,
        content: MessageContent,
        reply_to: Option<MessageRef>,
        forwarded_from: Option<MessageRef>,
        expires_at: Option<Timestamp>,
        now: Timestamp,
    ) -> DomainResult<Self> {
        content.validate()?;
        Ok(Self {
            id,
            conversation_id,
            sender_id,
            content,
            status: MessageStatus::Sent,
            reactions: HashMap::new(),
            delivered_to: Vec::new(),
            read_by: Vec::new(),
            reply_to,
            forwarded_from,
            is_edited: false,
            edited_at: None,
            is_deleted: false,
            hidden_for: HashSet::new(),
            expires_at,
            sent_at: now,
            updated_at: None,
        })
    }

    pub fn kind(&self) -> MessageKind {
        self.content.kind()
    }

    pub fn has_delivery_receipt(&self, user_id: UserId) -> bool {
        self.delivered_to.iter().any(|r| r.user_id == user_id)
    }

    pub fn has_read_receipt(&self, user_id: UserId) -> bool {
        self.read_by.iter().any(|r| r.user_id == user_id)
    }

    /// 记录送达回执。幂等：已有该用户回执或回执来自发送者本人时返回 false。
    pub fn mark_delivered_by(&mut self, user_id: UserId, at: Timestamp) -> bool {
        if user_id == self.sender_id || self.has_delivery_receipt(user_id) {
            return false;
        }
        self.delivered_to.push(Receipt { user_id, at });
        if self.status == MessageStatus::Sent {
            self.status = MessageStatus::Delivered;
        }
        self.updated_at = Some(at);
        true
    }

    /// 记录已读回执。已读蕴含送达：即便没有显式送达回执，
    /// 状态也从 sent 直接推进到 read。
    pub fn mark_read_by(&mut self, user_id: UserId, at: Timestamp) -> bool {
        if user_id == self.sender_id || self.has_read_receipt(user_id) {
            return false;
        }
        self.read_by.push(Receipt { user_id, at });
        if matches!(self.status, MessageStatus::Sent | MessageStatus::Delivered) {
            self.status = MessageStatus::Read;
        }
        self.updated_at = Some(at);
        true
    }

    /// 标记发送失败，仅允许从 sent 进入
    pub fn mark_failed(&mut self, at: Timestamp) -> DomainResult<()> {
        if self.status != MessageStatus::Sent {
            return Err(DomainError::business_rule_violation(
                "only a sent message can transition to failed",
            ));
        }
        self.status = MessageStatus::Failed;
        self.updated_at = Some(at);
        Ok(())
    }

    /// 添加回应：同一用户的旧回应被替换
    pub fn add_reaction(
        &mut self,
        user_id: UserId,
        emoji: impl Into<String>,
        at: Timestamp,
    ) -> DomainResult<()> {
        if self.is_deleted {
            return Err(DomainError::business_rule_violation(
                "cannot react to a deleted message",
            ));
        }
        let emoji = emoji.into();
        if emoji.trim().is_empty() {
            return Err(DomainError::validation_error("emoji", "cannot be empty"));
        }
        self.reactions.insert(user_id, Reaction { emoji, at });
        self.updated_at = Some(at);
        Ok(())
    }

    /// 移除回应，返回是否确有删除
    pub fn remove_reaction(&mut self, user_id: UserId, at: Timestamp) -> bool {
        let removed = self.reactions.remove(&user_id).is_some();
        if removed {
            self.updated_at = Some(at);
        }
        removed
    }

    /// 按表情聚合回应，用于广播
    pub fn reactions_by_emoji(&self) -> BTreeMap<String, Vec<UserId>> {
        let mut grouped: BTreeMap<String, Vec<UserId>> = BTreeMap::new();
        for (user_id, reaction) in &self.reactions {
            grouped.entry(reaction.emoji.clone()).or_default().push(*user_id);
        }
        for users in grouped.values_mut() {
            users.sort();
        }
        grouped
    }

    /// 编辑内容：仅文本消息，墓碑不可编辑。发送者校验在应用层。
    pub fn edit(&mut self, new_text: impl Into<String>, at: Timestamp) -> DomainResult<()> {
        if self.is_deleted {
            return Err(DomainError::business_rule_violation(
                "deleted messages cannot be edited",
            ));
        }
        if self.kind() != MessageKind::Text {
            return Err(DomainError::permission_denied(
                "only text messages can be edited",
            ));
        }
        let content = MessageContent::Text {
            text: new_text.into(),
        };
        content.validate()?;
        self.content = content;
        self.is_edited = true;
        self.edited_at = Some(at);
        self.updated_at = Some(at);
        Ok(())
    }

    /// 全员删除：内容替换为墓碑标记，记录保留
    pub fn delete_for_everyone(&mut self, at: Timestamp) {
        self.tombstone("deleted", at);
    }

    /// 过期转换为墓碑，幂等
    pub fn expire(&mut self, at: Timestamp) {
        if !self.is_deleted {
            self.tombstone("expired", at);
        }
    }

    fn tombstone(&mut self, code: &str, at: Timestamp) {
        self.is_deleted = true;
        self.content = MessageContent::System {
            code: code.to_string(),
            data: serde_json::Value::Null,
        };
        self.updated_at = Some(at);
    }

    /// 仅对单个用户隐藏，返回是否新增
    pub fn hide_for(&mut self, user_id: UserId, at: Timestamp) -> bool {
        let added = self.hidden_for.insert(user_id);
        if added {
            self.updated_at = Some(at);
        }
        added
    }

    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.expires_at.map(|at| at <= now).unwrap_or(false)
    }

    pub fn visible_to(&self, user_id: UserId) -> bool {
        !self.is_deleted && !self.hidden_for.contains(&user_id)
    }

    /// 对指定用户是否计入未读：非本人发送、对其可见、且无其已读回执
    pub fn is_unread_for(&self, user_id: UserId) -> bool {
        self.sender_id != user_id && self.visible_to(user_id) && !self.has_read_receipt(user_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn text_message(sender: UserId) -> Message {
        Message::new(
            MessageId::new(Uuid::new_v4()),
            ConversationId::new(Uuid::new_v4()),
            sender,
            MessageContent::Text {
                text: "hi".to_string(),
            },
            None,
            None,
            None,
            Utc::now(),
        )
        .unwrap()
    }

    #[test]
    fn content_payload_is_validated_at_construction() {
        let sender = UserId::new(Uuid::new_v4());
        let conversation = ConversationId::new(Uuid::new_v4());
        let now = Utc::now();

        let empty_text = MessageContent::Text {
            text: "   ".to_string(),
        };
        assert!(Message::new(
            MessageId::new(Uuid::new_v4()),
            conversation,
            sender,
            empty_text,
            None,
            None,
            None,
            now,
        )
        .is_err());

        let bad_location = MessageContent::Location {
            latitude: 91.0,
            longitude: 0.0,
            label: None,
        };
        assert!(bad_location.validate().is_err());

        let location = MessageContent::Location {
            latitude: 31.23,
            longitude: 121.47,
            label: Some("Shanghai".to_string()),
        };
        assert!(location.validate().is_ok());
        assert_eq!(location.kind(), MessageKind::Location);
    }

    #[test]
    fn status_advances_forward_only() {
        let reader = UserId::new(Uuid::new_v4());
        let mut message = text_message(UserId::new(Uuid::new_v4()));
        let now = Utc::now();

        assert!(message.mark_delivered_by(reader, now));
        assert_eq!(message.status, MessageStatus::Delivered);

        assert!(message.mark_read_by(reader, now));
        assert_eq!(message.status, MessageStatus::Read);

        // delivered 不再回退 read 状态
        let other = UserId::new(Uuid::new_v4());
        assert!(message.mark_delivered_by(other, now));
        assert_eq!(message.status, MessageStatus::Read);
    }

    #[test]
    fn read_without_prior_delivery_still_advances_to_read() {
        let reader = UserId::new(Uuid::new_v4());
        let mut message = text_message(UserId::new(Uuid::new_v4()));

        assert!(message.mark_read_by(reader, Utc::now()));
        assert_eq!(message.status, MessageStatus::Read);
        assert!(message.has_read_receipt(reader));
        // 已读蕴含送达是状态层面的语义，不伪造送达回执
        assert!(!message.has_delivery_receipt(reader));
    }

    #[test]
    fn receipts_are_idempotent_per_user() {
        let reader = UserId::new(Uuid::new_v4());
        let mut message = text_message(UserId::new(Uuid::new_v4()));
        let now = Utc::now();

        assert!(message.mark_read_by(reader, now));
        assert!(!message.mark_read_by(reader, now));
        assert_eq!(message.read_by.len(), 1);

        assert!(message.mark_delivered_by(reader, now));
        assert!(!message.mark_delivered_by(reader, now));
        assert_eq!(message.delivered_to.len(), 1);
    }

    #[test]
    fn sender_acknowledgements_are_ignored() {
        let sender = UserId::new(Uuid::new_v4());
        let mut message = text_message(sender);

        assert!(!message.mark_delivered_by(sender, Utc::now()));
        assert!(!message.mark_read_by(sender, Utc::now()));
        assert_eq!(message.status, MessageStatus::Sent);
    }

    #[test]
    fn failed_is_terminal_and_only_reachable_from_sent() {
        let reader = UserId::new(Uuid::new_v4());
        let mut message = text_message(UserId::new(Uuid::new_v4()));
        let now = Utc::now();

        message.mark_delivered_by(reader, now);
        assert!(message.mark_failed(now).is_err());

        let mut fresh = text_message(UserId::new(Uuid::new_v4()));
        assert!(fresh.mark_failed(now).is_ok());
        assert_eq!(fresh.status, MessageStatus::Failed);
    }

    #[test]
    fn a_user_holds_at_most_one_reaction() {
        let user = UserId::new(Uuid::new_v4());
        let mut message = text_message(UserId::new(Uuid::new_v4()));
        let now = Utc::now();

        message.add_reaction(user, "🔥", now).unwrap();
        message.add_reaction(user, "❤️", now).unwrap();

        assert_eq!(message.reactions.len(), 1);
        assert_eq!(message.reactions.get(&user).unwrap().emoji, "❤️");

        let grouped = message.reactions_by_emoji();
        assert_eq!(grouped.get("❤️"), Some(&vec![user]));
        assert!(!grouped.contains_key("🔥"));

        assert!(message.remove_reaction(user, now));
        assert!(!message.remove_reaction(user, now));
    }

    #[test]
    fn tombstone_replaces_content_and_keeps_record() {
        let mut message = text_message(UserId::new(Uuid::new_v4()));
        let id = message.id;
        message.delete_for_everyone(Utc::now());

        assert!(message.is_deleted);
        assert_eq!(message.id, id);
        assert!(matches!(
            &message.content,
            MessageContent::System { code, .. } if code == "deleted"
        ));
        assert!(!message.visible_to(UserId::new(Uuid::new_v4())));
    }

    #[test]
    fn hide_for_user_is_independent_of_global_delete() {
        let viewer = UserId::new(Uuid::new_v4());
        let other = UserId::new(Uuid::new_v4());
        let mut message = text_message(UserId::new(Uuid::new_v4()));
        let now = Utc::now();

        assert!(message.hide_for(viewer, now));
        assert!(!message.hide_for(viewer, now));

        assert!(!message.visible_to(viewer));
        assert!(message.visible_to(other));
        assert!(!message.is_deleted);
    }

    #[test]
    fn only_text_messages_can_be_edited() {
        let sender = UserId::new(Uuid::new_v4());
        let mut message = text_message(sender);
        let now = Utc::now();

        message.edit("hello again", now).unwrap();
        assert!(message.is_edited);
        assert!(matches!(
            &message.content,
            MessageContent::Text { text } if text == "hello again"
        ));

        let mut location = Message::new(
            MessageId::new(Uuid::new_v4()),
            ConversationId::new(Uuid::new_v4()),
            sender,
            MessageContent::Location {
                latitude: 0.0,
                longitude: 0.0,
                label: None,
            },
            None,
            None,
            None,
            now,
        )
        .unwrap();
        assert!(matches!(
            location.edit("nope", now),
            Err(DomainError::PermissionDenied { .. })
        ));
    }

    #[test]
    fn expiry_conversion_is_idempotent() {
        let now = Utc::now();
        let mut message = text_message(UserId::new(Uuid::new_v4()));
        message.expires_at = Some(now - chrono::Duration::seconds(1));

        assert!(message.is_expired(now));
        message.expire(now);
        let snapshot = message.clone();
        message.expire(now);
        assert_eq!(message, snapshot);
    }
}
