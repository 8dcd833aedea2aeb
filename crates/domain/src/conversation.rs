//! 会话实体定义
//!
//! 包含单聊/群聊会话、成员关系、角色权限策略和「最近一条消息」摘要。
//! 不变量：单聊恒为两个不同参与者；群聊至少两名活跃成员；
//! 最近消息摘要只按时间戳前进，永不回退。

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::errors::{DomainError, DomainResult};
use crate::message::MessageKind;
use crate::value_objects::{ConversationId, MessageId, Timestamp, UserId};

/// 摘要截断长度
const PREVIEW_MAX_CHARS: usize = 80;

/// 会话类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationKind {
    /// 单聊
    Direct,
    /// 群聊
    Group,
}

/// 会话生命周期状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    Active,
    Archived,
    /// 软删除，记录保留
    Deleted,
}

/// 成员角色
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberRole {
    Admin,
    Moderator,
    Member,
}

/// 角色门控策略（谁可以发消息 / 加人 / 改资料）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionPolicy {
    AdminOnly,
    ModeratorsAndAdmins,
    AllMembers,
}

impl PermissionPolicy {
    /// 判断指定角色是否满足该策略
    pub fn allows(&self, role: MemberRole) -> bool {
        match self {
            PermissionPolicy::AdminOnly => role == MemberRole::Admin,
            PermissionPolicy::ModeratorsAndAdmins => {
                matches!(role, MemberRole::Admin | MemberRole::Moderator)
            }
            PermissionPolicy::AllMembers => true,
        }
    }
}

/// 成员级通知偏好
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationPreferences {
    pub muted: bool,
    pub sound: bool,
}

impl Default for NotificationPreferences {
    fn default() -> Self {
        Self {
            muted: false,
            sound: true,
        }
    }
}

/// 会话成员记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Membership {
    pub user_id: UserId,
    pub role: MemberRole,
    pub joined_at: Timestamp,
    pub last_seen_at: Option<Timestamp>,
    /// 退群/被移除后置为 false，记录保留
    pub is_active: bool,
    #[serde(default)]
    pub notifications: NotificationPreferences,
}

impl Membership {
    pub fn new(user_id: UserId, role: MemberRole, joined_at: Timestamp) -> Self {
        Self {
            user_id,
            role,
            joined_at,
            last_seen_at: None,
            is_active: true,
            notifications: NotificationPreferences::default(),
        }
    }
}

/// 群聊专属设置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupSettings {
    pub who_can_add_members: PermissionPolicy,
    pub who_can_edit_info: PermissionPolicy,
    pub who_can_send_messages: PermissionPolicy,
    pub member_cap: Option<u32>,
    /// 自动过期策略：创建消息时盖上 now + 该秒数 的过期时间戳
    pub auto_expire_after_secs: Option<i64>,
}

impl Default for GroupSettings {
    fn default() -> Self {
        Self {
            who_can_add_members: PermissionPolicy::AllMembers,
            who_can_edit_info: PermissionPolicy::ModeratorsAndAdmins,
            who_can_send_messages: PermissionPolicy::AllMembers,
            member_cap: None,
            auto_expire_after_secs: None,
        }
    }
}

/// 最近一条消息的缓存摘要，用于会话列表展示
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LastMessagePreview {
    pub message_id: MessageId,
    pub preview: String,
    pub kind: MessageKind,
    pub sender_id: UserId,
    pub sent_at: Timestamp,
}

impl LastMessagePreview {
    pub fn new(
        message_id: MessageId,
        preview: impl Into<String>,
        kind: MessageKind,
        sender_id: UserId,
        sent_at: Timestamp,
    ) -> Self {
        let mut preview: String = preview.into();
        if preview.chars().count() > PREVIEW_MAX_CHARS {
            preview = preview.chars().take(PREVIEW_MAX_CHARS).collect();
        }
        Self {
            message_id,
            preview,
            kind,
            sender_id,
            sent_at,
        }
    }
}

/// 会话实体
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub kind: ConversationKind,
    pub title: Option<String>,
    pub members: Vec<Membership>,
    pub creator_id: UserId,
    pub status: ConversationStatus,
    pub last_message: Option<LastMessagePreview>,
    /// 单调递增的消息计数
    pub message_count: u64,
    /// 群聊设置，单聊为 None
    pub settings: Option<GroupSettings>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Conversation {
    /// 创建单聊会话，恒为两个不同参与者
    pub fn new_direct(
        id: ConversationId,
        creator_id: UserId,
        peer_id: UserId,
        now: Timestamp,
    ) -> DomainResult<Self> {
        if creator_id == peer_id {
            return Err(DomainError::validation_error(
                "members",
                "direct conversation requires exactly two distinct participants",
            ));
        }
        Ok(Self {
            id,
            kind: ConversationKind::Direct,
            title: None,
            members: vec![
                Membership::new(creator_id, MemberRole::Member, now),
                Membership::new(peer_id, MemberRole::Member, now),
            ],
            creator_id,
            status: ConversationStatus::Active,
            last_message: None,
            message_count: 0,
            settings: None,
            created_at: now,
            updated_at: now,
        })
    }

    /// 创建群聊会话，创建者自动成为管理员
    pub fn new_group(
        id: ConversationId,
        creator_id: UserId,
        title: impl Into<String>,
        initial_members: Vec<UserId>,
        settings: GroupSettings,
        now: Timestamp,
    ) -> DomainResult<Self> {
        let title = Self::validate_title(title.into())?;

        let mut members = vec![Membership::new(creator_id, MemberRole::Admin, now)];
        for user_id in initial_members {
            if user_id == creator_id || members.iter().any(|m| m.user_id == user_id) {
                continue;
            }
            members.push(Membership::new(user_id, MemberRole::Member, now));
        }

        if members.len() < 2 {
            return Err(DomainError::validation_error(
                "members",
                "group conversation requires at least two active members",
            ));
        }
        if let Some(cap) = settings.member_cap {
            if members.len() as u32 > cap {
                return Err(DomainError::validation_error("members", "member cap exceeded"));
            }
        }

        Ok(Self {
            id,
            kind: ConversationKind::Group,
            title: Some(title),
            members,
            creator_id,
            status: ConversationStatus::Active,
            last_message: None,
            message_count: 0,
            settings: Some(settings),
            created_at: now,
            updated_at: now,
        })
    }

    /// 查找成员记录（包含已失效成员）
    pub fn member(&self, user_id: UserId) -> Option<&Membership> {
        self.members.iter().find(|m| m.user_id == user_id)
    }

    fn member_mut(&mut self, user_id: UserId) -> Option<&mut Membership> {
        self.members.iter_mut().find(|m| m.user_id == user_id)
    }

    /// 是否为活跃成员
    pub fn is_member(&self, user_id: UserId) -> bool {
        self.member(user_id).map(|m| m.is_active).unwrap_or(false)
    }

    pub fn role_of(&self, user_id: UserId) -> Option<MemberRole> {
        self.member(user_id).filter(|m| m.is_active).map(|m| m.role)
    }

    pub fn active_member_ids(&self) -> Vec<UserId> {
        self.members
            .iter()
            .filter(|m| m.is_active)
            .map(|m| m.user_id)
            .collect()
    }

    fn active_member_count(&self) -> usize {
        self.members.iter().filter(|m| m.is_active).count()
    }

    /// 是否允许指定成员发消息（角色门控策略）
    pub fn can_send_messages(&self, user_id: UserId) -> bool {
        let Some(role) = self.role_of(user_id) else {
            return false;
        };
        match &self.settings {
            Some(settings) => settings.who_can_send_messages.allows(role),
            None => true,
        }
    }

    pub fn can_add_members(&self, user_id: UserId) -> bool {
        let Some(role) = self.role_of(user_id) else {
            return false;
        };
        match &self.settings {
            Some(settings) => settings.who_can_add_members.allows(role),
            None => false,
        }
    }

    pub fn can_edit_info(&self, user_id: UserId) -> bool {
        let Some(role) = self.role_of(user_id) else {
            return false;
        };
        match &self.settings {
            Some(settings) => settings.who_can_edit_info.allows(role),
            None => false,
        }
    }

    /// 发消息时根据群设置计算过期时间戳
    pub fn expiry_for(&self, now: Timestamp) -> Option<Timestamp> {
        self.settings
            .as_ref()
            .and_then(|s| s.auto_expire_after_secs)
            .map(|secs| now + Duration::seconds(secs))
    }

    /// 加入新成员（仅群聊）。重复加入已失效成员时重新激活。
    pub fn add_member(&mut self, user_id: UserId, now: Timestamp) -> DomainResult<()> {
        if self.kind != ConversationKind::Group {
            return Err(DomainError::business_rule_violation(
                "members can only be added to group conversations",
            ));
        }
        if let Some(member) = self.member_mut(user_id) {
            if member.is_active {
                return Err(DomainError::business_rule_violation("user is already a member"));
            }
            member.is_active = true;
            member.joined_at = now;
            self.updated_at = now;
            return Ok(());
        }
        if let Some(cap) = self.settings.as_ref().and_then(|s| s.member_cap) {
            if self.active_member_count() as u32 >= cap {
                return Err(DomainError::business_rule_violation("member cap reached"));
            }
        }
        self.members
            .push(Membership::new(user_id, MemberRole::Member, now));
        self.updated_at = now;
        Ok(())
    }

    /// 移除成员（仅群聊，置为失效）。不允许使活跃成员数降到 2 以下。
    pub fn remove_member(&mut self, user_id: UserId, now: Timestamp) -> DomainResult<()> {
        if self.kind != ConversationKind::Group {
            return Err(DomainError::business_rule_violation(
                "members cannot be removed from direct conversations",
            ));
        }
        if !self.is_member(user_id) {
            return Err(DomainError::not_found("membership", user_id.to_string()));
        }
        if self.active_member_count() <= 2 {
            return Err(DomainError::business_rule_violation(
                "group conversation requires at least two active members",
            ));
        }
        if let Some(member) = self.member_mut(user_id) {
            member.is_active = false;
        }
        self.updated_at = now;
        Ok(())
    }

    /// 变更成员角色
    pub fn change_role(&mut self, user_id: UserId, role: MemberRole, now: Timestamp) -> DomainResult<()> {
        let member = self
            .member_mut(user_id)
            .filter(|m| m.is_active)
            .ok_or_else(|| DomainError::not_found("membership", user_id.to_string()))?;
        member.role = role;
        self.updated_at = now;
        Ok(())
    }

    /// 更新成员最近活跃时间
    pub fn touch_last_seen(&mut self, user_id: UserId, now: Timestamp) {
        if let Some(member) = self.member_mut(user_id) {
            member.last_seen_at = Some(now);
        }
    }

    /// 更新成员通知偏好
    pub fn set_notifications(
        &mut self,
        user_id: UserId,
        prefs: NotificationPreferences,
    ) -> DomainResult<()> {
        let member = self
            .member_mut(user_id)
            .filter(|m| m.is_active)
            .ok_or_else(|| DomainError::not_found("membership", user_id.to_string()))?;
        member.notifications = prefs;
        Ok(())
    }

    /// 记录一条新消息：计数递增，摘要只按时间戳前进
    pub fn record_message(&mut self, preview: LastMessagePreview, now: Timestamp) {
        self.message_count += 1;
        let advance = match &self.last_message {
            Some(current) => preview.sent_at >= current.sent_at,
            None => true,
        };
        if advance {
            self.last_message = Some(preview);
        }
        self.updated_at = now;
    }

    /// 修改群标题
    pub fn rename(&mut self, title: impl Into<String>, now: Timestamp) -> DomainResult<()> {
        if self.kind != ConversationKind::Group {
            return Err(DomainError::business_rule_violation(
                "direct conversations cannot be renamed",
            ));
        }
        self.title = Some(Self::validate_title(title.into())?);
        self.updated_at = now;
        Ok(())
    }

    /// 更新群设置
    pub fn update_settings(&mut self, settings: GroupSettings, now: Timestamp) -> DomainResult<()> {
        if self.kind != ConversationKind::Group {
            return Err(DomainError::business_rule_violation(
                "direct conversations have no settings",
            ));
        }
        self.settings = Some(settings);
        self.updated_at = now;
        Ok(())
    }

    pub fn archive(&mut self, now: Timestamp) {
        self.status = ConversationStatus::Archived;
        self.updated_at = now;
    }

    /// 软删除，永不物理删除
    pub fn mark_deleted(&mut self, now: Timestamp) {
        self.status = ConversationStatus::Deleted;
        self.updated_at = now;
    }

    fn validate_title(title: String) -> DomainResult<String> {
        let trimmed = title.trim();
        if trimmed.is_empty() {
            return Err(DomainError::validation_error("title", "cannot be empty"));
        }
        if trimmed.chars().count() > 120 {
            return Err(DomainError::validation_error("title", "too long"));
        }
        Ok(trimmed.to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn ids() -> (ConversationId, UserId, UserId, UserId) {
        (
            ConversationId::new(Uuid::new_v4()),
            UserId::new(Uuid::new_v4()),
            UserId::new(Uuid::new_v4()),
            UserId::new(Uuid::new_v4()),
        )
    }

    #[test]
    fn direct_conversation_requires_two_distinct_participants() {
        let (id, a, b, _) = ids();
        let now = Utc::now();

        assert!(Conversation::new_direct(id, a, a, now).is_err());

        let conversation = Conversation::new_direct(id, a, b, now).unwrap();
        assert_eq!(conversation.members.len(), 2);
        assert!(conversation.is_member(a));
        assert!(conversation.is_member(b));
    }

    #[test]
    fn group_conversation_requires_two_active_members() {
        let (id, a, b, _) = ids();
        let now = Utc::now();

        // 只有创建者一人
        assert!(
            Conversation::new_group(id, a, "team", vec![], GroupSettings::default(), now).is_err()
        );
        // 重复传入创建者不算第二人
        assert!(
            Conversation::new_group(id, a, "team", vec![a], GroupSettings::default(), now).is_err()
        );

        let group =
            Conversation::new_group(id, a, "team", vec![b], GroupSettings::default(), now).unwrap();
        assert_eq!(group.role_of(a), Some(MemberRole::Admin));
        assert_eq!(group.role_of(b), Some(MemberRole::Member));
    }

    #[test]
    fn remove_member_keeps_at_least_two_active() {
        let (id, a, b, c) = ids();
        let now = Utc::now();
        let mut group =
            Conversation::new_group(id, a, "team", vec![b, c], GroupSettings::default(), now)
                .unwrap();

        group.remove_member(c, now).unwrap();
        assert!(!group.is_member(c));
        // 剩余两名活跃成员，继续移除会破坏不变量
        assert!(group.remove_member(b, now).is_err());
    }

    #[test]
    fn send_permission_follows_role_policy() {
        let (id, a, b, c) = ids();
        let now = Utc::now();
        let settings = GroupSettings {
            who_can_send_messages: PermissionPolicy::ModeratorsAndAdmins,
            ..GroupSettings::default()
        };
        let mut group = Conversation::new_group(id, a, "ops", vec![b, c], settings, now).unwrap();

        assert!(group.can_send_messages(a));
        assert!(!group.can_send_messages(b));

        group.change_role(b, MemberRole::Moderator, now).unwrap();
        assert!(group.can_send_messages(b));
    }

    #[test]
    fn last_message_preview_never_regresses() {
        let (id, a, b, _) = ids();
        let now = Utc::now();
        let mut conversation = Conversation::new_direct(id, a, b, now).unwrap();

        let newer = LastMessagePreview::new(
            MessageId::new(Uuid::new_v4()),
            "second",
            MessageKind::Text,
            a,
            now + Duration::seconds(10),
        );
        let older = LastMessagePreview::new(
            MessageId::new(Uuid::new_v4()),
            "first",
            MessageKind::Text,
            b,
            now,
        );

        conversation.record_message(newer.clone(), now);
        // 乱序到达的旧消息仍然计数，但不回退摘要
        conversation.record_message(older, now);

        assert_eq!(conversation.message_count, 2);
        assert_eq!(conversation.last_message, Some(newer));
    }

    #[test]
    fn expiry_stamp_uses_group_settings() {
        let (id, a, b, _) = ids();
        let now = Utc::now();
        let settings = GroupSettings {
            auto_expire_after_secs: Some(3600),
            ..GroupSettings::default()
        };
        let group = Conversation::new_group(id, a, "temp", vec![b], settings, now).unwrap();

        assert_eq!(group.expiry_for(now), Some(now + Duration::seconds(3600)));

        let direct = Conversation::new_direct(id, a, b, now).unwrap();
        assert_eq!(direct.expiry_for(now), None);
    }
}
