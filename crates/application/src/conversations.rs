//! 会话管理服务
//!
//! 单聊开启（去重）、群聊创建、成员增删、资料与设置修改、通知偏好。
//! 角色门控在这里统一执行，领域层只负责结构不变量。

use std::sync::Arc;

use tracing::info;
use uuid::Uuid;

use domain::{
    Conversation, ConversationId, GroupSettings, MemberRole, NotificationPreferences, UserId,
};

use crate::clock::Clock;
use crate::error::{ApplicationError, ApplicationResult};
use crate::repository::ConversationRepository;

pub struct ConversationService {
    conversations: Arc<dyn ConversationRepository>,
    clock: Arc<dyn Clock>,
}

impl ConversationService {
    pub fn new(conversations: Arc<dyn ConversationRepository>, clock: Arc<dyn Clock>) -> Self {
        Self {
            conversations,
            clock,
        }
    }

    async fn load(&self, conversation_id: ConversationId) -> ApplicationResult<Conversation> {
        self.conversations
            .find_by_id(conversation_id)
            .await?
            .ok_or_else(|| ApplicationError::not_found("conversation does not exist"))
    }

    /// 开启单聊。两人之间已有单聊时直接复用，返回值标记是否新建。
    pub async fn open_direct(
        &self,
        creator_id: UserId,
        peer_id: UserId,
    ) -> ApplicationResult<(Conversation, bool)> {
        if let Some(existing) = self
            .conversations
            .find_direct_between(creator_id, peer_id)
            .await?
        {
            return Ok((existing, false));
        }
        let conversation = Conversation::new_direct(
            ConversationId::new(Uuid::new_v4()),
            creator_id,
            peer_id,
            self.clock.now(),
        )?;
        let stored = self.conversations.create(conversation).await?;
        info!(conversation_id = %stored.id, "direct conversation created");
        Ok((stored, true))
    }

    /// 创建群聊，创建者自动成为管理员
    pub async fn create_group(
        &self,
        creator_id: UserId,
        title: String,
        initial_members: Vec<UserId>,
        settings: GroupSettings,
    ) -> ApplicationResult<Conversation> {
        let conversation = Conversation::new_group(
            ConversationId::new(Uuid::new_v4()),
            creator_id,
            title,
            initial_members,
            settings,
            self.clock.now(),
        )?;
        let stored = self.conversations.create(conversation).await?;
        info!(conversation_id = %stored.id, creator_id = %creator_id, "group conversation created");
        Ok(stored)
    }

    /// 加人，受群设置的角色门控约束
    pub async fn add_member(
        &self,
        actor_id: UserId,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> ApplicationResult<Conversation> {
        let mut conversation = self.load(conversation_id).await?;
        if !conversation.can_add_members(actor_id) {
            return Err(ApplicationError::authorization(
                "user is not allowed to add members",
            ));
        }
        conversation.add_member(user_id, self.clock.now())?;
        Ok(self.conversations.update(conversation).await?)
    }

    /// 移除成员：本人可自行退出，否则需要管理员/协管员
    pub async fn remove_member(
        &self,
        actor_id: UserId,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> ApplicationResult<Conversation> {
        let mut conversation = self.load(conversation_id).await?;
        if actor_id != user_id {
            let allowed = matches!(
                conversation.role_of(actor_id),
                Some(MemberRole::Admin | MemberRole::Moderator)
            );
            if !allowed {
                return Err(ApplicationError::authorization(
                    "only a moderator can remove other members",
                ));
            }
        }
        conversation.remove_member(user_id, self.clock.now())?;
        Ok(self.conversations.update(conversation).await?)
    }

    /// 改群标题，受 who_can_edit_info 门控
    pub async fn rename(
        &self,
        actor_id: UserId,
        conversation_id: ConversationId,
        title: String,
    ) -> ApplicationResult<Conversation> {
        let mut conversation = self.load(conversation_id).await?;
        if !conversation.can_edit_info(actor_id) {
            return Err(ApplicationError::authorization(
                "user is not allowed to edit conversation info",
            ));
        }
        conversation.rename(title, self.clock.now())?;
        Ok(self.conversations.update(conversation).await?)
    }

    /// 更新群设置，仅管理员
    pub async fn update_settings(
        &self,
        actor_id: UserId,
        conversation_id: ConversationId,
        settings: GroupSettings,
    ) -> ApplicationResult<Conversation> {
        let mut conversation = self.load(conversation_id).await?;
        if conversation.role_of(actor_id) != Some(MemberRole::Admin) {
            return Err(ApplicationError::authorization(
                "only an admin can change conversation settings",
            ));
        }
        conversation.update_settings(settings, self.clock.now())?;
        Ok(self.conversations.update(conversation).await?)
    }

    /// 修改自己的通知偏好
    pub async fn set_notifications(
        &self,
        user_id: UserId,
        conversation_id: ConversationId,
        prefs: NotificationPreferences,
    ) -> ApplicationResult<Conversation> {
        let mut conversation = self.load(conversation_id).await?;
        conversation.set_notifications(user_id, prefs)?;
        Ok(self.conversations.update(conversation).await?)
    }

    /// 某用户的会话列表
    pub async fn list_for_user(&self, user_id: UserId) -> ApplicationResult<Vec<Conversation>> {
        let mut conversations = self.conversations.find_by_member(user_id).await?;
        conversations.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(conversations)
    }

    pub async fn get(&self, conversation_id: ConversationId) -> ApplicationResult<Conversation> {
        self.load(conversation_id).await
    }
}
