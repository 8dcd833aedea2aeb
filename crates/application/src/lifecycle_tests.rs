//! 消息生命周期引擎的用例测试

use std::sync::Arc;

use uuid::Uuid;

use domain::{
    GroupSettings, MemberRole, MessageContent, PermissionPolicy, UserId,
};

use crate::clock::SystemClock;
use crate::error::ApplicationError;
use crate::lifecycle::{MessageDraft, MessageLifecycleDependencies, MessageLifecycleEngine};
use crate::repository::memory::InMemoryChatStore;
use crate::repository::{ConversationRepository, MessageRepository};

fn user() -> UserId {
    UserId::new(Uuid::new_v4())
}

fn engine(store: Arc<InMemoryChatStore>) -> MessageLifecycleEngine {
    MessageLifecycleEngine::new(MessageLifecycleDependencies {
        conversations: store.clone(),
        messages: store,
        clock: Arc::new(SystemClock),
    })
}

async fn direct_conversation(
    store: &Arc<InMemoryChatStore>,
    a: UserId,
    b: UserId,
) -> domain::Conversation {
    let conversation = domain::Conversation::new_direct(
        domain::ConversationId::new(Uuid::new_v4()),
        a,
        b,
        chrono::Utc::now(),
    )
    .unwrap();
    ConversationRepository::create(store.as_ref(), conversation)
        .await
        .unwrap()
}

#[tokio::test]
async fn create_persists_message_and_advances_summary() {
    let store = Arc::new(InMemoryChatStore::new());
    let (alice, bob) = (user(), user());
    let conversation = direct_conversation(&store, alice, bob).await;
    let engine = engine(store.clone());

    let message = engine
        .create(alice, conversation.id, MessageDraft::text("hello"))
        .await
        .unwrap();

    assert_eq!(message.sender_id, alice);
    let reloaded = ConversationRepository::find_by_id(store.as_ref(), conversation.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reloaded.message_count, 1);
    assert_eq!(
        reloaded.last_message.as_ref().map(|p| p.message_id),
        Some(message.id)
    );
}

#[tokio::test]
async fn non_member_cannot_create_message() {
    let store = Arc::new(InMemoryChatStore::new());
    let conversation = direct_conversation(&store, user(), user()).await;
    let engine = engine(store);

    let outsider = user();
    let error = engine
        .create(outsider, conversation.id, MessageDraft::text("hi"))
        .await
        .unwrap_err();
    assert!(matches!(error, ApplicationError::Authorization(_)));
}

#[tokio::test]
async fn send_permission_policy_blocks_plain_members() {
    let store = Arc::new(InMemoryChatStore::new());
    let (admin, member) = (user(), user());
    let settings = GroupSettings {
        who_can_send_messages: PermissionPolicy::ModeratorsAndAdmins,
        ..GroupSettings::default()
    };
    let group = domain::Conversation::new_group(
        domain::ConversationId::new(Uuid::new_v4()),
        admin,
        "announcements",
        vec![member],
        settings,
        chrono::Utc::now(),
    )
    .unwrap();
    let group = ConversationRepository::create(store.as_ref(), group)
        .await
        .unwrap();
    let engine = engine(store);

    assert!(engine
        .create(admin, group.id, MessageDraft::text("notice"))
        .await
        .is_ok());
    let error = engine
        .create(member, group.id, MessageDraft::text("me too"))
        .await
        .unwrap_err();
    assert!(matches!(error, ApplicationError::Authorization(_)));
}

#[tokio::test]
async fn reply_ref_carries_denormalized_preview() {
    let store = Arc::new(InMemoryChatStore::new());
    let (alice, bob) = (user(), user());
    let conversation = direct_conversation(&store, alice, bob).await;
    let engine = engine(store);

    let original = engine
        .create(alice, conversation.id, MessageDraft::text("original"))
        .await
        .unwrap();

    let reply = engine
        .create(
            bob,
            conversation.id,
            MessageDraft {
                content: MessageContent::Text {
                    text: "reply".into(),
                },
                reply_to: Some(original.id),
                forward_of: None,
            },
        )
        .await
        .unwrap();

    let reference = reply.reply_to.unwrap();
    assert_eq!(reference.message_id, original.id);
    assert_eq!(reference.preview, "original");
    assert_eq!(reference.sender_id, alice);
}

#[tokio::test]
async fn reply_to_foreign_conversation_is_rejected() {
    let store = Arc::new(InMemoryChatStore::new());
    let (alice, bob) = (user(), user());
    let first = direct_conversation(&store, alice, bob).await;
    let second = direct_conversation(&store, alice, user()).await;
    let engine = engine(store);

    let foreign = engine
        .create(alice, second.id, MessageDraft::text("elsewhere"))
        .await
        .unwrap();

    let error = engine
        .create(
            bob,
            first.id,
            MessageDraft {
                content: MessageContent::Text { text: "hm".into() },
                reply_to: Some(foreign.id),
                forward_of: None,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(error, ApplicationError::Validation(_)));
}

#[tokio::test]
async fn only_sender_can_edit() {
    let store = Arc::new(InMemoryChatStore::new());
    let (alice, bob) = (user(), user());
    let conversation = direct_conversation(&store, alice, bob).await;
    let engine = engine(store);

    let message = engine
        .create(alice, conversation.id, MessageDraft::text("tyop"))
        .await
        .unwrap();

    let error = engine
        .edit(bob, message.id, "typo".into())
        .await
        .unwrap_err();
    assert!(matches!(error, ApplicationError::Authorization(_)));

    let edited = engine.edit(alice, message.id, "typo".into()).await.unwrap();
    assert!(edited.is_edited);
}

#[tokio::test]
async fn moderator_can_delete_for_everyone() {
    let store = Arc::new(InMemoryChatStore::new());
    let (admin, mod_user, member) = (user(), user(), user());
    let mut group = domain::Conversation::new_group(
        domain::ConversationId::new(Uuid::new_v4()),
        admin,
        "team",
        vec![mod_user, member],
        GroupSettings::default(),
        chrono::Utc::now(),
    )
    .unwrap();
    group
        .change_role(mod_user, MemberRole::Moderator, chrono::Utc::now())
        .unwrap();
    let group = ConversationRepository::create(store.as_ref(), group)
        .await
        .unwrap();
    let engine = engine(store);

    let message = engine
        .create(member, group.id, MessageDraft::text("spam"))
        .await
        .unwrap();

    // 普通成员不能删别人的消息
    let other = engine
        .create(admin, group.id, MessageDraft::text("keep"))
        .await
        .unwrap();
    assert!(matches!(
        engine.delete_for_everyone(member, other.id).await,
        Err(ApplicationError::Authorization(_))
    ));

    let deleted = engine
        .delete_for_everyone(mod_user, message.id)
        .await
        .unwrap();
    assert!(deleted.is_deleted);
}

#[tokio::test]
async fn delete_for_user_hides_without_tombstoning() {
    let store = Arc::new(InMemoryChatStore::new());
    let (alice, bob) = (user(), user());
    let conversation = direct_conversation(&store, alice, bob).await;
    let engine = engine(store.clone());

    let message = engine
        .create(alice, conversation.id, MessageDraft::text("for alice only"))
        .await
        .unwrap();

    assert!(engine.delete_for_user(bob, message.id).await.unwrap());
    // 重复隐藏是幂等 no-op
    assert!(!engine.delete_for_user(bob, message.id).await.unwrap());

    let stored = MessageRepository::find_by_id(store.as_ref(), message.id)
        .await
        .unwrap()
        .unwrap();
    assert!(!stored.is_deleted);
    assert!(!stored.visible_to(bob));
    assert!(stored.visible_to(alice));
}

#[tokio::test]
async fn reaction_outcomes_group_by_emoji() {
    let store = Arc::new(InMemoryChatStore::new());
    let (alice, bob) = (user(), user());
    let conversation = direct_conversation(&store, alice, bob).await;
    let engine = engine(store);

    let message = engine
        .create(alice, conversation.id, MessageDraft::text("news"))
        .await
        .unwrap();

    engine
        .add_reaction(alice, message.id, "👍".into())
        .await
        .unwrap();
    let outcome = engine
        .add_reaction(bob, message.id, "👍".into())
        .await
        .unwrap();
    assert_eq!(outcome.grouped.get("👍").map(Vec::len), Some(2));

    // 换表情替换旧表态
    let outcome = engine
        .add_reaction(bob, message.id, "🎉".into())
        .await
        .unwrap();
    assert_eq!(outcome.grouped.get("👍").map(Vec::len), Some(1));
    assert_eq!(outcome.grouped.get("🎉").map(Vec::len), Some(1));

    // 移除自己的表态；重复移除是幂等 no-op
    let outcome = engine.remove_reaction(bob, message.id).await.unwrap();
    assert!(outcome.changed);
    assert!(!outcome.grouped.contains_key("🎉"));
    let outcome = engine.remove_reaction(bob, message.id).await.unwrap();
    assert!(!outcome.changed);
}

#[tokio::test]
async fn non_member_cannot_remove_reactions() {
    let store = Arc::new(InMemoryChatStore::new());
    let (alice, bob) = (user(), user());
    let conversation = direct_conversation(&store, alice, bob).await;
    let engine = engine(store);

    let message = engine
        .create(alice, conversation.id, MessageDraft::text("hi"))
        .await
        .unwrap();

    let error = engine.remove_reaction(user(), message.id).await.unwrap_err();
    assert!(matches!(error, ApplicationError::Authorization(_)));
}

#[tokio::test]
async fn editing_non_text_message_is_a_permission_error() {
    let store = Arc::new(InMemoryChatStore::new());
    let (alice, bob) = (user(), user());
    let conversation = direct_conversation(&store, alice, bob).await;
    let engine = engine(store);

    let location = engine
        .create(
            alice,
            conversation.id,
            MessageDraft {
                content: MessageContent::Location {
                    latitude: 31.23,
                    longitude: 121.47,
                    label: None,
                },
                reply_to: None,
                forward_of: None,
            },
        )
        .await
        .unwrap();

    let error = engine
        .edit(alice, location.id, "still a location".into())
        .await
        .unwrap_err();
    assert!(matches!(
        error,
        ApplicationError::Domain(domain::DomainError::PermissionDenied { .. })
    ));
}

#[tokio::test]
async fn history_excludes_hidden_but_keeps_tombstones() {
    let store = Arc::new(InMemoryChatStore::new());
    let (alice, bob) = (user(), user());
    let conversation = direct_conversation(&store, alice, bob).await;
    let engine = engine(store);

    let hidden = engine
        .create(alice, conversation.id, MessageDraft::text("one"))
        .await
        .unwrap();
    let deleted = engine
        .create(alice, conversation.id, MessageDraft::text("two"))
        .await
        .unwrap();
    engine
        .create(bob, conversation.id, MessageDraft::text("three"))
        .await
        .unwrap();

    engine.delete_for_user(bob, hidden.id).await.unwrap();
    engine.delete_for_everyone(alice, deleted.id).await.unwrap();

    let history = engine.history(bob, conversation.id, 50, None).await.unwrap();
    assert_eq!(history.len(), 2);
    assert!(history.iter().any(|m| m.id == deleted.id && m.is_deleted));
    assert!(!history.iter().any(|m| m.id == hidden.id));
}

#[tokio::test]
async fn expired_messages_are_swept_into_tombstones() {
    let store = Arc::new(InMemoryChatStore::new());
    let (admin, member) = (user(), user());
    let settings = GroupSettings {
        auto_expire_after_secs: Some(-1),
        ..GroupSettings::default()
    };
    let group = domain::Conversation::new_group(
        domain::ConversationId::new(Uuid::new_v4()),
        admin,
        "ephemeral",
        vec![member],
        settings,
        chrono::Utc::now(),
    )
    .unwrap();
    let group = ConversationRepository::create(store.as_ref(), group)
        .await
        .unwrap();
    let engine = engine(store.clone());

    let message = engine
        .create(admin, group.id, MessageDraft::text("gone soon"))
        .await
        .unwrap();
    assert!(message.expires_at.is_some());

    assert_eq!(engine.sweep_expired().await.unwrap(), 1);
    // 第二轮没有新到期的消息
    assert_eq!(engine.sweep_expired().await.unwrap(), 0);

    let stored = MessageRepository::find_by_id(store.as_ref(), message.id)
        .await
        .unwrap()
        .unwrap();
    assert!(stored.is_deleted);
}
