//! 端到端聊天流程：两名用户从连接到已读回执的完整路径

use std::sync::Arc;

use tokio::sync::mpsc;
use uuid::Uuid;

use application::{
    ConversationService, DeliveryReadTracker, EventGateway, MessageDraft,
    MessageLifecycleDependencies, MessageLifecycleEngine, PresenceBroadcaster,
    RoomMembershipController, RoomMembershipDependencies, ConnectionRegistry, ServerEvent,
    SystemClock,
};
use application::repository::memory::InMemoryChatStore;
use domain::{ConnectionId, MessageStatus, UserId};

struct World {
    registry: Arc<ConnectionRegistry>,
    gateway: EventGateway,
    membership: RoomMembershipController,
    presence: PresenceBroadcaster,
    lifecycle: MessageLifecycleEngine,
    receipts: DeliveryReadTracker,
    conversations: ConversationService,
}

fn world() -> World {
    let store = Arc::new(InMemoryChatStore::new());
    let registry = Arc::new(ConnectionRegistry::new());
    let clock = Arc::new(SystemClock);
    let gateway = EventGateway::new(registry.clone());
    World {
        registry: registry.clone(),
        gateway: gateway.clone(),
        membership: RoomMembershipController::new(RoomMembershipDependencies {
            registry: registry.clone(),
            gateway: gateway.clone(),
            conversations: store.clone(),
            clock: clock.clone(),
            disconnect_fanout_limit: 8,
        }),
        presence: PresenceBroadcaster::new(registry.clone()),
        lifecycle: MessageLifecycleEngine::new(MessageLifecycleDependencies {
            conversations: store.clone(),
            messages: store.clone(),
            clock: clock.clone(),
        }),
        receipts: DeliveryReadTracker::new(store.clone(), store.clone(), clock.clone()),
        conversations: ConversationService::new(store, clock),
    }
}

async fn connect(
    world: &World,
    user_id: UserId,
    name: &str,
) -> (ConnectionId, mpsc::UnboundedReceiver<ServerEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let connection_id = ConnectionId::random();
    world
        .registry
        .register(connection_id, user_id, name.to_string(), tx)
        .await;
    (connection_id, rx)
}

fn drain(rx: &mut mpsc::UnboundedReceiver<ServerEvent>) -> Vec<ServerEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn two_user_conversation_end_to_end() {
    let world = world();
    let alice = UserId::new(Uuid::new_v4());
    let bob = UserId::new(Uuid::new_v4());

    // 开启单聊，重复开启复用同一会话
    let (conversation, created) = world.conversations.open_direct(alice, bob).await.unwrap();
    assert!(created);
    let (again, created_again) = world.conversations.open_direct(bob, alice).await.unwrap();
    assert!(!created_again);
    assert_eq!(again.id, conversation.id);

    // 双方连接并进入房间
    let (alice_conn, mut alice_rx) = connect(&world, alice, "alice").await;
    let (bob_conn, mut bob_rx) = connect(&world, bob, "bob").await;
    world.membership.join(alice_conn, conversation.id).await.unwrap();
    world.membership.join(bob_conn, conversation.id).await.unwrap();
    drain(&mut alice_rx);
    drain(&mut bob_rx);

    // alice 输入中
    world.presence.typing_started(alice_conn, conversation.id).await;
    assert!(drain(&mut bob_rx)
        .iter()
        .any(|e| matches!(e, ServerEvent::UserTyping { user_id, .. } if *user_id == alice)));

    // alice 发送消息并广播
    let message = world
        .lifecycle
        .create(alice, conversation.id, MessageDraft::text("hello bob"))
        .await
        .unwrap();
    let fresh = world.conversations.get(conversation.id).await.unwrap();
    world.gateway.publish_new_message(message.clone(), &fresh).await;

    let bob_events = drain(&mut bob_rx);
    let received = bob_events
        .iter()
        .find_map(|e| match e {
            ServerEvent::NewMessage { message } => Some(message.clone()),
            _ => None,
        })
        .expect("bob should receive the new message");
    assert_eq!(received.id, message.id);
    assert_eq!(received.status, MessageStatus::Sent);
    // 发送者的连接同样收到，用于多端同步
    assert!(drain(&mut alice_rx)
        .iter()
        .any(|e| matches!(e, ServerEvent::NewMessage { .. })));

    // bob 确认送达，alice 收到送达更新
    assert!(world
        .receipts
        .mark_delivered(bob, conversation.id, message.id)
        .await
        .unwrap());
    world
        .gateway
        .publish_to_user(
            alice,
            ServerEvent::MessageDeliveryUpdate {
                message_id: message.id,
                user_id: bob,
            },
        )
        .await;
    assert!(drain(&mut alice_rx)
        .iter()
        .any(|e| matches!(e, ServerEvent::MessageDeliveryUpdate { user_id, .. } if *user_id == bob)));

    // 重复送达是幂等 no-op，不再广播
    assert!(!world
        .receipts
        .mark_delivered(bob, conversation.id, message.id)
        .await
        .unwrap());

    // bob 整会话已读
    let marked = world
        .receipts
        .mark_chat_read(bob, conversation.id)
        .await
        .unwrap();
    assert_eq!(marked, 1);
    assert_eq!(
        world.receipts.unread_count(bob, conversation.id).await.unwrap(),
        0
    );

    // bob 断开，alice 收到离线广播
    world.membership.disconnect(bob_conn).await;
    assert!(drain(&mut alice_rx)
        .iter()
        .any(|e| matches!(e, ServerEvent::UserOffline { user_id, .. } if *user_id == bob)));
}
