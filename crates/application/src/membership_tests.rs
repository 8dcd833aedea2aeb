//! 房间成员控制与在线广播的用例测试

use std::sync::Arc;

use tokio::sync::mpsc;
use uuid::Uuid;

use domain::{ConnectionId, UserId};

use crate::clock::SystemClock;
use crate::error::ApplicationError;
use crate::events::ServerEvent;
use crate::gateway::EventGateway;
use crate::membership::{
    RoomMembershipController, RoomMembershipDependencies, DEFAULT_DISCONNECT_FANOUT_LIMIT,
};
use crate::presence::PresenceBroadcaster;
use crate::registry::ConnectionRegistry;
use crate::repository::memory::InMemoryChatStore;
use crate::repository::ConversationRepository;

fn user() -> UserId {
    UserId::new(Uuid::new_v4())
}

struct Fixture {
    store: Arc<InMemoryChatStore>,
    registry: Arc<ConnectionRegistry>,
    controller: RoomMembershipController,
    presence: PresenceBroadcaster,
}

fn fixture() -> Fixture {
    let store = Arc::new(InMemoryChatStore::new());
    let registry = Arc::new(ConnectionRegistry::new());
    let gateway = EventGateway::new(registry.clone());
    let controller = RoomMembershipController::new(RoomMembershipDependencies {
        registry: registry.clone(),
        gateway,
        conversations: store.clone(),
        clock: Arc::new(SystemClock),
        disconnect_fanout_limit: DEFAULT_DISCONNECT_FANOUT_LIMIT,
    });
    let presence = PresenceBroadcaster::new(registry.clone());
    Fixture {
        store,
        registry,
        controller,
        presence,
    }
}

async fn direct(f: &Fixture, a: UserId, b: UserId) -> domain::Conversation {
    let conversation = domain::Conversation::new_direct(
        domain::ConversationId::new(Uuid::new_v4()),
        a,
        b,
        chrono::Utc::now(),
    )
    .unwrap();
    ConversationRepository::create(f.store.as_ref(), conversation)
        .await
        .unwrap()
}

async fn connect(
    f: &Fixture,
    user_id: UserId,
    name: &str,
) -> (ConnectionId, mpsc::UnboundedReceiver<ServerEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let connection_id = ConnectionId::random();
    f.registry
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
async fn join_requires_membership_and_leaves_room_state_unchanged() {
    let f = fixture();
    let conversation = direct(&f, user(), user()).await;

    let outsider = user();
    let (connection, _rx) = connect(&f, outsider, "eve").await;

    let error = f
        .controller
        .join(connection, conversation.id)
        .await
        .unwrap_err();
    assert!(matches!(error, ApplicationError::Authorization(_)));
    assert!(
        !f.registry
            .is_subscribed(
                connection,
                crate::registry::RoomKey::Conversation(conversation.id)
            )
            .await
    );
}

#[tokio::test]
async fn join_confirms_caller_and_announces_to_others() {
    let f = fixture();
    let (alice, bob) = (user(), user());
    let conversation = direct(&f, alice, bob).await;

    let (bob_conn, mut bob_rx) = connect(&f, bob, "bob").await;
    f.controller.join(bob_conn, conversation.id).await.unwrap();
    drain(&mut bob_rx);

    let (alice_conn, mut alice_rx) = connect(&f, alice, "alice").await;
    f.controller.join(alice_conn, conversation.id).await.unwrap();

    let alice_events = drain(&mut alice_rx);
    assert!(alice_events
        .iter()
        .any(|e| matches!(e, ServerEvent::JoinedChat { conversation_id } if *conversation_id == conversation.id)));
    // 自己的上线不会回显给自己
    assert!(!alice_events
        .iter()
        .any(|e| matches!(e, ServerEvent::UserOnline { .. })));

    let bob_events = drain(&mut bob_rx);
    assert!(bob_events
        .iter()
        .any(|e| matches!(e, ServerEvent::UserOnline { user_id, .. } if *user_id == alice)));
}

#[tokio::test]
async fn second_connection_of_same_user_does_not_reannounce() {
    let f = fixture();
    let (alice, bob) = (user(), user());
    let conversation = direct(&f, alice, bob).await;

    let (bob_conn, mut bob_rx) = connect(&f, bob, "bob").await;
    f.controller.join(bob_conn, conversation.id).await.unwrap();

    let (a1, _rx1) = connect(&f, alice, "alice").await;
    f.controller.join(a1, conversation.id).await.unwrap();
    drain(&mut bob_rx);

    let (a2, _rx2) = connect(&f, alice, "alice").await;
    f.controller.join(a2, conversation.id).await.unwrap();

    let bob_events = drain(&mut bob_rx);
    assert!(!bob_events
        .iter()
        .any(|e| matches!(e, ServerEvent::UserOnline { .. })));
}

#[tokio::test]
async fn re_joining_same_room_does_not_reannounce() {
    let f = fixture();
    let (alice, bob) = (user(), user());
    let conversation = direct(&f, alice, bob).await;

    let (bob_conn, mut bob_rx) = connect(&f, bob, "bob").await;
    f.controller.join(bob_conn, conversation.id).await.unwrap();

    let (alice_conn, mut alice_rx) = connect(&f, alice, "alice").await;
    f.controller.join(alice_conn, conversation.id).await.unwrap();
    drain(&mut bob_rx);

    // 同一条连接重复 join 只回发确认，不再向房间广播上线
    f.controller.join(alice_conn, conversation.id).await.unwrap();

    assert!(!drain(&mut bob_rx)
        .iter()
        .any(|e| matches!(e, ServerEvent::UserOnline { .. })));
    assert!(drain(&mut alice_rx)
        .iter()
        .any(|e| matches!(e, ServerEvent::JoinedChat { .. })));
}

#[tokio::test]
async fn disconnect_broadcasts_offline_only_for_last_connection() {
    let f = fixture();
    let (alice, bob) = (user(), user());
    let conversation = direct(&f, alice, bob).await;

    let (bob_conn, mut bob_rx) = connect(&f, bob, "bob").await;
    f.controller.join(bob_conn, conversation.id).await.unwrap();

    let (a1, _rx1) = connect(&f, alice, "alice").await;
    f.controller.join(a1, conversation.id).await.unwrap();
    let (a2, _rx2) = connect(&f, alice, "alice").await;
    f.controller.join(a2, conversation.id).await.unwrap();
    drain(&mut bob_rx);

    f.controller.disconnect(a1).await;
    assert!(drain(&mut bob_rx)
        .iter()
        .all(|e| !matches!(e, ServerEvent::UserOffline { .. })));

    f.controller.disconnect(a2).await;
    let events = drain(&mut bob_rx);
    assert!(events
        .iter()
        .any(|e| matches!(e, ServerEvent::UserOffline { user_id, .. } if *user_id == alice)));

    // last_seen 已尽力落盘
    let reloaded = ConversationRepository::find_by_id(f.store.as_ref(), conversation.id)
        .await
        .unwrap()
        .unwrap();
    assert!(reloaded.member(alice).unwrap().last_seen_at.is_some());
}

#[tokio::test]
async fn typing_signals_reach_only_other_room_members() {
    let f = fixture();
    let (alice, bob) = (user(), user());
    let conversation = direct(&f, alice, bob).await;

    let (alice_conn, mut alice_rx) = connect(&f, alice, "alice").await;
    f.controller.join(alice_conn, conversation.id).await.unwrap();
    let (bob_conn, mut bob_rx) = connect(&f, bob, "bob").await;
    f.controller.join(bob_conn, conversation.id).await.unwrap();
    drain(&mut alice_rx);
    drain(&mut bob_rx);

    f.presence.typing_started(alice_conn, conversation.id).await;
    f.presence.typing_stopped(alice_conn, conversation.id).await;

    let bob_events = drain(&mut bob_rx);
    assert!(bob_events
        .iter()
        .any(|e| matches!(e, ServerEvent::UserTyping { user_id, .. } if *user_id == alice)));
    assert!(bob_events
        .iter()
        .any(|e| matches!(e, ServerEvent::UserStoppedTyping { user_id, .. } if *user_id == alice)));
    assert!(drain(&mut alice_rx).is_empty());
}

#[tokio::test]
async fn typing_from_unjoined_connection_is_dropped() {
    let f = fixture();
    let (alice, bob) = (user(), user());
    let conversation = direct(&f, alice, bob).await;

    let (bob_conn, mut bob_rx) = connect(&f, bob, "bob").await;
    f.controller.join(bob_conn, conversation.id).await.unwrap();
    drain(&mut bob_rx);

    // alice 已连接但未 join 房间
    let (alice_conn, _rx) = connect(&f, alice, "alice").await;
    f.presence.typing_started(alice_conn, conversation.id).await;

    assert!(drain(&mut bob_rx).is_empty());
}

#[tokio::test]
async fn presence_status_fans_out_to_subscribed_rooms() {
    let f = fixture();
    let (alice, bob) = (user(), user());
    let conversation = direct(&f, alice, bob).await;

    let (alice_conn, _alice_rx) = connect(&f, alice, "alice").await;
    f.controller.join(alice_conn, conversation.id).await.unwrap();
    let (bob_conn, mut bob_rx) = connect(&f, bob, "bob").await;
    f.controller.join(bob_conn, conversation.id).await.unwrap();
    drain(&mut bob_rx);

    f.presence
        .presence_changed(alice_conn, "away".to_string())
        .await;

    let events = drain(&mut bob_rx);
    assert!(events.iter().any(|e| matches!(
        e,
        ServerEvent::PresenceUpdate { user_id, status } if *user_id == alice && status == "away"
    )));
}
