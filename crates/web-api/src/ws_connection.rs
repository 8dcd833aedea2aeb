//! WebSocket 连接管理
//!
//! 封装单个 WebSocket 连接的完整生命周期：注册、事件收发、
//! 心跳与超时判定、断开清理。单个事件处理失败只回发一条
//! `error` 事件，绝不终止连接。

use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use application::{ApplicationResult, ClientEvent, RoomKey, ServerEvent};
use domain::{ConnectionId, UserId};

use crate::auth::AuthenticatedUser;
use crate::state::AppState;

/// 运行一条已通过认证的 WebSocket 连接直到其关闭
pub async fn run(socket: WebSocket, state: AppState, user: AuthenticatedUser) {
    let connection_id = ConnectionId::random();
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<ServerEvent>();
    state
        .registry
        .register(
            connection_id,
            user.user_id,
            user.display_name.clone(),
            event_tx,
        )
        .await;
    info!(connection_id = %connection_id, user_id = %user.user_id, "websocket connection established");

    let (mut ws_sender, mut ws_receiver) = socket.split();
    let heartbeat_interval = Duration::from_secs(state.websocket.heartbeat_interval_secs);
    let heartbeat_timeout = Duration::from_secs(state.websocket.heartbeat_timeout_secs);

    // 出站任务：事件序列化发送 + 周期性 ping
    let write_task = tokio::spawn(async move {
        let mut ping = tokio::time::interval(heartbeat_interval);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                maybe_event = event_rx.recv() => {
                    let Some(event) = maybe_event else { break };
                    match serde_json::to_string(&event) {
                        Ok(json) => {
                            if ws_sender.send(WsMessage::Text(json.into())).await.is_err() {
                                break;
                            }
                        }
                        Err(err) => {
                            warn!(error = %err, "failed to serialize server event");
                        }
                    }
                }
                _ = ping.tick() => {
                    if ws_sender.send(WsMessage::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // 入站循环：任何一帧（包括 pong）都重置心跳超时
    loop {
        match tokio::time::timeout(heartbeat_timeout, ws_receiver.next()).await {
            Err(_) => {
                warn!(connection_id = %connection_id, "heartbeat timeout, closing connection");
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(err))) => {
                debug!(connection_id = %connection_id, error = %err, "websocket receive error");
                break;
            }
            Ok(Some(Ok(WsMessage::Text(text)))) => {
                handle_text(&state, connection_id, user.user_id, &text).await;
            }
            Ok(Some(Ok(WsMessage::Close(_)))) => break,
            Ok(Some(Ok(_))) => {}
        }
    }

    state.membership.disconnect(connection_id).await;
    write_task.abort();
    info!(connection_id = %connection_id, user_id = %user.user_id, "websocket connection closed");
}

async fn handle_text(state: &AppState, connection_id: ConnectionId, user_id: UserId, text: &str) {
    let event: ClientEvent = match serde_json::from_str(text) {
        Ok(event) => event,
        Err(err) => {
            send_error(state, connection_id, format!("malformed event: {err}")).await;
            return;
        }
    };

    if let Err(err) = dispatch(state, connection_id, user_id, event).await {
        debug!(connection_id = %connection_id, error = %err, "client event rejected");
        send_error(state, connection_id, err.to_string()).await;
    }
}

async fn dispatch(
    state: &AppState,
    connection_id: ConnectionId,
    user_id: UserId,
    event: ClientEvent,
) -> ApplicationResult<()> {
    match event {
        ClientEvent::JoinChat { conversation_id } => {
            state.membership.join(connection_id, conversation_id).await
        }
        ClientEvent::LeaveChat { conversation_id } => {
            state.membership.leave(connection_id, conversation_id).await
        }
        ClientEvent::TypingStart { conversation_id } => {
            state.presence.typing_started(connection_id, conversation_id).await;
            Ok(())
        }
        ClientEvent::TypingStop { conversation_id } => {
            state.presence.typing_stopped(connection_id, conversation_id).await;
            Ok(())
        }
        ClientEvent::MessageDelivered {
            message_id,
            conversation_id,
        } => {
            // 确认者须是会话成员且消息属于该会话；重复确认是幂等 no-op，不触发广播
            if state
                .receipts
                .mark_delivered(user_id, conversation_id, message_id)
                .await?
            {
                state
                    .gateway
                    .publish_to_room(
                        RoomKey::Conversation(conversation_id),
                        ServerEvent::MessageDeliveryUpdate {
                            message_id,
                            user_id,
                        },
                    )
                    .await;
            }
            Ok(())
        }
        ClientEvent::MessageRead {
            message_id,
            conversation_id,
        } => {
            if state
                .receipts
                .mark_read(user_id, conversation_id, message_id)
                .await?
            {
                state
                    .gateway
                    .publish_to_room(
                        RoomKey::Conversation(conversation_id),
                        ServerEvent::MessageReadUpdate {
                            message_id,
                            user_id,
                        },
                    )
                    .await;
            }
            Ok(())
        }
        ClientEvent::MarkChatRead { conversation_id } => {
            let marked = state.receipts.mark_chat_read(user_id, conversation_id).await?;
            if marked > 0 {
                state
                    .gateway
                    .publish_to_room(
                        RoomKey::Conversation(conversation_id),
                        ServerEvent::ChatReadUpdate {
                            conversation_id,
                            user_id,
                            message_count: marked,
                        },
                    )
                    .await;
            }
            Ok(())
        }
        ClientEvent::UpdatePresence { status } => {
            state.presence.presence_changed(connection_id, status).await;
            Ok(())
        }
    }
}

async fn send_error(state: &AppState, connection_id: ConnectionId, message: String) {
    state
        .registry
        .send_to_connection(connection_id, ServerEvent::Error { message })
        .await;
}
