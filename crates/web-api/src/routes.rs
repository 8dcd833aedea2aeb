//! HTTP / WebSocket 路由
//!
//! REST 端点负责会话与消息的管理面；实时面走 `/ws`。
//! 两者共享同一套用例服务，REST 侧完成的变更同样经事件网关广播。

use axum::{
    extract::{Path, Query, State, WebSocketUpgrade},
    http::{HeaderMap, StatusCode},
    response::Response,
    routing::{delete, get, post, put},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use uuid::Uuid;

use application::{ConversationUpdateKind, MessageUpdateKind};
use domain::{
    Conversation, ConversationId, GroupSettings, Message, MessageContent, MessageId,
    NotificationPreferences, UserId,
};

use crate::auth::AuthenticatedUser;
use crate::error::ApiError;
use crate::state::AppState;
use crate::ws_connection;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws", get(websocket_upgrade))
        .nest("/api", api_routes())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/conversations", get(list_conversations))
        .route("/conversations/direct", post(open_direct))
        .route("/conversations/group", post(create_group))
        .route(
            "/conversations/{conversation_id}",
            get(get_conversation).patch(rename_conversation),
        )
        .route("/conversations/{conversation_id}/settings", put(update_settings))
        .route(
            "/conversations/{conversation_id}/notifications",
            put(set_notifications),
        )
        .route("/conversations/{conversation_id}/members", post(add_member))
        .route(
            "/conversations/{conversation_id}/members/{user_id}",
            delete(remove_member),
        )
        .route(
            "/conversations/{conversation_id}/messages",
            post(send_message).get(list_messages),
        )
        .route("/conversations/{conversation_id}/unread", get(unread_count))
        .route(
            "/messages/{message_id}",
            axum::routing::patch(edit_message).delete(delete_message),
        )
        .route(
            "/messages/{message_id}/reactions",
            post(add_reaction).delete(remove_reaction),
        )
}

async fn health() -> &'static str {
    "ok"
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    token: String,
}

/// 连接升级：token 校验失败的连接在任何状态注册之前被拒绝
async fn websocket_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
) -> Result<Response, ApiError> {
    let user = state.jwt_service.verify_token(&query.token)?;
    Ok(ws.on_upgrade(move |socket| ws_connection::run(socket, state, user)))
}

fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<AuthenticatedUser, ApiError> {
    state.jwt_service.extract_user_from_headers(headers)
}

async fn list_conversations(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<Conversation>>, ApiError> {
    let user = authenticate(&state, &headers)?;
    let conversations = state.conversations.list_for_user(user.user_id).await?;
    Ok(Json(conversations))
}

#[derive(Debug, Deserialize)]
struct OpenDirectRequest {
    peer_id: Uuid,
}

async fn open_direct(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<OpenDirectRequest>,
) -> Result<(StatusCode, Json<Conversation>), ApiError> {
    let user = authenticate(&state, &headers)?;
    let (conversation, created) = state
        .conversations
        .open_direct(user.user_id, UserId::from(request.peer_id))
        .await?;
    let status = if created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(conversation)))
}

#[derive(Debug, Deserialize)]
struct CreateGroupRequest {
    title: String,
    member_ids: Vec<Uuid>,
    settings: Option<GroupSettings>,
}

async fn create_group(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<CreateGroupRequest>,
) -> Result<(StatusCode, Json<Conversation>), ApiError> {
    let user = authenticate(&state, &headers)?;
    let conversation = state
        .conversations
        .create_group(
            user.user_id,
            request.title,
            request.member_ids.into_iter().map(UserId::from).collect(),
            request.settings.unwrap_or_default(),
        )
        .await?;
    Ok((StatusCode::CREATED, Json(conversation)))
}

async fn get_conversation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(conversation_id): Path<Uuid>,
) -> Result<Json<Conversation>, ApiError> {
    let user = authenticate(&state, &headers)?;
    let conversation = state
        .conversations
        .get(ConversationId::from(conversation_id))
        .await?;
    if !conversation.is_member(user.user_id) {
        return Err(ApiError::forbidden("not a member of this conversation"));
    }
    Ok(Json(conversation))
}

#[derive(Debug, Deserialize)]
struct RenameRequest {
    title: String,
}

async fn rename_conversation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(conversation_id): Path<Uuid>,
    Json(request): Json<RenameRequest>,
) -> Result<Json<Conversation>, ApiError> {
    let user = authenticate(&state, &headers)?;
    let conversation_id = ConversationId::from(conversation_id);
    let conversation = state
        .conversations
        .rename(user.user_id, conversation_id, request.title.clone())
        .await?;
    state
        .gateway
        .publish_conversation_update(
            conversation_id,
            ConversationUpdateKind::InfoUpdated,
            json!({ "title": request.title }),
        )
        .await;
    Ok(Json(conversation))
}

async fn update_settings(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(conversation_id): Path<Uuid>,
    Json(settings): Json<GroupSettings>,
) -> Result<Json<Conversation>, ApiError> {
    let user = authenticate(&state, &headers)?;
    let conversation_id = ConversationId::from(conversation_id);
    let conversation = state
        .conversations
        .update_settings(user.user_id, conversation_id, settings.clone())
        .await?;
    state
        .gateway
        .publish_conversation_update(
            conversation_id,
            ConversationUpdateKind::SettingsChanged,
            serde_json::to_value(&settings).unwrap_or_default(),
        )
        .await;
    Ok(Json(conversation))
}

async fn set_notifications(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(conversation_id): Path<Uuid>,
    Json(prefs): Json<NotificationPreferences>,
) -> Result<Json<Conversation>, ApiError> {
    let user = authenticate(&state, &headers)?;
    let conversation = state
        .conversations
        .set_notifications(user.user_id, ConversationId::from(conversation_id), prefs)
        .await?;
    Ok(Json(conversation))
}

#[derive(Debug, Deserialize)]
struct AddMemberRequest {
    user_id: Uuid,
}

async fn add_member(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(conversation_id): Path<Uuid>,
    Json(request): Json<AddMemberRequest>,
) -> Result<Json<Conversation>, ApiError> {
    let user = authenticate(&state, &headers)?;
    let conversation_id = ConversationId::from(conversation_id);
    let added = UserId::from(request.user_id);
    let conversation = state
        .conversations
        .add_member(user.user_id, conversation_id, added)
        .await?;
    state
        .gateway
        .publish_conversation_update(
            conversation_id,
            ConversationUpdateKind::MemberAdded,
            json!({ "user_id": added }),
        )
        .await;
    Ok(Json(conversation))
}

async fn remove_member(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((conversation_id, user_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<Conversation>, ApiError> {
    let user = authenticate(&state, &headers)?;
    let conversation_id = ConversationId::from(conversation_id);
    let removed = UserId::from(user_id);
    let conversation = state
        .conversations
        .remove_member(user.user_id, conversation_id, removed)
        .await?;
    state
        .gateway
        .publish_conversation_update(
            conversation_id,
            ConversationUpdateKind::MemberRemoved,
            json!({ "user_id": removed }),
        )
        .await;
    Ok(Json(conversation))
}

#[derive(Debug, Deserialize)]
struct SendMessageRequest {
    content: MessageContent,
    reply_to: Option<Uuid>,
    forward_of: Option<Uuid>,
}

async fn send_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(conversation_id): Path<Uuid>,
    Json(request): Json<SendMessageRequest>,
) -> Result<(StatusCode, Json<Message>), ApiError> {
    let user = authenticate(&state, &headers)?;
    let conversation_id = ConversationId::from(conversation_id);
    let message = state
        .lifecycle
        .create(
            user.user_id,
            conversation_id,
            application::MessageDraft {
                content: request.content,
                reply_to: request.reply_to.map(MessageId::from),
                forward_of: request.forward_of.map(MessageId::from),
            },
        )
        .await?;
    let conversation = state.conversations.get(conversation_id).await?;
    state
        .gateway
        .publish_new_message(message.clone(), &conversation)
        .await;
    Ok((StatusCode::CREATED, Json(message)))
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    limit: Option<u32>,
    before: Option<Uuid>,
}

async fn list_messages(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(conversation_id): Path<Uuid>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<Message>>, ApiError> {
    let user = authenticate(&state, &headers)?;
    let messages = state
        .lifecycle
        .history(
            user.user_id,
            ConversationId::from(conversation_id),
            query.limit.unwrap_or(50),
            query.before.map(MessageId::from),
        )
        .await?;
    Ok(Json(messages))
}

async fn unread_count(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(conversation_id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user = authenticate(&state, &headers)?;
    let conversation_id = ConversationId::from(conversation_id);
    let conversation = state.conversations.get(conversation_id).await?;
    if !conversation.is_member(user.user_id) {
        return Err(ApiError::forbidden("not a member of this conversation"));
    }
    let count = state.receipts.unread_count(user.user_id, conversation_id).await?;
    Ok(Json(json!({ "unread": count })))
}

#[derive(Debug, Deserialize)]
struct EditMessageRequest {
    text: String,
}

async fn edit_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(message_id): Path<Uuid>,
    Json(request): Json<EditMessageRequest>,
) -> Result<Json<Message>, ApiError> {
    let user = authenticate(&state, &headers)?;
    let message = state
        .lifecycle
        .edit(user.user_id, MessageId::from(message_id), request.text)
        .await?;
    state
        .gateway
        .publish_message_update(
            message.conversation_id,
            message.id,
            MessageUpdateKind::Edited,
            serde_json::to_value(&message).unwrap_or_default(),
        )
        .await;
    Ok(Json(message))
}

#[derive(Debug, Deserialize)]
struct DeleteMessageQuery {
    #[serde(default)]
    for_everyone: bool,
}

async fn delete_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(message_id): Path<Uuid>,
    Query(query): Query<DeleteMessageQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user = authenticate(&state, &headers)?;
    let message_id = MessageId::from(message_id);

    if query.for_everyone {
        let message = state
            .lifecycle
            .delete_for_everyone(user.user_id, message_id)
            .await?;
        state
            .gateway
            .publish_message_update(
                message.conversation_id,
                message.id,
                MessageUpdateKind::Deleted,
                serde_json::to_value(&message).unwrap_or_default(),
            )
            .await;
        Ok(Json(json!({ "deleted": true })))
    } else {
        // 仅对自己隐藏，不广播
        let hidden = state.lifecycle.delete_for_user(user.user_id, message_id).await?;
        Ok(Json(json!({ "hidden": hidden })))
    }
}

#[derive(Debug, Deserialize)]
struct ReactionRequest {
    emoji: String,
}

async fn add_reaction(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(message_id): Path<Uuid>,
    Json(request): Json<ReactionRequest>,
) -> Result<Json<Message>, ApiError> {
    let user = authenticate(&state, &headers)?;
    let outcome = state
        .lifecycle
        .add_reaction(user.user_id, MessageId::from(message_id), request.emoji)
        .await?;
    state
        .gateway
        .publish_message_update(
            outcome.message.conversation_id,
            outcome.message.id,
            MessageUpdateKind::ReactionAdded,
            serde_json::to_value(&outcome.grouped).unwrap_or_default(),
        )
        .await;
    Ok(Json(outcome.message))
}

async fn remove_reaction(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(message_id): Path<Uuid>,
) -> Result<Json<Message>, ApiError> {
    let user = authenticate(&state, &headers)?;
    let outcome = state
        .lifecycle
        .remove_reaction(user.user_id, MessageId::from(message_id))
        .await?;
    if outcome.changed {
        state
            .gateway
            .publish_message_update(
                outcome.message.conversation_id,
                outcome.message.id,
                MessageUpdateKind::ReactionRemoved,
                serde_json::to_value(&outcome.grouped).unwrap_or_default(),
            )
            .await;
    }
    Ok(Json(outcome.message))
}
