use std::sync::Arc;

use application::{
    ConnectionRegistry, ConversationService, DeliveryReadTracker, EventGateway,
    MessageLifecycleEngine, PresenceBroadcaster, RoomMembershipController,
};
use config::WebSocketConfig;

use crate::JwtService;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ConnectionRegistry>,
    pub gateway: EventGateway,
    pub membership: Arc<RoomMembershipController>,
    pub presence: Arc<PresenceBroadcaster>,
    pub lifecycle: Arc<MessageLifecycleEngine>,
    pub receipts: Arc<DeliveryReadTracker>,
    pub conversations: Arc<ConversationService>,
    pub jwt_service: Arc<JwtService>,
    pub websocket: WebSocketConfig,
}
