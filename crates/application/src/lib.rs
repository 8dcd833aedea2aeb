//! 应用层实现。
//!
//! 这里提供围绕领域模型的用例服务：连接注册表、房间成员控制、
//! 在线/输入状态广播、消息生命周期引擎、送达/已读追踪，以及
//! 对外部适配器（持久化、事件推送）的抽象。

pub mod clock;
pub mod conversations;
pub mod error;
pub mod events;
pub mod gateway;
pub mod lifecycle;
pub mod membership;
pub mod presence;
pub mod receipts;
pub mod registry;
pub mod repository;

pub use clock::{Clock, SystemClock};
pub use conversations::ConversationService;
pub use error::{ApplicationError, ApplicationResult};
pub use events::{ClientEvent, ConversationUpdateKind, MessageUpdateKind, ServerEvent};
pub use gateway::EventGateway;
pub use lifecycle::{MessageDraft, MessageLifecycleEngine, MessageLifecycleDependencies, ReactionOutcome};
pub use membership::{RoomMembershipController, RoomMembershipDependencies};
pub use presence::PresenceBroadcaster;
pub use receipts::DeliveryReadTracker;
pub use registry::{ConnectionIdentity, ConnectionRegistry, DisconnectSummary, RoomKey};
pub use repository::{ConversationRepository, MessageRepository};

#[cfg(test)]
mod lifecycle_tests;
#[cfg(test)]
mod membership_tests;
