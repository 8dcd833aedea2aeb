//! 连接注册表
//!
//! 进程内的实时连接状态：连接、用户、房间三张映射。
//! 同一用户可持有多条连接（多端登录），注册时自动订阅个人房间，
//! 所有面向该用户的事件通过个人房间送达其全部连接。

use std::collections::{HashMap, HashSet};

use tokio::sync::{mpsc, RwLock};
use tracing::debug;

use domain::{ConnectionId, ConversationId, UserId};

use crate::error::{ApplicationError, ApplicationResult};
use crate::events::ServerEvent;

/// 事件路由的目标房间：会话房间或个人房间
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoomKey {
    Conversation(ConversationId),
    User(UserId),
}

/// 连接上认证出的身份
#[derive(Debug, Clone)]
pub struct ConnectionIdentity {
    pub user_id: UserId,
    pub display_name: String,
}

/// 注销连接后的离线情况汇总
#[derive(Debug)]
pub struct DisconnectSummary {
    pub user_id: UserId,
    pub display_name: String,
    /// 该用户是否已无任何存活连接
    pub was_last_connection: bool,
    /// 注销前连接订阅的会话房间
    pub conversation_rooms: Vec<ConversationId>,
}

struct ConnectionEntry {
    user_id: UserId,
    display_name: String,
    sender: mpsc::UnboundedSender<ServerEvent>,
    rooms: HashSet<RoomKey>,
}

#[derive(Default)]
struct RegistryInner {
    connections: HashMap<ConnectionId, ConnectionEntry>,
    users: HashMap<UserId, HashSet<ConnectionId>>,
    rooms: HashMap<RoomKey, HashSet<ConnectionId>>,
}

/// 连接注册表，持久化正确性从不依赖这里的内存状态
#[derive(Default)]
pub struct ConnectionRegistry {
    inner: RwLock<RegistryInner>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册连接并自动订阅个人房间
    pub async fn register(
        &self,
        connection_id: ConnectionId,
        user_id: UserId,
        display_name: String,
        sender: mpsc::UnboundedSender<ServerEvent>,
    ) {
        let mut inner = self.inner.write().await;
        let personal = RoomKey::User(user_id);
        let mut rooms = HashSet::new();
        rooms.insert(personal);

        inner.connections.insert(
            connection_id,
            ConnectionEntry {
                user_id,
                display_name,
                sender,
                rooms,
            },
        );
        inner.users.entry(user_id).or_default().insert(connection_id);
        inner.rooms.entry(personal).or_default().insert(connection_id);

        debug!(connection_id = %connection_id, user_id = %user_id, "connection registered");
    }

    /// 注销连接，移除其全部房间订阅，返回离线汇总
    pub async fn unregister(&self, connection_id: ConnectionId) -> Option<DisconnectSummary> {
        let mut inner = self.inner.write().await;
        let entry = inner.connections.remove(&connection_id)?;

        for room in &entry.rooms {
            if let Some(members) = inner.rooms.get_mut(room) {
                members.remove(&connection_id);
                if members.is_empty() {
                    inner.rooms.remove(room);
                }
            }
        }

        let was_last_connection = match inner.users.get_mut(&entry.user_id) {
            Some(connections) => {
                connections.remove(&connection_id);
                if connections.is_empty() {
                    inner.users.remove(&entry.user_id);
                    true
                } else {
                    false
                }
            }
            None => true,
        };

        let conversation_rooms = entry
            .rooms
            .iter()
            .filter_map(|room| match room {
                RoomKey::Conversation(id) => Some(*id),
                RoomKey::User(_) => None,
            })
            .collect();

        debug!(
            connection_id = %connection_id,
            user_id = %entry.user_id,
            last = was_last_connection,
            "connection unregistered"
        );

        Some(DisconnectSummary {
            user_id: entry.user_id,
            display_name: entry.display_name,
            was_last_connection,
            conversation_rooms,
        })
    }

    /// 把连接订阅进房间，返回该用户是否因此首次进入该房间
    pub async fn subscribe(
        &self,
        connection_id: ConnectionId,
        room: RoomKey,
    ) -> ApplicationResult<bool> {
        let mut guard = self.inner.write().await;
        let inner = &mut *guard;
        let (user_id, inserted) = {
            let entry = inner
                .connections
                .get_mut(&connection_id)
                .ok_or_else(|| ApplicationError::not_found("connection is not registered"))?;
            let inserted = entry.rooms.insert(room);
            (entry.user_id, inserted)
        };

        let members = inner.rooms.entry(room).or_default();
        members.insert(connection_id);

        // 本连接重复订阅是幂等 no-op
        if !inserted {
            return Ok(false);
        }

        // 同一用户的其他连接是否已在房间内
        let connections = &inner.connections;
        let newly = !members.iter().any(|id| {
            *id != connection_id
                && connections
                    .get(id)
                    .is_some_and(|entry| entry.user_id == user_id)
        });
        Ok(newly)
    }

    /// 取消连接对房间的订阅，返回该用户是否因此整体离开了该房间
    pub async fn unsubscribe(
        &self,
        connection_id: ConnectionId,
        room: RoomKey,
    ) -> ApplicationResult<bool> {
        let mut guard = self.inner.write().await;
        let inner = &mut *guard;
        let user_id = {
            let entry = inner
                .connections
                .get_mut(&connection_id)
                .ok_or_else(|| ApplicationError::not_found("connection is not registered"))?;
            entry.rooms.remove(&room);
            entry.user_id
        };

        let mut user_still_present = false;
        if let Some(members) = inner.rooms.get_mut(&room) {
            members.remove(&connection_id);
            let connections = &inner.connections;
            user_still_present = members.iter().any(|id| {
                connections
                    .get(id)
                    .is_some_and(|entry| entry.user_id == user_id)
            });
            if members.is_empty() {
                inner.rooms.remove(&room);
            }
        }
        Ok(!user_still_present)
    }

    pub async fn identity_of(&self, connection_id: ConnectionId) -> Option<ConnectionIdentity> {
        let inner = self.inner.read().await;
        inner
            .connections
            .get(&connection_id)
            .map(|entry| ConnectionIdentity {
                user_id: entry.user_id,
                display_name: entry.display_name.clone(),
            })
    }

    pub async fn is_subscribed(&self, connection_id: ConnectionId, room: RoomKey) -> bool {
        let inner = self.inner.read().await;
        inner
            .connections
            .get(&connection_id)
            .is_some_and(|entry| entry.rooms.contains(&room))
    }

    /// 连接当前订阅的全部房间
    pub async fn rooms_of(&self, connection_id: ConnectionId) -> Vec<RoomKey> {
        let inner = self.inner.read().await;
        inner
            .connections
            .get(&connection_id)
            .map(|entry| entry.rooms.iter().copied().collect())
            .unwrap_or_default()
    }

    pub async fn is_user_online(&self, user_id: UserId) -> bool {
        let inner = self.inner.read().await;
        inner.users.contains_key(&user_id)
    }

    /// 某用户的全部存活连接（多端）
    pub async fn connections_for(&self, user_id: UserId) -> Vec<ConnectionId> {
        let inner = self.inner.read().await;
        inner
            .users
            .get(&user_id)
            .map(|connections| connections.iter().copied().collect())
            .unwrap_or_default()
    }

    /// 某用户是否有任一连接订阅了指定房间
    pub async fn is_user_in_room(&self, user_id: UserId, room: RoomKey) -> bool {
        let inner = self.inner.read().await;
        let Some(members) = inner.rooms.get(&room) else {
            return false;
        };
        members.iter().any(|id| {
            inner
                .connections
                .get(id)
                .is_some_and(|entry| entry.user_id == user_id)
        })
    }

    /// 向单个连接投递事件，连接已断开时静默丢弃
    pub async fn send_to_connection(&self, connection_id: ConnectionId, event: ServerEvent) {
        let inner = self.inner.read().await;
        if let Some(entry) = inner.connections.get(&connection_id) {
            let _ = entry.sender.send(event);
        }
    }

    /// 向房间内全部连接投递事件，空房间为静默 no-op
    pub async fn send_to_room(&self, room: RoomKey, event: ServerEvent) {
        self.send_to_room_except(room, None, event).await;
    }

    /// 向房间内除指定连接外的全部连接投递事件
    pub async fn send_to_room_except(
        &self,
        room: RoomKey,
        except: Option<ConnectionId>,
        event: ServerEvent,
    ) {
        let inner = self.inner.read().await;
        let Some(members) = inner.rooms.get(&room) else {
            return;
        };
        for connection_id in members {
            if Some(*connection_id) == except {
                continue;
            }
            if let Some(entry) = inner.connections.get(connection_id) {
                let _ = entry.sender.send(event.clone());
            }
        }
    }
}
