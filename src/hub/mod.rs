//! Live connections and the rooms they are subscribed to.
//!
//! The [`Hub`] owns two tables: the connection registry (connection to joined
//! rooms) and the room membership table (room to connections). Both are
//! sharded maps. Whenever both are touched, the connection entry is locked
//! first and the room entry second, which keeps the two sides consistent
//! without a table-wide lock.
//!
//! Delivery never blocks: every connection has a bounded outbound queue and a
//! connection whose queue is full (or whose writer is gone) is disconnected.

mod membership;
mod registry;

use std::{fmt, sync::Arc};

use dashmap::mapref::entry::Entry;
use tokio::sync::mpsc::{self, error::TrySendError};
use uuid::Uuid;

use crate::{
    db::{GroupId, Identity, UserId},
    error::ChatError,
    protocol::ServerEvent,
};

use membership::Rooms;
use registry::{Connection, Registry};

pub type Outbox = mpsc::Sender<Arc<ServerEvent>>;
pub type Inbox = mpsc::Receiver<Arc<ServerEvent>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

#[derive(Clone)]
pub struct Hub {
    inner: Arc<Inner>,
}

struct Inner {
    registry: Registry,
    rooms: Rooms,
    outbox_capacity: usize,
}

impl Hub {
    pub fn new(outbox_capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry: Registry::default(),
                rooms: Rooms::default(),
                outbox_capacity: outbox_capacity.max(1),
            }),
        }
    }

    /// Admit a connection with no rooms. The returned inbox yields everything
    /// delivered to it and closes once the connection is disconnected.
    pub fn connect(&self, identity: Option<Identity>) -> (ConnectionId, Inbox) {
        let id = ConnectionId::new();
        let (outbox, inbox) = mpsc::channel(self.inner.outbox_capacity);
        tracing::debug!(connection = %id, user = ?identity.as_ref().map(|i| i.user_id), "connection admitted");
        self.inner.registry.admit(id, identity, outbox);
        (id, inbox)
    }

    pub fn identity(&self, id: ConnectionId) -> Option<Identity> {
        self.inner.registry.identity(id)
    }

    /// Whether `user_id` holds at least one live, identified connection.
    pub fn is_online(&self, user_id: UserId) -> bool {
        self.inner.registry.is_online(user_id)
    }

    /// Subscribe `id` to `group_id`. Joining twice is a no-op; returns whether
    /// anything changed. Every broadcast that starts after this returns
    /// reaches the connection.
    pub fn join(&self, group_id: GroupId, id: ConnectionId) -> Result<bool, ChatError> {
        let Some(mut connection) = self.inner.registry.connections.get_mut(&id) else {
            return Err(ChatError::Transport);
        };
        let added = connection.rooms.insert(group_id);
        self.inner.rooms.insert(group_id, id, connection.outbox.clone());
        drop(connection);

        if added {
            tracing::debug!(connection = %id, group = group_id, "joined room");
        }
        Ok(added)
    }

    /// Unsubscribe `id` from `group_id`. Leaving a room not joined is a no-op.
    pub fn leave(&self, group_id: GroupId, id: ConnectionId) -> bool {
        let Some(mut connection) = self.inner.registry.connections.get_mut(&id) else {
            return false;
        };
        let removed = connection.rooms.remove(&group_id);
        self.inner.rooms.remove(group_id, id);
        drop(connection);

        if removed {
            tracing::debug!(connection = %id, group = group_id, "left room");
        }
        removed
    }

    /// Remove the connection from every room it joined and forget it.
    /// Returns `false` if it was already gone.
    pub fn disconnect(&self, id: ConnectionId) -> bool {
        let Entry::Occupied(entry) = self.inner.registry.connections.entry(id) else {
            return false;
        };
        for group_id in &entry.get().rooms {
            self.inner.rooms.remove(*group_id, id);
        }
        let Connection { identity, rooms, .. } = entry.remove();
        if let Some(identity) = identity {
            self.inner.registry.went_offline(identity.user_id);
        }
        tracing::debug!(connection = %id, rooms = rooms.len(), "connection removed");
        true
    }

    /// Queue `event` for every current member of `group_id` and return how
    /// many accepted it. Members that cannot accept it are disconnected
    /// without affecting the others.
    pub fn broadcast(&self, group_id: GroupId, event: ServerEvent) -> usize {
        let event = Arc::new(event);
        let mut delivered = 0;
        let mut dead = Vec::new();

        for (id, outbox) in self.inner.rooms.snapshot(group_id) {
            match outbox.try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    tracing::warn!(connection = %id, group = group_id, "outbound queue full, disconnecting");
                    dead.push(id);
                }
                Err(TrySendError::Closed(_)) => dead.push(id),
            }
        }

        for id in dead {
            self.disconnect(id);
        }
        delivered
    }

    /// Queue `event` for a single connection.
    pub fn send_to(&self, id: ConnectionId, event: ServerEvent) -> bool {
        let Some(outbox) = self.inner.registry.outbox(id) else {
            return false;
        };
        match outbox.try_send(Arc::new(event)) {
            Ok(()) => true,
            Err(err) => {
                if matches!(err, TrySendError::Full(_)) {
                    tracing::warn!(connection = %id, "outbound queue full, disconnecting");
                }
                self.disconnect(id);
                false
            }
        }
    }

    pub fn members(&self, group_id: GroupId) -> Vec<ConnectionId> {
        self.inner.rooms.members(group_id)
    }

    pub fn rooms_of(&self, id: ConnectionId) -> Vec<GroupId> {
        self.inner.registry.rooms(id)
    }

    pub fn connection_count(&self) -> usize {
        self.inner.registry.len()
    }

    pub fn room_count(&self) -> usize {
        self.inner.rooms.len()
    }
}
