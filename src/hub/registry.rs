use std::collections::HashSet;

use dashmap::DashMap;

use crate::db::{GroupId, Identity, UserId};

use super::{ConnectionId, Outbox};

/// One live client connection.
pub(crate) struct Connection {
    pub(crate) identity: Option<Identity>,
    pub(crate) rooms: HashSet<GroupId>,
    pub(crate) outbox: Outbox,
}

/// Every admitted connection, keyed by id. Entries are only created by
/// `Hub::connect` and only removed by `Hub::disconnect`.
#[derive(Default)]
pub(crate) struct Registry {
    pub(crate) connections: DashMap<ConnectionId, Connection>,
    /// Live connection count per identified user.
    pub(crate) online: DashMap<UserId, usize>,
}

impl Registry {
    pub(crate) fn admit(&self, id: ConnectionId, identity: Option<Identity>, outbox: Outbox) {
        if let Some(identity) = &identity {
            *self.online.entry(identity.user_id).or_default() += 1;
        }
        self.connections.insert(
            id,
            Connection {
                identity,
                rooms: HashSet::new(),
                outbox,
            },
        );
    }

    pub(crate) fn identity(&self, id: ConnectionId) -> Option<Identity> {
        self.connections.get(&id)?.identity.clone()
    }

    pub(crate) fn outbox(&self, id: ConnectionId) -> Option<Outbox> {
        self.connections.get(&id).map(|c| c.outbox.clone())
    }

    pub(crate) fn rooms(&self, id: ConnectionId) -> Vec<GroupId> {
        let mut rooms: Vec<_> = self
            .connections
            .get(&id)
            .map(|c| c.rooms.iter().copied().collect())
            .unwrap_or_default();
        rooms.sort_unstable();
        rooms
    }

    /// Called once for every removed connection that had an identity.
    pub(crate) fn went_offline(&self, user_id: UserId) {
        self.online.remove_if_mut(&user_id, |_, count| {
            *count = count.saturating_sub(1);
            *count == 0
        });
    }

    pub(crate) fn is_online(&self, user_id: UserId) -> bool {
        self.online.contains_key(&user_id)
    }

    pub(crate) fn len(&self) -> usize {
        self.connections.len()
    }
}
