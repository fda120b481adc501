use std::collections::HashMap;

use dashmap::DashMap;

use crate::db::GroupId;

use super::{ConnectionId, Outbox};

/// Room id to subscribed connections. A room with no members has no entry.
#[derive(Default)]
pub(crate) struct Rooms {
    rooms: DashMap<GroupId, HashMap<ConnectionId, Outbox>>,
}

impl Rooms {
    /// Returns `true` if the connection was not already a member.
    pub(crate) fn insert(&self, group_id: GroupId, id: ConnectionId, outbox: Outbox) -> bool {
        self.rooms
            .entry(group_id)
            .or_default()
            .insert(id, outbox)
            .is_none()
    }

    /// Returns `true` if the connection was a member.
    pub(crate) fn remove(&self, group_id: GroupId, id: ConnectionId) -> bool {
        let removed = match self.rooms.get_mut(&group_id) {
            Some(mut members) => members.remove(&id).is_some(),
            None => false,
        };
        if removed {
            self.rooms.remove_if(&group_id, |_, members| members.is_empty());
        }
        removed
    }

    /// Members at this instant, taken under the room's shard lock.
    pub(crate) fn snapshot(&self, group_id: GroupId) -> Vec<(ConnectionId, Outbox)> {
        self.rooms
            .get(&group_id)
            .map(|members| members.iter().map(|(id, tx)| (*id, tx.clone())).collect())
            .unwrap_or_default()
    }

    pub(crate) fn members(&self, group_id: GroupId) -> Vec<ConnectionId> {
        let mut members: Vec<_> = self
            .rooms
            .get(&group_id)
            .map(|members| members.keys().copied().collect())
            .unwrap_or_default();
        members.sort_unstable();
        members
    }

    pub(crate) fn len(&self) -> usize {
        self.rooms.len()
    }
}
