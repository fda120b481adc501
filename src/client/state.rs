use std::collections::HashMap;

use crate::{
    db::{GroupId, GroupMessage},
    protocol::{Action, ClientEvent, ServerEvent},
};

use super::view::{ChatView, ViewSnapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ViewId(u64);

/// Join bookkeeping for one room. The connection is joined once no matter
/// how many views show the room. Server acknowledgements arrive in the
/// order joins were sent, so counting them tells which join an ack is for.
#[derive(Debug, Default)]
struct Room {
    open: usize,
    sent_joins: u64,
    acked_joins: u64,
    last_join: Option<Result<(), String>>,
}

/// A view that needs the messages stored after `after` before it can go
/// `Active`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CatchUpRequest {
    pub view: ViewId,
    pub group_id: GroupId,
    pub after: Option<i64>,
}

#[derive(Debug)]
struct Entry {
    join: u64,
    view: ChatView,
}

/// Every open view of one client connection.
#[derive(Debug, Default)]
pub struct Views {
    next_id: u64,
    views: HashMap<ViewId, Entry>,
    rooms: HashMap<GroupId, Room>,
}

impl Views {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a view in `Joining`. Returns the join to emit, if the room
    /// is not already joined or being joined.
    pub fn open(&mut self, group_id: GroupId) -> (ViewId, Option<ClientEvent>) {
        self.next_id += 1;
        let id = ViewId(self.next_id);
        let mut view = ChatView::new(group_id);

        let room = self.rooms.entry(group_id).or_default();
        room.open += 1;

        let settled = room.acked_joins == room.sent_joins;
        let rejoin = room.open == 1 || (settled && matches!(room.last_join, Some(Err(_))));
        let emit = if rejoin {
            room.sent_joins += 1;
            Some(ClientEvent::JoinGroup { group_id })
        } else {
            if settled {
                match &room.last_join {
                    Some(Ok(())) => view.on_joined(),
                    Some(Err(reason)) => view.on_join_failed(reason.clone()),
                    None => {}
                }
            }
            None
        };

        self.views.insert(id, Entry { join: room.sent_joins, view });
        (id, emit)
    }

    /// Close a view for good. Returns the leave to emit when it was the
    /// last open view of its room.
    pub fn close(&mut self, id: ViewId) -> Option<ClientEvent> {
        let mut entry = self.views.remove(&id)?;
        entry.view.close();

        let group_id = entry.view.group_id();
        let room = self.rooms.get_mut(&group_id)?;
        room.open = room.open.saturating_sub(1);
        (room.open == 0).then_some(ClientEvent::LeaveGroup { group_id })
    }

    /// Undo the `open` that just returned `id` and a join, when that join
    /// could not be sent.
    pub fn abandon(&mut self, id: ViewId) {
        let Some(entry) = self.views.remove(&id) else {
            return;
        };
        if let Some(room) = self.rooms.get_mut(&entry.view.group_id()) {
            room.open = room.open.saturating_sub(1);
            room.sent_joins = room.sent_joins.saturating_sub(1);
        }
    }

    pub fn on_history(&mut self, id: ViewId, page: Result<Vec<GroupMessage>, String>) -> Vec<CatchUpRequest> {
        if let Some(entry) = self.views.get_mut(&id) {
            entry.view.on_history(page);
        }
        self.catch_ups()
    }

    pub fn on_catch_up(&mut self, id: ViewId, page: Result<Vec<GroupMessage>, String>) {
        if let Some(entry) = self.views.get_mut(&id) {
            entry.view.on_catch_up(page);
        }
    }

    /// Route one server event to the views it concerns. Live messages for
    /// rooms without an open view are dropped.
    pub fn on_event(&mut self, event: ServerEvent) -> Vec<CatchUpRequest> {
        self.route(event);
        self.catch_ups()
    }

    fn route(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::Joined { group_id } => self.acknowledge(group_id, Ok(())),
            ServerEvent::Left { .. } => {}
            ServerEvent::GroupMessage(message) => {
                for entry in self.views.values_mut() {
                    if entry.view.group_id() == message.group_id {
                        entry.view.on_live(message.clone());
                    }
                }
            }
            ServerEvent::Error(err) => match (err.action, err.group_id) {
                (Some(Action::JoinGroup), Some(group_id)) => self.acknowledge(group_id, Err(err.message)),
                _ => tracing::warn!(action = ?err.action, group = ?err.group_id, code = %err.code, "request rejected"),
            },
        }
    }

    pub fn snapshot(&self, id: ViewId) -> Option<ViewSnapshot> {
        self.views.get(&id).map(|entry| entry.view.snapshot())
    }

    pub fn is_empty(&self) -> bool {
        self.views.is_empty()
    }

    fn catch_ups(&mut self) -> Vec<CatchUpRequest> {
        self.views
            .iter_mut()
            .filter_map(|(&view, entry)| {
                let after = entry.view.take_catch_up()?;
                Some(CatchUpRequest { view, group_id: entry.view.group_id(), after })
            })
            .collect()
    }

    /// A successful join also covers views still waiting on an earlier,
    /// failed one. A failure only concerns the views that sent it.
    fn acknowledge(&mut self, group_id: GroupId, result: Result<(), String>) {
        let Some(room) = self.rooms.get_mut(&group_id) else {
            return;
        };
        room.acked_joins += 1;
        let join = room.acked_joins;

        for entry in self.views.values_mut() {
            if entry.view.group_id() != group_id {
                continue;
            }
            match &result {
                Ok(()) if entry.join <= join => entry.view.on_joined(),
                Err(reason) if entry.join == join => entry.view.on_join_failed(reason.clone()),
                _ => {}
            }
        }
        room.last_join = Some(result);
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        client::view::{tests::message, Phase},
        protocol::ErrorEvent,
    };

    fn bodies(views: &Views, id: ViewId) -> Vec<String> {
        views.snapshot(id).unwrap().messages.into_iter().map(|m| m.message).collect()
    }

    fn phase(views: &Views, id: ViewId) -> Phase {
        views.snapshot(id).unwrap().phase
    }

    fn join_failed(group_id: GroupId) -> ServerEvent {
        ServerEvent::Error(ErrorEvent {
            action: Some(Action::JoinGroup),
            group_id: Some(group_id),
            code: "not_a_member".to_owned(),
            message: format!("not a member of group {group_id}"),
        })
    }

    /// Answer every pending catch-up with an empty page.
    fn settle(views: &mut Views, requests: Vec<CatchUpRequest>) {
        for request in requests {
            views.on_catch_up(request.view, Ok(vec![]));
        }
    }

    #[test]
    fn one_join_and_one_leave_per_room() {
        let mut views = Views::new();
        let (a, join) = views.open(7);
        assert_eq!(join, Some(ClientEvent::JoinGroup { group_id: 7 }));
        let (b, join) = views.open(7);
        assert_eq!(join, None);

        assert_eq!(views.close(a), None);
        assert_eq!(views.close(b), Some(ClientEvent::LeaveGroup { group_id: 7 }));
        assert!(views.is_empty());
    }

    #[test]
    fn second_view_of_a_joined_room_is_joined_at_once() {
        let mut views = Views::new();
        let (a, _) = views.open(7);
        assert!(views.on_event(ServerEvent::Joined { group_id: 7 }).is_empty());
        let requests = views.on_history(a, Ok(vec![]));
        assert_eq!(requests, vec![CatchUpRequest { view: a, group_id: 7, after: None }]);
        settle(&mut views, requests);
        assert_eq!(phase(&views, a), Phase::Active);

        let (b, join) = views.open(7);
        assert_eq!(join, None);
        let requests = views.on_history(b, Ok(vec![message(7, 3, "m3")]));
        assert_eq!(requests, vec![CatchUpRequest { view: b, group_id: 7, after: Some(3) }]);
        settle(&mut views, requests);
        assert_eq!(phase(&views, b), Phase::Active);
    }

    #[test]
    fn catch_up_recovers_a_message_missed_by_both_sources() {
        let mut views = Views::new();
        let (b, _) = views.open(5);
        // history read before "lost" was stored
        assert!(views.on_history(b, Ok(vec![])).is_empty());
        // join registered after "lost" was broadcast
        let requests = views.on_event(ServerEvent::Joined { group_id: 5 });
        assert_eq!(requests, vec![CatchUpRequest { view: b, group_id: 5, after: None }]);
        assert_eq!(phase(&views, b), Phase::Joining);

        views.on_catch_up(b, Ok(vec![message(5, 1, "lost")]));
        assert_eq!(phase(&views, b), Phase::Active);
        assert_eq!(bodies(&views, b), ["lost"]);
    }

    #[test]
    fn stale_ack_does_not_join_a_reopened_view() {
        let mut views = Views::new();
        let (a, _) = views.open(7);
        views.close(a);
        let (b, join) = views.open(7);
        assert_eq!(join, Some(ClientEvent::JoinGroup { group_id: 7 }));
        views.on_history(b, Ok(vec![]));

        // ack for the first join
        assert!(views.on_event(ServerEvent::Joined { group_id: 7 }).is_empty());
        assert_eq!(phase(&views, b), Phase::Joining);

        let requests = views.on_event(ServerEvent::Joined { group_id: 7 });
        settle(&mut views, requests);
        assert_eq!(phase(&views, b), Phase::Active);
    }

    #[test]
    fn join_errors_reach_the_view_and_allow_retry() {
        let mut views = Views::new();
        let (a, _) = views.open(7);
        views.on_event(join_failed(7));
        let snapshot = views.snapshot(a).unwrap();
        assert_eq!(snapshot.join_error.as_deref(), Some("not a member of group 7"));
        assert_eq!(snapshot.phase, Phase::Joining);

        let (_, join) = views.open(7);
        assert_eq!(join, Some(ClientEvent::JoinGroup { group_id: 7 }));
    }

    #[test]
    fn successful_retry_activates_views_of_the_failed_join() {
        let mut views = Views::new();
        let (a, _) = views.open(7);
        views.on_history(a, Ok(vec![]));
        views.on_event(join_failed(7));

        let (b, join) = views.open(7);
        assert!(join.is_some());
        views.on_history(b, Ok(vec![]));

        let requests = views.on_event(ServerEvent::Joined { group_id: 7 });
        assert_eq!(requests.len(), 2);
        settle(&mut views, requests);

        assert_eq!(phase(&views, a), Phase::Active);
        assert_eq!(phase(&views, b), Phase::Active);
        assert_eq!(views.snapshot(a).unwrap().join_error, None);
    }

    #[test]
    fn failed_retry_only_marks_its_own_views() {
        let mut views = Views::new();
        let (a, _) = views.open(7);
        views.on_event(ServerEvent::Joined { group_id: 7 });
        views.on_event(join_failed(7));
        assert_eq!(views.snapshot(a).unwrap().join_error, None);
    }

    #[test]
    fn live_messages_go_to_open_views_only() {
        let mut views = Views::new();
        let (a, _) = views.open(1);
        views.on_event(ServerEvent::Joined { group_id: 1 });

        views.on_event(ServerEvent::GroupMessage(message(1, 1, "here")));
        views.on_event(ServerEvent::GroupMessage(message(2, 1, "nobody looking")));
        assert_eq!(bodies(&views, a), ["here"]);

        let (b, _) = views.open(2);
        views.on_history(b, Ok(vec![]));
        assert!(bodies(&views, b).is_empty());
    }

    #[test]
    fn history_and_live_stream_merge_without_duplicates() {
        let mut views = Views::new();
        let (a, _) = views.open(1);
        views.on_event(ServerEvent::GroupMessage(message(1, 2, "m2")));
        views.on_event(ServerEvent::Joined { group_id: 1 });
        let requests = views.on_history(a, Ok(vec![message(1, 1, "m1"), message(1, 2, "m2")]));
        views.on_event(ServerEvent::GroupMessage(message(1, 2, "m2")));
        for request in requests {
            views.on_catch_up(request.view, Ok(vec![message(1, 2, "m2")]));
        }

        assert_eq!(bodies(&views, a), ["m1", "m2"]);
        assert_eq!(phase(&views, a), Phase::Active);
    }

    #[test]
    fn abandoned_open_leaves_no_trace() {
        let mut views = Views::new();
        let (a, join) = views.open(4);
        assert!(join.is_some());
        views.abandon(a);
        assert!(views.is_empty());

        let (b, join) = views.open(4);
        assert_eq!(join, Some(ClientEvent::JoinGroup { group_id: 4 }));
        views.on_history(b, Ok(vec![]));
        let requests = views.on_event(ServerEvent::Joined { group_id: 4 });
        settle(&mut views, requests);
        assert_eq!(phase(&views, b), Phase::Active);
    }

    #[test]
    fn closed_views_disappear() {
        let mut views = Views::new();
        let (a, _) = views.open(1);
        views.close(a);
        assert!(views.snapshot(a).is_none());
        assert_eq!(views.close(a), None);
    }
}
