use std::collections::BTreeMap;

use serde::Serialize;

use crate::db::{GroupId, GroupMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Waiting for the join acknowledgement, the history page, or both.
    Joining,
    Active,
    /// Terminal. Nothing is accepted any more.
    Closing,
}

/// One open chat view: the history page and the live stream merged into a
/// single list keyed by server position, so a message seen through both
/// sources is kept once.
///
/// The first history page may be read before the server registers the
/// join, so a message stored in between reaches neither source. Once both
/// the page and the join acknowledgement are in, the view asks for a
/// catch-up page after the last position the history page covered, and
/// only becomes `Active` when that page is merged.
#[derive(Debug, Clone)]
pub struct ChatView {
    group_id: GroupId,
    phase: Phase,
    joined: bool,
    history_loaded: bool,
    catch_up: CatchUp,
    /// Highest position that came from a history page.
    history_high: Option<i64>,
    messages: BTreeMap<i64, GroupMessage>,
    history_error: Option<String>,
    join_error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CatchUp {
    Pending,
    Requested,
    Done,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ViewSnapshot {
    pub group_id: GroupId,
    pub phase: Phase,
    pub messages: Vec<GroupMessage>,
    pub history_error: Option<String>,
    pub join_error: Option<String>,
}

impl ChatView {
    pub fn new(group_id: GroupId) -> Self {
        Self {
            group_id,
            phase: Phase::Joining,
            joined: false,
            history_loaded: false,
            catch_up: CatchUp::Pending,
            history_high: None,
            messages: BTreeMap::new(),
            history_error: None,
            join_error: None,
        }
    }

    pub fn group_id(&self) -> GroupId {
        self.group_id
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn on_joined(&mut self) {
        if self.phase == Phase::Closing {
            return;
        }
        self.joined = true;
        self.join_error = None;
        self.settle();
    }

    pub fn on_join_failed(&mut self, reason: String) {
        if self.phase == Phase::Closing {
            return;
        }
        self.join_error = Some(reason);
    }

    /// A failed fetch still counts as loaded: the view shows the error
    /// and keeps following the live stream.
    pub fn on_history(&mut self, page: Result<Vec<GroupMessage>, String>) {
        if self.phase == Phase::Closing {
            return;
        }
        self.merge_page(page);
        self.history_loaded = true;
        self.settle();
    }

    /// Once joined with the first page loaded, hands out (once) the
    /// position a catch-up page should start after.
    pub fn take_catch_up(&mut self) -> Option<Option<i64>> {
        let ready = self.phase == Phase::Joining && self.joined && self.history_loaded;
        if !ready || self.catch_up != CatchUp::Pending {
            return None;
        }
        self.catch_up = CatchUp::Requested;
        Some(self.history_high)
    }

    pub fn on_catch_up(&mut self, page: Result<Vec<GroupMessage>, String>) {
        if self.phase == Phase::Closing || self.catch_up != CatchUp::Requested {
            return;
        }
        self.merge_page(page);
        self.catch_up = CatchUp::Done;
        self.settle();
    }

    fn merge_page(&mut self, page: Result<Vec<GroupMessage>, String>) {
        match page {
            Ok(page) => {
                for message in page.into_iter().filter(|m| m.group_id == self.group_id) {
                    self.history_high = self.history_high.max(Some(message.position));
                    self.messages.entry(message.position).or_insert(message);
                }
            }
            Err(reason) => self.history_error = Some(reason),
        }
    }

    /// Merge one live message. Returns whether the list changed.
    pub fn on_live(&mut self, message: GroupMessage) -> bool {
        if self.phase == Phase::Closing || message.group_id != self.group_id {
            return false;
        }
        if self.messages.contains_key(&message.position) {
            return false;
        }
        self.messages.insert(message.position, message);
        true
    }

    pub fn close(&mut self) {
        self.phase = Phase::Closing;
    }

    pub fn messages(&self) -> impl Iterator<Item = &GroupMessage> {
        self.messages.values()
    }

    pub fn snapshot(&self) -> ViewSnapshot {
        ViewSnapshot {
            group_id: self.group_id,
            phase: self.phase,
            messages: self.messages.values().cloned().collect(),
            history_error: self.history_error.clone(),
            join_error: self.join_error.clone(),
        }
    }

    fn settle(&mut self) {
        if self.phase == Phase::Joining
            && self.joined
            && self.history_loaded
            && self.catch_up == CatchUp::Done
        {
            self.phase = Phase::Active;
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    pub(crate) fn message(group_id: GroupId, position: i64, body: &str) -> GroupMessage {
        GroupMessage {
            position,
            group_id,
            user: "Alice".to_owned(),
            user_image: String::new(),
            message: body.to_owned(),
            created_at: position * 1000,
        }
    }

    fn bodies(view: &ChatView) -> Vec<&str> {
        view.messages().map(|m| m.message.as_str()).collect()
    }

    /// Joined, first page merged and an empty catch-up page answered.
    fn activate(view: &mut ChatView, page: Vec<GroupMessage>) {
        view.on_joined();
        view.on_history(Ok(page));
        assert!(view.take_catch_up().is_some());
        view.on_catch_up(Ok(vec![]));
        assert_eq!(view.phase(), Phase::Active);
    }

    #[test]
    fn live_copy_of_a_history_message_is_kept_once() {
        let mut view = ChatView::new(1);
        activate(&mut view, vec![message(1, 1, "m1"), message(1, 2, "m2")]);

        assert!(!view.on_live(message(1, 2, "m2")));
        assert_eq!(bodies(&view), ["m1", "m2"]);
    }

    #[test]
    fn live_before_history_is_merged_in_order() {
        let mut view = ChatView::new(1);
        view.on_joined();
        assert!(view.on_live(message(1, 3, "m3")));
        assert_eq!(view.phase(), Phase::Joining);

        view.on_history(Ok(vec![message(1, 1, "m1"), message(1, 2, "m2"), message(1, 3, "m3")]));
        assert_eq!(bodies(&view), ["m1", "m2", "m3"]);
    }

    #[test]
    fn active_needs_join_history_and_catch_up() {
        let mut view = ChatView::new(1);
        assert_eq!(view.take_catch_up(), None);
        view.on_history(Ok(vec![message(1, 4, "m4")]));
        assert_eq!(view.take_catch_up(), None);
        view.on_joined();
        assert_eq!(view.phase(), Phase::Joining);

        assert_eq!(view.take_catch_up(), Some(Some(4)));
        assert_eq!(view.take_catch_up(), None);
        view.on_catch_up(Ok(vec![]));
        assert_eq!(view.phase(), Phase::Active);
    }

    #[test]
    fn message_stored_between_history_read_and_join_is_recovered() {
        let mut view = ChatView::new(5);
        // history read before the message existed
        view.on_history(Ok(vec![]));
        // live message after the join registered
        view.on_joined();
        view.on_live(message(5, 8, "after join"));

        // the catch-up starts from the page, not from the live stream
        assert_eq!(view.take_catch_up(), Some(None));
        assert_eq!(view.phase(), Phase::Joining);
        view.on_catch_up(Ok(vec![message(5, 7, "in the gap"), message(5, 8, "after join")]));

        assert_eq!(view.phase(), Phase::Active);
        assert_eq!(bodies(&view), ["in the gap", "after join"]);
    }

    #[test]
    fn failed_history_still_activates() {
        let mut view = ChatView::new(1);
        view.on_joined();
        view.on_history(Err("503".to_owned()));
        assert_eq!(view.take_catch_up(), Some(None));
        view.on_catch_up(Err("503".to_owned()));
        assert_eq!(view.phase(), Phase::Active);
        assert!(view.on_live(message(1, 4, "after outage")));

        let snapshot = view.snapshot();
        assert_eq!(snapshot.history_error.as_deref(), Some("503"));
        assert_eq!(snapshot.messages.len(), 1);
    }

    #[test]
    fn closing_is_terminal() {
        let mut view = ChatView::new(1);
        view.on_joined();
        view.close();

        view.on_history(Ok(vec![message(1, 1, "m1")]));
        assert!(!view.on_live(message(1, 2, "m2")));
        view.on_joined();
        assert_eq!(view.take_catch_up(), None);
        assert_eq!(view.phase(), Phase::Closing);
        assert!(bodies(&view).is_empty());
    }

    #[test]
    fn messages_for_other_groups_are_ignored() {
        let mut view = ChatView::new(1);
        assert!(!view.on_live(message(2, 1, "elsewhere")));
        view.on_history(Ok(vec![message(2, 5, "elsewhere")]));
        assert!(bodies(&view).is_empty());
    }
}
