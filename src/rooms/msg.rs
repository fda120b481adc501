use std::sync::Arc;

use axum::{debug_handler, extract::{Path, State}, Json};
use dashmap::DashMap;
use serde::Deserialize;
use tokio::sync::Mutex;
use tower_sessions::Session;

use crate::{
    db::{Db, Directory, GroupId, GroupMessage, Identity, Membership, MessageStore, NewMessage},
    error::ChatError,
    hub::{ConnectionId, Hub},
    protocol::ServerEvent,
    AppResult,
};

#[derive(Deserialize)]
pub(crate) struct SendMessageQuery {
    message: String,
    client_token: Option<String>,
}

/// Validates sends, persists them, then fans them out to the room.
#[derive(Clone)]
pub struct Relay<S> {
    store: S,
    hub: Hub,
    // persist and broadcast happen under the room's lock so that broadcast
    // order matches position order
    order: Arc<DashMap<GroupId, Arc<Mutex<()>>>>,
    max_len: usize,
}

impl<S: MessageStore + Directory> Relay<S> {
    pub fn new(store: S, hub: Hub, max_len: usize) -> Self {
        Self {
            store,
            hub,
            order: Arc::default(),
            max_len,
        }
    }

    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    /// Membership is required for every room operation.
    pub async fn authorize(&self, identity: Option<&Identity>, group_id: GroupId) -> Result<(), ChatError> {
        let identity = identity.ok_or(ChatError::Unauthenticated)?;
        match self.store.membership(group_id, identity.user_id).await? {
            Membership::Member => Ok(()),
            Membership::NotMember => Err(ChatError::NotAMember(group_id)),
            Membership::NoSuchGroup => Err(ChatError::RoomNotFound(group_id)),
        }
    }

    /// Authorize and subscribe a connection to a room.
    pub async fn join(&self, id: ConnectionId, group_id: GroupId) -> Result<bool, ChatError> {
        let identity = self.hub.identity(id);
        self.authorize(identity.as_ref(), group_id).await?;
        self.hub.join(group_id, id)
    }

    /// Send on behalf of whoever owns connection `id`.
    pub async fn send_from(
        &self,
        id: ConnectionId,
        group_id: GroupId,
        body: &str,
        client_token: Option<String>,
    ) -> Result<GroupMessage, ChatError> {
        let identity = self.hub.identity(id);
        self.send_message(identity.as_ref(), group_id, body, client_token).await
    }

    /// Persist one message and broadcast it to the room. Nothing is broadcast
    /// unless the store accepted the message, and a replayed client token
    /// returns the stored message without broadcasting it again.
    pub async fn send_message(
        &self,
        sender: Option<&Identity>,
        group_id: GroupId,
        body: &str,
        client_token: Option<String>,
    ) -> Result<GroupMessage, ChatError> {
        let sender = match sender {
            Some(sender) if self.hub.is_online(sender.user_id) => sender,
            _ => return Err(ChatError::Unauthenticated),
        };
        let body = body.trim();
        if body.is_empty() {
            return Err(ChatError::EmptyMessage);
        }
        if body.chars().count() > self.max_len {
            return Err(ChatError::MessageTooLong { max: self.max_len });
        }
        self.authorize(Some(sender), group_id).await?;

        let lock = self.order.entry(group_id).or_default().clone();
        let result = {
            let _guard = lock.lock().await;
            self.append_and_broadcast(sender, group_id, body, client_token).await
        };
        drop(lock);
        // nobody else holds or waits on the lock once only the map has it
        self.order.remove_if(&group_id, |_, lock| Arc::strong_count(lock) == 1);

        result
    }

    async fn append_and_broadcast(
        &self,
        sender: &Identity,
        group_id: GroupId,
        body: &str,
        client_token: Option<String>,
    ) -> Result<GroupMessage, ChatError> {
        let appended = self
            .store
            .append(NewMessage {
                group_id,
                sender: sender.clone(),
                body: body.to_owned(),
                client_token,
            })
            .await
            .inspect_err(|err| tracing::error!(group = group_id, user = sender.user_id, error = %err, "failed to persist message"))?;

        if appended.replayed {
            tracing::debug!(group = group_id, position = appended.message.position, "client token replayed");
            return Ok(appended.message);
        }

        let delivered = self
            .hub
            .broadcast(group_id, ServerEvent::GroupMessage(appended.message.clone()));
        tracing::info!(group = group_id, position = appended.message.position, delivered, "message relayed");

        Ok(appended.message)
    }

    /// History page for a room, oldest first.
    pub async fn history(
        &self,
        identity: Option<&Identity>,
        group_id: GroupId,
        after: Option<i64>,
        limit: i64,
    ) -> Result<Vec<GroupMessage>, ChatError> {
        self.authorize(identity, group_id).await?;
        Ok(self.store.list_since(group_id, after, limit).await?)
    }
}

#[debug_handler(state = crate::AppState)]
pub(crate) async fn send_msg(
    Path(group_id): Path<GroupId>,
    State(db): State<Db>,
    State(relay): State<Relay<Db>>,
    session: Session,

    Json(SendMessageQuery { message, client_token }): Json<SendMessageQuery>,
) -> AppResult<Json<GroupMessage>> {
    let identity = crate::session::current_identity(&session, &db).await?;
    let message = relay
        .send_message(identity.as_ref(), group_id, &message, client_token)
        .await?;

    Ok(Json(message))
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashSet,
        sync::{
            atomic::{AtomicBool, Ordering},
            Mutex as StdMutex,
        },
    };

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        db::{Appended, UserId},
        hub::Inbox,
    };

    /// In-memory store with switchable failure.
    #[derive(Clone, Default)]
    struct FakeStore {
        messages: Arc<StdMutex<Vec<(Option<(UserId, String)>, GroupMessage)>>>,
        members: Arc<StdMutex<HashSet<(GroupId, UserId)>>>,
        groups: Arc<StdMutex<HashSet<GroupId>>>,
        failing: Arc<AtomicBool>,
    }

    impl FakeStore {
        fn add_member(&self, group_id: GroupId, user_id: UserId) {
            self.groups.lock().unwrap().insert(group_id);
            self.members.lock().unwrap().insert((group_id, user_id));
        }

        fn fail(&self, failing: bool) {
            self.failing.store(failing, Ordering::SeqCst);
        }

        fn len(&self) -> usize {
            self.messages.lock().unwrap().len()
        }
    }

    impl MessageStore for FakeStore {
        async fn append(&self, message: NewMessage) -> Result<Appended, sqlx::Error> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(sqlx::Error::PoolTimedOut);
            }
            let mut messages = self.messages.lock().unwrap();
            let key = message.client_token.map(|t| (message.sender.user_id, t));
            if let Some(key) = &key {
                if let Some((_, stored)) = messages.iter().find(|(k, m)| k.as_ref() == Some(key) && m.group_id == message.group_id) {
                    return Ok(Appended { message: stored.clone(), replayed: true });
                }
            }
            let stored = GroupMessage {
                position: messages.len() as i64 + 1,
                group_id: message.group_id,
                user: message.sender.name,
                user_image: message.sender.picture,
                message: message.body,
                created_at: 0,
            };
            messages.push((key, stored.clone()));
            Ok(Appended { message: stored, replayed: false })
        }

        async fn list_since(&self, group_id: GroupId, after: Option<i64>, limit: i64) -> Result<Vec<GroupMessage>, sqlx::Error> {
            Ok(self
                .messages
                .lock()
                .unwrap()
                .iter()
                .map(|(_, m)| m)
                .filter(|m| m.group_id == group_id && m.position > after.unwrap_or(0))
                .take(limit as usize)
                .cloned()
                .collect())
        }
    }

    impl Directory for FakeStore {
        async fn identity(&self, _user_id: UserId) -> Result<Option<Identity>, sqlx::Error> {
            Ok(None)
        }

        async fn membership(&self, group_id: GroupId, user_id: UserId) -> Result<Membership, sqlx::Error> {
            if self.members.lock().unwrap().contains(&(group_id, user_id)) {
                Ok(Membership::Member)
            } else if self.groups.lock().unwrap().contains(&group_id) {
                Ok(Membership::NotMember)
            } else {
                Ok(Membership::NoSuchGroup)
            }
        }
    }

    fn identity(user_id: UserId) -> Identity {
        Identity {
            user_id,
            name: format!("user{user_id}"),
            picture: format!("{user_id}.png"),
            email: format!("user{user_id}@example.com"),
        }
    }

    fn relay() -> (Relay<FakeStore>, FakeStore) {
        let store = FakeStore::default();
        (Relay::new(store.clone(), Hub::new(16), 20), store)
    }

    fn bodies(inbox: &mut Inbox) -> Vec<String> {
        let mut bodies = Vec::new();
        while let Ok(event) = inbox.try_recv() {
            if let ServerEvent::GroupMessage(m) = &*event {
                bodies.push(m.message.clone());
            }
        }
        bodies
    }

    #[tokio::test]
    async fn basic_relay_reaches_sender_and_members_only() {
        let (relay, store) = relay();
        for user in [1, 2, 3] {
            store.add_member(7, user);
        }
        let (a, mut a_inbox) = relay.hub().connect(Some(identity(1)));
        let (b, mut b_inbox) = relay.hub().connect(Some(identity(2)));
        let (_c, mut c_inbox) = relay.hub().connect(Some(identity(3)));
        relay.join(a, 7).await.unwrap();
        relay.join(b, 7).await.unwrap();

        let sent = relay.send_from(a, 7, "  hello ", None).await.unwrap();
        assert_eq!(sent.message, "hello");
        assert_eq!(sent.user, "user1");
        assert_eq!(bodies(&mut a_inbox), ["hello"]);
        assert_eq!(bodies(&mut b_inbox), ["hello"]);
        assert!(bodies(&mut c_inbox).is_empty());
    }

    #[tokio::test]
    async fn validation_rejects_before_persisting() {
        let (relay, store) = relay();
        store.add_member(7, 1);
        store.add_member(8, 2);
        let (anonymous, _i0) = relay.hub().connect(None);
        let (a, _i1) = relay.hub().connect(Some(identity(1)));

        assert!(matches!(relay.send_from(anonymous, 7, "hi", None).await, Err(ChatError::Unauthenticated)));
        assert!(matches!(relay.send_from(a, 7, "   ", None).await, Err(ChatError::EmptyMessage)));
        assert!(matches!(
            relay.send_from(a, 7, &"x".repeat(21), None).await,
            Err(ChatError::MessageTooLong { max: 20 })
        ));
        assert!(matches!(relay.send_from(a, 8, "hi", None).await, Err(ChatError::NotAMember(8))));
        assert!(matches!(relay.send_from(a, 99, "hi", None).await, Err(ChatError::RoomNotFound(99))));
        assert_eq!(store.len(), 0);

        // a known user with no live connection is not allowed to send
        assert!(matches!(
            relay.send_message(Some(&identity(2)), 8, "hi", None).await,
            Err(ChatError::Unauthenticated)
        ));
    }

    #[tokio::test]
    async fn join_requires_membership() {
        let (relay, store) = relay();
        store.add_member(4, 1);
        store.add_member(4, 5);
        let (anonymous, _i0) = relay.hub().connect(None);
        let (a, _i1) = relay.hub().connect(Some(identity(2)));

        assert!(matches!(relay.join(anonymous, 4).await, Err(ChatError::Unauthenticated)));
        assert!(matches!(relay.join(a, 4).await, Err(ChatError::NotAMember(4))));
        assert!(relay.hub().members(4).is_empty());
    }

    #[tokio::test]
    async fn failed_persistence_broadcasts_nothing() {
        let (relay, store) = relay();
        store.add_member(3, 1);
        let (a, mut a_inbox) = relay.hub().connect(Some(identity(1)));
        relay.join(a, 3).await.unwrap();

        store.fail(true);
        assert!(matches!(relay.send_from(a, 3, "lost", None).await, Err(ChatError::Persistence(_))));
        assert!(bodies(&mut a_inbox).is_empty());

        store.fail(false);
        relay.send_from(a, 3, "retry", None).await.unwrap();
        assert_eq!(bodies(&mut a_inbox), ["retry"]);
    }

    #[tokio::test]
    async fn replayed_token_is_stored_and_broadcast_once() {
        let (relay, store) = relay();
        store.add_member(3, 1);
        let (a, mut a_inbox) = relay.hub().connect(Some(identity(1)));
        relay.join(a, 3).await.unwrap();

        let first = relay.send_from(a, 3, "once", Some("t-1".into())).await.unwrap();
        let again = relay.send_from(a, 3, "once", Some("t-1".into())).await.unwrap();
        assert_eq!(first, again);
        assert_eq!(store.len(), 1);
        assert_eq!(bodies(&mut a_inbox), ["once"]);

        // without a token every call is a new message
        relay.send_from(a, 3, "twice", None).await.unwrap();
        relay.send_from(a, 3, "twice", None).await.unwrap();
        assert_eq!(store.len(), 3);
    }

    #[tokio::test]
    async fn late_joiner_sees_only_later_messages_live_but_all_in_history() {
        let (relay, store) = relay();
        store.add_member(9, 1);
        store.add_member(9, 2);
        let (a, _a_inbox) = relay.hub().connect(Some(identity(1)));
        let (b, mut b_inbox) = relay.hub().connect(Some(identity(2)));
        relay.join(a, 9).await.unwrap();

        relay.send_from(a, 9, "first", None).await.unwrap();
        relay.join(b, 9).await.unwrap();
        relay.send_from(a, 9, "second", None).await.unwrap();

        assert_eq!(bodies(&mut b_inbox), ["second"]);
        let history = relay.history(Some(&identity(2)), 9, None, 50).await.unwrap();
        let history: Vec<_> = history.iter().map(|m| m.message.as_str()).collect();
        assert_eq!(history, ["first", "second"]);

        assert!(matches!(relay.history(None, 9, None, 50).await, Err(ChatError::Unauthenticated)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_sends_arrive_in_position_order() {
        let store = FakeStore::default();
        let relay = Relay::new(store.clone(), Hub::new(512), 100);
        for user in 1..=4 {
            store.add_member(1, user);
        }
        let (watcher, mut inbox) = relay.hub().connect(Some(identity(4)));
        relay.join(watcher, 1).await.unwrap();

        let mut tasks = Vec::new();
        for user in 1..=3 {
            let relay = relay.clone();
            let (id, _inbox) = relay.hub().connect(Some(identity(user)));
            tasks.push(tokio::spawn(async move {
                for n in 0..50 {
                    relay.send_from(id, 1, &format!("{user}-{n}"), None).await.unwrap();
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let mut positions = Vec::new();
        while let Ok(event) = inbox.try_recv() {
            if let ServerEvent::GroupMessage(m) = &*event {
                positions.push(m.position);
            }
        }
        assert_eq!(positions.len(), 150);
        assert!(positions.windows(2).all(|w| w[0] < w[1]));
        assert!(relay.order.is_empty());
    }

    #[tokio::test]
    async fn room_locks_are_released_after_each_send() {
        let (relay, store) = relay();
        store.add_member(5, 1);
        store.add_member(6, 1);
        let (a, _inbox) = relay.hub().connect(Some(identity(1)));

        // nobody has joined room 5
        relay.send_from(a, 5, "into the void", None).await.unwrap();
        assert!(relay.hub().members(5).is_empty());
        assert!(relay.order.is_empty());

        store.fail(true);
        assert!(relay.send_from(a, 6, "lost", None).await.is_err());
        assert!(relay.order.is_empty());
    }
}
