//! Client side of the chat: an explicitly owned connection handle that keeps
//! every open view reconciled against the server.

mod state;
mod view;

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use futures_util::{SinkExt, StreamExt};
use reqwest::header::{HeaderMap, HeaderValue, COOKIE};
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tokio_tungstenite::tungstenite::{self, client::IntoClientRequest, Message};
use uuid::Uuid;

use crate::{
    db::{GroupId, GroupMessage, GroupSummary},
    protocol::{ClientEvent, ServerEvent},
};

pub use state::{CatchUpRequest, ViewId, Views};
pub use view::{ChatView, Phase, ViewSnapshot};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("message is empty")]
    EmptyMessage,

    #[error("invalid server url: {0}")]
    InvalidUrl(String),

    #[error("session cookie is not a valid header value")]
    InvalidHeader,

    #[error("websocket: {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error("http: {0}")]
    Http(#[from] reqwest::Error),

    #[error("server answered {status}: {body}")]
    Status { status: u16, body: String },

    #[error("request timed out")]
    Timeout,

    #[error("connection closed")]
    Disconnected,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// `http://` or `https://` origin of the server.
    pub base_url: String,
    /// `name=value` of the session cookie, if signed in.
    pub cookie: Option<String>,
    pub send_timeout: Duration,
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            cookie: None,
            send_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_cookie(mut self, cookie: impl Into<String>) -> Self {
        self.cookie = Some(cookie.into());
        self
    }

    fn ws_url(&self) -> Result<String, ClientError> {
        let rest = if let Some(rest) = self.base_url.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = self.base_url.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            return Err(ClientError::InvalidUrl(self.base_url.clone()));
        };
        Ok(format!("{rest}/api/ws"))
    }
}

#[derive(Deserialize)]
struct History {
    messages: Vec<GroupMessage>,
}

#[derive(Deserialize)]
struct Discovered {
    groups: Vec<GroupSummary>,
}

struct Shared {
    views: Mutex<Views>,
    changes: watch::Sender<u64>,
    connected: AtomicBool,
    http: reqwest::Client,
    base_url: String,
}

impl Shared {
    fn views(&self) -> MutexGuard<'_, Views> {
        self.views.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn bump(&self) {
        self.changes.send_modify(|version| *version += 1);
    }

    fn messages_url(&self, group_id: GroupId) -> String {
        format!("{}/api/groups/{group_id}/messages", self.base_url)
    }

    /// Fetch and merge everything each view may have missed between its
    /// history page and its join.
    fn catch_up(self: &Arc<Self>, requests: Vec<CatchUpRequest>) {
        for CatchUpRequest { view, group_id, after } in requests {
            let shared = self.clone();
            tokio::spawn(async move {
                let page = fetch_since(&shared.http, &shared.messages_url(group_id), after)
                    .await
                    .map_err(|err| err.to_string());
                shared.views().on_catch_up(view, page);
                shared.bump();
            });
        }
    }
}

/// One live connection to the chat server plus the views reconciled on it.
pub struct ChatClient {
    config: ClientConfig,
    http: reqwest::Client,
    shared: Arc<Shared>,
    outgoing: mpsc::UnboundedSender<ClientEvent>,
    writer: JoinHandle<()>,
    reader: JoinHandle<()>,
}

impl ChatClient {
    pub async fn connect(config: ClientConfig) -> Result<Self, ClientError> {
        let mut request = config.ws_url()?.into_client_request()?;
        let mut headers = HeaderMap::new();
        if let Some(cookie) = &config.cookie {
            let value = HeaderValue::from_str(cookie).map_err(|_| ClientError::InvalidHeader)?;
            request.headers_mut().insert(
                tungstenite::http::header::COOKIE,
                tungstenite::http::HeaderValue::from_str(cookie).map_err(|_| ClientError::InvalidHeader)?,
            );
            headers.insert(COOKIE, value);
        }
        let http = reqwest::Client::builder().default_headers(headers).build()?;

        let (stream, _) = tokio_tungstenite::connect_async(request).await?;
        let (mut sink, mut stream) = stream.split();

        let shared = Arc::new(Shared {
            views: Mutex::new(Views::new()),
            changes: watch::channel(0).0,
            connected: AtomicBool::new(true),
            http: http.clone(),
            base_url: config.base_url.clone(),
        });

        let (outgoing, mut events) = mpsc::unbounded_channel::<ClientEvent>();
        let writer = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let json = match serde_json::to_string(&event) {
                    Ok(json) => json,
                    Err(err) => {
                        tracing::error!(error = %err, "failed to encode event");
                        continue;
                    }
                };
                if sink.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let reader = tokio::spawn({
            let shared = shared.clone();
            async move {
                while let Some(Ok(frame)) = stream.next().await {
                    let text = match frame {
                        Message::Text(text) => text,
                        Message::Close(_) => break,
                        _ => continue,
                    };
                    match serde_json::from_str::<ServerEvent>(text.as_str()) {
                        Ok(event) => {
                            let requests = shared.views().on_event(event);
                            shared.catch_up(requests);
                            shared.bump();
                        }
                        Err(err) => tracing::warn!(error = %err, "unreadable server event"),
                    }
                }
                shared.connected.store(false, Ordering::Release);
                shared.bump();
            }
        });

        Ok(Self {
            config,
            http,
            shared,
            outgoing,
            writer,
            reader,
        })
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    /// Open a view of `group_id`: joins the room if no other view has, and
    /// fetches its history in the background.
    pub fn open(&self, group_id: GroupId) -> Result<ViewId, ClientError> {
        let mut views = self.shared.views();
        let (view, join) = views.open(group_id);
        if let Some(join) = join {
            if let Err(err) = self.emit(join) {
                views.abandon(view);
                return Err(err);
            }
        }
        drop(views);

        let shared = self.shared.clone();
        tokio::spawn(async move {
            let page = fetch_history(shared.http.get(shared.messages_url(group_id)))
                .await
                .map_err(|err| err.to_string());
            let requests = shared.views().on_history(view, page);
            shared.catch_up(requests);
            shared.bump();
        });

        self.shared.bump();
        Ok(view)
    }

    pub fn close(&self, view: ViewId) -> Result<(), ClientError> {
        let leave = self.shared.views().close(view);
        self.shared.bump();
        match leave {
            Some(leave) => self.emit(leave),
            None => Ok(()),
        }
    }

    pub fn snapshot(&self, view: ViewId) -> Option<ViewSnapshot> {
        self.shared.views().snapshot(view)
    }

    /// Bumped whenever any view changes.
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.shared.changes.subscribe()
    }

    /// Fire-and-forget send over the live connection. The message shows up
    /// in open views only once the server relays it back. Returns the
    /// client token attached to it.
    pub fn send(&self, group_id: GroupId, body: &str) -> Result<String, ClientError> {
        if body.trim().is_empty() {
            return Err(ClientError::EmptyMessage);
        }
        let client_token = Uuid::now_v7().simple().to_string();
        self.emit(ClientEvent::SendMessage {
            group_id,
            message: body.to_owned(),
            client_token: Some(client_token.clone()),
        })?;
        Ok(client_token)
    }

    /// Send over REST and wait for the stored message. Retrying with the
    /// same token after a timeout never stores the message twice.
    pub async fn send_confirmed(
        &self,
        group_id: GroupId,
        body: &str,
        client_token: Option<&str>,
    ) -> Result<GroupMessage, ClientError> {
        if body.trim().is_empty() {
            return Err(ClientError::EmptyMessage);
        }
        let request = self
            .http
            .post(self.url(group_id, "send-message"))
            .json(&json!({ "message": body, "client_token": client_token }));

        let response = tokio::time::timeout(self.config.send_timeout, request.send())
            .await
            .map_err(|_| ClientError::Timeout)??;
        Ok(checked(response).await?.json().await?)
    }

    pub async fn history(&self, group_id: GroupId) -> Result<Vec<GroupMessage>, ClientError> {
        fetch_history(self.http.get(self.url(group_id, "messages"))).await
    }

    /// Every group, with whether this user already belongs to it.
    pub async fn discover(&self) -> Result<Vec<GroupSummary>, ClientError> {
        let url = format!("{}/api/groups/discover", self.config.base_url);
        let response = checked(self.http.get(url).send().await?).await?;
        Ok(response.json::<Discovered>().await?.groups)
    }

    /// Close the connection, flushing events already queued.
    pub async fn disconnect(self) {
        let ChatClient { outgoing, writer, reader, .. } = self;
        drop(outgoing);
        let _ = writer.await;
        reader.abort();
    }

    fn emit(&self, event: ClientEvent) -> Result<(), ClientError> {
        if !self.is_connected() {
            return Err(ClientError::Disconnected);
        }
        self.outgoing.send(event).map_err(|_| ClientError::Disconnected)
    }

    fn url(&self, group_id: GroupId, path: &str) -> String {
        format!("{}/api/groups/{group_id}/{path}", self.config.base_url)
    }
}

async fn fetch_history(request: reqwest::RequestBuilder) -> Result<Vec<GroupMessage>, ClientError> {
    let response = checked(request.send().await?).await?;
    Ok(response.json::<History>().await?.messages)
}

/// Every message of the room after `after`, following pages until one
/// comes back empty.
async fn fetch_since(
    http: &reqwest::Client,
    url: &str,
    mut after: Option<i64>,
) -> Result<Vec<GroupMessage>, ClientError> {
    let mut messages = Vec::new();
    loop {
        let mut request = http.get(url);
        if let Some(after) = after {
            request = request.query(&[("after", after)]);
        }
        let page = fetch_history(request).await?;
        let Some(last) = page.last() else {
            return Ok(messages);
        };
        after = Some(last.position);
        messages.extend(page);
    }
}

async fn checked(response: reqwest::Response) -> Result<reqwest::Response, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    Err(ClientError::Status {
        status: status.as_u16(),
        body: response.text().await.unwrap_or_default(),
    })
}
