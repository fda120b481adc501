use std::{sync::Arc, time::Duration};

use axum::{
    body::Bytes,
    debug_handler,
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use tower_sessions::Session;

use crate::{
    config::Config,
    db::Db,
    error::ChatError,
    hub::{ConnectionId, Inbox},
    protocol::{ClientEvent, ErrorEvent, ServerEvent},
    session, AppResult,
};

use super::msg::Relay;

#[debug_handler(state = crate::AppState)]
pub(crate) async fn group_ws(
    State(db): State<Db>,
    State(relay): State<Relay<Db>>,
    State(config): State<Arc<Config>>,
    session: Session,

    ws: WebSocketUpgrade,
) -> AppResult<impl IntoResponse> {
    let identity = session::current_identity(&session, &db).await?;

    Ok(ws.on_upgrade(async move |stream| {
        let hub = relay.hub().clone();
        let (id, inbox) = hub.connect(identity);
        tracing::debug!(connection = %id, "connection opened");

        serve(stream, id, inbox, &relay, &config).await;

        hub.disconnect(id);
        tracing::debug!(connection = %id, "connection closed");
    }))
}

async fn serve(stream: WebSocket, id: ConnectionId, inbox: Inbox, relay: &Relay<Db>, config: &Config) {
    let (sender, mut receiver) = stream.split();
    let mut writer = tokio::spawn(write_events(sender, inbox, config.heartbeat));
    let hub = relay.hub();

    loop {
        let frame = tokio::select! {
            _ = &mut writer => break,
            frame = tokio::time::timeout(config.idle_timeout, receiver.next()) => frame,
        };

        let text = match frame {
            Ok(Some(Ok(Message::Text(text)))) => text,
            Ok(Some(Ok(Message::Close(_)))) | Ok(Some(Err(_))) | Ok(None) => break,
            Ok(Some(Ok(_))) => continue,
            Err(_) => {
                tracing::debug!(connection = %id, "idle timeout");
                break;
            }
        };

        let event = match serde_json::from_str::<ClientEvent>(text.as_str()) {
            Ok(event) => event,
            Err(err) => {
                hub.send_to(id, ServerEvent::Error(ErrorEvent::bad_request(err.to_string())));
                continue;
            }
        };

        if handle(id, event, relay).await.is_err() {
            break;
        }
    }

    writer.abort();
}

/// Answers one client event. Only fails once the connection itself is gone.
async fn handle(id: ConnectionId, event: ClientEvent, relay: &Relay<Db>) -> Result<(), ChatError> {
    let hub = relay.hub();
    let (action, group_id) = (event.action(), event.group_id());

    // Sent messages come back to the sender through the room broadcast.
    let result = match event {
        ClientEvent::JoinGroup { group_id } => relay
            .join(id, group_id)
            .await
            .map(|_| Some(ServerEvent::Joined { group_id })),
        ClientEvent::LeaveGroup { group_id } => {
            hub.leave(group_id, id);
            Ok(Some(ServerEvent::Left { group_id }))
        }
        ClientEvent::SendMessage { group_id, message, client_token } => relay
            .send_from(id, group_id, &message, client_token)
            .await
            .map(|_| None),
    };

    let reply = match result {
        Ok(Some(reply)) => reply,
        Ok(None) => return Ok(()),
        Err(ChatError::Transport) => return Err(ChatError::Transport),
        Err(err) => {
            tracing::debug!(connection = %id, ?action, group = group_id, error = %err, "request rejected");
            ServerEvent::Error(ErrorEvent::new(action, group_id, &err))
        }
    };

    if hub.send_to(id, reply) {
        Ok(())
    } else {
        Err(ChatError::Transport)
    }
}

async fn write_events(mut sender: SplitSink<WebSocket, Message>, mut inbox: Inbox, heartbeat: Duration) {
    let mut ticker = tokio::time::interval(heartbeat);
    ticker.tick().await;

    loop {
        let frame = tokio::select! {
            event = inbox.recv() => match event {
                Some(event) => match serde_json::to_string(event.as_ref()) {
                    Ok(json) => Message::Text(json.into()),
                    Err(err) => {
                        tracing::error!(error = %err, "failed to encode event");
                        continue;
                    }
                },
                None => {
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }
            },
            _ = ticker.tick() => Message::Ping(Bytes::new()),
        };

        if sender.send(frame).await.is_err() {
            break;
        }
    }
}
