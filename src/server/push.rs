//! Push endpoints
//!
//! `GET /ws` upgrades to a WebSocket and `GET /api/events` opens a
//! Server-Sent Events stream. Both carry the same JSON messages; an SSE
//! event is named after the message's `type`. The `role` query parameter
//! (`driver`, `participant` or `viewer`, default `viewer`) registers the
//! connection under that role. Incoming WebSocket frames are ignored.

use std::{convert::Infallible, sync::Arc};

use axum::{
    extract::{
        Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::{
        IntoResponse,
        sse::{Event, KeepAlive, Sse},
    },
};
use futures::{SinkExt, Stream, StreamExt, stream};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::AppState;
use crate::{
    PushMessage,
    broadcast::{ConnectionId, Role},
    constants::push::CLIENT_BUFFER,
    engine::QuizEngine,
    session::ChannelTunnel,
};

/// Query of both push endpoints
#[derive(Debug, Deserialize)]
pub struct RoleQuery {
    #[serde(default = "default_role")]
    role: Role,
}

fn default_role() -> Role {
    Role::Viewer
}

/// Removes the connection from the registry when the client goes away
///
/// A rejected connection has no id and its receiver is already closed, so
/// both handlers end on their own.
struct Subscription {
    engine: Arc<QuizEngine>,
    id: Option<ConnectionId>,
}

impl Subscription {
    async fn open(engine: Arc<QuizEngine>, role: Role) -> (Self, mpsc::Receiver<PushMessage>) {
        let (tunnel, receiver) = ChannelTunnel::new(CLIENT_BUFFER);
        let id = engine.connect(role, tunnel).await;
        (Self { engine, id }, receiver)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(id) = self.id {
            self.engine.broadcaster().disconnect(id);
        }
    }
}

/// WebSocket upgrade handler: `GET /ws`
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<RoleQuery>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state.engine, query.role))
}

async fn handle_socket(socket: WebSocket, engine: Arc<QuizEngine>, role: Role) {
    let (subscription, mut messages) = Subscription::open(engine, role).await;
    let (mut sender, mut receiver) = socket.split();

    let mut send_task = tokio::spawn(async move {
        while let Some(message) = messages.recv().await {
            if sender
                .send(Message::Text(message.to_message().into()))
                .await
                .is_err()
            {
                break;
            }
        }
    });

    let mut recv_task = tokio::spawn(async move {
        while let Some(frame) = receiver.next().await {
            match frame {
                Ok(Message::Close(_)) => break,
                Err(e) => {
                    warn!(error = %e, "websocket error");
                    break;
                }
                Ok(_) => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    drop(subscription);
    debug!(?role, "websocket client disconnected");
}

/// SSE handler: `GET /api/events`
pub async fn sse_handler(
    Query(query): Query<RoleQuery>,
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (subscription, messages) = Subscription::open(state.engine, query.role).await;

    let events = stream::unfold(
        (subscription, messages),
        |(subscription, mut messages)| async move {
            let message = messages.recv().await?;
            let event = Event::default()
                .event(message.kind())
                .data(message.to_message());
            Some((Ok(event), (subscription, messages)))
        },
    );

    Sse::new(events).keep_alive(KeepAlive::default())
}
