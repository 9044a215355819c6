//! Real-time channel.
//!
//! One WebSocket per client connection, authenticated before the upgrade.
//! Inbound frames are [`ClientEvent`]s; outbound traffic comes from the
//! connection's [`EventHub`] stream. A failing handler answers with an
//! `error` event on the originating connection only.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, info, warn};

use parley_shared::i18n::Lang;
use parley_shared::protocol::{ClientEvent, ServerEvent, TypingNotice};
use parley_shared::{ConversationId, UserId};
use parley_store::User;

use crate::api::AppState;
use crate::auth::{token_from_headers, MSG_INVALID_TOKEN};
use crate::error::{request_lang, ServerError};
use crate::hub::{ConnId, EventStream};
use crate::send::MSG_TARGET_REQUIRED;

pub const MSG_TOO_MANY_MESSAGES: &str = "Too many messages, slow down";

#[derive(Debug, Deserialize)]
pub struct SocketQuery {
    token: Option<String>,
}

/// `GET /ws`: verify the session, then upgrade.
pub async fn ws_handler(
    State(state): State<AppState>,
    Query(query): Query<SocketQuery>,
    headers: HeaderMap,
    upgrade: Result<WebSocketUpgrade, axum::extract::ws::rejection::WebSocketUpgradeRejection>,
) -> Result<Response, ServerError> {
    let token = query
        .token
        .as_deref()
        .or_else(|| token_from_headers(&headers))
        .ok_or_else(|| ServerError::Unauthorized(MSG_INVALID_TOKEN.to_string()))?;
    let user = state.sessions.verify(token).await?;
    let lang = request_lang(&headers);

    let upgrade = match upgrade {
        Ok(upgrade) => upgrade,
        Err(rejection) => return Ok(rejection.into_response()),
    };
    Ok(upgrade.on_upgrade(move |socket| handle_socket(socket, state, user, lang)))
}

async fn handle_socket(socket: WebSocket, state: AppState, user: User, lang: Lang) {
    let (session, mut events) = SocketSession::open(state, user, lang).await;
    let (mut ws_tx, mut ws_rx) = socket.split();

    let mut send_task = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let json = match serde_json::to_string(&event) {
                Ok(json) => json,
                Err(e) => {
                    warn!(event = event.name(), error = %e, "failed to encode event");
                    continue;
                }
            };
            if ws_tx.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
    });

    let reader = session.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_rx.next().await {
            match msg {
                Message::Text(text) => reader.handle_frame(&text).await,
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    session.close().await;
}

/// Per-connection state and event handling, independent of the socket so
/// it can be driven directly.
#[derive(Clone)]
pub struct SocketSession {
    state: AppState,
    user: User,
    conn: ConnId,
    lang: Lang,
}

impl SocketSession {
    /// Register the connection, deliver pending messages and announce the
    /// user online.
    pub async fn open(
        state: AppState,
        user: User,
        lang: Lang,
    ) -> (Self, EventStream) {
        let (conn, events) = state.hub.register(user.id).await;
        let first = state.presence.connect(user.id).await;
        info!(user = %user.id, conn, first, "socket connected");

        if let Err(e) = state.coordinator.on_connect(user.id).await {
            warn!(user = %user.id, error = %e, "delivery on connect failed");
        }
        broadcast_online(&state).await;

        (
            Self {
                state,
                user,
                conn,
                lang,
            },
            events,
        )
    }

    pub fn user_id(&self) -> UserId {
        self.user.id
    }

    /// Handle one inbound text frame.
    pub async fn handle_frame(&self, text: &str) {
        let result = match ClientEvent::from_json(text) {
            Ok(event) => self.dispatch(event).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = result {
            debug!(user = %self.user.id, error = %e, "socket event rejected");
            self.state
                .hub
                .emit_to(self.user.id, self.conn, ServerEvent::Error(e.to_payload(self.lang)))
                .await;
        }
    }

    async fn dispatch(&self, event: ClientEvent) -> Result<(), ServerError> {
        let user = self.user.id;
        let coordinator = &self.state.coordinator;
        match event {
            ClientEvent::JoinChat(r) => coordinator.on_room_join(user, r.chat_id).await,
            ClientEvent::LeaveChat(r) => coordinator.on_room_leave(user, r.chat_id).await,
            ClientEvent::Typing(r) => self.relay_typing(r.chat_id, true).await,
            ClientEvent::StopTyping(r) => self.relay_typing(r.chat_id, false).await,
            ClientEvent::MessageDelivered(ack) => {
                coordinator.on_delivery_ack(user, ack.message_id).await
            }
            ClientEvent::NewMessage(message) => {
                if !self.state.socket_limiter.allow(user).await {
                    warn!(user = %user, "socket rate limit exceeded");
                    return Err(ServerError::Validation(MSG_TOO_MANY_MESSAGES.to_string()));
                }
                let target = message
                    .target()
                    .ok_or_else(|| ServerError::Validation(MSG_TARGET_REQUIRED.to_string()))?;
                self.state
                    .pipeline
                    .send_text(user, target, &message.content, message.kind)
                    .await
                    .map(|_| ())
            }
        }
    }

    async fn relay_typing(&self, chat: ConversationId, typing: bool) -> Result<(), ServerError> {
        let conversation = self.state.coordinator.authorize(self.user.id, chat).await?;
        let Some(other) = conversation.other(self.user.id) else {
            return Ok(());
        };
        let notice = TypingNotice {
            chat_id: chat,
            user_id: self.user.id,
            user_name: self.user.first_name.clone(),
        };
        let event = if typing {
            ServerEvent::Typing(notice)
        } else {
            ServerEvent::StopTyping(notice)
        };
        self.state.hub.emit(other, event).await;
        Ok(())
    }

    /// Tear down the connection. The last connection of a user takes them
    /// offline.
    pub async fn close(&self) {
        self.state.hub.unregister(self.user.id, self.conn).await;
        let last = self.state.presence.disconnect(self.user.id).await;
        info!(user = %self.user.id, conn = self.conn, last, "socket disconnected");
        if last {
            broadcast_online(&self.state).await;
        }
    }
}

async fn broadcast_online(state: &AppState) {
    let mut online: Vec<UserId> = state
        .presence
        .connected_user_ids()
        .await
        .into_iter()
        .collect();
    online.sort_by_key(UserId::as_key);
    state.hub.broadcast(ServerEvent::OnlineUsers(online)).await;
}
