use std::sync::Arc;

use axum::{
    extract::{DefaultBodyLimit, FromRef, Multipart, Path, Query, State},
    http::{header, HeaderMap, Method},
    middleware,
    response::IntoResponse,
    routing::{get, patch, post},
    Json, Router,
};
use chrono::Utc;
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use parley_shared::i18n::translate;
use parley_shared::protocol::SendTarget;
use parley_shared::views::{ConversationSummary, MessageView, Page};
use parley_shared::{ConversationId, UserId};
use parley_store::{conversations, ClearOutcome};

use crate::auth::{AuthUser, SessionVerifier, StoreSessionVerifier};
use crate::blocking::{BlockService, MSG_BLOCKED, MSG_UNBLOCKED};
use crate::config::ServerConfig;
use crate::db::Store;
use crate::delivery::DeliveryCoordinator;
use crate::error::{localize_errors, request_lang, ServerError};
use crate::hub::EventHub;
use crate::media::{content_type_for_key, MediaStorage};
use crate::presence::{InMemoryPresence, PresenceRegistry};
use crate::push::PushNotifier;
use crate::rate_limit::{rate_limit_middleware, RateLimiter};
use crate::send::{SendPipeline, Upload, MSG_TARGET_REQUIRED};
use crate::view::{HistoryQuery, ListQuery, ViewBuilder};
use crate::ws;

const MIB: usize = 1024 * 1024;
const MSG_CLEARED: &str = "Chat cleared successfully";

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub store: Store,
    pub sessions: Arc<dyn SessionVerifier>,
    pub presence: Arc<dyn PresenceRegistry>,
    pub hub: EventHub,
    pub coordinator: DeliveryCoordinator,
    pub views: ViewBuilder,
    pub pipeline: SendPipeline,
    pub blocking: BlockService,
    pub media: Arc<dyn MediaStorage>,
    pub rate_limiter: RateLimiter,
    pub socket_limiter: RateLimiter<UserId>,
}

impl AppState {
    /// Wire every service over one store, one hub and in-process presence.
    pub fn new(
        config: ServerConfig,
        store: Store,
        media: Arc<dyn MediaStorage>,
        notifier: Arc<dyn PushNotifier>,
    ) -> Self {
        let presence: Arc<dyn PresenceRegistry> = Arc::new(InMemoryPresence::new());
        let hub = EventHub::new();
        let coordinator = DeliveryCoordinator::new(store.clone(), presence.clone(), hub.clone());
        let views = ViewBuilder::new(store.clone(), coordinator.clone(), config.recent_messages);
        let pipeline = SendPipeline::new(
            store.clone(),
            coordinator.clone(),
            media.clone(),
            notifier,
            config.media_limits,
            config.max_media_per_message,
            config.recent_messages,
        );

        Self {
            sessions: Arc::new(StoreSessionVerifier::new(store.clone())),
            blocking: BlockService::new(store.clone(), hub.clone()),
            rate_limiter: RateLimiter::new(config.http_rate),
            socket_limiter: RateLimiter::new(config.socket_rate),
            config: Arc::new(config),
            store,
            presence,
            hub,
            coordinator,
            views,
            pipeline,
            media,
        }
    }
}

impl FromRef<AppState> for Arc<dyn SessionVerifier> {
    fn from_ref(state: &AppState) -> Self {
        state.sessions.clone()
    }
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PATCH, Method::OPTIONS])
        .allow_headers(Any);

    let body_limit = state.config.media_limits.largest() * state.config.max_media_per_message + MIB;

    Router::new()
        .route("/health", get(health_check))
        .route("/chats", get(list_chats).post(send_media_message))
        .route("/chats/:id", get(get_chat))
        .route("/chats/:id/messages", get(chat_messages))
        .route("/chats/clear/:id", patch(clear_chat))
        .route("/actions/:id/block", post(block_user))
        .route("/actions/:id/unblock", post(unblock_user))
        .route("/media/:key", get(media_download))
        .route("/ws", get(ws::ws_handler))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(middleware::from_fn_with_state(
            state.rate_limiter.clone(),
            rate_limit_middleware,
        ))
        .layer(middleware::from_fn(localize_errors))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

/// `{"success": true, ...body}`
#[derive(Serialize)]
struct Success<T> {
    success: bool,
    #[serde(flatten)]
    body: T,
}

fn success<T: Serialize>(body: T) -> Json<Success<T>> {
    Json(Success {
        success: true,
        body,
    })
}

#[derive(Serialize)]
struct Data<T> {
    data: T,
}

#[derive(Serialize)]
struct Notice {
    message: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ClearResponse {
    message: String,
    chat_deleted: bool,
    messages_removed: usize,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn list_chats(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Query(query): Query<ListQuery>,
) -> Result<Json<Success<Page<ConversationSummary>>>, ServerError> {
    let page = state.views.list_conversations(user.id, query).await?;
    Ok(success(page))
}

#[derive(serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatQuery {
    no_of_messages: Option<u32>,
}

async fn get_chat(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(id): Path<String>,
    Query(query): Query<ChatQuery>,
) -> Result<Json<Success<Data<ConversationSummary>>>, ServerError> {
    let chat: ConversationId = id.parse()?;
    let summary = state
        .views
        .get_conversation(user.id, chat, query.no_of_messages)
        .await?;
    Ok(success(Data { data: summary }))
}

async fn chat_messages(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Success<Page<MessageView>>>, ServerError> {
    let chat: ConversationId = id.parse()?;
    let page = state.views.message_history(user.id, chat, query).await?;
    Ok(success(page))
}

/// Multipart form: `chatId` or `receiverId`, plus one or more `media`
/// files.
async fn send_media_message(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    mut multipart: Multipart,
) -> Result<Json<Success<Data<Vec<MessageView>>>>, ServerError> {
    let mut chat_id = None;
    let mut receiver_id = None;
    let mut uploads = Vec::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ServerError::Validation(format!("Multipart error: {e}")))?
    {
        let name = field.name().unwrap_or("").to_string();
        match name.as_str() {
            "chatId" => {
                let text = field.text().await.map_err(|_| ServerError::invalid_input())?;
                if !text.trim().is_empty() {
                    chat_id = Some(text.parse::<ConversationId>()?);
                }
            }
            "receiverId" => {
                let text = field.text().await.map_err(|_| ServerError::invalid_input())?;
                if !text.trim().is_empty() {
                    receiver_id = Some(text.parse::<UserId>()?);
                }
            }
            "media" => {
                let file_name = field.file_name().unwrap_or("upload").to_string();
                let content_type = field
                    .content_type()
                    .unwrap_or("application/octet-stream")
                    .to_string();
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| ServerError::Validation(format!("Failed to read field: {e}")))?;
                uploads.push(Upload {
                    file_name,
                    content_type,
                    data: data.to_vec(),
                });
            }
            _ => {}
        }
    }

    let target = SendTarget::from_parts(chat_id, receiver_id)
        .ok_or_else(|| ServerError::Validation(MSG_TARGET_REQUIRED.to_string()))?;
    let outcome = state.pipeline.send_media(user.id, target, uploads).await?;

    info!(
        user = %user.id,
        chat = %outcome.conversation.id,
        count = outcome.messages.len(),
        "media message sent via API"
    );
    Ok(success(Data {
        data: outcome.messages.iter().map(|m| m.view_for(user.id)).collect(),
    }))
}

async fn clear_chat(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Success<ClearResponse>>, ServerError> {
    let chat: ConversationId = id.parse()?;
    let requester = user.id;
    let outcome = state
        .store
        .transaction(move |tx| Ok(conversations::clear(tx, chat, requester, Utc::now())?))
        .await?;

    info!(user = %requester, chat = %chat, ?outcome, "chat cleared");
    let (chat_deleted, messages_removed) = match outcome {
        ClearOutcome::Deleted { removed_messages } => (true, removed_messages),
        ClearOutcome::Purged { removed } => (false, removed),
        ClearOutcome::Cleared { purged } => (false, purged),
        ClearOutcome::Bumped => (false, 0),
    };
    Ok(success(ClearResponse {
        message: translate(MSG_CLEARED, request_lang(&headers)),
        chat_deleted,
        messages_removed,
    }))
}

async fn block_user(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Success<Notice>>, ServerError> {
    let target: UserId = id.parse()?;
    state.blocking.block(user.id, target).await?;
    Ok(success(Notice {
        message: translate(MSG_BLOCKED, request_lang(&headers)),
    }))
}

async fn unblock_user(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Success<Notice>>, ServerError> {
    let target: UserId = id.parse()?;
    state.blocking.unblock(user.id, target).await?;
    Ok(success(Notice {
        message: translate(MSG_UNBLOCKED, request_lang(&headers)),
    }))
}

async fn media_download(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<impl IntoResponse, ServerError> {
    let data = state.media.get(&key).await?;
    Ok(([(header::CONTENT_TYPE, content_type_for_key(&key))], data))
}

pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting HTTP API server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .await?;

    Ok(())
}
