use axum::extract::Request;
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

use parley_shared::i18n::{translate, Lang};
use parley_shared::protocol::ErrorPayload;
use parley_shared::SharedError;
use parley_store::StoreError;

pub const MSG_CHAT_NOT_FOUND: &str = "Chat not found";
pub const MSG_USER_NOT_FOUND: &str = "User not found";
pub const MSG_NOT_PARTICIPANT: &str = "You are not a participant in this chat";
pub const MSG_INVALID_INPUT: &str = "Invalid Input Data";
pub const MSG_SOMETHING_WRONG: &str = "Something went wrong";

/// Machine-readable error class carried in every failure response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    Unauthorized,
    Forbidden,
    Validation,
    TransientIo,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::Unauthorized => "unauthorized",
            Self::Forbidden => "forbidden",
            Self::Validation => "validation",
            Self::TransientIo => "transient_io",
            Self::Internal => "internal",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::Validation => StatusCode::BAD_REQUEST,
            Self::TransientIo => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    Validation(String),

    #[error("Media too large: {size} bytes (max {max})")]
    MediaTooLarge { size: usize, max: usize },

    #[error("Media storage error: {0}")]
    MediaStorage(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Push notification error: {0}")]
    Push(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ServerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Unauthorized(_) => ErrorKind::Unauthorized,
            Self::Forbidden(_) => ErrorKind::Forbidden,
            Self::Validation(_) | Self::MediaTooLarge { .. } => ErrorKind::Validation,
            Self::MediaStorage(_) | Self::Storage(_) | Self::Push(_) => ErrorKind::TransientIo,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// English text safe to show to the caller. Internal details stay in
    /// the logs.
    pub fn public_message(&self) -> String {
        match self {
            Self::NotFound(m) | Self::Unauthorized(m) | Self::Forbidden(m) | Self::Validation(m) => {
                m.clone()
            }
            Self::MediaTooLarge { .. } => self.to_string(),
            Self::MediaStorage(_) | Self::Storage(_) | Self::Push(_) | Self::Internal(_) => {
                MSG_SOMETHING_WRONG.to_string()
            }
        }
    }

    /// Payload of the real-time `error` event.
    pub fn to_payload(&self, lang: Lang) -> ErrorPayload {
        ErrorPayload {
            kind: self.kind().as_str().to_string(),
            message: translate(&self.public_message(), lang),
        }
    }

    pub fn not_participant() -> Self {
        Self::Unauthorized(MSG_NOT_PARTICIPANT.to_string())
    }

    pub fn invalid_input() -> Self {
        Self::Validation(MSG_INVALID_INPUT.to_string())
    }
}

impl From<StoreError> for ServerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { entity, .. } => Self::NotFound(
                match entity {
                    "conversation" => MSG_CHAT_NOT_FOUND,
                    "user" => MSG_USER_NOT_FOUND,
                    _ => "Message not found",
                }
                .to_string(),
            ),
            StoreError::NotParticipant { .. } => Self::not_participant(),
            StoreError::Shared(e) => e.into(),
            StoreError::Sqlite(e) => Self::Storage(e.to_string()),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<SharedError> for ServerError {
    fn from(err: SharedError) -> Self {
        match err {
            SharedError::SameParticipant => Self::invalid_input(),
            other => Self::Validation(other.to_string()),
        }
    }
}

/// Error details attached to the response so [`localize_errors`] can
/// re-render the body in the caller's language.
#[derive(Debug, Clone)]
struct ErrorBody {
    kind: ErrorKind,
    message: String,
}

fn render(status: StatusCode, body: &ErrorBody, lang: Lang) -> Response {
    let json = serde_json::json!({
        "success": false,
        "kind": body.kind,
        "message": translate(&body.message, lang),
    });
    (status, axum::Json(json)).into_response()
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let kind = self.kind();
        if kind == ErrorKind::Internal || kind == ErrorKind::TransientIo {
            tracing::error!(error = %self, "request failed");
        }

        let body = ErrorBody {
            kind,
            message: self.public_message(),
        };
        let mut response = render(kind.status(), &body, Lang::En);
        response.extensions_mut().insert(body);
        response
    }
}

/// Read the `lang` header of the request.
pub fn request_lang(headers: &HeaderMap) -> Lang {
    Lang::from_header(headers.get("lang").and_then(|v| v.to_str().ok()))
}

/// Middleware translating error bodies into the language named by the
/// request's `lang` header.
pub async fn localize_errors(req: Request, next: Next) -> Response {
    let lang = request_lang(req.headers());
    let response = next.run(req).await;
    if lang == Lang::En {
        return response;
    }

    match response.extensions().get::<ErrorBody>().cloned() {
        Some(body) => render(response.status(), &body, lang),
        None => response,
    }
}
