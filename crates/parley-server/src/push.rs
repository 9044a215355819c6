//! Push-notification boundary.
//!
//! The engine decides *whether* and *what* to push; transport is behind
//! [`PushNotifier`]. Dispatch is detached from the request that triggered it
//! and failures are only logged.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use tracing::{debug, info, warn};

use parley_shared::constants::PUSH_CASE_CHAT;
use parley_shared::i18n::{translate, Lang};
use parley_shared::{ConversationId, MessageKind};
use parley_store::{Message, User};

use crate::error::ServerError;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PushNotification {
    /// Device token of the recipient.
    pub token: String,
    pub title: String,
    pub body: String,
    pub case: String,
    /// Conversation id the notification opens.
    pub info: String,
    pub icon: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

impl PushNotification {
    /// Build the notification for a batch of messages from `sender` to
    /// `recipient`. `None` when the recipient has no device token or the
    /// batch is empty.
    pub fn for_messages(
        sender: &User,
        recipient: &User,
        chat: ConversationId,
        messages: &[Message],
    ) -> Option<Self> {
        let token = recipient.notification_token.clone().filter(|t| !t.is_empty())?;
        let first = messages.first()?;
        let lang = recipient.lang.parse().unwrap_or(Lang::En);

        let body = if messages.len() == 1 {
            match first.kind {
                MessageKind::Text | MessageKind::Label => first.content.clone(),
                kind => kind.as_str().to_string(),
            }
        } else if messages.iter().all(|m| m.kind == first.kind) {
            format!("{} {}s", messages.len(), first.kind)
        } else {
            format!("{} attachments", messages.len())
        };

        let sender_name = if sender.first_name.is_empty() {
            sender.full_name()
        } else {
            sender.first_name.clone()
        };

        Some(Self {
            token,
            title: format!("{} {sender_name}", translate("New message from", lang)),
            body,
            case: PUSH_CASE_CHAT.to_string(),
            info: chat.to_string(),
            icon: sender.profile_picture.clone(),
            image: messages
                .iter()
                .find(|m| m.kind == MessageKind::Image)
                .map(|m| m.content.clone()),
        })
    }
}

#[async_trait]
pub trait PushNotifier: Send + Sync {
    async fn send(&self, notification: PushNotification) -> Result<(), ServerError>;
}

/// Fire-and-forget delivery on a background task.
pub fn dispatch(notifier: Arc<dyn PushNotifier>, notification: PushNotification) {
    tokio::spawn(async move {
        let info = notification.info.clone();
        if let Err(e) = notifier.send(notification).await {
            warn!(chat = %info, error = %e, "push notification failed");
        }
    });
}

/// Notifier used when no transport is configured.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl PushNotifier for LogNotifier {
    async fn send(&self, notification: PushNotification) -> Result<(), ServerError> {
        info!(
            chat = %notification.info,
            title = %notification.title,
            "push notification (no transport configured)"
        );
        Ok(())
    }
}

/// POSTs each notification as JSON to a webhook.
#[derive(Clone)]
pub struct WebhookNotifier {
    http: Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Result<Self, ServerError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| ServerError::Push(e.to_string()))?;
        Ok(Self {
            http,
            url: url.into(),
        })
    }
}

#[async_trait]
impl PushNotifier for WebhookNotifier {
    async fn send(&self, notification: PushNotification) -> Result<(), ServerError> {
        let response = self
            .http
            .post(&self.url)
            .json(&notification)
            .send()
            .await
            .map_err(|e| ServerError::Push(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ServerError::Push(format!("webhook answered {status}")));
        }
        debug!(chat = %notification.info, "push notification delivered to webhook");
        Ok(())
    }
}
