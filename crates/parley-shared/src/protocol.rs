use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SharedError;
use crate::types::{ConversationId, MessageId, MessageKind, UserId};
use crate::views::{ConversationSummary, MessageView};

/// Events a connected client sends to the server.
///
/// Framed as JSON text: `{"event": "join-chat", "data": {"chatId": "..."}}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientEvent {
    JoinChat(ChatRef),
    LeaveChat(ChatRef),
    Typing(ChatRef),
    StopTyping(ChatRef),
    NewMessage(NewMessage),
    MessageDelivered(DeliveryAck),
}

/// Events the server pushes to a user's connections.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent {
    Message(MessageView),
    NewChat(ConversationSummary),
    MessagesSeen(MessagesSeen),
    MessageDelivered(MessageDelivered),
    Typing(TypingNotice),
    StopTyping(TypingNotice),
    OnlineUsers(Vec<UserId>),
    Error(ErrorPayload),
}

impl ServerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Message(_) => "message",
            Self::NewChat(_) => "new-chat",
            Self::MessagesSeen(_) => "messages-seen",
            Self::MessageDelivered(_) => "message-delivered",
            Self::Typing(_) => "typing",
            Self::StopTyping(_) => "stop-typing",
            Self::OnlineUsers(_) => "online-users",
            Self::Error(_) => "error",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChatRef {
    pub chat_id: ConversationId,
}

/// A text message sent over the socket. Exactly one of `chat_id` and
/// `other_user_id` must be present.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NewMessage {
    #[serde(default)]
    pub chat_id: Option<ConversationId>,
    #[serde(default)]
    pub other_user_id: Option<UserId>,
    pub content: String,
    #[serde(rename = "type", default)]
    pub kind: MessageKind,
}

/// Where a new message goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendTarget {
    Conversation(ConversationId),
    User(UserId),
}

impl SendTarget {
    /// Resolve the mutually exclusive `chatId` / `otherUserId` pair.
    pub fn from_parts(
        chat_id: Option<ConversationId>,
        other_user_id: Option<UserId>,
    ) -> Option<Self> {
        match (chat_id, other_user_id) {
            (Some(chat), None) => Some(Self::Conversation(chat)),
            (None, Some(user)) => Some(Self::User(user)),
            _ => None,
        }
    }
}

impl NewMessage {
    pub fn target(&self) -> Option<SendTarget> {
        SendTarget::from_parts(self.chat_id, self.other_user_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryAck {
    pub message_id: MessageId,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MessagesSeen {
    pub chat_id: ConversationId,
    pub seen_time: DateTime<Utc>,
}

/// Delivery watermark notice sent to the original sender.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MessageDelivered {
    pub chat_id: ConversationId,
    pub message_id: MessageId,
    pub message_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TypingNotice {
    pub chat_id: ConversationId,
    pub user_id: UserId,
    pub user_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub kind: String,
    pub message: String,
}

impl ClientEvent {
    /// Parse one inbound text frame.
    pub fn from_json(text: &str) -> Result<Self, SharedError> {
        serde_json::from_str(text).map_err(|e| SharedError::MalformedFrame(e.to_string()))
    }
}
