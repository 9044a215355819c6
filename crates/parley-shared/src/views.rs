//! Payloads handed to clients over REST and the real-time channel.
//!
//! All structs serialize in camelCase.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{ConversationId, MessageId, MessageKind, UserId};

/// A message as seen by one particular viewer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MessageView {
    pub id: MessageId,
    pub chat: Option<ConversationId>,
    pub content: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub is_delivered: bool,
    pub is_read: bool,
    pub is_my_msg: bool,
    pub created_at: DateTime<Utc>,
}

/// Public profile of the other participant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CounterpartProfile {
    pub id: UserId,
    pub full_name: String,
    pub profile_picture: String,
    pub is_active: bool,
}

/// One row of the "my conversations" list, also the `new-chat` payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    pub id: ConversationId,
    pub to: CounterpartProfile,
    /// Either side has blocked the other.
    pub blocked: bool,
    pub blocked_by_me: bool,
    pub blocked_by_other: bool,
    pub unread_messages_count: u64,
    /// Most recent visible messages, newest first.
    pub messages: Vec<MessageView>,
    pub last_message_created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    pub total_results: u64,
    pub total_pages: u64,
    pub page: u32,
    pub limit: u32,
}

impl Pagination {
    pub fn new(total_results: u64, page: u32, limit: u32) -> Self {
        let limit = limit.max(1);
        Self {
            total_results,
            total_pages: total_results.div_ceil(u64::from(limit)),
            page,
            limit,
        }
    }

    /// Row offset of the first item on this page (pages are 1-based).
    pub fn offset(&self) -> u64 {
        u64::from(self.page.saturating_sub(1)) * u64::from(self.limit)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    pub pagination: Pagination,
    pub data: Vec<T>,
}
