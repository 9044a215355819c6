//! Domain model structs persisted in the SQLite database.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use parley_shared::views::{CounterpartProfile, MessageView};
use parley_shared::{ConversationId, MessageId, MessageKind, ParticipantPair, UserId};

// ---------------------------------------------------------------------------
// User
// ---------------------------------------------------------------------------

/// A user account as mirrored from the account service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub id: UserId,
    pub first_name: String,
    pub last_name: String,
    /// URL of the profile picture, empty when unset.
    pub profile_picture: String,
    /// Deactivated accounts are hidden from conversation listings.
    pub is_active: bool,
    /// Administratively blocked by the support team.
    pub is_suspended: bool,
    /// Preferred language for notifications (`en`, `ar`).
    pub lang: String,
    /// Externally-issued session credential.
    pub session_token: Option<String>,
    pub session_expires_at: Option<DateTime<Utc>>,
    /// Device token for push notifications.
    pub notification_token: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn new(first_name: impl Into<String>, last_name: impl Into<String>) -> Self {
        Self {
            id: UserId::new(),
            first_name: first_name.into(),
            last_name: last_name.into(),
            profile_picture: String::new(),
            is_active: true,
            is_suspended: false,
            lang: "en".to_string(),
            session_token: None,
            session_expires_at: None,
            notification_token: None,
            created_at: Utc::now(),
        }
    }

    pub fn full_name(&self) -> String {
        match (self.first_name.is_empty(), self.last_name.is_empty()) {
            (false, false) => format!("{} {}", self.first_name, self.last_name),
            (false, true) => self.first_name.clone(),
            _ => self.last_name.clone(),
        }
    }

    pub fn profile(&self) -> CounterpartProfile {
        CounterpartProfile {
            id: self.id,
            full_name: self.full_name(),
            profile_picture: self.profile_picture.clone(),
            is_active: self.is_active,
        }
    }
}

// ---------------------------------------------------------------------------
// Conversation
// ---------------------------------------------------------------------------

/// A durable two-party conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conversation {
    pub id: ConversationId,
    pub participants: ParticipantPair,
    /// The participant who last cleared the conversation, if any.
    pub cleared_by: Option<UserId>,
    /// Visibility epoch boundary for `cleared_by`.
    pub cleared_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Conversation {
    pub fn new(participants: ParticipantPair, created_at: DateTime<Utc>) -> Self {
        Self {
            id: ConversationId::new(),
            participants,
            cleared_by: None,
            cleared_at: None,
            created_at,
        }
    }

    pub fn has_participant(&self, user: UserId) -> bool {
        self.participants.contains(user)
    }

    /// The counterpart of `user`, or `None` when `user` is not a participant.
    pub fn other(&self, user: UserId) -> Option<UserId> {
        self.participants.other(user)
    }

    /// Lower visibility bound for `viewer`: messages at or before this
    /// instant are hidden from them.
    pub fn visible_after(&self, viewer: UserId) -> Option<DateTime<Utc>> {
        match (self.cleared_by, self.cleared_at) {
            (Some(by), Some(at)) if by == viewer => Some(at),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// A single chat message. Immutable apart from the two delivery flags.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: Option<ConversationId>,
    /// Absent for system label messages.
    pub sender_id: Option<UserId>,
    /// Text, or the public URL for media kinds.
    pub content: String,
    pub kind: MessageKind,
    pub is_delivered: bool,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn new(
        conversation_id: ConversationId,
        sender_id: UserId,
        content: impl Into<String>,
        kind: MessageKind,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: MessageId::new(),
            conversation_id: Some(conversation_id),
            sender_id: Some(sender_id),
            content: content.into(),
            kind,
            is_delivered: false,
            is_read: false,
            created_at,
        }
    }

    /// A system notice with no sender.
    pub fn label(
        conversation_id: ConversationId,
        content: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: MessageId::new(),
            conversation_id: Some(conversation_id),
            sender_id: None,
            content: content.into(),
            kind: MessageKind::Label,
            is_delivered: false,
            is_read: false,
            created_at,
        }
    }

    /// Render this message for `viewer`.
    pub fn view_for(&self, viewer: UserId) -> MessageView {
        MessageView {
            id: self.id,
            chat: self.conversation_id,
            content: self.content.clone(),
            kind: self.kind,
            is_delivered: self.is_delivered,
            is_read: self.is_read,
            is_my_msg: self.sender_id == Some(viewer),
            created_at: self.created_at,
        }
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// What [`crate::conversations::clear`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClearOutcome {
    /// Requester had cleared before and nothing older remained: only the
    /// epoch moved.
    Bumped,
    /// Requester had cleared before: messages older than the previous epoch
    /// were purged and the epoch moved.
    Purged { removed: usize },
    /// No messages since the previous clear: the conversation is gone.
    Deleted { removed_messages: usize },
    /// First clear by the requester.
    Cleared { purged: usize },
}

/// Both directions of the block relation between two users.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockStatus {
    /// The viewer has blocked the counterpart.
    pub by_me: bool,
    /// The counterpart has blocked the viewer.
    pub by_other: bool,
}

impl BlockStatus {
    /// The effective (symmetric) block.
    pub fn blocked(&self) -> bool {
        self.by_me || self.by_other
    }
}
