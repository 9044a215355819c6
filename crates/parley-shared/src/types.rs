use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::SharedError;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Stable textual form used for storage, ordering and routing.
            pub fn as_key(&self) -> String {
                self.0.hyphenated().to_string()
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0.hyphenated())
            }
        }

        impl FromStr for $name {
            type Err = SharedError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s.trim())
                    .map(Self)
                    .map_err(|_| SharedError::InvalidId(s.to_string()))
            }
        }
    };
}

uuid_id!(
    /// Opaque account identity, issued by the external account service.
    UserId
);

uuid_id!(
    /// Durable two-party conversation ("chat") identifier.
    ConversationId
);

uuid_id!(MessageId);

// ---------------------------------------------------------------------------
// Participant pair
// ---------------------------------------------------------------------------

/// The two participants of a conversation in canonical order.
///
/// Ordering compares the stable string form of each id, so the pair built
/// from `(a, b)` and from `(b, a)` is identical and maps to the same
/// storage row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ParticipantPair {
    first: UserId,
    second: UserId,
}

impl ParticipantPair {
    pub fn new(a: UserId, b: UserId) -> Result<Self, SharedError> {
        match canonical_order(&a, &b) {
            Ordering::Less => Ok(Self { first: a, second: b }),
            Ordering::Greater => Ok(Self { first: b, second: a }),
            Ordering::Equal => Err(SharedError::SameParticipant),
        }
    }

    pub fn first(&self) -> UserId {
        self.first
    }

    pub fn second(&self) -> UserId {
        self.second
    }

    pub fn contains(&self, user: UserId) -> bool {
        self.first == user || self.second == user
    }

    /// The counterpart of `user`, or `None` if `user` is not in the pair.
    pub fn other(&self, user: UserId) -> Option<UserId> {
        if self.first == user {
            Some(self.second)
        } else if self.second == user {
            Some(self.first)
        } else {
            None
        }
    }

    pub fn as_array(&self) -> [UserId; 2] {
        [self.first, self.second]
    }
}

/// Deterministic order over two opaque identifiers.
pub fn canonical_order(a: &UserId, b: &UserId) -> Ordering {
    a.as_key().as_bytes().cmp(b.as_key().as_bytes())
}

// ---------------------------------------------------------------------------
// Message kind
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    #[default]
    Text,
    /// System notice (block/unblock). Carries no sender.
    Label,
    Image,
    Video,
    Audio,
    File,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Label => "label",
            Self::Image => "image",
            Self::Video => "video",
            Self::Audio => "audio",
            Self::File => "file",
        }
    }

    /// Classify an uploaded file by its MIME type.
    pub fn from_mime(mime: &str) -> Self {
        let mime = mime.to_ascii_lowercase();
        if mime.starts_with("image/") {
            Self::Image
        } else if mime.starts_with("video/") {
            Self::Video
        } else if mime.starts_with("audio/") {
            Self::Audio
        } else {
            Self::File
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageKind {
    type Err = SharedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "label" => Ok(Self::Label),
            "image" => Ok(Self::Image),
            "video" => Ok(Self::Video),
            "audio" | "voice" => Ok(Self::Audio),
            "file" => Ok(Self::File),
            _ => Err(SharedError::UnknownMessageKind(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pair_is_order_independent() {
        let a = UserId::new();
        let b = UserId::new();
        let ab = ParticipantPair::new(a, b).unwrap();
        let ba = ParticipantPair::new(b, a).unwrap();
        assert_eq!(ab, ba);
        assert!(ab.first().as_key() < ab.second().as_key());
    }

    #[test]
    fn pair_rejects_self_conversation() {
        let a = UserId::new();
        assert_eq!(ParticipantPair::new(a, a), Err(SharedError::SameParticipant));
    }

    #[test]
    fn pair_other_participant() {
        let a = UserId::new();
        let b = UserId::new();
        let pair = ParticipantPair::new(a, b).unwrap();
        assert_eq!(pair.other(a), Some(b));
        assert_eq!(pair.other(b), Some(a));
        assert_eq!(pair.other(UserId::new()), None);
    }

    #[test]
    fn kind_from_mime() {
        assert_eq!(MessageKind::from_mime("image/png"), MessageKind::Image);
        assert_eq!(MessageKind::from_mime("VIDEO/mp4"), MessageKind::Video);
        assert_eq!(MessageKind::from_mime("audio/ogg"), MessageKind::Audio);
        assert_eq!(MessageKind::from_mime("application/pdf"), MessageKind::File);
    }

    #[test]
    fn id_parse_rejects_garbage() {
        assert!("not-a-uuid".parse::<ConversationId>().is_err());
        let id = ConversationId::new();
        assert_eq!(id.to_string().parse::<ConversationId>().unwrap(), id);
    }
}
