//! # parley-shared
//!
//! Types shared between the Parley store and server: identifiers, the
//! canonical participant pair, message kinds, the real-time event protocol
//! and the view payloads handed to clients.

pub mod constants;
pub mod error;
pub mod i18n;
pub mod protocol;
pub mod types;
pub mod views;

pub use error::SharedError;
pub use types::{ConversationId, MessageId, MessageKind, ParticipantPair, UserId};
