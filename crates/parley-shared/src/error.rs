use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SharedError {
    #[error("Invalid identifier: {0}")]
    InvalidId(String),

    #[error("A conversation needs two distinct participants")]
    SameParticipant,

    #[error("Unknown message type: {0}")]
    UnknownMessageKind(String),

    #[error("Malformed event: {0}")]
    MalformedFrame(String),
}
