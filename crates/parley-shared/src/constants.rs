/// Application name
pub const APP_NAME: &str = "Parley";

/// Default HTTP API port (server)
pub const DEFAULT_HTTP_PORT: u16 = 8080;

/// Default number of conversations per listing page
pub const DEFAULT_PAGE_LIMIT: u32 = 10;

/// Default page size for message history
pub const DEFAULT_HISTORY_LIMIT: u32 = 20;

/// Upper bound for any client-supplied page size
pub const MAX_PAGE_LIMIT: u32 = 100;

/// Default number of recent messages attached to a conversation summary
pub const DEFAULT_RECENT_MESSAGES: u32 = 10;

/// Maximum text message length in characters
pub const MAX_TEXT_LENGTH: usize = 4096;

/// Label contents written when a block relation changes
pub const LABEL_BLOCKED: &str = "blocked";
pub const LABEL_UNBLOCKED: &str = "unblocked";

/// Push notification case tag for chat messages
pub const PUSH_CASE_CHAT: &str = "chat";
