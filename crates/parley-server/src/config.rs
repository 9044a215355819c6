//! Server configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the server can start with zero
//! configuration for local development.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

use parley_shared::constants::{DEFAULT_HTTP_PORT, DEFAULT_RECENT_MESSAGES};
use parley_shared::MessageKind;

const MIB: usize = 1024 * 1024;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address for the REST + WebSocket listener.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:8080`
    pub http_addr: SocketAddr,

    /// SQLite database file.
    /// Env: `DATABASE_PATH`
    /// Default: `./parley.db`
    pub database_path: PathBuf,

    /// Root directory of the filesystem media store.
    /// Env: `MEDIA_STORAGE_PATH`
    /// Default: `./media`
    pub media_storage_path: PathBuf,

    /// URL prefix written into media message content.
    /// Env: `MEDIA_PUBLIC_URL`
    /// Default: `/media`
    pub media_public_url: String,

    /// Webhook receiving push notifications as JSON. Unset means push
    /// notifications are only logged.
    /// Env: `PUSH_WEBHOOK_URL`
    pub push_webhook_url: Option<String>,

    /// Per-kind upload limits in bytes.
    /// Env: `MAX_IMAGE_BYTES`, `MAX_VIDEO_BYTES`, `MAX_AUDIO_BYTES`, `MAX_FILE_BYTES`
    pub media_limits: MediaLimits,

    /// Maximum number of files in a single media message.
    /// Env: `MAX_MEDIA_PER_MESSAGE`
    /// Default: `10`
    pub max_media_per_message: usize,

    /// Default number of recent messages attached to a conversation summary.
    /// Env: `RECENT_MESSAGES`
    /// Default: `10`
    pub recent_messages: u32,

    /// Per-IP REST token bucket.
    /// Env: `RATE_LIMIT_PER_SEC`, `RATE_LIMIT_BURST`
    pub http_rate: RateSettings,

    /// Per-user bucket for inbound `new-message` events.
    /// Env: `SOCKET_RATE_PER_SEC`, `SOCKET_RATE_BURST`
    pub socket_rate: RateSettings,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateSettings {
    pub per_sec: f64,
    pub burst: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaLimits {
    pub image: usize,
    pub video: usize,
    pub audio: usize,
    pub file: usize,
}

impl MediaLimits {
    /// Upload limit for `kind`. Non-media kinds cannot be uploaded.
    pub fn for_kind(&self, kind: MessageKind) -> usize {
        match kind {
            MessageKind::Image => self.image,
            MessageKind::Video => self.video,
            MessageKind::Audio => self.audio,
            MessageKind::File => self.file,
            MessageKind::Text | MessageKind::Label => 0,
        }
    }

    /// The largest single-file limit, used to size the request body cap.
    pub fn largest(&self) -> usize {
        self.image.max(self.video).max(self.audio).max(self.file)
    }
}

impl Default for MediaLimits {
    fn default() -> Self {
        Self {
            image: 10 * MIB,
            video: 50 * MIB,
            audio: 20 * MIB,
            file: 10 * MIB,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], DEFAULT_HTTP_PORT).into(),
            database_path: PathBuf::from("./parley.db"),
            media_storage_path: PathBuf::from("./media"),
            media_public_url: "/media".to_string(),
            push_webhook_url: None,
            media_limits: MediaLimits::default(),
            max_media_per_message: 10,
            recent_messages: DEFAULT_RECENT_MESSAGES,
            http_rate: RateSettings {
                per_sec: 10.0,
                burst: 30.0,
            },
            socket_rate: RateSettings {
                per_sec: 5.0,
                burst: 20.0,
            },
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup.
    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        parse_into(&lookup, "HTTP_ADDR", &mut config.http_addr);

        if let Some(path) = lookup("DATABASE_PATH") {
            config.database_path = PathBuf::from(path);
        }
        if let Some(path) = lookup("MEDIA_STORAGE_PATH") {
            config.media_storage_path = PathBuf::from(path);
        }
        if let Some(url) = lookup("MEDIA_PUBLIC_URL") {
            config.media_public_url = url.trim_end_matches('/').to_string();
        }
        if let Some(url) = lookup("PUSH_WEBHOOK_URL").filter(|u| !u.is_empty()) {
            config.push_webhook_url = Some(url);
        }

        parse_into(&lookup, "MAX_IMAGE_BYTES", &mut config.media_limits.image);
        parse_into(&lookup, "MAX_VIDEO_BYTES", &mut config.media_limits.video);
        parse_into(&lookup, "MAX_AUDIO_BYTES", &mut config.media_limits.audio);
        parse_into(&lookup, "MAX_FILE_BYTES", &mut config.media_limits.file);
        parse_into(&lookup, "MAX_MEDIA_PER_MESSAGE", &mut config.max_media_per_message);
        parse_into(&lookup, "RECENT_MESSAGES", &mut config.recent_messages);

        parse_into(&lookup, "RATE_LIMIT_PER_SEC", &mut config.http_rate.per_sec);
        parse_into(&lookup, "RATE_LIMIT_BURST", &mut config.http_rate.burst);
        parse_into(&lookup, "SOCKET_RATE_PER_SEC", &mut config.socket_rate.per_sec);
        parse_into(&lookup, "SOCKET_RATE_BURST", &mut config.socket_rate.burst);

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter,
        // so we do not store it here.

        config
    }
}

/// Overwrite `slot` with the parsed value of `key`, keeping the default
/// when the variable is unset or invalid.
fn parse_into<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T) {
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.trim().parse::<T>() {
        Ok(value) => *slot = value,
        Err(_) => tracing::warn!(key, value = %raw, "Invalid configuration value, using default"),
    }
}
