//! Peer configuration.
//!
//! Both peers are configured through the environment, as befits processes
//! meant to run unattended next to a browser or on an egress box:
//!
//! | Variable             | Peer   | Default                          |
//! |----------------------|--------|----------------------------------|
//! | `BASE_URL`           | both   | `https://api.telegram.org/bot`   |
//! | `CLIENT_BOT_TOKEN`   | client | required                         |
//! | `SERVER_BOT_TOKEN`   | server | required                         |
//! | `CHAT_ID`            | client | required                         |
//! | `PROXY_BIND`         | client | `127.0.0.1:8888`                 |
//! | `TRANSPORT_PROFILE`  | both   | `text`                           |
//! | `CHATPIPE_READ_IDLE_SECS` | client | `30`                        |
//!
//! Missing required variables abort startup; the binaries turn the error
//! into a non-zero exit. The server peer needs no `CHAT_ID`: it answers
//! into whichever chat carried each stream's `CONNECT`.

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::pipe::{DEFAULT_HIGH_WATERMARK, DEFAULT_READ_IDLE};
use crate::reorder::DEFAULT_CAPACITY;

/// Default Bot API base URL.
pub const DEFAULT_BASE_URL: &str = "https://api.telegram.org/bot";

/// Chunk size for data frames under the document profile, where payloads
/// are not bound by the text frame limit.
pub const DOCUMENT_CHUNK: usize = 32 * 1024;

/// Default bind address for the local HTTP proxy.
pub const DEFAULT_PROXY_BIND: &str = "127.0.0.1:8888";

/// Errors loading configuration from the environment.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{name} environment variable is required")]
    MissingVar { name: &'static str },

    #[error("invalid value {value:?} for {name}: {reason}")]
    InvalidVar {
        name: &'static str,
        value: String,
        reason: String,
    },
}

/// How data frames travel through the chat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportProfile {
    /// Base64 payload inline in the frame text. The canonical profile.
    #[default]
    Text,
    /// Payload uploaded as a chat document, frame text in the caption.
    /// Fewer, larger messages; same sequence discipline.
    Document,
}

impl FromStr for TransportProfile {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "document" => Ok(Self::Document),
            other => Err(format!("unknown transport profile {other:?} (expected \"text\" or \"document\")")),
        }
    }
}

/// Tunable timeouts and capacities shared by both peers.
///
/// The defaults are the shipped behavior; tests shrink them to keep the
/// suites fast.
#[derive(Debug, Clone)]
pub struct Tuning {
    /// How long `open_stream` waits for the server's `OK`.
    pub connect_timeout: Duration,
    /// The server peer's budget for dialing the origin.
    pub dial_timeout: Duration,
    /// Pipe read-idle bound (see the `pipe` module).
    pub read_idle_timeout: Duration,
    /// Pipe buffered-byte high-watermark.
    pub high_watermark: usize,
    /// Reorder buffer cap, in parked frames.
    pub reorder_capacity: usize,
    /// Updates fetched per poll.
    pub poll_limit: u32,
    /// Long-poll timeout handed to the chat backend.
    pub poll_timeout: Duration,
    /// Cooperative yield between polls.
    pub poll_interval: Duration,
    /// Sleep after a failed poll before retrying.
    pub error_backoff: Duration,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            dial_timeout: Duration::from_secs(10),
            read_idle_timeout: DEFAULT_READ_IDLE,
            high_watermark: DEFAULT_HIGH_WATERMARK,
            reorder_capacity: DEFAULT_CAPACITY,
            poll_limit: 10,
            poll_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(50),
            error_backoff: Duration::from_secs(5),
        }
    }
}

/// Client peer configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub bot_token: String,
    pub chat_id: String,
    pub proxy_bind: String,
    pub profile: TransportProfile,
    pub tuning: Tuning,
}

impl ClientConfig {
    /// Loads the client configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&env_lookup)
    }

    fn from_lookup(lookup: &dyn Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut tuning = Tuning::default();
        if let Some(secs) = optional_parsed::<u64>(lookup, "CHATPIPE_READ_IDLE_SECS")? {
            tuning.read_idle_timeout = Duration::from_secs(secs);
        }
        Ok(Self {
            base_url: optional(lookup, "BASE_URL", DEFAULT_BASE_URL),
            bot_token: required(lookup, "CLIENT_BOT_TOKEN")?,
            chat_id: required(lookup, "CHAT_ID")?,
            proxy_bind: optional(lookup, "PROXY_BIND", DEFAULT_PROXY_BIND),
            profile: optional_parsed(lookup, "TRANSPORT_PROFILE")?.unwrap_or_default(),
            tuning,
        })
    }
}

/// Server peer configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub base_url: String,
    pub bot_token: String,
    pub profile: TransportProfile,
    pub tuning: Tuning,
}

impl ServerConfig {
    /// Loads the server configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&env_lookup)
    }

    fn from_lookup(lookup: &dyn Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        Ok(Self {
            base_url: optional(lookup, "BASE_URL", DEFAULT_BASE_URL),
            bot_token: required(lookup, "SERVER_BOT_TOKEN")?,
            profile: optional_parsed(lookup, "TRANSPORT_PROFILE")?.unwrap_or_default(),
            tuning: Tuning::default(),
        })
    }
}

fn env_lookup(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn required(
    lookup: &dyn Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<String, ConfigError> {
    lookup(name).ok_or(ConfigError::MissingVar { name })
}

fn optional(lookup: &dyn Fn(&str) -> Option<String>, name: &str, default: &str) -> String {
    lookup(name).unwrap_or_else(|| default.to_string())
}

fn optional_parsed<T>(
    lookup: &dyn Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        None => Ok(None),
        Some(value) => value
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::InvalidVar {
                name,
                value,
                reason: e.to_string(),
            }),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
