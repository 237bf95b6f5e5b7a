//! Chat transport: the message-delivery service carrying tunnel frames.
//!
//! The tunnel treats the chat backend as a minimal message API: post a text
//! message, poll for updates, and (for the document profile) upload and
//! download attachments. That surface is captured by the [`MessageChannel`]
//! trait; [`BotApi`] is the production implementation over the Telegram Bot
//! HTTP API, and tests substitute in-memory channels.
//!
//! # Error taxonomy
//!
//! Failures are either *transient* (rate limits, timeouts, 5xx: retry with
//! backoff) or *fatal* (rejected credentials, unknown chat: surface to the
//! operator). Callers that must get a frame onto the wire use the
//! `*_retrying` helpers, which back off from 1 s to a 5 s cap and give up
//! once a total retry budget is exhausted.
//!
//! # Replay
//!
//! The poll offset is advanced only after a successful poll, so a failed
//! poll replays updates. Frame handlers are idempotent under replay, keyed
//! by request id, stream id, and sequence number.

use std::future::Future;
use std::time::Duration;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

/// First retry delay for transient transport failures.
const RETRY_INITIAL: Duration = Duration::from_secs(1);

/// Ceiling for the retry delay.
const RETRY_CAP: Duration = Duration::from_secs(5);

/// Total time spent retrying one operation before giving up.
const RETRY_BUDGET: Duration = Duration::from_secs(60);

/// HTTP client timeout; must exceed the long-poll timeout passed to
/// `getUpdates` or every poll would be cut short.
const HTTP_TIMEOUT: Duration = Duration::from_secs(75);

/// A failure talking to the chat backend.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Recoverable: retry after a backoff (and `retry_after`, if the
    /// backend provided one).
    #[error("transient transport failure: {reason}")]
    Transient {
        reason: String,
        retry_after: Option<Duration>,
    },

    /// Unrecoverable with the current credentials or configuration.
    #[error("fatal transport failure: {reason}")]
    Fatal { reason: String },
}

impl TransportError {
    pub fn transient(reason: impl Into<String>) -> Self {
        Self::Transient {
            reason: reason.into(),
            retry_after: None,
        }
    }

    pub fn fatal(reason: impl Into<String>) -> Self {
        Self::Fatal {
            reason: reason.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        // Network blips, timeouts, and malformed bodies all recover by
        // retrying; only the classification of API-level errors below can
        // declare a failure fatal.
        TransportError::transient(e.to_string())
    }
}

// ---------------------------------------------------------------------------
// Update types (the subset of the Bot API the tunnel reads)
// ---------------------------------------------------------------------------

/// One long-poll update.
#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<ChatMessage>,
    #[serde(default)]
    pub channel_post: Option<ChatMessage>,
}

impl Update {
    /// The carried message, whether it arrived as a direct message or a
    /// channel post (broadcast chats deliver frames as posts).
    pub fn content(&self) -> Option<&ChatMessage> {
        self.message.as_ref().or(self.channel_post.as_ref())
    }
}

/// A chat message that may carry a tunnel frame.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatMessage {
    pub chat: Chat,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub caption: Option<String>,
    #[serde(default)]
    pub document: Option<Document>,
}

impl ChatMessage {
    /// The frame text: the message body, or the caption when the payload
    /// rides as an attachment.
    pub fn frame_text(&self) -> Option<&str> {
        self.text.as_deref().or(self.caption.as_deref())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Chat {
    pub id: i64,
}

/// An attachment reference carried by a document-profile data frame.
#[derive(Debug, Clone, Deserialize)]
pub struct Document {
    pub file_id: String,
}

#[derive(Debug, Default, Deserialize)]
struct FileInfo {
    file_path: Option<String>,
}

/// The Bot API response envelope wrapping every method result.
#[derive(Debug, Deserialize)]
struct ApiEnvelope<T> {
    ok: bool,
    #[serde(default)]
    result: Option<T>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    error_code: Option<i64>,
    #[serde(default)]
    parameters: Option<ResponseParameters>,
}

#[derive(Debug, Deserialize)]
struct ResponseParameters {
    #[serde(default)]
    retry_after: Option<u64>,
}

// ---------------------------------------------------------------------------
// MessageChannel: the seam between the tunnel and the chat backend
// ---------------------------------------------------------------------------

/// The minimal message-delivery API the tunnel engines are written against.
///
/// `chat_id` is the backend's chat identifier as text (numeric ids and
/// `@channel` names both pass through unchanged).
pub trait MessageChannel: Send + Sync + 'static {
    /// Posts a text message to the chat.
    fn send_text(
        &self,
        chat_id: &str,
        text: &str,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Uploads `data` as a document with the given caption.
    fn send_document(
        &self,
        chat_id: &str,
        caption: &str,
        data: Bytes,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Long-polls for updates past `offset`.
    fn poll_updates(
        &self,
        offset: Option<i64>,
        limit: u32,
        timeout: Duration,
    ) -> impl Future<Output = Result<Vec<Update>, TransportError>> + Send;

    /// Downloads the content of a previously announced document.
    fn fetch_document(
        &self,
        file_id: &str,
    ) -> impl Future<Output = Result<Bytes, TransportError>> + Send;
}

// ---------------------------------------------------------------------------
// BotApi: reqwest-backed production channel
// ---------------------------------------------------------------------------

/// Telegram Bot API client.
///
/// Method URLs are `<base_url><token>/<method>`; file downloads use the
/// parallel `/file/bot<token>/<path>` tree.
pub struct BotApi {
    http: reqwest::Client,
    method_base: String,
    file_base: String,
}

impl BotApi {
    /// Builds a client for the given API base URL (e.g.
    /// `https://api.telegram.org/bot`) and bot token.
    pub fn new(base_url: &str, token: &str) -> Result<Self, TransportError> {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| TransportError::fatal(format!("failed to build http client: {e}")))?;
        Ok(Self {
            http,
            method_base: format!("{base_url}{token}"),
            file_base: file_base_url(base_url, token),
        })
    }

    async fn call<T: DeserializeOwned + Default>(
        &self,
        method: &str,
        body: serde_json::Value,
    ) -> Result<T, TransportError> {
        let response = self
            .http
            .post(format!("{}/{method}", self.method_base))
            .json(&body)
            .send()
            .await?;
        let status = response.status().as_u16();
        let envelope: ApiEnvelope<T> = response.json().await?;
        unwrap_envelope(status, envelope)
    }
}

impl MessageChannel for BotApi {
    async fn send_text(&self, chat_id: &str, text: &str) -> Result<(), TransportError> {
        let _: serde_json::Value = self
            .call(
                "sendMessage",
                serde_json::json!({ "chat_id": chat_id, "text": text }),
            )
            .await?;
        Ok(())
    }

    async fn send_document(
        &self,
        chat_id: &str,
        caption: &str,
        data: Bytes,
    ) -> Result<(), TransportError> {
        let part = reqwest::multipart::Part::bytes(data.to_vec())
            .file_name("payload.bin")
            .mime_str("application/octet-stream")
            .map_err(|e| TransportError::fatal(format!("invalid mime type: {e}")))?;
        let form = reqwest::multipart::Form::new()
            .text("chat_id", chat_id.to_string())
            .text("caption", caption.to_string())
            .part("document", part);
        let response = self
            .http
            .post(format!("{}/sendDocument", self.method_base))
            .multipart(form)
            .send()
            .await?;
        let status = response.status().as_u16();
        let envelope: ApiEnvelope<serde_json::Value> = response.json().await?;
        unwrap_envelope(status, envelope)?;
        Ok(())
    }

    async fn poll_updates(
        &self,
        offset: Option<i64>,
        limit: u32,
        timeout: Duration,
    ) -> Result<Vec<Update>, TransportError> {
        let mut body = serde_json::json!({
            "limit": limit,
            "timeout": timeout.as_secs(),
        });
        if let Some(offset) = offset {
            body["offset"] = offset.into();
        }
        self.call("getUpdates", body).await
    }

    async fn fetch_document(&self, file_id: &str) -> Result<Bytes, TransportError> {
        let info: FileInfo = self
            .call("getFile", serde_json::json!({ "file_id": file_id }))
            .await?;
        let path = info
            .file_path
            .ok_or_else(|| TransportError::transient("getFile returned no file_path"))?;
        let response = self
            .http
            .get(format!("{}/{path}", self.file_base))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(classify_api_error(
                response.status().as_u16() as i64,
                "file download failed",
                None,
            ));
        }
        Ok(response.bytes().await?)
    }
}

/// Derives the file-download base URL from the method base URL.
///
/// `https://api.telegram.org/bot` + token becomes
/// `https://api.telegram.org/file/bot` + token, matching the Bot API's
/// download tree. A base without the `bot` suffix keeps its own shape.
fn file_base_url(base_url: &str, token: &str) -> String {
    match base_url.strip_suffix("bot") {
        Some(prefix) => format!("{prefix}file/bot{token}"),
        None => format!("{base_url}{token}/file"),
    }
}

fn unwrap_envelope<T>(status: u16, envelope: ApiEnvelope<T>) -> Result<T, TransportError> {
    if envelope.ok {
        return envelope
            .result
            .ok_or_else(|| TransportError::transient("api response is missing its result"));
    }
    let code = envelope.error_code.unwrap_or(status as i64);
    let description = envelope
        .description
        .unwrap_or_else(|| "no description".to_string());
    let retry_after = envelope
        .parameters
        .and_then(|p| p.retry_after)
        .map(Duration::from_secs);
    Err(classify_api_error(code, &description, retry_after))
}

/// Maps a Bot API error code onto the transient/fatal taxonomy.
///
/// 429 is the backend's rate limit and carries `retry_after`; 5xx are
/// backend-side and recover on their own. 4xx other than 429 mean the
/// credentials or the request itself are wrong and retrying cannot help.
fn classify_api_error(
    code: i64,
    description: &str,
    retry_after: Option<Duration>,
) -> TransportError {
    match code {
        429 => TransportError::Transient {
            reason: format!("rate limited: {description}"),
            retry_after,
        },
        c if c >= 500 => TransportError::transient(format!("api error {c}: {description}")),
        c => TransportError::fatal(format!("api error {c}: {description}")),
    }
}

// ---------------------------------------------------------------------------
// Retrying send helpers
// ---------------------------------------------------------------------------

/// Posts a text message, retrying transient failures with capped backoff.
pub async fn send_text_retrying<C: MessageChannel>(
    channel: &C,
    chat_id: &str,
    text: &str,
) -> Result<(), TransportError> {
    retrying(|| channel.send_text(chat_id, text)).await
}

/// Uploads a document, retrying transient failures with capped backoff.
pub async fn send_document_retrying<C: MessageChannel>(
    channel: &C,
    chat_id: &str,
    caption: &str,
    data: Bytes,
) -> Result<(), TransportError> {
    retrying(|| channel.send_document(chat_id, caption, data.clone())).await
}

/// Downloads a document, retrying transient failures with capped backoff.
pub async fn fetch_document_retrying<C: MessageChannel>(
    channel: &C,
    file_id: &str,
) -> Result<Bytes, TransportError> {
    retrying(|| channel.fetch_document(file_id)).await
}

/// Resolves a data frame's payload to bytes: inline payloads are already
/// decoded, attachment-form payloads are downloaded from the message's
/// document. Returns `None` (after logging) when the payload cannot be
/// produced; the dispatcher drops the frame.
pub async fn resolve_data_payload<C: MessageChannel>(
    channel: &C,
    payload: crate::frame::Payload,
    message: &ChatMessage,
) -> Option<Bytes> {
    match payload {
        crate::frame::Payload::Inline(data) => Some(data),
        crate::frame::Payload::Attached => match &message.document {
            Some(doc) => match fetch_document_retrying(channel, &doc.file_id).await {
                Ok(data) => Some(data),
                Err(e) => {
                    warn!(error = %e, "failed to download a frame attachment, dropping");
                    None
                }
            },
            None => {
                warn!("attachment-form frame without a document, dropping");
                None
            }
        },
    }
}

async fn retrying<T, F, Fut>(mut op: F) -> Result<T, TransportError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, TransportError>>,
{
    let mut delay = RETRY_INITIAL;
    let mut spent = Duration::ZERO;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e @ TransportError::Fatal { .. }) => return Err(e),
            Err(e) if spent >= RETRY_BUDGET => return Err(e),
            Err(TransportError::Transient {
                reason,
                retry_after,
            }) => {
                // A backend-provided retry_after overrides our own schedule.
                let wait = retry_after.unwrap_or(delay);
                debug!(%reason, wait_secs = wait.as_secs(), "transient transport failure, retrying");
                tokio::time::sleep(wait).await;
                spent += wait;
                delay = (delay * 2).min(RETRY_CAP);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_deserializes_from_bot_api_json() {
        let json = r#"{
            "update_id": 42,
            "message": {
                "message_id": 7,
                "chat": {"id": -100123, "type": "channel"},
                "text": "OK r1 s1"
            }
        }"#;
        let update: Update = serde_json::from_str(json).unwrap();
        assert_eq!(update.update_id, 42);
        let msg = update.content().unwrap();
        assert_eq!(msg.chat.id, -100123);
        assert_eq!(msg.frame_text(), Some("OK r1 s1"));
    }

    #[test]
    fn channel_post_counts_as_content() {
        let json = r#"{
            "update_id": 1,
            "channel_post": {
                "chat": {"id": 5},
                "caption": "RECV s1 0",
                "document": {"file_id": "F123", "file_unique_id": "U1"}
            }
        }"#;
        let update: Update = serde_json::from_str(json).unwrap();
        let msg = update.content().unwrap();
        assert_eq!(msg.frame_text(), Some("RECV s1 0"));
        assert_eq!(msg.document.as_ref().unwrap().file_id, "F123");
    }

    #[test]
    fn update_without_message_has_no_content() {
        let update: Update = serde_json::from_str(r#"{"update_id": 9}"#).unwrap();
        assert!(update.content().is_none());
    }

    #[test]
    fn rate_limit_is_transient_with_retry_after() {
        let err = classify_api_error(429, "Too Many Requests", Some(Duration::from_secs(17)));
        match err {
            TransportError::Transient { retry_after, .. } => {
                assert_eq!(retry_after, Some(Duration::from_secs(17)));
            }
            other => panic!("expected transient, got {other:?}"),
        }
    }

    #[test]
    fn server_errors_are_transient_auth_errors_are_fatal() {
        assert!(classify_api_error(502, "Bad Gateway", None).is_transient());
        assert!(!classify_api_error(401, "Unauthorized", None).is_transient());
        assert!(!classify_api_error(403, "Forbidden", None).is_transient());
        assert!(!classify_api_error(400, "Bad Request: chat not found", None).is_transient());
    }

    #[test]
    fn error_envelope_unwraps_to_classified_error() {
        let envelope: ApiEnvelope<Vec<Update>> = serde_json::from_str(
            r#"{"ok": false, "error_code": 429, "description": "Too Many Requests",
                "parameters": {"retry_after": 3}}"#,
        )
        .unwrap();
        let err = unwrap_envelope(429, envelope).unwrap_err();
        assert!(err.is_transient());
    }

    #[test]
    fn ok_envelope_unwraps_to_result() {
        let envelope: ApiEnvelope<Vec<Update>> =
            serde_json::from_str(r#"{"ok": true, "result": [{"update_id": 1}]}"#).unwrap();
        let updates = unwrap_envelope(200, envelope).unwrap();
        assert_eq!(updates.len(), 1);
    }

    #[test]
    fn file_base_url_moves_token_under_file_tree() {
        assert_eq!(
            file_base_url("https://api.telegram.org/bot", "123:abc"),
            "https://api.telegram.org/file/bot123:abc"
        );
    }
}
