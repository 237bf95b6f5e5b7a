//! Client-side tunnel engine.
//!
//! Owns the client half of the stream registry and the dispatch of inbound
//! frames. The proxy front-end calls [`TunnelClient::open_stream`] to turn
//! a `host:port` into a pipe pair; the poll loop feeds every chat update
//! into the [`UpdateHandler`] implementation, which routes `OK`, `RECV`,
//! `CLOSED`, and `FAIL` frames to the right stream.
//!
//! # Registry
//!
//! Streams are keyed by request id (the identifier this peer minted for
//! the `CONNECT`), with a secondary index from the server-assigned stream
//! id for `RECV` lookups. An entry is either *pending* (a parked opener
//! waiting on a oneshot) or *open* (pipes plus receive-side sequence
//! state). Per-stream failures remove the one entry and never touch the
//! rest of the table.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info, warn};

use chatpipe_core::config::{TransportProfile, Tuning, DOCUMENT_CHUNK};
use chatpipe_core::frame::{self, Frame, FrameError, Payload};
use chatpipe_core::pipe::{pipe, PipeReader, PipeWriter};
use chatpipe_core::poll::UpdateHandler;
use chatpipe_core::reorder::ReorderBuffer;
use chatpipe_core::transport::{self, MessageChannel, TransportError, Update};
use chatpipe_core::types::{RequestId, StreamId};

/// Why an `open_stream` call did not produce a stream.
#[derive(Debug, Error)]
pub enum OpenError {
    #[error("timed out waiting for the tunnel to open")]
    ConnectTimeout,

    #[error("tunnel refused: {0}")]
    Refused(String),

    #[error("stream closed before it was established")]
    ClosedEarly,

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// A failure writing to an established stream.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

enum Entry {
    /// An opener parked on `open_stream`, waiting for `OK` or `FAIL`.
    Pending(oneshot::Sender<Result<(StreamId, PipeReader), OpenError>>),
    /// An established stream.
    Open(OpenStream),
}

struct OpenStream {
    stream_id: StreamId,
    /// Feeds origin bytes into the read pipe held by the proxy pump.
    feed: PipeWriter,
    /// Receive-side sequence state for `RECV` frames.
    recv: ReorderBuffer,
}

#[derive(Default)]
struct Registry {
    by_request: HashMap<RequestId, Entry>,
    by_stream: HashMap<StreamId, RequestId>,
}

/// The client peer's tunnel engine.
pub struct TunnelClient<C: MessageChannel> {
    channel: Arc<C>,
    chat_id: String,
    profile: TransportProfile,
    tuning: Tuning,
    registry: Mutex<Registry>,
}

impl<C: MessageChannel> TunnelClient<C> {
    pub fn new(
        channel: Arc<C>,
        chat_id: impl Into<String>,
        profile: TransportProfile,
        tuning: Tuning,
    ) -> Self {
        Self {
            channel,
            chat_id: chat_id.into(),
            profile,
            tuning,
            registry: Mutex::new(Registry::default()),
        }
    }

    /// Number of live (pending or open) streams.
    pub async fn active_streams(&self) -> usize {
        self.registry.lock().await.by_request.len()
    }

    /// Opens a virtual stream to `host:port` through the tunnel.
    ///
    /// Emits a `CONNECT` frame and parks until the server's `OK` (or
    /// `FAIL`/`CLOSED`) arrives, up to the configured connect timeout.
    /// On success, returns the read pipe carrying origin bytes and the
    /// batching writer carrying bytes toward the origin.
    pub async fn open_stream(
        &self,
        host: &str,
        port: u16,
    ) -> Result<(PipeReader, StreamWriter<C>), OpenError> {
        let request_id = RequestId::generate();
        let text = Frame::Connect {
            request_id: request_id.clone(),
            host: host.to_string(),
            port,
        }
        .encode()?;

        let (reply_tx, reply_rx) = oneshot::channel();
        self.registry
            .lock()
            .await
            .by_request
            .insert(request_id.clone(), Entry::Pending(reply_tx));

        debug!(%request_id, host, port, "opening tunnel stream");
        if let Err(e) = transport::send_text_retrying(&*self.channel, &self.chat_id, &text).await {
            self.registry.lock().await.by_request.remove(&request_id);
            return Err(e.into());
        }

        match tokio::time::timeout(self.tuning.connect_timeout, reply_rx).await {
            Ok(Ok(Ok((stream_id, reader)))) => {
                let writer = StreamWriter::new(
                    self.channel.clone(),
                    self.chat_id.clone(),
                    self.profile,
                    stream_id,
                );
                Ok((reader, writer))
            }
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(_)) => Err(OpenError::ClosedEarly),
            Err(_) => {
                self.registry.lock().await.by_request.remove(&request_id);
                warn!(%request_id, host, port, "connect timed out");
                Err(OpenError::ConnectTimeout)
            }
        }
    }

    async fn handle_ok(&self, request_id: RequestId, stream_id: StreamId) {
        let mut registry = self.registry.lock().await;
        let reply_tx = match registry.by_request.remove(&request_id) {
            None => {
                // Plausibly addressed to another client sharing the chat.
                debug!(%request_id, "OK for an unknown request, ignoring");
                return;
            }
            Some(entry @ Entry::Open(_)) => {
                warn!(%request_id, "duplicate OK for an established stream, ignoring");
                registry.by_request.insert(request_id, entry);
                return;
            }
            Some(Entry::Pending(reply_tx)) => reply_tx,
        };

        info!(%request_id, %stream_id, "tunnel stream established");
        let (feed, reader) = pipe(self.tuning.high_watermark, self.tuning.read_idle_timeout);
        registry.by_request.insert(
            request_id.clone(),
            Entry::Open(OpenStream {
                stream_id: stream_id.clone(),
                feed,
                recv: ReorderBuffer::new(self.tuning.reorder_capacity),
            }),
        );
        registry
            .by_stream
            .insert(stream_id.clone(), request_id.clone());

        if reply_tx.send(Ok((stream_id.clone(), reader))).is_err() {
            // The opener timed out between the server's OK and now. Retire
            // the stream and ask the server to release the socket.
            registry.by_request.remove(&request_id);
            registry.by_stream.remove(&stream_id);
            drop(registry);
            self.spawn_close(stream_id);
        }
    }

    async fn handle_recv(&self, stream_id: StreamId, seq: u64, payload: Bytes) {
        let mut registry = self.registry.lock().await;
        let Some(request_id) = registry.by_stream.get(&stream_id).cloned() else {
            warn!(%stream_id, seq, "RECV for an unknown stream, dropping");
            return;
        };
        let Some(Entry::Open(stream)) = registry.by_request.get_mut(&request_id) else {
            warn!(%stream_id, %request_id, "stream index points at a missing entry, dropping");
            registry.by_stream.remove(&stream_id);
            return;
        };

        let mut dead = false;
        match stream.recv.accept(seq, payload) {
            Ok(ready) => {
                for chunk in ready {
                    if stream.feed.write(&chunk).await.is_err() {
                        debug!(%stream_id, "read pipe closed, retiring the stream");
                        dead = true;
                        break;
                    }
                }
            }
            Err(overflow) => {
                warn!(%stream_id, error = %overflow, "tearing the stream down");
                dead = true;
            }
        }

        if dead {
            registry.by_request.remove(&request_id);
            registry.by_stream.remove(&stream_id);
            drop(registry);
            self.spawn_close(stream_id);
        }
    }

    async fn handle_closed(&self, request_id: RequestId) {
        let mut registry = self.registry.lock().await;
        match registry.by_request.remove(&request_id) {
            None => debug!(%request_id, "CLOSED for an unknown request, ignoring"),
            Some(Entry::Pending(reply_tx)) => {
                info!(%request_id, "stream closed before it was established");
                let _ = reply_tx.send(Err(OpenError::ClosedEarly));
            }
            Some(Entry::Open(mut stream)) => {
                info!(%request_id, stream_id = %stream.stream_id, "stream closed by the server peer");
                registry.by_stream.remove(&stream.stream_id);
                stream.feed.close();
            }
        }
    }

    async fn handle_fail(&self, request_id: RequestId, reason: String) {
        let mut registry = self.registry.lock().await;
        match registry.by_request.remove(&request_id) {
            None => debug!(%request_id, "FAIL for an unknown request, ignoring"),
            Some(Entry::Pending(reply_tx)) => {
                info!(%request_id, reason, "tunnel open refused");
                let _ = reply_tx.send(Err(OpenError::Refused(reason)));
            }
            Some(Entry::Open(mut stream)) => {
                warn!(%request_id, reason, "FAIL for an established stream, closing it");
                registry.by_stream.remove(&stream.stream_id);
                stream.feed.close();
            }
        }
    }

    /// Best-effort CLOSE for a stream retired by this peer.
    fn spawn_close(&self, stream_id: StreamId) {
        let channel = self.channel.clone();
        let chat_id = self.chat_id.clone();
        tokio::spawn(async move {
            match (Frame::Close { stream_id }).encode() {
                Ok(text) => {
                    if let Err(e) = transport::send_text_retrying(&*channel, &chat_id, &text).await
                    {
                        warn!(error = %e, "failed to send CLOSE");
                    }
                }
                Err(e) => warn!(error = %e, "failed to encode CLOSE"),
            }
        });
    }
}

impl<C: MessageChannel> UpdateHandler for TunnelClient<C> {
    async fn handle_update(&self, update: &Update) {
        let Some(message) = update.content() else {
            return;
        };
        let Some(text) = message.frame_text() else {
            return;
        };
        let frame = match Frame::parse(text) {
            Ok(Some(frame)) => frame,
            Ok(None) => return,
            Err(e) => {
                warn!(error = %e, "dropping malformed frame");
                return;
            }
        };
        match frame {
            Frame::Ok {
                request_id,
                stream_id,
            } => self.handle_ok(request_id, stream_id).await,
            Frame::Recv {
                stream_id,
                seq,
                payload,
            } => {
                if let Some(payload) =
                    transport::resolve_data_payload(&*self.channel, payload, message).await
                {
                    self.handle_recv(stream_id, seq, payload).await;
                }
            }
            Frame::Closed { request_id } => self.handle_closed(request_id).await,
            Frame::Fail { request_id, reason } => self.handle_fail(request_id, reason).await,
            // CONNECT, SEND, and CLOSE address the server peer.
            _ => {}
        }
    }
}

// ---------------------------------------------------------------------------
// StreamWriter
// ---------------------------------------------------------------------------

/// Batching writer for one stream's client-to-origin direction.
///
/// Bytes accumulate until a full payload chunk is buffered, then go out as
/// a `SEND` frame with the next sequence number. `flush` forces a partial
/// chunk out; `close` flushes and emits `CLOSE`. Sequence numbers are
/// minted here, so frames for one stream always leave in order with no
/// gaps.
pub struct StreamWriter<C: MessageChannel> {
    channel: Arc<C>,
    chat_id: String,
    profile: TransportProfile,
    stream_id: StreamId,
    send_seq: u64,
    max_payload: usize,
    buf: BytesMut,
    closed: bool,
}

impl<C: MessageChannel> StreamWriter<C> {
    fn new(
        channel: Arc<C>,
        chat_id: String,
        profile: TransportProfile,
        stream_id: StreamId,
    ) -> Self {
        let max_payload = match profile {
            TransportProfile::Text => frame::max_raw_payload(&stream_id),
            TransportProfile::Document => DOCUMENT_CHUNK,
        };
        Self {
            channel,
            chat_id,
            profile,
            stream_id,
            send_seq: 0,
            max_payload,
            buf: BytesMut::new(),
            closed: false,
        }
    }

    pub fn stream_id(&self) -> &StreamId {
        &self.stream_id
    }

    /// Buffers `data`, flushing every full payload chunk.
    pub async fn write(&mut self, data: &[u8]) -> Result<(), StreamError> {
        self.buf.extend_from_slice(data);
        while self.buf.len() >= self.max_payload {
            let chunk = self.buf.split_to(self.max_payload).freeze();
            self.emit(chunk).await?;
        }
        Ok(())
    }

    /// Sends whatever partial chunk is buffered.
    pub async fn flush(&mut self) -> Result<(), StreamError> {
        if !self.buf.is_empty() {
            let chunk = self.buf.split().freeze();
            self.emit(chunk).await?;
        }
        Ok(())
    }

    /// Final flush followed by a `CLOSE` frame. Idempotent.
    pub async fn close(&mut self) -> Result<(), StreamError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.flush().await?;
        let text = Frame::Close {
            stream_id: self.stream_id.clone(),
        }
        .encode()?;
        transport::send_text_retrying(&*self.channel, &self.chat_id, &text).await?;
        debug!(stream_id = %self.stream_id, "sent CLOSE");
        Ok(())
    }

    async fn emit(&mut self, chunk: Bytes) -> Result<(), StreamError> {
        let seq = self.send_seq;
        self.send_seq += 1;
        match self.profile {
            TransportProfile::Text => {
                let text = Frame::Send {
                    stream_id: self.stream_id.clone(),
                    seq,
                    payload: Payload::Inline(chunk),
                }
                .encode()?;
                transport::send_text_retrying(&*self.channel, &self.chat_id, &text).await?;
            }
            TransportProfile::Document => {
                let caption = Frame::Send {
                    stream_id: self.stream_id.clone(),
                    seq,
                    payload: Payload::Attached,
                }
                .encode()?;
                transport::send_document_retrying(&*self.channel, &self.chat_id, &caption, chunk)
                    .await?;
            }
        }
        Ok(())
    }
}

impl<C: MessageChannel> std::fmt::Debug for StreamWriter<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamWriter")
            .field("stream_id", &self.stream_id)
            .field("send_seq", &self.send_seq)
            .field("buffered", &self.buf.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    /// Channel that records outbound messages and never receives.
    struct RecordingChannel {
        sent: std::sync::Mutex<Vec<String>>,
    }

    impl RecordingChannel {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                sent: std::sync::Mutex::new(Vec::new()),
            })
        }

        fn sent(&self) -> Vec<String> {
            self.sent.lock().unwrap().clone()
        }
    }

    impl MessageChannel for RecordingChannel {
        async fn send_text(&self, _chat_id: &str, text: &str) -> Result<(), TransportError> {
            self.sent.lock().unwrap().push(text.to_string());
            Ok(())
        }

        async fn send_document(
            &self,
            _chat_id: &str,
            caption: &str,
            _data: Bytes,
        ) -> Result<(), TransportError> {
            self.sent.lock().unwrap().push(caption.to_string());
            Ok(())
        }

        async fn poll_updates(
            &self,
            _offset: Option<i64>,
            _limit: u32,
            _timeout: Duration,
        ) -> Result<Vec<Update>, TransportError> {
            Ok(Vec::new())
        }

        async fn fetch_document(&self, _file_id: &str) -> Result<Bytes, TransportError> {
            Err(TransportError::fatal("no documents here"))
        }
    }

    fn fast_tuning() -> Tuning {
        Tuning {
            connect_timeout: Duration::from_millis(200),
            read_idle_timeout: Duration::from_millis(200),
            ..Tuning::default()
        }
    }

    fn text_update(text: &str) -> Update {
        serde_json::from_value(serde_json::json!({
            "update_id": 1,
            "message": { "chat": { "id": 1 }, "text": text },
        }))
        .unwrap()
    }

    /// Polls the recorded messages until the CONNECT frame shows up and
    /// returns its request id.
    async fn connect_request_id(channel: &RecordingChannel) -> String {
        for _ in 0..100 {
            if let Some(text) = channel.sent().first().cloned() {
                match Frame::parse(&text).unwrap().unwrap() {
                    Frame::Connect { request_id, .. } => return request_id.to_string(),
                    other => panic!("expected CONNECT, got {other:?}"),
                }
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("no CONNECT was sent");
    }

    fn tunnel(channel: Arc<RecordingChannel>) -> Arc<TunnelClient<RecordingChannel>> {
        Arc::new(TunnelClient::new(
            channel,
            "chat",
            TransportProfile::Text,
            fast_tuning(),
        ))
    }

    #[tokio::test]
    async fn open_stream_resolves_on_ok() {
        let channel = RecordingChannel::new();
        let tunnel = tunnel(channel.clone());

        let opener = {
            let tunnel = tunnel.clone();
            tokio::spawn(async move { tunnel.open_stream("example.com", 80).await })
        };

        let request_id = connect_request_id(&channel).await;
        tunnel
            .handle_update(&text_update(&format!("OK {request_id} s1")))
            .await;

        let (_reader, writer) = opener.await.unwrap().expect("stream should open");
        assert_eq!(writer.stream_id().as_str(), "s1");
        assert_eq!(tunnel.active_streams().await, 1);
    }

    #[tokio::test]
    async fn open_stream_times_out_without_ok() {
        let channel = RecordingChannel::new();
        let tunnel = tunnel(channel);

        let result = tunnel.open_stream("example.com", 80).await;
        assert!(matches!(result, Err(OpenError::ConnectTimeout)));
        assert_eq!(tunnel.active_streams().await, 0);
    }

    #[tokio::test]
    async fn open_stream_surfaces_fail_reason() {
        let channel = RecordingChannel::new();
        let tunnel = tunnel(channel.clone());

        let opener = {
            let tunnel = tunnel.clone();
            tokio::spawn(async move { tunnel.open_stream("example.com", 80).await })
        };

        let request_id = connect_request_id(&channel).await;
        tunnel
            .handle_update(&text_update(&format!(
                "FAIL {request_id} connection refused"
            )))
            .await;

        match opener.await.unwrap() {
            Err(OpenError::Refused(reason)) => assert_eq!(reason, "connection refused"),
            other => panic!("expected Refused, got {other:?}"),
        }
        assert_eq!(tunnel.active_streams().await, 0);
    }

    #[tokio::test]
    async fn closed_before_ok_resolves_the_opener() {
        let channel = RecordingChannel::new();
        let tunnel = tunnel(channel.clone());

        let opener = {
            let tunnel = tunnel.clone();
            tokio::spawn(async move { tunnel.open_stream("example.com", 80).await })
        };

        let request_id = connect_request_id(&channel).await;
        tunnel
            .handle_update(&text_update(&format!("CLOSED {request_id}")))
            .await;

        assert!(matches!(
            opener.await.unwrap(),
            Err(OpenError::ClosedEarly)
        ));
    }

    #[tokio::test]
    async fn recv_frames_reach_the_read_pipe_in_sequence_order() {
        let channel = RecordingChannel::new();
        let tunnel = tunnel(channel.clone());

        let opener = {
            let tunnel = tunnel.clone();
            tokio::spawn(async move { tunnel.open_stream("example.com", 80).await })
        };
        let request_id = connect_request_id(&channel).await;
        tunnel
            .handle_update(&text_update(&format!("OK {request_id} s1")))
            .await;
        let (mut reader, _writer) = opener.await.unwrap().unwrap();

        // Arrival order 1, 0: the pipe must still yield "AABB".
        tunnel
            .handle_update(&text_update("RECV s1 1 QkI=")) // "BB"
            .await;
        tunnel
            .handle_update(&text_update("RECV s1 0 QUE=")) // "AA"
            .await;

        let mut received = Vec::new();
        while received.len() < 4 {
            let chunk = reader.read(64).await;
            assert!(!chunk.is_empty(), "pipe ended early");
            received.extend_from_slice(&chunk);
        }
        assert_eq!(received, b"AABB");
    }

    #[tokio::test]
    async fn recv_for_unknown_stream_is_dropped_without_side_effects() {
        let channel = RecordingChannel::new();
        let tunnel = tunnel(channel.clone());

        tunnel.handle_update(&text_update("SEND zzz 0 QUE=")).await;
        tunnel.handle_update(&text_update("RECV zzz 0 QUE=")).await;

        assert_eq!(tunnel.active_streams().await, 0);
        assert!(channel.sent().is_empty());
    }

    #[tokio::test]
    async fn duplicate_ok_is_ignored() {
        let channel = RecordingChannel::new();
        let tunnel = tunnel(channel.clone());

        let opener = {
            let tunnel = tunnel.clone();
            tokio::spawn(async move { tunnel.open_stream("example.com", 80).await })
        };
        let request_id = connect_request_id(&channel).await;
        tunnel
            .handle_update(&text_update(&format!("OK {request_id} s1")))
            .await;
        tunnel
            .handle_update(&text_update(&format!("OK {request_id} s2")))
            .await;

        let (_reader, writer) = opener.await.unwrap().unwrap();
        assert_eq!(writer.stream_id().as_str(), "s1");
        assert_eq!(tunnel.active_streams().await, 1);
    }

    #[tokio::test]
    async fn closed_tears_down_the_stream_and_eofs_the_reader() {
        let channel = RecordingChannel::new();
        let tunnel = tunnel(channel.clone());

        let opener = {
            let tunnel = tunnel.clone();
            tokio::spawn(async move { tunnel.open_stream("example.com", 80).await })
        };
        let request_id = connect_request_id(&channel).await;
        tunnel
            .handle_update(&text_update(&format!("OK {request_id} s1")))
            .await;
        let (mut reader, _writer) = opener.await.unwrap().unwrap();

        tunnel
            .handle_update(&text_update(&format!("CLOSED {request_id}")))
            .await;

        assert!(reader.read(64).await.is_empty());
        assert_eq!(tunnel.active_streams().await, 0);
    }

    #[tokio::test]
    async fn writer_batches_into_contiguous_numbered_frames() {
        let channel = RecordingChannel::new();
        let stream_id = StreamId::new("s1");
        let max_payload = frame::max_raw_payload(&stream_id);
        let mut writer = StreamWriter::new(
            channel.clone(),
            "chat".to_string(),
            TransportProfile::Text,
            stream_id,
        );

        // Two full chunks plus a tail, written in one call.
        let data: Vec<u8> = (0..max_payload * 2 + 10).map(|i| i as u8).collect();
        writer.write(&data).await.unwrap();
        assert_eq!(channel.sent().len(), 2, "only full chunks auto-flush");

        writer.close().await.unwrap();
        let sent = channel.sent();
        assert_eq!(sent.len(), 4, "tail flush plus CLOSE");

        let mut reassembled = Vec::new();
        for (expected_seq, text) in sent[..3].iter().enumerate() {
            assert!(text.len() <= frame::FRAME_LIMIT);
            match Frame::parse(text).unwrap().unwrap() {
                Frame::Send {
                    seq,
                    payload: Payload::Inline(chunk),
                    ..
                } => {
                    assert_eq!(seq, expected_seq as u64);
                    reassembled.extend_from_slice(&chunk);
                }
                other => panic!("expected SEND, got {other:?}"),
            }
        }
        assert_eq!(reassembled, data);
        assert!(matches!(
            Frame::parse(&sent[3]).unwrap().unwrap(),
            Frame::Close { .. }
        ));
    }

    #[tokio::test]
    async fn document_profile_sends_captioned_attachments() {
        let channel = RecordingChannel::new();
        let mut writer = StreamWriter::new(
            channel.clone(),
            "chat".to_string(),
            TransportProfile::Document,
            StreamId::new("s1"),
        );

        writer.write(b"payload").await.unwrap();
        writer.flush().await.unwrap();

        let sent = channel.sent();
        assert_eq!(
            Frame::parse(&sent[0]).unwrap().unwrap(),
            Frame::Send {
                stream_id: StreamId::new("s1"),
                seq: 0,
                payload: Payload::Attached,
            }
        );
    }
}
