//! Server-side tunnel engine.
//!
//! The inverse of the client engine: where the client turns browser
//! connections into streams, this peer turns `CONNECT` frames into real
//! TCP connections. For each established stream it runs one socket-reader
//! task that chunks origin bytes into `RECV` frames, while the poll
//! dispatcher writes inbound `SEND` payloads to the socket in sequence
//! order.
//!
//! Replies go to whichever chat carried the stream's `CONNECT`, so the
//! server needs no chat id of its own and serves broadcast channels and
//! plain groups alike.
//!
//! Teardown paths all converge on removing the one stream and emitting
//! `CLOSED <request_id>`: origin EOF, origin socket errors, reorder
//! overflow, and the client's `CLOSE`. Whichever path runs first removes
//! the registry entry; the others find it gone and stay silent, so the
//! client sees exactly one `CLOSED`.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info, warn};

use chatpipe_core::config::{TransportProfile, Tuning, DOCUMENT_CHUNK};
use chatpipe_core::frame::{self, Frame, FrameError, Payload};
use chatpipe_core::poll::UpdateHandler;
use chatpipe_core::reorder::ReorderBuffer;
use chatpipe_core::transport::{self, MessageChannel, TransportError, Update};
use chatpipe_core::types::{RequestId, StreamId};

/// A frame that could not be encoded or delivered.
#[derive(Debug, thiserror::Error)]
enum RelayError {
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Read size for origin sockets under the text profile, kept under the
/// per-frame payload budget.
const TEXT_READ_CHUNK: usize = 2048;

struct ServerStream {
    request_id: RequestId,
    /// The chat that carried this stream's CONNECT; all replies go there.
    chat_id: String,
    writer: OwnedWriteHalf,
    /// Receive-side sequence state for `SEND` frames.
    recv: ReorderBuffer,
    /// Stops the socket-reader task on the CLOSE path.
    stop: Option<oneshot::Sender<()>>,
}

#[derive(Default)]
struct ServerRegistry {
    streams: HashMap<StreamId, ServerStream>,
    by_request: HashMap<RequestId, StreamId>,
}

/// Removes a stream from both tables and stops its reader task.
fn remove_locked(registry: &mut ServerRegistry, stream_id: &StreamId) -> Option<ServerStream> {
    let mut stream = registry.streams.remove(stream_id)?;
    registry.by_request.remove(&stream.request_id);
    if let Some(stop) = stream.stop.take() {
        let _ = stop.send(());
    }
    Some(stream)
}

/// The server peer's tunnel engine.
pub struct TunnelServer<C: MessageChannel> {
    channel: Arc<C>,
    profile: TransportProfile,
    tuning: Tuning,
    registry: Arc<Mutex<ServerRegistry>>,
}

impl<C: MessageChannel> TunnelServer<C> {
    pub fn new(channel: Arc<C>, profile: TransportProfile, tuning: Tuning) -> Self {
        Self {
            channel,
            profile,
            tuning,
            registry: Arc::new(Mutex::new(ServerRegistry::default())),
        }
    }

    /// Number of live streams.
    pub async fn active_streams(&self) -> usize {
        self.registry.lock().await.streams.len()
    }

    async fn handle_connect(
        &self,
        chat_id: String,
        request_id: RequestId,
        host: String,
        port: u16,
    ) {
        {
            let registry = self.registry.lock().await;
            if registry.by_request.contains_key(&request_id) {
                warn!(%request_id, "duplicate CONNECT for a live stream, ignoring");
                return;
            }
        }

        info!(%request_id, host, port, "dialing origin");
        let socket = match tokio::time::timeout(
            self.tuning.dial_timeout,
            TcpStream::connect((host.as_str(), port)),
        )
        .await
        {
            Ok(Ok(socket)) => socket,
            Ok(Err(e)) => {
                warn!(%request_id, host, port, error = %e, "dial failed");
                self.emit_fail(&chat_id, request_id, &e.to_string()).await;
                return;
            }
            Err(_) => {
                warn!(%request_id, host, port, "dial timed out");
                self.emit_fail(&chat_id, request_id, "dial timed out").await;
                return;
            }
        };

        let stream_id = StreamId::generate();
        let (read_half, write_half) = socket.into_split();
        let (stop_tx, stop_rx) = oneshot::channel();

        {
            let mut registry = self.registry.lock().await;
            registry.streams.insert(
                stream_id.clone(),
                ServerStream {
                    request_id: request_id.clone(),
                    chat_id: chat_id.clone(),
                    writer: write_half,
                    recv: ReorderBuffer::new(self.tuning.reorder_capacity),
                    stop: Some(stop_tx),
                },
            );
            registry
                .by_request
                .insert(request_id.clone(), stream_id.clone());
        }

        let announce = async {
            let text = Frame::Ok {
                request_id: request_id.clone(),
                stream_id: stream_id.clone(),
            }
            .encode()?;
            transport::send_text_retrying(&*self.channel, &chat_id, &text).await?;
            Ok::<_, RelayError>(())
        };
        if let Err(e) = announce.await {
            warn!(%request_id, error = %e, "failed to announce the stream, dropping it");
            let mut registry = self.registry.lock().await;
            remove_locked(&mut registry, &stream_id);
            return;
        }
        info!(%request_id, %stream_id, "stream established");

        tokio::spawn(socket_reader(
            self.channel.clone(),
            self.registry.clone(),
            chat_id,
            request_id,
            stream_id,
            read_half,
            stop_rx,
            self.profile,
        ));
    }

    async fn handle_send(&self, stream_id: StreamId, seq: u64, payload: Bytes) {
        let mut registry = self.registry.lock().await;
        let Some(stream) = registry.streams.get_mut(&stream_id) else {
            warn!(%stream_id, seq, "SEND for an unknown stream, dropping");
            return;
        };

        let mut dead = false;
        match stream.recv.accept(seq, payload) {
            Ok(ready) => {
                for chunk in ready {
                    if stream.writer.write_all(&chunk).await.is_err() {
                        dead = true;
                        break;
                    }
                }
                if !dead && stream.writer.flush().await.is_err() {
                    dead = true;
                }
                if dead {
                    debug!(%stream_id, "origin socket write failed");
                }
            }
            Err(overflow) => {
                warn!(%stream_id, error = %overflow, "tearing the stream down");
                dead = true;
            }
        }

        if dead {
            let removed = remove_locked(&mut registry, &stream_id);
            drop(registry);
            if let Some(stream) = removed {
                self.emit_closed(&stream.chat_id, stream.request_id).await;
            }
        }
    }

    async fn handle_close(&self, stream_id: StreamId) {
        let removed = {
            let mut registry = self.registry.lock().await;
            remove_locked(&mut registry, &stream_id)
        };
        match removed {
            None => warn!(%stream_id, "CLOSE for an unknown stream, ignoring"),
            Some(stream) => {
                info!(%stream_id, request_id = %stream.request_id, "closing stream on client request");
                let ServerStream {
                    request_id,
                    chat_id,
                    writer,
                    ..
                } = stream;
                // Dropping the write half shuts down our side of the socket.
                drop(writer);
                self.emit_closed(&chat_id, request_id).await;
            }
        }
    }

    async fn emit_fail(&self, chat_id: &str, request_id: RequestId, reason: &str) {
        let frame = Frame::Fail {
            request_id,
            reason: reason.to_string(),
        };
        match frame.encode() {
            Ok(text) => {
                if let Err(e) =
                    transport::send_text_retrying(&*self.channel, chat_id, &text).await
                {
                    warn!(error = %e, "failed to send FAIL");
                }
            }
            Err(e) => warn!(error = %e, "failed to encode FAIL"),
        }
    }

    async fn emit_closed(&self, chat_id: &str, request_id: RequestId) {
        emit_closed(&*self.channel, chat_id, request_id).await;
    }
}

async fn emit_closed<C: MessageChannel>(channel: &C, chat_id: &str, request_id: RequestId) {
    let frame = Frame::Closed { request_id };
    match frame.encode() {
        Ok(text) => {
            if let Err(e) = transport::send_text_retrying(channel, chat_id, &text).await {
                warn!(error = %e, "failed to send CLOSED");
            }
        }
        Err(e) => warn!(error = %e, "failed to encode CLOSED"),
    }
}

impl<C: MessageChannel> UpdateHandler for TunnelServer<C> {
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
        let chat_id = message.chat.id.to_string();
        match frame {
            Frame::Connect {
                request_id,
                host,
                port,
            } => self.handle_connect(chat_id, request_id, host, port).await,
            Frame::Send {
                stream_id,
                seq,
                payload,
            } => {
                if let Some(payload) =
                    transport::resolve_data_payload(&*self.channel, payload, message).await
                {
                    self.handle_send(stream_id, seq, payload).await;
                }
            }
            Frame::Close { stream_id } => self.handle_close(stream_id).await,
            // OK, RECV, CLOSED, and FAIL address the client peer.
            _ => {}
        }
    }
}

/// Per-stream reader task: chunks origin bytes into `RECV` frames with
/// ascending sequence numbers until EOF, a socket error, a relay failure,
/// or a stop signal from the CLOSE path.
#[allow(clippy::too_many_arguments)]
async fn socket_reader<C: MessageChannel>(
    channel: Arc<C>,
    registry: Arc<Mutex<ServerRegistry>>,
    chat_id: String,
    request_id: RequestId,
    stream_id: StreamId,
    mut socket: OwnedReadHalf,
    mut stop_rx: oneshot::Receiver<()>,
    profile: TransportProfile,
) {
    use tokio::io::AsyncReadExt;

    let chunk_size = match profile {
        TransportProfile::Text => frame::max_raw_payload(&stream_id).min(TEXT_READ_CHUNK),
        TransportProfile::Document => DOCUMENT_CHUNK,
    };
    let mut buf = vec![0u8; chunk_size];
    let mut send_seq: u64 = 0;

    loop {
        let read = tokio::select! {
            _ = &mut stop_rx => {
                // The CLOSE path owns the teardown and the CLOSED frame.
                debug!(%stream_id, "socket reader stopped");
                return;
            }
            read = socket.read(&mut buf) => read,
        };

        match read {
            Ok(0) => break,
            Ok(n) => {
                let payload = Bytes::copy_from_slice(&buf[..n]);
                let seq = send_seq;
                send_seq += 1;
                if let Err(e) =
                    relay_chunk(&*channel, &chat_id, &stream_id, seq, payload, profile).await
                {
                    warn!(%stream_id, seq, error = %e, "failed to relay origin bytes");
                    break;
                }
            }
            Err(e) => {
                debug!(%stream_id, error = %e, "origin socket read error");
                break;
            }
        }
    }

    // EOF or error. Emit CLOSED only if the stream is still registered;
    // a concurrent teardown already told the client.
    let removed = {
        let mut registry = registry.lock().await;
        remove_locked(&mut registry, &stream_id).is_some()
    };
    if removed {
        info!(%stream_id, %request_id, "origin connection ended");
        emit_closed(&*channel, &chat_id, request_id).await;
    }
}

async fn relay_chunk<C: MessageChannel>(
    channel: &C,
    chat_id: &str,
    stream_id: &StreamId,
    seq: u64,
    payload: Bytes,
    profile: TransportProfile,
) -> Result<(), RelayError> {
    match profile {
        TransportProfile::Text => {
            let text = Frame::Recv {
                stream_id: stream_id.clone(),
                seq,
                payload: Payload::Inline(payload),
            }
            .encode()?;
            transport::send_text_retrying(channel, chat_id, &text).await?;
        }
        TransportProfile::Document => {
            let caption = Frame::Recv {
                stream_id: stream_id.clone(),
                seq,
                payload: Payload::Attached,
            }
            .encode()?;
            transport::send_document_retrying(channel, chat_id, &caption, payload).await?;
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
