//! Tunnel wire protocol: the frame codec.
//!
//! Every frame is a single line of text carried as one chat message,
//! whitespace-tokenized, with binary payloads in standard base64 (no URL
//! variant, no line breaks).
//!
//! # Grammar
//!
//! ```text
//! CONNECT <request_id> <host> <port>
//! OK      <request_id> <stream_id>
//! SEND    <stream_id>  <seq> [<base64>]
//! RECV    <stream_id>  <seq> [<base64>]
//! CLOSE   <stream_id>
//! CLOSED  <request_id>
//! FAIL    <request_id> <reason...>
//! ```
//!
//! `SEND`/`RECV` without the base64 token is the attachment form used by the
//! document transport profile: the payload travels as a chat document and
//! the frame text is the message caption. `FAIL <reason...>` is free text to
//! the end of the line.
//!
//! Unknown verbs decode to `Ok(None)` so unrelated chatter in the channel is
//! ignored rather than treated as a protocol violation. Lines that match a
//! known verb but not its production are errors; the dispatcher logs and
//! drops them without tearing the stream down (chat services can mangle
//! message text).

use crate::types::{RequestId, StreamId};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use thiserror::Error;

/// The transport's per-message size limit in bytes of frame text.
pub const FRAME_LIMIT: usize = 4096;

/// Digits reserved for the sequence number when budgeting payload space
/// (the decimal width of `u64::MAX`).
const SEQ_MAX_DIGITS: usize = 20;

/// Errors produced while encoding or decoding a frame.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame is missing its {0} field")]
    MissingField(&'static str),

    #[error("unexpected trailing tokens after a complete frame")]
    TrailingTokens,

    #[error("invalid port number {0:?}")]
    InvalidPort(String),

    #[error("invalid sequence number {0:?}")]
    InvalidSeq(String),

    #[error("invalid base64 payload: {0}")]
    BadPayload(#[from] base64::DecodeError),

    #[error("frame token contains whitespace: {0:?}")]
    WhitespaceInToken(String),

    #[error("encoded frame is {size} bytes, above the {limit}-byte frame limit")]
    TooLarge { size: usize, limit: usize },
}

/// Payload of a data frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Payload carried inline as base64 text (the canonical profile).
    Inline(Bytes),
    /// Payload carried as a chat document; the frame text is the caption.
    Attached,
}

/// A single decoded tunnel frame.
///
/// Produced by one parser; handlers dispatch on the variant instead of
/// re-matching the raw text per verb.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Client asks the server peer to dial `host:port`.
    Connect {
        request_id: RequestId,
        host: String,
        port: u16,
    },
    /// Server confirms the dial and announces the stream id.
    Ok {
        request_id: RequestId,
        stream_id: StreamId,
    },
    /// Client-to-origin data, `seq` ascending from 0 per stream.
    Send {
        stream_id: StreamId,
        seq: u64,
        payload: Payload,
    },
    /// Origin-to-client data, `seq` ascending from 0 per stream.
    Recv {
        stream_id: StreamId,
        seq: u64,
        payload: Payload,
    },
    /// Client asks the server to close the stream's socket.
    Close { stream_id: StreamId },
    /// The stream is gone; the client drops its state for the request.
    Closed { request_id: RequestId },
    /// The dial failed; resolves the client's pending open.
    Fail {
        request_id: RequestId,
        reason: String,
    },
}

impl Frame {
    /// Decodes one line of frame text.
    ///
    /// Returns `Ok(None)` when the first token is not a known verb, so
    /// unrelated messages in the chat pass through silently. Returns an
    /// error when a known verb's production does not match.
    pub fn parse(text: &str) -> Result<Option<Frame>, FrameError> {
        let text = text.trim_end_matches(['\r', '\n']);
        let mut tokens = text.split_whitespace();
        let Some(verb) = tokens.next() else {
            return Ok(None);
        };

        let frame = match verb {
            "CONNECT" => {
                let request_id = next_token(&mut tokens, "request_id")?;
                let host = next_token(&mut tokens, "host")?;
                let port = next_token(&mut tokens, "port")?;
                let port: u16 = port.parse().map_err(|_| FrameError::InvalidPort(port))?;
                finish(tokens)?;
                Frame::Connect {
                    request_id: RequestId::new(request_id),
                    host,
                    port,
                }
            }
            "OK" => {
                let request_id = next_token(&mut tokens, "request_id")?;
                let stream_id = next_token(&mut tokens, "stream_id")?;
                finish(tokens)?;
                Frame::Ok {
                    request_id: RequestId::new(request_id),
                    stream_id: StreamId::new(stream_id),
                }
            }
            "SEND" | "RECV" => {
                let stream_id = next_token(&mut tokens, "stream_id")?;
                let seq = next_token(&mut tokens, "seq")?;
                let seq: u64 = seq.parse().map_err(|_| FrameError::InvalidSeq(seq))?;
                let payload = match tokens.next() {
                    Some(b64) => Payload::Inline(Bytes::from(BASE64.decode(b64)?)),
                    None => Payload::Attached,
                };
                finish(tokens)?;
                let stream_id = StreamId::new(stream_id);
                if verb == "SEND" {
                    Frame::Send {
                        stream_id,
                        seq,
                        payload,
                    }
                } else {
                    Frame::Recv {
                        stream_id,
                        seq,
                        payload,
                    }
                }
            }
            "CLOSE" => {
                let stream_id = next_token(&mut tokens, "stream_id")?;
                finish(tokens)?;
                Frame::Close {
                    stream_id: StreamId::new(stream_id),
                }
            }
            "CLOSED" => {
                let request_id = next_token(&mut tokens, "request_id")?;
                finish(tokens)?;
                Frame::Closed {
                    request_id: RequestId::new(request_id),
                }
            }
            "FAIL" => {
                // The reason is free text to the end of the line, so it is
                // carved out of the raw input rather than the token stream.
                let rest = text
                    .trim_start()
                    .strip_prefix("FAIL")
                    .unwrap_or_default()
                    .trim_start();
                let Some((request_id, reason)) = split_first_token(rest) else {
                    return Err(FrameError::MissingField("request_id"));
                };
                if reason.is_empty() {
                    return Err(FrameError::MissingField("reason"));
                }
                Frame::Fail {
                    request_id: RequestId::new(request_id),
                    reason: reason.to_string(),
                }
            }
            _ => return Ok(None),
        };

        Ok(Some(frame))
    }

    /// Encodes this frame as a single line of text.
    ///
    /// Rejects tokens containing whitespace and output that would exceed
    /// [`FRAME_LIMIT`]; senders size their chunks with [`max_raw_payload`]
    /// so a well-formed data frame always fits.
    pub fn encode(&self) -> Result<String, FrameError> {
        let text = match self {
            Frame::Connect {
                request_id,
                host,
                port,
            } => {
                check_token(request_id.as_str())?;
                check_token(host)?;
                format!("CONNECT {request_id} {host} {port}")
            }
            Frame::Ok {
                request_id,
                stream_id,
            } => {
                check_token(request_id.as_str())?;
                check_token(stream_id.as_str())?;
                format!("OK {request_id} {stream_id}")
            }
            Frame::Send {
                stream_id,
                seq,
                payload,
            } => encode_data("SEND", stream_id, *seq, payload)?,
            Frame::Recv {
                stream_id,
                seq,
                payload,
            } => encode_data("RECV", stream_id, *seq, payload)?,
            Frame::Close { stream_id } => {
                check_token(stream_id.as_str())?;
                format!("CLOSE {stream_id}")
            }
            Frame::Closed { request_id } => {
                check_token(request_id.as_str())?;
                format!("CLOSED {request_id}")
            }
            Frame::Fail { request_id, reason } => {
                check_token(request_id.as_str())?;
                let reason = reason.trim();
                if reason.is_empty() {
                    return Err(FrameError::MissingField("reason"));
                }
                if reason.contains(['\r', '\n']) {
                    return Err(FrameError::WhitespaceInToken(reason.to_string()));
                }
                format!("FAIL {request_id} {reason}")
            }
        };

        if text.len() > FRAME_LIMIT {
            return Err(FrameError::TooLarge {
                size: text.len(),
                limit: FRAME_LIMIT,
            });
        }
        Ok(text)
    }
}

fn encode_data(
    verb: &str,
    stream_id: &StreamId,
    seq: u64,
    payload: &Payload,
) -> Result<String, FrameError> {
    check_token(stream_id.as_str())?;
    Ok(match payload {
        Payload::Inline(data) => {
            format!("{verb} {stream_id} {seq} {}", BASE64.encode(data))
        }
        Payload::Attached => format!("{verb} {stream_id} {seq}"),
    })
}

fn next_token<'a>(
    tokens: &mut impl Iterator<Item = &'a str>,
    field: &'static str,
) -> Result<String, FrameError> {
    tokens
        .next()
        .map(str::to_string)
        .ok_or(FrameError::MissingField(field))
}

fn finish<'a>(mut tokens: impl Iterator<Item = &'a str>) -> Result<(), FrameError> {
    if tokens.next().is_some() {
        return Err(FrameError::TrailingTokens);
    }
    Ok(())
}

fn split_first_token(s: &str) -> Option<(&str, &str)> {
    let s = s.trim_start();
    if s.is_empty() {
        return None;
    }
    match s.find(char::is_whitespace) {
        Some(at) => Some((&s[..at], s[at..].trim_start())),
        None => Some((s, "")),
    }
}

fn check_token(token: &str) -> Result<(), FrameError> {
    if token.is_empty() || token.chars().any(char::is_whitespace) {
        return Err(FrameError::WhitespaceInToken(token.to_string()));
    }
    Ok(())
}

/// Text bytes left for the base64 payload of a data frame on this stream,
/// after the verb, stream id, and a worst-case sequence number.
pub fn text_budget(stream_id: &StreamId) -> usize {
    // "SEND <stream_id> <seq> " with the widest possible seq.
    let overhead = "SEND ".len() + stream_id.as_str().len() + 1 + SEQ_MAX_DIGITS + 1;
    FRAME_LIMIT.saturating_sub(overhead)
}

/// Largest raw chunk that still fits a data frame once base64-expanded.
///
/// Senders flush their write buffers at this size; invariant: a chunk of
/// this size encodes to a frame no longer than [`FRAME_LIMIT`].
pub fn max_raw_payload(stream_id: &StreamId) -> usize {
    text_budget(stream_id) / 4 * 3
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn sid() -> StreamId {
        StreamId::new("s1")
    }

    #[test]
    fn parse_connect() {
        let frame = Frame::parse("CONNECT abc example.com 443").unwrap().unwrap();
        assert_eq!(
            frame,
            Frame::Connect {
                request_id: RequestId::new("abc"),
                host: "example.com".into(),
                port: 443,
            }
        );
    }

    #[test]
    fn parse_ok_and_closed() {
        assert_eq!(
            Frame::parse("OK r1 s1").unwrap().unwrap(),
            Frame::Ok {
                request_id: RequestId::new("r1"),
                stream_id: StreamId::new("s1"),
            }
        );
        assert_eq!(
            Frame::parse("CLOSED r1").unwrap().unwrap(),
            Frame::Closed {
                request_id: RequestId::new("r1"),
            }
        );
    }

    #[test]
    fn parse_send_with_inline_payload() {
        let frame = Frame::parse("SEND s1 7 aGVsbG8=").unwrap().unwrap();
        assert_eq!(
            frame,
            Frame::Send {
                stream_id: sid(),
                seq: 7,
                payload: Payload::Inline(Bytes::from_static(b"hello")),
            }
        );
    }

    #[test]
    fn parse_recv_attachment_form() {
        let frame = Frame::parse("RECV s1 0").unwrap().unwrap();
        assert_eq!(
            frame,
            Frame::Recv {
                stream_id: sid(),
                seq: 0,
                payload: Payload::Attached,
            }
        );
    }

    #[test]
    fn parse_fail_keeps_reason_text() {
        let frame = Frame::parse("FAIL r1 connection refused by origin")
            .unwrap()
            .unwrap();
        assert_eq!(
            frame,
            Frame::Fail {
                request_id: RequestId::new("r1"),
                reason: "connection refused by origin".into(),
            }
        );
    }

    #[test]
    fn unknown_verbs_are_ignored_not_errors() {
        assert!(Frame::parse("HELLO everyone").unwrap().is_none());
        assert!(Frame::parse("").unwrap().is_none());
        assert!(Frame::parse("   ").unwrap().is_none());
    }

    #[test]
    fn malformed_known_verbs_are_errors() {
        assert!(Frame::parse("CONNECT abc example.com").is_err());
        assert!(Frame::parse("CONNECT abc example.com notaport").is_err());
        assert!(Frame::parse("SEND s1 notaseq aGVsbG8=").is_err());
        assert!(Frame::parse("SEND s1 0 !!!notbase64!!!").is_err());
        assert!(Frame::parse("OK r1 s1 extra").is_err());
    }

    #[test]
    fn encode_decode_roundtrip() {
        let frames = [
            Frame::Connect {
                request_id: RequestId::new("r1"),
                host: "example.com".into(),
                port: 80,
            },
            Frame::Ok {
                request_id: RequestId::new("r1"),
                stream_id: sid(),
            },
            Frame::Send {
                stream_id: sid(),
                seq: 3,
                payload: Payload::Inline(Bytes::from_static(b"\x00\x01\xff")),
            },
            Frame::Recv {
                stream_id: sid(),
                seq: 0,
                payload: Payload::Attached,
            },
            Frame::Close { stream_id: sid() },
            Frame::Closed {
                request_id: RequestId::new("r1"),
            },
            Frame::Fail {
                request_id: RequestId::new("r1"),
                reason: "dial timed out".into(),
            },
        ];
        for frame in frames {
            let text = frame.encode().unwrap();
            let parsed = Frame::parse(&text).unwrap().unwrap();
            assert_eq!(parsed, frame);
        }
    }

    #[test]
    fn encode_rejects_whitespace_in_tokens() {
        let frame = Frame::Connect {
            request_id: RequestId::new("r1"),
            host: "bad host".into(),
            port: 80,
        };
        assert!(frame.encode().is_err());
    }

    #[test]
    fn max_payload_chunk_fits_the_frame_limit() {
        let stream_id = StreamId::generate();
        let chunk = vec![0xABu8; max_raw_payload(&stream_id)];
        let frame = Frame::Send {
            stream_id,
            seq: u64::MAX,
            payload: Payload::Inline(Bytes::from(chunk)),
        };
        let text = frame.encode().unwrap();
        assert!(text.len() <= FRAME_LIMIT, "frame is {} bytes", text.len());
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let stream_id = StreamId::generate();
        let chunk = vec![0u8; max_raw_payload(&stream_id) + 3];
        let frame = Frame::Send {
            stream_id,
            seq: 0,
            payload: Payload::Inline(Bytes::from(chunk)),
        };
        assert!(matches!(frame.encode(), Err(FrameError::TooLarge { .. })));
    }

    #[test]
    fn payload_bytes_survive_base64_verbatim() {
        let data: Vec<u8> = (0..=255).collect();
        let frame = Frame::Recv {
            stream_id: sid(),
            seq: 1,
            payload: Payload::Inline(Bytes::from(data.clone())),
        };
        let text = frame.encode().unwrap();
        match Frame::parse(&text).unwrap().unwrap() {
            Frame::Recv {
                payload: Payload::Inline(decoded),
                ..
            } => assert_eq!(&decoded[..], &data[..]),
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}
