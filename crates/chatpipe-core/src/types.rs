//! Identifier types for tunnel requests and streams.
//!
//! Both identifiers are **newtypes** over `String` so the type system keeps
//! them apart: a `RequestId` names a pending or established tunnel from the
//! perspective of the client peer, a `StreamId` names the live byte-stream
//! from the perspective of the server peer. Passing one where the other is
//! expected would compile fine if both were plain `String`s.
//!
//! Generated identifiers are 128 bits of randomness rendered as 32 lowercase
//! hex characters (UUID v4 without hyphens), unique per peer process.

use std::fmt;

/// Identifies a tunnel request, assigned by the client peer.
///
/// Created when the client emits a `CONNECT` frame and used to match the
/// server's `OK` / `FAIL` / `CLOSED` responses back to the waiting opener.
/// Never reused for the lifetime of the peer process.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestId(String);

impl RequestId {
    /// Wraps an existing identifier (e.g. parsed from a frame).
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a fresh random identifier.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    /// Returns the inner string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies an established tunnel stream, assigned by the server peer
/// at the moment it dials the target.
///
/// One `StreamId` corresponds to exactly one TCP connection on the server
/// peer and one pipe pair on the client peer. Never reused.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamId(String);

impl StreamId {
    /// Wraps an existing identifier (e.g. parsed from a frame).
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a fresh random identifier.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    /// Returns the inner string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
