//! # chatpipe-server
//!
//! The server peer of the chatpipe tunnel. It runs at the egress, polls
//! the chat channel for `CONNECT` frames, dials the requested origins, and
//! relays bytes between each origin socket and the tunnel's data frames.
//!
//! The binary wires [`engine::TunnelServer`] to the production Bot API
//! transport; tests drive it over in-memory channels.

pub mod engine;
