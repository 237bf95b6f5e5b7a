//! # chatpipe-core
//!
//! Shared library for the chatpipe tunnel: the frame codec, the chat
//! transport client, the virtual byte-pipe, receive-side reordering, peer
//! configuration, and the poll loop both peers run.
//!
//! The two peer crates (`chatpipe-client`, `chatpipe-server`) build their
//! tunnel engines on top of these pieces.

pub mod config;
pub mod frame;
pub mod pipe;
pub mod poll;
pub mod reorder;
pub mod transport;
pub mod types;
