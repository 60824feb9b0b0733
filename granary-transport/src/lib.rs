//! # Granary Transport
//!
//! Long-lived, framed connections between cluster nodes.
//!
//! Each (local node, remote peer) pair gets one connection per direction.
//! A connection opens with a preamble handshake (cluster id and protocol
//! version are validated, mismatches are fatal), then carries messages as
//! length-prefixed frames:
//!
//! ```text
//! [4-byte header length][4-byte body length][header bytes][body bytes]
//! ```
//!
//! ## Components
//!
//! | Component | Purpose |
//! |-----------|---------|
//! | [`wire`] | Frame encode/decode with incremental reassembly |
//! | [`PrefixWriter`] | Length-prefix emission without double-copying |
//! | [`Preamble`] | Connection-open identification packet |
//! | [`Connection`] | One peer link: writer task + reader loop + reconnect |
//! | [`ConnectionManager`] | Connection-per-peer multiplexing and accept loop |

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

/// Transport error types.
pub mod error;

/// Frame encoding and incremental decoding.
pub mod wire;

/// Prefix-buffer writer for emitting length headers.
pub mod prefix;

/// Connection-open handshake packet.
pub mod preamble;

/// A single peer connection.
pub mod connection;

/// Connection-per-peer management.
pub mod manager;

pub use connection::{Connection, ConnectionConfig};
pub use error::TransportError;
pub use manager::{ConnectionManager, InboundReceiver};
pub use preamble::{NETWORK_PROTOCOL_VERSION, NodeIdentity, Preamble};
pub use prefix::{ByteSink, PrefixWriter, SegmentPool};
pub use wire::{
    FRAME_PREFIX_SIZE, MAX_FRAME_SIZE, WireError, decode_message, encode_message,
    try_decode_frame,
};
