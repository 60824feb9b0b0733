//! Transport error types.

use granary_core::SiloAddress;

use crate::wire::WireError;

/// Errors from connection setup and message transfer.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Underlying socket error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed frame on the wire.
    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    /// The peer belongs to a different cluster. Fatal: the connection is
    /// closed and never retried against the same preamble.
    #[error("cluster id mismatch: ours {ours:?}, theirs {theirs:?}")]
    ClusterIdMismatch {
        /// Local cluster id.
        ours: String,
        /// Cluster id announced by the peer.
        theirs: String,
    },

    /// The peer speaks an incompatible network protocol version. Fatal.
    #[error("protocol version mismatch: ours {ours}, theirs {theirs}")]
    ProtocolVersionMismatch {
        /// Local protocol version.
        ours: u32,
        /// Version announced by the peer.
        theirs: u32,
    },

    /// Handshake did not complete within the configured window.
    #[error("handshake timed out")]
    HandshakeTimeout,

    /// Header (de)serialization failed.
    #[error("header codec error: {0}")]
    HeaderCodec(#[from] serde_json::Error),

    /// The connection has been closed; the message was not sent.
    #[error("connection to {peer} closed")]
    ConnectionClosed {
        /// The unreachable peer.
        peer: String,
    },

    /// The outbound queue is full; the message was dropped.
    #[error("outbound queue to {peer} is full")]
    QueueFull {
        /// The congested peer.
        peer: String,
    },

    /// No connection is known for the addressed silo.
    #[error("no route to silo {0}")]
    NoRoute(SiloAddress),
}
