//! Connection-open handshake packet.
//!
//! Each side of a fresh connection sends a [`Preamble`] before any frame:
//! who it is, which protocol version it speaks, and which cluster it
//! belongs to. Both sides validate; cluster-id or protocol-version
//! mismatch closes the connection with a fatal error.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use granary_core::SiloAddress;

use crate::error::TransportError;

/// Version of the framing and header layout spoken on the wire.
pub const NETWORK_PROTOCOL_VERSION: u32 = 1;

/// Upper bound on a serialized preamble; anything larger is malformed.
const MAX_PREAMBLE_SIZE: usize = 64 * 1024;

/// Who is on the other end of a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeIdentity {
    /// A peer silo, identified by its full address (endpoint + generation).
    Silo(SiloAddress),
    /// An external client, identified by an opaque id.
    Client(String),
}

impl NodeIdentity {
    /// The silo address, when this identity is a peer silo.
    pub fn silo(&self) -> Option<SiloAddress> {
        match self {
            NodeIdentity::Silo(silo) => Some(*silo),
            NodeIdentity::Client(_) => None,
        }
    }
}

impl std::fmt::Display for NodeIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeIdentity::Silo(silo) => write!(f, "{silo}"),
            NodeIdentity::Client(id) => write!(f, "client-{id}"),
        }
    }
}

/// The identification packet exchanged at connection setup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Preamble {
    /// Identity of the sending node. For peer silos this carries the full
    /// silo address; clients send an opaque id.
    pub node: NodeIdentity,
    /// Network protocol version of the sender.
    pub protocol_version: u32,
    /// Cluster the sender belongs to. Mismatch is fatal.
    pub cluster_id: String,
}

impl Preamble {
    /// Preamble for a peer silo.
    pub fn silo(silo: SiloAddress, cluster_id: impl Into<String>) -> Self {
        Self {
            node: NodeIdentity::Silo(silo),
            protocol_version: NETWORK_PROTOCOL_VERSION,
            cluster_id: cluster_id.into(),
        }
    }

    /// Preamble for an external client.
    pub fn client(client_id: impl Into<String>, cluster_id: impl Into<String>) -> Self {
        Self {
            node: NodeIdentity::Client(client_id.into()),
            protocol_version: NETWORK_PROTOCOL_VERSION,
            cluster_id: cluster_id.into(),
        }
    }

    /// Validate a peer's preamble against our own expectations.
    ///
    /// # Errors
    ///
    /// [`TransportError::ClusterIdMismatch`] or
    /// [`TransportError::ProtocolVersionMismatch`]; both are fatal for the
    /// connection that produced them.
    pub fn validate(&self, expected_cluster: &str) -> Result<(), TransportError> {
        if self.cluster_id != expected_cluster {
            return Err(TransportError::ClusterIdMismatch {
                ours: expected_cluster.to_string(),
                theirs: self.cluster_id.clone(),
            });
        }
        if self.protocol_version != NETWORK_PROTOCOL_VERSION {
            return Err(TransportError::ProtocolVersionMismatch {
                ours: NETWORK_PROTOCOL_VERSION,
                theirs: self.protocol_version,
            });
        }
        Ok(())
    }
}

/// Write a length-prefixed preamble to the stream.
///
/// # Errors
///
/// Propagates serialization and socket errors.
pub async fn write_preamble<W: AsyncWrite + Unpin>(
    stream: &mut W,
    preamble: &Preamble,
) -> Result<(), TransportError> {
    let bytes = serde_json::to_vec(preamble)?;
    stream.write_all(&(bytes.len() as u32).to_le_bytes()).await?;
    stream.write_all(&bytes).await?;
    stream.flush().await?;
    Ok(())
}

/// Read a length-prefixed preamble from the stream.
///
/// # Errors
///
/// Propagates socket errors; malformed or oversized preambles surface as
/// header codec / io errors.
pub async fn read_preamble<R: AsyncRead + Unpin>(stream: &mut R) -> Result<Preamble, TransportError> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_PREAMBLE_SIZE {
        return Err(TransportError::Io(std::io::Error::other(
            "preamble too large",
        )));
    }
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    Ok(serde_json::from_slice(&buf)?)
}
