//! # Granary Core
//!
//! Addressing, identity, and message types shared by every layer of the
//! granary virtual-actor runtime.
//!
//! This crate is deliberately small: it defines *what* travels between
//! silos (grain identities, activation addresses, message headers) and
//! leaves *how* it travels to `granary-transport` and the runtime crate.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │  granary          (runtime: directory, router)  │
//! ├─────────────────────────────────────────────────┤
//! │  granary-transport (connections, wire framing)  │
//! ├─────────────────────────────────────────────────┤
//! │  granary-core      (identity, messages, codec)  │
//! └─────────────────────────────────────────────────┘
//! ```

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

/// Network and silo addressing.
pub mod types;

/// Grain identity and activation addressing.
pub mod grain;

/// The message model: headers, directions, rejections.
pub mod message;

/// Pluggable body serialization.
pub mod codec;

pub use codec::{CodecError, JsonCodec, MessageCodec};
pub use grain::{ActivationAddress, ActivationId, GrainId, GrainKey, GrainType};
pub use message::{
    CorrelationId, Direction, Message, MessageBuilder, RejectionKind, RequestContext,
};
pub use types::{MembershipVersion, NetworkAddress, NetworkAddressParseError, SiloAddress};

/// Milliseconds since the Unix epoch.
///
/// Message expiries and membership timestamps are exchanged between
/// processes, so they are wall-clock based rather than `Instant` based.
pub fn epoch_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
