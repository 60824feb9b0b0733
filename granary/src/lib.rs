//! # Granary
//!
//! A distributed virtual-actor runtime: a cluster of silos hosts a large
//! population of fine-grained, addressable grains. Callers invoke grains
//! by identity; the runtime finds or creates an activation on some silo,
//! routes the request there, guarantees one turn at a time per
//! activation, and collects idle activations transparently.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │  Silo (composition root, lifecycle)                      │
//! │  ┌────────────┐  ┌───────────┐  ┌─────────────────────┐  │
//! │  │ Membership │  │ Directory │  │ Placement           │  │
//! │  │ oracle     │  │ ring+cache│  │ strategies          │  │
//! │  └─────┬──────┘  └─────┬─────┘  └──────────┬──────────┘  │
//! │        └───────────────┼───────────────────┘             │
//! │                 ┌──────┴──────┐                          │
//! │                 │   Router    │  callbacks, retries,     │
//! │                 │             │  rejections, expiry      │
//! │                 └──────┬──────┘                          │
//! │        ┌───────────────┼───────────────┐                 │
//! │  ┌─────┴─────┐  ┌──────┴──────┐  ┌─────┴─────┐           │
//! │  │  Catalog  │  │  Scheduler  │  │ Timers /  │           │
//! │  │           │  │ (per-activ.)│  │ Reminders │           │
//! │  └───────────┘  └─────────────┘  └───────────┘           │
//! ├──────────────────────────────────────────────────────────┤
//! │  granary-transport: preamble handshake, framed links     │
//! ├──────────────────────────────────────────────────────────┤
//! │  granary-core: identity, messages, codecs                │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick start
//!
//! ```rust,ignore
//! let backend = Arc::new(InMemoryMembershipTable::new());
//! let silo = Silo::builder(ClusterConfig::new("dev"))
//!     .bind(NetworkAddress::localhost(11111))
//!     .membership(backend)
//!     .register(GrainRegistration::new::<BankAccount>(BANK_ACCOUNT))
//!     .start()
//!     .await?;
//!
//! let resp: BalanceResponse = silo
//!     .call_typed(GrainId::text(BANK_ACCOUNT, "alice"), DEPOSIT, &DepositRequest { amount: 100 })
//!     .await?;
//! ```

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

/// Runtime configuration.
pub mod config;

/// Cluster membership: roster, liveness, failure detection.
pub mod membership;

/// The grain directory: identity → activation address.
pub mod directory;

/// Placement strategies and the placement director.
pub mod placement;

/// The grain abstraction and per-turn context.
pub mod grain;

/// The local activation catalog.
pub mod catalog;

/// Per-activation turn scheduling and reentrancy.
pub mod scheduler;

/// The message router and callback tracking.
pub mod router;

/// Local activation timers.
pub mod timers;

/// Durable reminders.
pub mod reminders;

/// Durable grain state I/O.
pub mod state;

/// Stream queue cache.
pub mod streams;

/// Per-grain transactional lock groups.
pub mod txn;

/// The silo host.
pub mod silo;

/// External cluster clients.
pub mod client;

pub use catalog::{ActivationCatalog, CatalogError, GrainRegistration, GrainRegistry};
pub use client::Client;
pub use config::{ClusterConfig, MembershipConfig, RouterConfig, SiloConfig};
pub use directory::{DirectoryError, GrainDirectory};
pub use grain::{DeactivationReason, Grain, GrainContext, GrainError, REMINDER_METHOD, SiloServices};
pub use membership::{
    ClusterSnapshot, InMemoryMembershipTable, MembershipBackend, MembershipError,
    MembershipOracle, SiloStatus,
};
pub use placement::{PlacementStrategy, SiloLoad};
pub use reminders::{InMemoryReminderStore, ReminderEntry, ReminderService, ReminderStore};
pub use router::{MessageRouter, RouterError};
pub use scheduler::ReentrancyPolicy;
pub use silo::{Silo, SiloBuilder, SiloError, SiloLifecycle};
pub use state::{GrainStateStore, InMemoryStateStore, PersistentState, StateError};
pub use streams::{QueueCache, QueueCacheConfig, SequenceToken, StreamId};
pub use txn::{
    AccessCounts, CommitRole, LockConfig, LockError, LockManager, TransactionInfo,
    TransactionRecord, TransactionalState, TxId,
};

// The core addressing and message types are part of this crate's public
// surface; re-export them so applications depend on one crate.
pub use granary_core::{
    ActivationAddress, ActivationId, CorrelationId, Direction, GrainId, GrainKey, GrainType,
    JsonCodec, Message, MessageCodec, NetworkAddress, RejectionKind, SiloAddress, epoch_ms,
};
pub use granary_transport::ConnectionConfig;
