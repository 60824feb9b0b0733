//! Cluster membership: the shared, versioned roster of silos.
//!
//! Three layers:
//!
//! - [`table`] — the data model: rows, statuses, the version row.
//! - [`backend`] — pluggable shared storage with optimistic concurrency.
//! - [`oracle`] — the protocol driver: join, heartbeat, probe, suspicion,
//!   death declaration, graceful shutdown.

pub mod backend;
pub mod oracle;
pub mod table;

pub use backend::{InMemoryMembershipTable, MembershipBackend, MembershipError};
pub use oracle::{ClusterSnapshot, MembershipOracle, Prober};
pub use table::{MembershipEntry, MembershipTable, SiloStatus, TableVersion};
