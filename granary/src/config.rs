//! Runtime configuration.
//!
//! Plain structs with defaults tuned for small local clusters. Everything
//! here is data; behavior lives with the component that reads it.

use std::time::Duration;

/// Cluster-wide settings shared by every silo and client.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Cluster identity; preamble mismatch on it is fatal.
    pub cluster_id: String,
    /// Logical service id, namespacing reminder and state rows.
    pub service_id: String,
}

impl ClusterConfig {
    /// Cluster config with the given id.
    pub fn new(cluster_id: impl Into<String>) -> Self {
        let cluster_id = cluster_id.into();
        Self {
            service_id: cluster_id.clone(),
            cluster_id,
        }
    }

    /// Override the service id.
    pub fn with_service_id(mut self, service_id: impl Into<String>) -> Self {
        self.service_id = service_id.into();
        self
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self::new("dev")
    }
}

/// Membership protocol timing and thresholds.
#[derive(Debug, Clone)]
pub struct MembershipConfig {
    /// Period between I-am-alive heartbeat writes.
    pub heartbeat_period: Duration,
    /// Period between liveness probes of ring-successor peers.
    pub probe_period: Duration,
    /// Timeout for one probe round-trip.
    pub probe_timeout: Duration,
    /// How many ring successors each silo probes.
    pub probe_fanout: usize,
    /// Distinct suspecting silos required to declare a silo Dead.
    pub suspector_threshold: usize,
    /// Sliding window inside which suspicions count.
    pub suspicion_window: Duration,
    /// Period between table refreshes feeding the local snapshot.
    pub refresh_period: Duration,
    /// Maximum optimistic-concurrency retries per table operation.
    pub max_contention_retries: u32,
    /// Initial backoff after a transient backend error.
    pub backend_retry_delay: Duration,
    /// Age after which Dead rows may be removed by cleanup.
    pub defunct_age: Duration,
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            heartbeat_period: Duration::from_secs(5),
            probe_period: Duration::from_secs(5),
            probe_timeout: Duration::from_secs(2),
            probe_fanout: 2,
            suspector_threshold: 2,
            suspicion_window: Duration::from_secs(60),
            refresh_period: Duration::from_secs(2),
            max_contention_retries: 8,
            backend_retry_delay: Duration::from_millis(50),
            defunct_age: Duration::from_secs(3600),
        }
    }
}

impl MembershipConfig {
    /// Aggressive timings for loopback test clusters.
    pub fn local() -> Self {
        Self {
            heartbeat_period: Duration::from_millis(200),
            probe_period: Duration::from_millis(200),
            probe_timeout: Duration::from_millis(150),
            probe_fanout: 2,
            suspector_threshold: 1,
            suspicion_window: Duration::from_secs(10),
            refresh_period: Duration::from_millis(100),
            max_contention_retries: 8,
            backend_retry_delay: Duration::from_millis(10),
            defunct_age: Duration::from_secs(60),
        }
    }
}

/// Router timeouts and retry policy.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Default deadline for application requests.
    pub response_timeout: Duration,
    /// Deadline for runtime-internal (system interface) requests.
    pub system_response_timeout: Duration,
    /// Retries before a rejected/failed request surfaces permanently.
    pub max_retries: u32,
    /// Delay before retrying after a GatewayTooBusy rejection.
    pub busy_retry_delay: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_secs(30),
            system_response_timeout: Duration::from_secs(10),
            max_retries: 3,
            busy_retry_delay: Duration::from_millis(250),
        }
    }
}

impl RouterConfig {
    /// Short timeouts for loopback test clusters.
    pub fn local() -> Self {
        Self {
            response_timeout: Duration::from_secs(5),
            system_response_timeout: Duration::from_secs(2),
            max_retries: 3,
            busy_retry_delay: Duration::from_millis(50),
        }
    }

    /// The callback sweep period: min(response timeout, 1s).
    pub fn sweep_period(&self) -> Duration {
        self.response_timeout.min(Duration::from_secs(1))
    }
}

/// Per-silo settings.
#[derive(Debug, Clone)]
pub struct SiloConfig {
    /// Human-readable host name for the membership table.
    pub host_name: String,
    /// Role tag recorded in the membership table.
    pub role: String,
    /// Capacity of the directory cache for non-owned entries.
    pub directory_cache_capacity: usize,
    /// Idle age after which an activation is collected.
    pub activation_idle_age: Duration,
    /// Period of the idle-activation sweep.
    pub activation_sweep_period: Duration,
    /// Cool-down applied to grains whose activation failed badly.
    pub activation_cooldown: Duration,
    /// How long a stopping activation keeps draining continuations.
    pub stop_drain_window: Duration,
    /// Default cap for stateless-worker local pools (per CPU).
    pub stateless_worker_multiplier: usize,
}

impl Default for SiloConfig {
    fn default() -> Self {
        Self {
            host_name: "localhost".to_string(),
            role: "default".to_string(),
            directory_cache_capacity: 100_000,
            activation_idle_age: Duration::from_secs(2 * 3600),
            activation_sweep_period: Duration::from_secs(60),
            activation_cooldown: Duration::from_secs(5),
            stop_drain_window: Duration::from_secs(5),
            stateless_worker_multiplier: 4,
        }
    }
}
