//! The activation catalog: creating, indexing, and destroying the
//! activations hosted on this silo.
//!
//! Creation is idempotent — concurrent callers observe one activation —
//! and registration with the cluster directory decides the global winner:
//! when another silo won the race, the local activation is torn down and
//! the caller is pointed at the winner. Certain deactivation reasons put
//! the grain id in a cool-down set that blocks immediate re-activation.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use granary_core::{ActivationAddress, ActivationId, GrainId, GrainType, SiloAddress, epoch_ms};

use crate::config::SiloConfig;
use crate::directory::{DirectoryError, GrainDirectory};
use crate::grain::{DeactivationReason, Grain, SiloServices};
use crate::placement::PlacementStrategy;
use crate::router::MessageRouter;
use crate::scheduler::{ActivationHandle, Dispatcher, ReentrancyPolicy};

/// Builds a fresh grain instance for an identity.
pub type GrainFactory = Arc<dyn Fn(&GrainId) -> Box<dyn Grain> + Send + Sync>;

/// Everything the runtime knows about one grain type.
#[derive(Clone)]
pub struct GrainRegistration {
    /// The type tag messages dispatch on.
    pub kind: GrainType,
    /// Placement hint for new activations.
    pub placement: PlacementStrategy,
    /// Interleaving policy for the type's activations.
    pub reentrancy: ReentrancyPolicy,
    /// Instance factory.
    pub factory: GrainFactory,
}

impl fmt::Debug for GrainRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GrainRegistration")
            .field("kind", &self.kind)
            .field("placement", &self.placement)
            .field("reentrancy", &self.reentrancy)
            .finish()
    }
}

impl GrainRegistration {
    /// Registration for a `Default`-constructible grain type.
    pub fn new<G: Grain + Default>(kind: GrainType) -> Self {
        Self::with_factory(kind, Arc::new(|_| Box::new(G::default())))
    }

    /// Registration with an explicit factory.
    pub fn with_factory(kind: GrainType, factory: GrainFactory) -> Self {
        Self {
            kind,
            placement: PlacementStrategy::default(),
            reentrancy: ReentrancyPolicy::default(),
            factory,
        }
    }

    /// Set the placement strategy.
    pub fn placement(mut self, placement: PlacementStrategy) -> Self {
        self.placement = placement;
        self
    }

    /// Set the reentrancy policy.
    pub fn reentrancy(mut self, reentrancy: ReentrancyPolicy) -> Self {
        self.reentrancy = reentrancy;
        self
    }
}

/// The dispatch table from grain type tag to registration.
#[derive(Debug, Default)]
pub struct GrainRegistry {
    types: HashMap<u32, GrainRegistration>,
}

impl GrainRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a registration (replacing any previous one for the tag).
    pub fn register(&mut self, registration: GrainRegistration) {
        self.types.insert(registration.kind.0, registration);
    }

    /// Look up a registration by type tag.
    pub fn get(&self, kind: GrainType) -> Option<&GrainRegistration> {
        self.types.get(&kind.0)
    }
}

/// Errors from catalog operations.
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    /// No registration exists for the grain's type tag.
    #[error("unknown grain type {0}")]
    UnknownGrainType(GrainType),

    /// The grain is cooling down after a failed activation.
    #[error("grain {0} is in activation cool-down")]
    InCooldown(GrainId),

    /// Another silo's activation won the registration race.
    #[error("registration lost to {0}")]
    LostRace(ActivationAddress),

    /// The existing activation is stopping; retry shortly.
    #[error("activation of {0} is stopping")]
    Stopping(GrainId),

    /// The catalog is not wired to a router yet, or the silo is gone.
    #[error("catalog is not running")]
    NotRunning,

    /// Directory interaction failed.
    #[error(transparent)]
    Directory(#[from] DirectoryError),
}

/// Per-grain-id set of local activations. Singular for ordinary grains;
/// stateless workers keep a pool.
#[derive(Debug, Default)]
struct ActivationSet {
    handles: Vec<Arc<ActivationHandle>>,
    round_robin: usize,
}

/// The local activation index.
pub struct ActivationCatalog {
    local: SiloAddress,
    registry: Arc<GrainRegistry>,
    config: SiloConfig,
    services: Arc<SiloServices>,
    activations: Mutex<HashMap<GrainId, ActivationSet>>,
    cooldown: Mutex<HashMap<GrainId, u64>>,
    next_activation: AtomicU64,
    router: OnceLock<Weak<MessageRouter>>,
    directory: OnceLock<Arc<GrainDirectory>>,
}

impl fmt::Debug for ActivationCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActivationCatalog")
            .field("local", &self.local)
            .field("activations", &self.len())
            .finish()
    }
}

impl ActivationCatalog {
    /// Catalog for `local`. Wire the router and directory with
    /// [`attach`](Self::attach) before use.
    pub fn new(
        local: SiloAddress,
        registry: Arc<GrainRegistry>,
        config: SiloConfig,
        services: Arc<SiloServices>,
    ) -> Self {
        Self {
            local,
            registry,
            config,
            services,
            activations: Mutex::new(HashMap::new()),
            cooldown: Mutex::new(HashMap::new()),
            next_activation: AtomicU64::new(1),
            router: OnceLock::new(),
            directory: OnceLock::new(),
        }
    }

    /// Late-bind the router and directory (they are built after the
    /// catalog; the router holds the catalog strongly, so the back edge
    /// is weak).
    pub fn attach(&self, router: Weak<MessageRouter>, directory: Arc<GrainDirectory>) {
        let _ = self.router.set(router);
        let _ = self.directory.set(directory);
    }

    /// Number of live local activations.
    pub fn len(&self) -> usize {
        self.activations.lock().values().map(|s| s.handles.len()).sum()
    }

    /// Whether no activations are hosted.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Find a specific activation by exact address.
    pub fn find(&self, address: &ActivationAddress) -> Option<Arc<ActivationHandle>> {
        self.activations
            .lock()
            .get(&address.grain)?
            .handles
            .iter()
            .find(|h| h.address().activation == address.activation)
            .cloned()
    }

    /// Get the live activation for a grain, creating one if needed.
    ///
    /// Returns the handle plus whether it already existed.
    ///
    /// # Errors
    ///
    /// See [`CatalogError`]; `LostRace` carries the address the caller
    /// should forward to.
    pub async fn get_or_create(
        &self,
        grain: &GrainId,
    ) -> Result<(Arc<ActivationHandle>, bool), CatalogError> {
        let registration = self
            .registry
            .get(grain.kind)
            .ok_or(CatalogError::UnknownGrainType(grain.kind))?
            .clone();

        {
            let mut cooldown = self.cooldown.lock();
            if let Some(until) = cooldown.get(grain) {
                if *until > epoch_ms() {
                    return Err(CatalogError::InCooldown(grain.clone()));
                }
                cooldown.remove(grain);
            }
        }

        let stateless_pool = match registration.placement {
            PlacementStrategy::StatelessWorker { max_local } => Some(max_local.max(1)),
            _ => None,
        };

        let router = self
            .router
            .get()
            .and_then(Weak::upgrade)
            .ok_or(CatalogError::NotRunning)?;

        // Fast path plus insertion under one lock; slow async work
        // (directory registration) happens after release.
        let (handle, existed) = {
            let mut activations = self.activations.lock();
            let set = activations.entry(grain.clone()).or_default();
            let live: Vec<_> = set
                .handles
                .iter()
                .filter(|h| !h.is_stopping())
                .cloned()
                .collect();

            match stateless_pool {
                Some(max_local) if live.len() >= max_local => {
                    // Pool is full: hand out workers round-robin.
                    set.round_robin = (set.round_robin + 1) % live.len();
                    (live[set.round_robin].clone(), true)
                }
                None if !live.is_empty() => (live[0].clone(), true),
                _ => {
                    if stateless_pool.is_none() && !set.handles.is_empty() && live.is_empty() {
                        // The previous activation is still draining.
                        return Err(CatalogError::Stopping(grain.clone()));
                    }
                    let id = ActivationId::new(self.next_activation.fetch_add(1, Ordering::Relaxed));
                    let address = ActivationAddress::new(grain.clone(), self.local, id);
                    let (handle, rx) = ActivationHandle::new(address);
                    set.handles.push(handle.clone());
                    let dispatcher = Dispatcher {
                        grain: (registration.factory)(grain),
                        handle: handle.clone(),
                        policy: registration.reentrancy.clone(),
                        catalog: router.catalog_weak(),
                        router: router.clone(),
                        services: self.services.clone(),
                        drain_window: self.config.stop_drain_window,
                        rx,
                    };
                    tokio::spawn(dispatcher.run());
                    (handle, false)
                }
            }
        };

        if existed {
            return Ok((handle, true));
        }

        // Stateless workers and pinned system grains skip the directory:
        // they have no cluster-wide uniqueness to arbitrate.
        if stateless_pool.is_some() || grain.pinned_silo().is_some() {
            return Ok((handle, false));
        }

        let directory = self.directory.get().ok_or(CatalogError::NotRunning)?;
        let winner = directory.register(handle.address().clone()).await?;
        if winner != *handle.address() {
            debug!(grain = %grain, %winner, "lost registration race, deactivating local");
            handle.request_stop(DeactivationReason::DuplicateActivation);
            return Err(CatalogError::LostRace(winner));
        }
        Ok((handle, false))
    }

    /// Ask an activation to deactivate.
    pub fn deactivate(&self, address: &ActivationAddress, reason: DeactivationReason) {
        if let Some(handle) = self.find(address) {
            info!(activation = %address, %reason, "deactivation requested");
            handle.request_stop(reason);
        }
    }

    /// Dispatcher-side completion: drop the handle, unregister from the
    /// directory, start a cool-down when warranted, and publish the
    /// now-stale address for cache invalidation.
    pub(crate) async fn finish_deactivation(
        &self,
        address: &ActivationAddress,
        reason: &DeactivationReason,
    ) {
        {
            let mut activations = self.activations.lock();
            if let Some(set) = activations.get_mut(&address.grain) {
                set.handles
                    .retain(|h| h.address().activation != address.activation);
                if set.handles.is_empty() {
                    activations.remove(&address.grain);
                }
            }
        }

        if reason.blocks_reactivation() {
            let until = epoch_ms() + self.config.activation_cooldown.as_millis() as u64;
            self.cooldown.lock().insert(address.grain.clone(), until);
        }

        if let Some(router) = self.router.get().and_then(Weak::upgrade) {
            router.note_stale(address.clone());
        }

        // Losers of a registration race must not evict the winner.
        if *reason != DeactivationReason::DuplicateActivation
            && address.grain.pinned_silo().is_none()
            && let Some(directory) = self.directory.get()
            && let Err(e) = directory.unregister(address).await
        {
            warn!(activation = %address, error = %e, "directory unregister failed");
        }
    }

    /// Collect activations idle past the configured age.
    pub fn sweep_idle(&self) {
        let cutoff = epoch_ms().saturating_sub(self.config.activation_idle_age.as_millis() as u64);
        let idle: Vec<Arc<ActivationHandle>> = self
            .activations
            .lock()
            .values()
            .flat_map(|s| s.handles.iter())
            .filter(|h| !h.is_stopping() && h.last_activity_ms() < cutoff)
            .cloned()
            .collect();
        for handle in idle {
            debug!(activation = %handle.address(), "collecting idle activation");
            handle.request_stop(DeactivationReason::Idle);
        }
    }

    /// Stop every activation (silo shutdown) and wait for the catalog to
    /// drain, up to `timeout`.
    pub async fn deactivate_all(&self, timeout: std::time::Duration) {
        let handles: Vec<Arc<ActivationHandle>> = self
            .activations
            .lock()
            .values()
            .flat_map(|s| s.handles.iter())
            .cloned()
            .collect();
        for handle in handles {
            handle.request_stop(DeactivationReason::ShuttingDown);
        }

        let deadline = tokio::time::Instant::now() + timeout;
        while !self.is_empty() {
            if tokio::time::Instant::now() >= deadline {
                warn!(remaining = self.len(), "shutdown drain timed out");
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    }
}
