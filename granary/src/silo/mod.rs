//! The silo: one runtime process hosting grain activations.
//!
//! [`SiloBuilder`] wires the subsystems together — connections, catalog,
//! router, directory, membership oracle, reminders — and [`Silo`] drives
//! their lifecycle: join → Active → (ShuttingDown → Stopping → Dead).

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use granary_core::{GrainId, GrainType, JsonCodec, Message, MessageCodec, NetworkAddress, SiloAddress};
use granary_transport::{ConnectionConfig, ConnectionManager, Preamble, TransportError};

use crate::catalog::{ActivationCatalog, GrainRegistration, GrainRegistry};
use crate::config::{ClusterConfig, MembershipConfig, RouterConfig, SiloConfig};
use crate::directory::GrainDirectory;
use crate::grain::{DeactivationReason, GrainError, SiloServices};
use crate::membership::{MembershipBackend, MembershipError, MembershipOracle};
use crate::placement::{Placement, SiloLoad};
use crate::reminders::{ReminderService, ReminderStore};
use crate::router::{MessageRouter, RouterDirectoryTransport, RouterError, RouterProber};
use crate::state::GrainStateStore;

/// Lifecycle of a [`Silo`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SiloLifecycle {
    /// Subsystems constructed, membership join in progress.
    Initializing,
    /// Serving requests.
    Active,
    /// Draining activations and leaving the cluster.
    Stopping,
    /// Gone. The generation is burned.
    Stopped,
}

/// Errors from silo startup.
#[derive(Debug, thiserror::Error)]
pub enum SiloError {
    /// No bind endpoint was configured.
    #[error("no bind endpoint configured")]
    MissingEndpoint,

    /// No membership backend was configured.
    #[error("no membership backend configured")]
    MissingMembership,

    /// Listener or connection setup failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Joining the cluster failed.
    #[error(transparent)]
    Membership(#[from] MembershipError),
}

/// Builder for [`Silo`].
///
/// # Example
///
/// ```rust,ignore
/// let silo = Silo::builder(ClusterConfig::new("prod"))
///     .bind(NetworkAddress::localhost(11111))
///     .membership(backend.clone())
///     .register(GrainRegistration::new::<BankAccount>(BANK_ACCOUNT))
///     .start()
///     .await?;
/// ```
pub struct SiloBuilder {
    cluster: ClusterConfig,
    silo_config: SiloConfig,
    membership_config: MembershipConfig,
    router_config: RouterConfig,
    connection_config: ConnectionConfig,
    endpoint: Option<NetworkAddress>,
    generation: Option<i64>,
    backend: Option<Arc<dyn MembershipBackend>>,
    state_store: Option<Arc<dyn GrainStateStore>>,
    reminder_store: Option<Arc<dyn ReminderStore>>,
    reminder_refresh: Duration,
    registrations: Vec<GrainRegistration>,
}

impl SiloBuilder {
    fn new(cluster: ClusterConfig) -> Self {
        Self {
            cluster,
            silo_config: SiloConfig::default(),
            membership_config: MembershipConfig::default(),
            router_config: RouterConfig::default(),
            connection_config: ConnectionConfig::default(),
            endpoint: None,
            generation: None,
            backend: None,
            state_store: None,
            reminder_store: None,
            reminder_refresh: Duration::from_secs(5),
            registrations: Vec::new(),
        }
    }

    /// Set the listen endpoint (required).
    pub fn bind(mut self, endpoint: NetworkAddress) -> Self {
        self.endpoint = Some(endpoint);
        self
    }

    /// Pin the generation instead of deriving it from the clock.
    pub fn generation(mut self, generation: i64) -> Self {
        self.generation = Some(generation);
        self
    }

    /// Set the membership backend (required).
    pub fn membership(mut self, backend: Arc<dyn MembershipBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Override per-silo settings.
    pub fn silo_config(mut self, config: SiloConfig) -> Self {
        self.silo_config = config;
        self
    }

    /// Override membership protocol timings.
    pub fn membership_config(mut self, config: MembershipConfig) -> Self {
        self.membership_config = config;
        self
    }

    /// Override router timeouts and retry policy.
    pub fn router_config(mut self, config: RouterConfig) -> Self {
        self.router_config = config;
        self
    }

    /// Override connection behavior.
    pub fn connection_config(mut self, config: ConnectionConfig) -> Self {
        self.connection_config = config;
        self
    }

    /// Configure durable grain state storage.
    pub fn state_store(mut self, store: Arc<dyn GrainStateStore>) -> Self {
        self.state_store = Some(store);
        self
    }

    /// Configure durable reminder storage.
    pub fn reminder_store(mut self, store: Arc<dyn ReminderStore>) -> Self {
        self.reminder_store = Some(store);
        self
    }

    /// How often the reminder service re-reads its ring range.
    pub fn reminder_refresh(mut self, refresh: Duration) -> Self {
        self.reminder_refresh = refresh;
        self
    }

    /// Register a grain type.
    pub fn register(mut self, registration: GrainRegistration) -> Self {
        self.registrations.push(registration);
        self
    }

    /// Bring the silo up: bind, wire, join, go Active.
    ///
    /// # Errors
    ///
    /// Transport failures binding the listener; membership failures
    /// joining the cluster.
    pub async fn start(self) -> Result<Silo, SiloError> {
        let endpoint = self.endpoint.ok_or(SiloError::MissingEndpoint)?;
        let backend = self.backend.ok_or(SiloError::MissingMembership)?;
        let generation = self
            .generation
            .unwrap_or_else(|| (granary_core::epoch_ms() / 1000) as i64);
        let local = SiloAddress::new(endpoint, generation);

        let mut registry = GrainRegistry::new();
        for registration in self.registrations {
            registry.register(registration);
        }
        let registry = Arc::new(registry);
        let services = Arc::new(SiloServices {
            state_store: self.state_store,
            reminder_store: self.reminder_store.clone(),
        });

        let (conn, mut inbound) = ConnectionManager::new(
            Preamble::silo(local, self.cluster.cluster_id.clone()),
            self.connection_config,
        );
        let conn = Arc::new(conn);
        conn.listen(endpoint).await?;

        let catalog = Arc::new(ActivationCatalog::new(
            local,
            registry.clone(),
            self.silo_config.clone(),
            services,
        ));
        let placement = Placement::new();
        let load = placement.load().clone();

        let router = Arc::new(MessageRouter::new(
            local,
            self.router_config,
            conn.clone(),
            catalog.clone(),
            registry,
            placement,
        ));
        router.set_self();

        let directory = Arc::new(GrainDirectory::new(
            local,
            self.silo_config.directory_cache_capacity,
            Arc::new(RouterDirectoryTransport::new(Arc::downgrade(&router))),
        ));
        router.set_directory(directory.clone());
        catalog.attach(Arc::downgrade(&router), directory.clone());

        let oracle = Arc::new(MembershipOracle::new(
            local,
            self.silo_config.host_name.clone(),
            self.silo_config.role.clone(),
            self.membership_config,
            backend,
            Arc::new(RouterProber::new(Arc::downgrade(&router))),
        ));
        router.set_membership(oracle.watch());

        let reminders = Arc::new(ReminderService::new(
            self.reminder_store
                .unwrap_or_else(|| Arc::new(crate::reminders::InMemoryReminderStore::new())),
            Arc::downgrade(&router),
            self.reminder_refresh,
        ));

        let mut tasks: Vec<JoinHandle<()>> = Vec::new();

        // Inbound pump. Responses complete callbacks inline (they never
        // block); requests go to one worker per sending peer, which keeps
        // same-sender delivery order without letting a request that is
        // waiting on remote state stall the whole inbound path.
        {
            let router = router.clone();
            tasks.push(tokio::spawn(async move {
                use std::collections::HashMap;
                use tokio::sync::mpsc;

                let mut per_peer: HashMap<
                    granary_transport::NodeIdentity,
                    mpsc::UnboundedSender<Message>,
                > = HashMap::new();

                while let Some((peer, msg)) = inbound.recv().await {
                    // Responses and system traffic (probes, directory ops)
                    // never block; waiting behind an application request
                    // would turn one slow activation into missed probes.
                    if msg.direction == granary_core::Direction::Response
                        || msg.interface.is_system()
                    {
                        router.receive(&peer, msg).await;
                        continue;
                    }
                    let worker = per_peer.entry(peer.clone()).or_insert_with(|| {
                        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
                        let router = router.clone();
                        let peer = peer.clone();
                        tokio::spawn(async move {
                            while let Some(msg) = rx.recv().await {
                                router.receive(&peer, msg).await;
                            }
                        });
                        tx
                    });
                    if worker.send(msg).is_err() {
                        per_peer.remove(&peer);
                    }
                }
            }));
        }

        // Membership reactor: ring rebuilds, dead-silo cleanup, reminder
        // range updates.
        {
            let router = router.clone();
            let directory = directory.clone();
            let reminders = reminders.clone();
            let mut watch = oracle.watch();
            tasks.push(tokio::spawn(async move {
                loop {
                    let snapshot = watch.borrow().clone();
                    router.on_membership_change(&snapshot);
                    reminders.set_range(directory.local_range());
                    if watch.changed().await.is_err() {
                        break;
                    }
                }
            }));
        }

        // Idle activation collection.
        {
            let catalog = catalog.clone();
            let period = self.silo_config.activation_sweep_period;
            tasks.push(tokio::spawn(async move {
                let mut tick = tokio::time::interval(period);
                tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tick.tick().await;
                    catalog.sweep_idle();
                }
            }));
        }

        // A silo that observes itself marked Dead must stop serving; it
        // never rejoins under this generation. The embedding host decides
        // whether to exit the process.
        {
            let oracle = oracle.clone();
            let router = router.clone();
            let conn = conn.clone();
            tasks.push(tokio::spawn(async move {
                oracle.wait_self_dead().await;
                warn!(silo = %local, "declared dead by the cluster; halting silo services");
                oracle.stop_tasks();
                router.shutdown();
                conn.shutdown();
            }));
        }

        // Load publication for placement decisions.
        {
            let catalog = catalog.clone();
            tasks.push(tokio::spawn(async move {
                let mut tick = tokio::time::interval(Duration::from_secs(1));
                tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tick.tick().await;
                    load.publish(
                        local,
                        SiloLoad {
                            activation_count: catalog.len(),
                            ..Default::default()
                        },
                    );
                }
            }));
        }

        router.start_sweeper();
        oracle.join().await?;
        oracle.start();
        router.on_membership_change(&oracle.snapshot());
        reminders.set_range(directory.local_range());
        reminders.start();

        let silo = Silo {
            local,
            cluster: self.cluster,
            conn,
            catalog,
            directory,
            router,
            oracle,
            reminders,
            lifecycle: Mutex::new(SiloLifecycle::Active),
            tasks: Mutex::new(tasks),
            client_grain: GrainId::text(GrainType::CLIENT, format!("silo-{local}")),
        };
        info!(silo = %local, "silo started");
        Ok(silo)
    }
}

/// A running silo.
pub struct Silo {
    local: SiloAddress,
    cluster: ClusterConfig,
    conn: Arc<ConnectionManager>,
    catalog: Arc<ActivationCatalog>,
    directory: Arc<GrainDirectory>,
    router: Arc<MessageRouter>,
    oracle: Arc<MembershipOracle>,
    reminders: Arc<ReminderService>,
    lifecycle: Mutex<SiloLifecycle>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    client_grain: GrainId,
}

impl std::fmt::Debug for Silo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Silo")
            .field("local", &self.local)
            .field("lifecycle", &self.lifecycle())
            .finish()
    }
}

impl Silo {
    /// Start building a silo for the given cluster.
    pub fn builder(cluster: ClusterConfig) -> SiloBuilder {
        SiloBuilder::new(cluster)
    }

    /// This silo's address.
    pub fn address(&self) -> SiloAddress {
        self.local
    }

    /// The cluster configuration.
    pub fn cluster(&self) -> &ClusterConfig {
        &self.cluster
    }

    /// Current lifecycle state.
    pub fn lifecycle(&self) -> SiloLifecycle {
        *self.lifecycle.lock()
    }

    /// The membership oracle (snapshots, watches).
    pub fn membership(&self) -> &Arc<MembershipOracle> {
        &self.oracle
    }

    /// The cluster directory view of this silo.
    pub fn directory(&self) -> &Arc<GrainDirectory> {
        &self.directory
    }

    /// The local activation catalog.
    pub fn catalog(&self) -> &Arc<ActivationCatalog> {
        &self.catalog
    }

    /// The message router.
    pub fn router(&self) -> &Arc<MessageRouter> {
        &self.router
    }

    /// Call a grain from host code (outside any activation).
    ///
    /// # Errors
    ///
    /// Routing, timeout, and application failures.
    pub async fn call(
        &self,
        target: GrainId,
        method: u32,
        body: Vec<u8>,
    ) -> Result<Vec<u8>, RouterError> {
        let msg = Message::request(target)
            .from_grain(self.client_grain.clone())
            .method(method)
            .body(body)
            .build();
        self.router.send_request(msg).await
    }

    /// Typed variant of [`call`](Self::call).
    ///
    /// # Errors
    ///
    /// As [`call`](Self::call), plus codec failures.
    pub async fn call_typed<Req: serde::Serialize, Resp: serde::de::DeserializeOwned>(
        &self,
        target: GrainId,
        method: u32,
        request: &Req,
    ) -> Result<Resp, GrainError> {
        let codec = JsonCodec;
        let body = codec.encode(request)?;
        let response = self.call(target, method, body).await?;
        Ok(codec.decode(&response)?)
    }

    /// Send a one-way message from host code.
    ///
    /// # Errors
    ///
    /// Local routing failures only.
    pub fn one_way(&self, target: GrainId, method: u32, body: Vec<u8>) -> Result<(), RouterError> {
        let msg = Message::one_way(target)
            .from_grain(self.client_grain.clone())
            .method(method)
            .body(body)
            .build();
        self.router.send_one_way(msg)
    }

    /// Ask an activation to deactivate.
    pub fn deactivate(&self, address: &granary_core::ActivationAddress, reason: DeactivationReason) {
        self.catalog.deactivate(address, reason);
    }

    /// Abandon the silo without the graceful protocol, as a crashed
    /// process would. Peers must detect the death via probing.
    pub fn abandon(&self) {
        warn!(silo = %self.local, "abandoning silo (simulated crash)");
        *self.lifecycle.lock() = SiloLifecycle::Stopped;
        self.oracle.stop_tasks();
        self.reminders.stop();
        self.router.shutdown();
        self.conn.shutdown();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    /// Graceful shutdown: drain activations, leave the membership table
    /// through ShuttingDown → Stopping → Dead, close connections.
    pub async fn shutdown(&self) {
        {
            let mut lifecycle = self.lifecycle.lock();
            if *lifecycle != SiloLifecycle::Active {
                return;
            }
            *lifecycle = SiloLifecycle::Stopping;
        }
        info!(silo = %self.local, "silo shutting down");

        if let Err(e) = self
            .oracle
            .update_status(crate::membership::SiloStatus::ShuttingDown)
            .await
        {
            debug!(error = %e, "shutdown status write failed");
        }

        self.reminders.stop();
        self.catalog
            .deactivate_all(Duration::from_secs(10))
            .await;
        self.oracle.shutdown().await;
        self.router.shutdown();
        self.conn.shutdown();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        *self.lifecycle.lock() = SiloLifecycle::Stopped;
        info!(silo = %self.local, "silo stopped");
    }
}

impl Drop for Silo {
    fn drop(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}
