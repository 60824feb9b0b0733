//! The message router: addressing, sending, receiving, retrying, and
//! rejecting messages; matching responses to callbacks.
//!
//! Every request leaves through [`MessageRouter::send_request_with_sink`]
//! and terminates in exactly one of three ways: a response completes its
//! callback, the timeout sweeper fires it, or target-silo death fails it
//! after retries. Expiry is checked at every handoff point — before
//! scheduler dispatch, before network send, and on receive.

pub mod callbacks;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use granary_core::{
    ActivationAddress, CodecError, CorrelationId, Direction, GrainId, GrainKey, GrainType,
    JsonCodec, Message, MessageCodec, RejectionKind, SiloAddress, epoch_ms,
    message::ResponsePayload,
};
use granary_transport::{ConnectionManager, NodeIdentity, TransportError};

use crate::catalog::{ActivationCatalog, CatalogError};
use crate::config::RouterConfig;
use crate::directory::{DirectoryError, DirectoryTransport, GrainDirectory};
use crate::membership::{ClusterSnapshot, Prober};
use crate::placement::{Placement, PlacementError};

use callbacks::{CallbackRecord, CallbackTable, ResponseSink};

/// System interface method discriminants.
pub mod system_methods {
    /// Directory: register an activation with the owner.
    pub const DIR_REGISTER: u32 = 1;
    /// Directory: unregister an activation from the owner.
    pub const DIR_UNREGISTER: u32 = 2;
    /// Directory: look up a grain at the owner.
    pub const DIR_LOOKUP: u32 = 3;
    /// Membership: liveness probe.
    pub const PROBE: u32 = 1;
}

/// Messages forwarded more than this many times are rejected instead of
/// chased further.
const MAX_FORWARDS: u8 = 2;

/// How many stale addresses ride along on one response.
const MAX_INVALIDATIONS_PER_MESSAGE: usize = 32;

/// How long a stale address keeps being advertised, ms.
const STALE_ADVERTISE_MS: u64 = 10_000;

/// Errors surfaced to request senders.
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    /// No terminal event arrived before the deadline.
    #[error("request to {target} timed out")]
    Timeout {
        /// The grain that never answered.
        target: GrainId,
    },

    /// The request was rejected and retries are exhausted (or the kind is
    /// not retryable).
    #[error("request rejected ({kind}): {reason}")]
    Rejected {
        /// Rejection kind from the remote end.
        kind: RejectionKind,
        /// Human-readable reason.
        reason: String,
    },

    /// The target grain's code failed; the text is the application error.
    #[error("application error: {0}")]
    Application(String),

    /// Retries exhausted without a successful delivery.
    #[error("request to {target} failed after {retries} retries")]
    RetriesExhausted {
        /// The unreachable grain.
        target: GrainId,
        /// Retries performed.
        retries: u32,
    },

    /// Directory interaction failed.
    #[error(transparent)]
    Directory(#[from] DirectoryError),

    /// Placement failed (no eligible silo).
    #[error(transparent)]
    Placement(#[from] PlacementError),

    /// Local activation failed.
    #[error(transparent)]
    Catalog(#[from] CatalogError),

    /// The connection layer refused the message.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Payload (de)serialization failed.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// The router is shutting down.
    #[error("router is shutting down")]
    ShuttingDown,
}

impl RouterError {
    /// Whether the in-router retry machinery may try again.
    fn is_retryable(&self) -> bool {
        matches!(
            self,
            RouterError::Directory(_)
                | RouterError::Placement(_)
                | RouterError::Transport(_)
                | RouterError::Catalog(CatalogError::InCooldown(_))
                | RouterError::Catalog(CatalogError::Stopping(_))
                | RouterError::Catalog(CatalogError::LostRace(_))
        )
    }
}

/// The per-silo message router.
pub struct MessageRouter {
    local: SiloAddress,
    config: RouterConfig,
    conn: Arc<ConnectionManager>,
    catalog: Arc<ActivationCatalog>,
    registry: Arc<crate::catalog::GrainRegistry>,
    placement: Placement,
    callbacks: CallbackTable,
    correlation: AtomicU64,
    directory: OnceLock<Arc<GrainDirectory>>,
    membership: OnceLock<watch::Receiver<ClusterSnapshot>>,
    self_weak: OnceLock<Weak<MessageRouter>>,
    /// Recently deactivated addresses, advertised on outgoing responses.
    stale: Mutex<Vec<(ActivationAddress, u64)>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for MessageRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageRouter")
            .field("local", &self.local)
            .field("pending", &self.callbacks.len())
            .finish()
    }
}

impl MessageRouter {
    /// Router for `local`. Wire the directory, membership watch, and the
    /// self-reference before first use.
    pub fn new(
        local: SiloAddress,
        config: RouterConfig,
        conn: Arc<ConnectionManager>,
        catalog: Arc<ActivationCatalog>,
        registry: Arc<crate::catalog::GrainRegistry>,
        placement: Placement,
    ) -> Self {
        Self {
            local,
            config,
            conn,
            catalog,
            registry,
            placement,
            callbacks: CallbackTable::default(),
            correlation: AtomicU64::new(1),
            directory: OnceLock::new(),
            membership: OnceLock::new(),
            self_weak: OnceLock::new(),
            stale: Mutex::new(Vec::new()),
            sweeper: Mutex::new(None),
        }
    }

    /// Late-bind the directory.
    pub fn set_directory(&self, directory: Arc<GrainDirectory>) {
        let _ = self.directory.set(directory);
    }

    /// Late-bind the membership snapshot watch.
    pub fn set_membership(&self, membership: watch::Receiver<ClusterSnapshot>) {
        let _ = self.membership.set(membership);
    }

    /// Late-bind the self reference used by spawned retries.
    pub fn set_self(self: &Arc<Self>) {
        let _ = self.self_weak.set(Arc::downgrade(self));
    }

    /// This silo's address.
    pub fn local(&self) -> SiloAddress {
        self.local
    }

    /// Weak handle to the catalog, for dispatchers.
    pub(crate) fn catalog_weak(&self) -> Weak<ActivationCatalog> {
        Arc::downgrade(&self.catalog)
    }

    /// Latest membership snapshot (empty before the oracle starts).
    pub fn snapshot(&self) -> ClusterSnapshot {
        self.membership
            .get()
            .map(|w| w.borrow().clone())
            .unwrap_or_default()
    }

    fn self_arc(&self) -> Option<Arc<MessageRouter>> {
        self.self_weak.get().and_then(Weak::upgrade)
    }

    fn next_correlation(&self) -> CorrelationId {
        CorrelationId(self.correlation.fetch_add(1, Ordering::Relaxed))
    }

    /// Send a request and await its terminal outcome.
    ///
    /// # Errors
    ///
    /// Timeout, rejection, application, or routing failures.
    pub async fn send_request(&self, msg: Message) -> Result<Vec<u8>, RouterError> {
        let (tx, rx) = oneshot::channel();
        self.send_request_with_sink(
            msg,
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        );
        rx.await.unwrap_or(Err(RouterError::ShuttingDown))
    }

    /// Send a request; the sink receives exactly one terminal outcome.
    pub fn send_request_with_sink(&self, mut msg: Message, sink: ResponseSink) {
        msg.direction = Direction::Request;
        self.stamp(&mut msg);
        let correlation = msg.correlation;

        self.callbacks.insert(CallbackRecord {
            deadline_ms: msg.expires_at_ms,
            message: msg,
            sink,
        });

        match self.self_arc() {
            Some(router) => {
                tokio::spawn(async move { router.dispatch_pending(correlation).await });
            }
            None => {
                if let Some(record) = self.callbacks.complete(correlation) {
                    (record.sink)(Err(RouterError::ShuttingDown));
                }
            }
        }
    }

    /// Send a one-way message; errors after this point are dropped with
    /// the message.
    ///
    /// # Errors
    ///
    /// Only immediate local failures (router shutting down).
    pub fn send_one_way(&self, mut msg: Message) -> Result<(), RouterError> {
        msg.direction = Direction::OneWay;
        self.stamp(&mut msg);
        let router = self.self_arc().ok_or(RouterError::ShuttingDown)?;
        tokio::spawn(async move {
            if let Err(e) = router.route_message(msg).await {
                debug!(error = %e, "one-way message dropped");
            }
        });
        Ok(())
    }

    /// Assign correlation, chain, origin, and expiry.
    fn stamp(&self, msg: &mut Message) {
        if msg.correlation == CorrelationId::default() {
            msg.correlation = self.next_correlation();
        }
        if msg.call_chain == CorrelationId::default() {
            msg.call_chain = msg.correlation;
        }
        msg.sending_silo = Some(self.local);
        if msg.expires_at_ms == u64::MAX {
            let timeout = if msg.interface.is_system() {
                self.config.system_response_timeout
            } else {
                self.config.response_timeout
            };
            msg.expires_at_ms = epoch_ms() + timeout.as_millis() as u64;
        }
    }

    /// Drive one pending request to delivery, retrying routing failures.
    async fn dispatch_pending(self: Arc<Self>, correlation: CorrelationId) {
        loop {
            // Re-read the record each attempt: rejections and sweeps may
            // have completed it concurrently.
            let Some(msg) = self.peek_message(correlation) else {
                return;
            };
            match self.route_message(msg).await {
                Ok(()) => return,
                Err(e) => {
                    let Some(mut record) = self.callbacks.complete(correlation) else {
                        return;
                    };
                    let retries = record.message.retries;
                    if e.is_retryable() && retries < self.config.max_retries {
                        record.message.retries = retries + 1;
                        record.message.target_silo = None;
                        record.message.target_activation = None;
                        if let Some(directory) = self.directory.get() {
                            directory.invalidate(&record.message.target_grain);
                        }
                        debug!(%correlation, retries, error = %e, "re-routing request");
                        self.callbacks.insert(record);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        continue;
                    }
                    (record.sink)(Err(e));
                    return;
                }
            }
        }
    }

    fn peek_message(&self, correlation: CorrelationId) -> Option<Message> {
        // Take and immediately re-insert to copy the current state.
        let record = self.callbacks.complete(correlation)?;
        let msg = record.message.clone();
        self.callbacks.insert(record);
        Some(msg)
    }

    /// Address and move a message one hop: into the local catalog or onto
    /// a connection.
    async fn route_message(&self, mut msg: Message) -> Result<(), RouterError> {
        if msg.is_expired(epoch_ms()) {
            return Err(RouterError::Timeout {
                target: msg.target_grain.clone(),
            });
        }

        let target = self.resolve(&mut msg).await?;
        if target == self.local {
            self.deliver_local(msg).await
        } else {
            msg.target_silo = Some(target);
            // Handoff point: never hand an expired message to the network.
            if msg.is_expired(epoch_ms()) {
                return Err(RouterError::Timeout {
                    target: msg.target_grain.clone(),
                });
            }
            self.conn.send_to_silo(target, msg)?;
            Ok(())
        }
    }

    /// Decide the target silo for a message.
    async fn resolve(&self, msg: &mut Message) -> Result<SiloAddress, RouterError> {
        if let Some(pinned) = msg.target_grain.pinned_silo() {
            return Ok(pinned);
        }

        let snapshot = self.snapshot();
        if let Some(silo) = msg.target_silo {
            if snapshot.is_alive(&silo) || snapshot.members.is_empty() {
                return Ok(silo);
            }
            // The addressed silo is dead; fall through to re-resolution.
            msg.target_silo = None;
            msg.target_activation = None;
        }

        if let Some(directory) = self.directory.get()
            && let Some(address) = directory.lookup(&msg.target_grain).await?
        {
            if snapshot.is_alive(&address.silo) || snapshot.members.is_empty() {
                msg.target_activation = Some(address.activation);
                return Ok(address.silo);
            }
            directory.invalidate(&msg.target_grain);
        }

        // No current activation: pick a silo for a fresh one. The target
        // silo's catalog creates and registers it on arrival.
        let strategy = self
            .registry
            .get(msg.target_grain.kind)
            .map(|r| r.placement)
            .unwrap_or_default();
        let silo = self
            .placement
            .place(strategy, &msg.target_grain, &snapshot, self.local)
            .await?;
        Ok(silo)
    }

    /// Deliver a message addressed to this silo.
    async fn deliver_local(&self, msg: Message) -> Result<(), RouterError> {
        if msg.interface.is_system() && msg.direction != Direction::Response {
            return self.handle_system(msg).await;
        }
        match msg.direction {
            Direction::Response => {
                self.handle_response(msg);
                Ok(())
            }
            Direction::Request | Direction::OneWay => self.dispatch_to_catalog(msg).await,
        }
    }

    async fn dispatch_to_catalog(&self, mut msg: Message) -> Result<(), RouterError> {
        match self.catalog.get_or_create(&msg.target_grain).await {
            Ok((handle, _existing)) => {
                // A sender addressing an older activation is told to
                // refresh its cache rather than silently reaching a
                // different incarnation.
                if let Some(expected) = msg.target_activation
                    && expected != handle.address().activation
                {
                    let stale = ActivationAddress::new(
                        msg.target_grain.clone(),
                        self.local,
                        expected,
                    );
                    let mut rejection =
                        msg.to_rejection(RejectionKind::Unrecoverable, "stale activation");
                    rejection.cache_invalidation.push(stale);
                    self.route_response(rejection);
                    return Ok(());
                }
                msg.target_activation = Some(handle.address().activation);
                if let Err(returned) = handle.enqueue_request(Box::new(msg)) {
                    self.reject(&returned, RejectionKind::Transient, "activation stopping");
                }
                Ok(())
            }
            Err(CatalogError::LostRace(winner)) => {
                if msg.forward_count >= MAX_FORWARDS {
                    self.reject(&msg, RejectionKind::Unrecoverable, "forward limit reached");
                    return Ok(());
                }
                msg.forward_count += 1;
                msg.target_silo = Some(winner.silo);
                msg.target_activation = Some(winner.activation);
                debug!(msg = %msg, winner = %winner, "forwarding to race winner");
                Box::pin(self.route_message(msg)).await
            }
            Err(e @ (CatalogError::InCooldown(_) | CatalogError::Stopping(_))) => {
                self.reject(&msg, RejectionKind::Transient, e.to_string());
                Ok(())
            }
            Err(e @ CatalogError::UnknownGrainType(_)) => {
                self.respond_app_error(&msg, e.to_string());
                Ok(())
            }
            Err(e) => {
                self.reject(&msg, RejectionKind::Transient, e.to_string());
                Ok(())
            }
        }
    }

    /// Serve runtime-internal interfaces.
    async fn handle_system(&self, msg: Message) -> Result<(), RouterError> {
        let codec = JsonCodec;

        // A caller with a stale ring may address the wrong partition
        // owner; refusing (retryably) makes it re-resolve rather than
        // scattering authoritative entries across non-owners.
        let verify_owner = |directory: &GrainDirectory, grain: &GrainId| {
            let owner = directory.owner_of(grain);
            owner.is_none() || owner == Some(self.local)
        };

        match (msg.interface, msg.method) {
            (GrainType::DIRECTORY, system_methods::DIR_REGISTER) => {
                let directory = self.directory.get().ok_or(RouterError::ShuttingDown)?;
                let address: ActivationAddress = codec.decode(&msg.body)?;
                if !verify_owner(directory, &address.grain) {
                    self.reject(&msg, RejectionKind::Transient, "not the partition owner");
                    return Ok(());
                }
                let winner = directory.register_local(address);
                self.send_response(&msg, Ok(codec.encode(&winner)?));
            }
            (GrainType::DIRECTORY, system_methods::DIR_UNREGISTER) => {
                let directory = self.directory.get().ok_or(RouterError::ShuttingDown)?;
                let address: ActivationAddress = codec.decode(&msg.body)?;
                let removed = directory.unregister_local(&address);
                self.send_response(&msg, Ok(codec.encode(&removed)?));
            }
            (GrainType::DIRECTORY, system_methods::DIR_LOOKUP) => {
                let directory = self.directory.get().ok_or(RouterError::ShuttingDown)?;
                let grain: GrainId = codec.decode(&msg.body)?;
                let found = directory.lookup_local(&grain);
                self.send_response(&msg, Ok(codec.encode(&found)?));
            }
            (GrainType::MEMBERSHIP, system_methods::PROBE) => {
                self.send_response(&msg, Ok(Vec::new()));
            }
            (interface, method) => {
                debug!(%interface, method, "unsupported system request");
                self.respond_app_error(&msg, format!("unsupported system request {method}"));
            }
        }
        Ok(())
    }

    /// Entry point for messages arriving over a connection.
    pub async fn receive(&self, peer: &NodeIdentity, mut msg: Message) {
        if let Some(directory) = self.directory.get() {
            directory.apply_invalidations(&msg.cache_invalidation);
            msg.cache_invalidation.clear();
        }

        match msg.direction {
            Direction::Response => self.handle_response(msg),
            Direction::Request | Direction::OneWay => {
                if matches!(peer, NodeIdentity::Client(_)) {
                    // Gateway duties: own the origin so the response comes
                    // back here, re-bind system targets to this gateway,
                    // and drop routing info we know to be stale.
                    msg.sending_silo = Some(self.local);
                    if msg.target_grain.is_system() {
                        if msg.target_grain.pinned_silo().is_none() {
                            msg.target_grain = GrainId::system(msg.target_grain.kind, self.local);
                        }
                    } else if let Some(silo) = msg.target_silo
                        && !self.snapshot().is_alive(&silo)
                    {
                        msg.target_silo = None;
                        msg.target_activation = None;
                    }
                }
                let is_request = msg.direction == Direction::Request;
                let reject_copy = if is_request { Some(msg.clone()) } else { None };
                if let Err(e) = self.route_message(msg).await {
                    debug!(error = %e, "inbound message failed to route");
                    if let Some(original) = reject_copy {
                        self.reject(&original, RejectionKind::Transient, e.to_string());
                    }
                }
            }
        }
    }

    /// Match a response to its callback (or forward it to a gateway
    /// client).
    fn handle_response(&self, msg: Message) {
        if let Some(directory) = self.directory.get() {
            directory.apply_invalidations(&msg.cache_invalidation);
        }

        // Callback matching is by (sending grain, correlation id): a
        // response that isn't ours but targets a client pseudo-grain is a
        // gateway passthrough to that client's connection.
        let mine = self.callbacks.matches(msg.correlation, &msg.target_grain);
        if !mine && msg.target_grain.kind == GrainType::CLIENT {
            if let GrainKey::Text(client_id) = &msg.target_grain.key {
                let peer = NodeIdentity::Client(client_id.clone());
                if let Err(e) = self.conn.send_to_peer(&peer, msg) {
                    debug!(error = %e, "client response dropped");
                }
            }
            return;
        }

        if let Some(kind) = msg.rejection {
            self.handle_rejection(msg, kind);
            return;
        }

        let Some(record) = self.callbacks.complete(msg.correlation) else {
            debug!(correlation = %msg.correlation, "response without callback");
            return;
        };
        let outcome = match serde_json::from_slice::<ResponsePayload>(&msg.body) {
            Ok(Ok(bytes)) => Ok(bytes),
            Ok(Err(application)) => Err(RouterError::Application(application)),
            Err(e) => Err(RouterError::Codec(CodecError::Decode(Box::new(e)))),
        };
        (record.sink)(outcome);
    }

    /// Apply rejection policy per kind.
    fn handle_rejection(&self, msg: Message, kind: RejectionKind) {
        let reason = msg
            .rejection_reason
            .clone()
            .unwrap_or_else(|| "rejected".to_string());

        match kind {
            RejectionKind::CacheInvalidation => {
                // Side effect only: invalidations were applied above, the
                // request stays pending.
                return;
            }
            RejectionKind::DuplicateRequest => {
                debug!(correlation = %msg.correlation, "duplicate request rejection ignored");
                return;
            }
            _ => {}
        }

        let Some(mut record) = self.callbacks.complete(msg.correlation) else {
            debug!(correlation = %msg.correlation, %kind, "rejection without callback");
            return;
        };

        if !kind.is_retryable() || record.message.retries >= self.config.max_retries {
            (record.sink)(Err(RouterError::Rejected { kind, reason }));
            return;
        }

        // Retryable: bump the shared retry counter and re-address through
        // the directory (reroutes intentionally do NOT reset it).
        record.message.retries += 1;
        record.message.target_silo = None;
        record.message.target_activation = None;
        if kind == RejectionKind::Unrecoverable
            && let Some(directory) = self.directory.get()
        {
            directory.invalidate(&record.message.target_grain);
        }
        let delay = match kind {
            RejectionKind::GatewayTooBusy => self.config.busy_retry_delay,
            _ => Duration::from_millis(10),
        };
        let correlation = record.message.correlation;
        debug!(%correlation, %kind, retries = record.message.retries, "retrying rejected request");
        self.callbacks.insert(record);

        if let Some(router) = self.self_arc() {
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                router.dispatch_pending(correlation).await;
            });
        }
    }

    /// Send the response to a request, attaching the stale-address
    /// advertisement.
    pub fn send_response(&self, request: &Message, payload: ResponsePayload) {
        let body = match serde_json::to_vec(&payload) {
            Ok(body) => body,
            Err(e) => {
                warn!(error = %e, "response payload failed to serialize");
                match serde_json::to_vec(&ResponsePayload::Err(format!(
                    "response serialization failed: {e}"
                ))) {
                    Ok(body) => body,
                    Err(_) => return,
                }
            }
        };
        let mut response = request.to_response(body);
        response.cache_invalidation = self.advertised_stale();
        self.route_response(response);
    }

    /// Reply to a request with an application error payload.
    fn respond_app_error(&self, request: &Message, error: String) {
        if request.direction == Direction::Request {
            self.send_response(request, Err(error));
        }
    }

    /// Reject a request. `CacheInvalidation` and `DuplicateRequest`
    /// rejections are informational; the rest drive the caller's retry
    /// machinery.
    pub fn reject(&self, request: &Message, kind: RejectionKind, reason: impl Into<String>) {
        if request.direction != Direction::Request {
            return;
        }
        let mut rejection = request.to_rejection(kind, reason);
        rejection.cache_invalidation.extend(self.advertised_stale());
        self.route_response(rejection);
    }

    /// Move a response toward the request's origin.
    fn route_response(&self, msg: Message) {
        match msg.target_silo {
            Some(silo) if silo != self.local => {
                if let Err(e) = self.conn.send_to_silo(silo, msg) {
                    debug!(error = %e, "response dropped");
                }
            }
            _ => self.handle_response(msg),
        }
    }

    /// Record a now-stale activation address for advertisement on
    /// outgoing responses.
    pub fn note_stale(&self, address: ActivationAddress) {
        let mut stale = self.stale.lock();
        let now = epoch_ms();
        stale.retain(|(_, added)| now.saturating_sub(*added) < STALE_ADVERTISE_MS);
        stale.push((address, now));
        let overflow = stale.len().saturating_sub(MAX_INVALIDATIONS_PER_MESSAGE);
        if overflow > 0 {
            stale.drain(..overflow);
        }
    }

    fn advertised_stale(&self) -> Vec<ActivationAddress> {
        let mut stale = self.stale.lock();
        let now = epoch_ms();
        stale.retain(|(_, added)| now.saturating_sub(*added) < STALE_ADVERTISE_MS);
        stale.iter().map(|(a, _)| a.clone()).collect()
    }

    /// React to a membership change: drop links and directory state for
    /// dead silos and re-drive requests that were in flight to them.
    pub fn on_membership_change(&self, snapshot: &ClusterSnapshot) {
        if let Some(directory) = self.directory.get() {
            directory.update_ring(snapshot);
        }

        let dead: Vec<SiloAddress> = snapshot
            .members
            .iter()
            .filter(|(_, status)| **status == crate::membership::SiloStatus::Dead)
            .map(|(silo, _)| *silo)
            .collect();

        for silo in dead {
            self.conn.drop_silo(silo);
            for mut record in self.callbacks.take_targeting(&silo) {
                if let Some(directory) = self.directory.get() {
                    directory.invalidate(&record.message.target_grain);
                }
                if record.message.retries >= self.config.max_retries {
                    let target = record.message.target_grain.clone();
                    let retries = record.message.retries;
                    (record.sink)(Err(RouterError::RetriesExhausted { target, retries }));
                    continue;
                }
                record.message.retries += 1;
                record.message.target_silo = None;
                record.message.target_activation = None;
                let correlation = record.message.correlation;
                debug!(%correlation, %silo, "re-routing request away from dead silo");
                self.callbacks.insert(record);
                if let Some(router) = self.self_arc() {
                    tokio::spawn(async move { router.dispatch_pending(correlation).await });
                }
            }
        }
    }

    /// Start the timeout sweeper: period = min(response timeout, 1s).
    pub fn start_sweeper(self: &Arc<Self>) {
        let router = self.clone();
        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(router.config.sweep_period());
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                let now = epoch_ms();
                for record in router.callbacks.take_expired(now) {
                    let target = record.message.target_grain.clone();
                    debug!(correlation = %record.message.correlation, %target,
                        "request timed out");
                    (record.sink)(Err(RouterError::Timeout { target }));
                }
            }
        });
        *self.sweeper.lock() = Some(handle);
    }

    /// Stop the sweeper and fail everything still pending.
    pub fn shutdown(&self) {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }
        for record in self.callbacks.drain() {
            (record.sink)(Err(RouterError::ShuttingDown));
        }
    }
}

/// [`DirectoryTransport`] over system messages.
#[derive(Debug)]
pub struct RouterDirectoryTransport {
    router: Weak<MessageRouter>,
}

impl RouterDirectoryTransport {
    /// Transport backed by the given router.
    pub fn new(router: Weak<MessageRouter>) -> Self {
        Self { router }
    }

    fn router(&self) -> Result<Arc<MessageRouter>, DirectoryError> {
        self.router
            .upgrade()
            .ok_or_else(|| DirectoryError::Transport("router is gone".to_string()))
    }

    async fn system_request(
        &self,
        owner: SiloAddress,
        method: u32,
        body: Vec<u8>,
    ) -> Result<Vec<u8>, DirectoryError> {
        let router = self.router()?;
        let msg = Message::request(GrainId::system(GrainType::DIRECTORY, owner))
            .from_grain(GrainId::system(GrainType::DIRECTORY, router.local()))
            .method(method)
            .body(body)
            .build();
        router
            .send_request(msg)
            .await
            .map_err(|e| DirectoryError::Transport(e.to_string()))
    }
}

#[async_trait]
impl DirectoryTransport for RouterDirectoryTransport {
    async fn register_remote(
        &self,
        owner: SiloAddress,
        address: ActivationAddress,
    ) -> Result<ActivationAddress, DirectoryError> {
        let codec = JsonCodec;
        let body = codec
            .encode(&address)
            .map_err(|e| DirectoryError::Transport(e.to_string()))?;
        let response = self
            .system_request(owner, system_methods::DIR_REGISTER, body)
            .await?;
        codec
            .decode(&response)
            .map_err(|e| DirectoryError::Transport(e.to_string()))
    }

    async fn unregister_remote(
        &self,
        owner: SiloAddress,
        address: ActivationAddress,
    ) -> Result<(), DirectoryError> {
        let codec = JsonCodec;
        let body = codec
            .encode(&address)
            .map_err(|e| DirectoryError::Transport(e.to_string()))?;
        self.system_request(owner, system_methods::DIR_UNREGISTER, body)
            .await?;
        Ok(())
    }

    async fn lookup_remote(
        &self,
        owner: SiloAddress,
        grain: GrainId,
    ) -> Result<Option<ActivationAddress>, DirectoryError> {
        let codec = JsonCodec;
        let body = codec
            .encode(&grain)
            .map_err(|e| DirectoryError::Transport(e.to_string()))?;
        let response = self
            .system_request(owner, system_methods::DIR_LOOKUP, body)
            .await?;
        codec
            .decode(&response)
            .map_err(|e| DirectoryError::Transport(e.to_string()))
    }
}

/// [`Prober`] over system probe messages.
#[derive(Debug)]
pub struct RouterProber {
    router: Weak<MessageRouter>,
}

impl RouterProber {
    /// Prober backed by the given router.
    pub fn new(router: Weak<MessageRouter>) -> Self {
        Self { router }
    }
}

#[async_trait]
impl Prober for RouterProber {
    async fn probe(&self, target: SiloAddress) -> bool {
        let Some(router) = self.router.upgrade() else {
            return false;
        };
        let msg = Message::request(GrainId::system(GrainType::MEMBERSHIP, target))
            .from_grain(GrainId::system(GrainType::MEMBERSHIP, router.local()))
            .method(system_methods::PROBE)
            .build();
        router.send_request(msg).await.is_ok()
    }
}
