//! Per-activation scheduling: one turn at a time.
//!
//! Every activation owns a dispatcher task and a FIFO queue of work items
//! (requests, timer ticks, stop orders) plus a continuation queue fed by
//! the running turn. The dispatcher executes exactly one item at a time,
//! which is the whole single-threading guarantee: grain code never needs
//! a lock.
//!
//! Interleaving is policy-driven and turn-granular. A turn that awaits a
//! downstream call inline keeps the activation; a turn that uses
//! `call_then` ends immediately and leaves its call chain *suspended*
//! until the reply continuation runs. While any chain is suspended, a new
//! external message starts only if the reentrancy policy admits it:
//! always for `Reentrant`, per predicate for `MayInterleave`, and for
//! `CallChain` exactly when the message belongs to a suspended chain.
//! Continuations always run before the next external message.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use granary_core::{ActivationAddress, Direction, Message, RejectionKind, epoch_ms};

use crate::catalog::ActivationCatalog;
use crate::grain::{
    Continuation, ContinuationQueue, DeactivationReason, Grain, GrainContext, REMINDER_METHOD,
    SiloServices,
};
use crate::router::MessageRouter;
use crate::timers::TimerRegistry;

/// How a grain type tolerates message interleaving.
#[derive(Clone, Default)]
pub enum ReentrancyPolicy {
    /// One logical operation at a time; messages wait for the activation
    /// to go fully idle.
    #[default]
    NonReentrant,
    /// Any pending message may start while operations are suspended.
    Reentrant,
    /// A user predicate decides per message.
    MayInterleave(Arc<dyn Fn(&Message) -> bool + Send + Sync>),
    /// Messages of a currently suspended call chain may interleave;
    /// everything else waits.
    CallChain,
}

impl fmt::Debug for ReentrancyPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReentrancyPolicy::NonReentrant => "NonReentrant",
            ReentrancyPolicy::Reentrant => "Reentrant",
            ReentrancyPolicy::MayInterleave(_) => "MayInterleave(..)",
            ReentrancyPolicy::CallChain => "CallChain",
        };
        f.write_str(s)
    }
}

/// One unit of work queued for an activation.
#[derive(Debug)]
pub(crate) enum WorkItem {
    /// An incoming request or one-way message.
    Request(Box<Message>),
    /// A local timer tick.
    Timer(String),
    /// Stop order with the deactivation reason.
    Stop(DeactivationReason),
}

/// Shared handle to one activation's queue and lifecycle flags.
pub struct ActivationHandle {
    address: ActivationAddress,
    queue: mpsc::UnboundedSender<WorkItem>,
    pub(crate) continuations: Arc<ContinuationQueue>,
    pub(crate) timers: Arc<TimerRegistry>,
    last_activity_ms: AtomicU64,
    stopping: AtomicBool,
}

impl fmt::Debug for ActivationHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActivationHandle")
            .field("address", &self.address)
            .field("stopping", &self.is_stopping())
            .finish()
    }
}

impl ActivationHandle {
    pub(crate) fn new(
        address: ActivationAddress,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<WorkItem>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = Arc::new(Self {
            address,
            queue: tx.clone(),
            continuations: Arc::new(ContinuationQueue::default()),
            timers: Arc::new(TimerRegistry::new(tx)),
            last_activity_ms: AtomicU64::new(epoch_ms()),
            stopping: AtomicBool::new(false),
        });
        (handle, rx)
    }

    /// The activation's address.
    pub fn address(&self) -> &ActivationAddress {
        &self.address
    }

    /// Queue an incoming message; hands it back if the activation is
    /// stopping or gone, so the caller can reject or reroute it.
    pub(crate) fn enqueue_request(&self, msg: Box<Message>) -> Result<(), Box<Message>> {
        if self.is_stopping() {
            return Err(msg);
        }
        self.queue
            .send(WorkItem::Request(msg))
            .map_err(|e| match e.0 {
                WorkItem::Request(msg) => msg,
                _ => unreachable!("send returns what was sent"),
            })
    }

    /// Ask the dispatcher to stop. Idempotent.
    pub(crate) fn request_stop(&self, reason: DeactivationReason) {
        if !self.stopping.swap(true, Ordering::AcqRel) {
            let _ = self.queue.send(WorkItem::Stop(reason));
        }
    }

    /// Whether a stop has been requested.
    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    pub(crate) fn touch(&self) {
        self.last_activity_ms.store(epoch_ms(), Ordering::Release);
    }

    /// Last time a turn ran, ms since epoch.
    pub fn last_activity_ms(&self) -> u64 {
        self.last_activity_ms.load(Ordering::Acquire)
    }
}

/// Decide whether `msg` may start while operations are suspended.
fn admissible(policy: &ReentrancyPolicy, conts: &ContinuationQueue, msg: &Message) -> bool {
    match policy {
        ReentrancyPolicy::NonReentrant => false,
        ReentrancyPolicy::Reentrant => true,
        ReentrancyPolicy::MayInterleave(pred) => pred(msg),
        ReentrancyPolicy::CallChain => conts.is_chain_suspended(&msg.call_chain),
    }
}

/// Index of the next runnable backlog item, honoring FIFO order when the
/// activation is idle and the reentrancy policy otherwise.
fn pick_index(
    policy: &ReentrancyPolicy,
    conts: &ContinuationQueue,
    backlog: &VecDeque<WorkItem>,
) -> Option<usize> {
    if backlog.is_empty() {
        return None;
    }
    if !conts.has_suspended() {
        return Some(0);
    }
    backlog.iter().position(|item| match item {
        WorkItem::Stop(_) => true,
        WorkItem::Request(msg) => admissible(policy, conts, msg),
        // Timer ticks follow the same discipline as messages but carry no
        // chain, so only a fully reentrant activation interleaves them.
        WorkItem::Timer(_) => matches!(policy, ReentrancyPolicy::Reentrant),
    })
}

/// The per-activation dispatcher.
pub(crate) struct Dispatcher {
    pub(crate) grain: Box<dyn Grain>,
    pub(crate) handle: Arc<ActivationHandle>,
    pub(crate) policy: ReentrancyPolicy,
    pub(crate) router: Arc<MessageRouter>,
    pub(crate) catalog: std::sync::Weak<ActivationCatalog>,
    pub(crate) services: Arc<SiloServices>,
    pub(crate) drain_window: Duration,
    pub(crate) rx: mpsc::UnboundedReceiver<WorkItem>,
}

impl Dispatcher {
    /// Run until deactivation. Spawned by the catalog.
    pub(crate) async fn run(mut self) {
        let mut backlog: VecDeque<WorkItem> = VecDeque::new();
        let mut activated = false;
        let stop_reason;

        'main: loop {
            while let Some(continuation) = self.handle.continuations.pop() {
                self.run_continuation(continuation);
            }

            if let Some(index) = pick_index(&self.policy, &self.handle.continuations, &backlog) {
                let Some(item) = backlog.remove(index) else {
                    continue;
                };
                match item {
                    WorkItem::Request(msg) => {
                        if msg.is_expired(epoch_ms()) {
                            debug!(msg = %*msg, "dropping expired message before dispatch");
                            continue;
                        }
                        if !activated {
                            match self.activate(&msg).await {
                                Ok(()) => activated = true,
                                Err(reason) => {
                                    self.router.reject(
                                        &msg,
                                        RejectionKind::Transient,
                                        "activation failed",
                                    );
                                    stop_reason = reason;
                                    break 'main;
                                }
                            }
                        }
                        self.handle.touch();
                        if let Some(reason) = self.run_request(*msg).await {
                            self.handle.request_stop(reason);
                        }
                    }
                    WorkItem::Timer(name) => {
                        if !activated {
                            // A timer can only have been registered by a
                            // previous turn; a tick before activation means
                            // the activation raced a stop. Drop it.
                            continue;
                        }
                        self.handle.touch();
                        let ctx = self.idle_ctx();
                        if let Err(e) = self.grain.on_timer(&ctx, &name).await {
                            warn!(activation = %self.handle.address, timer = name,
                                error = %e, "timer callback failed");
                        }
                    }
                    WorkItem::Stop(reason) => {
                        stop_reason = reason;
                        break 'main;
                    }
                }
                continue;
            }

            tokio::select! {
                item = self.rx.recv() => match item {
                    Some(item) => backlog.push_back(item),
                    None => {
                        stop_reason = DeactivationReason::ShuttingDown;
                        break 'main;
                    }
                },
                _ = self.handle.continuations.notify.notified() => {}
            }
        }

        self.finish(stop_reason, backlog, activated).await;
    }

    async fn activate(&mut self, trigger: &Message) -> Result<(), DeactivationReason> {
        let ctx = self.ctx_for(trigger);
        match self.grain.on_activate(&ctx).await {
            Ok(()) => {
                info!(activation = %self.handle.address, "activated");
                Ok(())
            }
            Err(e) => {
                warn!(activation = %self.handle.address, error = %e, "on_activate failed");
                Err(DeactivationReason::ActivationFailed)
            }
        }
    }

    /// Execute one message turn. Returns a deactivation reason when the
    /// turn poisoned the activation.
    async fn run_request(&mut self, msg: Message) -> Option<DeactivationReason> {
        let ctx = self.ctx_for(&msg);
        let result = if msg.method == REMINDER_METHOD {
            match serde_json::from_slice::<String>(&msg.body) {
                Ok(name) => self
                    .grain
                    .on_reminder(&ctx, &name)
                    .await
                    .map(|()| Vec::new()),
                Err(e) => Err(crate::grain::GrainError::Application(format!(
                    "bad reminder body: {e}"
                ))),
            }
        } else {
            self.grain.handle(&ctx, msg.method, &msg.body).await
        };

        let mut poison = None;
        match msg.direction {
            Direction::Request => match result {
                Ok(bytes) => self.router.send_response(&msg, Ok(bytes)),
                Err(e) => {
                    if e.deactivates() {
                        poison = Some(DeactivationReason::InconsistentState);
                    }
                    self.router.send_response(&msg, Err(e.to_string()));
                }
            },
            Direction::OneWay => {
                if let Err(e) = result {
                    warn!(msg = %msg, error = %e, "one-way handler failed");
                    if e.deactivates() {
                        poison = Some(DeactivationReason::InconsistentState);
                    }
                }
            }
            Direction::Response => {
                debug!(msg = %msg, "response delivered to scheduler, ignoring");
            }
        }
        poison
    }

    fn run_continuation(&mut self, continuation: Continuation) {
        match continuation {
            Continuation::Plain { chain, work } => {
                let ctx = self.chain_ctx(chain);
                work(self.grain.as_mut(), &ctx);
            }
            Continuation::Reply {
                chain,
                callback,
                result,
            } => {
                let ctx = self.chain_ctx(chain);
                callback(self.grain.as_mut(), &ctx, result);
                // Resume after running: a callback that chains another
                // call keeps the chain suspended without a gap.
                self.handle.continuations.resume_chain(chain);
            }
        }
    }

    async fn finish(
        &mut self,
        reason: DeactivationReason,
        backlog: VecDeque<WorkItem>,
        activated: bool,
    ) {
        self.handle.request_stop(reason.clone());

        // Everything externally queued is turned away with a retryable
        // rejection; the caller re-resolves through the directory.
        for item in backlog {
            if let WorkItem::Request(msg) = item
                && msg.direction == Direction::Request
            {
                self.router
                    .reject(&msg, RejectionKind::Transient, "activation stopping");
            }
        }
        self.rx.close();
        while let Some(item) = self.rx.recv().await {
            if let WorkItem::Request(msg) = item
                && msg.direction == Direction::Request
            {
                self.router
                    .reject(&msg, RejectionKind::Transient, "activation stopping");
            }
        }

        // Queued continuations still drain, bounded by the stop window.
        let deadline = tokio::time::Instant::now() + self.drain_window;
        loop {
            while let Some(continuation) = self.handle.continuations.pop() {
                self.run_continuation(continuation);
            }
            if !self.handle.continuations.has_suspended() {
                break;
            }
            let wait = self.handle.continuations.notify.notified();
            if tokio::time::timeout_at(deadline, wait).await.is_err() {
                debug!(activation = %self.handle.address, "stop drain window expired");
                break;
            }
        }

        if activated {
            self.grain.on_deactivate(&reason).await;
        }
        self.handle.timers.cancel_all();
        info!(activation = %self.handle.address, %reason, "deactivated");

        if let Some(catalog) = self.catalog.upgrade() {
            catalog.finish_deactivation(&self.handle.address, &reason).await;
        }
    }

    fn ctx_for(&self, msg: &Message) -> GrainContext {
        GrainContext {
            address: self.handle.address.clone(),
            router: self.router.clone(),
            continuations: self.handle.continuations.clone(),
            timers: self.handle.timers.clone(),
            services: self.services.clone(),
            request_context: msg.request_context.clone(),
            call_chain: msg.call_chain,
        }
    }

    fn chain_ctx(&self, chain: granary_core::CorrelationId) -> GrainContext {
        GrainContext {
            address: self.handle.address.clone(),
            router: self.router.clone(),
            continuations: self.handle.continuations.clone(),
            timers: self.handle.timers.clone(),
            services: self.services.clone(),
            request_context: granary_core::RequestContext::new(),
            call_chain: chain,
        }
    }

    fn idle_ctx(&self) -> GrainContext {
        self.chain_ctx(granary_core::CorrelationId::default())
    }
}

#[cfg(test)]
mod tests {
    use granary_core::{CorrelationId, GrainId, GrainType};

    use super::*;

    fn request(chain: u64) -> WorkItem {
        let mut msg = Message::request(GrainId::text(GrainType(1), "g")).build();
        msg.call_chain = CorrelationId(chain);
        WorkItem::Request(Box::new(msg))
    }

    fn backlog(items: Vec<WorkItem>) -> VecDeque<WorkItem> {
        items.into_iter().collect()
    }

    #[test]
    fn test_idle_activation_runs_head_in_fifo_order() {
        let conts = ContinuationQueue::default();
        let b = backlog(vec![request(1), request(2)]);
        assert_eq!(
            pick_index(&ReentrancyPolicy::NonReentrant, &conts, &b),
            Some(0)
        );
    }

    #[test]
    fn test_non_reentrant_holds_messages_while_suspended() {
        let conts = ContinuationQueue::default();
        conts.suspend_chain(CorrelationId(1));
        let b = backlog(vec![request(1), request(2)]);
        assert_eq!(pick_index(&ReentrancyPolicy::NonReentrant, &conts, &b), None);
    }

    #[test]
    fn test_reentrant_admits_anything() {
        let conts = ContinuationQueue::default();
        conts.suspend_chain(CorrelationId(9));
        let b = backlog(vec![request(1)]);
        assert_eq!(pick_index(&ReentrancyPolicy::Reentrant, &conts, &b), Some(0));
    }

    #[test]
    fn test_call_chain_admits_only_suspended_chain() {
        let conts = ContinuationQueue::default();
        conts.suspend_chain(CorrelationId(7));
        let b = backlog(vec![request(1), request(7), request(2)]);
        assert_eq!(pick_index(&ReentrancyPolicy::CallChain, &conts, &b), Some(1));
    }

    #[test]
    fn test_may_interleave_consults_predicate() {
        let conts = ContinuationQueue::default();
        conts.suspend_chain(CorrelationId(1));
        let policy = ReentrancyPolicy::MayInterleave(Arc::new(|msg: &Message| {
            msg.call_chain == CorrelationId(42)
        }));
        let b = backlog(vec![request(1), request(42)]);
        assert_eq!(pick_index(&policy, &conts, &b), Some(1));
    }

    #[test]
    fn test_stop_is_always_admissible() {
        let conts = ContinuationQueue::default();
        conts.suspend_chain(CorrelationId(1));
        let b = backlog(vec![
            request(2),
            WorkItem::Stop(DeactivationReason::Requested),
        ]);
        assert_eq!(pick_index(&ReentrancyPolicy::NonReentrant, &conts, &b), Some(1));
    }

    #[test]
    fn test_chain_suspension_counts_nested_calls() {
        let conts = ContinuationQueue::default();
        let chain = CorrelationId(3);
        conts.suspend_chain(chain);
        conts.suspend_chain(chain);
        conts.resume_chain(chain);
        assert!(conts.is_chain_suspended(&chain));
        conts.resume_chain(chain);
        assert!(!conts.is_chain_suspended(&chain));
        assert!(!conts.has_suspended());
    }
}
