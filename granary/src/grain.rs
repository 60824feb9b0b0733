//! The grain abstraction: user-implemented virtual actors.
//!
//! A [`Grain`] is activated on demand, receives one turn at a time, and is
//! deactivated when idle or told to go. The [`GrainContext`] handed to
//! every turn is the grain's window on the runtime: its own identity,
//! calls to other grains, timers, continuations, and state storage.

use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use granary_core::{
    ActivationAddress, CodecError, CorrelationId, GrainId, JsonCodec, Message, MessageCodec,
    RequestContext, SiloAddress,
};

use crate::reminders::ReminderStore;
use crate::router::{MessageRouter, RouterError};
use crate::state::{GrainStateStore, StateError};
use crate::timers::TimerRegistry;

/// Reserved method discriminant for reminder ticks.
pub const REMINDER_METHOD: u32 = 0xFFFF_FFFF;

/// Why an activation is going away. Logged, surfaced to
/// `on_deactivate`, and for some reasons grounds for a re-activation
/// cool-down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeactivationReason {
    /// The silo is shutting down.
    ShuttingDown,
    /// Collected after sitting idle past the configured age.
    Idle,
    /// Explicitly requested by application code.
    Requested,
    /// A concurrent registration elsewhere won the race.
    DuplicateActivation,
    /// `on_activate` failed; the activation never became valid.
    ActivationFailed,
    /// The grain failed in a way that poisons the activation.
    ApplicationError,
    /// Storage reported a state conflict; only this activation dies.
    InconsistentState,
}

impl DeactivationReason {
    /// Whether re-activation is held back for a cool-down.
    pub fn blocks_reactivation(&self) -> bool {
        matches!(
            self,
            DeactivationReason::ApplicationError
                | DeactivationReason::InconsistentState
                | DeactivationReason::ActivationFailed
        )
    }
}

impl fmt::Display for DeactivationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeactivationReason::ShuttingDown => "ShuttingDown",
            DeactivationReason::Idle => "Idle",
            DeactivationReason::Requested => "Requested",
            DeactivationReason::DuplicateActivation => "DuplicateActivation",
            DeactivationReason::ActivationFailed => "ActivationFailed",
            DeactivationReason::ApplicationError => "ApplicationError",
            DeactivationReason::InconsistentState => "InconsistentState",
        };
        f.write_str(s)
    }
}

/// Errors surfaced by grain code.
#[derive(Debug, thiserror::Error)]
pub enum GrainError {
    /// Application-level failure; travels verbatim in the response body.
    #[error("{0}")]
    Application(String),

    /// The method discriminant is not part of this grain's interface.
    #[error("unknown method: {0}")]
    UnknownMethod(u32),

    /// Payload (de)serialization failed.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// A downstream grain call failed.
    #[error("downstream call failed: {0}")]
    Call(#[from] RouterError),

    /// State storage failed. An `InconsistentState` here deactivates the
    /// calling activation.
    #[error(transparent)]
    State(#[from] StateError),
}

impl GrainError {
    /// Whether this failure poisons the activation.
    pub fn deactivates(&self) -> bool {
        matches!(self, GrainError::State(StateError::InconsistentState { .. }))
    }
}

/// A virtual actor implementation.
///
/// One instance exists per activation; the scheduler guarantees at most
/// one turn executes at a time, so methods take `&mut self` without any
/// locking.
#[async_trait]
pub trait Grain: Send + 'static {
    /// Runs before the first turn is dispatched. Failure fails the
    /// triggering request with a retryable rejection and removes the
    /// partially created activation.
    async fn on_activate(&mut self, ctx: &GrainContext) -> Result<(), GrainError> {
        let _ = ctx;
        Ok(())
    }

    /// Runs after the last turn, before the activation is removed.
    async fn on_deactivate(&mut self, reason: &DeactivationReason) {
        let _ = reason;
    }

    /// Handle one method invocation.
    async fn handle(
        &mut self,
        ctx: &GrainContext,
        method: u32,
        body: &[u8],
    ) -> Result<Vec<u8>, GrainError>;

    /// Handle a local timer tick.
    async fn on_timer(&mut self, ctx: &GrainContext, timer: &str) -> Result<(), GrainError> {
        let _ = (ctx, timer);
        Ok(())
    }

    /// Handle a durable reminder tick.
    async fn on_reminder(&mut self, ctx: &GrainContext, reminder: &str) -> Result<(), GrainError> {
        let _ = (ctx, reminder);
        Ok(())
    }

    /// Downcast support for typed continuations.
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// A deferred unit of work queued behind the current turn.
pub(crate) enum Continuation {
    /// Posted by the running turn; runs before the next external message.
    Plain {
        /// The chain of the turn that posted it.
        chain: CorrelationId,
        /// The work itself.
        work: Box<dyn FnOnce(&mut dyn Grain, &GrainContext) + Send>,
    },
    /// The response half of [`GrainContext::call_then`]; closes the
    /// suspended call chain it belongs to.
    Reply {
        /// The chain the originating turn belonged to.
        chain: CorrelationId,
        /// The user callback.
        callback: ReplyCallback,
        /// The downstream call's outcome.
        result: Result<Vec<u8>, RouterError>,
    },
}

/// Boxed user callback for [`GrainContext::call_then`].
pub type ReplyCallback =
    Box<dyn FnOnce(&mut dyn Grain, &GrainContext, Result<Vec<u8>, RouterError>) + Send>;

/// Shared queue of continuations for one activation, plus the set of call
/// chains with replies still in flight. The dispatcher drains this before
/// touching externally queued messages.
#[derive(Default)]
pub(crate) struct ContinuationQueue {
    items: Mutex<VecDeque<Continuation>>,
    /// chain → number of outstanding replies.
    suspended: Mutex<std::collections::HashMap<CorrelationId, usize>>,
    pub(crate) notify: Notify,
}

impl ContinuationQueue {
    pub(crate) fn push(&self, continuation: Continuation) {
        self.items.lock().push_back(continuation);
        self.notify.notify_one();
    }

    pub(crate) fn pop(&self) -> Option<Continuation> {
        self.items.lock().pop_front()
    }

    pub(crate) fn suspend_chain(&self, chain: CorrelationId) {
        *self.suspended.lock().entry(chain).or_insert(0) += 1;
    }

    pub(crate) fn resume_chain(&self, chain: CorrelationId) {
        let mut suspended = self.suspended.lock();
        if let Some(count) = suspended.get_mut(&chain) {
            *count -= 1;
            if *count == 0 {
                suspended.remove(&chain);
            }
        }
    }

    /// Whether any logical operation is suspended mid-chain.
    pub(crate) fn has_suspended(&self) -> bool {
        !self.suspended.lock().is_empty()
    }

    pub(crate) fn is_chain_suspended(&self, chain: &CorrelationId) -> bool {
        self.suspended.lock().contains_key(chain)
    }
}

/// Silo-level services grains reach through their context.
#[derive(Default)]
pub struct SiloServices {
    /// Durable state storage, when configured.
    pub state_store: Option<Arc<dyn GrainStateStore>>,
    /// Durable reminder storage, when configured.
    pub reminder_store: Option<Arc<dyn ReminderStore>>,
}

impl fmt::Debug for SiloServices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SiloServices")
            .field("state_store", &self.state_store.is_some())
            .field("reminder_store", &self.reminder_store.is_some())
            .finish()
    }
}

/// Per-turn view of the runtime handed to grain code.
pub struct GrainContext {
    pub(crate) address: ActivationAddress,
    pub(crate) router: Arc<MessageRouter>,
    pub(crate) continuations: Arc<ContinuationQueue>,
    pub(crate) timers: Arc<TimerRegistry>,
    pub(crate) services: Arc<SiloServices>,
    /// Context entries of the request being processed.
    pub(crate) request_context: RequestContext,
    /// Root correlation id of the call chain being processed.
    pub(crate) call_chain: CorrelationId,
}

impl fmt::Debug for GrainContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GrainContext")
            .field("address", &self.address)
            .field("call_chain", &self.call_chain)
            .finish()
    }
}

impl GrainContext {
    /// This activation's grain identity.
    pub fn grain(&self) -> &GrainId {
        &self.address.grain
    }

    /// This activation's full address.
    pub fn address(&self) -> &ActivationAddress {
        &self.address
    }

    /// The hosting silo.
    pub fn silo(&self) -> SiloAddress {
        self.address.silo
    }

    /// A stable string identifying this exact activation — callers racing
    /// to create a grain can compare what they observed.
    pub fn runtime_identity(&self) -> String {
        format!("{}", self.address)
    }

    /// Context entries propagated with the current request.
    pub fn request_context(&self) -> &RequestContext {
        &self.request_context
    }

    /// Call another grain and await its response.
    ///
    /// The turn keeps the activation until the call completes; for
    /// interleaving-friendly flows use [`call_then`](Self::call_then).
    ///
    /// # Errors
    ///
    /// Routing, timeout, and application failures from the target.
    pub async fn call(
        &self,
        target: GrainId,
        method: u32,
        body: Vec<u8>,
    ) -> Result<Vec<u8>, RouterError> {
        let msg = self.outgoing(target, method, body).build();
        self.router.send_request(self.stamp(msg)).await
    }

    /// Call another grain with a typed request/response pair.
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

    /// Call another grain; the reply runs as a continuation on this
    /// activation instead of blocking the current turn.
    ///
    /// The call chain stays suspended until the callback has run, which
    /// is what call-chain reentrancy keys on: messages of the same chain
    /// may interleave into the gap.
    pub fn call_then(
        &self,
        target: GrainId,
        method: u32,
        body: Vec<u8>,
        callback: ReplyCallback,
    ) {
        let msg = self.stamp(self.outgoing(target, method, body).build());
        let chain = self.call_chain;
        let continuations = self.continuations.clone();
        continuations.suspend_chain(chain);

        let sink_queue = self.continuations.clone();
        self.router.send_request_with_sink(
            msg,
            Box::new(move |result| {
                sink_queue.push(Continuation::Reply {
                    chain,
                    callback,
                    result,
                });
            }),
        );
    }

    /// Send a one-way message to another grain.
    ///
    /// # Errors
    ///
    /// Local routing failures only; delivery is fire-and-forget.
    pub fn one_way(&self, target: GrainId, method: u32, body: Vec<u8>) -> Result<(), RouterError> {
        let msg = Message::one_way(target)
            .from_grain(self.address.grain.clone())
            .method(method)
            .body(body)
            .context(self.request_context.clone())
            .build();
        self.router.send_one_way(self.stamp(msg))
    }

    /// Post work to run after the current turn, before the next external
    /// message.
    pub fn post(&self, work: impl FnOnce(&mut dyn Grain, &GrainContext) + Send + 'static) {
        self.continuations.push(Continuation::Plain {
            chain: self.call_chain,
            work: Box::new(work),
        });
    }

    /// Register (or reschedule) a local timer delivering
    /// [`Grain::on_timer`] ticks to this activation.
    pub fn register_timer(
        &self,
        name: impl Into<String>,
        due: std::time::Duration,
        period: Option<std::time::Duration>,
    ) {
        self.timers.register(name.into(), due, period);
    }

    /// Cancel a local timer.
    pub fn cancel_timer(&self, name: &str) {
        self.timers.cancel(name);
    }

    /// The configured state store.
    pub fn state_store(&self) -> Option<Arc<dyn GrainStateStore>> {
        self.services.state_store.clone()
    }

    /// The configured reminder store.
    pub fn reminder_store(&self) -> Option<Arc<dyn ReminderStore>> {
        self.services.reminder_store.clone()
    }

    fn outgoing(&self, target: GrainId, method: u32, body: Vec<u8>) -> granary_core::MessageBuilder {
        Message::request(target)
            .from_grain(self.address.grain.clone())
            .method(method)
            .body(body)
            .context(self.request_context.clone())
    }

    /// Stamp chain inheritance onto an outgoing message.
    fn stamp(&self, mut msg: Message) -> Message {
        msg.call_chain = self.call_chain;
        msg
    }
}
