//! The message model.
//!
//! Every interaction in the cluster — grain calls, responses, rejections,
//! directory traffic, membership probes — is a [`Message`]. The header
//! carries addressing and control data the runtime routes on; the body is
//! opaque bytes the target interface decodes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::grain::{ActivationAddress, ActivationId, GrainId, GrainType};
use crate::types::SiloAddress;

/// Per-silo unique request/response correlation id.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub struct CorrelationId(pub u64);

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "c{:x}", self.0)
    }
}

/// Message direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    /// Expects a response correlated by [`CorrelationId`].
    Request,
    /// Completes a pending request.
    Response,
    /// Fire-and-forget; silently dropped on expiry.
    OneWay,
}

/// Why a message was rejected rather than answered.
///
/// Rejections travel as `Response`-direction messages whose header carries
/// the kind; the router decides per kind whether to retry, invalidate, or
/// surface the failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectionKind {
    /// Transient condition (target stopping, queue full): retry as-is.
    Transient,
    /// The addressed activation is gone: invalidate cached addresses,
    /// re-resolve, retry.
    Unrecoverable,
    /// Gateway overload: retry after a backoff.
    GatewayTooBusy,
    /// Pure cache-invalidation carrier; does not complete the request.
    CacheInvalidation,
    /// The request was already processed; ignore.
    DuplicateRequest,
}

impl RejectionKind {
    /// Whether the router may retry the rejected message.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            RejectionKind::Transient | RejectionKind::Unrecoverable | RejectionKind::GatewayTooBusy
        )
    }
}

impl std::fmt::Display for RejectionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RejectionKind::Transient => "Transient",
            RejectionKind::Unrecoverable => "Unrecoverable",
            RejectionKind::GatewayTooBusy => "GatewayTooBusy",
            RejectionKind::CacheInvalidation => "CacheInvalidation",
            RejectionKind::DuplicateRequest => "DuplicateRequest",
        };
        f.write_str(s)
    }
}

/// Caller-propagated context entries (trace ids, cancellation flags).
///
/// Flows with the request to the target activation and onward into any
/// downstream calls it makes.
pub type RequestContext = BTreeMap<String, String>;

/// Body of a `Response`-direction message: the serialized result payload
/// or the application error text thrown by the invokable.
pub type ResponsePayload = Result<Vec<u8>, String>;

/// A routed cluster message.
///
/// Wire layout is two frames (header, body); see `granary-transport`. The
/// runtime only ever inspects the header — bodies are decoded by the
/// target interface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Request/response correlation id, unique per sending silo.
    pub correlation: CorrelationId,
    /// Root correlation id of the logical call chain this message belongs
    /// to. Set once at the chain's entry point and propagated unchanged;
    /// call-chain reentrancy keys on it.
    pub call_chain: CorrelationId,
    /// Direction of travel.
    pub direction: Direction,
    /// The grain being invoked (or, for responses, the original target).
    pub target_grain: GrainId,
    /// The grain (or client pseudo-grain) that sent the message.
    pub sending_grain: GrainId,
    /// Silo the message is addressed to, when resolved.
    pub target_silo: Option<SiloAddress>,
    /// Specific activation the sender believes is current, when known.
    pub target_activation: Option<ActivationId>,
    /// Silo the message left from.
    pub sending_silo: Option<SiloAddress>,
    /// Interface tag used for dispatch (normally `target_grain.kind`).
    pub interface: GrainType,
    /// Interface version for compatibility checks.
    pub interface_version: u32,
    /// Method discriminant within the interface.
    pub method: u32,
    /// Absolute expiry, milliseconds since epoch. Checked at every
    /// handoff point; expired requests surface Timeout to the caller.
    pub expires_at_ms: u64,
    /// Times this message has been retried (send failures, rejections,
    /// reroutes share this counter).
    pub retries: u32,
    /// Times this message has been forwarded between silos.
    pub forward_count: u8,
    /// Activation addresses the sender knows to be stale; the receiver
    /// drops them from its directory cache before any other processing.
    pub cache_invalidation: Vec<ActivationAddress>,
    /// Caller-propagated context entries.
    pub request_context: RequestContext,
    /// Rejection kind, present only on rejection responses.
    pub rejection: Option<RejectionKind>,
    /// Human-readable rejection reason, for logs and surfaced errors.
    pub rejection_reason: Option<String>,
    /// Opaque payload: the serialized invokable or response.
    pub body: Vec<u8>,
}

impl Message {
    /// Start building a request to `target`.
    pub fn request(target: GrainId) -> MessageBuilder {
        MessageBuilder::new(target, Direction::Request)
    }

    /// Start building a one-way message to `target`.
    pub fn one_way(target: GrainId) -> MessageBuilder {
        MessageBuilder::new(target, Direction::OneWay)
    }

    /// Whether the message is past its expiry at `now_ms`.
    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms > self.expires_at_ms
    }

    /// Build the response to this request with the given payload.
    ///
    /// Addressing is mirrored (target ↔ sender) and the correlation id,
    /// call chain, and request context are carried over.
    pub fn to_response(&self, body: Vec<u8>) -> Message {
        Message {
            correlation: self.correlation,
            call_chain: self.call_chain,
            direction: Direction::Response,
            target_grain: self.sending_grain.clone(),
            sending_grain: self.target_grain.clone(),
            target_silo: self.sending_silo,
            target_activation: None,
            sending_silo: self.target_silo,
            interface: self.interface,
            interface_version: self.interface_version,
            method: self.method,
            expires_at_ms: self.expires_at_ms,
            retries: 0,
            forward_count: 0,
            cache_invalidation: Vec::new(),
            request_context: self.request_context.clone(),
            rejection: None,
            rejection_reason: None,
            body,
        }
    }

    /// Build a rejection response to this request.
    pub fn to_rejection(&self, kind: RejectionKind, reason: impl Into<String>) -> Message {
        let mut msg = self.to_response(Vec::new());
        msg.rejection = Some(kind);
        msg.rejection_reason = Some(reason.into());
        msg
    }
}

impl std::fmt::Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:?} {} {}→{} m{}",
            self.direction, self.correlation, self.sending_grain, self.target_grain, self.method
        )?;
        if let Some(kind) = self.rejection {
            write!(f, " [{kind}]")?;
        }
        Ok(())
    }
}

/// Builder for [`Message`]. The router fills correlation, expiry, and
/// sending-silo at send time; callers set addressing and payload.
#[derive(Debug)]
pub struct MessageBuilder {
    msg: Message,
}

impl MessageBuilder {
    fn new(target: GrainId, direction: Direction) -> Self {
        let interface = target.kind;
        Self {
            msg: Message {
                correlation: CorrelationId::default(),
                call_chain: CorrelationId::default(),
                direction,
                sending_grain: GrainId::text(GrainType::CLIENT, ""),
                target_grain: target,
                target_silo: None,
                target_activation: None,
                sending_silo: None,
                interface,
                interface_version: 1,
                method: 0,
                expires_at_ms: u64::MAX,
                retries: 0,
                forward_count: 0,
                cache_invalidation: Vec::new(),
                request_context: RequestContext::new(),
                rejection: None,
                rejection_reason: None,
                body: Vec::new(),
            },
        }
    }

    /// Set the method discriminant.
    pub fn method(mut self, method: u32) -> Self {
        self.msg.method = method;
        self
    }

    /// Set the sending grain identity.
    pub fn from_grain(mut self, sender: GrainId) -> Self {
        self.msg.sending_grain = sender;
        self
    }

    /// Set the serialized invokable body.
    pub fn body(mut self, body: Vec<u8>) -> Self {
        self.msg.body = body;
        self
    }

    /// Set the interface version.
    pub fn interface_version(mut self, version: u32) -> Self {
        self.msg.interface_version = version;
        self
    }

    /// Merge entries into the request context.
    pub fn context(mut self, ctx: RequestContext) -> Self {
        self.msg.request_context.extend(ctx);
        self
    }

    /// Finish building.
    pub fn build(self) -> Message {
        self.msg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> GrainId {
        GrainId::text(GrainType(0xBA4E), "alice")
    }

    #[test]
    fn test_builder_defaults() {
        let msg = Message::request(target()).method(3).build();
        assert_eq!(msg.direction, Direction::Request);
        assert_eq!(msg.method, 3);
        assert_eq!(msg.interface, GrainType(0xBA4E));
        assert!(msg.cache_invalidation.is_empty());
        assert!(msg.rejection.is_none());
    }

    #[test]
    fn test_response_mirrors_addressing() {
        let mut req = Message::request(target())
            .from_grain(GrainId::text(GrainType(0x504C), "caller"))
            .build();
        req.correlation = CorrelationId(9);
        req.call_chain = CorrelationId(4);
        req.sending_silo = Some(crate::SiloAddress::new(
            crate::NetworkAddress::localhost(11111),
            1,
        ));

        let resp = req.to_response(vec![1, 2]);
        assert_eq!(resp.direction, Direction::Response);
        assert_eq!(resp.correlation, CorrelationId(9));
        assert_eq!(resp.call_chain, CorrelationId(4));
        assert_eq!(resp.target_grain, req.sending_grain);
        assert_eq!(resp.sending_grain, req.target_grain);
        assert_eq!(resp.target_silo, req.sending_silo);
        assert_eq!(resp.body, vec![1, 2]);
    }

    #[test]
    fn test_rejection_carries_kind_and_reason() {
        let req = Message::request(target()).build();
        let rej = req.to_rejection(RejectionKind::Transient, "activation stopping");
        assert_eq!(rej.rejection, Some(RejectionKind::Transient));
        assert_eq!(rej.rejection_reason.as_deref(), Some("activation stopping"));
        assert_eq!(rej.direction, Direction::Response);
    }

    #[test]
    fn test_retryable_kinds() {
        assert!(RejectionKind::Transient.is_retryable());
        assert!(RejectionKind::Unrecoverable.is_retryable());
        assert!(RejectionKind::GatewayTooBusy.is_retryable());
        assert!(!RejectionKind::CacheInvalidation.is_retryable());
        assert!(!RejectionKind::DuplicateRequest.is_retryable());
    }

    #[test]
    fn test_expiry() {
        let mut msg = Message::request(target()).build();
        msg.expires_at_ms = 1_000;
        assert!(!msg.is_expired(999));
        assert!(!msg.is_expired(1_000));
        assert!(msg.is_expired(1_001));
    }

    #[test]
    fn test_message_serde_roundtrip() {
        let mut msg = Message::request(target())
            .method(7)
            .body(vec![9, 9, 9])
            .build();
        msg.cache_invalidation.push(crate::ActivationAddress::new(
            target(),
            crate::SiloAddress::new(crate::NetworkAddress::localhost(11111), 1),
            crate::ActivationId::new(1),
        ));
        msg.request_context
            .insert("trace".to_string(), "abc".to_string());

        let bytes = serde_json::to_vec(&msg).expect("serialize");
        let back: Message = serde_json::from_slice(&bytes).expect("deserialize");
        assert_eq!(back.method, 7);
        assert_eq!(back.body, vec![9, 9, 9]);
        assert_eq!(back.cache_invalidation.len(), 1);
        assert_eq!(back.request_context.get("trace").map(String::as_str), Some("abc"));
    }
}
