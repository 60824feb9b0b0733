//! External cluster clients.
//!
//! A [`Client`] connects to one silo (its gateway) with a client
//! preamble, sends requests through it, and awaits responses over the
//! same connection. The gateway resolves grain placement; the client
//! never learns cluster topology.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::debug;

use granary_core::{
    CorrelationId, Direction, GrainId, GrainType, JsonCodec, Message, MessageCodec,
    RejectionKind, SiloAddress, message::ResponsePayload,
};
use granary_transport::{ConnectionConfig, ConnectionManager, Preamble, TransportError};

use crate::grain::GrainError;
use crate::router::RouterError;

type PendingMap = Arc<Mutex<HashMap<CorrelationId, oneshot::Sender<Result<Vec<u8>, RouterError>>>>>;

/// A connected cluster client.
pub struct Client {
    id: String,
    gateway: SiloAddress,
    conn: Arc<ConnectionManager>,
    pending: PendingMap,
    correlation: AtomicU64,
    response_timeout: Duration,
    pump: JoinHandle<()>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.id)
            .field("gateway", &self.gateway)
            .finish()
    }
}

impl Client {
    /// Connect to `gateway`. The link is established lazily; the first
    /// call performs the handshake.
    pub fn connect(
        gateway: SiloAddress,
        cluster_id: impl Into<String>,
        client_id: impl Into<String>,
        config: ConnectionConfig,
    ) -> Self {
        let client_id = client_id.into();
        let (conn, mut inbound) =
            ConnectionManager::new(Preamble::client(client_id.clone(), cluster_id), config);
        let conn = Arc::new(conn);

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let pump_pending = pending.clone();
        let pump = tokio::spawn(async move {
            while let Some((_, msg)) = inbound.recv().await {
                if msg.direction != Direction::Response {
                    debug!(msg = %msg, "client ignoring non-response");
                    continue;
                }
                if matches!(msg.rejection, Some(RejectionKind::CacheInvalidation)) {
                    continue;
                }
                let Some(sender) = pump_pending.lock().remove(&msg.correlation) else {
                    debug!(correlation = %msg.correlation, "client response without pending call");
                    continue;
                };
                let outcome = if let Some(kind) = msg.rejection {
                    Err(RouterError::Rejected {
                        kind,
                        reason: msg
                            .rejection_reason
                            .clone()
                            .unwrap_or_else(|| "rejected".to_string()),
                    })
                } else {
                    match serde_json::from_slice::<ResponsePayload>(&msg.body) {
                        Ok(Ok(bytes)) => Ok(bytes),
                        Ok(Err(application)) => Err(RouterError::Application(application)),
                        Err(e) => Err(RouterError::Codec(granary_core::CodecError::Decode(
                            Box::new(e),
                        ))),
                    }
                };
                let _ = sender.send(outcome);
            }
        });

        Self {
            id: client_id,
            gateway,
            conn,
            pending,
            correlation: AtomicU64::new(1),
            response_timeout: Duration::from_secs(30),
            pump,
        }
    }

    /// Override the client-side response timeout.
    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    /// This client's pseudo-grain identity (responses route to it).
    pub fn grain_id(&self) -> GrainId {
        GrainId::text(GrainType::CLIENT, self.id.clone())
    }

    /// Call a grain through the gateway.
    ///
    /// # Errors
    ///
    /// Transport failures, timeouts, rejections, application errors.
    pub async fn call(
        &self,
        target: GrainId,
        method: u32,
        body: Vec<u8>,
    ) -> Result<Vec<u8>, RouterError> {
        let correlation = CorrelationId(self.correlation.fetch_add(1, Ordering::Relaxed));
        let mut msg = Message::request(target.clone())
            .from_grain(self.grain_id())
            .method(method)
            .body(body)
            .build();
        msg.correlation = correlation;
        msg.call_chain = correlation;
        msg.expires_at_ms =
            granary_core::epoch_ms() + self.response_timeout.as_millis() as u64;

        let (sender, receiver) = oneshot::channel();
        self.pending.lock().insert(correlation, sender);

        if let Err(e) = self.conn.send_to_silo(self.gateway, msg) {
            self.pending.lock().remove(&correlation);
            return Err(e.into());
        }

        match tokio::time::timeout(self.response_timeout, receiver).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(RouterError::ShuttingDown),
            Err(_) => {
                self.pending.lock().remove(&correlation);
                Err(RouterError::Timeout { target })
            }
        }
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

    /// Send a one-way message through the gateway.
    ///
    /// # Errors
    ///
    /// Transport failures queueing the message.
    pub fn one_way(
        &self,
        target: GrainId,
        method: u32,
        body: Vec<u8>,
    ) -> Result<(), TransportError> {
        let mut msg = Message::one_way(target)
            .from_grain(self.grain_id())
            .method(method)
            .body(body)
            .build();
        msg.expires_at_ms =
            granary_core::epoch_ms() + self.response_timeout.as_millis() as u64;
        self.conn.send_to_silo(self.gateway, msg)
    }

    /// Disconnect; pending calls fail.
    pub fn shutdown(&self) {
        self.pump.abort();
        self.conn.shutdown();
        for (_, sender) in self.pending.lock().drain() {
            let _ = sender.send(Err(RouterError::ShuttingDown));
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.shutdown();
    }
}
