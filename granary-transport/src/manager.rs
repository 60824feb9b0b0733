//! Connection-per-peer management.
//!
//! The [`ConnectionManager`] holds at most one outbound connection per
//! remote silo and one accepted connection per remote node, runs the
//! listener accept loop, and funnels every inbound message into a single
//! channel the runtime consumes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use granary_core::{Message, NetworkAddress, SiloAddress};

use crate::connection::{Connection, ConnectionConfig, InboundSender};
use crate::error::TransportError;
use crate::preamble::{NodeIdentity, Preamble, read_preamble, write_preamble};

/// Receiving end of the manager's inbound funnel.
pub type InboundReceiver = mpsc::Receiver<(NodeIdentity, Message)>;

/// Capacity of the inbound funnel shared by all connections.
const INBOUND_CHANNEL_CAPACITY: usize = 4096;

/// One connection per peer, per direction.
pub struct ConnectionManager {
    local: Preamble,
    config: ConnectionConfig,
    /// Connections we dialed, keyed by remote silo.
    outbound: Mutex<HashMap<SiloAddress, Connection>>,
    /// Connections the listener accepted, keyed by announced identity.
    /// Shared with the accept loop, which registers new links here.
    accepted: Arc<Mutex<HashMap<NodeIdentity, Connection>>>,
    inbound_tx: InboundSender,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("local", &self.local.node)
            .finish()
    }
}

impl ConnectionManager {
    /// Create a manager and the inbound receiver the runtime drains.
    pub fn new(local: Preamble, config: ConnectionConfig) -> (Self, InboundReceiver) {
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CHANNEL_CAPACITY);
        (
            Self {
                local,
                config,
                outbound: Mutex::new(HashMap::new()),
                accepted: Arc::new(Mutex::new(HashMap::new())),
                inbound_tx,
                listener: Mutex::new(None),
            },
            inbound_rx,
        )
    }

    /// This node's preamble.
    pub fn local(&self) -> &Preamble {
        &self.local
    }

    /// Bind the listener and start accepting connections.
    ///
    /// Returns the actually bound address (useful with port 0).
    ///
    /// # Errors
    ///
    /// Propagates bind failures.
    pub async fn listen(&self, bind: NetworkAddress) -> Result<NetworkAddress, TransportError> {
        let listener = TcpListener::bind((bind.ip, bind.port)).await?;
        let bound = listener.local_addr()?;
        let bound = NetworkAddress::new(bound.ip(), bound.port());
        info!(node = %self.local.node, %bound, "listening");

        let local = self.local.clone();
        let config = self.config.clone();
        let inbound_tx = self.inbound_tx.clone();
        let accepted = self.accepted.clone();

        let handle = tokio::spawn(async move {
            loop {
                let (stream, remote_addr) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                let local = local.clone();
                let config = config.clone();
                let inbound_tx = inbound_tx.clone();
                let accepted = accepted.clone();
                tokio::spawn(async move {
                    match accept_handshake(stream, &local, &config).await {
                        Ok((stream, peer)) => {
                            debug!(%peer, %remote_addr, "accepted connection");
                            let conn =
                                Connection::from_accepted(stream, peer.clone(), config, inbound_tx);
                            if let Some(old) = lock(&accepted).insert(peer, conn) {
                                old.close();
                            }
                        }
                        Err(e) => {
                            warn!(%remote_addr, error = %e, "rejected connection");
                        }
                    }
                });
            }
        });

        *lock(&self.listener) = Some(handle);
        Ok(bound)
    }

    /// Send to a silo, dialing a connection if none exists yet.
    ///
    /// # Errors
    ///
    /// Queue/closed errors from the connection; a closed connection is
    /// replaced once and retried.
    pub fn send_to_silo(&self, silo: SiloAddress, msg: Message) -> Result<(), TransportError> {
        let mut outbound = lock(&self.outbound);
        let stale = outbound.get(&silo).is_some_and(Connection::is_closed);
        if stale {
            outbound.remove(&silo);
        }
        let conn = outbound.entry(silo).or_insert_with(|| {
            Connection::connect(
                self.local.clone(),
                silo,
                self.config.clone(),
                self.inbound_tx.clone(),
            )
        });
        conn.try_send(msg)
    }

    /// Send to a node we already have a link with (accepted side first;
    /// silos fall back to dialing).
    ///
    /// # Errors
    ///
    /// `NoRoute` for unknown clients; connection errors otherwise.
    pub fn send_to_peer(&self, peer: &NodeIdentity, msg: Message) -> Result<(), TransportError> {
        {
            let accepted = lock(&self.accepted);
            if let Some(conn) = accepted.get(peer)
                && !conn.is_closed()
            {
                return conn.try_send(msg);
            }
        }
        match peer {
            NodeIdentity::Silo(silo) => self.send_to_silo(*silo, msg),
            NodeIdentity::Client(id) => Err(TransportError::ConnectionClosed {
                peer: format!("client-{id}"),
            }),
        }
    }

    /// Drop every link to a silo (it was declared Dead).
    pub fn drop_silo(&self, silo: SiloAddress) {
        if let Some(conn) = lock(&self.outbound).remove(&silo) {
            conn.close();
        }
        if let Some(conn) = lock(&self.accepted).remove(&NodeIdentity::Silo(silo)) {
            conn.close();
        }
    }

    /// Close every connection and stop the listener.
    pub fn shutdown(&self) {
        if let Some(handle) = lock(&self.listener).take() {
            handle.abort();
        }
        for (_, conn) in lock(&self.outbound).drain() {
            conn.close();
        }
        for (_, conn) in lock(&self.accepted).drain() {
            conn.close();
        }
    }

    /// Identities with a live accepted link (gateway clients and peers).
    pub fn accepted_peers(&self) -> Vec<NodeIdentity> {
        lock(&self.accepted)
            .iter()
            .filter(|(_, c)| !c.is_closed())
            .map(|(id, _)| id.clone())
            .collect()
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Server side of the preamble exchange.
async fn accept_handshake(
    mut stream: tokio::net::TcpStream,
    local: &Preamble,
    config: &ConnectionConfig,
) -> Result<(tokio::net::TcpStream, NodeIdentity), TransportError> {
    let exchange = async {
        let remote = read_preamble(&mut stream).await?;
        remote.validate(&local.cluster_id)?;
        write_preamble(&mut stream, local).await?;
        Ok::<_, TransportError>(remote)
    };
    let remote = tokio::time::timeout(config.handshake_timeout, exchange)
        .await
        .map_err(|_| TransportError::HandshakeTimeout)??;
    Ok((stream, remote.node))
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use granary_core::{Direction, GrainId, GrainType, Message};

    use super::*;

    fn test_message(text: &str) -> Message {
        Message::one_way(GrainId::text(GrainType(0x7E57), text)).build()
    }

    /// Reserve a free port, then announce and bind it. The tiny window
    /// between probe and bind is acceptable in tests.
    async fn started_manager(
        generation: i64,
        cluster: &str,
    ) -> (ConnectionManager, InboundReceiver, SiloAddress) {
        let probe = TcpListener::bind(("127.0.0.1", 0)).await.expect("probe");
        let port = probe.local_addr().expect("probe addr").port();
        drop(probe);

        let identity = SiloAddress::new(NetworkAddress::localhost(port), generation);
        let (manager, inbound) = ConnectionManager::new(
            Preamble::silo(identity, cluster),
            ConnectionConfig::local(),
        );
        manager.listen(identity.endpoint).await.expect("listen");
        (manager, inbound, identity)
    }

    #[tokio::test]
    async fn test_silo_to_silo_roundtrip() {
        let (a, _a_rx, _a_addr) = started_manager(1, "prod").await;
        let (b, mut b_rx, b_addr) = started_manager(2, "prod").await;

        a.send_to_silo(b_addr, test_message("hello"))
            .expect("queue message");

        let (peer, msg) = tokio::time::timeout(std::time::Duration::from_secs(5), b_rx.recv())
            .await
            .expect("timely delivery")
            .expect("message");
        assert_eq!(msg.target_grain.key.to_string(), "hello");
        assert!(matches!(peer, NodeIdentity::Silo(_)));
        drop(b);
    }

    #[tokio::test]
    async fn test_cluster_mismatch_is_fatal() {
        let (a, _a_rx, _a_addr) = started_manager(1, "prod").await;
        let (_b, mut b_rx, b_addr) = started_manager(2, "staging").await;

        a.send_to_silo(b_addr, test_message("nope"))
            .expect("queueing succeeds before the handshake fails");

        // The staging listener must never deliver the message.
        let outcome =
            tokio::time::timeout(std::time::Duration::from_millis(500), b_rx.recv()).await;
        assert!(outcome.is_err(), "message crossed a cluster boundary");
    }

    #[tokio::test]
    async fn test_send_to_unknown_client_fails() {
        let (a, _rx, _addr) = started_manager(1, "prod").await;
        let result = a.send_to_peer(
            &NodeIdentity::Client("ghost".to_string()),
            test_message("x"),
        );
        assert!(matches!(
            result,
            Err(TransportError::ConnectionClosed { .. })
        ));
    }

    #[tokio::test]
    async fn test_drop_silo_closes_connection() {
        let (a, _a_rx, _) = started_manager(1, "prod").await;
        let (_b, mut b_rx, b_addr) = started_manager(2, "prod").await;

        a.send_to_silo(b_addr, test_message("first")).expect("send");
        let _ = tokio::time::timeout(std::time::Duration::from_secs(5), b_rx.recv())
            .await
            .expect("timely")
            .expect("delivered");

        a.drop_silo(b_addr);
        // A fresh connection is dialed on the next send.
        a.send_to_silo(b_addr, test_message("second")).expect("send");
        let (_, msg) = tokio::time::timeout(std::time::Duration::from_secs(5), b_rx.recv())
            .await
            .expect("timely")
            .expect("delivered");
        assert_eq!(msg.target_grain.key.to_string(), "second");
    }

    #[test]
    fn test_message_direction_of_one_way() {
        assert_eq!(test_message("x").direction, Direction::OneWay);
    }
}
