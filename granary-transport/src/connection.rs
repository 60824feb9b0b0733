//! A single peer connection.
//!
//! A [`Connection`] owns one socket to one remote node. Senders append to
//! a bounded outbound queue; a background task drains the queue onto the
//! socket and feeds inbound frames to the shared inbound channel. Outbound
//! connections re-establish themselves with exponential backoff; accepted
//! connections end when the socket does (the remote side reconnects).

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use granary_core::{Message, SiloAddress};

use crate::error::TransportError;
use crate::preamble::{NodeIdentity, Preamble, read_preamble, write_preamble};
use crate::wire::{encode_message, try_decode_frame};

/// Delivery channel for inbound messages, tagged with the peer identity.
pub type InboundSender = mpsc::Sender<(NodeIdentity, Message)>;

/// Configuration for connection behavior and reconnection parameters.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Timeout for a single TCP connect attempt.
    pub connect_timeout: Duration,
    /// Timeout for the preamble exchange after connect/accept.
    pub handshake_timeout: Duration,
    /// Initial delay before the first reconnection attempt.
    pub initial_reconnect_delay: Duration,
    /// Upper bound on the reconnection backoff.
    pub max_reconnect_delay: Duration,
    /// Outbound queue capacity; sends beyond it fail with `QueueFull`.
    pub outbound_queue: usize,
    /// Consecutive connect failures before the connection gives up.
    /// `None` retries forever.
    pub max_connect_failures: Option<u32>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(5),
            initial_reconnect_delay: Duration::from_millis(100),
            max_reconnect_delay: Duration::from_secs(30),
            outbound_queue: 1024,
            max_connect_failures: None,
        }
    }
}

impl ConnectionConfig {
    /// Configuration tuned for loopback test clusters.
    pub fn local() -> Self {
        Self {
            connect_timeout: Duration::from_millis(500),
            handshake_timeout: Duration::from_millis(500),
            initial_reconnect_delay: Duration::from_millis(10),
            max_reconnect_delay: Duration::from_secs(1),
            outbound_queue: 1024,
            max_connect_failures: Some(20),
        }
    }
}

/// Handle to one peer link.
///
/// Cheap to clone the sender side of; dropping the handle closes the link.
pub struct Connection {
    peer: NodeIdentity,
    outbound: mpsc::Sender<Message>,
    closed: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.peer)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Connection {
    /// Open an outbound connection to a peer silo.
    ///
    /// Connects lazily in the background: messages queue until the link is
    /// up. The remote preamble must identify exactly `peer` — a different
    /// generation on the same endpoint means the silo we wanted is gone,
    /// which is fatal for this connection.
    pub fn connect(
        local: Preamble,
        peer: SiloAddress,
        config: ConnectionConfig,
        inbound: InboundSender,
    ) -> Connection {
        let (tx, rx) = mpsc::channel(config.outbound_queue);
        let closed = Arc::new(AtomicBool::new(false));
        let task = tokio::spawn(run_outbound(
            local,
            peer,
            config,
            rx,
            inbound,
            closed.clone(),
        ));
        Connection {
            peer: NodeIdentity::Silo(peer),
            outbound: tx,
            closed,
            task,
        }
    }

    /// Wrap an accepted stream whose preamble has already been validated.
    pub fn from_accepted(
        stream: TcpStream,
        peer: NodeIdentity,
        config: ConnectionConfig,
        inbound: InboundSender,
    ) -> Connection {
        let (tx, rx) = mpsc::channel(config.outbound_queue);
        let closed = Arc::new(AtomicBool::new(false));
        let task = tokio::spawn(run_accepted(
            stream,
            peer.clone(),
            rx,
            inbound,
            closed.clone(),
        ));
        Connection {
            peer,
            outbound: tx,
            closed,
            task,
        }
    }

    /// The remote node this connection talks to.
    pub fn peer(&self) -> &NodeIdentity {
        &self.peer
    }

    /// Whether the link has terminally closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Queue a message for sending.
    ///
    /// # Errors
    ///
    /// `ConnectionClosed` when the link is gone, `QueueFull` when the
    /// outbound queue is at capacity.
    pub fn try_send(&self, msg: Message) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::ConnectionClosed {
                peer: self.peer.to_string(),
            });
        }
        self.outbound.try_send(msg).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TransportError::QueueFull {
                peer: self.peer.to_string(),
            },
            mpsc::error::TrySendError::Closed(_) => TransportError::ConnectionClosed {
                peer: self.peer.to_string(),
            },
        })
    }

    /// Tear the link down.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.task.abort();
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

/// Outbound connection driver: connect, handshake, pump, reconnect.
async fn run_outbound(
    local: Preamble,
    peer: SiloAddress,
    config: ConnectionConfig,
    mut outbound: mpsc::Receiver<Message>,
    inbound: InboundSender,
    closed: Arc<AtomicBool>,
) {
    let mut backoff = config.initial_reconnect_delay;
    let mut failures: u32 = 0;
    // Messages pulled from the queue but not yet written; re-sent first
    // after a reconnect.
    let mut unsent: VecDeque<Message> = VecDeque::new();

    loop {
        let stream = match tokio::time::timeout(
            config.connect_timeout,
            TcpStream::connect((peer.endpoint.ip, peer.endpoint.port)),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                debug!(%peer, error = %e, "connect failed");
                failures += 1;
                if config
                    .max_connect_failures
                    .is_some_and(|max| failures >= max)
                {
                    warn!(%peer, failures, "giving up on peer");
                    break;
                }
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(config.max_reconnect_delay);
                continue;
            }
            Err(_) => {
                debug!(%peer, "connect timed out");
                failures += 1;
                if config
                    .max_connect_failures
                    .is_some_and(|max| failures >= max)
                {
                    break;
                }
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(config.max_reconnect_delay);
                continue;
            }
        };

        let mut stream = stream;
        let handshake = async {
            write_preamble(&mut stream, &local).await?;
            read_preamble(&mut stream).await
        };
        let remote = match tokio::time::timeout(config.handshake_timeout, handshake).await {
            Ok(Ok(remote)) => remote,
            Ok(Err(e)) => {
                debug!(%peer, error = %e, "handshake failed");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(config.max_reconnect_delay);
                continue;
            }
            Err(_) => {
                debug!(%peer, "handshake timed out");
                continue;
            }
        };

        if let Err(e) = remote.validate(&local.cluster_id) {
            // Wrong cluster or protocol: never retry against this peer.
            error!(%peer, error = %e, "fatal preamble mismatch, closing connection");
            break;
        }
        match remote.node.silo() {
            Some(announced) if announced == peer => {}
            other => {
                // The endpoint answered with a different incarnation (or a
                // client preamble): the silo we were asked to reach is gone.
                error!(%peer, ?other, "peer identity mismatch, closing connection");
                break;
            }
        }

        debug!(%peer, "connection established");
        failures = 0;
        backoff = config.initial_reconnect_delay;

        match pump(
            &mut stream,
            &remote.node,
            &mut outbound,
            &mut unsent,
            &inbound,
        )
        .await
        {
            PumpEnd::QueueClosed => break,
            PumpEnd::InboundClosed => break,
            PumpEnd::SocketError(e) => {
                debug!(%peer, error = %e, "connection lost, reconnecting");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(config.max_reconnect_delay);
            }
        }
    }

    closed.store(true, Ordering::Release);
}

/// Accepted connection driver: pump until the socket drops.
async fn run_accepted(
    mut stream: TcpStream,
    peer: NodeIdentity,
    mut outbound: mpsc::Receiver<Message>,
    inbound: InboundSender,
    closed: Arc<AtomicBool>,
) {
    let mut unsent = VecDeque::new();
    match pump(&mut stream, &peer, &mut outbound, &mut unsent, &inbound).await {
        PumpEnd::SocketError(e) => debug!(%peer, error = %e, "accepted connection closed"),
        PumpEnd::QueueClosed | PumpEnd::InboundClosed => {}
    }
    closed.store(true, Ordering::Release);
}

enum PumpEnd {
    /// All senders dropped; the connection is being shut down.
    QueueClosed,
    /// The inbound consumer went away; the node is shutting down.
    InboundClosed,
    /// Socket-level failure; outbound connections reconnect.
    SocketError(std::io::Error),
}

/// Bidirectional frame pump over one live socket.
async fn pump(
    stream: &mut TcpStream,
    peer: &NodeIdentity,
    outbound: &mut mpsc::Receiver<Message>,
    unsent: &mut VecDeque<Message>,
    inbound: &InboundSender,
) -> PumpEnd {
    let (mut read_half, mut write_half) = stream.split();
    let mut read_buf = BytesMut::with_capacity(16 * 1024);

    // Flush anything left over from before a reconnect. Expired messages
    // are dropped here rather than sent late; the sender's timeout path
    // owns surfacing the failure.
    while let Some(msg) = unsent.front() {
        if msg.is_expired(granary_core::epoch_ms()) {
            debug!(%peer, "dropping expired message at outbound dequeue");
            unsent.pop_front();
            continue;
        }
        let frame = match encode_message(msg) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(%peer, error = %e, "dropping unencodable message");
                unsent.pop_front();
                continue;
            }
        };
        if let Err(e) = write_half.write_all(&frame).await {
            return PumpEnd::SocketError(e);
        }
        unsent.pop_front();
    }

    loop {
        tokio::select! {
            queued = outbound.recv() => {
                let Some(msg) = queued else {
                    return PumpEnd::QueueClosed;
                };
                if msg.is_expired(granary_core::epoch_ms()) {
                    debug!(%peer, "dropping expired message at outbound dequeue");
                    continue;
                }
                let frame = match encode_message(&msg) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!(%peer, error = %e, "dropping unencodable message");
                        continue;
                    }
                };
                if let Err(e) = write_half.write_all(&frame).await {
                    // Keep the message for the next incarnation of the link.
                    unsent.push_back(msg);
                    return PumpEnd::SocketError(e);
                }
            }
            read = read_half.read_buf(&mut read_buf) => {
                match read {
                    Ok(0) => {
                        return PumpEnd::SocketError(std::io::Error::new(
                            std::io::ErrorKind::UnexpectedEof,
                            "peer closed",
                        ));
                    }
                    Ok(_) => {
                        loop {
                            match try_decode_frame(&read_buf) {
                                Ok(Some((msg, consumed))) => {
                                    let _ = read_buf.split_to(consumed);
                                    if inbound.send((peer.clone(), msg)).await.is_err() {
                                        return PumpEnd::InboundClosed;
                                    }
                                }
                                Ok(None) => break,
                                Err(e) => {
                                    warn!(%peer, error = %e, "malformed frame, dropping connection");
                                    return PumpEnd::SocketError(std::io::Error::other(e));
                                }
                            }
                        }
                    }
                    Err(e) => return PumpEnd::SocketError(e),
                }
            }
        }
    }
}
