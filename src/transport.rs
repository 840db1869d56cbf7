//! # UDP Transport
//!
//! Datagram transport for overlay packets. One packet per datagram, framed
//! by the wire codec in [`messages`](crate::messages).
//!
//! ## Delivery Contract
//!
//! - **Send**: [`Transport::send`] encodes and queues the datagram without
//!   blocking; a sender task writes it with `send_to(..).await`, which waits
//!   for socket readiness. A full queue drops the packet, which the overlay
//!   tolerates like any other loss
//! - **Receive**: a background task decodes datagrams and forwards them as
//!   [`Inbound`] values; undecodable datagrams are dropped at trace level
//!
//! ## Addressing
//!
//! Overlay addresses are the `ip:port` string form of socket addresses. The
//! handshake binds nonces to these strings, so a node must be reachable at
//! exactly the address it binds (not a wildcard).

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, bail, ensure, Context, Result};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::messages::{decode, encode, is_valid_address, Packet, MAX_PACKET_SIZE};
use crate::protocols::Transport;

/// Datagrams queued for the sender task before `send` starts dropping.
const OUTBOUND_QUEUE_CAPACITY: usize = 1024;

/// A decoded packet and the address it came from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Inbound {
    pub from: String,
    pub packet: Packet,
}

#[derive(Default)]
struct SendStats {
    sent: AtomicU64,
    failures: AtomicU64,
}

pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    outbound_tx: mpsc::Sender<(Vec<u8>, SocketAddr)>,
    stats: Arc<SendStats>,
}

impl UdpTransport {
    /// Bind the socket and spawn its sender task. The task exits once the
    /// transport is dropped.
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind(addr)
            .await
            .with_context(|| format!("failed to bind UDP socket on {}", addr))?;
        let local_addr = socket.local_addr().context("failed to read local address")?;
        let socket = Arc::new(socket);
        let stats = Arc::new(SendStats::default());

        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        tokio::spawn(drain_outbound(socket.clone(), outbound_rx, stats.clone()));

        Ok(Self {
            socket,
            local_addr,
            outbound_tx,
            stats,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Datagrams written to the socket.
    pub fn sent(&self) -> u64 {
        self.stats.sent.load(Ordering::Relaxed)
    }

    /// Datagrams dropped on a full queue or a socket error.
    pub fn send_failures(&self) -> u64 {
        self.stats.failures.load(Ordering::Relaxed)
    }

    /// Spawn the receive loop. It stops once `tx` is closed or the socket
    /// fails for good.
    pub fn spawn_receiver(&self, tx: mpsc::Sender<Inbound>) -> JoinHandle<()> {
        let socket = self.socket.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_PACKET_SIZE];
            loop {
                let (len, src) = match socket.recv_from(&mut buf).await {
                    Ok(received) => received,
                    Err(e) if is_transient(&e) => {
                        // ICMP port-unreachable surfaces here on some platforms.
                        debug!(error = %e, "UDP receive error");
                        continue;
                    }
                    Err(e) => {
                        warn!(error = %e, "UDP receive failed, stopping receive loop");
                        break;
                    }
                };
                let packet = match decode(&buf[..len]) {
                    Ok(packet) => packet,
                    Err(e) => {
                        trace!(from = %src, len, error = %e, "dropping undecodable datagram");
                        continue;
                    }
                };
                let inbound = Inbound {
                    from: src.to_string(),
                    packet,
                };
                if tx.send(inbound).await.is_err() {
                    break;
                }
            }
        })
    }
}

async fn drain_outbound(
    socket: Arc<UdpSocket>,
    mut rx: mpsc::Receiver<(Vec<u8>, SocketAddr)>,
    stats: Arc<SendStats>,
) {
    while let Some((bytes, dest)) = rx.recv().await {
        match socket.send_to(&bytes, dest).await {
            Ok(_) => {
                stats.sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                stats.failures.fetch_add(1, Ordering::Relaxed);
                debug!(peer = %dest, error = %e, "UDP send failed");
            }
        }
    }
}

/// Errors a datagram socket reports for one bad exchange rather than for
/// the socket itself.
fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
    )
}

impl Transport for UdpTransport {
    fn send(&self, from: &str, to: &str, packet: &Packet) -> Result<()> {
        ensure!(is_valid_address(from), "invalid source address {:?}", from);
        ensure!(is_valid_address(to), "invalid destination address {:?}", to);
        let dest: SocketAddr = to
            .parse()
            .with_context(|| format!("destination {:?} is not a socket address", to))?;
        let bytes = encode(packet).map_err(|e| anyhow!("failed to encode {}: {}", packet.kind(), e))?;

        match self.outbound_tx.try_send((bytes, dest)) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.stats.failures.fetch_add(1, Ordering::Relaxed);
                bail!("outbound queue full, dropping {} to {}", packet.kind(), dest)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                bail!("sender task stopped, dropping {} to {}", packet.kind(), dest)
            }
        }
    }
}

impl std::fmt::Debug for UdpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpTransport")
            .field("local_addr", &self.local_addr)
            .field("sent", &self.sent())
            .field("send_failures", &self.send_failures())
            .finish()
    }
}
