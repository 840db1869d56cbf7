//! # High-Level Node API
//!
//! A [`Node`] runs one [`OverlayNode`] on a UDP socket under tokio.
//!
//! ## Quick Start
//!
//! ```ignore
//! let seed = Node::bind("127.0.0.1:4000", "login1", "password1").await?;
//! let node = Node::bind("127.0.0.1:4001", "login2", "password2").await?;
//! node.bootstrap(&seed.local_addr().to_string()).await?;
//!
//! tokio::time::sleep(Duration::from_secs(5)).await;
//! println!("{} friends", node.friend_count().await?);
//! ```
//!
//! ## Actor Model
//!
//! The overlay state lives in a single actor task. Inbound datagrams, the
//! exchange timer, the ping timer and API commands are multiplexed with
//! `select!`, so handlers never run concurrently. The [`Node`] handle only
//! sends commands over a channel.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::friends::Friend;
use crate::identity::{Identity, Keypair};
use crate::overlay::{OverlayConfig, OverlayNode};
use crate::protocols::SystemClock;
use crate::transport::{Inbound, UdpTransport};

/// Capacity of the command and inbound packet channels.
const CHANNEL_CAPACITY: usize = 1024;

enum Command {
    Bootstrap(String),
    FriendCount(oneshot::Sender<usize>),
    Friends(oneshot::Sender<Vec<Friend>>),
    IsAuthorized(Identity, oneshot::Sender<bool>),
    Quit,
}

pub struct Node {
    cmd_tx: mpsc::Sender<Command>,
    identity: Identity,
    local_addr: SocketAddr,
    receiver: JoinHandle<()>,
}

impl Node {
    /// Bind a node whose identity is derived from `login` and `password`.
    pub async fn bind(addr: &str, login: &str, password: &str) -> Result<Self> {
        Self::bind_with_config(addr, Keypair::from_credentials(login, password), OverlayConfig::default()).await
    }

    pub async fn bind_with_keypair(addr: &str, keypair: Keypair) -> Result<Self> {
        Self::bind_with_config(addr, keypair, OverlayConfig::default()).await
    }

    pub async fn bind_with_config(addr: &str, keypair: Keypair, config: OverlayConfig) -> Result<Self> {
        let addr: SocketAddr = addr.parse().context("invalid socket address")?;
        let transport = UdpTransport::bind(addr).await?;
        let local_addr = transport.local_addr();
        if local_addr.ip().is_unspecified() {
            warn!(
                addr = %local_addr,
                "bound to an unspecified address; peers see a different source address and handshakes will fail"
            );
        }

        let identity = keypair.identity();
        let exchange_period = config.exchange_period();
        let ping_period = config.ping_interval;

        let (inbound_tx, inbound_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let receiver = transport.spawn_receiver(inbound_tx);
        let transport = Arc::new(transport);

        let overlay = match OverlayNode::new(
            config,
            keypair,
            local_addr.to_string(),
            transport,
            Arc::new(SystemClock),
        ) {
            Ok(overlay) => overlay,
            Err(e) => {
                receiver.abort();
                return Err(e);
            }
        };

        let (cmd_tx, cmd_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let actor = NodeActor {
            overlay,
            cmd_rx,
            inbound_rx,
            exchange_period,
            ping_period,
        };
        tokio::spawn(actor.run());

        info!("Node {}/{}", local_addr, identity.to_hex());
        Ok(Self {
            cmd_tx,
            identity,
            local_addr,
            receiver,
        })
    }

    pub fn identity(&self) -> Identity {
        self.identity
    }

    /// The node's identity as a hex-encoded string.
    pub fn identity_hex(&self) -> String {
        self.identity.to_hex()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Enter the overlay through the peer at `addr`. Ignored if the node
    /// already has friends.
    pub async fn bootstrap(&self, addr: &str) -> Result<()> {
        let peer: SocketAddr = addr.parse().context("invalid bootstrap address")?;
        self.send(Command::Bootstrap(peer.to_string())).await
    }

    pub async fn friend_count(&self) -> Result<usize> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::FriendCount(tx)).await?;
        rx.await.map_err(|_| anyhow!("node actor stopped"))
    }

    pub async fn friends(&self) -> Result<Vec<Friend>> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Friends(tx)).await?;
        rx.await.map_err(|_| anyhow!("node actor stopped"))
    }

    pub async fn is_authorized(&self, identity: &Identity) -> Result<bool> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::IsAuthorized(*identity, tx)).await?;
        rx.await.map_err(|_| anyhow!("node actor stopped"))
    }

    /// Stop the actor and the receive loop.
    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(Command::Quit).await;
        self.receiver.abort();
    }

    async fn send(&self, cmd: Command) -> Result<()> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|_| anyhow!("node actor stopped"))
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.receiver.abort();
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("identity", &self.identity)
            .field("local_addr", &self.local_addr)
            .finish()
    }
}

struct NodeActor {
    overlay: OverlayNode,
    cmd_rx: mpsc::Receiver<Command>,
    inbound_rx: mpsc::Receiver<Inbound>,
    exchange_period: std::time::Duration,
    ping_period: std::time::Duration,
}

impl NodeActor {
    async fn run(mut self) {
        let mut exchange = interval_at(Instant::now() + self.exchange_period, self.exchange_period);
        exchange.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut ping = interval_at(Instant::now() + self.ping_period, self.ping_period);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(Command::Quit) | None => break,
                    Some(cmd) => self.handle_command(cmd),
                },
                Some(inbound) = self.inbound_rx.recv() => {
                    self.overlay.handle_packet(&inbound.from, inbound.packet);
                }
                _ = exchange.tick() => self.overlay.exchange_tick(),
                _ = ping.tick() => self.overlay.ping_tick(),
            }
        }
        debug!(address = %self.overlay.address(), "node actor stopped");
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Bootstrap(addr) => self.overlay.start(Some(&addr)),
            Command::FriendCount(reply) => {
                let _ = reply.send(self.overlay.friend_count());
            }
            Command::Friends(reply) => {
                let _ = reply.send(self.overlay.friends());
            }
            Command::IsAuthorized(identity, reply) => {
                let _ = reply.send(self.overlay.is_authorized(&identity));
            }
            Command::Quit => {}
        }
    }
}
