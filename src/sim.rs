//! # Deterministic Simulation
//!
//! Runs many [`OverlayNode`]s in one process against a virtual clock and an
//! in-memory network, so hours of protocol time execute in milliseconds and
//! every run is reproducible.
//!
//! ## Semantics
//!
//! - Timers fire in time order; ties fire in registration order
//! - A timer is rescheduled one period after it actually fired
//! - After every timer the network is drained: each queued datagram is
//!   encoded and decoded through the real wire codec, then handed to the
//!   destination node, which may enqueue more
//! - A disconnected address neither sends nor receives, and its timers are
//!   suspended
//!
//! ```ignore
//! let mut sim = Simulation::new();
//! sim.add_node("login1", "password1", "addr1", None)?;
//! sim.add_node("login2", "password2", "addr2", Some("addr1"))?;
//! sim.advance(16_000.0);
//! assert_eq!(sim.node(0).friend_count(), 1);
//! ```

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, bail, ensure, Result};
use tracing::{debug, trace, warn};

use crate::identity::Keypair;
use crate::messages::{decode, encode, is_valid_address, Packet};
use crate::overlay::{OverlayConfig, OverlayNode};
use crate::protocols::{Clock, Timestamp, Transport};

/// Initial virtual time.
pub const SIM_START_TIME: Timestamp = 12_345_678.0;

/// Upper bound on datagrams delivered by one drain, to stop runaway loops.
const MAX_DELIVERIES_PER_PUMP: usize = 1_000_000;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ============================================================================
// Clock
// ============================================================================

#[derive(Debug)]
pub struct SimClock {
    now: Mutex<Timestamp>,
}

impl SimClock {
    pub fn new(start: Timestamp) -> Self {
        Self { now: Mutex::new(start) }
    }

    pub fn set(&self, t: Timestamp) {
        *lock(&self.now) = t;
    }
}

impl Clock for SimClock {
    fn now(&self) -> Timestamp {
        *lock(&self.now)
    }
}

// ============================================================================
// Network
// ============================================================================

struct Datagram {
    from: String,
    to: String,
    bytes: Vec<u8>,
}

/// In-memory, in-order, lossless transport with per-address partitions.
#[derive(Default)]
pub struct SimNetwork {
    queue: Mutex<VecDeque<Datagram>>,
    offline: Mutex<HashSet<String>>,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl SimNetwork {
    pub fn disconnect(&self, address: &str) {
        lock(&self.offline).insert(address.to_string());
    }

    pub fn reconnect(&self, address: &str) {
        lock(&self.offline).remove(address);
    }

    pub fn is_online(&self, address: &str) -> bool {
        !lock(&self.offline).contains(address)
    }

    pub fn pending(&self) -> usize {
        lock(&self.queue).len()
    }

    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn pop(&self) -> Option<Datagram> {
        lock(&self.queue).pop_front()
    }
}

impl Transport for SimNetwork {
    fn send(&self, from: &str, to: &str, packet: &Packet) -> Result<()> {
        ensure!(is_valid_address(from), "invalid source address {:?}", from);
        ensure!(is_valid_address(to), "invalid destination address {:?}", to);
        if !self.is_online(from) || !self.is_online(to) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }
        let bytes = encode(packet).map_err(|e| anyhow!("encode {}: {}", packet.kind(), e))?;
        lock(&self.queue).push_back(Datagram {
            from: from.to_string(),
            to: to.to_string(),
            bytes,
        });
        Ok(())
    }
}

impl std::fmt::Debug for SimNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimNetwork")
            .field("pending", &self.pending())
            .field("delivered", &self.delivered())
            .field("dropped", &self.dropped())
            .finish()
    }
}

// ============================================================================
// Simulation
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TimerKind {
    Exchange,
    Ping,
}

#[derive(Debug)]
struct Timer {
    node: usize,
    kind: TimerKind,
    period: f64,
    next: Timestamp,
    seq: u64,
}

#[derive(Debug)]
pub struct Simulation {
    clock: Arc<SimClock>,
    network: Arc<SimNetwork>,
    nodes: Vec<OverlayNode>,
    by_address: HashMap<String, usize>,
    timers: Vec<Timer>,
    next_seq: u64,
}

impl Default for Simulation {
    fn default() -> Self {
        Self::new()
    }
}

impl Simulation {
    pub fn new() -> Self {
        Self {
            clock: Arc::new(SimClock::new(SIM_START_TIME)),
            network: Arc::new(SimNetwork::default()),
            nodes: Vec::new(),
            by_address: HashMap::new(),
            timers: Vec::new(),
            next_seq: 0,
        }
    }

    /// Add a node with default configuration. Returns its index.
    pub fn add_node(
        &mut self,
        login: &str,
        password: &str,
        address: &str,
        bootstrap: Option<&str>,
    ) -> Result<usize> {
        self.add_node_with_config(
            OverlayConfig::default(),
            Keypair::from_credentials(login, password),
            address,
            bootstrap,
        )
    }

    pub fn add_node_with_config(
        &mut self,
        config: OverlayConfig,
        keypair: Keypair,
        address: &str,
        bootstrap: Option<&str>,
    ) -> Result<usize> {
        if self.by_address.contains_key(address) {
            bail!("address {} already in use", address);
        }
        let exchange_period = config.exchange_period().as_secs_f64();
        let ping_period = config.ping_interval.as_secs_f64();

        let mut node = OverlayNode::new(
            config,
            keypair,
            address,
            self.network.clone(),
            self.clock.clone(),
        )?;
        node.start(bootstrap);

        let index = self.nodes.len();
        self.nodes.push(node);
        self.by_address.insert(address.to_string(), index);
        self.schedule(index, TimerKind::Exchange, exchange_period);
        self.schedule(index, TimerKind::Ping, ping_period);
        debug!(index, address, "simulated node added");

        self.pump();
        Ok(index)
    }

    fn schedule(&mut self, node: usize, kind: TimerKind, period: f64) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.timers.push(Timer {
            node,
            kind,
            period,
            next: self.clock.now() + period,
            seq,
        });
    }

    /// Run the simulation forward by `secs` of virtual time.
    pub fn advance(&mut self, secs: f64) {
        let target = self.clock.now() + secs;
        while let Some(i) = self.next_due(target) {
            let (node, kind, fire_at) = {
                let t = &self.timers[i];
                (t.node, t.kind, t.next)
            };
            self.clock.set(fire_at);

            if self.network.is_online(self.nodes[node].address()) {
                match kind {
                    TimerKind::Exchange => self.nodes[node].exchange_tick(),
                    TimerKind::Ping => self.nodes[node].ping_tick(),
                }
            }
            let t = &mut self.timers[i];
            t.next = fire_at + t.period;
            self.pump();
        }
        self.clock.set(target);
        self.pump();
    }

    fn next_due(&self, target: Timestamp) -> Option<usize> {
        self.timers
            .iter()
            .enumerate()
            .filter(|(_, t)| t.next <= target)
            .min_by(|(_, a), (_, b)| a.next.total_cmp(&b.next).then(a.seq.cmp(&b.seq)))
            .map(|(i, _)| i)
    }

    /// Deliver queued datagrams until the network is quiet.
    pub fn pump(&mut self) {
        let mut deliveries = 0;
        while let Some(datagram) = self.network.pop() {
            deliveries += 1;
            if deliveries > MAX_DELIVERIES_PER_PUMP {
                warn!("simulation delivery limit reached, dropping remaining datagrams");
                while self.network.pop().is_some() {}
                return;
            }

            let Some(&index) = self.by_address.get(&datagram.to) else {
                trace!(to = %datagram.to, "no node at destination");
                self.network.dropped.fetch_add(1, Ordering::Relaxed);
                continue;
            };
            if !self.network.is_online(&datagram.to) {
                self.network.dropped.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            match decode(&datagram.bytes) {
                Ok(packet) => {
                    self.network.delivered.fetch_add(1, Ordering::Relaxed);
                    self.nodes[index].handle_packet(&datagram.from, packet);
                }
                Err(e) => {
                    debug!(from = %datagram.from, error = %e, "undecodable datagram");
                    self.network.dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    /// Partition `address` from the network and suspend its timers.
    pub fn disconnect(&self, address: &str) {
        self.network.disconnect(address);
    }

    pub fn reconnect(&self, address: &str) {
        self.network.reconnect(address);
    }

    pub fn node(&self, index: usize) -> &OverlayNode {
        &self.nodes[index]
    }

    pub fn node_by_address(&self, address: &str) -> Option<&OverlayNode> {
        self.by_address.get(address).map(|&i| &self.nodes[i])
    }

    pub fn nodes(&self) -> &[OverlayNode] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    pub fn network(&self) -> &SimNetwork {
        &self.network
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_encodes_through_codec() {
        let net = SimNetwork::default();
        net.send("addr1", "addr2", &Packet::Ping).unwrap();
        let datagram = net.pop().unwrap();
        assert_eq!(datagram.from, "addr1");
        assert_eq!(decode(&datagram.bytes).unwrap(), Packet::Ping);
    }

    #[test]
    fn network_rejects_bad_addresses() {
        let net = SimNetwork::default();
        assert!(net.send("", "addr2", &Packet::Ping).is_err());
        assert!(net.send("addr1", &"x".repeat(100), &Packet::Ping).is_err());
    }

    #[test]
    fn offline_addresses_drop_traffic() {
        let net = SimNetwork::default();
        net.disconnect("addr2");
        net.send("addr1", "addr2", &Packet::Ping).unwrap();
        net.send("addr2", "addr1", &Packet::Ping).unwrap();
        assert_eq!(net.pending(), 0);
        assert_eq!(net.dropped(), 2);

        net.reconnect("addr2");
        net.send("addr1", "addr2", &Packet::Ping).unwrap();
        assert_eq!(net.pending(), 1);
    }

    #[test]
    fn clock_starts_at_fixed_time_and_advances() {
        let mut sim = Simulation::new();
        assert_eq!(sim.now(), SIM_START_TIME);
        sim.advance(100.0);
        assert_eq!(sim.now(), SIM_START_TIME + 100.0);
    }

    #[test]
    fn duplicate_address_rejected() {
        let mut sim = Simulation::new();
        sim.add_node("login1", "password1", "addr1", None).unwrap();
        assert!(sim.add_node("login2", "password2", "addr1", None).is_err());
    }

    #[test]
    fn two_nodes_become_mutual_friends() {
        let mut sim = Simulation::new();
        sim.add_node("login1", "password1", "addr1", None).unwrap();
        sim.add_node("login2", "password2", "addr2", Some("addr1")).unwrap();

        assert_eq!(sim.node(0).friend_count(), 1);
        assert_eq!(sim.node(1).friend_count(), 1);
        let id0 = sim.node(0).identity();
        let id1 = sim.node(1).identity();
        assert!(sim.node(0).is_authorized(&id1));
        assert!(sim.node(1).is_authorized(&id0));
        assert!(sim.network().delivered() > 0);
    }

    #[test]
    fn timers_fire_in_order() {
        let mut sim = Simulation::new();
        sim.add_node("login1", "password1", "addr1", None).unwrap();
        sim.add_node("login2", "password2", "addr2", Some("addr1")).unwrap();
        let before = sim.network().delivered();

        // Both nodes ping each other at +30s and exchange shortly after.
        sim.advance(120.0);
        assert!(sim.network().delivered() > before);
        assert_eq!(sim.node(0).friend_count(), 1);
    }
}
