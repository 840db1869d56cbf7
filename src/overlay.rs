//! # Overlay Node
//!
//! Single-threaded reactor that owns a node's identity, its [`FriendTable`]
//! and its [`Authorizator`], and runs the three maintenance protocols:
//!
//! | Protocol | Trigger | Effect |
//! |----------|---------|--------|
//! | Bootstrap search | start, convergence walk, ping timer while friendless | Learn peers nearest our identity |
//! | Exchange | exchange timer | Pull a friend's nearest friends |
//! | Ping / Pong | ping timer | Refresh liveness, evict dead friends |
//!
//! ## Execution Model
//!
//! Every method takes `&mut self` and runs to completion. The caller (the
//! async [`Node`](crate::Node) actor or the [`Simulation`](crate::Simulation))
//! serializes inbound packets and timer ticks, so at most one mutation is in
//! flight per node. Outbound packets go through the [`Transport`] seam and
//! never block.
//!
//! ## Packet Handling
//!
//! Inbound packets pass through the authorizator first. Only packets from
//! authorized addresses reach the protocol handlers below.
//!
//! | Packet | Handler |
//! |--------|---------|
//! | `search` | Reply up to K authorized friends nearest the requester plus ourselves; search back if friendless |
//! | `search_response` | Merge offered peers; walk to the new closest friend if it changed |
//! | `exchange` | Reply up to `max_friends` authorized friends nearest the requester; search back if friendless |
//! | `exchange_response` | Merge offered peers |
//! | `ping` | Refresh or add the requester; reply `pong`; search back if friendless |
//! | `pong` | Refresh the requester if known |
//!
//! ## Capacity
//!
//! After every insert, once the table exceeds `eviction_ceiling_pct` of
//! `max_friends`, the farthest `eviction_batch_pct` of `max_friends` entries
//! are removed together with their authorization state.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{ensure, Result};
use tracing::{debug, info, trace, warn};

use crate::auth::{AuthAction, Authorizator};
use crate::friends::{Friend, FriendTable, Ranked};
use crate::identity::{Identity, Keypair};
use crate::messages::{is_valid_address, Packet, PeerEntry, MAX_PEERS_PER_PACKET};
use crate::protocols::{Clock, Timestamp, Transport};

// ============================================================================
// Configuration
// ============================================================================

/// Default number of peers returned per search (K).
pub const DEFAULT_FRIENDS_PER_REQUEST: usize = 10;

/// Default nominal friend table capacity.
pub const DEFAULT_MAX_FRIENDS: usize = 300;

/// Default interval after which a friend is eligible for another exchange.
pub const DEFAULT_EXCHANGE_INTERVAL: Duration = Duration::from_secs(16_000);

/// Default liveness probe interval.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(15);

/// Default silence after which a friend is considered dead.
pub const DEFAULT_FRIENDS_TIMEOUT: Duration = Duration::from_secs(120);

/// Default random part of a handshake nonce, in bytes.
pub const DEFAULT_NONCE_LEN: usize = 128;

/// Default delay before a freshly added friend becomes exchange-eligible.
pub const DEFAULT_EXCHANGE_JITTER: Duration = Duration::from_secs(15);

/// Default cap on packets deferred per pending handshake.
pub const DEFAULT_MAX_QUEUED_PACKETS: usize = 64;

/// Default cap on tracked handshake statuses.
pub const DEFAULT_MAX_HANDSHAKES: usize = 4096;

/// Default age after which an incomplete handshake is dropped.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(60);

/// Default hop limit for one bootstrap search walk.
pub const DEFAULT_MAX_SEARCH_HOPS: usize = 32;

/// Default number of cached pairwise distances.
pub const DEFAULT_DISTANCE_CACHE_CAPACITY: usize = 4096;

/// Trim starts once the table exceeds this percentage of `max_friends`.
pub const DEFAULT_EVICTION_CEILING_PCT: usize = 130;

/// Percentage of `max_friends` removed per trim.
pub const DEFAULT_EVICTION_BATCH_PCT: usize = 15;

#[derive(Clone, Debug)]
pub struct OverlayConfig {
    /// Peers returned per search response (K).
    pub friends_per_request: usize,
    /// Nominal friend table capacity.
    pub max_friends: usize,
    /// A friend is exchanged with at most once per this interval.
    pub exchange_interval: Duration,
    pub ping_interval: Duration,
    /// Silence after which a friend is evicted as dead.
    pub friends_timeout: Duration,
    /// Random bytes appended to the address in a handshake nonce.
    pub nonce_len: usize,
    pub exchange_jitter: Duration,

    // Hardening
    pub max_queued_packets: usize,
    pub max_handshakes: usize,
    pub handshake_timeout: Duration,
    pub max_search_hops: usize,
    pub distance_cache_capacity: usize,
    pub eviction_ceiling_pct: usize,
    pub eviction_batch_pct: usize,

    /// Directory for the persisted friend table. `None` keeps it in memory.
    pub state_dir: Option<PathBuf>,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            friends_per_request: DEFAULT_FRIENDS_PER_REQUEST,
            max_friends: DEFAULT_MAX_FRIENDS,
            exchange_interval: DEFAULT_EXCHANGE_INTERVAL,
            ping_interval: DEFAULT_PING_INTERVAL,
            friends_timeout: DEFAULT_FRIENDS_TIMEOUT,
            nonce_len: DEFAULT_NONCE_LEN,
            exchange_jitter: DEFAULT_EXCHANGE_JITTER,

            max_queued_packets: DEFAULT_MAX_QUEUED_PACKETS,
            max_handshakes: DEFAULT_MAX_HANDSHAKES,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            max_search_hops: DEFAULT_MAX_SEARCH_HOPS,
            distance_cache_capacity: DEFAULT_DISTANCE_CACHE_CAPACITY,
            eviction_ceiling_pct: DEFAULT_EVICTION_CEILING_PCT,
            eviction_batch_pct: DEFAULT_EVICTION_BATCH_PCT,

            state_dir: None,
        }
    }
}

impl OverlayConfig {
    /// Period of the exchange scheduler: one friend per tick, whole table
    /// once per `exchange_interval`.
    pub fn exchange_period(&self) -> Duration {
        self.exchange_interval / self.max_friends.max(1) as u32
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.max_friends > 0, "max_friends must be positive");
        ensure!(self.friends_per_request > 0, "friends_per_request must be positive");
        ensure!(
            self.eviction_ceiling_pct >= 100,
            "eviction_ceiling_pct must be at least 100"
        );
        ensure!(
            self.eviction_batch_pct > 0 && self.eviction_batch_pct <= self.eviction_ceiling_pct,
            "eviction_batch_pct must be in 1..=eviction_ceiling_pct"
        );
        ensure!(
            self.max_friends * self.eviction_batch_pct / 100 > 0,
            "eviction batch rounds to zero; raise max_friends or eviction_batch_pct"
        );
        ensure!(!self.ping_interval.is_zero(), "ping_interval must be positive");
        ensure!(
            self.friends_timeout > self.ping_interval,
            "friends_timeout must exceed ping_interval"
        );
        ensure!(!self.exchange_period().is_zero(), "exchange period must be positive");
        ensure!(self.nonce_len > 0, "nonce_len must be positive");
        Ok(())
    }
}

// ============================================================================
// Overlay Node
// ============================================================================

pub struct OverlayNode {
    config: OverlayConfig,
    identity: Identity,
    address: String,
    friends: FriendTable,
    auth: Authorizator,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    search_hops: usize,
    /// Retried from the ping timer while the table is empty.
    bootstrap: Option<String>,
}

impl OverlayNode {
    /// Build a node and load its persisted friend table, if any.
    pub fn new(
        config: OverlayConfig,
        keypair: Keypair,
        address: impl Into<String>,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        let address = address.into();
        ensure!(is_valid_address(&address), "invalid node address {:?}", address);

        let identity = keypair.identity();
        let state_file = config
            .state_dir
            .as_ref()
            .map(|dir| dir.join(format!("{}.friends", identity.to_hex())));
        let mut friends = FriendTable::new(&config, state_file);
        let loaded = friends.load(clock.now())?;
        let auth = Authorizator::new(keypair, address.clone(), &config);

        debug!(identity = %identity, address = %address, loaded, "overlay node created");
        Ok(Self {
            config,
            identity,
            address,
            friends,
            auth,
            transport,
            clock,
            search_hops: 0,
            bootstrap: None,
        })
    }

    /// Enter the network through `bootstrap` if we know nobody yet.
    pub fn start(&mut self, bootstrap: Option<&str>) {
        match bootstrap {
            Some(addr) if self.friends.is_empty() => {
                info!(bootstrap = %addr, "bootstrapping overlay");
                self.bootstrap = Some(addr.to_string());
                self.search_hops = 0;
                self.send_search(addr);
            }
            Some(_) => debug!(friends = self.friends.len(), "friend table loaded, skipping bootstrap"),
            None => debug!("starting without bootstrap"),
        }
    }

    pub fn identity(&self) -> Identity {
        self.identity
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn config(&self) -> &OverlayConfig {
        &self.config
    }

    pub fn friend_count(&self) -> usize {
        self.friends.len()
    }

    /// The table holds at least `max_friends` entries.
    pub fn has_enough_friends(&self) -> bool {
        self.friends.have_enough()
    }

    pub fn has_friend(&self, identity: &Identity) -> bool {
        self.friends.has(identity)
    }

    pub fn friends(&self) -> Vec<Friend> {
        self.friends.snapshot()
    }

    pub fn friend_addresses(&self) -> Vec<String> {
        self.friends.addresses()
    }

    pub fn is_authorized(&self, identity: &Identity) -> bool {
        self.auth.is_authorized(identity)
    }

    pub fn authorizator(&self) -> &Authorizator {
        &self.auth
    }

    // ========================================================================
    // Inbound
    // ========================================================================

    /// Process one packet received from `from`.
    pub fn handle_packet(&mut self, from: &str, packet: Packet) {
        trace!(peer = %from, kind = %packet.kind(), "packet received");
        let now = self.clock.now();
        for action in self.auth.on_packet(from, packet, now) {
            match action {
                AuthAction::Reply(reply) => self.send(from, &reply),
                AuthAction::Deliver { identity, packet } => self.route(from, identity, packet),
            }
        }
        self.persist();
    }

    fn route(&mut self, from: &str, requester: Identity, packet: Packet) {
        match packet {
            Packet::Search => self.on_search(from, &requester),
            Packet::SearchResponse { closest_friends } => self.on_search_response(closest_friends),
            Packet::Exchange => self.on_exchange(from, &requester),
            Packet::ExchangeResponse { closest_friends } => self.merge(closest_friends),
            Packet::Ping => self.on_ping(from, requester),
            Packet::Pong => {
                if self.friends.has(&requester) {
                    self.friends.mark_ping_response(&requester, self.clock.now());
                }
            }
            other => trace!(peer = %from, kind = %other.kind(), "ignoring replayed handshake packet"),
        }
    }

    fn on_search(&mut self, from: &str, requester: &Identity) {
        let auth = &self.auth;
        let mut closest = self.friends.find_closest(
            requester,
            self.config.friends_per_request,
            false,
            |id| auth.is_authorized(id),
        );
        closest.push(Ranked {
            distance: self.identity.distance(requester),
            identity: self.identity,
            address: self.address.clone(),
        });
        closest.sort_by(|a, b| (a.distance, a.identity).cmp(&(b.distance, b.identity)));
        closest.truncate(self.config.friends_per_request);

        self.send(from, &Packet::SearchResponse { closest_friends: to_entries(closest) });
        if self.friends.is_empty() {
            self.send_search(from);
        }
    }

    fn on_search_response(&mut self, offered: Vec<PeerEntry>) {
        let previous = self.friends.closest(&self.identity).map(|r| r.identity);
        self.merge(offered);
        let Some(next) = self.friends.closest(&self.identity) else {
            return;
        };

        if previous == Some(next.identity) {
            if self.search_hops > 0 {
                debug!(hops = self.search_hops, closest = %next.identity, "search walk converged");
            }
            self.search_hops = 0;
            return;
        }
        if self.search_hops >= self.config.max_search_hops {
            warn!(hops = self.search_hops, "search walk hit hop limit, stopping");
            self.search_hops = 0;
            return;
        }
        self.search_hops += 1;
        trace!(hop = self.search_hops, next = %next.address, "search walk continues");
        self.send_search(&next.address);
    }

    fn on_exchange(&mut self, from: &str, requester: &Identity) {
        let auth = &self.auth;
        let count = self.config.max_friends.min(MAX_PEERS_PER_PACKET);
        let closest = self
            .friends
            .find_closest(requester, count, false, |id| auth.is_authorized(id));

        self.send(from, &Packet::ExchangeResponse { closest_friends: to_entries(closest) });
        if self.friends.is_empty() {
            self.send_search(from);
        }
    }

    fn on_ping(&mut self, from: &str, requester: Identity) {
        let now = self.clock.now();
        if self.friends.has(&requester) {
            self.friends.mark_ping_response(&requester, now);
        } else {
            self.add_friend(requester, from, now);
        }
        self.send(from, &Packet::Pong);
        if self.friends.is_empty() {
            self.send_search(from);
        }
    }

    /// Insert every offered peer except ourselves, trimming after each insert.
    fn merge(&mut self, offered: Vec<PeerEntry>) {
        let now = self.clock.now();
        for entry in offered {
            if entry.identity == self.identity {
                continue;
            }
            if !entry.identity.is_valid() || !is_valid_address(&entry.address) {
                debug!(address = %entry.address, "skipping malformed peer entry");
                continue;
            }
            self.add_friend(entry.identity, &entry.address, now);
        }
    }

    fn add_friend(&mut self, identity: Identity, address: &str, now: Timestamp) {
        if self.friends.add(identity, address, now) {
            debug!(friend = %identity, address = %address, total = self.friends.len(), "friend added");
        }
        for evicted in self.friends.evict_over_capacity(&self.identity) {
            self.auth.remove(&evicted.address);
        }
    }

    // ========================================================================
    // Schedulers
    // ========================================================================

    /// Start one exchange with the nearest friend that is due.
    pub fn exchange_tick(&mut self) {
        let now = self.clock.now();
        let interval = self.config.exchange_interval.as_secs_f64();
        let candidates = self
            .friends
            .find_closest(&self.identity, self.friends.len(), false, |_| true);

        let due = candidates.into_iter().find(|r| {
            self.friends
                .last_exchange(&r.identity)
                .is_some_and(|last| now - last > interval)
        });
        if let Some(friend) = due {
            self.friends.mark_exchanged(&friend.identity, now);
            trace!(peer = %friend.address, "starting exchange");
            self.send(&friend.address, &Packet::Exchange);
        }
        self.persist();
    }

    /// Probe quiet friends and evict those silent past the timeout. A node
    /// left without friends searches its bootstrap peer again.
    pub fn ping_tick(&mut self) {
        let now = self.clock.now();
        let ping_interval = self.config.ping_interval.as_secs_f64();
        let timeout = self.config.friends_timeout.as_secs_f64();

        for friend in self.friends.snapshot() {
            let silent = now - friend.last_ping_response;
            if silent <= ping_interval {
                continue;
            }
            if silent > timeout {
                info!(friend = %friend.identity, address = %friend.address, silent, "friend timed out");
                self.auth.remove(&friend.address);
                self.friends.remove(&friend.identity);
            } else {
                self.send(&friend.address, &Packet::Ping);
            }
        }
        self.auth.expire_pending(now);

        if self.friends.is_empty() {
            if let Some(addr) = self.bootstrap.clone() {
                debug!(bootstrap = %addr, "no friends yet, retrying bootstrap search");
                self.search_hops = 0;
                self.send_search(&addr);
            }
        }
        self.persist();
    }

    // ========================================================================
    // Outbound
    // ========================================================================

    fn send_search(&self, to: &str) {
        self.send(to, &Packet::Search);
    }

    fn send(&self, to: &str, packet: &Packet) {
        if let Err(e) = self.transport.send(&self.address, to, packet) {
            debug!(peer = %to, kind = %packet.kind(), error = %e, "send failed");
        }
    }

    fn persist(&mut self) {
        if let Err(e) = self.friends.persist() {
            warn!(error = ?e, "failed to persist friend table");
        }
    }
}

impl std::fmt::Debug for OverlayNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OverlayNode")
            .field("identity", &self.identity)
            .field("address", &self.address)
            .field("friends", &self.friends.len())
            .field("auth", &self.auth)
            .finish()
    }
}

fn to_entries(ranked: Vec<Ranked>) -> Vec<PeerEntry> {
    ranked
        .into_iter()
        .map(|r| PeerEntry::new(r.identity, r.address))
        .collect()
}
