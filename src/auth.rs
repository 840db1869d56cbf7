//! # Authorization State Machine
//!
//! Per-remote-address handshake controller. No routing packet reaches the
//! overlay until the sending address has proven it holds the private key of
//! the identity it claims.
//!
//! ## Handshake
//!
//! ```text
//!  A (initiator of traffic)                B (verifier)
//!  ───────────────────────                 ────────────
//!  any packet            ───────────────▶  status := WAITING_ID, queue packet
//!                        ◀───────────────  request_id
//!  response_id{id_A}     ───────────────▶  status := WAITING_CONFIRM
//!                        ◀───────────────  confirm{seal(id_A, addr_B || random)}
//!  check prefix == addr_B
//!  confirm_confirm{nonce}───────────────▶  nonce matches: AUTHORIZED, replay queue
//! ```
//!
//! `request_id` and `confirm` are answered statelessly: a node responds to
//! them regardless of its own handshake phase with the sender.
//!
//! ## Failure Semantics
//!
//! Integrity failures (nonce not bound to the sender's address, nonce
//! round-trip mismatch, unsealable identity) reset the address's state and
//! are logged as security events. Nothing is reported to the caller; the
//! next packet from that address restarts the handshake.
//!
//! ## Resource Bounds
//!
//! | Resource | Bound | Overflow policy |
//! |----------|-------|-----------------|
//! | Statuses | `max_handshakes` | Least recently used status evicted |
//! | Deferred packets per address | `max_queued_packets` | Oldest packet dropped |
//! | Pending handshake age | `handshake_timeout` | Dropped by [`Authorizator::expire_pending`] |

use std::collections::{HashMap, VecDeque};
use std::num::NonZeroUsize;

use lru::LruCache;
use rand::rngs::OsRng;
use rand::RngCore;
use tracing::{debug, trace, warn};

use crate::crypto::{open, seal};
use crate::identity::{Identity, Keypair};
use crate::messages::Packet;
use crate::overlay::OverlayConfig;
use crate::protocols::Timestamp;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthState {
    Unauthorized,
    WaitingId,
    WaitingConfirm,
    Authorized,
}

/// Handshake progress for one remote address.
#[derive(Debug)]
pub struct AuthStatus {
    state: AuthState,
    rand_seq: Vec<u8>,
    queue: VecDeque<Packet>,
    identity: Option<Identity>,
    created_at: Timestamp,
}

impl AuthStatus {
    fn new(rand_seq: Vec<u8>, created_at: Timestamp) -> Self {
        Self {
            state: AuthState::Unauthorized,
            rand_seq,
            queue: VecDeque::new(),
            identity: None,
            created_at,
        }
    }

    pub fn state(&self) -> AuthState {
        self.state
    }

    pub fn identity(&self) -> Option<Identity> {
        self.identity
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Append to the deferred queue, dropping the oldest packet when full.
    fn enqueue(&mut self, packet: Packet, capacity: usize) {
        if capacity == 0 {
            return;
        }
        if self.queue.len() >= capacity {
            if let Some(dropped) = self.queue.pop_front() {
                debug!(kind = %dropped.kind(), "handshake queue full, dropping oldest packet");
            }
        }
        self.queue.push_back(packet);
    }
}

/// What the caller must do after feeding a packet to the authorizator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AuthAction {
    /// Send this packet back to the address it came from.
    Reply(Packet),
    /// Hand this packet to the routing layer as sent by `identity`.
    Deliver { identity: Identity, packet: Packet },
}

enum Step {
    Done(Vec<AuthAction>),
    Reset(&'static str),
}

pub struct Authorizator {
    keypair: Keypair,
    identity: Identity,
    self_address: String,
    statuses: LruCache<String, AuthStatus>,
    /// Authorized identity -> address it was authorized at.
    authorized: HashMap<Identity, String>,
    nonce_len: usize,
    max_queued_packets: usize,
    handshake_timeout: f64,
}

impl Authorizator {
    pub fn new(keypair: Keypair, self_address: impl Into<String>, config: &OverlayConfig) -> Self {
        let capacity = NonZeroUsize::new(config.max_handshakes).unwrap_or(NonZeroUsize::MIN);
        Self {
            identity: keypair.identity(),
            keypair,
            self_address: self_address.into(),
            statuses: LruCache::new(capacity),
            authorized: HashMap::new(),
            nonce_len: config.nonce_len,
            max_queued_packets: config.max_queued_packets,
            handshake_timeout: config.handshake_timeout.as_secs_f64(),
        }
    }

    pub fn identity(&self) -> Identity {
        self.identity
    }

    /// Feed one inbound packet from `from` through the handshake.
    pub fn on_packet(&mut self, from: &str, packet: Packet, now: Timestamp) -> Vec<AuthAction> {
        match packet {
            Packet::RequestId => {
                return vec![AuthAction::Reply(Packet::ResponseId { id: self.identity })];
            }
            Packet::Confirm { rand_seq } => return self.answer_confirm(from, &rand_seq),
            _ => {}
        }

        if !self.statuses.contains(from) {
            let status = AuthStatus::new(self.fresh_nonce(), now);
            if let Some((evicted_addr, evicted)) = self.statuses.push(from.to_string(), status) {
                debug!(peer = %evicted_addr, "handshake table full, evicting least recent status");
                self.unindex(&evicted_addr, &evicted);
            }
        }

        let step = match self.statuses.get_mut(from) {
            Some(status) => advance(
                status,
                packet,
                self.max_queued_packets,
                from,
                &mut self.authorized,
            ),
            None => Step::Done(Vec::new()),
        };

        match step {
            Step::Done(actions) => actions,
            Step::Reset(reason) => {
                warn!(peer = %from, reason, "handshake integrity failure, resetting peer state");
                self.remove(from);
                Vec::new()
            }
        }
    }

    /// Prove possession of our key: open the sealed nonce and echo it back,
    /// but only if it is bound to the address that sent it.
    fn answer_confirm(&mut self, from: &str, sealed: &[u8]) -> Vec<AuthAction> {
        match open(&self.keypair, sealed) {
            Ok(nonce) if self.is_bound_to(&nonce, from) => {
                trace!(peer = %from, "answering handshake challenge");
                vec![AuthAction::Reply(Packet::ConfirmConfirm { rand_seq: nonce })]
            }
            Ok(_) => {
                warn!(peer = %from, "challenge nonce not bound to sender address, possible reflection");
                self.remove(from);
                Vec::new()
            }
            Err(e) => {
                warn!(peer = %from, error = %e, "failed to open challenge nonce");
                self.remove(from);
                Vec::new()
            }
        }
    }

    /// The address prefix is only unambiguous together with the length, so
    /// `127.0.0.1:80` never matches a nonce minted by `127.0.0.1:8080`.
    fn is_bound_to(&self, nonce: &[u8], address: &str) -> bool {
        nonce.len() == address.len() + self.nonce_len && nonce.starts_with(address.as_bytes())
    }

    fn fresh_nonce(&self) -> Vec<u8> {
        let mut nonce = Vec::with_capacity(self.self_address.len() + self.nonce_len);
        nonce.extend_from_slice(self.self_address.as_bytes());
        let mut random = vec![0u8; self.nonce_len];
        OsRng.fill_bytes(&mut random);
        nonce.extend_from_slice(&random);
        nonce
    }

    pub fn is_authorized(&self, identity: &Identity) -> bool {
        self.authorized.contains_key(identity)
    }

    /// Address at which `identity` completed its handshake.
    pub fn authorized_address(&self, identity: &Identity) -> Option<&str> {
        self.authorized.get(identity).map(String::as_str)
    }

    pub fn status(&self, address: &str) -> Option<&AuthStatus> {
        self.statuses.peek(address)
    }

    /// Forget everything about `address`, including its identity index.
    pub fn remove(&mut self, address: &str) {
        if let Some(status) = self.statuses.pop(address) {
            self.unindex(address, &status);
        }
    }

    fn unindex(&mut self, address: &str, status: &AuthStatus) {
        if status.state != AuthState::Authorized {
            return;
        }
        if let Some(id) = status.identity {
            if self.authorized.get(&id).map(String::as_str) == Some(address) {
                self.authorized.remove(&id);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.statuses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statuses.is_empty()
    }

    /// Drop handshakes that have been pending longer than the timeout.
    pub fn expire_pending(&mut self, now: Timestamp) -> usize {
        let stale: Vec<String> = self
            .statuses
            .iter()
            .filter(|(_, s)| s.state != AuthState::Authorized)
            .filter(|(_, s)| now - s.created_at > self.handshake_timeout)
            .map(|(addr, _)| addr.clone())
            .collect();
        for addr in &stale {
            self.statuses.pop(addr);
        }
        if !stale.is_empty() {
            debug!(expired = stale.len(), "expired stale handshakes");
        }
        stale.len()
    }
}

impl std::fmt::Debug for Authorizator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Authorizator")
            .field("identity", &self.identity)
            .field("self_address", &self.self_address)
            .field("statuses", &self.statuses.len())
            .field("authorized", &self.authorized.len())
            .finish()
    }
}

fn advance(
    status: &mut AuthStatus,
    packet: Packet,
    queue_capacity: usize,
    from: &str,
    authorized: &mut HashMap<Identity, String>,
) -> Step {
    match status.state {
        AuthState::Unauthorized => {
            status.enqueue(packet, queue_capacity);
            status.state = AuthState::WaitingId;
            Step::Done(vec![AuthAction::Reply(Packet::RequestId)])
        }
        AuthState::WaitingId => match packet {
            Packet::ResponseId { id } => {
                if !id.is_valid() {
                    return Step::Reset("claimed identity is not a valid public key");
                }
                match seal(&id, &status.rand_seq) {
                    Ok(sealed) => {
                        status.identity = Some(id);
                        status.state = AuthState::WaitingConfirm;
                        Step::Done(vec![AuthAction::Reply(Packet::Confirm { rand_seq: sealed })])
                    }
                    Err(_) => Step::Reset("cannot seal challenge to claimed identity"),
                }
            }
            other => {
                status.enqueue(other, queue_capacity);
                Step::Done(Vec::new())
            }
        },
        AuthState::WaitingConfirm => match packet {
            Packet::ConfirmConfirm { rand_seq } => {
                if rand_seq != status.rand_seq {
                    return Step::Reset("challenge nonce mismatch");
                }
                let Some(identity) = status.identity else {
                    return Step::Reset("confirmed without identity");
                };
                status.state = AuthState::Authorized;
                authorized.insert(identity, from.to_string());
                debug!(peer = %from, identity = %identity, replayed = status.queue.len(), "peer authorized");
                let actions = status
                    .queue
                    .drain(..)
                    .map(|packet| AuthAction::Deliver { identity, packet })
                    .collect();
                Step::Done(actions)
            }
            other => {
                status.enqueue(other, queue_capacity);
                Step::Done(Vec::new())
            }
        },
        AuthState::Authorized => match status.identity {
            Some(identity) => Step::Done(vec![AuthAction::Deliver { identity, packet }]),
            None => Step::Reset("authorized without identity"),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct Peer {
        address: &'static str,
        auth: Authorizator,
    }

    fn peer(login: &str, address: &'static str, config: &OverlayConfig) -> Peer {
        Peer {
            address,
            auth: Authorizator::new(Keypair::from_credentials(login, "password"), address, config),
        }
    }

    fn replies(actions: &[AuthAction]) -> Vec<Packet> {
        actions
            .iter()
            .filter_map(|a| match a {
                AuthAction::Reply(p) => Some(p.clone()),
                _ => None,
            })
            .collect()
    }

    fn delivered(actions: &[AuthAction]) -> Vec<Packet> {
        actions
            .iter()
            .filter_map(|a| match a {
                AuthAction::Deliver { packet, .. } => Some(packet.clone()),
                _ => None,
            })
            .collect()
    }

    fn single_reply(actions: Vec<AuthAction>) -> Packet {
        let mut r = replies(&actions);
        assert_eq!(r.len(), 1, "expected exactly one reply, got {:?}", actions);
        r.remove(0)
    }

    /// Run the handshake initiated by `a` sending `first` to `b`, with
    /// `extra` packets arriving at `b` while it waits. Returns what `b`
    /// delivers on completion.
    fn handshake(a: &mut Peer, b: &mut Peer, first: Packet, extra: Vec<Packet>, now: f64) -> Vec<AuthAction> {
        let request_id = single_reply(b.auth.on_packet(a.address, first, now));
        assert_eq!(request_id, Packet::RequestId);

        for p in extra {
            assert!(b.auth.on_packet(a.address, p, now).is_empty());
        }

        let response_id = single_reply(a.auth.on_packet(b.address, request_id, now));
        let confirm = single_reply(b.auth.on_packet(a.address, response_id, now));
        assert_eq!(b.auth.status(a.address).unwrap().state(), AuthState::WaitingConfirm);

        let confirm_confirm = single_reply(a.auth.on_packet(b.address, confirm, now));
        b.auth.on_packet(a.address, confirm_confirm, now)
    }

    #[test]
    fn full_handshake_authorizes_and_replays_in_order() {
        let config = OverlayConfig::default();
        let mut a = peer("login1", "addr1", &config);
        let mut b = peer("login2", "addr2", &config);

        let actions = handshake(&mut a, &mut b, Packet::Search, vec![Packet::Ping, Packet::Exchange], 0.0);
        assert_eq!(delivered(&actions), vec![Packet::Search, Packet::Ping, Packet::Exchange]);
        for action in &actions {
            if let AuthAction::Deliver { identity, .. } = action {
                assert_eq!(*identity, a.auth.identity());
            }
        }

        let status = b.auth.status("addr1").unwrap();
        assert_eq!(status.state(), AuthState::Authorized);
        assert_eq!(status.queued(), 0);
        assert!(b.auth.is_authorized(&a.auth.identity()));
        assert_eq!(b.auth.authorized_address(&a.auth.identity()), Some("addr1"));

        let after = b.auth.on_packet("addr1", Packet::Pong, 1.0);
        assert_eq!(
            after,
            vec![AuthAction::Deliver {
                identity: a.auth.identity(),
                packet: Packet::Pong
            }]
        );
    }

    #[test]
    fn both_directions_authorize_independently() {
        let config = OverlayConfig::default();
        let mut a = peer("login1", "addr1", &config);
        let mut b = peer("login2", "addr2", &config);

        handshake(&mut a, &mut b, Packet::Search, vec![], 0.0);
        assert!(!a.auth.is_authorized(&b.auth.identity()));

        let actions = handshake(&mut b, &mut a, Packet::Pong, vec![], 0.0);
        assert_eq!(delivered(&actions), vec![Packet::Pong]);
        assert!(a.auth.is_authorized(&b.auth.identity()));
        assert!(b.auth.is_authorized(&a.auth.identity()));
    }

    #[test]
    fn request_id_is_stateless() {
        let config = OverlayConfig::default();
        let mut a = peer("login1", "addr1", &config);

        let reply = single_reply(a.auth.on_packet("addr2", Packet::RequestId, 0.0));
        assert_eq!(reply, Packet::ResponseId { id: a.auth.identity() });
        assert!(a.auth.status("addr2").is_none());
    }

    #[test]
    fn tampered_confirm_confirm_resets() {
        let config = OverlayConfig::default();
        let mut a = peer("login1", "addr1", &config);
        let mut b = peer("login2", "addr2", &config);

        let request_id = single_reply(b.auth.on_packet("addr1", Packet::Search, 0.0));
        let response_id = single_reply(a.auth.on_packet("addr2", request_id, 0.0));
        let confirm = single_reply(b.auth.on_packet("addr1", response_id, 0.0));
        let mut nonce = match single_reply(a.auth.on_packet("addr2", confirm, 0.0)) {
            Packet::ConfirmConfirm { rand_seq } => rand_seq,
            other => panic!("unexpected {:?}", other),
        };
        let last = nonce.len() - 1;
        nonce[last] ^= 0xff;

        let actions = b.auth.on_packet("addr1", Packet::ConfirmConfirm { rand_seq: nonce }, 0.0);
        assert!(actions.is_empty());
        assert!(b.auth.status("addr1").is_none());
        assert!(!b.auth.is_authorized(&a.auth.identity()));

        // Next packet restarts from scratch.
        let restart = single_reply(b.auth.on_packet("addr1", Packet::Ping, 0.0));
        assert_eq!(restart, Packet::RequestId);
    }

    #[test]
    fn confirm_not_bound_to_sender_is_refused() {
        let config = OverlayConfig::default();
        let mut a = peer("login1", "addr1", &config);

        let mut forged = b"addr9".to_vec();
        forged.extend_from_slice(&[7u8; 128]);
        let sealed = seal(&a.auth.identity(), &forged).unwrap();

        // Leave some state for addr2 so the reset is observable.
        a.auth.on_packet("addr2", Packet::Ping, 0.0);
        assert!(a.auth.status("addr2").is_some());

        let actions = a.auth.on_packet("addr2", Packet::Confirm { rand_seq: sealed }, 0.0);
        assert!(actions.is_empty());
        assert!(a.auth.status("addr2").is_none());
    }

    #[test]
    fn confirm_sealed_for_someone_else_is_refused() {
        let config = OverlayConfig::default();
        let mut a = peer("login1", "addr1", &config);
        let other = Keypair::from_credentials("login3", "password");

        let sealed = seal(&other.identity(), b"addr2-nonce").unwrap();
        assert!(a.auth.on_packet("addr2", Packet::Confirm { rand_seq: sealed }, 0.0).is_empty());
    }

    #[test]
    fn invalid_claimed_identity_resets() {
        let config = OverlayConfig::default();
        let mut b = peer("login2", "addr2", &config);

        b.auth.on_packet("addr1", Packet::Search, 0.0);
        let bogus = Identity::from_bytes([0u8; 32]);
        assert!(b.auth.on_packet("addr1", Packet::ResponseId { id: bogus }, 0.0).is_empty());
        assert!(b.auth.status("addr1").is_none());
    }

    #[test]
    fn deferred_queue_drops_oldest_on_overflow() {
        let config = OverlayConfig {
            max_queued_packets: 2,
            ..OverlayConfig::default()
        };
        let mut a = peer("login1", "addr1", &config);
        let mut b = peer("login2", "addr2", &config);

        let actions = handshake(
            &mut a,
            &mut b,
            Packet::Search,
            vec![Packet::Ping, Packet::Exchange],
            0.0,
        );
        assert_eq!(delivered(&actions), vec![Packet::Ping, Packet::Exchange]);
    }

    #[test]
    fn status_table_is_bounded() {
        let config = OverlayConfig {
            max_handshakes: 3,
            ..OverlayConfig::default()
        };
        let mut b = peer("login2", "addr2", &config);

        for addr in ["p1", "p2", "p3", "p4", "p5"] {
            b.auth.on_packet(addr, Packet::Ping, 0.0);
        }
        assert_eq!(b.auth.len(), 3);
        assert!(b.auth.status("p1").is_none());
        assert!(b.auth.status("p5").is_some());
    }

    #[test]
    fn evicting_authorized_status_clears_index() {
        let config = OverlayConfig {
            max_handshakes: 1,
            ..OverlayConfig::default()
        };
        let mut a = peer("login1", "addr1", &config);
        let mut b = peer("login2", "addr2", &config);

        handshake(&mut a, &mut b, Packet::Ping, vec![], 0.0);
        assert!(b.auth.is_authorized(&a.auth.identity()));

        b.auth.on_packet("addr3", Packet::Ping, 0.0);
        assert!(!b.auth.is_authorized(&a.auth.identity()));
    }

    #[test]
    fn remove_clears_identity_index() {
        let config = OverlayConfig::default();
        let mut a = peer("login1", "addr1", &config);
        let mut b = peer("login2", "addr2", &config);

        handshake(&mut a, &mut b, Packet::Ping, vec![], 0.0);
        b.auth.remove("addr1");
        assert!(!b.auth.is_authorized(&a.auth.identity()));
        assert!(b.auth.is_empty());
        b.auth.remove("addr1");
    }

    #[test]
    fn pending_handshakes_expire() {
        let config = OverlayConfig {
            handshake_timeout: Duration::from_secs(60),
            ..OverlayConfig::default()
        };
        let mut a = peer("login1", "addr1", &config);
        let mut b = peer("login2", "addr2", &config);

        handshake(&mut a, &mut b, Packet::Ping, vec![], 0.0);
        b.auth.on_packet("stuck", Packet::Ping, 10.0);

        assert_eq!(b.auth.expire_pending(50.0), 0);
        assert_eq!(b.auth.expire_pending(100.0), 1);
        assert!(b.auth.status("stuck").is_none());
        assert!(b.auth.is_authorized(&a.auth.identity()));
    }

    #[test]
    fn nonce_is_bound_to_own_address() {
        let config = OverlayConfig::default();
        let b = peer("login2", "addr2", &config);
        let nonce = b.auth.fresh_nonce();
        assert!(nonce.starts_with(b"addr2"));
        assert_eq!(nonce.len(), "addr2".len() + config.nonce_len);
    }

    #[test]
    fn confirm_from_address_prefix_is_refused() {
        let config = OverlayConfig::default();
        let mut victim = peer("login1", "127.0.0.1:7000", &config);
        let minted_by = peer("login2", "127.0.0.1:8080", &config);

        // A nonce minted for 127.0.0.1:8080 and sealed to the victim, replayed
        // from 127.0.0.1:80.
        let nonce = minted_by.auth.fresh_nonce();
        let sealed = seal(&victim.auth.identity(), &nonce).unwrap();
        let actions = victim.auth.on_packet("127.0.0.1:80", Packet::Confirm { rand_seq: sealed.clone() }, 0.0);
        assert!(actions.is_empty());

        let reply = single_reply(victim.auth.on_packet("127.0.0.1:8080", Packet::Confirm { rand_seq: sealed }, 0.0));
        assert_eq!(reply, Packet::ConfirmConfirm { rand_seq: nonce });
    }
}
