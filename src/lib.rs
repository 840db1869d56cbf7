//! # Overmesh - Self-Organizing Peer-to-Peer Overlay
//!
//! Overmesh keeps every node connected to the peers nearest its own identity:
//!
//! - **Identity**: Ed25519 keypairs derived deterministically from credentials
//! - **Metric**: big-endian absolute difference between identities
//! - **Friend Table**: bounded, proximity-ordered peer table with hysteresis eviction
//! - **Handshake**: four-message proof of key possession before any routing traffic
//! - **Maintenance**: bootstrap search walk, gossip exchange, ping/pong liveness
//!
//! ## Architecture
//!
//! The protocol core ([`OverlayNode`]) is a synchronous reactor parameterized
//! by a [`Transport`] and a [`Clock`]. Two drivers run it:
//! - [`Node`]: a tokio actor on a UDP socket
//! - [`Simulation`]: a deterministic virtual-time network for tests
//!
//! ## Security Model
//!
//! - Identity = Ed25519 public key
//! - Handshake nonces are sealed to the claimed identity and bound to the
//!   verifier's address
//! - Handshake queues, handshake tables and distance caches are bounded
//! - Decoding goes through size-limited bincode with strict field checks
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `identity` | Keypairs, identities, distance metric and cache |
//! | `crypto` | Sealing handshake nonces to an identity |
//! | `messages` | Packet vocabulary and wire codec |
//! | `protocols` | Transport and clock seams |
//! | `friends` | Friend table, proximity queries, eviction, persistence |
//! | `auth` | Per-address authorization state machine |
//! | `overlay` | Protocol handlers and schedulers |
//! | `transport` | UDP transport |
//! | `node` | Async node handle and actor |
//! | `sim` | Deterministic multi-node simulation |

mod auth;
mod crypto;
mod friends;
mod identity;
mod messages;
mod node;
mod overlay;
mod protocols;
mod sim;
mod transport;

pub use auth::{AuthAction, AuthState, AuthStatus, Authorizator};
pub use crypto::{open, seal, SealError, SEAL_OVERHEAD};
pub use friends::{Friend, FriendTable, Ranked};
pub use identity::{distance, Distance, DistanceCache, Identity, Keypair};
pub use messages::{
    decode, encode, is_valid_address, Packet, PacketType, PeerEntry, WireError, MAX_ADDR_LEN,
    MAX_PACKET_SIZE, WIRE_VERSION,
};
pub use node::Node;
pub use overlay::{OverlayConfig, OverlayNode};
pub use protocols::{Clock, SystemClock, Timestamp, Transport};
pub use sim::{SimClock, SimNetwork, Simulation, SIM_START_TIME};
pub use transport::{Inbound, UdpTransport};
