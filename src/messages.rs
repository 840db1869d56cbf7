//! # Wire Protocol Messages
//!
//! This module defines every packet exchanged between overlay nodes.
//! Packets are a closed tagged union; nothing outside this vocabulary is
//! accepted from the network.
//!
//! ## Frame Layout
//!
//! ```text
//! [WIRE_VERSION: u8][PacketType: u8][bincode body]
//! ```
//!
//! `PacketType` discriminants are a static table shared by all participants
//! (they reproduce the historical key vocabulary indices), never negotiated.
//!
//! ## Packet Types
//!
//! | Type | Body | Purpose |
//! |------|------|---------|
//! | `RequestId` | - | Handshake: ask a peer for its identity |
//! | `ResponseId` | `Identity` | Handshake: announce own identity |
//! | `Confirm` | sealed nonce | Handshake: challenge |
//! | `ConfirmConfirm` | nonce | Handshake: proof of key possession |
//! | `Exchange` | - | Gossip pull request |
//! | `Search` | - | Bootstrap / convergence request |
//! | `SearchResponse` | `Vec<PeerEntry>` | Nearest peers to the requester |
//! | `ExchangeResponse` | `Vec<PeerEntry>` | Nearest peers to the requester |
//! | `Ping` / `Pong` | - | Liveness probe and acknowledgment |
//!
//! ## Security Limits
//!
//! - All decoding goes through bounded bincode options (no trailing bytes)
//! - Addresses are non-empty and shorter than `MAX_ADDR_LEN`
//! - Peer lists and nonces are length-capped

use bincode::Options;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::identity::Identity;

/// Wire format version. Bump on any incompatible change.
pub const WIRE_VERSION: u8 = 1;

/// Addresses must be strictly shorter than this.
pub const MAX_ADDR_LEN: usize = 100;

/// Maximum encoded packet size. Fits a single UDP datagram.
pub const MAX_PACKET_SIZE: usize = 64 * 1024;

/// Maximum peers carried in a single response.
pub const MAX_PEERS_PER_PACKET: usize = 400;

/// Maximum handshake nonce length (plaintext or sealed).
pub const MAX_NONCE_LEN: usize = 1024;

fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_PACKET_SIZE as u64)
        .with_fixint_encoding()
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug)]
pub enum WireError {
    /// Frame shorter than the two header bytes.
    Truncated,
    /// Unknown wire version.
    UnsupportedVersion(u8),
    /// Type byte outside the vocabulary table.
    UnknownType(u8),
    /// Body failed to (de)serialize.
    Codec(bincode::Error),
    /// Body decoded but violates a field bound.
    Invalid(&'static str),
}

impl std::fmt::Display for WireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WireError::Truncated => write!(f, "packet is truncated"),
            WireError::UnsupportedVersion(v) => write!(f, "unsupported wire version {}", v),
            WireError::UnknownType(t) => write!(f, "unknown packet type {}", t),
            WireError::Codec(e) => write!(f, "packet codec error: {}", e),
            WireError::Invalid(reason) => write!(f, "invalid packet: {}", reason),
        }
    }
}

impl std::error::Error for WireError {}

impl From<bincode::Error> for WireError {
    fn from(e: bincode::Error) -> Self {
        WireError::Codec(e)
    }
}

// ============================================================================
// Packet Types
// ============================================================================

/// Static vocabulary of packet types.
///
/// Indices 0..=3 (`type`, `id`, `rand_seq`, `closest_friends`) name fields in
/// the historical map encoding and are reserved.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    RequestId = 4,
    ResponseId = 5,
    Confirm = 6,
    ConfirmConfirm = 7,
    Exchange = 8,
    Search = 9,
    SearchResponse = 10,
    ExchangeResponse = 11,
    Ping = 12,
    Pong = 13,
}

impl PacketType {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            4 => PacketType::RequestId,
            5 => PacketType::ResponseId,
            6 => PacketType::Confirm,
            7 => PacketType::ConfirmConfirm,
            8 => PacketType::Exchange,
            9 => PacketType::Search,
            10 => PacketType::SearchResponse,
            11 => PacketType::ExchangeResponse,
            12 => PacketType::Ping,
            13 => PacketType::Pong,
            _ => return None,
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PacketType::RequestId => "request_id",
            PacketType::ResponseId => "response_id",
            PacketType::Confirm => "confirm",
            PacketType::ConfirmConfirm => "confirm_confirm",
            PacketType::Exchange => "exchange",
            PacketType::Search => "search",
            PacketType::SearchResponse => "search_response",
            PacketType::ExchangeResponse => "exchange_response",
            PacketType::Ping => "ping",
            PacketType::Pong => "pong",
        }
    }

    /// Handshake control types are consumed by the authorizator.
    pub fn is_handshake(self) -> bool {
        matches!(
            self,
            PacketType::RequestId
                | PacketType::ResponseId
                | PacketType::Confirm
                | PacketType::ConfirmConfirm
        )
    }
}

impl std::fmt::Display for PacketType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A peer offered in a search or exchange response.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerEntry {
    pub identity: Identity,
    pub address: String,
}

impl PeerEntry {
    pub fn new(identity: Identity, address: impl Into<String>) -> Self {
        Self {
            identity,
            address: address.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Packet {
    RequestId,
    ResponseId { id: Identity },
    Confirm { rand_seq: Vec<u8> },
    ConfirmConfirm { rand_seq: Vec<u8> },
    Exchange,
    Search,
    SearchResponse { closest_friends: Vec<PeerEntry> },
    ExchangeResponse { closest_friends: Vec<PeerEntry> },
    Ping,
    Pong,
}

impl Packet {
    pub fn kind(&self) -> PacketType {
        match self {
            Packet::RequestId => PacketType::RequestId,
            Packet::ResponseId { .. } => PacketType::ResponseId,
            Packet::Confirm { .. } => PacketType::Confirm,
            Packet::ConfirmConfirm { .. } => PacketType::ConfirmConfirm,
            Packet::Exchange => PacketType::Exchange,
            Packet::Search => PacketType::Search,
            Packet::SearchResponse { .. } => PacketType::SearchResponse,
            Packet::ExchangeResponse { .. } => PacketType::ExchangeResponse,
            Packet::Ping => PacketType::Ping,
            Packet::Pong => PacketType::Pong,
        }
    }

    /// Validate field bounds. Called on every decoded packet.
    pub fn validate(&self) -> Result<(), WireError> {
        match self {
            Packet::Confirm { rand_seq } | Packet::ConfirmConfirm { rand_seq } => {
                if rand_seq.is_empty() || rand_seq.len() > MAX_NONCE_LEN {
                    return Err(WireError::Invalid("nonce length out of bounds"));
                }
            }
            Packet::SearchResponse { closest_friends }
            | Packet::ExchangeResponse { closest_friends } => {
                if closest_friends.len() > MAX_PEERS_PER_PACKET {
                    return Err(WireError::Invalid("too many peers"));
                }
                if closest_friends.iter().any(|p| !is_valid_address(&p.address)) {
                    return Err(WireError::Invalid("peer address out of bounds"));
                }
            }
            _ => {}
        }
        Ok(())
    }
}

/// Addresses are opaque, non-empty strings shorter than [`MAX_ADDR_LEN`].
pub fn is_valid_address(addr: &str) -> bool {
    !addr.is_empty() && addr.len() < MAX_ADDR_LEN
}

// ============================================================================
// Codec
// ============================================================================

pub fn encode(packet: &Packet) -> Result<Vec<u8>, WireError> {
    let mut out = vec![WIRE_VERSION, packet.kind() as u8];
    let opts = bincode_options();
    match packet {
        Packet::RequestId | Packet::Exchange | Packet::Search | Packet::Ping | Packet::Pong => {}
        Packet::ResponseId { id } => opts.serialize_into(&mut out, id)?,
        Packet::Confirm { rand_seq } | Packet::ConfirmConfirm { rand_seq } => {
            opts.serialize_into(&mut out, rand_seq)?
        }
        Packet::SearchResponse { closest_friends }
        | Packet::ExchangeResponse { closest_friends } => {
            opts.serialize_into(&mut out, closest_friends)?
        }
    }
    if out.len() > MAX_PACKET_SIZE {
        return Err(WireError::Invalid("packet exceeds maximum size"));
    }
    Ok(out)
}

pub fn decode(bytes: &[u8]) -> Result<Packet, WireError> {
    if bytes.len() < 2 {
        return Err(WireError::Truncated);
    }
    if bytes[0] != WIRE_VERSION {
        return Err(WireError::UnsupportedVersion(bytes[0]));
    }
    let kind = PacketType::from_u8(bytes[1]).ok_or(WireError::UnknownType(bytes[1]))?;
    let body = &bytes[2..];

    let packet = match kind {
        PacketType::RequestId => empty_body(body, Packet::RequestId)?,
        PacketType::Exchange => empty_body(body, Packet::Exchange)?,
        PacketType::Search => empty_body(body, Packet::Search)?,
        PacketType::Ping => empty_body(body, Packet::Ping)?,
        PacketType::Pong => empty_body(body, Packet::Pong)?,
        PacketType::ResponseId => Packet::ResponseId { id: deserialize_bounded(body)? },
        PacketType::Confirm => Packet::Confirm { rand_seq: deserialize_bounded(body)? },
        PacketType::ConfirmConfirm => Packet::ConfirmConfirm { rand_seq: deserialize_bounded(body)? },
        PacketType::SearchResponse => Packet::SearchResponse {
            closest_friends: deserialize_bounded(body)?,
        },
        PacketType::ExchangeResponse => Packet::ExchangeResponse {
            closest_friends: deserialize_bounded(body)?,
        },
    };
    packet.validate()?;
    Ok(packet)
}

/// Deserialize with size bounds enforced.
/// SECURITY: Use this instead of raw bincode::deserialize.
pub fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode_options().deserialize(bytes)
}

fn empty_body(body: &[u8], packet: Packet) -> Result<Packet, WireError> {
    if !body.is_empty() {
        return Err(WireError::Invalid("unexpected body"));
    }
    Ok(packet)
}
