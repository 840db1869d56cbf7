//! Collaborator trait definitions for the overlay core.
//!
//! The overlay reactor never touches sockets or wall clocks directly. It is
//! parameterized by two seams so the same protocol code runs on UDP under
//! tokio and inside the deterministic simulation.
//!
//! | Seam | Trait | Implementations |
//! |------|-------|-----------------|
//! | Packet delivery | [`Transport`] | `UdpTransport`, `SimNetwork` |
//! | Time | [`Clock`] | [`SystemClock`], `SimClock` |
//!
//! ## Transport Contract
//!
//! `send` is fire-and-forget: best-effort, unordered, at-most-once. It must
//! not block waiting for a reply; replies arrive later as independent
//! inbound packets.

use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Result;

use crate::messages::Packet;

/// Seconds since an arbitrary epoch, as a float.
pub type Timestamp = f64;

/// Outbound packet delivery.
pub trait Transport: Send + Sync {
    /// Send `packet` from `from` to `to`. Errors mean the packet was dropped.
    fn send(&self, from: &str, to: &str, packet: &Packet) -> Result<()>;
}

/// Source of the current time.
pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

/// Wall-clock time (seconds since the Unix epoch).
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64()
    }
}
