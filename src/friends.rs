//! # Friend Table
//!
//! Bounded mapping from peer identity to peer metadata, ordered by proximity
//! to a target in the identity metric.
//!
//! ## Records
//!
//! A [`Friend`] is a single composite record holding the static fields
//! (identity, address, opaque data) and the dynamic fields maintained by the
//! overlay schedulers (last ping response, last exchange). Only the static
//! part is persisted.
//!
//! ## Proximity Queries
//!
//! [`FriendTable::find_closest`] is an exact top-k over the whole table:
//! every candidate that passes the filter is ranked by distance to the
//! target, ties broken by identity.
//!
//! ## Capacity
//!
//! The table itself never refuses an insert. The overlay calls
//! [`FriendTable::evict_over_capacity`] after each insert; once the table
//! grows past `eviction_ceiling_pct` of `max_friends`, the farthest
//! `eviction_batch_pct` of `max_friends` entries are removed in one pass.
//!
//! ## Persistence
//!
//! With a state file configured, the static records are written with bincode
//! after mutations (temp file + rename) and reloaded at startup with fresh
//! timestamps.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use bincode::Options;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::identity::{Distance, DistanceCache, Identity};
use crate::overlay::OverlayConfig;
use crate::protocols::Timestamp;

/// Maximum accepted size of a persisted friend table.
const MAX_STATE_FILE_SIZE: u64 = 16 * 1024 * 1024;

#[derive(Clone, Debug, PartialEq)]
pub struct Friend {
    pub identity: Identity,
    pub address: String,
    /// Reserved opaque blob, not used for routing.
    pub data: Vec<u8>,
    pub last_ping_response: Timestamp,
    pub last_exchange: Timestamp,
}

/// Persisted static part of a [`Friend`].
#[derive(Clone, Debug, Serialize, Deserialize)]
struct FriendRecord {
    identity: Identity,
    address: String,
    data: Vec<u8>,
}

/// A friend ranked by distance to some target.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Ranked {
    pub distance: Distance,
    pub identity: Identity,
    pub address: String,
}

#[derive(Debug)]
pub struct FriendTable {
    friends: BTreeMap<Identity, Friend>,
    distances: DistanceCache,
    max_friends: usize,
    eviction_ceiling_pct: usize,
    eviction_batch_pct: usize,
    exchange_interval: f64,
    exchange_jitter: f64,
    state_file: Option<PathBuf>,
    dirty: bool,
}

impl FriendTable {
    pub fn new(config: &OverlayConfig, state_file: Option<PathBuf>) -> Self {
        Self {
            friends: BTreeMap::new(),
            distances: DistanceCache::new(config.distance_cache_capacity),
            max_friends: config.max_friends,
            eviction_ceiling_pct: config.eviction_ceiling_pct,
            eviction_batch_pct: config.eviction_batch_pct,
            exchange_interval: config.exchange_interval.as_secs_f64(),
            exchange_jitter: config.exchange_jitter.as_secs_f64(),
            state_file,
            dirty: false,
        }
    }

    pub fn len(&self) -> usize {
        self.friends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.friends.is_empty()
    }

    pub fn have_enough(&self) -> bool {
        self.friends.len() >= self.max_friends
    }

    pub fn has(&self, identity: &Identity) -> bool {
        self.friends.contains_key(identity)
    }

    pub fn get(&self, identity: &Identity) -> Option<&Friend> {
        self.friends.get(identity)
    }

    /// Insert a new friend. No-op (returns `false`) if the identity is known.
    ///
    /// A fresh friend is marked as just pinged and becomes exchange-eligible
    /// `exchange_jitter` seconds from now.
    pub fn add(&mut self, identity: Identity, address: impl Into<String>, now: Timestamp) -> bool {
        if self.friends.contains_key(&identity) {
            return false;
        }
        let friend = Friend {
            identity,
            address: address.into(),
            data: Vec::new(),
            last_ping_response: now,
            last_exchange: now - self.exchange_interval + self.exchange_jitter,
        };
        self.friends.insert(identity, friend);
        self.dirty = true;
        true
    }

    pub fn remove(&mut self, identity: &Identity) -> Option<Friend> {
        let removed = self.friends.remove(identity);
        if removed.is_some() {
            self.dirty = true;
        }
        removed
    }

    /// Up to `count` friends ordered by distance to `target`.
    ///
    /// Nearest first, or farthest first when `reverse` is set. Friends for
    /// which `keep` returns `false` are excluded before ranking.
    pub fn find_closest<F>(&mut self, target: &Identity, count: usize, reverse: bool, keep: F) -> Vec<Ranked>
    where
        F: Fn(&Identity) -> bool,
    {
        if count == 0 {
            return Vec::new();
        }
        let distances = &mut self.distances;
        let mut ranked: Vec<Ranked> = self
            .friends
            .values()
            .filter(|f| keep(&f.identity))
            .map(|f| Ranked {
                distance: distances.get(target, &f.identity),
                identity: f.identity,
                address: f.address.clone(),
            })
            .collect();

        ranked.sort_by(|a, b| (a.distance, a.identity).cmp(&(b.distance, b.identity)));
        if reverse {
            ranked.reverse();
        }
        ranked.truncate(count);
        ranked
    }

    /// Nearest friend to `target`, if any.
    pub fn closest(&mut self, target: &Identity) -> Option<Ranked> {
        self.find_closest(target, 1, false, |_| true).into_iter().next()
    }

    /// Trim the farthest friends from `center` once past the ceiling.
    ///
    /// Returns the removed friends so their authorization state can be
    /// dropped too.
    pub fn evict_over_capacity(&mut self, center: &Identity) -> Vec<Friend> {
        if self.friends.len() * 100 <= self.max_friends * self.eviction_ceiling_pct {
            return Vec::new();
        }
        let batch = self.max_friends * self.eviction_batch_pct / 100;
        let farthest = self.find_closest(center, batch, true, |_| true);

        let evicted: Vec<Friend> = farthest
            .iter()
            .filter_map(|r| self.remove(&r.identity))
            .collect();
        debug!(
            evicted = evicted.len(),
            remaining = self.friends.len(),
            "friend table over capacity, trimmed farthest"
        );
        evicted
    }

    pub fn mark_exchanged(&mut self, identity: &Identity, now: Timestamp) {
        if let Some(f) = self.friends.get_mut(identity) {
            f.last_exchange = now;
        }
    }

    pub fn mark_ping_response(&mut self, identity: &Identity, now: Timestamp) {
        if let Some(f) = self.friends.get_mut(identity) {
            f.last_ping_response = now;
        }
    }

    pub fn last_exchange(&self, identity: &Identity) -> Option<Timestamp> {
        self.friends.get(identity).map(|f| f.last_exchange)
    }

    pub fn last_ping_response(&self, identity: &Identity) -> Option<Timestamp> {
        self.friends.get(identity).map(|f| f.last_ping_response)
    }

    /// Copy of every friend, ordered by identity.
    pub fn snapshot(&self) -> Vec<Friend> {
        self.friends.values().cloned().collect()
    }

    pub fn addresses(&self) -> Vec<String> {
        self.friends.values().map(|f| f.address.clone()).collect()
    }

    pub fn state_file(&self) -> Option<&Path> {
        self.state_file.as_deref()
    }

    // ========================================================================
    // Persistence
    // ========================================================================

    /// Load persisted friends, stamping them with `now`. Returns how many
    /// were loaded. A missing state file is an empty table, not an error.
    pub fn load(&mut self, now: Timestamp) -> Result<usize> {
        let Some(path) = self.state_file.clone() else {
            return Ok(0);
        };
        if !path.exists() {
            return Ok(0);
        }
        let bytes = fs::read(&path)
            .with_context(|| format!("failed to read friend table {}", path.display()))?;
        let records: Vec<FriendRecord> = state_options()
            .deserialize(&bytes)
            .with_context(|| format!("corrupt friend table {}", path.display()))?;

        let mut loaded = 0;
        for record in records {
            if self.add(record.identity, record.address, now) {
                if let Some(f) = self.friends.get_mut(&record.identity) {
                    f.data = record.data;
                }
                loaded += 1;
            }
        }
        self.dirty = false;
        debug!(loaded, path = %path.display(), "loaded friend table");
        Ok(loaded)
    }

    /// Write the table to its state file if it changed since the last write.
    pub fn persist(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        let Some(path) = self.state_file.as_ref() else {
            self.dirty = false;
            return Ok(());
        };

        let records: Vec<FriendRecord> = self
            .friends
            .values()
            .map(|f| FriendRecord {
                identity: f.identity,
                address: f.address.clone(),
                data: f.data.clone(),
            })
            .collect();
        let bytes = state_options()
            .serialize(&records)
            .context("failed to encode friend table")?;

        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create state directory {}", dir.display()))?;
        }
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, &bytes)
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        fs::rename(&tmp, path)
            .with_context(|| format!("failed to replace {}", path.display()))?;

        self.dirty = false;
        Ok(())
    }
}

fn state_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_STATE_FILE_SIZE)
        .with_fixint_encoding()
}
