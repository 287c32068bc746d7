// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The connection tracker.
//!
//! A concurrent map from a flow key to a shared connection, with an
//! idle TTL. The datapath keeps several of these (application/network
//! × original/reply, plus the source-port tracker), all holding
//! `Arc`s to the same connections.
//!
//! The map is split into shards selected by a CRC32 of the key. A
//! shard lock is only held for a single lookup, insertion or sweep and
//! is never held while a connection lock is taken, which is what lets
//! expiry run concurrently with packet processing.

use crate::api::FlowId;
use crate::sync::KMutex;
use crate::time::MILLIS;
use crate::time::Moment;
use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::fmt::Display;
use core::hash::Hash;
use core::hash::Hasher;
use core::num::NonZeroU32;
use core::sync::atomic::AtomicU32;
use core::sync::atomic::Ordering;

pub const CONN_DEF_EXPIRE_SECS: u64 = 24;
pub const CONN_DEF_TTL: Ttl = Ttl::new_seconds(CONN_DEF_EXPIRE_SECS);

pub const TRACKER_DEF_MAX_ENTRIES: u32 = 8192;

/// The Time To Live in milliseconds.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Ttl(u64);

impl Ttl {
    pub fn as_seconds(&self) -> u64 {
        self.0 / 1_000
    }

    pub fn as_milliseconds(&self) -> u64 {
        self.0
    }

    /// Is `last_hit` expired?
    pub fn is_expired(&self, last_hit: Moment, now: Moment) -> bool {
        now.delta_as_millis(last_hit) >= self.0
    }

    /// Create a new TTL based on seconds.
    pub const fn new_seconds(seconds: u64) -> Self {
        Ttl(seconds * MILLIS)
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TrackerError {
    MaxCapacity { tracker: String, limit: u32 },
}

impl Display for TrackerError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::MaxCapacity { tracker, limit } => {
                write!(f, "{tracker} tracker at capacity ({limit})")
            }
        }
    }
}

impl std::error::Error for TrackerError {}

/// A connection that can live in a tracker.
pub trait Tracked: Send + Sync {
    /// The ID of the PU context the connection belongs to.
    fn context_id(&self) -> &str;

    /// The flow the connection was created for.
    fn flow(&self) -> FlowId;
}

/// A tracker entry holds the connection and its hit bookkeeping.
#[derive(Debug)]
pub struct TrackedEntry<V> {
    conn: Arc<V>,

    /// Number of times this entry has been matched.
    hits: u64,

    /// This tracks the last time the entry was matched.
    last_hit: Moment,
}

impl<V> TrackedEntry<V> {
    fn new(conn: Arc<V>) -> Self {
        Self { conn, hits: 0, last_hit: Moment::now() }
    }

    fn hit(&mut self) {
        self.hits += 1;
        self.last_hit = Moment::now();
    }

    fn is_expired(&self, now: Moment, ttl: Ttl) -> bool {
        ttl.is_expired(self.last_hit, now)
    }
}

type Shard<K, V> = KMutex<BTreeMap<K, TrackedEntry<V>>>;

pub struct ConnectionTracker<K, V> {
    name: String,
    limit: NonZeroU32,
    ttl: Ttl,
    len: AtomicU32,
    shards: Box<[Shard<K, V>]>,
}

impl<K, V> ConnectionTracker<K, V>
where
    K: Clone + Hash + Ord,
    V: Tracked,
{
    pub fn new(name: &str, limit: NonZeroU32, ttl: Ttl, shards: u32) -> Self {
        let shards = (0..shards.max(1))
            .map(|_| KMutex::new(BTreeMap::new()))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            name: name.into(),
            limit,
            ttl,
            len: AtomicU32::new(0),
            shards,
        }
    }

    fn shard(&self, key: &K) -> &Shard<K, V> {
        let mut h = crc32fast::Hasher::new();
        key.hash(&mut h);
        let idx = h.finish() as usize % self.shards.len();
        &self.shards[idx]
    }

    fn reserve(&self) -> Result<(), TrackerError> {
        let limit = self.limit.get();
        if self.len.fetch_add(1, Ordering::AcqRel) >= limit {
            self.len.fetch_sub(1, Ordering::AcqRel);
            return Err(TrackerError::MaxCapacity {
                tracker: self.name.clone(),
                limit,
            });
        }
        Ok(())
    }

    fn release(&self, n: usize) {
        self.len.fetch_sub(n as u32, Ordering::AcqRel);
    }

    /// Look up `key`, refreshing its idle timer.
    pub fn get(&self, key: &K) -> Option<Arc<V>> {
        let mut shard = self.shard(key).lock();
        let entry = shard.get_mut(key)?;
        entry.hit();
        Some(entry.conn.clone())
    }

    /// Map `key` to `conn`, replacing any previous connection.
    ///
    /// # Errors
    ///
    /// If the tracker is at max capacity and `key` is new, an error
    /// is returned and no modification is made.
    pub fn add_or_update(&self, key: K, conn: Arc<V>) -> Result<(), TrackerError> {
        let mut shard = self.shard(&key).lock();
        if let Some(entry) = shard.get_mut(&key) {
            entry.conn = conn;
            entry.hit();
            return Ok(());
        }

        self.reserve()?;
        shard.insert(key, TrackedEntry::new(conn));
        Ok(())
    }

    /// Return the connection for `key`, creating it with `f` if there
    /// is none. The boolean is true when `f` was used.
    ///
    /// The lookup and the insertion happen under one shard lock, so
    /// two workers racing on the same key end up sharing one
    /// connection.
    pub fn get_or_insert_with<F>(
        &self,
        key: K,
        f: F,
    ) -> Result<(Arc<V>, bool), TrackerError>
    where
        F: FnOnce() -> Arc<V>,
    {
        let mut shard = self.shard(&key).lock();
        if let Some(entry) = shard.get_mut(&key) {
            entry.hit();
            return Ok((entry.conn.clone(), false));
        }

        self.reserve()?;
        let conn = f();
        shard.insert(key, TrackedEntry::new(conn.clone()));
        Ok((conn, true))
    }

    pub fn remove(&self, key: &K) -> Option<Arc<V>> {
        let removed = self.shard(key).lock().remove(key)?;
        self.release(1);
        Some(removed.conn)
    }

    /// Remove `key` only if it still maps to `conn`.
    pub fn remove_if_same(&self, key: &K, conn: &Arc<V>) -> bool {
        let mut shard = self.shard(key).lock();
        match shard.get(key) {
            Some(entry) if Arc::ptr_eq(&entry.conn, conn) => {
                shard.remove(key);
                self.release(1);
                true
            }
            _ => false,
        }
    }

    /// Remove every entry idle for at least the TTL and return them.
    ///
    /// The caller acts on the removed connections after every shard
    /// lock has been released.
    pub fn expire_at(&self, now: Moment) -> Vec<(K, Arc<V>)> {
        let ttl = self.ttl;
        self.drain_where(|_, entry| entry.is_expired(now, ttl))
    }

    /// Remove every connection belonging to the context `id`.
    pub fn purge_context(&self, id: &str) -> Vec<(K, Arc<V>)> {
        self.drain_where(|_, entry| entry.conn.context_id() == id)
    }

    fn drain_where<F>(&self, f: F) -> Vec<(K, Arc<V>)>
    where
        F: Fn(&K, &TrackedEntry<V>) -> bool,
    {
        let mut out = vec![];
        for shard in self.shards.iter() {
            let mut map = shard.lock();
            map.retain(|key, entry| {
                if f(key, entry) {
                    out.push((key.clone(), entry.conn.clone()));
                    return false;
                }
                true
            });
        }
        self.release(out.len());
        out
    }

    pub fn clear(&self) {
        for shard in self.shards.iter() {
            let mut map = shard.lock();
            self.release(map.len());
            map.clear();
        }
    }

    /// Get the number of entries in this tracker.
    pub fn num_entries(&self) -> u32 {
        self.len.load(Ordering::Acquire)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.shard(key).lock().contains_key(key)
    }

    /// Whether `key` maps to `conn`. Unlike [`Self::get`] this does
    /// not refresh the entry.
    pub fn holds(&self, key: &K, conn: &Arc<V>) -> bool {
        self.shard(key)
            .lock()
            .get(key)
            .is_some_and(|e| Arc::ptr_eq(&e.conn, conn))
    }

    /// The hit count of `key`, without counting this lookup.
    pub fn hits(&self, key: &K) -> Option<u64> {
        self.shard(key).lock().get(key).map(|e| e.hits)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn limit(&self) -> NonZeroU32 {
        self.limit
    }

    pub fn ttl(&self) -> Ttl {
        self.ttl
    }
}
