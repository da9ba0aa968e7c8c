//! Best-effort cache used to accelerate counter reads.
//!
//! Nothing read from a cache is authoritative. Callers treat every failure
//! as a miss.

use crate::error::Result;
use dashmap::DashMap;
use std::future::Future;
use std::time::{Duration, Instant};

/// An integer cache with per-entry expiry.
pub trait Cache: Send + Sync + 'static {
    fn get(&self, key: &str) -> impl Future<Output = Result<Option<i64>>> + Send;

    fn set(&self, key: &str, value: i64, ttl: Duration) -> impl Future<Output = Result<()>> + Send;

    /// Add `delta` to an existing entry and return the new value.
    ///
    /// Missing entries stay missing: a partial count must never be cached.
    fn incr(&self, key: &str, delta: i64) -> impl Future<Output = Result<Option<i64>>> + Send;

    fn delete(&self, key: &str) -> impl Future<Output = Result<()>> + Send;
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    value: i64,
    expires_at: Instant,
}

/// In-process cache backed by a concurrent map.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: DashMap<String, Entry>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries, including expired ones not yet evicted.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every expired entry.
    pub fn evict_expired(&self) {
        let now = Instant::now();
        self.entries.retain(|_, entry| entry.expires_at > now);
    }
}

impl Cache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<i64>> {
        let now = Instant::now();
        let entry = self.entries.get(key).map(|e| *e);
        match entry {
            Some(entry) if entry.expires_at > now => Ok(Some(entry.value)),
            Some(_) => {
                self.entries.remove_if(key, |_, e| e.expires_at <= now);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: i64, ttl: Duration) -> Result<()> {
        self.entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn incr(&self, key: &str, delta: i64) -> Result<Option<i64>> {
        let now = Instant::now();
        Ok(self
            .entries
            .get_mut(key)
            .filter(|e| e.expires_at > now)
            .map(|mut e| {
                e.value += delta;
                e.value
            }))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }
}

/// A cache that stores nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCache;

impl Cache for NoCache {
    async fn get(&self, _key: &str) -> Result<Option<i64>> {
        Ok(None)
    }

    async fn set(&self, _key: &str, _value: i64, _ttl: Duration) -> Result<()> {
        Ok(())
    }

    async fn incr(&self, _key: &str, _delta: i64) -> Result<Option<i64>> {
        Ok(None)
    }

    async fn delete(&self, _key: &str) -> Result<()> {
        Ok(())
    }
}
