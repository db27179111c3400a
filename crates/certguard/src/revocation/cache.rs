//! Revocation response caching
//!
//! [`RevocationCache`] is the read side used by augmentation: it only ever
//! hands back responses that are still time-valid. [`MemoryRevocationCache`]
//! is the in-process implementation, keyed by `(url, kind)`.
//!
//! # Thread Safety
//!
//! Storage is a `DashMap`, so the cache can be shared across verifications
//! without additional locking.

use crate::cert::RevocationKind;
use crate::config::AugmentConfig;
use async_trait::async_trait;
use dashmap::DashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Read-through lookup of cached revocation responses
#[async_trait]
pub trait RevocationCache: Send + Sync {
    /// A cached response for `(url, kind)` that is currently time-valid
    async fn time_valid_response(&self, url: &str, kind: RevocationKind) -> Option<Vec<u8>>;
}

/// Judges whether a raw response is still usable
pub type ValidityCheck = fn(&[u8], RevocationKind) -> bool;

#[derive(Debug, Clone)]
struct CachedResponse {
    body: Vec<u8>,
    cached_at: Instant,
    ttl: Duration,
    sequence: u64,
}

impl CachedResponse {
    fn is_expired(&self) -> bool {
        self.cached_at.elapsed() > self.ttl
    }
}

/// In-memory `(url, kind)` cache with TTL and oldest-first eviction
pub struct MemoryRevocationCache {
    entries: DashMap<(String, RevocationKind), CachedResponse>,
    max_entries: usize,
    ttl: Duration,
    validity: ValidityCheck,
    next_sequence: AtomicU64,
}

impl MemoryRevocationCache {
    pub fn new(max_entries: usize, ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            max_entries,
            ttl,
            validity: super::is_time_valid_now,
            next_sequence: AtomicU64::new(0),
        }
    }

    pub fn from_config(config: &AugmentConfig) -> Self {
        Self::new(config.max_cache_entries, config.cache_ttl())
    }

    /// Replace the validity judgement used by [`RevocationCache::time_valid_response`]
    pub fn with_validity(mut self, validity: ValidityCheck) -> Self {
        self.validity = validity;
        self
    }

    /// Store `body`, evicting the oldest entry if the cache is full
    pub fn insert(&self, url: &str, kind: RevocationKind, body: Vec<u8>) {
        let key = (url.to_string(), kind);
        if self.max_entries == 0 {
            return;
        }
        if !self.entries.contains_key(&key) && self.entries.len() >= self.max_entries {
            self.evict_oldest();
        }

        let cached = CachedResponse {
            body,
            cached_at: Instant::now(),
            ttl: self.ttl,
            sequence: self.next_sequence.fetch_add(1, Ordering::Relaxed),
        };
        self.entries.insert(key, cached);
    }

    /// Raw cached body within TTL, without judging its contents
    ///
    /// This is what a cache-preferring fetch is served from; the caller
    /// decides whether the response is still usable.
    pub fn peek(&self, url: &str, kind: RevocationKind) -> Option<Vec<u8>> {
        let key = (url.to_string(), kind);
        let entry = self.entries.get(&key)?;
        if entry.is_expired() {
            drop(entry);
            self.entries.remove(&key);
            return None;
        }
        Some(entry.body.clone())
    }

    /// Cached body that is within TTL and passes the validity check
    pub fn lookup(&self, url: &str, kind: RevocationKind) -> Option<Vec<u8>> {
        let body = self.peek(url, kind)?;
        if (self.validity)(&body, kind) {
            Some(body)
        } else {
            debug!(url, %kind, "Cached revocation response is stale");
            None
        }
    }

    fn evict_oldest(&self) {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|entry| entry.value().sequence)
            .map(|entry| entry.key().clone());

        if let Some(key) = oldest {
            self.entries.remove(&key);
        }
    }

    /// Remove entries past their TTL; returns the number removed
    pub fn evict_expired(&self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, cached| !cached.is_expired());
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}

impl fmt::Debug for MemoryRevocationCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryRevocationCache")
            .field("entries", &self.entries.len())
            .field("max_entries", &self.max_entries)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl RevocationCache for MemoryRevocationCache {
    async fn time_valid_response(&self, url: &str, kind: RevocationKind) -> Option<Vec<u8>> {
        self.lookup(url, kind)
    }
}
