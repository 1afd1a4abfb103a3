//! Resolved stream metadata, shared across screens
//!
//! Expiry is checked by the reader; there is no background sweeper.

use dashmap::DashMap;
use std::path::Path;
use std::time::{Duration, Instant};

/// What a previous attempt learned about a logical URL
#[derive(Debug, Clone, PartialEq)]
pub struct CachedMeta {
    /// Resolved stream URL, or path of the local cache file
    pub source: String,

    /// `source` is a local file
    pub is_local: bool,

    /// Demuxer hint such as `mp4`
    pub container_hint: Option<String>,

    pub width: u32,
    pub height: u32,
    pub fps: f64,

    /// Duration in milliseconds, 0 when unknown
    pub duration_ms: i64,
}

struct Entry {
    meta: CachedMeta,
    stored_at: Instant,
}

/// TTL map keyed by logical URL
pub struct MetaCache {
    ttl: Duration,
    entries: DashMap<String, Entry>,
}

impl MetaCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: DashMap::new(),
        }
    }

    /// Fresh entry for `key`
    ///
    /// Expired entries, and local entries whose file has gone, are removed.
    pub fn get(&self, key: &str) -> Option<CachedMeta> {
        let usable = {
            let entry = self.entries.get(key)?;
            let fresh = entry.stored_at.elapsed() < self.ttl;
            let present = !entry.meta.is_local || Path::new(&entry.meta.source).exists();
            (fresh && present).then(|| entry.meta.clone())
        };

        if usable.is_none() {
            self.entries.remove(key);
        }
        usable
    }

    pub fn put(&self, key: &str, meta: CachedMeta) {
        self.entries.insert(
            key.to_string(),
            Entry {
                meta,
                stored_at: Instant::now(),
            },
        );
    }

    pub fn invalidate(&self, key: &str) {
        self.entries.remove(key);
    }

    /// Drop every entry that points at a local file
    pub fn invalidate_local(&self) {
        self.entries.retain(|_, e| !e.meta.is_local);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
