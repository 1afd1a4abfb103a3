//! Content-addressed disk cache and the metadata TTL cache
//!
//! Sources that cannot be streamed (no range support, forced downloads,
//! landing pages) are fetched once into a shared cache directory keyed by the
//! SHA-256 of their logical URL.

pub mod disk;
pub mod integrity;
pub mod meta;

pub use disk::{cache_key, guess_extension, CacheInfo, DiskCache};
pub use meta::{CachedMeta, MetaCache};

use serde::Serialize;
use std::path::PathBuf;

const MIB: u64 = 1024 * 1024;

/// Progress of a running download
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DownloadProgress {
    pub downloaded_bytes: u64,

    /// Declared length, if the server sent one
    pub total_bytes: Option<u64>,
}

impl DownloadProgress {
    /// Completion in percent, when the total is known
    pub fn percent(&self) -> Option<u8> {
        self.total_bytes
            .filter(|t| *t > 0)
            .map(|t| ((self.downloaded_bytes.min(t) * 100) / t) as u8)
    }

    pub fn downloaded_mib(&self) -> u64 {
        self.downloaded_bytes / MIB
    }

    pub fn total_mib(&self) -> Option<u64> {
        self.total_bytes.map(|t| t / MIB)
    }
}

/// Receives download lifecycle events
pub trait DownloadListener: Sync {
    fn on_download_start(&self) {}

    fn on_download_progress(&self, _progress: DownloadProgress) {}

    fn on_download_complete(&self) {}
}

/// Listener that ignores everything
impl DownloadListener for () {}

/// A finalized cache entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedFile {
    pub path: PathBuf,
    pub bytes: u64,
}
