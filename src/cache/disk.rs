//! Disk cache manager
//!
//! Entries live in one flat directory as `<sha256(key)><ext>`; a download in
//! flight is `<sha256(key)>.part` and is never served. All work for one key is
//! serialized by a per-hash lock, unrelated keys proceed in parallel.

use crate::cache::integrity;
use crate::cache::{CachedFile, DownloadListener, DownloadProgress};
use crate::net::http::{HttpClient, HttpRequest, HttpResponse};
use crate::net::resolver::join_location;
use crate::net::scrape::{
    extract_media_url, is_html_content_type, is_short_link_host, looks_like_html, read_html_prefix, SNIFF_BYTES,
};
use crate::utils::config::CacheConfig;
use crate::utils::error::{CollinsError, IntoCollinsError, Result};
use crate::utils::Liveness;
use dashmap::DashMap;
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

/// Redirect hops followed while downloading
pub const MAX_DOWNLOAD_REDIRECTS: usize = 8;

const CHUNK_BYTES: usize = 64 * 1024;
const PROGRESS_STEP_BYTES: u64 = 10 * 1024 * 1024;
const PART_POLL: Duration = Duration::from_secs(1);
const LOCK_POLL: Duration = Duration::from_millis(250);
const STALE_PART_AGE: Duration = Duration::from_secs(60);
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Cache file stem for a logical key
pub fn cache_key(key: &str) -> String {
    hex::encode(Sha256::digest(key.trim().as_bytes()))
}

/// File extension (with dot) for a download
pub fn guess_extension(content_type: Option<&str>, url: &str) -> String {
    if let Some(ct) = content_type.map(str::to_ascii_lowercase) {
        let known = [
            ("video/mp4", ".mp4"),
            ("video/webm", ".webm"),
            ("matroska", ".mkv"),
            ("quicktime", ".mov"),
        ];
        if let Some((_, ext)) = known.iter().find(|(needle, _)| ct.contains(needle)) {
            return ext.to_string();
        }
    }

    url::Url::parse(url)
        .ok()
        .and_then(|u| {
            let name = u.path_segments()?.next_back()?.to_string();
            let (_, ext) = name.rsplit_once('.')?;
            let valid = (1..=5).contains(&ext.len()) && ext.chars().all(|c| c.is_ascii_alphanumeric());
            valid.then(|| format!(".{}", ext.to_ascii_lowercase()))
        })
        .unwrap_or_else(|| ".dat".to_string())
}

/// Snapshot of the cache directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheInfo {
    pub directory: PathBuf,
    pub total_bytes: u64,

    /// Finalized entries only
    pub file_count: usize,

    /// Free space on the volume holding the cache, if it could be determined
    pub free_bytes: Option<u64>,
}

struct Entry {
    path: PathBuf,
    bytes: u64,
    modified: SystemTime,
}

/// Shared on-disk cache
pub struct DiskCache {
    dir: PathBuf,
    max_bytes: u64,
    cooldown: Duration,
    wait_for_part: Duration,
    http: Arc<dyn HttpClient>,
    locks: DashMap<String, Arc<Mutex<()>>>,
    cooldowns: DashMap<String, Instant>,
}

impl DiskCache {
    pub fn new(config: &CacheConfig, http: Arc<dyn HttpClient>) -> Self {
        Self {
            dir: config.cache_dir(),
            max_bytes: config.max_bytes,
            cooldown: Duration::from_millis(config.failure_cooldown_ms),
            wait_for_part: Duration::from_secs(config.wait_for_part_secs),
            http,
            locks: DashMap::new(),
            cooldowns: DashMap::new(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    /// Return a valid local copy of `key`, downloading it from `download_url` if needed
    ///
    /// `None` covers every failure: cooldown active, session superseded,
    /// bad status, HTML payload, oversize, corrupt container or I/O error.
    pub fn ensure_cached(
        &self,
        key: &str,
        download_url: &str,
        listener: &dyn DownloadListener,
        live: &dyn Liveness,
    ) -> Option<CachedFile> {
        let hash = cache_key(key);
        if self.in_cooldown(&hash) {
            debug!("Cache download for {} suppressed by cooldown", key);
            return None;
        }

        if let Err(e) = fs::create_dir_all(&self.dir) {
            warn!("Cannot create cache directory {}: {}", self.dir.display(), e);
            return None;
        }

        let lock = self.lock_for(&hash);
        let result = self.ensure_cached_locked(&lock, &hash, key, download_url, listener, live);
        self.release_lock(&hash, lock);
        result
    }

    fn ensure_cached_locked(
        &self,
        lock: &Mutex<()>,
        hash: &str,
        key: &str,
        download_url: &str,
        listener: &dyn DownloadListener,
        live: &dyn Liveness,
    ) -> Option<CachedFile> {
        let started = Instant::now();
        let _guard = loop {
            if let Some(guard) = lock.try_lock_for(LOCK_POLL) {
                break guard;
            }
            if !live.is_live() || started.elapsed() >= self.wait_for_part {
                return None;
            }
        };

        let part = self.dir.join(format!("{}.part", hash));
        if !self.wait_for_part(&part, live) {
            return None;
        }

        if let Some(existing) = self.find_existing(hash) {
            if integrity::is_valid_cache_file(&existing) {
                touch(&existing);
                self.evict(Some(&existing));
                let bytes = fs::metadata(&existing).map(|m| m.len()).unwrap_or(0);
                info!("Cache hit for {} ({})", key, existing.display());
                return Some(CachedFile { path: existing, bytes });
            }
            warn!("Discarding invalid cache entry {}", existing.display());
            let _ = fs::remove_file(&existing);
        }

        if !live.is_live() {
            return None;
        }

        info!("Downloading {} into cache", download_url);
        listener.on_download_start();
        match self.download(download_url, &part, listener, live) {
            Ok((path, bytes)) => {
                self.evict(Some(&path));
                listener.on_download_complete();
                info!("Cached {} ({} bytes)", path.display(), bytes);
                Some(CachedFile { path, bytes })
            }
            Err(CollinsError::Superseded) => {
                let _ = fs::remove_file(&part);
                debug!("Download of {} abandoned by its session", download_url);
                None
            }
            Err(e) => {
                let _ = fs::remove_file(&part);
                warn!("Download of {} failed: {}", download_url, e);
                self.cooldowns.insert(hash.to_string(), Instant::now());
                None
            }
        }
    }

    /// Existing finalized entry for `key`, without validation
    pub fn find_cached(&self, key: &str) -> Option<PathBuf> {
        self.find_existing(&cache_key(key))
    }

    pub fn is_cooling_down(&self, key: &str) -> bool {
        self.in_cooldown(&cache_key(key))
    }

    pub fn clear_cooldown(&self, key: &str) {
        self.cooldowns.remove(&cache_key(key));
    }

    /// Delete a cache file that failed to open and forget its cooldown
    pub fn discard(&self, path: &Path) {
        if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
            self.cooldowns.remove(stem);
        }
        if self.delete_file(path) {
            info!("Removed unreadable cache file {}", path.display());
        }
    }

    /// Delete entries, oldest modification first, until under the ceiling
    ///
    /// `keep` is never deleted. Returns the number of bytes freed.
    pub fn evict(&self, keep: Option<&Path>) -> u64 {
        let mut entries = self.entries();
        let mut total: u64 = entries.iter().map(|e| e.bytes).sum();
        if total <= self.max_bytes {
            return 0;
        }

        entries.sort_by_key(|e| e.modified);
        let mut freed = 0;
        for entry in entries {
            if total <= self.max_bytes {
                break;
            }
            if keep == Some(entry.path.as_path()) {
                continue;
            }
            match fs::remove_file(&entry.path) {
                Ok(()) => {
                    total -= entry.bytes;
                    freed += entry.bytes;
                    info!("Evicted {} ({} bytes)", entry.path.display(), entry.bytes);
                }
                Err(e) => warn!("Failed to evict {}: {}", entry.path.display(), e),
            }
        }
        freed
    }

    pub fn info(&self) -> CacheInfo {
        let entries = self.entries();
        CacheInfo {
            directory: self.dir.clone(),
            total_bytes: entries.iter().map(|e| e.bytes).sum(),
            file_count: entries.len(),
            free_bytes: free_space(&self.dir),
        }
    }

    /// Delete every finalized entry and forget all cooldowns
    pub fn clear(&self) -> u64 {
        let mut freed = 0;
        for entry in self.entries() {
            match fs::remove_file(&entry.path) {
                Ok(()) => freed += entry.bytes,
                Err(e) => warn!("Failed to delete {}: {}", entry.path.display(), e),
            }
        }
        self.cooldowns.clear();
        info!("Cleared {} bytes from {}", freed, self.dir.display());
        freed
    }

    /// Delete one file, provided it sits directly in the cache directory
    pub fn delete_file(&self, path: &Path) -> bool {
        let (Ok(dir), Ok(target)) = (self.dir.canonicalize(), path.canonicalize()) else {
            return false;
        };
        if target.parent() != Some(dir.as_path()) || !target.is_file() {
            warn!("Refusing to delete {} outside the cache", path.display());
            return false;
        }
        fs::remove_file(&target).is_ok()
    }

    pub fn open_in_file_browser(&self) -> Result<()> {
        fs::create_dir_all(&self.dir)?;

        let program = if cfg!(target_os = "windows") {
            "explorer"
        } else if cfg!(target_os = "macos") {
            "open"
        } else {
            "xdg-open"
        };

        std::process::Command::new(program)
            .arg(&self.dir)
            .spawn()
            .map(|_| ())
            .cache_err("Failed to open cache directory")
    }

    fn in_cooldown(&self, hash: &str) -> bool {
        let active = match self.cooldowns.get(hash) {
            Some(failed_at) => failed_at.elapsed() < self.cooldown,
            None => return false,
        };
        if !active {
            self.cooldowns.remove(hash);
        }
        active
    }

    fn lock_for(&self, hash: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(hash.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop the per-hash lock once no other caller holds or awaits it
    fn release_lock(&self, hash: &str, lock: Arc<Mutex<()>>) {
        drop(lock);
        self.locks.remove_if(hash, |_, l| Arc::strong_count(l) == 1);
    }

    /// Wait for a foreign download of the same key to finish
    fn wait_for_part(&self, part: &Path, live: &dyn Liveness) -> bool {
        let deadline = Instant::now() + self.wait_for_part;
        while part.exists() {
            let age = fs::metadata(part)
                .and_then(|m| m.modified())
                .ok()
                .and_then(|t| t.elapsed().ok())
                .unwrap_or_default();
            if age >= STALE_PART_AGE {
                warn!("Removing abandoned download {}", part.display());
                let _ = fs::remove_file(part);
                break;
            }
            if !live.is_live() {
                return false;
            }
            if Instant::now() >= deadline {
                warn!("Timed out waiting for {}", part.display());
                return false;
            }
            std::thread::sleep(PART_POLL);
        }
        true
    }

    fn find_existing(&self, hash: &str) -> Option<PathBuf> {
        let bin = self.dir.join(format!("{}.bin", hash));
        if bin.is_file() {
            return Some(bin);
        }

        let prefix = format!("{}.", hash);
        fs::read_dir(&self.dir)
            .ok()?
            .flatten()
            .map(|e| e.path())
            .find(|p| {
                p.is_file()
                    && p.file_name()
                        .and_then(|n| n.to_str())
                        .map(|n| n.starts_with(&prefix) && !n.ends_with(".part"))
                        .unwrap_or(false)
            })
    }

    fn entries(&self) -> Vec<Entry> {
        let Ok(dir) = fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        dir.flatten()
            .filter(|e| !e.file_name().to_string_lossy().ends_with(".part"))
            .filter_map(|e| {
                let meta = e.metadata().ok()?;
                meta.is_file().then(|| Entry {
                    path: e.path(),
                    bytes: meta.len(),
                    modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
                })
            })
            .collect()
    }

    /// Fetch `url` into `part`, then validate and move it into place
    fn download(
        &self,
        url: &str,
        part: &Path,
        listener: &dyn DownloadListener,
        live: &dyn Liveness,
    ) -> Result<(PathBuf, u64)> {
        let mut current = url.trim().to_string();
        let mut referer: Option<String> = None;

        for _ in 0..=MAX_DOWNLOAD_REDIRECTS {
            if !live.is_live() {
                return Err(CollinsError::Superseded);
            }

            let mut request = HttpRequest::get(&current).timeout(DOWNLOAD_TIMEOUT);
            if let Some(r) = referer.as_deref() {
                request = request.referer(r);
            }
            let mut response = self.http.get(&request)?;

            if response.is_redirect() {
                let next = response
                    .location()
                    .and_then(|loc| join_location(&current, loc))
                    .ok_or_else(|| CollinsError::cache_error(format!("Redirect without location from {}", current)))?;
                referer = Some(std::mem::replace(&mut current, next));
                continue;
            }
            if !response.is_success() {
                return Err(CollinsError::cache_error(format!("HTTP {} for {}", response.status, current)));
            }

            if is_html_content_type(response.content_type()) || is_short_link_host(&current) {
                let html = read_html_prefix(response.body.as_mut());
                let next = extract_media_url(&html)
                    .filter(|n| *n != current)
                    .ok_or_else(|| CollinsError::cache_error(format!("No media link on page {}", current)))?;
                debug!("Following media link {} from {}", next, current);
                referer = Some(std::mem::replace(&mut current, next));
                continue;
            }

            if let Some(declared) = response.content_length() {
                if declared > self.max_bytes {
                    return Err(CollinsError::cache_error(format!(
                        "Declared size {} exceeds cache ceiling {}",
                        declared, self.max_bytes
                    )));
                }
            }

            let ext = guess_extension(response.content_type(), &current);
            let bytes = self.stream_to_file(&mut response, part, listener, live)?;

            if !integrity::validate_file(part, &ext) {
                return Err(CollinsError::cache_error(format!("Downloaded {} is not a valid container", current)));
            }

            let stem = part
                .file_stem()
                .ok_or_else(|| crate::internal_error!("part file without stem"))?;
            let dest = self.dir.join(format!("{}{}", stem.to_string_lossy(), ext));
            finalize(part, &dest)?;
            return Ok((dest, bytes));
        }

        Err(CollinsError::cache_error(format!("Too many redirects downloading {}", url)))
    }

    fn stream_to_file(
        &self,
        response: &mut HttpResponse,
        part: &Path,
        listener: &dyn DownloadListener,
        live: &dyn Liveness,
    ) -> Result<u64> {
        let total = response.content_length();
        let mut file = File::create(part)?;
        let mut buf = vec![0u8; CHUNK_BYTES];
        let mut downloaded = 0u64;
        let mut next_report = PROGRESS_STEP_BYTES;
        let mut head: Vec<u8> = Vec::with_capacity(SNIFF_BYTES);
        let mut sniffed = false;

        loop {
            if !live.is_live() {
                return Err(CollinsError::Superseded);
            }

            let n = match response.body.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(CollinsError::Network(format!("Download interrupted: {}", e))),
            };

            if !sniffed {
                let take = n.min(SNIFF_BYTES - head.len());
                head.extend_from_slice(&buf[..take]);
                if head.len() >= SNIFF_BYTES {
                    sniffed = true;
                    reject_html(&head)?;
                }
            }

            downloaded += n as u64;
            if downloaded > self.max_bytes {
                return Err(CollinsError::cache_error(format!(
                    "Download exceeds cache ceiling {}",
                    self.max_bytes
                )));
            }
            file.write_all(&buf[..n])?;

            if downloaded >= next_report {
                listener.on_download_progress(DownloadProgress {
                    downloaded_bytes: downloaded,
                    total_bytes: total,
                });
                while next_report <= downloaded {
                    next_report += PROGRESS_STEP_BYTES;
                }
            }
        }

        if !sniffed {
            reject_html(&head)?;
        }
        file.flush()?;
        if downloaded == 0 {
            return Err(CollinsError::cache_error("Empty download"));
        }
        Ok(downloaded)
    }
}

fn reject_html(head: &[u8]) -> Result<()> {
    if looks_like_html(head) {
        return Err(CollinsError::cache_error("Server returned an HTML page instead of media"));
    }
    Ok(())
}

fn finalize(part: &Path, dest: &Path) -> Result<()> {
    if dest.exists() {
        fs::remove_file(dest)?;
    }
    if let Err(e) = fs::rename(part, dest) {
        debug!("Rename of {} failed ({}), copying instead", part.display(), e);
        fs::copy(part, dest)?;
        fs::remove_file(part)?;
    }
    Ok(())
}

/// Mark an entry as recently used
fn touch(path: &Path) {
    let result = File::options()
        .write(true)
        .open(path)
        .and_then(|f| f.set_modified(SystemTime::now()));
    if let Err(e) = result {
        debug!("Could not touch {}: {}", path.display(), e);
    }
}

fn free_space(dir: &Path) -> Option<u64> {
    let target = dir.canonicalize().unwrap_or_else(|_| dir.to_path_buf());
    let disks = sysinfo::Disks::new_with_refreshed_list();
    disks
        .list()
        .iter()
        .filter(|d| target.starts_with(d.mount_point()))
        .max_by_key(|d| d.mount_point().as_os_str().len())
        .map(|d| d.available_space())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::test_support::mp4_bytes;
    use crate::utils::AlwaysLive;
    use std::collections::HashMap;
    use std::io::Cursor;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone)]
    struct Route {
        status: u16,
        headers: Vec<(String, String)>,
        body: Vec<u8>,
        chunk: usize,
    }

    /// Body that hands out at most `chunk` bytes per read
    struct Trickle {
        inner: Cursor<Vec<u8>>,
        chunk: usize,
    }

    impl Read for Trickle {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            let n = buf.len().min(self.chunk);
            self.inner.read(&mut buf[..n])
        }
    }

    #[derive(Default)]
    struct MockHttp {
        routes: Mutex<HashMap<String, Route>>,
        calls: AtomicUsize,
        referers: Mutex<Vec<Option<String>>>,
    }

    impl MockHttp {
        fn serve(&self, url: &str, status: u16, headers: &[(&str, &str)], body: Vec<u8>) {
            self.routes.lock().insert(
                url.to_string(),
                Route {
                    status,
                    headers: headers.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
                    body,
                    chunk: usize::MAX,
                },
            );
        }

        fn serve_in_chunks(&self, url: &str, body: Vec<u8>, chunk: usize) {
            self.serve(url, 200, &[], body);
            if let Some(route) = self.routes.lock().get_mut(url) {
                route.chunk = chunk;
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl HttpClient for MockHttp {
        fn get(&self, request: &HttpRequest<'_>) -> Result<HttpResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.referers.lock().push(request.referer.map(str::to_string));
            let route = self
                .routes
                .lock()
                .get(request.url)
                .cloned()
                .ok_or_else(|| CollinsError::Network(format!("connection refused: {}", request.url)))?;
            Ok(HttpResponse {
                status: route.status,
                headers: route.headers,
                body: Box::new(Trickle {
                    inner: Cursor::new(route.body),
                    chunk: route.chunk,
                }),
            })
        }
    }

    fn cache_with(dir: &Path, max_bytes: u64, cooldown_ms: u64) -> (DiskCache, Arc<MockHttp>) {
        let http = Arc::new(MockHttp::default());
        let config = CacheConfig {
            directory: Some(dir.to_path_buf()),
            max_bytes,
            failure_cooldown_ms: cooldown_ms,
            ..CacheConfig::default()
        };
        (DiskCache::new(&config, http.clone()), http)
    }

    #[test]
    fn test_cache_key_is_stable() {
        let a = cache_key("https://a.example/v.mp4");
        assert_eq!(a, cache_key("  https://a.example/v.mp4 "));
        assert_eq!(a.len(), 64);
        assert_ne!(a, cache_key("https://a.example/w.mp4"));
    }

    #[test]
    fn test_guess_extension() {
        assert_eq!(guess_extension(Some("video/mp4"), "https://a/x"), ".mp4");
        assert_eq!(guess_extension(Some("video/x-matroska"), "https://a/x"), ".mkv");
        assert_eq!(guess_extension(Some("application/octet-stream"), "https://a/clip.WEBM?x=1"), ".webm");
        assert_eq!(guess_extension(None, "https://a/archive.toolongext"), ".dat");
        assert_eq!(guess_extension(None, "https://a/download"), ".dat");
    }

    #[test]
    fn test_download_then_reuse() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, http) = cache_with(dir.path(), 1 << 30, 10_000);
        http.serve("https://cdn.example/v", 200, &[("content-type", "video/mp4")], mp4_bytes(32 * 1024));

        let first = cache
            .ensure_cached("https://share.example/v", "https://cdn.example/v", &(), &AlwaysLive)
            .unwrap();
        assert_eq!(first.bytes, 32 * 1024);
        assert_eq!(first.path.extension().unwrap(), "mp4");
        assert!(first.path.starts_with(dir.path()));
        assert_eq!(http.calls(), 1);

        let second = cache
            .ensure_cached("https://share.example/v", "https://cdn.example/v", &(), &AlwaysLive)
            .unwrap();
        assert_eq!(second.path, first.path);
        assert_eq!(http.calls(), 1);
        assert!(!dir.path().join(format!("{}.part", cache_key("https://share.example/v"))).exists());
    }

    #[test]
    fn test_html_payload_is_rejected_and_cooled_down() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, http) = cache_with(dir.path(), 1 << 30, 10_000);
        let page = b"<!DOCTYPE html><html><body>expired</body></html>".to_vec();
        http.serve("https://cdn.example/x", 200, &[("content-type", "application/octet-stream")], page);

        assert!(cache.ensure_cached("k", "https://cdn.example/x", &(), &AlwaysLive).is_none());
        assert_eq!(http.calls(), 1);
        assert_eq!(cache.info().file_count, 0);

        assert!(cache.ensure_cached("k", "https://cdn.example/x", &(), &AlwaysLive).is_none());
        assert_eq!(http.calls(), 1);
        assert!(cache.is_cooling_down("k"));
    }

    #[test]
    fn test_cooldown_expires() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, http) = cache_with(dir.path(), 1 << 30, 50);
        http.serve("https://cdn.example/missing", 404, &[], Vec::new());

        assert!(cache.ensure_cached("k", "https://cdn.example/missing", &(), &AlwaysLive).is_none());
        assert!(cache.ensure_cached("k", "https://cdn.example/missing", &(), &AlwaysLive).is_none());
        assert_eq!(http.calls(), 1);

        std::thread::sleep(Duration::from_millis(80));
        assert!(cache.ensure_cached("k", "https://cdn.example/missing", &(), &AlwaysLive).is_none());
        assert_eq!(http.calls(), 2);
    }

    #[test]
    fn test_redirects_carry_referer() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, http) = cache_with(dir.path(), 1 << 30, 10_000);
        http.serve("https://a.example/start", 302, &[("location", "/real.mp4")], Vec::new());
        http.serve("https://a.example/real.mp4", 200, &[], mp4_bytes(16 * 1024));

        let file = cache
            .ensure_cached("k", "https://a.example/start", &(), &AlwaysLive)
            .unwrap();
        assert_eq!(file.path.extension().unwrap(), "mp4");
        assert_eq!(
            *http.referers.lock(),
            vec![None, Some("https://a.example/start".to_string())]
        );
    }

    #[test]
    fn test_landing_page_is_followed() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, http) = cache_with(dir.path(), 1 << 30, 10_000);
        let page = br#"<html><a href="https://cdn.example/file.webm">get</a></html>"#.to_vec();
        http.serve("https://share.example/p", 200, &[("content-type", "text/html")], page);
        let mut mkv = vec![0x1A, 0x45, 0xDF, 0xA3];
        mkv.extend(vec![0u8; 12 * 1024]);
        http.serve("https://cdn.example/file.webm", 200, &[("content-type", "video/webm")], mkv);

        let file = cache
            .ensure_cached("https://share.example/p", "https://share.example/p", &(), &AlwaysLive)
            .unwrap();
        assert_eq!(file.path.extension().unwrap(), "webm");
    }

    #[test]
    fn test_declared_oversize_fails_without_file() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, http) = cache_with(dir.path(), 16 * 1024, 10_000);
        http.serve(
            "https://cdn.example/big",
            200,
            &[("content-length", "999999999")],
            mp4_bytes(32 * 1024),
        );
        assert!(cache.ensure_cached("k", "https://cdn.example/big", &(), &AlwaysLive).is_none());
        assert_eq!(cache.info().total_bytes, 0);
    }

    #[test]
    fn test_streamed_oversize_fails() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, http) = cache_with(dir.path(), 16 * 1024, 10_000);
        http.serve("https://cdn.example/big", 200, &[], mp4_bytes(32 * 1024));
        assert!(cache.ensure_cached("k", "https://cdn.example/big", &(), &AlwaysLive).is_none());
        assert_eq!(cache.info().file_count, 0);
    }

    #[test]
    fn test_corrupt_entry_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, http) = cache_with(dir.path(), 1 << 30, 10_000);
        let stale = dir.path().join(format!("{}.mp4", cache_key("k")));
        std::fs::write(&stale, vec![0u8; 20 * 1024]).unwrap();
        http.serve("https://cdn.example/v.mp4", 200, &[], mp4_bytes(24 * 1024));

        let file = cache.ensure_cached("k", "https://cdn.example/v.mp4", &(), &AlwaysLive).unwrap();
        assert_eq!(file.bytes, 24 * 1024);
        assert_eq!(http.calls(), 1);
    }

    #[test]
    fn test_stale_session_does_not_cool_down() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, http) = cache_with(dir.path(), 1 << 30, 10_000);
        http.serve("https://cdn.example/v.mp4", 200, &[], mp4_bytes(16 * 1024));

        let stale = || false;
        assert!(cache.ensure_cached("k", "https://cdn.example/v.mp4", &(), &stale).is_none());
        assert_eq!(http.calls(), 0);
        assert!(!cache.is_cooling_down("k"));
    }

    #[test]
    fn test_eviction_removes_oldest_first() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, _) = cache_with(dir.path(), 100 * 1024, 10_000);
        let now = SystemTime::now();
        for (i, name) in ["a.mp4", "b.mp4", "c.mp4"].iter().enumerate() {
            let path = dir.path().join(name);
            std::fs::write(&path, vec![0u8; 40 * 1024]).unwrap();
            let f = File::options().write(true).open(&path).unwrap();
            f.set_modified(now - Duration::from_secs(100 - i as u64 * 10)).unwrap();
        }
        std::fs::write(dir.path().join("d.part"), vec![0u8; 40 * 1024]).unwrap();

        let freed = cache.evict(None);
        assert_eq!(freed, 40 * 1024);
        assert!(!dir.path().join("a.mp4").exists());
        assert!(dir.path().join("c.mp4").exists());
        assert!(dir.path().join("d.part").exists());
        assert!(cache.info().total_bytes <= cache.max_bytes());
    }

    #[test]
    fn test_html_split_across_reads_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, http) = cache_with(dir.path(), 1 << 30, 10_000);
        let mut page = b"\n\n  <!DOCTYPE html><html><body>".to_vec();
        page.extend(vec![b' '; 16 * 1024]);
        http.serve_in_chunks("https://cdn.example/slow", page, 3);

        assert!(cache.ensure_cached("k", "https://cdn.example/slow", &(), &AlwaysLive).is_none());
        assert_eq!(cache.info().file_count, 0);
        assert!(cache.is_cooling_down("k"));
    }

    #[test]
    fn test_short_reads_still_cache_media() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, http) = cache_with(dir.path(), 1 << 30, 10_000);
        http.serve_in_chunks("https://cdn.example/v.mp4", mp4_bytes(16 * 1024), 100);

        let file = cache.ensure_cached("k", "https://cdn.example/v.mp4", &(), &AlwaysLive).unwrap();
        assert_eq!(file.bytes, 16 * 1024);
    }

    #[test]
    fn test_locks_are_released_after_use() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, http) = cache_with(dir.path(), 1 << 30, 50);
        http.serve("https://cdn.example/a.mp4", 200, &[], mp4_bytes(16 * 1024));
        http.serve("https://cdn.example/gone", 404, &[], Vec::new());

        assert!(cache.ensure_cached("a", "https://cdn.example/a.mp4", &(), &AlwaysLive).is_some());
        assert!(cache.ensure_cached("a", "https://cdn.example/a.mp4", &(), &AlwaysLive).is_some());
        assert!(cache.ensure_cached("b", "https://cdn.example/gone", &(), &AlwaysLive).is_none());
        assert!(cache.locks.is_empty());
    }

    #[test]
    fn test_concurrent_requests_share_one_download() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, http) = cache_with(dir.path(), 1 << 30, 10_000);
        http.serve_in_chunks("https://cdn.example/v.mp4", mp4_bytes(256 * 1024), 16);

        let (a, b) = std::thread::scope(|scope| {
            let first = scope.spawn(|| cache.ensure_cached("k", "https://cdn.example/v.mp4", &(), &AlwaysLive));
            let second = scope.spawn(|| cache.ensure_cached("k", "https://cdn.example/v.mp4", &(), &AlwaysLive));
            (first.join().unwrap(), second.join().unwrap())
        });

        let (a, b) = (a.unwrap(), b.unwrap());
        assert_eq!(a.path, b.path);
        assert_eq!(a.bytes, 256 * 1024);
        assert_eq!(http.calls(), 1);
        assert_eq!(cache.info().file_count, 1);
        assert!(cache.locks.is_empty());
    }

    #[test]
    fn test_downloads_stay_under_ceiling() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, http) = cache_with(dir.path(), 40 * 1024, 10_000);
        let mut newest = None;
        for i in 0..4 {
            let url = format!("https://cdn.example/{}.mp4", i);
            http.serve(&url, 200, &[], mp4_bytes(16 * 1024));
            let file = cache.ensure_cached(&url, &url, &(), &AlwaysLive).unwrap();
            assert!(cache.info().total_bytes <= cache.max_bytes());
            newest = Some(file.path);
        }
        assert!(newest.unwrap().exists());
        assert_eq!(cache.info().file_count, 2);
    }

    #[test]
    fn test_admin_surface() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, _) = cache_with(dir.path(), 1 << 30, 10_000);
        std::fs::write(dir.path().join("one.mp4"), vec![1u8; 1000]).unwrap();
        std::fs::write(dir.path().join("two.webm"), vec![1u8; 500]).unwrap();
        std::fs::write(dir.path().join("three.part"), vec![1u8; 700]).unwrap();

        let info = cache.info();
        assert_eq!(info.file_count, 2);
        assert_eq!(info.total_bytes, 1500);

        let outside = tempfile::NamedTempFile::new().unwrap();
        assert!(!cache.delete_file(outside.path()));
        assert!(cache.delete_file(&dir.path().join("one.mp4")));
        assert!(!cache.delete_file(&dir.path().join("one.mp4")));

        assert_eq!(cache.clear(), 500);
        assert_eq!(cache.info().file_count, 0);
        assert!(dir.path().join("three.part").exists());
    }
}
