//! URL resolver and prober
//!
//! Turns a logical, possibly indirect source URL into a final URL plus what
//! the server says about it (content type, range support, disposition), so
//! the decode session can decide between streaming and caching to disk.

use crate::net::http::{HttpClient, HttpRequest, HttpResponse};
use crate::net::scrape::{extract_media_url, is_html_content_type, read_html_prefix};
use crate::utils::error::{CollinsError, Result};
use crate::utils::Liveness;
use log::{debug, warn};
use std::sync::Arc;
use std::time::Duration;

/// Redirect hops followed by the probe and the redirect walk
pub const MAX_PROBE_REDIRECTS: usize = 5;

/// Landing pages followed while resolving
const MAX_SCRAPE_HOPS: usize = 2;

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const UNRANGED_RETRY_TIMEOUT: Duration = Duration::from_secs(8);

/// What the server reported for a probed URL
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeResult {
    /// URL after redirects
    pub final_url: String,

    pub content_type: Option<String>,

    /// Status 206, or `Accept-Ranges: bytes`
    pub supports_range: bool,

    pub is_http: bool,

    pub content_disposition: Option<String>,

    /// Final status code
    pub status: u16,
}

impl ProbeResult {
    fn bare(final_url: String, status: u16, content_type: Option<String>) -> Self {
        Self {
            final_url,
            content_type,
            supports_range: false,
            is_http: true,
            content_disposition: None,
            status,
        }
    }

    fn from_response(final_url: String, response: &HttpResponse) -> Self {
        let supports_range = response.status == 206
            || response
                .header("accept-ranges")
                .map(|v| v.to_ascii_lowercase().contains("bytes"))
                .unwrap_or(false);

        Self {
            final_url,
            content_type: response.content_type().map(str::to_string),
            supports_range,
            is_http: true,
            content_disposition: response.header("content-disposition").map(str::to_string),
            status: response.status,
        }
    }

    /// Server answered with an error status
    pub fn is_error(&self) -> bool {
        self.status >= 400
    }

    pub fn is_html(&self) -> bool {
        is_html_content_type(self.content_type.as_deref())
    }

    /// Content type names an MP4 container
    pub fn is_mp4(&self) -> bool {
        self.content_type
            .as_deref()
            .map(|ct| ct.to_ascii_lowercase().contains("video/mp4"))
            .unwrap_or(false)
    }

    /// Whether the source must be downloaded to disk before decoding
    ///
    /// Streaming is kept only for seekable plain video responses.
    pub fn needs_disk_cache(&self) -> bool {
        if !self.is_http {
            return false;
        }
        if is_dropbox_download(&self.final_url) || !self.supports_range {
            return true;
        }
        if let Some(ct) = self.content_type.as_deref().map(str::to_ascii_lowercase) {
            if ct.starts_with("text/html") {
                return true;
            }
            if !ct.starts_with("video/") && !ct.starts_with("text/") {
                return true;
            }
        }
        self.content_disposition
            .as_deref()
            .map(|cd| !cd.trim().is_empty())
            .unwrap_or(false)
    }
}

/// Drop everything from the first `#`
pub fn strip_fragment(url: &str) -> &str {
    match url.find('#') {
        Some(i) => &url[..i],
        None => url,
    }
}

pub fn is_http(url: &str) -> bool {
    let lower = url.trim_start().get(..8).unwrap_or("").to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

/// Dropbox links that serve the file directly
pub fn is_dropbox_download(url: &str) -> bool {
    let u = url.trim().to_ascii_lowercase();
    if !is_http(&u) {
        return false;
    }
    u.contains("dropboxusercontent.com")
        || (u.contains("dropbox.com") && (u.contains("dl=1") || u.contains("raw=1")))
}

/// Resolve a (possibly relative) Location header against the current URL
pub fn join_location(base: &str, location: &str) -> Option<String> {
    let base = url::Url::parse(base).ok()?;
    base.join(location.trim()).ok().map(|u| u.to_string())
}

/// Redirect-following prober over an [`HttpClient`]
pub struct Resolver {
    http: Arc<dyn HttpClient>,
}

impl Resolver {
    pub fn new(http: Arc<dyn HttpClient>) -> Self {
        Self { http }
    }

    pub fn http(&self) -> &Arc<dyn HttpClient> {
        &self.http
    }

    /// Walk redirects with plain GETs
    ///
    /// Returns the final URL only when it differs from the input; `None` on
    /// auth rejection, transport failure or a non-HTTP input.
    pub fn resolve_redirects(&self, url: &str, live: &dyn Liveness) -> Option<String> {
        let start = url.trim();
        if !is_http(start) {
            return None;
        }

        let mut current = start.to_string();
        for _ in 0..MAX_PROBE_REDIRECTS {
            if !live.is_live() {
                return None;
            }
            let response = match self.http.get(&HttpRequest::get(&current).timeout(PROBE_TIMEOUT)) {
                Ok(r) => r,
                Err(e) => {
                    debug!("Redirect walk failed at {}: {}", current, e);
                    return None;
                }
            };

            if response.is_redirect() {
                match response.location().and_then(|loc| join_location(&current, loc)) {
                    Some(next) => {
                        current = next;
                        continue;
                    }
                    None => break,
                }
            }
            if matches!(response.status, 401 | 403) {
                return None;
            }
            break;
        }

        (current != start).then_some(current)
    }

    /// Ranged probe with redirect following
    ///
    /// `None` means the URL could not be probed at all (not HTTP, transport
    /// failure, redirect chain too long).
    pub fn probe(&self, url: &str, live: &dyn Liveness) -> Option<ProbeResult> {
        let start = strip_fragment(url.trim());
        if !is_http(start) {
            return None;
        }

        let mut current = start.to_string();
        for _ in 0..MAX_PROBE_REDIRECTS {
            if !live.is_live() {
                return None;
            }

            let ranged = HttpRequest::get(&current).range("bytes=0-1").timeout(PROBE_TIMEOUT);
            let mut response = match self.http.get(&ranged) {
                Ok(r) => r,
                Err(e) => {
                    debug!("Probe failed for {}: {}", current, e);
                    return None;
                }
            };

            // Some hosts reject ranged probes but serve plain GETs
            if matches!(response.status, 401 | 403 | 416) {
                let plain = HttpRequest::get(&current).timeout(UNRANGED_RETRY_TIMEOUT);
                response = match self.http.get(&plain) {
                    Ok(r) => r,
                    Err(e) => {
                        debug!("Unranged probe failed for {}: {}", current, e);
                        return None;
                    }
                };
            }

            if response.is_redirect() {
                match response.location().and_then(|loc| join_location(&current, loc)) {
                    Some(next) => {
                        current = next;
                        continue;
                    }
                    None => return Some(ProbeResult::bare(current, response.status, None)),
                }
            }

            if !(200..400).contains(&response.status) {
                let content_type = response.content_type().map(str::to_string);
                return Some(ProbeResult::bare(current, response.status, content_type));
            }

            return Some(ProbeResult::from_response(current, &response));
        }

        warn!("Too many redirects while probing {}", start);
        None
    }

    /// Redirect walk, probe, and landing-page scraping
    ///
    /// An HTML answer is scanned for a direct media link which is then probed
    /// in turn. Returns `None` when nothing playable can be located, in which
    /// case callers fall back to a raw disk-cache download.
    pub fn resolve(&self, url: &str, live: &dyn Liveness) -> Option<ProbeResult> {
        let mut target = self
            .resolve_redirects(url, live)
            .unwrap_or_else(|| strip_fragment(url.trim()).to_string());

        for _ in 0..=MAX_SCRAPE_HOPS {
            let probe = self.probe(&target, live)?;
            if probe.is_error() || !probe.is_html() {
                return Some(probe);
            }

            match self.scrape_media_url(&probe.final_url, live) {
                Some(candidate) if candidate != probe.final_url => {
                    debug!("Landing page {} points at {}", probe.final_url, candidate);
                    target = candidate;
                }
                _ => {
                    debug!("No media link found on {}", probe.final_url);
                    return None;
                }
            }
        }

        None
    }

    /// [`Resolver::resolve`], failing when nothing answers or the answer is an error status
    pub fn resolve_reachable(&self, url: &str, live: &dyn Liveness) -> Result<ProbeResult> {
        let probe = self
            .resolve(url, live)
            .ok_or_else(|| CollinsError::Resolve(format!("Nothing playable found at {}", url)))?;
        if probe.is_error() {
            return Err(CollinsError::Resolve(format!("HTTP {} from {}", probe.status, probe.final_url)));
        }
        Ok(probe)
    }

    /// Fetch a landing page and extract a media link from its first slice
    pub fn scrape_media_url(&self, page_url: &str, live: &dyn Liveness) -> Option<String> {
        if !live.is_live() {
            return None;
        }
        let mut response = self
            .http
            .get(&HttpRequest::get(page_url).timeout(UNRANGED_RETRY_TIMEOUT))
            .ok()?;
        if !response.is_success() {
            return None;
        }
        let html = read_html_prefix(response.body.as_mut());
        extract_media_url(&html)
    }
}
