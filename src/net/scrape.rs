//! HTML landing-page handling
//!
//! Hosting sites often answer a share link with an HTML page instead of the
//! media itself. These helpers detect such pages and dig a direct media link
//! out of them.

use std::io::Read;

/// Upper bound of HTML text scanned for a media link
pub const MAX_HTML_SCAN_BYTES: usize = 256 * 1024;

/// Longest candidate URL accepted from a page
const MAX_CANDIDATE_LEN: usize = 2048;

/// Bytes inspected when sniffing a payload for markup
pub const SNIFF_BYTES: usize = 512;

const MEDIA_EXTENSIONS: [&str; 4] = [".mp4", ".webm", ".mkv", ".mov"];
const HTML_MARKERS: [&str; 4] = ["<html", "<!doctype", "<head", "<body"];
const SHORT_LINK_HOSTS: [&str; 2] = ["surl.lu", "surl.li"];

/// Whether the leading bytes of a payload are an HTML document
pub fn looks_like_html(bytes: &[u8]) -> bool {
    let head = &bytes[..bytes.len().min(SNIFF_BYTES)];
    let text = String::from_utf8_lossy(head).to_ascii_lowercase();
    HTML_MARKERS.iter().any(|marker| text.contains(marker))
}

/// Whether a content type denotes an HTML page
pub fn is_html_content_type(content_type: Option<&str>) -> bool {
    content_type
        .map(|ct| ct.trim().to_ascii_lowercase().starts_with("text/html"))
        .unwrap_or(false)
}

/// Link shorteners whose pages must always be scraped
pub fn is_short_link_host(url: &str) -> bool {
    url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_ascii_lowercase()))
        .map(|host| SHORT_LINK_HOSTS.iter().any(|s| host == *s || host.ends_with(&format!(".{}", s))))
        .unwrap_or(false)
}

/// Read at most [`MAX_HTML_SCAN_BYTES`] of a body as text
pub fn read_html_prefix(body: &mut dyn Read) -> String {
    let mut buf = Vec::with_capacity(16 * 1024);
    let _ = (&mut *body).take(MAX_HTML_SCAN_BYTES as u64).read_to_end(&mut buf);
    String::from_utf8_lossy(&buf).into_owned()
}

/// Find the most likely direct media URL inside an HTML page
///
/// The first candidate naming a media file extension wins; otherwise the last
/// Dropbox link forced to download (`dl=1` / `raw=1`) is returned.
pub fn extract_media_url(html: &str) -> Option<String> {
    let mut best = None;
    let mut from = 0;

    while let Some(offset) = html[from..].find("http") {
        let start = from + offset;
        let end = html[start..]
            .find(|c: char| c == '"' || c == '\'' || c == '<' || c.is_whitespace())
            .map(|e| start + e)
            .unwrap_or(html.len());

        let candidate = html[start..end]
            .replace("&amp;", "&")
            .trim_end_matches([')', ']', '}', '.', ',', ';'])
            .to_string();

        if !candidate.is_empty() && candidate.len() <= MAX_CANDIDATE_LEN {
            let lower = candidate.to_ascii_lowercase();
            if MEDIA_EXTENSIONS.iter().any(|ext| lower.contains(ext)) {
                return Some(candidate);
            }
            if lower.contains("dropbox.com") && (lower.contains("dl=1") || lower.contains("raw=1")) {
                best = Some(candidate);
            }
        }

        from = end.max(start + 4);
        if from >= html.len() {
            break;
        }
    }

    best
}
