//! Integration tests for URL resolution and the disk cache
//!
//! These tests run the real reqwest client against a local server and verify:
//! - Redirect walking and landing-page scraping
//! - Whole-file downloads, cache hits and validation
//! - Failure cooldowns

use anyhow::Result;
use collins_screen::cache::DiskCache;
use collins_screen::net::{ReqwestClient, Resolver};
use collins_screen::utils::AlwaysLive;
use collins_screen_integration_tests::{mp4_bytes, Route, TestFixture, TestServer};
use std::sync::Arc;
use std::time::Duration;

fn client() -> Arc<ReqwestClient> {
    Arc::new(ReqwestClient::new("collins-screen-tests"))
}

#[test]
fn test_streamable_mp4_is_not_cached() -> Result<()> {
    let server = TestServer::start()?;
    server.route(
        "/clip.mp4",
        Route::ok("video/mp4", mp4_bytes(16 * 1024)).header("Accept-Ranges", "bytes"),
    );

    let resolver = Resolver::new(client());
    let probe = resolver.resolve(&server.url("/clip.mp4"), &AlwaysLive).expect("probe");

    assert_eq!(probe.status, 200);
    assert!(probe.is_mp4());
    assert!(probe.supports_range);
    assert!(!probe.needs_disk_cache());
    Ok(())
}

#[test]
fn test_redirect_chain_and_landing_page() -> Result<()> {
    let server = TestServer::start()?;
    let media = server.url("/files/movie.mp4");
    server.route("/short", Route::redirect("/share"));
    server.route(
        "/share",
        Route::ok(
            "text/html; charset=utf-8",
            format!("<html><body><video src=\"{}\"></video></body></html>", media).into_bytes(),
        ),
    );
    server.route("/files/movie.mp4", Route::ok("application/octet-stream", mp4_bytes(16 * 1024)));

    let resolver = Resolver::new(client());
    let probe = resolver.resolve(&server.url("/short"), &AlwaysLive).expect("probe");

    assert_eq!(probe.final_url, media);
    assert!(!probe.is_html());
    // No range support and an opaque content type
    assert!(probe.needs_disk_cache());
    Ok(())
}

#[test]
fn test_error_status_is_reported() -> Result<()> {
    let server = TestServer::start()?;
    let resolver = Resolver::new(client());

    let probe = resolver.resolve(&server.url("/missing.mp4"), &AlwaysLive).expect("probe");
    assert_eq!(probe.status, 404);
    assert!(probe.is_error());
    Ok(())
}

#[test]
fn test_download_then_cache_hit() -> Result<()> {
    let fixture = TestFixture::new()?;
    let server = TestServer::start()?;
    let body = mp4_bytes(20 * 1024);
    server.route(
        "/files/movie.mp4",
        Route::ok("application/octet-stream", body.clone()).header("Content-Disposition", "attachment"),
    );

    let cache = DiskCache::new(&fixture.config().cache, client());
    let url = server.url("/files/movie.mp4");

    let first = cache.ensure_cached(&url, &url, &(), &AlwaysLive).expect("download");
    assert_eq!(first.bytes, body.len() as u64);
    assert_eq!(first.path.extension().and_then(|e| e.to_str()), Some("mp4"));
    assert_eq!(std::fs::read(&first.path)?, body);
    assert_eq!(server.hits("/files/movie.mp4"), 1);

    let second = cache.ensure_cached(&url, &url, &(), &AlwaysLive).expect("hit");
    assert_eq!(second.path, first.path);
    assert_eq!(server.hits("/files/movie.mp4"), 1);

    let info = cache.info();
    assert_eq!(info.file_count, 1);
    assert_eq!(info.total_bytes, body.len() as u64);

    assert_eq!(cache.clear(), body.len() as u64);
    assert!(!first.path.exists());
    Ok(())
}

#[test]
fn test_html_payload_is_rejected_and_cooled_down() -> Result<()> {
    let fixture = TestFixture::new()?;
    let server = TestServer::start()?;
    server.route(
        "/expired",
        Route::ok("application/octet-stream", b"<!DOCTYPE html><html><body>Link expired</body></html>".to_vec()),
    );

    let cache = DiskCache::new(&fixture.config().cache, client());
    let url = server.url("/expired");

    assert!(cache.ensure_cached(&url, &url, &(), &AlwaysLive).is_none());
    assert_eq!(server.hits("/expired"), 1);
    assert!(cache.is_cooling_down(&url));

    // Suppressed without touching the network
    assert!(cache.ensure_cached(&url, &url, &(), &AlwaysLive).is_none());
    assert_eq!(server.hits("/expired"), 1);

    cache.clear_cooldown(&url);
    assert!(cache.ensure_cached(&url, &url, &(), &AlwaysLive).is_none());
    assert_eq!(server.hits("/expired"), 2);

    let leftovers: Vec<_> = std::fs::read_dir(fixture.cache_dir())?.collect();
    assert!(leftovers.is_empty(), "no partial files may remain");
    Ok(())
}

#[test]
fn test_truncated_container_is_not_kept() -> Result<()> {
    let fixture = TestFixture::new()?;
    let server = TestServer::start()?;
    // Large enough, but the moov index is missing
    let mut body = mp4_bytes(16 * 1024);
    body[28..32].copy_from_slice(b"free");
    server.route("/broken.mp4", Route::ok("video/mp4", body));

    let cache = DiskCache::new(&fixture.config().cache, client());
    let url = server.url("/broken.mp4");

    assert!(cache.ensure_cached(&url, &url, &(), &AlwaysLive).is_none());
    assert_eq!(cache.info().file_count, 0);
    Ok(())
}

#[test]
fn test_downloads_keep_cache_under_ceiling() -> Result<()> {
    let fixture = TestFixture::new()?;
    let server = TestServer::start()?;
    let mut config = fixture.config();
    config.cache.max_bytes = 40 * 1024;
    let cache = DiskCache::new(&config.cache, client());

    let mut newest = None;
    for i in 0..4 {
        let path = format!("/clip{}.mp4", i);
        server.route(&path, Route::ok("video/mp4", mp4_bytes(16 * 1024)));
        let url = server.url(&path);
        let file = cache.ensure_cached(&url, &url, &(), &AlwaysLive).expect("download");
        assert!(cache.info().total_bytes <= cache.max_bytes());
        newest = Some(file.path);
    }

    assert!(newest.expect("downloaded").exists());
    assert_eq!(cache.info().file_count, 2);
    Ok(())
}

#[test]
fn test_concurrent_requests_share_one_download() -> Result<()> {
    let fixture = TestFixture::new()?;
    let server = TestServer::start()?;
    let body = mp4_bytes(64 * 1024);
    server.route(
        "/shared.mp4",
        Route::ok("video/mp4", body.clone()).delayed(Duration::from_millis(300)),
    );

    let cache = DiskCache::new(&fixture.config().cache, client());
    let url = server.url("/shared.mp4");

    let (a, b) = std::thread::scope(|scope| {
        let first = scope.spawn(|| cache.ensure_cached(&url, &url, &(), &AlwaysLive));
        let second = scope.spawn(|| cache.ensure_cached(&url, &url, &(), &AlwaysLive));
        (first.join(), second.join())
    });
    let a = a.expect("first caller").expect("first download");
    let b = b.expect("second caller").expect("second download");

    assert_eq!(a.path, b.path);
    assert_eq!(std::fs::read(&a.path)?, body);
    assert_eq!(server.hits("/shared.mp4"), 1);
    assert_eq!(cache.info().file_count, 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_download_from_async_context() -> Result<()> {
    let fixture = TestFixture::new()?;
    let server = TestServer::start()?;
    server.route("/a.mp4", Route::ok("video/mp4", mp4_bytes(12 * 1024)));
    let url = server.url("/a.mp4");
    let config = fixture.config();

    let cached = tokio::task::spawn_blocking(move || {
        let cache = DiskCache::new(&config.cache, client());
        cache.ensure_cached(&url, &url, &(), &AlwaysLive)
    })
    .await?;

    assert!(cached.is_some());
    Ok(())
}
