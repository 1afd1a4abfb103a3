//! Blocking HTTP seam used by the resolver and the disk cache
//!
//! Redirects are never followed automatically; callers walk them so they can
//! bound the hop count and check session liveness between hops.

use crate::utils::error::{CollinsError, Result};
use once_cell::sync::OnceCell;
use reqwest::blocking::Client;
use reqwest::header::{ACCEPT, ACCEPT_ENCODING, RANGE, REFERER};
use reqwest::redirect::Policy;
use std::io::Read;
use std::time::Duration;

/// Connect timeout for every request
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// One GET request
#[derive(Debug, Clone)]
pub struct HttpRequest<'a> {
    pub url: &'a str,
    pub range: Option<&'a str>,
    pub referer: Option<&'a str>,
    pub timeout: Duration,
}

impl<'a> HttpRequest<'a> {
    pub fn get(url: &'a str) -> Self {
        Self {
            url,
            range: None,
            referer: None,
            timeout: Duration::from_secs(5),
        }
    }

    pub fn range(mut self, range: &'a str) -> Self {
        self.range = Some(range);
        self
    }

    pub fn referer(mut self, referer: &'a str) -> Self {
        self.referer = Some(referer);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Response head plus a streaming body
pub struct HttpResponse {
    /// Status code
    pub status: u16,

    /// Header pairs, names lower-cased
    pub headers: Vec<(String, String)>,

    /// Body stream
    pub body: Box<dyn Read + Send>,
}

impl HttpResponse {
    /// First header value with the given (case-insensitive) name
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header("content-type")
    }

    pub fn content_length(&self) -> Option<u64> {
        self.header("content-length").and_then(|v| v.trim().parse().ok())
    }

    pub fn location(&self) -> Option<&str> {
        self.header("location").filter(|l| !l.trim().is_empty())
    }

    pub fn is_redirect(&self) -> bool {
        (300..400).contains(&self.status)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

impl std::fmt::Debug for HttpResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

/// Blocking GET without redirect following
pub trait HttpClient: Send + Sync {
    fn get(&self, request: &HttpRequest<'_>) -> Result<HttpResponse>;
}

/// reqwest-backed client
///
/// The inner blocking client is built on first use so that it is created on a
/// worker thread rather than inside an async runtime.
pub struct ReqwestClient {
    user_agent: String,
    inner: OnceCell<Client>,
}

impl ReqwestClient {
    pub fn new<S: Into<String>>(user_agent: S) -> Self {
        Self {
            user_agent: user_agent.into(),
            inner: OnceCell::new(),
        }
    }

    fn client(&self) -> Result<&Client> {
        self.inner.get_or_try_init(|| {
            Client::builder()
                .redirect(Policy::none())
                .connect_timeout(CONNECT_TIMEOUT)
                .user_agent(self.user_agent.clone())
                .build()
                .map_err(|e| CollinsError::Network(format!("Failed to build HTTP client: {}", e)))
        })
    }
}

impl HttpClient for ReqwestClient {
    fn get(&self, request: &HttpRequest<'_>) -> Result<HttpResponse> {
        let mut builder = self
            .client()?
            .get(request.url)
            .header(ACCEPT, "*/*")
            .header(ACCEPT_ENCODING, "identity")
            .timeout(request.timeout);

        if let Some(range) = request.range {
            builder = builder.header(RANGE, range);
        }
        if let Some(referer) = request.referer {
            builder = builder.header(REFERER, referer);
        }

        let response = builder.send()?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
            })
            .collect();

        Ok(HttpResponse {
            status,
            headers,
            body: Box::new(response),
        })
    }
}
