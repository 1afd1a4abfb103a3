//! Network access: HTTP seam, URL resolution and landing-page scraping

pub mod http;
pub mod resolver;
pub mod scrape;

pub use http::{HttpClient, HttpRequest, HttpResponse, ReqwestClient};
pub use resolver::{is_dropbox_download, is_http, strip_fragment, ProbeResult, Resolver};
