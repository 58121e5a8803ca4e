//! Upstream package index client.
//!
//! Fetches PEP 503 simple pages and JSON project metadata from a remote
//! index, and opens artifact downloads as byte streams. All requests go
//! through [`http_retry`](crate::http_retry) with the configured attempt
//! budget; connect and read timeouts are set once on the shared client.

use crate::config::Config;
use crate::error::{OffgridError, Result};
use crate::http_retry::{RetryConfig, fetch_bytes_with_retry, fetch_with_retry};
use crate::models::{Link, ProjectMetadata, dedup_by_label};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use quick_xml::Reader;
use quick_xml::events::{BytesStart, BytesText, Event};
use reqwest::Client;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE};
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

/// Body of an upstream download, chunk by chunk.
pub type ByteStream = BoxStream<'static, std::io::Result<Bytes>>;

/// An opened upstream download whose body has not been read yet.
pub struct Download {
    pub content_type: Option<String>,
    pub content_length: Option<u64>,
    pub body: ByteStream,
}

/// Source of project listings, metadata and artifact bytes.
///
/// Implemented by [`UpstreamFetcher`]; the server only depends on this trait.
#[async_trait]
pub trait IndexSource: Send + Sync {
    /// Label -> href pairs of the project's simple page, in document order.
    async fn fetch_simple_links(&self, project: &str) -> Result<Vec<Link>>;

    /// Parsed JSON metadata, `None` when upstream sent an empty body.
    async fn fetch_project_json(&self, project: &str) -> Result<Option<ProjectMetadata>>;

    /// Open a streaming download of an absolute upstream URL.
    async fn open_download(&self, url: &str) -> Result<Download>;
}

/// HTTP client for one upstream index.
#[derive(Clone, Debug)]
pub struct UpstreamFetcher {
    client: Client,
    simple_url_template: String,
    json_url_template: String,
    retry: RetryConfig,
}

impl UpstreamFetcher {
    /// Create a fetcher.
    ///
    /// `connect_timeout` bounds connection setup; `download_timeout` bounds
    /// each read, so a stalled transfer aborts the attempt.
    pub fn new(
        simple_url_template: impl Into<String>,
        json_url_template: impl Into<String>,
        connect_timeout: Duration,
        download_timeout: Duration,
        max_retries: u32,
    ) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .read_timeout(download_timeout)
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(10)
            .user_agent(concat!("offgrid/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            simple_url_template: simple_url_template.into(),
            json_url_template: json_url_template.into(),
            retry: RetryConfig {
                max_attempts: max_retries,
                ..Default::default()
            },
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(
            &config.remote_index_simple,
            &config.remote_index_json,
            config.connect_timeout,
            config.download_timeout,
            config.max_retries,
        )
    }

    /// Fetch a URL and return its body, retrying up to the attempt budget.
    pub async fn fetch_raw(&self, url: &str) -> Result<Bytes> {
        info!("Fetching content from {}", url);
        fetch_bytes_with_retry(&self.client, url, &self.retry).await
    }

    pub fn simple_url(&self, project: &str) -> String {
        project_url(&self.simple_url_template, project)
    }

    pub fn json_url(&self, project: &str) -> String {
        project_url(&self.json_url_template, project)
    }
}

#[async_trait]
impl IndexSource for UpstreamFetcher {
    async fn fetch_simple_links(&self, project: &str) -> Result<Vec<Link>> {
        let url = self.simple_url(project);
        let body = self.fetch_raw(&url).await?;
        let html = String::from_utf8_lossy(&body);

        let base = Url::parse(&url).ok();
        let links = parse_anchor_links(&html, base.as_ref());
        debug!("Parsed {} link(s) for {} from {}", links.len(), project, url);
        Ok(links)
    }

    async fn fetch_project_json(&self, project: &str) -> Result<Option<ProjectMetadata>> {
        let url = self.json_url(project);
        let body = self.fetch_raw(&url).await?;

        if body.iter().all(u8::is_ascii_whitespace) {
            debug!("Empty JSON body for {}", project);
            return Ok(None);
        }

        let value: serde_json::Value = serde_json::from_slice(&body)
            .map_err(|e| OffgridError::InvalidMetadata(format!("{url}: {e}")))?;
        ProjectMetadata::from_json(value).map(Some)
    }

    async fn open_download(&self, url: &str) -> Result<Download> {
        info!("Opening upstream download {}", url);
        let response = fetch_with_retry(&self.client, url, &self.retry).await?;

        let headers = response.headers();
        let content_type = headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let content_length = headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok());

        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(std::io::Error::other))
            .boxed();

        Ok(Download {
            content_type,
            content_length,
            body,
        })
    }
}

/// Substitute a project name into a `%s` or `{project}` URL template.
pub fn project_url(template: &str, project: &str) -> String {
    template.replace("{project}", project).replace("%s", project)
}

/// Extract `(anchor text, href)` pairs from an HTML page.
///
/// Anchors without text or without an `href` are skipped. Relative hrefs are
/// resolved against `base` when given. Parsing is lenient: unmatched or
/// unclosed tags are tolerated and a hard parse error ends the scan with
/// whatever was collected so far.
pub fn parse_anchor_links(html: &str, base: Option<&Url>) -> Vec<Link> {
    let mut reader = Reader::from_str(html);
    let config = reader.config_mut();
    config.trim_text(true);
    config.check_end_names = false;
    config.allow_unmatched_ends = true;

    let mut links = Vec::new();
    // (href, accumulated text) of the anchor being read
    let mut open: Option<(Option<String>, String)> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(tag)) if is_anchor(tag.name().as_ref()) => {
                open = Some((href_of(&tag), String::new()));
            }
            Ok(Event::Text(text)) => {
                if let Some((_, label)) = open.as_mut() {
                    label.push_str(&text_of(&text));
                }
            }
            Ok(Event::End(tag)) if is_anchor(tag.name().as_ref()) => {
                if let Some((Some(href), label)) = open.take() {
                    let label = label.trim();
                    if !label.is_empty() {
                        links.push(Link::new(label, resolve_href(&href, base)));
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                warn!(
                    "Stopped parsing simple page at byte {}: {}",
                    reader.buffer_position(),
                    e
                );
                break;
            }
            _ => {}
        }
    }

    dedup_by_label(links)
}

fn is_anchor(name: &[u8]) -> bool {
    name.eq_ignore_ascii_case(b"a")
}

fn href_of(tag: &BytesStart) -> Option<String> {
    tag.html_attributes()
        .flatten()
        .find(|attr| attr.key.as_ref().eq_ignore_ascii_case(b"href"))
        .and_then(|attr| attr.unescape_value().ok().map(|v| v.trim().to_string()))
        .filter(|href| !href.is_empty())
}

fn text_of(text: &BytesText) -> String {
    match text.unescape() {
        Ok(unescaped) => unescaped.into_owned(),
        // Unknown HTML entities such as &nbsp; are kept verbatim
        Err(_) => String::from_utf8_lossy(text).into_owned(),
    }
}

fn resolve_href(href: &str, base: Option<&Url>) -> String {
    match base.map(|b| b.join(href)) {
        Some(Ok(absolute)) => absolute.to_string(),
        _ => href.to_string(),
    }
}
