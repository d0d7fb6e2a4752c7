//! Feed collector: fetches RSS 2.0 / Atom feeds and appends unseen articles
//! to the `raw` topic.
//!
//! Duplicate suppression is producer-side: every article is appended with
//! [`StreamBus::append_once`] keyed by the SHA-256 of its URL, so re-running
//! the collector over the same feeds appends nothing new.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, LazyLock};

use chrono::{DateTime, Utc};
use ravedigest_bus::{StreamBus, TrimPolicy};
use ravedigest_shared::{AppConfig, DigestError, RawArticle, Result, RetryPolicy, TOPIC_RAW};
use ravedigest_worker::{JobReport, TriggerJob};
use regex::Regex;
use reqwest::Client;
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument, warn};
use url::Url;
use uuid::Uuid;

use crate::http::{build_client, classify_status};

/// Maximum feed body we accept (5 MB).
const MAX_FEED_SIZE: u64 = 5 * 1024 * 1024;

// ---------------------------------------------------------------------------
// Collector job
// ---------------------------------------------------------------------------

pub struct Collector {
    bus: Arc<StreamBus>,
    client: Client,
    feeds: Vec<String>,
    retry: RetryPolicy,
    max_len: Option<u64>,
}

impl Collector {
    pub fn new(bus: Arc<StreamBus>, client: Client, feeds: Vec<String>, retry: RetryPolicy) -> Self {
        Self {
            bus,
            client,
            feeds,
            retry,
            max_len: None,
        }
    }

    pub fn from_config(bus: Arc<StreamBus>, config: &AppConfig) -> Result<Self> {
        let client = build_client(config.collector.http_timeout_secs)?;
        let mut collector = Self::new(
            bus,
            client,
            config.collector.feeds.clone(),
            config.retry.transient_policy(),
        );
        collector.max_len = (config.bus.max_len > 0).then_some(config.bus.max_len);
        Ok(collector)
    }

    /// Fetch every feed and append new articles. A feed that keeps failing is
    /// logged and skipped; the job fails only when no feed could be fetched.
    #[instrument(skip_all, fields(feeds = self.feeds.len()))]
    pub async fn collect(&self) -> Result<JobReport> {
        self.bus.create_topic(TOPIC_RAW).await?;

        let mut report = JobReport::default();
        let mut failed = 0usize;
        let mut last_error = None;
        for feed in &self.feeds {
            let body = match self
                .retry
                .run("fetch feed", |_| fetch_feed(&self.client, feed))
                .await
            {
                Ok(body) => body,
                Err(e) => {
                    warn!(feed = %feed, error = %e, "feed skipped");
                    failed += 1;
                    last_error = Some(e);
                    continue;
                }
            };

            let articles = parse_feed(&body, feed);
            let mut added = 0usize;
            for article in &articles {
                let key = dedupe_key(&article.url);
                let payload = article.to_payload();
                let appended = self
                    .retry
                    .run("append article", |_| self.bus.append_once(TOPIC_RAW, &key, &payload))
                    .await?;
                if appended.is_some() {
                    added += 1;
                }
            }
            debug!(feed = %feed, parsed = articles.len(), added, "feed collected");
            report.produced += added;
        }

        if let Some(e) = last_error {
            if failed == self.feeds.len() {
                return Err(DigestError::Network(format!("no feed could be fetched: {e}")));
            }
        }
        if let Some(max_len) = self.max_len {
            self.bus.trim(TOPIC_RAW, TrimPolicy::MaxLen(max_len)).await?;
        }

        info!(produced = report.produced, failed, "collection finished");
        Ok(report)
    }
}

impl TriggerJob for Collector {
    fn run(&self) -> Pin<Box<dyn Future<Output = Result<JobReport>> + Send + '_>> {
        Box::pin(self.collect())
    }
}

/// Producer dedupe key: hex SHA-256 of the trimmed article URL.
pub fn dedupe_key(url: &str) -> String {
    format!("{:x}", Sha256::digest(url.trim().as_bytes()))
}

/// GET a feed body.
pub async fn fetch_feed(client: &Client, url: &str) -> Result<String> {
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| DigestError::Network(format!("{url}: {e}")))?;

    classify_status(url, response.status())?;

    if let Some(len) = response.content_length() {
        if len > MAX_FEED_SIZE {
            return Err(DigestError::validation(format!(
                "{url}: feed too large ({len} bytes, max {MAX_FEED_SIZE})"
            )));
        }
    }

    response
        .text()
        .await
        .map_err(|e| DigestError::Network(format!("{url}: failed to read body: {e}")))
}

// ---------------------------------------------------------------------------
// Feed parsing
// ---------------------------------------------------------------------------

static ITEM_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?si)<(item|entry)\b[^>]*>(.*?)</(?:item|entry)>").expect("valid regex"));

static LINK_TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?si)<link\b([^>]*)>").expect("valid regex"));

static CATEGORY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?si)<category\b([^>]*?)(?:/>|>(.*?)</category>)").expect("valid regex")
});

static ATTR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)\b([a-z]+)\s*=\s*["']([^"']*)["']"#).expect("valid regex"));

static TAG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)<[^>]+>").expect("valid regex"));

static SPACE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("valid regex"));

/// Extract articles from an RSS 2.0 or Atom document. Items without a title
/// or link are dropped.
pub fn parse_feed(xml: &str, feed_url: &str) -> Vec<RawArticle> {
    let head_end = ITEM_RE.find(xml).map(|m| m.start()).unwrap_or(xml.len());
    let source = element_text(&xml[..head_end], "title")
        .map(|t| clean_text(&t))
        .filter(|t| !t.is_empty())
        .or_else(|| Url::parse(feed_url).ok().and_then(|u| u.host_str().map(String::from)))
        .unwrap_or_else(|| feed_url.to_string());

    let mut articles = Vec::new();
    for caps in ITEM_RE.captures_iter(xml) {
        let block = &caps[2];

        let title = element_text(block, "title").map(|t| clean_text(&t)).unwrap_or_default();
        let Some(url) = item_link(block) else {
            debug!(title = %title, "item without link skipped");
            continue;
        };
        if title.is_empty() {
            debug!(url = %url, "item without title skipped");
            continue;
        }

        let summary = ["description", "summary", "content:encoded", "content"]
            .iter()
            .find_map(|name| element_text(block, name).filter(|t| !t.trim().is_empty()))
            .map(|t| clean_text(&t))
            .unwrap_or_default();

        let published_at = ["pubDate", "published", "updated", "dc:date"]
            .iter()
            .find_map(|name| element_text(block, name))
            .and_then(|raw| parse_timestamp(&raw));

        let categories = CATEGORY_RE
            .captures_iter(block)
            .filter_map(|c| {
                attr(c.get(1).map_or("", |m| m.as_str()), "term")
                    .or_else(|| c.get(2).map(|m| decode(m.as_str())))
            })
            .map(|c| clean_text(&c))
            .filter(|c| !c.is_empty())
            .collect::<Vec<_>>()
            .join(",");

        articles.push(RawArticle {
            id: Uuid::now_v7(),
            title,
            url,
            published_at,
            source: source.clone(),
            summary,
            categories,
        });
    }
    articles
}

/// RSS `<link>text</link>`, else the Atom `<link href>` with rel alternate (or no rel).
fn item_link(block: &str) -> Option<String> {
    if let Some(text) = element_text(block, "link") {
        let text = decode(text.trim());
        if !text.is_empty() {
            return Some(text);
        }
    }
    LINK_TAG_RE.captures_iter(block).find_map(|c| {
        let attrs = c.get(1)?.as_str();
        match attr(attrs, "rel").as_deref() {
            None | Some("alternate") => attr(attrs, "href").filter(|h| !h.is_empty()),
            Some(_) => None,
        }
    })
}

fn attr(attrs: &str, name: &str) -> Option<String> {
    ATTR_RE
        .captures_iter(attrs)
        .find(|c| c[1].eq_ignore_ascii_case(name))
        .map(|c| decode(&c[2]))
}

/// Raw inner text of the first `<name>` element, CDATA unwrapped and entities
/// decoded. A self-closing element yields an empty string.
fn element_text(block: &str, name: &str) -> Option<String> {
    let open = format!("<{name}");
    let close = format!("</{name}>");
    let mut from = 0;
    while let Some(pos) = block[from..].find(&open) {
        let after = from + pos + open.len();
        let next = block[after..].chars().next()?;
        if next == '>' || next == '/' || next.is_whitespace() {
            let gt = after + block[after..].find('>')?;
            if block[..gt].ends_with('/') {
                return Some(String::new());
            }
            let end = gt + 1 + block[gt + 1..].find(&close)?;
            return Some(decode(&block[gt + 1..end]));
        }
        from = after;
    }
    None
}

fn decode(raw: &str) -> String {
    let trimmed = raw.trim();
    if let Some(inner) = trimmed
        .strip_prefix("<![CDATA[")
        .and_then(|s| s.strip_suffix("]]>"))
    {
        return inner.to_string();
    }
    trimmed
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

/// Strip markup and collapse whitespace.
fn clean_text(s: &str) -> String {
    let stripped = TAG_RE.replace_all(s, " ");
    SPACE_RE.replace_all(stripped.trim(), " ").trim().to_string()
}

/// RFC 3339 first, then RFC 2822.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    DateTime::parse_from_rfc3339(raw)
        .or_else(|_| DateTime::parse_from_rfc2822(raw))
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}
