//! Composer: drains the enriched topic and renders one markdown digest.

use std::fmt::Write as _;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use ravedigest_bus::{StartFrom, StreamBus, TrimPolicy};
use ravedigest_shared::{
    AppConfig, DigestError, DigestRecord, EnrichedArticle, Message, MessageId, Result, RetryPolicy,
    StageName, TOPIC_DIGESTS, TOPIC_ENRICHED,
};
use ravedigest_worker::{JobReport, TriggerJob};
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Source label on every digest.
const DIGEST_SOURCE: &str = "RaveDigest";

pub struct Composer {
    bus: Arc<StreamBus>,
    group: String,
    consumer: String,
    title: String,
    max_articles: usize,
    claim_batch: u32,
    reclaim_idle: Duration,
    max_len: Option<u64>,
    retry: RetryPolicy,
}

impl Composer {
    pub fn from_config(bus: Arc<StreamBus>, config: &AppConfig, consumer: &str) -> Self {
        Self {
            bus,
            group: StageName::Composer.group(&config.bus.group_prefix),
            consumer: consumer.to_string(),
            title: config.composer.title.clone(),
            max_articles: config.composer.max_articles.max(1),
            claim_batch: config.bus.claim_batch,
            reclaim_idle: config.bus.reclaim_idle(),
            max_len: (config.bus.max_len > 0).then_some(config.bus.max_len),
            retry: config.retry.transient_policy(),
        }
    }

    /// Recover stalled entries, drain the group, publish one digest, then
    /// acknowledge every article that went into the selection.
    ///
    /// Malformed entries stay pending and are dead-lettered by later reclaims.
    #[instrument(skip_all, fields(group = %self.group))]
    pub async fn compose_pending(&self) -> Result<JobReport> {
        self.bus.create_topic(TOPIC_ENRICHED).await?;
        self.bus.create_topic(TOPIC_DIGESTS).await?;
        self.bus
            .create_group(TOPIC_ENRICHED, &self.group, StartFrom::Beginning)
            .await?;

        let mut messages = self
            .bus
            .reclaim_stalled(TOPIC_ENRICHED, &self.group, &self.consumer, self.reclaim_idle)
            .await?;
        loop {
            let batch = self
                .bus
                .claim(TOPIC_ENRICHED, &self.group, &self.consumer, self.claim_batch, Duration::ZERO)
                .await?;
            if batch.is_empty() {
                break;
            }
            messages.extend(batch);
        }

        let (articles, ids) = parse_batch(&messages);
        if articles.is_empty() {
            info!(claimed = messages.len(), "nothing to compose");
            return Ok(JobReport::default());
        }

        let digest = compose(&articles, &self.title, self.max_articles, Utc::now())?;
        let payload = digest.to_payload();
        self.retry
            .run("publish digest", |_| self.bus.append(TOPIC_DIGESTS, &payload))
            .await?;

        let mut consumed = 0;
        for id in ids {
            let removed = self
                .retry
                .run("acknowledge", |_| self.bus.acknowledge(TOPIC_ENRICHED, &self.group, id))
                .await?;
            consumed += removed as usize;
        }
        if let Some(max_len) = self.max_len {
            self.bus.trim(TOPIC_DIGESTS, TrimPolicy::MaxLen(max_len)).await?;
        }

        info!(
            digest_id = %digest.digest_id,
            articles = digest.article_count,
            consumed,
            "digest composed"
        );
        Ok(JobReport {
            produced: 1,
            consumed,
        })
    }
}

impl TriggerJob for Composer {
    fn run(&self) -> Pin<Box<dyn Future<Output = Result<JobReport>> + Send + '_>> {
        Box::pin(self.compose_pending())
    }
}

fn parse_batch(messages: &[Message]) -> (Vec<EnrichedArticle>, Vec<MessageId>) {
    let mut articles = Vec::new();
    let mut ids = Vec::new();
    for message in messages {
        match EnrichedArticle::from_payload(&message.payload) {
            Ok(article) => {
                articles.push(article);
                ids.push(message.id);
            }
            Err(e) => warn!(id = %message.id, error = %e, "malformed enriched article left pending"),
        }
    }
    (articles, ids)
}

/// Select and render a digest. Developer-focused articles come first, then by
/// relevance, then newest first.
pub fn compose(
    articles: &[EnrichedArticle],
    title: &str,
    max_articles: usize,
    now: DateTime<Utc>,
) -> Result<DigestRecord> {
    let mut selected: Vec<&EnrichedArticle> = articles.iter().collect();
    selected.sort_by(|a, b| {
        b.developer_focus
            .cmp(&a.developer_focus)
            .then(b.relevance_score.total_cmp(&a.relevance_score))
            .then(b.article.published_at.cmp(&a.article.published_at))
    });
    selected.truncate(max_articles);

    let full_title = format!("{title} ({})", now.format("%Y-%m-%d"));
    let markdown = render_markdown(&full_title, &selected);
    validate_markdown(&markdown)?;

    let digest_id = Uuid::now_v7();
    Ok(DigestRecord {
        digest_id,
        title: full_title,
        url: format!("/digests/{digest_id}"),
        source: DIGEST_SOURCE.to_string(),
        inserted_at: now,
        summary: markdown,
        article_count: selected.len(),
    })
}

pub fn render_markdown(title: &str, articles: &[&EnrichedArticle]) -> String {
    let mut md = format!("# {title}\n\n");
    for (i, item) in articles.iter().enumerate() {
        let a = &item.article;
        let _ = writeln!(md, "## {}. [{}]({})\n", i + 1, escape_brackets(&a.title), a.url);

        let mut meta = vec![a.source.clone()];
        if let Some(ts) = a.published_at {
            meta.push(ts.format("%Y-%m-%d").to_string());
        }
        if item.developer_focus {
            meta.push("developer focus".into());
        }
        let _ = writeln!(md, "*{}*\n", meta.join(" | "));
        let _ = writeln!(md, "**Relevance:** {:.1}/10\n", item.relevance_score);
        let _ = writeln!(md, "**Summary:** {}\n", a.summary);
    }
    md
}

/// Minimal sanity checks on a rendered digest.
pub fn validate_markdown(md: &str) -> Result<()> {
    if md.trim().is_empty() {
        return Err(DigestError::validation("digest content is empty"));
    }
    if !md.lines().any(|l| {
        l.strip_prefix("## ")
            .and_then(|rest| rest.split_once('.'))
            .is_some_and(|(n, _)| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()))
    }) {
        return Err(DigestError::validation("digest has no article sections"));
    }
    if md.contains("[[") || md.contains("]]") {
        return Err(DigestError::validation("digest has broken link brackets"));
    }
    if !md.contains("**Summary:**") {
        return Err(DigestError::validation("digest has no summaries"));
    }
    Ok(())
}

fn escape_brackets(s: &str) -> String {
    s.replace('[', "(").replace(']', ")")
}

#[cfg(test)]
mod tests {
    use ravedigest_bus::BusOptions;
    use ravedigest_shared::RawArticle;

    use super::*;

    fn enriched(title: &str, score: f64, dev: bool) -> EnrichedArticle {
        EnrichedArticle {
            article: RawArticle {
                id: Uuid::now_v7(),
                title: title.into(),
                url: format!("https://example.com/{}", title.to_lowercase().replace(' ', "-")),
                published_at: Some(Utc::now()),
                source: "Example".into(),
                summary: format!("About {title}."),
                categories: String::new(),
            },
            relevance_score: score,
            developer_focus: dev,
        }
    }

    #[test]
    fn developer_focus_first_then_relevance() {
        let articles = vec![
            enriched("Gardening", 9.0, false),
            enriched("Rust", 4.0, true),
            enriched("Kubernetes", 8.0, true),
        ];
        let digest = compose(&articles, "Daily", 2, Utc::now()).unwrap();
        assert_eq!(digest.article_count, 2);

        let k = digest.summary.find("[Kubernetes]").unwrap();
        let r = digest.summary.find("[Rust]").unwrap();
        assert!(k < r);
        assert!(!digest.summary.contains("Gardening"));
        assert!(digest.url.starts_with("/digests/"));
    }

    #[test]
    fn rendered_digest_passes_validation() {
        let a = enriched("Weird [title]", 5.0, true);
        let md = render_markdown("Daily", &[&a]);
        assert!(md.contains("## 1. [Weird (title)](https://example.com/weird-[title])"));
        assert!(md.contains("**Summary:** About Weird [title]."));
        validate_markdown(&md).unwrap();
    }

    #[test]
    fn validation_catches_empty_and_sectionless() {
        assert!(validate_markdown("   ").is_err());
        assert!(validate_markdown("# Title\n\n**Summary:** x").is_err());
        assert!(validate_markdown("## 1. a\n**Summary:** [[x]]").is_err());
    }

    #[tokio::test]
    async fn compose_pending_drains_and_acknowledges() {
        let path = std::env::temp_dir().join(format!("rd_composer_test_{}.db", Uuid::now_v7()));
        let bus = Arc::new(StreamBus::open(&path, BusOptions::default()).await.unwrap());
        let config = AppConfig::default();
        let composer = Composer::from_config(bus.clone(), &config, "composer-1");

        bus.create_topic(TOPIC_ENRICHED).await.unwrap();
        for i in 0..25 {
            let a = enriched(&format!("Item {i}"), (i % 10) as f64, i % 2 == 0);
            bus.append(TOPIC_ENRICHED, &a.to_payload()).await.unwrap();
        }
        bus.append(
            TOPIC_ENRICHED,
            &ravedigest_shared::Payload::new().with("title", "broken"),
        )
        .await
        .unwrap();

        let report = composer.compose_pending().await.unwrap();
        assert_eq!(report.produced, 1);
        assert_eq!(report.consumed, 25);
        assert_eq!(bus.topic_len(TOPIC_DIGESTS).await.unwrap(), 1);

        let group = StageName::Composer.group("ravedigest");
        let pending = bus.pending(TOPIC_ENRICHED, &group).await.unwrap();
        assert_eq!(pending.len(), 1, "malformed entry stays pending");

        bus.create_group(TOPIC_DIGESTS, "check", StartFrom::Beginning).await.unwrap();
        let msgs = bus.claim(TOPIC_DIGESTS, "check", "t", 10, Duration::ZERO).await.unwrap();
        let digest = DigestRecord::from_payload(&msgs[0].payload).unwrap();
        assert_eq!(digest.article_count, 20);

        let again = composer.compose_pending().await.unwrap();
        assert_eq!(again.produced, 0);
    }
}
