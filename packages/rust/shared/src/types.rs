//! Core domain types: bus messages, stage status, run records, and the
//! article/digest records carried on the bus.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{DigestError, Result};

/// Topic carrying collected articles.
pub const TOPIC_RAW: &str = "raw";
/// Topic carrying analyzed articles.
pub const TOPIC_ENRICHED: &str = "enriched";
/// Topic carrying composed digests.
pub const TOPIC_DIGESTS: &str = "digests";

// ---------------------------------------------------------------------------
// Payload
// ---------------------------------------------------------------------------

/// A payload leaf. Payloads are flat: no nesting, no binary blobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Bool(bool),
    Number(f64),
    Text(String),
}

impl From<&str> for Scalar {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for Scalar {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<f64> for Scalar {
    fn from(n: f64) -> Self {
        Self::Number(n)
    }
}

impl From<i64> for Scalar {
    fn from(n: i64) -> Self {
        Self::Number(n as f64)
    }
}

impl From<i32> for Scalar {
    fn from(n: i32) -> Self {
        Self::Number(n as f64)
    }
}

impl From<u32> for Scalar {
    fn from(n: u32) -> Self {
        Self::Number(n as f64)
    }
}

impl From<bool> for Scalar {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

/// Opaque key → scalar mapping carried by a bus message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Payload(BTreeMap<String, Scalar>);

impl Payload {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, key: &str, value: impl Into<Scalar>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: &str, value: impl Into<Scalar>) {
        self.0.insert(key.to_string(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Scalar> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        match self.0.get(key) {
            Some(Scalar::Text(s)) => Some(s),
            _ => None,
        }
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        match self.0.get(key) {
            Some(Scalar::Number(n)) => Some(*n),
            _ => None,
        }
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.0.get(key) {
            Some(Scalar::Bool(b)) => Some(*b),
            _ => None,
        }
    }

    /// Required text field, or a validation error naming the key.
    pub fn require_str(&self, key: &str) -> Result<&str> {
        self.get_str(key)
            .ok_or_else(|| DigestError::validation(format!("payload field '{key}' missing or not text")))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Scalar)> {
        self.0.iter()
    }

    /// Serialize to the JSON text stored by the bus.
    ///
    /// Non-finite numbers are rejected: JSON has no encoding for them.
    pub fn to_json(&self) -> Result<String> {
        if let Some((key, _)) = self
            .0
            .iter()
            .find(|(_, v)| matches!(v, Scalar::Number(n) if !n.is_finite()))
        {
            return Err(DigestError::validation(format!(
                "payload field '{key}' is not a finite number"
            )));
        }
        serde_json::to_string(self)
            .map_err(|e| DigestError::validation(format!("payload encode: {e}")))
    }

    /// Parse the JSON text stored by the bus.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| DigestError::validation(format!("payload decode: {e}")))
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// Bus-assigned identifier, monotonically increasing within a topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub i64);

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An appended message. Immutable once on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub payload: Payload,
}

// ---------------------------------------------------------------------------
// Stages
// ---------------------------------------------------------------------------

/// The four pipeline stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageName {
    Collector,
    Analyzer,
    Composer,
    Publisher,
}

impl StageName {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Collector => "collector",
            Self::Analyzer => "analyzer",
            Self::Composer => "composer",
            Self::Publisher => "publisher",
        }
    }

    /// Topic this stage consumes, if any.
    pub fn input_topic(&self) -> Option<&'static str> {
        match self {
            Self::Collector => None,
            Self::Analyzer => Some(TOPIC_RAW),
            Self::Composer => Some(TOPIC_ENRICHED),
            Self::Publisher => Some(TOPIC_DIGESTS),
        }
    }

    /// Topic this stage produces into, if any.
    pub fn output_topic(&self) -> Option<&'static str> {
        match self {
            Self::Collector => Some(TOPIC_RAW),
            Self::Analyzer => Some(TOPIC_ENRICHED),
            Self::Composer => Some(TOPIC_DIGESTS),
            Self::Publisher => None,
        }
    }

    /// Consumer group name for this stage: `{prefix}-{stage}`.
    pub fn group(&self, prefix: &str) -> String {
        format!("{prefix}-{}", self.as_str())
    }
}

impl std::fmt::Display for StageName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StageName {
    type Err = DigestError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "collector" => Ok(Self::Collector),
            "analyzer" => Ok(Self::Analyzer),
            "composer" => Ok(Self::Composer),
            "publisher" => Ok(Self::Publisher),
            other => Err(DigestError::validation(format!("unknown stage '{other}'"))),
        }
    }
}

/// Self-reported stage status, as served by `GET /status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageStatus {
    pub stage: StageName,
    pub busy: bool,
    pub in_flight: u32,
    /// Unread + pending messages on the stage's group at last observation.
    #[serde(default)]
    pub backlog: u64,
    pub last_transition: DateTime<Utc>,
}

impl StageStatus {
    /// Fresh idle status for a worker that just started.
    pub fn idle(stage: StageName) -> Self {
        Self {
            stage,
            busy: false,
            in_flight: 0,
            backlog: 0,
            last_transition: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Run records
// ---------------------------------------------------------------------------

/// Final outcome of an orchestrated run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Succeeded,
    Failed,
    TimedOut,
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
        }
    }
}

impl std::str::FromStr for RunOutcome {
    type Err = DigestError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "timed_out" => Ok(Self::TimedOut),
            other => Err(DigestError::validation(format!("unknown run outcome '{other}'"))),
        }
    }
}

/// History entry for one orchestrated run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Last stage the run worked on.
    pub stage_reached: StageName,
    /// `None` while the run is still active.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<RunOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

// ---------------------------------------------------------------------------
// Bus records
// ---------------------------------------------------------------------------

/// A collected article as published on `raw`.
#[derive(Debug, Clone, PartialEq)]
pub struct RawArticle {
    pub id: Uuid,
    pub title: String,
    pub url: String,
    pub published_at: Option<DateTime<Utc>>,
    pub source: String,
    pub summary: String,
    pub categories: String,
}

impl RawArticle {
    pub fn to_payload(&self) -> Payload {
        let mut p = Payload::new()
            .with("id", self.id.to_string())
            .with("title", self.title.as_str())
            .with("url", self.url.as_str())
            .with("source", self.source.as_str())
            .with("summary", self.summary.as_str())
            .with("categories", self.categories.as_str());
        if let Some(ts) = self.published_at {
            p.insert("published_at", ts.to_rfc3339());
        }
        p
    }

    pub fn from_payload(p: &Payload) -> Result<Self> {
        let id = p
            .require_str("id")?
            .parse::<Uuid>()
            .map_err(|e| DigestError::validation(format!("article id: {e}")))?;
        let published_at = match p.get_str("published_at") {
            Some(s) => Some(
                DateTime::parse_from_rfc3339(s)
                    .map(|dt| dt.with_timezone(&Utc))
                    .map_err(|e| DigestError::validation(format!("published_at: {e}")))?,
            ),
            None => None,
        };
        Ok(Self {
            id,
            title: p.require_str("title")?.to_string(),
            url: p.require_str("url")?.to_string(),
            published_at,
            source: p.require_str("source")?.to_string(),
            summary: p.get_str("summary").unwrap_or_default().to_string(),
            categories: p.get_str("categories").unwrap_or_default().to_string(),
        })
    }
}

/// An analyzed article as published on `enriched`.
#[derive(Debug, Clone, PartialEq)]
pub struct EnrichedArticle {
    /// Raw fields; `summary` holds the generated summary.
    pub article: RawArticle,
    /// Relevance in `0.0..=10.0`.
    pub relevance_score: f64,
    pub developer_focus: bool,
}

impl EnrichedArticle {
    pub fn to_payload(&self) -> Payload {
        self.article
            .to_payload()
            .with("relevance_score", self.relevance_score)
            .with("developer_focus", self.developer_focus)
    }

    pub fn from_payload(p: &Payload) -> Result<Self> {
        let relevance_score = p
            .get_f64("relevance_score")
            .ok_or_else(|| DigestError::validation("payload field 'relevance_score' missing"))?;
        if !(0.0..=10.0).contains(&relevance_score) {
            return Err(DigestError::validation(format!(
                "relevance_score {relevance_score} outside 0..=10"
            )));
        }
        Ok(Self {
            article: RawArticle::from_payload(p)?,
            relevance_score,
            developer_focus: p.get_bool("developer_focus").unwrap_or(false),
        })
    }
}

/// A composed digest as published on `digests`.
#[derive(Debug, Clone, PartialEq)]
pub struct DigestRecord {
    pub digest_id: Uuid,
    pub title: String,
    pub url: String,
    pub source: String,
    pub inserted_at: DateTime<Utc>,
    /// Rendered markdown body.
    pub summary: String,
    pub article_count: usize,
}

impl DigestRecord {
    pub fn to_payload(&self) -> Payload {
        Payload::new()
            .with("digest_id", self.digest_id.to_string())
            .with("title", self.title.as_str())
            .with("url", self.url.as_str())
            .with("source", self.source.as_str())
            .with("inserted_at", self.inserted_at.to_rfc3339())
            .with("summary", self.summary.as_str())
            .with("article_count", self.article_count as i64)
    }

    pub fn from_payload(p: &Payload) -> Result<Self> {
        let digest_id = p
            .require_str("digest_id")?
            .parse::<Uuid>()
            .map_err(|e| DigestError::validation(format!("digest_id: {e}")))?;
        let inserted_at = DateTime::parse_from_rfc3339(p.require_str("inserted_at")?)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| DigestError::validation(format!("inserted_at: {e}")))?;
        Ok(Self {
            digest_id,
            title: p.require_str("title")?.to_string(),
            url: p.require_str("url")?.to_string(),
            source: p.require_str("source")?.to_string(),
            inserted_at,
            summary: p.require_str("summary")?.to_string(),
            article_count: p.get_f64("article_count").unwrap_or(0.0) as usize,
        })
    }
}
