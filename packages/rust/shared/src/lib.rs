//! Shared types, error model, configuration and retry policy for RaveDigest.
//!
//! This crate is the foundation depended on by all other RaveDigest crates.
//! It provides:
//! - [`DigestError`]: the unified error type
//! - Domain types ([`Message`], [`Payload`], [`StageStatus`], [`RunRecord`], article records)
//! - Configuration ([`AppConfig`], config loading)
//! - [`RetryPolicy`]: bounded-attempt backoff

pub mod config;
pub mod error;
pub mod retry;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AnalyzerConfig, AppConfig, BusConfig, CollectorConfig, ComposerConfig, OrchestratorConfig,
    PublishTarget, PublisherConfig, RetrySection, config_dir, config_file_path, expand_home,
    init_config, load_config, load_config_from, parse_schedule,
};
pub use error::{DigestError, Result};
pub use retry::{Backoff, BackoffKind, RetryConfig, RetryPolicy};
pub use types::{
    DigestRecord, EnrichedArticle, Message, MessageId, Payload, RawArticle, RunOutcome, RunRecord,
    Scalar, StageName, StageStatus, TOPIC_DIGESTS, TOPIC_ENRICHED, TOPIC_RAW,
};
