//! The four RaveDigest stages and the host that runs them.
//!
//! - [`Collector`]: feeds → `raw` (triggered)
//! - [`Analyzer`]: `raw` → `enriched` (bus-driven worker)
//! - [`Composer`]: `enriched` → `digests` (triggered batch)
//! - [`Publisher`]: `digests` → webhook or directory (bus-driven worker)

pub mod analyzer;
pub mod collector;
pub mod composer;
pub mod host;
pub mod http;
pub mod publisher;

pub use analyzer::Analyzer;
pub use collector::{Collector, dedupe_key, parse_feed};
pub use composer::{Composer, compose, render_markdown, validate_markdown};
pub use host::run_stage;
pub use publisher::{Destination, IDEMPOTENCY_HEADER, Publisher};
