//! Publisher: delivers each digest to a webhook or a directory of markdown
//! files.
//!
//! Delivery is idempotent per digest: webhooks receive the digest id as
//! `Idempotency-Key`, and the directory target overwrites `<digest_id>.md`.
//! A redelivered digest therefore never shows up twice downstream.

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;

use ravedigest_shared::{
    DigestError, DigestRecord, Message, Payload, PublishTarget, PublisherConfig, Result,
    expand_home,
};
use ravedigest_worker::Transform;
use reqwest::Client;
use tracing::info;

use crate::http::{build_client, classify_status};

/// Header carrying the digest id on webhook deliveries.
pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

/// Resolved delivery destination.
#[derive(Debug, Clone)]
pub enum Destination {
    Webhook { client: Client, url: String },
    Directory(PathBuf),
}

pub struct Publisher {
    destination: Destination,
}

impl Publisher {
    pub fn new(destination: Destination) -> Self {
        Self { destination }
    }

    pub fn from_config(config: &PublisherConfig) -> Result<Self> {
        let destination = match &config.target {
            PublishTarget::Webhook { url } => Destination::Webhook {
                client: build_client(config.http_timeout_secs)?,
                url: url.clone(),
            },
            PublishTarget::Directory { path } => Destination::Directory(expand_home(path)),
        };
        Ok(Self::new(destination))
    }

    /// Deliver one digest.
    pub async fn publish(&self, digest: &DigestRecord) -> Result<()> {
        match &self.destination {
            Destination::Webhook { client, url } => post_webhook(client, url, digest).await,
            Destination::Directory(dir) => write_file(dir, digest).await.map(|_| ()),
        }
    }
}

impl Transform for Publisher {
    fn apply<'a>(
        &'a self,
        message: &'a Message,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Payload>>> + Send + 'a>> {
        Box::pin(async move {
            let digest = DigestRecord::from_payload(&message.payload)?;
            self.publish(&digest).await?;
            info!(
                id = %message.id,
                digest_id = %digest.digest_id,
                articles = digest.article_count,
                "digest published"
            );
            Ok(None)
        })
    }
}

async fn post_webhook(client: &Client, url: &str, digest: &DigestRecord) -> Result<()> {
    let resp = client
        .post(url)
        .header(IDEMPOTENCY_HEADER, digest.digest_id.to_string())
        .json(&digest.to_payload())
        .send()
        .await
        .map_err(|e| DigestError::Network(format!("{url}: {e}")))?;

    // 4xx stays permanent; everything else is a retryable publish error.
    classify_status(url, resp.status()).map_err(|e| match e {
        DigestError::Network(msg) => DigestError::Publish(msg),
        other => other,
    })
}

async fn write_file(dir: &std::path::Path, digest: &DigestRecord) -> Result<PathBuf> {
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| DigestError::io(dir, e))?;
    let path = dir.join(format!("{}.md", digest.digest_id));
    tokio::fs::write(&path, digest.summary.as_bytes())
        .await
        .map_err(|e| DigestError::io(&path, e))?;
    Ok(path)
}
