//! Stage control client: trigger a stage, read its status.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use ravedigest_shared::{AppConfig, DigestError, Result, StageName, StageStatus};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

/// Boxed future returned by [`StageControl`] methods.
pub type ControlFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Acknowledgement of a `POST /trigger`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerAck {
    pub stage: StageName,
    pub produced: usize,
    pub consumed: usize,
}

/// The only view the orchestrator has of a stage.
pub trait StageControl: Send + Sync {
    fn trigger(&self, stage: StageName) -> ControlFuture<'_, TriggerAck>;
    fn status(&self, stage: StageName) -> ControlFuture<'_, StageStatus>;
}

/// [`StageControl`] over the stages' HTTP control endpoints.
pub struct HttpStageControl {
    client: Client,
    urls: HashMap<StageName, String>,
    trigger_timeout: Duration,
    status_timeout: Duration,
}

impl HttpStageControl {
    pub fn new(urls: HashMap<StageName, String>, trigger_timeout: Duration, status_timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("RaveDigest/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| DigestError::Network(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            urls,
            trigger_timeout,
            status_timeout,
        })
    }

    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let urls = [
            StageName::Collector,
            StageName::Analyzer,
            StageName::Composer,
            StageName::Publisher,
        ]
        .into_iter()
        .map(|stage| (stage, config.stage_url(stage).trim_end_matches('/').to_string()))
        .collect();
        Self::new(
            urls,
            Duration::from_secs(config.orchestrator.trigger_timeout_secs),
            Duration::from_secs(config.orchestrator.status_timeout_secs),
        )
    }

    fn endpoint(&self, stage: StageName, path: &str) -> Result<String> {
        let base = self
            .urls
            .get(&stage)
            .ok_or_else(|| DigestError::config(format!("no control URL for stage '{stage}'")))?;
        Ok(format!("{base}{path}"))
    }

    async fn post_trigger(&self, stage: StageName) -> Result<TriggerAck> {
        let url = self.endpoint(stage, "/trigger")?;
        let resp = self
            .client
            .post(&url)
            .timeout(self.trigger_timeout)
            .send()
            .await
            .map_err(|e| DigestError::Network(format!("{url}: {e}")))?;

        let status = resp.status();
        if status.is_success() {
            return resp
                .json::<TriggerAck>()
                .await
                .map_err(|e| DigestError::Network(format!("{url}: bad trigger response: {e}")));
        }
        let body = resp.text().await.unwrap_or_default();
        Err(trigger_error(&url, status, &body))
    }

    async fn get_status(&self, stage: StageName) -> Result<StageStatus> {
        let url = self.endpoint(stage, "/status")?;
        let resp = self
            .client
            .get(&url)
            .timeout(self.status_timeout)
            .send()
            .await
            .map_err(|e| DigestError::Network(format!("{url}: {e}")))?;
        if !resp.status().is_success() {
            return Err(DigestError::Network(format!("{url}: HTTP {}", resp.status())));
        }
        resp.json::<StageStatus>()
            .await
            .map_err(|e| DigestError::Network(format!("{url}: bad status response: {e}")))
    }
}

impl StageControl for HttpStageControl {
    fn trigger(&self, stage: StageName) -> ControlFuture<'_, TriggerAck> {
        Box::pin(self.post_trigger(stage))
    }

    fn status(&self, stage: StageName) -> ControlFuture<'_, StageStatus> {
        Box::pin(self.get_status(stage))
    }
}

/// 404 means the stage has no trigger at all; that will not change on retry.
/// A 409 (job already running) or a 5xx may.
fn trigger_error(url: &str, status: StatusCode, body: &str) -> DigestError {
    let detail = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(String::from))
        .unwrap_or_else(|| body.trim().to_string());
    let msg = format!("{url}: HTTP {status}: {detail}");
    if status == StatusCode::NOT_FOUND {
        DigestError::validation(msg)
    } else {
        DigestError::Network(msg)
    }
}
