//! Stage control endpoint: trigger, status and health over HTTP.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use ravedigest_bus::StreamBus;
use ravedigest_shared::{DigestError, Result, StageName};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::status::{StatusReader, StatusWriter};

/// What a triggered job did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobReport {
    /// Messages appended to the output topic.
    pub produced: usize,
    /// Input messages acknowledged.
    pub consumed: usize,
}

/// A job run on `POST /trigger` (collector fetch, composer drain).
pub trait TriggerJob: Send + Sync {
    fn run(&self) -> Pin<Box<dyn Future<Output = Result<JobReport>> + Send + '_>>;
}

/// Body of a successful `POST /trigger`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerResponse {
    pub stage: StageName,
    pub produced: usize,
    pub consumed: usize,
}

#[derive(Clone)]
pub struct ControlState {
    stage: StageName,
    status: StatusReader,
    writer: StatusWriter,
    bus: Arc<StreamBus>,
    trigger: Option<Arc<dyn TriggerJob>>,
    running: Arc<Mutex<()>>,
}

impl ControlState {
    pub fn new(stage: StageName, writer: StatusWriter, bus: Arc<StreamBus>) -> Self {
        Self {
            stage,
            status: writer.reader(),
            writer,
            bus,
            trigger: None,
            running: Arc::new(Mutex::new(())),
        }
    }

    pub fn with_trigger(mut self, job: Arc<dyn TriggerJob>) -> Self {
        self.trigger = Some(job);
        self
    }
}

pub fn router(state: ControlState) -> Router {
    Router::new()
        .route("/trigger", post(handle_trigger))
        .route("/status", get(handle_status))
        .route("/health", get(handle_health))
        .route("/health/ready", get(handle_ready))
        .with_state(state)
}

/// Serve the control endpoint until `shutdown` fires.
pub async fn serve(listener: TcpListener, state: ControlState, shutdown: CancellationToken) -> Result<()> {
    let stage = state.stage;
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(%stage, %addr, "control endpoint listening");
    }
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .map_err(|e| DigestError::Network(format!("control server: {e}")))
}

fn error_body(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(serde_json::json!({ "error": message.into() }))).into_response()
}

// --- POST /trigger ---

async fn handle_trigger(State(state): State<ControlState>) -> Response {
    let Some(job) = state.trigger.clone() else {
        return error_body(
            StatusCode::NOT_FOUND,
            format!("stage '{}' has no trigger", state.stage),
        );
    };
    let Ok(_running) = state.running.try_lock() else {
        return error_body(StatusCode::CONFLICT, "a triggered job is already running");
    };

    tracing::info!(stage = %state.stage, "trigger received");
    let result = {
        let _busy = state.writer.busy(1);
        job.run().await
    };

    match result {
        Ok(report) => {
            tracing::info!(stage = %state.stage, produced = report.produced, consumed = report.consumed, "triggered job finished");
            Json(TriggerResponse {
                stage: state.stage,
                produced: report.produced,
                consumed: report.consumed,
            })
            .into_response()
        }
        Err(e) => {
            tracing::error!(stage = %state.stage, error = %e, "triggered job failed");
            error_body(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

// --- GET /status ---

async fn handle_status(State(state): State<ControlState>) -> impl IntoResponse {
    Json(state.status.get())
}

// --- GET /health, GET /health/ready ---

async fn handle_health(State(state): State<ControlState>) -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok", "stage": state.stage }))
}

async fn handle_ready(State(state): State<ControlState>) -> Response {
    match state.bus.ping().await {
        Ok(()) => Json(serde_json::json!({ "status": "ready", "stage": state.stage })).into_response(),
        Err(e) => error_body(StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::time::Duration;

    use ravedigest_bus::BusOptions;
    use ravedigest_shared::StageStatus;
    use tokio::sync::Notify;
    use uuid::Uuid;

    use super::*;
    use crate::status::status_channel;

    struct Counting;

    impl TriggerJob for Counting {
        fn run(&self) -> Pin<Box<dyn Future<Output = Result<JobReport>> + Send + '_>> {
            Box::pin(async {
                Ok(JobReport {
                    produced: 4,
                    consumed: 0,
                })
            })
        }
    }

    /// Blocks until released.
    struct Gate(Arc<Notify>);

    impl TriggerJob for Gate {
        fn run(&self) -> Pin<Box<dyn Future<Output = Result<JobReport>> + Send + '_>> {
            Box::pin(async move {
                self.0.notified().await;
                Ok(JobReport::default())
            })
        }
    }

    struct Broken;

    impl TriggerJob for Broken {
        fn run(&self) -> Pin<Box<dyn Future<Output = Result<JobReport>> + Send + '_>> {
            Box::pin(async { Err(DigestError::Network("feed host unreachable".into())) })
        }
    }

    async fn start(stage: StageName, job: Option<Arc<dyn TriggerJob>>) -> (SocketAddr, CancellationToken) {
        let path = std::env::temp_dir().join(format!("rd_control_test_{}.db", Uuid::now_v7()));
        let bus = Arc::new(StreamBus::open(&path, BusOptions::default()).await.unwrap());
        let (writer, _reader) = status_channel(stage);
        let mut state = ControlState::new(stage, writer, bus);
        if let Some(job) = job {
            state = state.with_trigger(job);
        }

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let token = CancellationToken::new();
        tokio::spawn(serve(listener, state, token.clone()));
        (addr, token)
    }

    #[tokio::test]
    async fn trigger_reports_counts() {
        let (addr, token) = start(StageName::Collector, Some(Arc::new(Counting))).await;
        let resp = reqwest::Client::new()
            .post(format!("http://{addr}/trigger"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body: TriggerResponse = resp.json().await.unwrap();
        assert_eq!(body.stage, StageName::Collector);
        assert_eq!(body.produced, 4);
        token.cancel();
    }

    #[tokio::test]
    async fn trigger_without_job_is_404() {
        let (addr, token) = start(StageName::Analyzer, None).await;
        let resp = reqwest::Client::new()
            .post(format!("http://{addr}/trigger"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 404);
        token.cancel();
    }

    #[tokio::test]
    async fn failing_job_is_500() {
        let (addr, token) = start(StageName::Collector, Some(Arc::new(Broken))).await;
        let resp = reqwest::Client::new()
            .post(format!("http://{addr}/trigger"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 500);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert!(body["error"].as_str().unwrap().contains("unreachable"));
        token.cancel();
    }

    #[tokio::test]
    async fn concurrent_trigger_is_409_and_status_is_busy() {
        let gate = Arc::new(Notify::new());
        let (addr, token) = start(StageName::Composer, Some(Arc::new(Gate(gate.clone())))).await;
        let client = reqwest::Client::new();

        let first = {
            let client = client.clone();
            tokio::spawn(async move { client.post(format!("http://{addr}/trigger")).send().await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        let status: StageStatus = client
            .get(format!("http://{addr}/status"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert!(status.busy);
        assert_eq!(status.in_flight, 1);

        let second = client.post(format!("http://{addr}/trigger")).send().await.unwrap();
        assert_eq!(second.status(), 409);

        gate.notify_one();
        assert_eq!(first.await.unwrap().unwrap().status(), 200);

        let status: StageStatus = client
            .get(format!("http://{addr}/status"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert!(!status.busy);
        token.cancel();
    }

    #[tokio::test]
    async fn health_and_readiness() {
        let (addr, token) = start(StageName::Publisher, None).await;
        let client = reqwest::Client::new();
        let health = client.get(format!("http://{addr}/health")).send().await.unwrap();
        assert_eq!(health.status(), 200);
        let ready = client.get(format!("http://{addr}/health/ready")).send().await.unwrap();
        assert_eq!(ready.status(), 200);
        token.cancel();
    }
}
