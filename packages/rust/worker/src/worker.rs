//! Generic consumer loop shared by every bus-driven stage.
//!
//! One cycle: claim a batch from the input topic, run the transform on each
//! message, append produced payloads to the output topic, and acknowledge an
//! input only after its output was appended.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use ravedigest_bus::{StartFrom, StreamBus, TrimPolicy};
use ravedigest_shared::{AppConfig, DigestError, Message, Payload, Result, RetryPolicy, StageName};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::status::StatusWriter;

/// Per-message stage logic. Maps one input to zero or one output payload and
/// never acknowledges.
pub trait Transform: Send + Sync {
    fn apply<'a>(
        &'a self,
        message: &'a Message,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Payload>>> + Send + 'a>>;
}

/// Loop states, logged on transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Recovering,
    Idle,
    Claiming,
    Processing,
    Publishing,
    Acknowledging,
}

/// Where a worker reads and writes, and how it paces itself.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub input_topic: String,
    pub output_topic: Option<String>,
    pub group: String,
    pub consumer: String,
    pub claim_batch: u32,
    pub block_timeout: Duration,
    pub reclaim_idle: Duration,
    pub reclaim_interval: Duration,
    /// Length cap applied to the output topic after publishing.
    pub max_len: Option<u64>,
    pub retry: RetryPolicy,
}

impl WorkerSettings {
    /// Settings for a bus-driven stage, or a validation error for the collector.
    pub fn for_stage(stage: StageName, config: &AppConfig, consumer: &str) -> Result<Self> {
        let input_topic = stage.input_topic().ok_or_else(|| {
            DigestError::validation(format!("stage '{stage}' does not consume a topic"))
        })?;
        Ok(Self {
            input_topic: input_topic.to_string(),
            output_topic: stage.output_topic().map(String::from),
            group: stage.group(&config.bus.group_prefix),
            consumer: consumer.to_string(),
            claim_batch: config.bus.claim_batch,
            block_timeout: config.bus.block_timeout(),
            reclaim_idle: config.bus.reclaim_idle(),
            reclaim_interval: config.bus.reclaim_interval(),
            max_len: (config.bus.max_len > 0).then_some(config.bus.max_len),
            retry: config.retry.transient_policy(),
        })
    }
}

/// Outcome counts of one processed batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub claimed: usize,
    pub produced: usize,
    pub acknowledged: usize,
    /// Left pending after exhausting retries; reclaim will dead-letter them.
    pub skipped: usize,
}

impl CycleReport {
    fn absorb(&mut self, other: CycleReport) {
        self.claimed += other.claimed;
        self.produced += other.produced;
        self.acknowledged += other.acknowledged;
        self.skipped += other.skipped;
    }
}

pub struct StageWorker<T> {
    bus: Arc<StreamBus>,
    transform: T,
    settings: WorkerSettings,
    status: StatusWriter,
}

impl<T: Transform> StageWorker<T> {
    pub fn new(bus: Arc<StreamBus>, transform: T, settings: WorkerSettings, status: StatusWriter) -> Self {
        Self {
            bus,
            transform,
            settings,
            status,
        }
    }

    pub fn settings(&self) -> &WorkerSettings {
        &self.settings
    }

    /// Create the input/output topics and the consumer group if missing.
    pub async fn ensure_topology(&self) -> Result<()> {
        self.bus.create_topic(&self.settings.input_topic).await?;
        if let Some(out) = &self.settings.output_topic {
            self.bus.create_topic(out).await?;
        }
        self.bus
            .create_group(&self.settings.input_topic, &self.settings.group, StartFrom::Beginning)
            .await
    }

    /// Re-deliver entries stalled past `reclaim_idle` to this consumer and
    /// process them.
    pub async fn recover(&self) -> Result<CycleReport> {
        let s = &self.settings;
        let stalled = self
            .bus
            .reclaim_stalled(&s.input_topic, &s.group, &s.consumer, s.reclaim_idle)
            .await?;
        Ok(self.process_batch(stalled).await)
    }

    /// One claim → process cycle. Blocks up to `block_timeout` when idle.
    pub async fn run_once(&self) -> Result<CycleReport> {
        let s = &self.settings;
        tracing::trace!(state = ?WorkerState::Claiming, "worker state");
        let batch = self
            .bus
            .claim(&s.input_topic, &s.group, &s.consumer, s.claim_batch, s.block_timeout)
            .await?;
        let report = self.process_batch(batch).await;
        self.refresh_backlog().await;
        Ok(report)
    }

    /// Run until `shutdown` fires. The batch in flight when it fires is
    /// finished (published and acknowledged) before returning.
    #[instrument(skip_all, fields(group = %self.settings.group, consumer = %self.settings.consumer))]
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        self.ensure_topology().await?;

        tracing::info!(state = ?WorkerState::Recovering, "worker starting");
        let recovered = self.recover().await?;
        if recovered.claimed > 0 {
            tracing::info!(?recovered, "recovered stalled entries");
        }
        self.refresh_backlog().await;

        let mut last_sweep = Instant::now();
        let mut totals = CycleReport::default();
        while !shutdown.is_cancelled() {
            if last_sweep.elapsed() >= self.settings.reclaim_interval {
                last_sweep = Instant::now();
                match self.recover().await {
                    Ok(report) => totals.absorb(report),
                    Err(e) => tracing::warn!(error = %e, "reclaim sweep failed"),
                }
            }

            match self.run_once().await {
                Ok(report) => {
                    if report.claimed > 0 {
                        tracing::debug!(?report, "cycle complete");
                    }
                    totals.absorb(report);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "claim failed, backing off");
                    tokio::select! {
                        _ = shutdown.cancelled() => {}
                        _ = tokio::time::sleep(self.settings.block_timeout) => {}
                    }
                }
            }
        }

        tracing::info!(?totals, "worker stopped");
        Ok(())
    }

    /// Process a claimed or reclaimed batch. Per-message failures are isolated:
    /// the message stays pending and the rest of the batch proceeds.
    pub async fn process_batch(&self, batch: Vec<Message>) -> CycleReport {
        let mut report = CycleReport {
            claimed: batch.len(),
            ..CycleReport::default()
        };
        if batch.is_empty() {
            return report;
        }

        let _busy = self.status.busy(batch.len() as u32);
        tracing::trace!(state = ?WorkerState::Processing, count = batch.len(), "worker state");
        for message in &batch {
            match self.handle(message).await {
                Ok(produced) => {
                    report.acknowledged += 1;
                    report.produced += produced as usize;
                }
                Err(e) => {
                    report.skipped += 1;
                    tracing::warn!(id = %message.id, error = %e, "message skipped, left pending");
                }
            }
            self.status.settle_one();
        }

        if report.produced > 0 {
            self.trim_output().await;
        }
        tracing::trace!(state = ?WorkerState::Idle, "worker state");
        report
    }

    /// Transform, publish, acknowledge. Returns whether an output was produced.
    async fn handle(&self, message: &Message) -> Result<bool> {
        let s = &self.settings;
        let output = s
            .retry
            .run("transform", |_| self.transform.apply(message))
            .await?;

        let produced = match (output, &s.output_topic) {
            (Some(payload), Some(topic)) => {
                tracing::trace!(state = ?WorkerState::Publishing, id = %message.id, "worker state");
                s.retry
                    .run("publish", |_| self.bus.append(topic, &payload))
                    .await?;
                true
            }
            (Some(_), None) => {
                tracing::debug!(id = %message.id, "terminal stage produced output, dropping it");
                false
            }
            (None, _) => false,
        };

        tracing::trace!(state = ?WorkerState::Acknowledging, id = %message.id, "worker state");
        s.retry
            .run("acknowledge", |_| {
                self.bus.acknowledge(&s.input_topic, &s.group, message.id)
            })
            .await?;
        Ok(produced)
    }

    async fn trim_output(&self) {
        let (Some(topic), Some(max_len)) = (&self.settings.output_topic, self.settings.max_len) else {
            return;
        };
        if let Err(e) = self.bus.trim(topic, TrimPolicy::MaxLen(max_len)).await {
            tracing::warn!(topic = %topic, error = %e, "trim failed");
        }
    }

    async fn refresh_backlog(&self) {
        match self
            .bus
            .lag(&self.settings.input_topic, &self.settings.group)
            .await
        {
            Ok(lag) => self.status.set_backlog(lag),
            Err(e) => tracing::warn!(error = %e, "could not read group lag"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use ravedigest_bus::BusOptions;
    use ravedigest_shared::{TOPIC_ENRICHED, TOPIC_RAW};
    use uuid::Uuid;

    use super::*;
    use crate::status::status_channel;

    /// Doubles the `n` field.
    struct Doubler;

    impl Transform for Doubler {
        fn apply<'a>(
            &'a self,
            message: &'a Message,
        ) -> Pin<Box<dyn Future<Output = Result<Option<Payload>>> + Send + 'a>> {
            Box::pin(async move {
                let n = message
                    .payload
                    .get_f64("n")
                    .ok_or_else(|| DigestError::validation("missing n"))?;
                Ok(Some(Payload::new().with("n", n * 2.0)))
            })
        }
    }

    /// Fails a given number of times, then passes messages through.
    struct Flaky {
        failures_left: AtomicU32,
    }

    impl Transform for Flaky {
        fn apply<'a>(
            &'a self,
            message: &'a Message,
        ) -> Pin<Box<dyn Future<Output = Result<Option<Payload>>> + Send + 'a>> {
            Box::pin(async move {
                let left = self.failures_left.load(Ordering::SeqCst);
                if left > 0 {
                    self.failures_left.store(left - 1, Ordering::SeqCst);
                    return Err(DigestError::Transform("upstream hiccup".into()));
                }
                Ok(Some(message.payload.clone()))
            })
        }
    }

    async fn test_bus() -> Arc<StreamBus> {
        let path = std::env::temp_dir().join(format!("rd_worker_test_{}.db", Uuid::now_v7()));
        Arc::new(StreamBus::open(&path, BusOptions::default()).await.expect("open bus"))
    }

    fn settings() -> WorkerSettings {
        WorkerSettings {
            input_topic: TOPIC_RAW.into(),
            output_topic: Some(TOPIC_ENRICHED.into()),
            group: "ravedigest-analyzer".into(),
            consumer: "analyzer-1".into(),
            claim_batch: 10,
            block_timeout: Duration::from_millis(50),
            reclaim_idle: Duration::from_secs(60),
            reclaim_interval: Duration::from_secs(30),
            max_len: Some(1_000),
            retry: RetryPolicy {
                max_attempts: 3,
                backoff: ravedigest_shared::Backoff::Fixed(Duration::from_millis(5)),
                jitter: 0.0,
            },
        }
    }

    #[tokio::test]
    async fn one_cycle_transforms_publishes_and_acknowledges() {
        let bus = test_bus().await;
        let (writer, reader) = status_channel(StageName::Analyzer);
        let worker = StageWorker::new(bus.clone(), Doubler, settings(), writer);
        worker.ensure_topology().await.unwrap();

        for n in 1..=3 {
            bus.append(TOPIC_RAW, &Payload::new().with("n", n as i64)).await.unwrap();
        }

        let report = worker.run_once().await.unwrap();
        assert_eq!(report.claimed, 3);
        assert_eq!(report.produced, 3);
        assert_eq!(report.acknowledged, 3);

        assert_eq!(bus.topic_len(TOPIC_ENRICHED).await.unwrap(), 3);
        assert!(bus.pending(TOPIC_RAW, "ravedigest-analyzer").await.unwrap().is_empty());

        bus.create_group(TOPIC_ENRICHED, "check", StartFrom::Beginning).await.unwrap();
        let out = bus
            .claim(TOPIC_ENRICHED, "check", "t", 10, Duration::ZERO)
            .await
            .unwrap();
        let values: Vec<f64> = out.iter().filter_map(|m| m.payload.get_f64("n")).collect();
        assert_eq!(values, vec![2.0, 4.0, 6.0]);

        assert!(!reader.get().busy);
    }

    #[tokio::test]
    async fn permanent_failure_leaves_message_pending_and_batch_continues() {
        let bus = test_bus().await;
        let (writer, reader) = status_channel(StageName::Analyzer);
        let worker = StageWorker::new(bus.clone(), Doubler, settings(), writer);
        worker.ensure_topology().await.unwrap();

        bus.append(TOPIC_RAW, &Payload::new().with("n", 1)).await.unwrap();
        bus.append(TOPIC_RAW, &Payload::new().with("other", "x")).await.unwrap();
        bus.append(TOPIC_RAW, &Payload::new().with("n", 3)).await.unwrap();

        let report = worker.run_once().await.unwrap();
        assert_eq!(report.acknowledged, 2);
        assert_eq!(report.skipped, 1);

        let pending = bus.pending(TOPIC_RAW, "ravedigest-analyzer").await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id.0, 2);

        // the skipped message still counts as backlog
        let status = reader.get();
        assert_eq!(status.in_flight, 0);
        assert_eq!(status.backlog, 1);
        assert!(status.busy);
    }

    #[tokio::test]
    async fn transient_transform_failure_is_retried() {
        let bus = test_bus().await;
        let (writer, _reader) = status_channel(StageName::Analyzer);
        let flaky = Flaky {
            failures_left: AtomicU32::new(2),
        };
        let worker = StageWorker::new(bus.clone(), flaky, settings(), writer);
        worker.ensure_topology().await.unwrap();
        bus.append(TOPIC_RAW, &Payload::new().with("n", 1)).await.unwrap();

        let report = worker.run_once().await.unwrap();
        assert_eq!(report.acknowledged, 1);
        assert_eq!(report.skipped, 0);
    }

    #[tokio::test]
    async fn recover_picks_up_entries_of_a_crashed_consumer() {
        let bus = test_bus().await;
        let (writer, _reader) = status_channel(StageName::Analyzer);
        let worker = StageWorker::new(
            bus.clone(),
            Doubler,
            WorkerSettings {
                reclaim_idle: Duration::ZERO,
                ..settings()
            },
            writer,
        );
        worker.ensure_topology().await.unwrap();
        bus.append(TOPIC_RAW, &Payload::new().with("n", 5)).await.unwrap();

        // a previous process claimed and died
        bus.claim(TOPIC_RAW, "ravedigest-analyzer", "analyzer-0", 10, Duration::ZERO)
            .await
            .unwrap();

        let report = worker.recover().await.unwrap();
        assert_eq!(report.claimed, 1);
        assert_eq!(report.acknowledged, 1);
        assert!(bus.pending(TOPIC_RAW, "ravedigest-analyzer").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn run_stops_on_cancel() {
        let bus = test_bus().await;
        let (writer, _reader) = status_channel(StageName::Analyzer);
        let worker = Arc::new(StageWorker::new(bus.clone(), Doubler, settings(), writer));
        let token = CancellationToken::new();

        let handle = {
            let worker = worker.clone();
            let token = token.clone();
            tokio::spawn(async move { worker.run(token).await })
        };

        bus.create_topic(TOPIC_RAW).await.unwrap();
        bus.append(TOPIC_RAW, &Payload::new().with("n", 21)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        token.cancel();

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("worker exits after cancel")
            .unwrap()
            .unwrap();
        assert_eq!(bus.topic_len(TOPIC_ENRICHED).await.unwrap(), 1);
    }
}
