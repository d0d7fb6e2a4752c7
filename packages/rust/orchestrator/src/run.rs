//! The daily run state machine.
//!
//! ```text
//! Idle → TriggerCollect → AwaitAnalyzerIdle → TriggerCompose → AwaitPublisherIdle → Done
//!                  ↘              ↘                  ↘                 ↘
//!                                        Failed
//! ```
//!
//! Stages are black boxes: the orchestrator only triggers them and polls
//! their status. It never touches the bus, so a failed run leaves pending
//! messages for the workers to reclaim later.

use std::time::Duration;

use ravedigest_shared::{AppConfig, DigestError, Result, RetryPolicy, RunOutcome, RunRecord, StageName};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::client::{HttpStageControl, StageControl};
use crate::ledger::RunLedger;

pub const REASON_TRIGGER_UNREACHABLE: &str = "trigger unreachable";
pub const REASON_IDLE_TIMEOUT: &str = "stage did not idle in time";

/// Where a run currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    TriggerCollect,
    AwaitAnalyzerIdle,
    TriggerCompose,
    AwaitPublisherIdle,
    Done,
    Failed,
}

impl RunState {
    /// Stage recorded as `stage_reached` while in this state.
    pub fn stage(&self) -> StageName {
        match self {
            Self::Idle | Self::TriggerCollect => StageName::Collector,
            Self::AwaitAnalyzerIdle => StageName::Analyzer,
            Self::TriggerCompose => StageName::Composer,
            Self::AwaitPublisherIdle | Self::Done | Self::Failed => StageName::Publisher,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::TriggerCollect => "triggering collector",
            Self::AwaitAnalyzerIdle => "waiting for analyzer",
            Self::TriggerCompose => "triggering composer",
            Self::AwaitPublisherIdle => "waiting for publisher",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Callbacks for run progress.
pub trait RunObserver: Send + Sync {
    /// Called on every state entered, terminal states included.
    fn state_changed(&self, state: RunState);
    /// Called after every status poll.
    fn polled(&self, stage: StageName, attempt: u32, busy: bool);
    /// Called once with the finalized record.
    fn finished(&self, record: &RunRecord);
}

/// No-op observer for headless runs.
pub struct SilentObserver;

impl RunObserver for SilentObserver {
    fn state_changed(&self, _state: RunState) {}
    fn polled(&self, _stage: StageName, _attempt: u32, _busy: bool) {}
    fn finished(&self, _record: &RunRecord) {}
}

/// Timing knobs for one run.
#[derive(Debug, Clone)]
pub struct RunSettings {
    /// Retry around each trigger call.
    pub trigger_retry: RetryPolicy,
    /// Spacing between status polls.
    pub polling: RetryPolicy,
    pub analyzer_idle_timeout: Duration,
    pub publisher_idle_timeout: Duration,
    /// Pause between a trigger and the first status poll.
    pub settle_delay: Duration,
}

impl RunSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        let polling = config.retry.polling_policy();
        let o = &config.orchestrator;
        Self {
            trigger_retry: polling.with_max_attempts(polling.max_attempts.min(3)),
            polling,
            analyzer_idle_timeout: Duration::from_secs(o.analyzer_idle_timeout_secs),
            publisher_idle_timeout: Duration::from_secs(o.publisher_idle_timeout_secs),
            settle_delay: Duration::from_millis(o.settle_delay_ms),
        }
    }
}

/// Why a step ended the run.
struct StepFailure {
    outcome: RunOutcome,
    reason: String,
}

pub struct Orchestrator<C> {
    control: C,
    ledger: RunLedger,
    settings: RunSettings,
    running: Mutex<()>,
}

impl Orchestrator<HttpStageControl> {
    /// HTTP stage control plus the configured history database.
    pub async fn from_config(config: &AppConfig) -> Result<Self> {
        let control = HttpStageControl::from_config(config)?;
        let ledger = RunLedger::open(&ravedigest_shared::expand_home(&config.orchestrator.history_path)).await?;
        Ok(Self::new(control, ledger, RunSettings::from_config(config)))
    }
}

impl<C: StageControl> Orchestrator<C> {
    pub fn new(control: C, ledger: RunLedger, settings: RunSettings) -> Self {
        Self {
            control,
            ledger,
            settings,
            running: Mutex::new(()),
        }
    }

    pub fn ledger(&self) -> &RunLedger {
        &self.ledger
    }

    /// Drive one end-to-end run and return its finalized record.
    ///
    /// A run that fails still returns `Ok` with the failure recorded; `Err`
    /// means the run could not be started or recorded at all.
    #[instrument(skip_all)]
    pub async fn run(&self, observer: &dyn RunObserver) -> Result<RunRecord> {
        let Ok(_running) = self.running.try_lock() else {
            return Err(DigestError::RunInProgress);
        };

        let record = self.ledger.begin().await?;
        info!(run_id = %record.run_id, "run started");
        observer.state_changed(RunState::Idle);

        let mut state = RunState::TriggerCollect;
        let failure = loop {
            observer.state_changed(state);
            if let Err(e) = self.ledger.advance(record.run_id, state.stage()).await {
                // finalize records the stage reached regardless
                warn!(run_id = %record.run_id, stage = %state.stage(), error = %e, "could not record run progress");
            }

            let step = match state {
                RunState::TriggerCollect => self
                    .trigger(StageName::Collector)
                    .await
                    .map(|()| RunState::AwaitAnalyzerIdle),
                RunState::AwaitAnalyzerIdle => self
                    .await_idle(StageName::Analyzer, self.settings.analyzer_idle_timeout, observer)
                    .await
                    .map(|()| RunState::TriggerCompose),
                RunState::TriggerCompose => self
                    .trigger(StageName::Composer)
                    .await
                    .map(|()| RunState::AwaitPublisherIdle),
                RunState::AwaitPublisherIdle => self
                    .await_idle(StageName::Publisher, self.settings.publisher_idle_timeout, observer)
                    .await
                    .map(|()| RunState::Done),
                RunState::Idle | RunState::Done | RunState::Failed => break None,
            };

            match step {
                Ok(next) => state = next,
                Err(failure) => break Some(failure),
            }
        };

        let finished = match failure {
            None => {
                observer.state_changed(RunState::Done);
                self.ledger
                    .finalize(record.run_id, StageName::Publisher, RunOutcome::Succeeded, None)
                    .await?
            }
            Some(f) => {
                warn!(stage = %state.stage(), reason = %f.reason, "run failed");
                observer.state_changed(RunState::Failed);
                self.ledger
                    .finalize(record.run_id, state.stage(), f.outcome, Some(&f.reason))
                    .await?
            }
        };

        info!(
            run_id = %finished.run_id,
            outcome = finished.outcome.map(|o| o.as_str()).unwrap_or("unknown"),
            stage_reached = %finished.stage_reached,
            "run finished"
        );
        observer.finished(&finished);
        Ok(finished)
    }

    async fn trigger(&self, stage: StageName) -> std::result::Result<(), StepFailure> {
        let label = format!("trigger {stage}");
        match self
            .settings
            .trigger_retry
            .run(&label, |_| self.control.trigger(stage))
            .await
        {
            Ok(ack) => {
                info!(%stage, produced = ack.produced, consumed = ack.consumed, "stage triggered");
                Ok(())
            }
            Err(e) => {
                warn!(%stage, error = %e, "trigger failed");
                let reason = match e {
                    DigestError::RetryExhausted { .. } => REASON_TRIGGER_UNREACHABLE.to_string(),
                    other => format!("trigger rejected: {other}"),
                };
                Err(StepFailure {
                    outcome: RunOutcome::Failed,
                    reason,
                })
            }
        }
    }

    /// Poll until the stage reports idle or the wall-clock `timeout` passes.
    /// The polling policy only paces the polls. A failed status call counts
    /// as a busy poll.
    async fn await_idle(
        &self,
        stage: StageName,
        timeout: Duration,
        observer: &dyn RunObserver,
    ) -> std::result::Result<(), StepFailure> {
        if !self.settings.settle_delay.is_zero() {
            tokio::time::sleep(self.settings.settle_delay).await;
        }

        let policy = &self.settings.polling;
        let deadline = Instant::now() + timeout;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let busy = match self.control.status(stage).await {
                Ok(status) => status.busy,
                Err(e) => {
                    debug!(%stage, attempt, error = %e, "status call failed");
                    true
                }
            };
            observer.polled(stage, attempt, busy);
            if !busy {
                info!(%stage, attempt, "stage idle");
                return Ok(());
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(%stage, attempt, ?timeout, "stage still busy");
                return Err(StepFailure {
                    outcome: RunOutcome::TimedOut,
                    reason: REASON_IDLE_TIMEOUT.to_string(),
                });
            }
            tokio::time::sleep(policy.delay(attempt).min(deadline - now)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    use chrono::Utc;
    use ravedigest_shared::{Backoff, StageStatus};
    use uuid::Uuid;

    use super::*;
    use crate::client::{ControlFuture, TriggerAck};

    /// Scripted stage control: per-stage busy sequences (last value repeats)
    /// and per-stage trigger failures.
    #[derive(Default)]
    struct Scripted {
        busy: StdMutex<HashMap<StageName, Vec<bool>>>,
        unreachable: Vec<StageName>,
        polls: StdMutex<HashMap<StageName, u32>>,
        triggers: StdMutex<Vec<StageName>>,
        trigger_calls: AtomicU32,
    }

    impl Scripted {
        fn with_busy(self, stage: StageName, seq: &[bool]) -> Self {
            self.busy.lock().unwrap().insert(stage, seq.to_vec());
            self
        }

        fn polls(&self, stage: StageName) -> u32 {
            self.polls.lock().unwrap().get(&stage).copied().unwrap_or(0)
        }
    }

    impl StageControl for Scripted {
        fn trigger(&self, stage: StageName) -> ControlFuture<'_, TriggerAck> {
            self.trigger_calls.fetch_add(1, Ordering::SeqCst);
            let result = if self.unreachable.contains(&stage) {
                Err(DigestError::Network("connection refused".into()))
            } else {
                self.triggers.lock().unwrap().push(stage);
                Ok(TriggerAck {
                    stage,
                    produced: 1,
                    consumed: 0,
                })
            };
            Box::pin(async move { result })
        }

        fn status(&self, stage: StageName) -> ControlFuture<'_, StageStatus> {
            *self.polls.lock().unwrap().entry(stage).or_default() += 1;
            let busy = {
                let mut map = self.busy.lock().unwrap();
                match map.get_mut(&stage) {
                    Some(seq) if seq.len() > 1 => seq.remove(0),
                    Some(seq) => seq.first().copied().unwrap_or(false),
                    None => false,
                }
            };
            Box::pin(async move {
                Ok(StageStatus {
                    stage,
                    busy,
                    in_flight: busy as u32,
                    backlog: 0,
                    last_transition: Utc::now(),
                })
            })
        }
    }

    #[derive(Default)]
    struct Recording(StdMutex<Vec<RunState>>);

    impl RunObserver for Recording {
        fn state_changed(&self, state: RunState) {
            self.0.lock().unwrap().push(state);
        }
        fn polled(&self, _stage: StageName, _attempt: u32, _busy: bool) {}
        fn finished(&self, _record: &RunRecord) {}
    }

    fn settings(idle_timeout: Duration) -> RunSettings {
        let fixed = |attempts, secs| RetryPolicy {
            max_attempts: attempts,
            backoff: Backoff::Fixed(Duration::from_secs(secs)),
            jitter: 0.0,
        };
        RunSettings {
            trigger_retry: fixed(3, 5),
            polling: fixed(35, 10),
            analyzer_idle_timeout: idle_timeout,
            publisher_idle_timeout: idle_timeout,
            settle_delay: Duration::ZERO,
        }
    }

    async fn orchestrator(control: Scripted, idle_timeout: Duration) -> Orchestrator<Scripted> {
        let path = std::env::temp_dir().join(format!("rd_run_test_{}.db", Uuid::now_v7()));
        let ledger = RunLedger::open(&path).await.unwrap();
        Orchestrator::new(control, ledger, settings(idle_timeout))
    }

    #[tokio::test(start_paused = true)]
    async fn busy_three_times_then_idle_advances_after_four_polls() {
        let control = Scripted::default().with_busy(StageName::Analyzer, &[true, true, true, false]);
        let orch = orchestrator(control, Duration::from_secs(350)).await;
        let observer = Recording::default();

        let record = orch.run(&observer).await.unwrap();

        assert_eq!(record.outcome, Some(RunOutcome::Succeeded));
        assert_eq!(orch.control.polls(StageName::Analyzer), 4);
        assert_eq!(
            *orch.control.triggers.lock().unwrap(),
            vec![StageName::Collector, StageName::Composer]
        );
        assert_eq!(
            *observer.0.lock().unwrap(),
            vec![
                RunState::Idle,
                RunState::TriggerCollect,
                RunState::AwaitAnalyzerIdle,
                RunState::TriggerCompose,
                RunState::AwaitPublisherIdle,
                RunState::Done,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn analyzer_busy_past_timeout_fails_the_run() {
        let control = Scripted::default().with_busy(StageName::Analyzer, &[true]);
        let orch = orchestrator(control, Duration::from_secs(60)).await;

        let started = Instant::now();
        let record = orch.run(&SilentObserver).await.unwrap();

        assert_eq!(record.outcome, Some(RunOutcome::TimedOut));
        assert_eq!(record.failure_reason.as_deref(), Some(REASON_IDLE_TIMEOUT));
        assert_eq!(record.stage_reached, StageName::Analyzer);
        assert_eq!(record.stage_reached.as_str(), "analyzer");
        assert!(started.elapsed() >= Duration::from_secs(60));
        assert_eq!(orch.control.polls(StageName::Analyzer), 7);
        assert_eq!(*orch.control.triggers.lock().unwrap(), vec![StageName::Collector]);

        let stored = orch.ledger().get(record.run_id).await.unwrap().unwrap();
        assert_eq!(stored, record);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_wait_outlasts_the_polling_attempt_count() {
        // 35 polls at 10 s cover 340 s; the 600 s timeout still governs
        let control = Scripted::default().with_busy(StageName::Analyzer, &[true]);
        let orch = orchestrator(control, Duration::from_secs(600)).await;

        let started = Instant::now();
        let record = orch.run(&SilentObserver).await.unwrap();

        assert_eq!(record.outcome, Some(RunOutcome::TimedOut));
        assert!(started.elapsed() >= Duration::from_secs(600));
        assert_eq!(orch.control.polls(StageName::Analyzer), 61);
    }

    #[tokio::test(start_paused = true)]
    async fn stage_going_idle_after_the_attempt_count_still_succeeds() {
        let mut busy = vec![true; 40];
        busy.push(false);
        let control = Scripted::default().with_busy(StageName::Analyzer, &busy);
        let orch = orchestrator(control, Duration::from_secs(600)).await;

        let record = orch.run(&SilentObserver).await.unwrap();

        assert_eq!(record.outcome, Some(RunOutcome::Succeeded));
        assert_eq!(orch.control.polls(StageName::Analyzer), 41);
    }

    #[tokio::test]
    async fn failed_progress_write_still_finalizes_the_run() {
        let path = std::env::temp_dir().join(format!("rd_run_test_{}.db", Uuid::now_v7()));
        let ledger = RunLedger::open(&path).await.unwrap();

        // refuse every update that leaves a run open
        let side = libsql::Builder::new_local(&path).build().await.unwrap();
        side.connect()
            .unwrap()
            .execute_batch(
                "CREATE TRIGGER refuse_progress BEFORE UPDATE ON runs
                 WHEN NEW.finished_at IS NULL
                 BEGIN SELECT RAISE(ABORT, 'progress writes refused'); END;",
            )
            .await
            .unwrap();

        let orch = Orchestrator::new(Scripted::default(), ledger, settings(Duration::from_secs(60)));
        let record = orch.run(&SilentObserver).await.unwrap();

        assert_eq!(record.outcome, Some(RunOutcome::Succeeded));
        assert!(record.finished_at.is_some());
        assert_eq!(record.stage_reached, StageName::Publisher);
        let stored = orch.ledger().get(record.run_id).await.unwrap().unwrap();
        assert!(stored.finished_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_trigger_fails_with_reason() {
        let control = Scripted {
            unreachable: vec![StageName::Composer],
            ..Default::default()
        };
        let orch = orchestrator(control, Duration::from_secs(60)).await;

        let record = orch.run(&SilentObserver).await.unwrap();

        assert_eq!(record.outcome, Some(RunOutcome::Failed));
        assert_eq!(record.failure_reason.as_deref(), Some(REASON_TRIGGER_UNREACHABLE));
        assert_eq!(record.stage_reached, StageName::Composer);
        // one collector trigger plus three composer attempts
        assert_eq!(orch.control.trigger_calls.load(Ordering::SeqCst), 4);
        assert_eq!(orch.control.polls(StageName::Publisher), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_run_is_rejected() {
        let control = Scripted::default().with_busy(StageName::Analyzer, &[true, true, false]);
        let orch = orchestrator(control, Duration::from_secs(350)).await;

        let (first, second) = tokio::join!(orch.run(&SilentObserver), async {
            tokio::task::yield_now().await;
            orch.run(&SilentObserver).await
        });

        assert_eq!(first.unwrap().outcome, Some(RunOutcome::Succeeded));
        assert!(matches!(second, Err(DigestError::RunInProgress)));
        assert_eq!(orch.ledger().history(10).await.unwrap().len(), 1);
    }
}
