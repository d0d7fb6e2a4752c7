//! Once-a-day run schedule.

use chrono::{DateTime, NaiveTime, TimeDelta, Utc};
use ravedigest_shared::{DigestError, Result, RunOutcome, parse_schedule};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::client::StageControl;
use crate::run::{Orchestrator, RunObserver};

/// A fixed `HH:MM` time of day, in UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DailySchedule {
    at: NaiveTime,
}

impl DailySchedule {
    pub fn parse(s: &str) -> Result<Self> {
        let (hour, minute) = parse_schedule(s)?;
        let at = NaiveTime::from_hms_opt(hour, minute, 0)
            .ok_or_else(|| DigestError::config(format!("schedule '{s}' is not a time of day")))?;
        Ok(Self { at })
    }

    /// The first scheduled instant strictly after `now`.
    pub fn next_after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let today = now.date_naive().and_time(self.at).and_utc();
        if today > now {
            today
        } else {
            today + TimeDelta::days(1)
        }
    }
}

impl std::fmt::Display for DailySchedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} UTC", self.at.format("%H:%M"))
    }
}

/// Run once per day at `schedule` until `shutdown` fires. A failed run is
/// not retried; the next tick starts a fresh one.
pub async fn run_daily<C: StageControl>(
    orchestrator: &Orchestrator<C>,
    schedule: DailySchedule,
    observer: &dyn RunObserver,
    shutdown: CancellationToken,
) -> Result<()> {
    loop {
        let now = Utc::now();
        let next = schedule.next_after(now);
        let wait = (next - now).to_std().unwrap_or_default();
        info!(next = %next, %schedule, "next run scheduled");

        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("scheduler stopped");
                return Ok(());
            }
            _ = tokio::time::sleep(wait) => {}
        }

        match orchestrator.run(observer).await {
            Ok(record) if record.outcome == Some(RunOutcome::Succeeded) => {
                info!(run_id = %record.run_id, "scheduled run succeeded");
            }
            Ok(record) => {
                info!(
                    run_id = %record.run_id,
                    reason = record.failure_reason.as_deref().unwrap_or(""),
                    "scheduled run did not succeed; waiting for the next tick"
                );
            }
            Err(e) => error!(error = %e, "scheduled run could not start"),
        }
    }
}
