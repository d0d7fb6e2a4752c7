//! Owner-mutated stage status, readable from anywhere.
//!
//! The worker holds a [`StatusWriter`]; the control server and tests hold
//! [`StatusReader`]s. Both sides share a `tokio::sync::watch` channel.

use std::sync::Arc;

use chrono::Utc;
use ravedigest_shared::{StageName, StageStatus};
use tokio::sync::watch;

/// Create a status channel for `stage`, starting idle.
pub fn status_channel(stage: StageName) -> (StatusWriter, StatusReader) {
    let (tx, rx) = watch::channel(StageStatus::idle(stage));
    (StatusWriter { tx: Arc::new(tx) }, StatusReader { rx })
}

/// Write side. Cloned only within the owning stage host.
#[derive(Clone)]
pub struct StatusWriter {
    tx: Arc<watch::Sender<StageStatus>>,
}

impl StatusWriter {
    pub fn reader(&self) -> StatusReader {
        StatusReader {
            rx: self.tx.subscribe(),
        }
    }

    /// Mark `in_flight` units of work as started. Idle again when the guard drops.
    pub fn busy(&self, in_flight: u32) -> BusyGuard {
        self.update(|s| s.in_flight = in_flight);
        BusyGuard {
            writer: self.clone(),
        }
    }

    /// One unit of the current batch reached a terminal outcome.
    pub fn settle_one(&self) {
        self.update(|s| s.in_flight = s.in_flight.saturating_sub(1));
    }

    /// Record the latest unread + pending count of the stage's group.
    pub fn set_backlog(&self, backlog: u64) {
        self.update(|s| s.backlog = backlog);
    }

    fn update(&self, f: impl FnOnce(&mut StageStatus)) {
        self.tx.send_modify(|status| {
            let was_busy = status.busy;
            f(status);
            status.busy = status.in_flight > 0 || status.backlog > 0;
            if status.busy != was_busy {
                status.last_transition = Utc::now();
            }
        });
    }
}

/// Clears `in_flight` when dropped, even if the work panicked.
pub struct BusyGuard {
    writer: StatusWriter,
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.writer.update(|s| s.in_flight = 0);
    }
}

/// Read side.
#[derive(Clone)]
pub struct StatusReader {
    rx: watch::Receiver<StageStatus>,
}

impl StatusReader {
    /// Snapshot of the current status.
    pub fn get(&self) -> StageStatus {
        self.rx.borrow().clone()
    }
}
