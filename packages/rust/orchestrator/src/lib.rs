//! Run orchestration for RaveDigest: triggers each stage in order, waits
//! for the bus-driven stages to go idle, and records every run.

pub mod client;
pub mod ledger;
pub mod run;
pub mod schedule;

pub use client::{ControlFuture, HttpStageControl, StageControl, TriggerAck};
pub use ledger::RunLedger;
pub use run::{
    Orchestrator, REASON_IDLE_TIMEOUT, REASON_TRIGGER_UNREACHABLE, RunObserver, RunSettings,
    RunState, SilentObserver,
};
pub use schedule::{DailySchedule, run_daily};
