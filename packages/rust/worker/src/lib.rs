//! Stage worker runtime for RaveDigest.
//!
//! - [`StageWorker`]: the claim → transform → publish → acknowledge loop
//! - [`status_channel`]: owner-mutated [`StageStatus`](ravedigest_shared::StageStatus)
//! - [`control`]: the HTTP trigger/status/health endpoint every stage exposes

pub mod control;
pub mod status;
pub mod worker;

pub use control::{ControlState, JobReport, TriggerJob, TriggerResponse, router, serve};
pub use status::{BusyGuard, StatusReader, StatusWriter, status_channel};
pub use worker::{CycleReport, StageWorker, Transform, WorkerSettings, WorkerState};
