//! Stage host: wires one stage to the bus, its status channel and its
//! control endpoint, and runs it until shutdown.

use std::sync::Arc;

use ravedigest_bus::{BusOptions, StreamBus};
use ravedigest_shared::{AppConfig, DigestError, Result, StageName};
use ravedigest_worker::{
    ControlState, StageWorker, StatusWriter, Transform, WorkerSettings, serve, status_channel,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::analyzer::Analyzer;
use crate::collector::Collector;
use crate::composer::Composer;
use crate::publisher::Publisher;

/// Open the bus and serve `stage` until `shutdown` fires.
///
/// A bus that cannot be opened is fatal: the host refuses to start.
pub async fn run_stage(
    stage: StageName,
    config: &AppConfig,
    consumer: &str,
    shutdown: CancellationToken,
) -> Result<()> {
    let bus_path = config.bus.resolved_path();
    let bus = Arc::new(StreamBus::open(&bus_path, BusOptions::from(&config.bus)).await?);
    info!(%stage, consumer, bus = %bus_path.display(), "stage host starting");

    let listen = config.stage_listen(stage);
    let listener = TcpListener::bind(listen)
        .await
        .map_err(|e| DigestError::Network(format!("cannot bind {listen}: {e}")))?;

    let (writer, _reader) = status_channel(stage);
    let state = ControlState::new(stage, writer.clone(), bus.clone());

    match stage {
        StageName::Collector => {
            let job = Collector::from_config(bus, config)?;
            serve(listener, state.with_trigger(Arc::new(job)), shutdown).await
        }
        StageName::Composer => {
            let job = Composer::from_config(bus, config, consumer);
            serve(listener, state.with_trigger(Arc::new(job)), shutdown).await
        }
        StageName::Analyzer => {
            let analyzer = Analyzer::from_config(&config.analyzer);
            run_worker(stage, config, consumer, bus, analyzer, writer, listener, state, shutdown).await
        }
        StageName::Publisher => {
            let publisher = Publisher::from_config(&config.publisher)?;
            run_worker(stage, config, consumer, bus, publisher, writer, listener, state, shutdown).await
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_worker<T: Transform>(
    stage: StageName,
    config: &AppConfig,
    consumer: &str,
    bus: Arc<StreamBus>,
    transform: T,
    writer: StatusWriter,
    listener: TcpListener,
    state: ControlState,
    shutdown: CancellationToken,
) -> Result<()> {
    let settings = WorkerSettings::for_stage(stage, config, consumer)?;
    let worker = StageWorker::new(bus, transform, settings, writer);

    tokio::try_join!(worker.run(shutdown.clone()), serve(listener, state, shutdown))?;
    Ok(())
}
