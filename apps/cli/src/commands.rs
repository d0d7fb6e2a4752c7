//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use ravedigest_bus::{BusOptions, StreamBus, TrimPolicy};
use ravedigest_orchestrator::{
    DailySchedule, Orchestrator, RunLedger, RunObserver, RunState, run_daily,
};
use ravedigest_shared::{
    AppConfig, RunOutcome, RunRecord, StageName, expand_home, init_config, load_config,
    load_config_from,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// RaveDigest: collect, analyze, compose and publish a daily developer digest.
#[derive(Parser)]
#[command(
    name = "ravedigest",
    version,
    about = "Run and orchestrate the RaveDigest stage pipeline.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Config file (defaults to ~/.ravedigest/ravedigest.toml).
    #[arg(long, global = true, env = "RAVEDIGEST_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Stage names as accepted on the command line.
#[derive(Clone, Copy, Debug, clap::ValueEnum)]
pub(crate) enum StageArg {
    Collector,
    Analyzer,
    Composer,
    Publisher,
}

impl From<StageArg> for StageName {
    fn from(arg: StageArg) -> Self {
        match arg {
            StageArg::Collector => StageName::Collector,
            StageArg::Analyzer => StageName::Analyzer,
            StageArg::Composer => StageName::Composer,
            StageArg::Publisher => StageName::Publisher,
        }
    }
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Host one stage: its worker loop (if any) and its control endpoint.
    Stage {
        /// Stage to run.
        name: StageArg,

        /// Consumer name within the stage's group (defaults to <stage>-<pid>).
        #[arg(long)]
        consumer: Option<String>,
    },

    /// Run the full pipeline once, now.
    Run,

    /// Run the pipeline every day at the configured time.
    Schedule,

    /// Inspect and maintain the message bus.
    Bus {
        #[command(subcommand)]
        action: BusAction,
    },

    /// Show recent orchestrated runs.
    History {
        /// Number of runs to show.
        #[arg(short, long, default_value = "20")]
        limit: u32,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Bus subcommands.
#[derive(Subcommand)]
pub(crate) enum BusAction {
    /// Per-topic length and per-group cursor, pending, lag and dead letters.
    Stats,
    /// List a group's pending entries.
    Pending {
        #[arg(long)]
        topic: String,
        #[arg(long)]
        group: String,
    },
    /// List a group's dead letters.
    DeadLetters {
        #[arg(long)]
        topic: String,
        #[arg(long)]
        group: String,
    },
    /// Trim a topic by length or age. Pending messages are kept.
    Trim {
        #[arg(long)]
        topic: String,
        /// Keep the newest N messages.
        #[arg(long, conflicts_with = "max_age_secs")]
        max_len: Option<u64>,
        /// Drop messages older than this many seconds.
        #[arg(long)]
        max_age_secs: Option<u64>,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "ravedigest=info",
        1 => "ravedigest=debug",
        _ => "ravedigest=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt().with_env_filter(env_filter).with_target(false).init();
        }
        LogFormat::Json => {
            fmt().json().with_env_filter(env_filter).init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    let config_path = cli.config.clone();
    match cli.command {
        Command::Config {
            action: ConfigAction::Init,
        } => cmd_config_init().await,
        command => {
            let config = resolve_config(config_path.as_deref())?;
            match command {
                Command::Stage { name, consumer } => cmd_stage(&config, name.into(), consumer).await,
                Command::Run => cmd_run(&config).await,
                Command::Schedule => cmd_schedule(&config).await,
                Command::Bus { action } => cmd_bus(&config, action).await,
                Command::History { limit } => cmd_history(&config, limit).await,
                Command::Config { .. } => cmd_config_show(&config).await,
            }
        }
    }
}

fn resolve_config(path: Option<&Path>) -> Result<AppConfig> {
    let config = match path {
        Some(p) => load_config_from(p)?,
        None => load_config()?,
    };
    Ok(config)
}

/// A token cancelled on Ctrl-C.
fn shutdown_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("shutdown requested"),
            Err(e) => warn!(error = %e, "cannot listen for Ctrl-C; shutting down"),
        }
        trigger.cancel();
    });
    token
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_stage(config: &AppConfig, stage: StageName, consumer: Option<String>) -> Result<()> {
    let consumer = consumer.unwrap_or_else(|| format!("{stage}-{}", std::process::id()));
    let shutdown = shutdown_on_ctrl_c();
    ravedigest_stages::run_stage(stage, config, &consumer, shutdown).await?;
    info!(%stage, "stage host stopped");
    Ok(())
}

async fn cmd_run(config: &AppConfig) -> Result<()> {
    let orchestrator = Orchestrator::from_config(config).await?;
    let observer = CliProgress::new();
    let record = orchestrator.run(&observer).await?;
    print_run_summary(&record);
    match record.outcome {
        Some(RunOutcome::Succeeded) => Ok(()),
        _ => Err(eyre!(
            "run {} did not succeed: {}",
            record.run_id,
            record.failure_reason.as_deref().unwrap_or("unknown reason")
        )),
    }
}

async fn cmd_schedule(config: &AppConfig) -> Result<()> {
    let schedule = DailySchedule::parse(&config.orchestrator.schedule)?;
    let orchestrator = Orchestrator::from_config(config).await?;
    let shutdown = shutdown_on_ctrl_c();
    println!("Daily run scheduled at {schedule}. Press Ctrl-C to stop.");
    run_daily(&orchestrator, schedule, &LogObserver, shutdown).await?;
    Ok(())
}

async fn open_bus(config: &AppConfig) -> Result<Arc<StreamBus>> {
    let bus = StreamBus::open(&config.bus.resolved_path(), BusOptions::from(&config.bus)).await?;
    Ok(Arc::new(bus))
}

async fn cmd_bus(config: &AppConfig, action: BusAction) -> Result<()> {
    let bus = open_bus(config).await?;
    match action {
        BusAction::Stats => {
            let stats = bus.stats().await?;
            if stats.is_empty() {
                println!("No topics yet.");
                return Ok(());
            }
            for topic in stats {
                println!();
                println!("  {}  (length {}, last id {})", topic.topic, topic.length, topic.last_id);
                for g in topic.groups {
                    println!(
                        "    {:<28} cursor {:<8} pending {:<6} lag {:<6} dead {}",
                        g.group, g.cursor.to_string(), g.pending, g.lag, g.dead_letters
                    );
                }
            }
            println!();
        }
        BusAction::Pending { topic, group } => {
            let entries = bus.pending(&topic, &group).await?;
            if entries.is_empty() {
                println!("No pending entries for {group} on {topic}.");
            }
            for e in entries {
                println!(
                    "  {:<8} {:<24} deliveries {:<3} since {}",
                    e.id.to_string(),
                    e.consumer,
                    e.delivery_count,
                    e.delivered_at.to_rfc3339()
                );
            }
        }
        BusAction::DeadLetters { topic, group } => {
            let letters = bus.dead_letters(&topic, &group).await?;
            if letters.is_empty() {
                println!("No dead letters for {group} on {topic}.");
            }
            for letter in letters {
                println!("{}", serde_json::to_string(&letter)?);
            }
        }
        BusAction::Trim {
            topic,
            max_len,
            max_age_secs,
        } => {
            let policy = match (max_len, max_age_secs) {
                (Some(n), _) => TrimPolicy::MaxLen(n),
                (None, Some(secs)) => TrimPolicy::MaxAge(Duration::from_secs(secs)),
                (None, None) => TrimPolicy::MaxLen(config.bus.max_len),
            };
            let removed = bus.trim(&topic, policy).await?;
            println!("Removed {removed} message(s) from {topic}.");
        }
    }
    Ok(())
}

async fn cmd_history(config: &AppConfig, limit: u32) -> Result<()> {
    let ledger = RunLedger::open(&expand_home(&config.orchestrator.history_path)).await?;
    let runs = ledger.history(limit).await?;
    if runs.is_empty() {
        println!("No runs recorded yet.");
        return Ok(());
    }
    for r in runs {
        println!(
            "  {}  {:<10} {:<10} {}",
            r.started_at.format("%Y-%m-%d %H:%M"),
            r.outcome.map(|o| o.as_str()).unwrap_or("running"),
            r.stage_reached.as_str(),
            r.failure_reason.as_deref().unwrap_or("")
        );
    }
    Ok(())
}

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show(config: &AppConfig) -> Result<()> {
    let toml_str = toml::to_string_pretty(config)?;
    println!("{toml_str}");
    Ok(())
}

fn print_run_summary(record: &RunRecord) {
    let elapsed = record
        .finished_at
        .map(|f| (f - record.started_at).num_milliseconds() as f64 / 1000.0)
        .unwrap_or_default();
    println!();
    println!("  Run:     {}", record.run_id);
    println!(
        "  Outcome: {}",
        record.outcome.map(|o| o.as_str()).unwrap_or("running")
    );
    println!("  Reached: {}", record.stage_reached);
    if let Some(reason) = &record.failure_reason {
        println!("  Reason:  {reason}");
    }
    println!("  Time:    {elapsed:.1}s");
    println!();
}

// ---------------------------------------------------------------------------
// Run observers
// ---------------------------------------------------------------------------

/// Spinner for interactive `run`.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        let style = ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]);
        spinner.set_style(style);
        spinner.enable_steady_tick(Duration::from_millis(80));
        Self { spinner }
    }
}

impl RunObserver for CliProgress {
    fn state_changed(&self, state: RunState) {
        self.spinner.set_message(state.to_string());
    }

    fn polled(&self, stage: StageName, attempt: u32, busy: bool) {
        if busy {
            self.spinner
                .set_message(format!("waiting for {stage} (poll {attempt})"));
        }
    }

    fn finished(&self, _record: &RunRecord) {
        self.spinner.finish_and_clear();
    }
}

/// Log-only observer for the unattended scheduler.
struct LogObserver;

impl RunObserver for LogObserver {
    fn state_changed(&self, state: RunState) {
        info!(%state, "run state");
    }

    fn polled(&self, _stage: StageName, _attempt: u32, _busy: bool) {}

    fn finished(&self, record: &RunRecord) {
        info!(
            run_id = %record.run_id,
            outcome = record.outcome.map(|o| o.as_str()).unwrap_or("running"),
            "run recorded"
        );
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_stage_and_bus_commands() {
        let cli = Cli::parse_from(["ravedigest", "-vv", "stage", "analyzer", "--consumer", "a-1"]);
        assert_eq!(cli.verbose, 2);
        assert!(matches!(
            cli.command,
            Command::Stage {
                name: StageArg::Analyzer,
                consumer: Some(ref c),
            } if c == "a-1"
        ));

        let cli = Cli::parse_from(["ravedigest", "bus", "trim", "--topic", "raw", "--max-len", "50"]);
        assert!(matches!(
            cli.command,
            Command::Bus {
                action: BusAction::Trim { max_len: Some(50), .. }
            }
        ));

        let cli = Cli::parse_from(["ravedigest", "bus", "dead-letters", "--topic", "raw", "--group", "g"]);
        assert!(matches!(cli.command, Command::Bus { action: BusAction::DeadLetters { .. } }));
    }
}
