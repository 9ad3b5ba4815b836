//! Health Event Agent CLI
//!
//! Background sensor-event ingestion with a durable, observable event log.

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use health_event_agent::delivery::{AggregationKind, CategorySample, QueryWindow, StartOutcome};
use health_event_agent::{
    AppState, ChannelConfig, Config, IngestCore, LogChange, LogSurface, SensorChannel,
    SimulatedSubsystem, VERSION,
};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "health-events")]
#[command(version = VERSION)]
#[command(about = "Background sensor-event ingestion with a durable event log", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Observe the configured channels and ingest simulated readings
    Run {
        /// Seconds between simulated wakeups
        #[arg(long, default_value = "5")]
        interval: u64,

        /// Run as if the application were in the background
        #[arg(long)]
        background: bool,

        /// Decline sensor authorization until the next simulated foreground
        #[arg(long)]
        deny_authorization: bool,
    },

    /// Ingest one reading through a full wakeup cycle
    Ingest {
        /// Channel identifier (e.g. stepCount)
        channel: String,

        /// Aggregate value returned by the query
        value: f64,

        /// Application state at delivery (active, inactive, background)
        #[arg(long, default_value = "background")]
        state: AppState,
    },

    /// List logged events, newest first
    List {
        #[arg(long, short, default_value = "20")]
        limit: usize,
    },

    /// Export the event log
    Export {
        /// Output file
        #[arg(long, short)]
        output: Option<PathBuf>,

        /// Export format (json or jsonl)
        #[arg(long, default_value = "json")]
        format: String,
    },

    /// Remove every logged event
    Clear,

    /// Signal a foreground transition (mirrors and resets the unread count)
    Foreground,

    /// Show log and unread-count status
    Status,

    /// Show configuration
    Config,
}

fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            interval,
            background,
            deny_authorization,
        } => cmd_run(interval, background, deny_authorization),
        Commands::Ingest {
            channel,
            value,
            state,
        } => cmd_ingest(&channel, value, state),
        Commands::List { limit } => cmd_list(limit),
        Commands::Export { output, format } => cmd_export(output, &format),
        Commands::Clear => cmd_clear(),
        Commands::Foreground => cmd_foreground(),
        Commands::Status => cmd_status(),
        Commands::Config => cmd_config(),
    }
}

fn init_logging() {
    let filter =
        EnvFilter::try_from_env("HEALTH_EVENTS_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn open_core() -> Result<(Config, IngestCore)> {
    let config = Config::load().context("loading configuration")?;
    let core = IngestCore::open(&config, Arc::new(LogSurface)).context("opening event store")?;
    for warning in core.load_warnings() {
        eprintln!("Warning: {warning}");
    }
    Ok((config, core))
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("starting async runtime")
}

fn cmd_run(interval: u64, background: bool, deny_authorization: bool) -> Result<()> {
    println!("Health Event Agent v{VERSION}");
    println!();

    let (config, core) = open_core()?;
    let subsystem = Arc::new(SimulatedSubsystem::new(!deny_authorization));
    let mut orchestrator = core.orchestrator(Arc::clone(&subsystem), &config)?;
    let changes = core.log().subscribe(config.observer_queue_capacity);

    println!("Store: {:?}", config.store_path());
    println!("Instance ID: {}", core.instance_id());
    for channel in &config.channels {
        println!("  Channel: {} ({:?})", channel.channel, channel.window);
    }

    if background {
        core.lifecycle().on_background()?;
    }

    let running = Arc::new(AtomicBool::new(true));
    ctrlc_handler(Arc::clone(&running))?;

    let rt = runtime()?;
    rt.block_on(async {
        let mut permission_needed = false;
        match orchestrator.start().await? {
            StartOutcome::Observing(n) => println!("Observing {n} channel(s)"),
            StartOutcome::PermissionNeeded => {
                println!("Sensor authorization declined; asking again on the next foreground.");
                permission_needed = true;
            }
        }
        println!("Press Ctrl+C to stop");
        println!();

        let period = Duration::from_secs(interval.max(1));
        let mut last_tick: Option<Instant> = None;
        let mut tick: u64 = 0;

        while running.load(Ordering::SeqCst) {
            if last_tick.map_or(true, |t| t.elapsed() >= period) {
                if permission_needed {
                    // Access is granted in settings, then the application returns.
                    subsystem.set_authorization(true);
                    let foreground = core.enter_foreground(&mut orchestrator).await?;
                    if let Some(StartOutcome::Observing(n)) = foreground.retried {
                        println!("Authorization granted on foreground; observing {n} channel(s)");
                        permission_needed = false;
                        if background {
                            core.lifecycle().on_background()?;
                        }
                    }
                } else {
                    tick += 1;
                    simulate_readings(&subsystem, &config.channels, tick);
                    for channel in &config.channels {
                        if let Err(e) = subsystem.fire(&channel.channel) {
                            eprintln!("Warning: {e}");
                        }
                    }
                }
                last_tick = Some(Instant::now());
            }

            while let Ok(change) = changes.try_recv() {
                match change {
                    LogChange::Appended { event, count } => {
                        println!("[{count:>4}] {event}");
                    }
                    LogChange::Cleared => println!("Log cleared"),
                }
            }

            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        orchestrator.shutdown();
        anyhow::Ok(())
    })?;

    println!();
    println!("Events logged: {}", core.log().count()?);
    println!("Unread: {}", core.tracker().unread()?);
    Ok(())
}

/// Feed the simulated subsystem one tick of plausible samples.
fn simulate_readings(subsystem: &SimulatedSubsystem, channels: &[ChannelConfig], tick: u64) {
    let now = Utc::now();
    for channel in channels {
        match channel.aggregation {
            AggregationKind::CumulativeSum => {
                subsystem.record_quantity(channel.channel.clone(), now, (tick % 7 + 1) as f64 * 120.0);
            }
            AggregationKind::QualifyingDuration { qualifying_value } => {
                subsystem.record_category(
                    channel.channel.clone(),
                    CategorySample {
                        start: now - chrono::Duration::minutes(30),
                        end: now,
                        value: qualifying_value,
                    },
                );
            }
        }
    }
}

fn cmd_ingest(channel: &str, value: f64, state: AppState) -> Result<()> {
    let (mut config, core) = open_core()?;
    let channel = SensorChannel::new(channel);
    if !config.channels.iter().any(|c| c.channel == channel) {
        config.channels.push(ChannelConfig {
            channel: channel.clone(),
            window: QueryWindow::Today,
            aggregation: AggregationKind::CumulativeSum,
        });
    }

    core.app_state().set(state);
    let subsystem = Arc::new(SimulatedSubsystem::new(true));
    subsystem.script_result(channel.clone(), Ok(value));
    let mut orchestrator = core.orchestrator(Arc::clone(&subsystem), &config)?;

    let outcome = runtime()?.block_on(async {
        if orchestrator.start().await? == StartOutcome::PermissionNeeded {
            bail!("sensor authorization declined");
        }
        let outcome = orchestrator.handle_wakeup(subsystem.wakeup(channel.clone())).await;
        orchestrator.shutdown();
        Ok::<_, anyhow::Error>(outcome)
    })?;

    println!("{channel}: {outcome:?}");
    println!("Unread: {}", core.tracker().unread()?);
    Ok(())
}

fn cmd_list(limit: usize) -> Result<()> {
    let (_, core) = open_core()?;
    let events = core.log().snapshot()?;

    if events.is_empty() {
        println!("No events logged.");
        return Ok(());
    }

    for (index, event) in events.iter().take(limit).enumerate() {
        println!("{index:>4}  {event}");
    }
    if events.len() > limit {
        println!("... {} more", events.len() - limit);
    }
    Ok(())
}

fn cmd_export(output: Option<PathBuf>, format: &str) -> Result<()> {
    let (config, core) = open_core()?;
    let events = core.log().snapshot()?;

    let extension = match format {
        "json" | "jsonl" => format,
        other => bail!("unknown export format '{other}' (expected json or jsonl)"),
    };
    let output_path = output.unwrap_or_else(|| {
        config.data_path.join(format!(
            "export_{}.{extension}",
            Utc::now().format("%Y%m%d_%H%M%S")
        ))
    });

    let rendered: Vec<serde_json::Value> = events.iter().map(|e| e.to_json()).collect();
    let content = if extension == "jsonl" {
        rendered
            .iter()
            .map(serde_json::to_string)
            .collect::<Result<Vec<_>, _>>()?
            .join("\n")
    } else {
        serde_json::to_string_pretty(&rendered)?
    };

    std::fs::write(&output_path, content)
        .with_context(|| format!("writing {}", output_path.display()))?;
    println!("Exported {} event(s) to {output_path:?}", events.len());
    Ok(())
}

fn cmd_clear() -> Result<()> {
    let (_, core) = open_core()?;
    let count = core.log().count()?;
    core.log().clear()?;
    println!("Removed {count} event(s).");
    Ok(())
}

fn cmd_foreground() -> Result<()> {
    let (_, core) = open_core()?;
    let mirrored = core.lifecycle().on_foreground()?;
    println!("Badge set to {mirrored}; unread count reset.");
    Ok(())
}

fn cmd_status() -> Result<()> {
    let (config, core) = open_core()?;

    println!("Health Event Agent Status");
    println!("=========================");
    println!();
    println!("Store: {:?}", config.store_path());
    println!("Events logged: {}", core.log().count()?);
    println!("Unread: {}", core.tracker().unread()?);
    if let Some(latest) = core.log().snapshot()?.first() {
        println!("Latest: {latest}");
    }
    println!();
    println!("Channels:");
    for channel in &config.channels {
        println!(
            "  {} ({:?}, {:?})",
            channel.channel, channel.window, channel.aggregation
        );
    }
    Ok(())
}

fn cmd_config() -> Result<()> {
    let config = Config::load().context("loading configuration")?;

    println!("Configuration");
    println!("=============");
    println!();
    println!("Config file: {:?}", Config::config_path());
    println!();
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

/// Set up Ctrl+C handler.
fn ctrlc_handler(running: Arc<AtomicBool>) -> Result<()> {
    ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
    })
    .context("setting Ctrl+C handler")
}
