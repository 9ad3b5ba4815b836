//! Demonstration of the Health Event Agent wakeup cycle.
//!
//! This example shows how to:
//! 1. Build an in-memory ingestion core
//! 2. Start the delivery orchestrator over the simulated subsystem
//! 3. Fire wakeups while the application is in the background
//! 4. Watch the event log and unread count change
//! 5. Return to the foreground and reset the badge
//!
//! Run with: cargo run --example wakeup_demo

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use health_event_agent::{
    delivery::StartOutcome, ChannelConfig, Config, IngestCore, LogChange, RecordingSurface,
    SensorChannel, SimulatedSubsystem,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    println!("Health Event Agent - Wakeup Demo");
    println!("================================");
    println!();

    let surface = Arc::new(RecordingSurface::new());
    let core = IngestCore::in_memory(surface.clone())?;
    let changes = core.log().subscribe(64);

    let config = Config {
        channels: vec![ChannelConfig::step_count_today()],
        ..Config::default()
    };
    let subsystem = Arc::new(SimulatedSubsystem::new(true));
    let mut orchestrator = core.orchestrator(Arc::clone(&subsystem), &config)?;

    println!("Instance ID: {}", core.instance_id());
    match orchestrator.start().await? {
        StartOutcome::Observing(n) => println!("Observing {n} channel(s)"),
        StartOutcome::PermissionNeeded => {
            println!("Authorization declined");
            return Ok(());
        }
    }
    println!();

    core.lifecycle().on_background()?;
    println!("Application moved to the background.");

    let steps = SensorChannel::step_count();
    for amount in [400.0, 650.0, 450.0] {
        subsystem.record_quantity(steps.clone(), Utc::now(), amount);
        subsystem.fire(&steps)?;
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    // Let the channel task drain its queue.
    while subsystem.acknowledgments(&steps) < 3 {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    while let Ok(change) = changes.try_recv() {
        if let LogChange::Appended { event, count } = change {
            println!("[{count}] {event}");
        }
    }
    println!();
    println!("Notifications submitted: {}", surface.submitted().len());
    println!("Unread while in background: {}", core.tracker().unread()?);

    let mirrored = core.lifecycle().on_foreground()?;
    println!();
    println!("Back in the foreground: badge set to {mirrored}, unread reset to {}", core.tracker().unread()?);

    orchestrator.shutdown();
    Ok(())
}
