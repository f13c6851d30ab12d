use anyhow::Result;
use colored::Colorize;
use std::path::PathBuf;
use tokio::sync::broadcast::error::RecvError;
use tracing::info;
use tracing_subscriber::EnvFilter;
use waterclock::prelude::*;
use waterclock::{ENGINE_NAME, VERSION};

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Initialize structured logging.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    // 2. Load the configuration; the first argument names an optional TOML file.
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = WaterclockConfig::load(config_path.as_deref())?;
    println!(
        "{} v{} ({:?})",
        ENGINE_NAME.cyan().bold(),
        VERSION,
        config.resolution
    );

    // 3. Create the engine and bring the controller up.
    let mut engine = WaterclockEngine::from_config(config)?;
    let loaded = engine.startup()?;
    info!("Loaded {} program(s).", loaded);

    // 4. Report transitions as they happen.
    spawn_event_listener(&engine);

    // 5. Run until the simulation ends or Ctrl+C arrives.
    let started = std::time::Instant::now();
    engine.run().await?;
    println!(
        "{}",
        format!("Run time: {:.3}s", started.elapsed().as_secs_f64()).dimmed()
    );

    Ok(())
}

/// Spawns a task that prints every program and station transition.
fn spawn_event_listener(engine: &WaterclockEngine) {
    let mut events = engine.subscribe();
    tokio::spawn(async move {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(skipped)) => {
                    println!("{}", format!("... {skipped} event(s) skipped").dimmed());
                    continue;
                }
                Err(RecvError::Closed) => break,
            };
            let line = match event {
                ScheduleEvent::ProgramStarted { program, epoch } => {
                    format!("[{epoch}] {program} started").green()
                }
                ScheduleEvent::ProgramStopped { program, epoch } => {
                    format!("[{epoch}] {program} stopped").yellow()
                }
                ScheduleEvent::StationStarted {
                    program,
                    station,
                    epoch,
                } => format!("[{epoch}]   {program} {station} on").normal(),
                ScheduleEvent::StationStopped {
                    program,
                    station,
                    epoch,
                } => format!("[{epoch}]   {program} {station} off").dimmed(),
            };
            println!("{line}");
        }
    });
}
