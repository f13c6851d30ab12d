//! The tick driver that orchestrates the controller.

use crate::clock::{Clock, Now, SimClock, WallClock};
use crate::common::{station_map, ProgramId, StationMap};
use crate::config::{ClockResolution, WaterclockConfig};
use crate::error::ScheduleError;
use crate::event_log::EventLog;
use crate::events::{ScheduleEvent, TickReport};
use crate::program::Evaluation;
use crate::registry::ProgramRegistry;
use crate::scheduler::RunState;
use anyhow::Context;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

const SECONDS_PER_DAY: u64 = 24 * 3600;

/// Totals accumulated over a simulated run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimulationSummary {
    pub ticks: u64,
    pub starts: u64,
    pub stops: u64,
    pub total_changes: u64,
}

/// The main controller engine.
///
/// The engine owns the program registry and the event log for the lifetime
/// of the process and is the only thing that mutates them while it runs.
/// Each call to `tick` makes exactly one scheduling decision.
pub struct WaterclockEngine {
    config: Arc<WaterclockConfig>,
    registry: ProgramRegistry,
    event_log: EventLog,
    stations: StationMap,
    active_block: Option<usize>,
    last_changes: u64,
    event_sender: broadcast::Sender<ScheduleEvent>,
}

// Core implementation block for the per-tick logic.
impl WaterclockEngine {
    /// Creates an engine around an already constructed registry and log.
    pub fn new(config: WaterclockConfig, registry: ProgramRegistry, event_log: EventLog) -> Self {
        const CHANNEL_CAPACITY: usize = 256;
        let (event_sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        let stations = station_map(config.stations.iter().cloned());
        let registry = registry.with_tick_granularity(config.tick_granularity_secs);
        Self {
            config: Arc::new(config),
            registry,
            event_log,
            stations,
            active_block: None,
            last_changes: 0,
            event_sender,
        }
    }

    /// Opens the registry directory and event log named in `config`.
    pub fn from_config(config: WaterclockConfig) -> anyhow::Result<Self> {
        let registry = ProgramRegistry::new(&config.programs_dir)
            .context("failed to open the programs directory")?;
        let event_log = EventLog::open(&config.event_log).context("failed to open the event log")?;
        Ok(Self::new(config, registry, event_log))
    }

    /// Loads programs, binds them to the configured stations and registers
    /// both with the event log. Returns the number of programs loaded.
    pub fn startup(&mut self) -> anyhow::Result<usize> {
        let loaded = self.registry.load_all().context("failed to load programs")?;
        self.registry.bind_stations(&self.stations);
        self.event_log
            .register_stations(self.stations.values().map(Arc::as_ref))
            .context("failed to register stations")?;
        self.event_log
            .register_programs(self.registry.programs())
            .context("failed to register programs")?;
        self.last_changes = self.event_log.total_changes()?;
        info!(
            programs = self.registry.len(),
            stations = self.stations.len(),
            "Controller ready."
        );
        Ok(loaded)
    }

    /// Makes the scheduling decision for `now`.
    ///
    /// A running program whose sequence is exhausted is stopped first; the
    /// idle candidates are then evaluated in the same tick, so a program
    /// due at the exact second another one finishes still starts on time.
    pub fn tick(&mut self, now: &Now) -> Result<TickReport, ScheduleError> {
        trace!(epoch = now.epoch, "Tick.");
        let mut report = TickReport::default();
        let granularity = self.registry.tick_granularity;

        if let RunState::Running { id, since } = self.registry.run_state() {
            let evaluation = self
                .registry
                .get(id)
                .map(|p| p.evaluate(now, granularity, Some(since)))
                .ok_or(ScheduleError::NotFound(id))?;
            if evaluation == Evaluation::Stop {
                self.stop_active_station(id, now, &mut report)?;
                self.registry
                    .move_program(id, false, now, &mut self.event_log)?;
                report.stopped = Some(id);
                report.events.push(ScheduleEvent::ProgramStopped {
                    program: id,
                    epoch: now.epoch,
                });
            }
        }

        match self.registry.get_program_to_run(now) {
            Some(id) if self.registry.run_state().is_running(id) => {
                report.continued = Some(id);
                self.step_stations(id, now, &mut report)?;
            }
            Some(id) => {
                self.registry
                    .move_program(id, true, now, &mut self.event_log)?;
                report.started = Some(id);
                report.events.push(ScheduleEvent::ProgramStarted {
                    program: id,
                    epoch: now.epoch,
                });
                self.active_block = None;
                self.step_stations(id, now, &mut report)?;
            }
            None => {}
        }

        self.finish(report)
    }

    /// Ticks every granularity step after `last` up to and including `now`.
    ///
    /// A late wakeup therefore still sees each start time it slept through.
    /// Gaps longer than a day are not replayed; the engine resumes at `now`.
    /// Returns the epoch of the last tick processed.
    pub fn tick_through(
        &mut self,
        last: Option<i64>,
        now: &Now,
    ) -> Result<Option<i64>, ScheduleError> {
        let step = i64::from(self.registry.tick_granularity);
        let mut epoch = match last {
            Some(last) if now.epoch - last <= SECONDS_PER_DAY as i64 => last + step,
            Some(last) => {
                warn!(skipped = now.epoch - last, "Clock jumped ahead; not replaying the gap.");
                now.epoch
            }
            None => now.epoch,
        };
        let mut processed = last;
        while epoch <= now.epoch {
            let at = if epoch == now.epoch {
                Some(*now)
            } else {
                Now::from_epoch(epoch, self.config.timezone)
            };
            if let Some(at) = at {
                if epoch != now.epoch {
                    debug!(epoch, "Catching up a missed tick.");
                }
                self.tick(&at)?;
                processed = Some(epoch);
            }
            epoch += step;
        }
        Ok(processed)
    }

    #[doc(hidden)]
    fn step_stations(
        &mut self,
        id: ProgramId,
        now: &Now,
        report: &mut TickReport,
    ) -> Result<(), ScheduleError> {
        let RunState::Running { since, .. } = self.registry.run_state() else {
            return Ok(());
        };
        let program = self.registry.get(id).ok_or(ScheduleError::NotFound(id))?;
        let next = program.active_block(now.epoch - since);
        if next == self.active_block {
            return Ok(());
        }
        let station_at = |index: Option<usize>| {
            index
                .and_then(|i| program.station_blocks().get(i))
                .map(|b| b.station_id)
        };
        let previous = station_at(self.active_block);
        let upcoming = station_at(next);

        if let Some(station) = previous {
            self.event_log.log_station_stop(station, Some(now))?;
            report.events.push(ScheduleEvent::StationStopped {
                program: id,
                station,
                epoch: now.epoch,
            });
        }
        if let Some(station) = upcoming {
            self.event_log.log_station_start(station, Some(now))?;
            report.events.push(ScheduleEvent::StationStarted {
                program: id,
                station,
                epoch: now.epoch,
            });
            debug!(program = %id, station = %station, "Station on.");
        }
        self.active_block = next;
        Ok(())
    }

    #[doc(hidden)]
    fn stop_active_station(
        &mut self,
        id: ProgramId,
        now: &Now,
        report: &mut TickReport,
    ) -> Result<(), ScheduleError> {
        let Some(index) = self.active_block.take() else {
            return Ok(());
        };
        let station = self
            .registry
            .get(id)
            .and_then(|p| p.station_blocks().get(index))
            .map(|b| b.station_id);
        if let Some(station) = station {
            self.event_log.log_station_stop(station, Some(now))?;
            report.events.push(ScheduleEvent::StationStopped {
                program: id,
                station,
                epoch: now.epoch,
            });
        }
        Ok(())
    }

    #[doc(hidden)]
    fn finish(&mut self, mut report: TickReport) -> Result<TickReport, ScheduleError> {
        let total = self.event_log.total_changes()?;
        report.changed = total != self.last_changes;
        report.total_changes = total;
        self.last_changes = total;
        for event in &report.events {
            self.event_sender.send(*event).ok();
        }
        Ok(report)
    }
}

// Public API implementation block.
impl WaterclockEngine {
    /// Runs the engine according to the configured `ClockResolution` until
    /// it finishes or Ctrl+C is received, then persists all state.
    pub async fn run(mut self) -> anyhow::Result<()> {
        info!("WaterclockEngine starting up...");
        let result = match self.config.resolution.clone() {
            ClockResolution::Realtime => self.run_realtime().await,
            ClockResolution::Simulated { days, start } => {
                let mut clock = match start {
                    Some(date) => SimClock::starting_at(date, self.config.timezone),
                    None => {
                        let mut clock = SimClock::new(Utc::now().with_timezone(&self.config.timezone));
                        clock.reset_to_today();
                        clock
                    }
                };
                self.run_days(&mut clock, days).await
            }
        };
        // Persist even when the loop failed, then report the first error.
        let shutdown = self.shutdown();
        result.and(shutdown)
    }

    /// Runs `seconds` of simulated time, one tick per granularity step.
    pub fn run_simulated(
        &mut self,
        clock: &mut SimClock,
        seconds: u64,
    ) -> Result<SimulationSummary, ScheduleError> {
        let step = u64::from(self.registry.tick_granularity);
        let mut summary = SimulationSummary::default();
        for _ in 0..seconds / step {
            let report = self.tick(&clock.now())?;
            summary.ticks += 1;
            summary.starts += u64::from(report.started.is_some());
            summary.stops += u64::from(report.stopped.is_some());
            summary.total_changes = report.total_changes;
            clock.advance(step as i64);
        }
        Ok(summary)
    }

    /// Commits buffered events and writes every dirty program.
    pub fn shutdown(&mut self) -> anyhow::Result<()> {
        self.event_log
            .persist()
            .context("failed to persist the event log")?;
        let written = self
            .registry
            .write_all()
            .context("failed to write programs")?;
        info!(written, "WaterclockEngine has shut down.");
        Ok(())
    }

    /// Subscribes to the `ScheduleEvent` stream.
    pub fn subscribe(&self) -> broadcast::Receiver<ScheduleEvent> {
        self.event_sender.subscribe()
    }

    pub fn config(&self) -> &WaterclockConfig {
        &self.config
    }

    pub fn registry(&self) -> &ProgramRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut ProgramRegistry {
        &mut self.registry
    }

    pub fn event_log(&self) -> &EventLog {
        &self.event_log
    }

    pub fn event_log_mut(&mut self) -> &mut EventLog {
        &mut self.event_log
    }

    #[doc(hidden)]
    async fn run_realtime(&mut self) -> anyhow::Result<()> {
        let clock = WallClock::new(self.config.timezone);
        let period = Duration::from_secs(u64::from(self.registry.tick_granularity));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut last = None;
        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);

        info!("Engine running in real time. Press Ctrl+C to shut down.");
        loop {
            tokio::select! {
                biased;
                _ = &mut ctrl_c => {
                    info!("Shutdown signal received.");
                    break;
                }
                _ = ticker.tick() => {
                    last = self.tick_through(last, &clock.now())?;
                    // Real ticks are rare enough to commit as they happen.
                    self.event_log.persist()?;
                }
            }
        }
        Ok(())
    }

    #[doc(hidden)]
    async fn run_days(&mut self, clock: &mut SimClock, days: u32) -> anyhow::Result<()> {
        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);

        info!(days, start = %clock.current(), "Engine running a simulation.");
        for day in 1..=days {
            tokio::select! {
                biased;
                _ = &mut ctrl_c => {
                    info!("Shutdown signal received.");
                    break;
                }
                _ = tokio::task::yield_now() => {}
            }
            let summary = self.run_simulated(clock, SECONDS_PER_DAY)?;
            info!(
                day,
                starts = summary.starts,
                stops = summary.stops,
                total_changes = summary.total_changes,
                "Simulated day complete."
            );
        }
        Ok(())
    }
}
