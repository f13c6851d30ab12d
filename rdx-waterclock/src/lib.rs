//! # Waterclock
//!
//! A tick-driven scheduler for irrigation controller watering programs.
//!
//! Waterclock decides, once per clock tick, which watering program should own
//! the controller's station sequence, steps that program through its station
//! blocks, and records every start/stop transition in a durable event log.
//!
//! ## Core Concepts
//!
//! - **Program**: a time-of-day trigger (on even days, odd days or chosen
//!   weekdays) plus an ordered list of station blocks with durations.
//! - **ProgramRegistry**: owns every program, hands out gap-filled ids and
//!   keeps memory and the per-program JSON files in sync via dirty flags and
//!   cached modification times.
//! - **Single active program**: at most one program runs at a time. A running
//!   program is never preempted; a second program due at the same time is
//!   logged as a configuration conflict and skipped.
//! - **EventLog**: a SQLite audit trail. Event rows are buffered in a
//!   transaction until `persist` is called.
//! - **WaterclockEngine**: the tick driver, fed by a `WallClock` or `SimClock`.
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use waterclock::prelude::*;
//! use chrono::{NaiveDate, NaiveTime};
//!
//! fn main() -> anyhow::Result<()> {
//!     // 1. Build the engine from a configuration.
//!     let mut engine = WaterclockEngine::from_config(WaterclockConfig::default())?;
//!
//!     // 2. Define a program: even days at 06:00, two stations in turn.
//!     let lawn = Program::new("lawn", TriggerPattern::EvenDay, NaiveTime::from_hms_opt(6, 0, 0).unwrap())
//!         .with_block(1, 300)
//!         .with_block(2, 600);
//!     engine.registry_mut().add(lawn);
//!
//!     // 3. Load the rest from disk and register everything with the log.
//!     engine.startup()?;
//!
//!     // 4. Simulate a day, then persist events and programs.
//!     let mut clock = SimClock::starting_at(NaiveDate::from_ymd_opt(2024, 6, 2).unwrap(), chrono_tz::Tz::UTC);
//!     let summary = engine.run_simulated(&mut clock, 24 * 3600)?;
//!     println!("{} program runs", summary.starts);
//!     engine.shutdown()?;
//!     Ok(())
//! }
//! ```

pub const ENGINE_NAME: &str = "Waterclock";
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// Declare all the modules in the crate.
pub mod clock;
pub mod common;
pub mod config;
pub mod engine;
pub mod error;
pub mod event_log;
pub mod events;
pub mod program;
pub mod registry;
pub mod scheduler;

/// A prelude module for easy importing of the most common Waterclock types.
pub mod prelude {
    pub use crate::clock::{Clock, Now, SimClock, WallClock};
    pub use crate::common::{station_map, ProgramId, Station, StationId, StationMap};
    pub use crate::config::{ClockResolution, WaterclockConfig};
    pub use crate::engine::{SimulationSummary, WaterclockEngine};
    pub use crate::error::{EventLogError, RegistryError, ScheduleError};
    pub use crate::event_log::{EventLog, EventType, IntervalType, LoggedEvent};
    pub use crate::events::{ScheduleEvent, TickReport};
    pub use crate::program::{Evaluation, Program, StationBlock, TriggerPattern};
    pub use crate::registry::ProgramRegistry;
    pub use crate::scheduler::RunState;
}
