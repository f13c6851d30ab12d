//! Defines the public event types produced by the engine on each tick.
//!
//! Every transition the engine records in the event log is also broadcast as
//! a `ScheduleEvent`, and summarized per tick in a `TickReport`.

use crate::common::{ProgramId, StationId};

/// A single program or station transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleEvent {
    ProgramStarted { program: ProgramId, epoch: i64 },
    ProgramStopped { program: ProgramId, epoch: i64 },
    StationStarted {
        program: ProgramId,
        station: StationId,
        epoch: i64,
    },
    StationStopped {
        program: ProgramId,
        station: StationId,
        epoch: i64,
    },
}

/// What happened during one tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Program that started on this tick.
    pub started: Option<ProgramId>,
    /// Program that kept running through this tick.
    pub continued: Option<ProgramId>,
    /// Program whose sequence finished on this tick.
    pub stopped: Option<ProgramId>,
    /// Every transition, in the order it was logged.
    pub events: Vec<ScheduleEvent>,
    /// Event log row counter after the tick.
    pub total_changes: u64,
    /// Whether this tick wrote anything to the event log.
    pub changed: bool,
}

impl TickReport {
    /// True when a program started or stopped on this tick.
    pub fn is_transition(&self) -> bool {
        self.started.is_some() || self.stopped.is_some()
    }
}
