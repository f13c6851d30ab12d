//! The scheduling decision engine.
//!
//! Once per tick the engine asks the registry which program should own the
//! station sequence. A running program always wins (there is no preemption),
//! otherwise the even/odd candidates for today's parity are scanned first and
//! the day-of-week candidates second. Within a set the first program to match
//! wins, in registration order.

use crate::clock::Now;
use crate::common::ProgramId;
use crate::error::ScheduleError;
use crate::event_log::EventLog;
use crate::program::{Evaluation, TriggerPattern};
use crate::registry::ProgramRegistry;
use indexmap::IndexSet;
use tracing::{debug, info, warn};

/// Which program, if any, currently owns the station sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunState {
    #[default]
    Idle,
    Running {
        id: ProgramId,
        /// Epoch second the program was started at.
        since: i64,
    },
}

impl RunState {
    pub fn running_id(&self) -> Option<ProgramId> {
        match self {
            RunState::Running { id, .. } => Some(*id),
            RunState::Idle => None,
        }
    }

    pub fn is_running(&self, id: ProgramId) -> bool {
        self.running_id() == Some(id)
    }
}

/// Program ids partitioned by trigger pattern, kept up to date as programs
/// are added, replaced, loaded and deleted.
#[derive(Debug, Default)]
pub struct TriggerIndex {
    even: IndexSet<ProgramId>,
    odd: IndexSet<ProgramId>,
    day_of_week: IndexSet<ProgramId>,
}

impl TriggerIndex {
    pub fn insert(&mut self, id: ProgramId, pattern: TriggerPattern) {
        if self.set(pattern).contains(&id) {
            return;
        }
        self.remove(id);
        self.set_mut(pattern).insert(id);
    }

    pub fn remove(&mut self, id: ProgramId) {
        self.even.shift_remove(&id);
        self.odd.shift_remove(&id);
        self.day_of_week.shift_remove(&id);
    }

    /// Candidates for the even/odd scan on the day `now` falls on.
    pub fn parity(&self, now: &Now) -> &IndexSet<ProgramId> {
        if now.is_even_day() {
            &self.even
        } else {
            &self.odd
        }
    }

    pub fn day_of_week(&self) -> &IndexSet<ProgramId> {
        &self.day_of_week
    }

    fn set(&self, pattern: TriggerPattern) -> &IndexSet<ProgramId> {
        match pattern {
            TriggerPattern::EvenDay => &self.even,
            TriggerPattern::OddDay => &self.odd,
            TriggerPattern::DayOfWeek => &self.day_of_week,
        }
    }

    fn set_mut(&mut self, pattern: TriggerPattern) -> &mut IndexSet<ProgramId> {
        match pattern {
            TriggerPattern::EvenDay => &mut self.even,
            TriggerPattern::OddDay => &mut self.odd,
            TriggerPattern::DayOfWeek => &mut self.day_of_week,
        }
    }
}

impl ProgramRegistry {
    pub fn run_state(&self) -> RunState {
        self.run_state
    }

    pub fn running_program(&self) -> Option<ProgramId> {
        self.run_state.running_id()
    }

    /// Returns the program that should own the station sequence at `now`.
    ///
    /// A running program is returned as-is. Otherwise this is the first
    /// candidate due to start, or `None` when nothing is due. Selecting a
    /// candidate does not start it; that is `move_program`'s job. Any further
    /// program that is due at the same instant is reported as a
    /// configuration conflict and ignored.
    pub fn get_program_to_run(&self, now: &Now) -> Option<ProgramId> {
        let due = self.due_programs(now);
        let selected = self.run_state.running_id().or_else(|| due.first().copied());

        if let Some(selected) = selected {
            for eligible in due.into_iter().filter(|id| *id != selected) {
                let conflict = ScheduleError::ConfigurationConflict {
                    running: selected,
                    eligible,
                };
                warn!("{}", conflict);
            }
        }
        selected
    }

    /// Moves a program between idle and running, recording the transition
    /// in `log`.
    ///
    /// Starting a program while a different one is running is refused with
    /// `ConfigurationConflict`. Requests that would not change anything
    /// (starting the running program, stopping an idle one) are no-ops. The
    /// log row is appended before any state changes, so a storage failure
    /// leaves the registry untouched.
    pub fn move_program(
        &mut self,
        id: ProgramId,
        running: bool,
        now: &Now,
        log: &mut EventLog,
    ) -> Result<(), ScheduleError> {
        if !self.contains(id) {
            return Err(ScheduleError::NotFound(id));
        }

        match (running, self.run_state) {
            (true, RunState::Running { id: current, .. }) if current == id => Ok(()),
            (true, RunState::Running { id: current, .. }) => {
                Err(ScheduleError::ConfigurationConflict {
                    running: current,
                    eligible: id,
                })
            }
            (true, RunState::Idle) => {
                log.log_program_start(id, Some(now))?;
                self.set_running_flag(id, true);
                self.run_state = RunState::Running {
                    id,
                    since: now.epoch,
                };
                info!(program = %id, epoch = now.epoch, "Program started.");
                Ok(())
            }
            (false, RunState::Running { id: current, .. }) if current == id => {
                log.log_program_stop(id, Some(now))?;
                self.set_running_flag(id, false);
                self.run_state = RunState::Idle;
                info!(program = %id, epoch = now.epoch, "Program stopped.");
                Ok(())
            }
            (false, _) => {
                debug!(program = %id, "Stop requested for a program that is not running.");
                Ok(())
            }
        }
    }

    /// All idle programs due to start at `now`, in scan order: the parity set
    /// first, then the day-of-week set.
    fn due_programs(&self, now: &Now) -> Vec<ProgramId> {
        let granularity = self.tick_granularity;
        self.index
            .parity(now)
            .iter()
            .chain(self.index.day_of_week().iter())
            .copied()
            .filter(|id| !self.run_state.is_running(*id))
            .filter(|id| {
                self.get(*id)
                    .is_some_and(|p| p.evaluate(now, granularity, None) == Evaluation::Start)
            })
            .collect()
    }

    fn set_running_flag(&mut self, id: ProgramId, running: bool) {
        if let Some(program) = self.program_mut(id) {
            program.running = running;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::Program;
    use chrono::{NaiveTime, Timelike};

    fn at(day: u32, dow: u8, h: u32, m: u32) -> Now {
        let time = NaiveTime::from_hms_opt(h, m, 0).unwrap();
        Now::new(
            day as i64 * 86_400 + time.num_seconds_from_midnight() as i64,
            day,
            dow,
            time,
        )
    }

    fn program(pattern: TriggerPattern, h: u32) -> Program {
        Program::new("p", pattern, NaiveTime::from_hms_opt(h, 0, 0).unwrap()).with_block(1, 600)
    }

    fn registry() -> (tempfile::TempDir, ProgramRegistry) {
        let dir = tempfile::tempdir().unwrap();
        let registry = ProgramRegistry::new(dir.path()).unwrap();
        (dir, registry)
    }

    #[test]
    fn index_moves_ids_between_sets() {
        let mut index = TriggerIndex::default();
        index.insert(ProgramId(1), TriggerPattern::EvenDay);
        index.insert(ProgramId(1), TriggerPattern::DayOfWeek);
        assert!(index.parity(&at(2, 0, 0, 0)).is_empty());
        assert!(index.day_of_week().contains(&ProgramId(1)));
        index.remove(ProgramId(1));
        assert!(index.day_of_week().is_empty());
    }

    #[test]
    fn parity_candidates_are_scanned_before_day_of_week() {
        let (_dir, mut registry) = registry();
        let dow = registry.add(program(TriggerPattern::DayOfWeek, 6).on_days([2]));
        let even = registry.add(program(TriggerPattern::EvenDay, 6));

        assert_eq!(registry.get_program_to_run(&at(4, 2, 6, 0)), Some(even));
        // Odd day: only the weekday program is eligible.
        assert_eq!(registry.get_program_to_run(&at(5, 2, 6, 0)), Some(dow));
        assert_eq!(registry.get_program_to_run(&at(5, 3, 6, 0)), None);
    }

    #[test]
    fn retriggered_program_is_found_on_its_new_days() {
        let (_dir, mut registry) = registry();
        let id = registry.add(program(TriggerPattern::EvenDay, 6));
        registry
            .set_trigger(id, TriggerPattern::DayOfWeek, [3])
            .unwrap();

        assert_eq!(registry.get_program_to_run(&at(5, 3, 6, 0)), Some(id));
        assert_eq!(registry.get_program_to_run(&at(4, 2, 6, 0)), None);
    }

    #[test]
    fn first_registered_wins_within_a_set() {
        let (_dir, mut registry) = registry();
        let first = registry.add(program(TriggerPattern::OddDay, 7));
        registry.add(program(TriggerPattern::OddDay, 7));
        assert_eq!(registry.get_program_to_run(&at(3, 0, 7, 0)), Some(first));
    }

    #[test]
    fn running_program_is_returned_unconditionally() {
        let (_dir, mut registry) = registry();
        let mut log = EventLog::in_memory().unwrap();
        let a = registry.add(program(TriggerPattern::EvenDay, 6));
        let b = registry.add(program(TriggerPattern::EvenDay, 7));

        let start = at(2, 0, 6, 0);
        registry.move_program(a, true, &start, &mut log).unwrap();
        assert_eq!(registry.get_program_to_run(&at(2, 0, 7, 0)), Some(a));
        assert_eq!(registry.get_program_to_run(&at(3, 0, 1, 0)), Some(a));

        let err = registry
            .move_program(b, true, &at(2, 0, 7, 0), &mut log)
            .unwrap_err();
        assert!(matches!(
            err,
            ScheduleError::ConfigurationConflict { running, eligible } if running == a && eligible == b
        ));
        assert!(registry[a].is_running());
        assert!(!registry[b].is_running());
    }

    #[test]
    fn move_program_tracks_state_and_logs() {
        let (_dir, mut registry) = registry();
        let mut log = EventLog::in_memory().unwrap();
        let id = registry.add(program(TriggerPattern::EvenDay, 6));
        let now = at(2, 0, 6, 0);

        let other = registry.add(program(TriggerPattern::OddDay, 6));
        assert_eq!(registry.running_program(), None);

        registry.move_program(id, true, &now, &mut log).unwrap();
        assert_eq!(
            registry.run_state(),
            RunState::Running {
                id,
                since: now.epoch
            }
        );
        assert_eq!(registry.running_program(), Some(id));
        let idle: Vec<_> = registry.non_running_programs().map(|p| p.id()).collect();
        assert_eq!(idle, vec![other]);
        registry.move_program(id, true, &now, &mut log).unwrap();
        registry.move_program(id, false, &now, &mut log).unwrap();
        registry.move_program(id, false, &now, &mut log).unwrap();

        assert_eq!(registry.run_state(), RunState::Idle);
        assert_eq!(registry.running_program(), None);
        assert_eq!(registry.non_running_programs().count(), 2);
        assert_eq!(log.program_events(id).unwrap().len(), 2);
    }

    #[test]
    fn move_program_rejects_unknown_ids() {
        let (_dir, mut registry) = registry();
        let mut log = EventLog::in_memory().unwrap();
        let err = registry
            .move_program(ProgramId(4), true, &at(2, 0, 6, 0), &mut log)
            .unwrap_err();
        assert!(matches!(err, ScheduleError::NotFound(ProgramId(4))));
    }
}
