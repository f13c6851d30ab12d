//! Watering programs and the station blocks they sequence through.

use crate::clock::Now;
use crate::common::{ProgramId, Station, StationId, StationMap};
use chrono::{NaiveTime, Timelike};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::{Arc, Weak};

/// The rule that decides which calendar days a program may start on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TriggerPattern {
    /// Days whose day-of-year is even.
    EvenDay,
    /// Days whose day-of-year is odd.
    OddDay,
    /// An explicit set of weekdays, see `Program::days_of_week`.
    DayOfWeek,
}

/// What a program should do on the current tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Evaluation {
    /// Not running and not due.
    Idle,
    /// Not running, and both the day and the time of day match.
    Start,
    /// Running and still inside its station sequence.
    Continue,
    /// Running and the sequence is exhausted.
    Stop,
}

/// One activation of a single station inside a program's sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StationBlock {
    pub station_id: StationId,
    /// Seconds to keep the station active.
    pub duration: u32,
    #[serde(skip)]
    bound_station: Weak<Station>,
    #[serde(skip)]
    start: u32,
    #[serde(skip)]
    end: u32,
}

impl StationBlock {
    pub fn new(station_id: u32, duration: u32) -> Self {
        Self {
            station_id: StationId(station_id),
            duration,
            bound_station: Weak::new(),
            start: 0,
            end: 0,
        }
    }

    /// The station this block drives, if it has been bound and the station
    /// still exists.
    pub fn bound_station(&self) -> Option<Arc<Station>> {
        self.bound_station.upgrade()
    }

    /// Offset of this block from the program's trigger instant, in seconds.
    pub fn start(&self) -> u32 {
        self.start
    }

    pub fn end(&self) -> u32 {
        self.end
    }
}

/// A time-triggered watering program.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Program {
    #[serde(rename = "program_id")]
    pub(crate) id: ProgramId,
    name: String,
    trigger: TriggerPattern,
    #[serde(default)]
    days_of_week: BTreeSet<u8>,
    time_of_day: NaiveTime,
    #[serde(default)]
    station_blocks: Vec<StationBlock>,
    #[serde(skip)]
    pub(crate) running: bool,
    #[serde(skip)]
    pub(crate) dirty: bool,
}

impl Program {
    /// Creates an unregistered program. Its id is assigned by the registry.
    pub fn new(name: impl Into<String>, trigger: TriggerPattern, time_of_day: NaiveTime) -> Self {
        Self {
            id: ProgramId::UNASSIGNED,
            name: name.into(),
            trigger,
            days_of_week: BTreeSet::new(),
            time_of_day,
            station_blocks: Vec::new(),
            running: false,
            dirty: true,
        }
    }

    /// Builder-style helper for day-of-week programs.
    pub fn on_days(mut self, days: impl IntoIterator<Item = u8>) -> Self {
        self.days_of_week = days.into_iter().collect();
        self
    }

    /// Builder-style helper that appends a station block.
    pub fn with_block(mut self, station_id: u32, duration: u32) -> Self {
        self.push_block(StationBlock::new(station_id, duration));
        self
    }

    pub fn id(&self) -> ProgramId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn trigger(&self) -> TriggerPattern {
        self.trigger
    }

    pub fn days_of_week(&self) -> &BTreeSet<u8> {
        &self.days_of_week
    }

    pub fn time_of_day(&self) -> NaiveTime {
        self.time_of_day
    }

    pub fn station_blocks(&self) -> &[StationBlock] {
        &self.station_blocks
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
        self.dirty = true;
    }

    pub fn set_time_of_day(&mut self, time_of_day: NaiveTime) {
        self.time_of_day = time_of_day;
        self.dirty = true;
    }

    /// Changes the trigger pattern. Registered programs go through
    /// `ProgramRegistry::set_trigger`, which also re-indexes them.
    pub(crate) fn set_trigger(
        &mut self,
        trigger: TriggerPattern,
        days: impl IntoIterator<Item = u8>,
    ) {
        self.trigger = trigger;
        self.days_of_week = days.into_iter().collect();
        self.dirty = true;
    }

    pub fn push_block(&mut self, block: StationBlock) {
        self.station_blocks.push(block);
        self.fix_start_end();
        self.dirty = true;
    }

    /// Sum of all block durations, in seconds.
    pub fn total_duration(&self) -> u64 {
        self.station_blocks.iter().map(|b| u64::from(b.duration)).sum()
    }

    /// Checks that every block offset fits the `u32` offset range.
    pub(crate) fn validate(&self) -> Result<(), String> {
        match u32::try_from(self.total_duration()) {
            Ok(_) => Ok(()),
            Err(_) => Err(format!(
                "station blocks add up to {} seconds, more than {} allowed",
                self.total_duration(),
                u32::MAX
            )),
        }
    }

    /// Recomputes each block's `[start, end)` offset by walking the
    /// cumulative durations in order. Offsets saturate at `u32::MAX`.
    pub fn fix_start_end(&mut self) {
        let mut offset: u32 = 0;
        for block in &mut self.station_blocks {
            block.start = offset;
            offset = offset.saturating_add(block.duration);
            block.end = offset;
        }
    }

    /// Attaches every block to its station in `stations`. Unknown station ids
    /// leave the block unbound.
    pub(crate) fn bind(&mut self, stations: &StationMap) -> usize {
        let mut unbound = 0;
        for block in &mut self.station_blocks {
            block.bound_station = match stations.get(&block.station_id) {
                Some(station) => Arc::downgrade(station),
                None => {
                    unbound += 1;
                    Weak::new()
                }
            };
        }
        self.fix_start_end();
        unbound
    }

    /// Index of the block active `elapsed` seconds after the trigger instant.
    pub fn active_block(&self, elapsed: i64) -> Option<usize> {
        let elapsed = u32::try_from(elapsed).ok()?;
        self.station_blocks
            .iter()
            .position(|b| b.start <= elapsed && elapsed < b.end)
    }

    /// Whether `now` falls on a day this program may start.
    pub fn matches_day(&self, now: &Now) -> bool {
        match self.trigger {
            TriggerPattern::EvenDay => now.is_even_day(),
            TriggerPattern::OddDay => !now.is_even_day(),
            TriggerPattern::DayOfWeek => self.days_of_week.contains(&now.day_of_week),
        }
    }

    /// Whether `now` is within one tick of the configured start time.
    pub fn matches_time(&self, now: &Now, granularity: u32) -> bool {
        let target = self.time_of_day.num_seconds_from_midnight() as i64;
        let delta = now.seconds_from_midnight() as i64 - target;
        (0..granularity.max(1) as i64).contains(&delta)
    }

    /// Decides this program's transition for the tick at `now`.
    ///
    /// `since` is the epoch second the program was started at, when it is
    /// running.
    pub fn evaluate(&self, now: &Now, granularity: u32, since: Option<i64>) -> Evaluation {
        match since {
            Some(since) => {
                let total = i64::try_from(self.total_duration()).unwrap_or(i64::MAX);
                if now.epoch - since >= total {
                    Evaluation::Stop
                } else {
                    Evaluation::Continue
                }
            }
            None if self.matches_day(now) && self.matches_time(now, granularity) => {
                Evaluation::Start
            }
            None => Evaluation::Idle,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::station_map;

    fn at(day: u32, dow: u8, h: u32, m: u32, s: u32) -> Now {
        let time = NaiveTime::from_hms_opt(h, m, s).unwrap();
        Now::new(
            day as i64 * 86_400 + time.num_seconds_from_midnight() as i64,
            day,
            dow,
            time,
        )
    }

    fn six_am() -> NaiveTime {
        NaiveTime::from_hms_opt(6, 0, 0).unwrap()
    }

    #[test]
    fn even_day_program_only_starts_on_even_days_at_its_time() {
        let program = Program::new("lawn", TriggerPattern::EvenDay, six_am()).with_block(1, 30);
        assert_eq!(program.evaluate(&at(10, 0, 6, 0, 0), 1, None), Evaluation::Start);
        assert_eq!(program.evaluate(&at(11, 1, 6, 0, 0), 1, None), Evaluation::Idle);
        assert_eq!(program.evaluate(&at(10, 0, 6, 0, 1), 1, None), Evaluation::Idle);
        assert_eq!(program.evaluate(&at(10, 0, 5, 59, 59), 1, None), Evaluation::Idle);
    }

    #[test]
    fn coarse_ticks_match_within_granularity() {
        let program = Program::new("lawn", TriggerPattern::OddDay, six_am());
        assert!(program.matches_time(&at(1, 0, 6, 0, 59), 60));
        assert!(!program.matches_time(&at(1, 0, 6, 1, 0), 60));
    }

    #[test]
    fn day_of_week_program_checks_membership() {
        let program = Program::new("beds", TriggerPattern::DayOfWeek, six_am()).on_days([0, 3]);
        assert_eq!(program.evaluate(&at(5, 3, 6, 0, 0), 1, None), Evaluation::Start);
        assert_eq!(program.evaluate(&at(6, 4, 6, 0, 0), 1, None), Evaluation::Idle);
    }

    #[test]
    fn sequence_stops_once_all_blocks_elapse() {
        let program = Program::new("lawn", TriggerPattern::EvenDay, six_am())
            .with_block(1, 30)
            .with_block(2, 60);
        let start = at(10, 0, 6, 0, 0);
        let later = |secs: i64| Now { epoch: start.epoch + secs, ..start };

        assert_eq!(program.evaluate(&later(89), 1, Some(start.epoch)), Evaluation::Continue);
        assert_eq!(program.evaluate(&later(90), 1, Some(start.epoch)), Evaluation::Stop);
    }

    #[test]
    fn offsets_follow_cumulative_durations() {
        let program = Program::new("lawn", TriggerPattern::EvenDay, six_am())
            .with_block(1, 30)
            .with_block(2, 0)
            .with_block(3, 60);
        let offsets: Vec<_> = program
            .station_blocks()
            .iter()
            .map(|b| (b.start(), b.end()))
            .collect();
        assert_eq!(offsets, vec![(0, 30), (30, 30), (30, 90)]);
        assert_eq!(program.active_block(0), Some(0));
        assert_eq!(program.active_block(30), Some(2));
        assert_eq!(program.active_block(90), None);
        assert_eq!(program.active_block(-1), None);
    }

    #[test]
    fn oversized_sequences_saturate_and_fail_validation() {
        let mut program = Program::new("lawn", TriggerPattern::EvenDay, six_am())
            .with_block(1, u32::MAX)
            .with_block(2, 1);
        assert_eq!(program.total_duration(), u64::from(u32::MAX) + 1);
        assert_eq!(program.station_blocks()[1].end(), u32::MAX);
        assert!(program.validate().is_err());

        program.station_blocks.pop();
        assert!(program.validate().is_ok());
    }

    #[test]
    fn binding_holds_weak_references() {
        let mut program = Program::new("lawn", TriggerPattern::EvenDay, six_am())
            .with_block(1, 30)
            .with_block(9, 30);
        let stations = station_map([Station::new(1, "front")]);

        assert_eq!(program.bind(&stations), 1);
        let bound = program.station_blocks()[0].bound_station().unwrap();
        assert_eq!(bound.name, "front");
        assert!(program.station_blocks()[1].bound_station().is_none());

        drop(bound);
        drop(stations);
        assert!(program.station_blocks()[0].bound_station().is_none());
    }

    #[test]
    fn file_format_uses_pattern_codes() {
        let mut program = Program::new("lawn", TriggerPattern::DayOfWeek, six_am())
            .on_days([1])
            .with_block(4, 120);
        program.id = ProgramId(3);
        let json = serde_json::to_value(&program).unwrap();
        assert_eq!(json["program_id"], 3);
        assert_eq!(json["trigger"], "DAY_OF_WEEK");
        assert_eq!(json["time_of_day"], "06:00:00");
        assert_eq!(json["station_blocks"][0]["duration"], 120);
        assert!(json.get("running").is_none());
    }
}
