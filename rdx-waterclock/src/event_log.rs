//! Durable audit trail of program and station start/stop transitions.
//!
//! [`EventLog`] appends rows to a SQLite database. Reference data
//! (stations, programs and their blocks) is registered in all-or-nothing
//! batches that commit immediately. Event rows do not: they accumulate in an
//! open transaction until [`EventLog::persist`] commits them, so a crash
//! before `persist` loses at most the rows written since the last commit.

use crate::clock::Now;
use crate::common::{ProgramId, Station, StationId};
use crate::error::EventLogError;
use crate::program::{Program, TriggerPattern};
use chrono::Utc;
use rusqlite::{params, Connection};
use rusqlite_migration::{Migrations, M};
use std::path::Path;
use tracing::{debug, info};

/// Schema migrations, applied in order via `user_version` tracking.
fn migrations() -> Migrations<'static> {
    Migrations::new(vec![M::up(include_str!("migrations/001_event_log.sql"))])
}

/// A program or station lifecycle transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Start,
    Stop,
}

impl EventType {
    pub const ALL: [EventType; 2] = [EventType::Start, EventType::Stop];

    /// Stable code stored in the `event_type` column.
    pub fn code(self) -> i64 {
        match self {
            EventType::Start => 1,
            EventType::Stop => 2,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            EventType::Start => "START",
            EventType::Stop => "STOP",
        }
    }

    pub fn from_code(code: i64) -> Result<Self, EventLogError> {
        Self::ALL
            .into_iter()
            .find(|e| e.code() == code)
            .ok_or(EventLogError::UnknownCode {
                kind: "event type",
                code,
            })
    }
}

/// Persisted form of a program's trigger pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntervalType {
    EvenDay,
    OddDay,
    DayOfWeek,
}

impl IntervalType {
    pub const ALL: [IntervalType; 3] = [
        IntervalType::EvenDay,
        IntervalType::OddDay,
        IntervalType::DayOfWeek,
    ];

    /// Stable code stored in the `interval_type` column.
    pub fn code(self) -> i64 {
        match self {
            IntervalType::EvenDay => 1,
            IntervalType::OddDay => 2,
            IntervalType::DayOfWeek => 3,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            IntervalType::EvenDay => "EVEN_DAY",
            IntervalType::OddDay => "ODD_DAY",
            IntervalType::DayOfWeek => "DAY_OF_WEEK",
        }
    }
}

impl From<TriggerPattern> for IntervalType {
    fn from(pattern: TriggerPattern) -> Self {
        match pattern {
            TriggerPattern::EvenDay => IntervalType::EvenDay,
            TriggerPattern::OddDay => IntervalType::OddDay,
            TriggerPattern::DayOfWeek => IntervalType::DayOfWeek,
        }
    }
}

/// One row of the program or station event tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoggedEvent {
    pub epoch: i64,
    pub event: EventType,
}

/// SQLite-backed event log. The connection is owned exclusively.
pub struct EventLog {
    conn: Connection,
}

impl EventLog {
    /// Opens (or creates) the event store at `path`, migrating the schema
    /// and seeding the lookup tables.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, EventLogError> {
        let conn = Connection::open(path.as_ref())?;
        let log = Self::prepare(conn)?;
        info!(path = %path.as_ref().display(), "Event log opened.");
        Ok(log)
    }

    /// Opens an in-memory event store (for testing).
    pub fn in_memory() -> Result<Self, EventLogError> {
        Self::prepare(Connection::open_in_memory()?)
    }

    fn prepare(mut conn: Connection) -> Result<Self, EventLogError> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        migrations()
            .to_latest(&mut conn)
            .map_err(|e| EventLogError::Migration(e.to_string()))?;

        {
            let tx = conn.transaction()?;
            for event in EventType::ALL {
                tx.execute(
                    "INSERT OR IGNORE INTO event_type (id, name) VALUES (?1, ?2)",
                    params![event.code(), event.name()],
                )?;
            }
            for interval in IntervalType::ALL {
                tx.execute(
                    "INSERT OR IGNORE INTO interval_type (id, name) VALUES (?1, ?2)",
                    params![interval.code(), interval.name()],
                )?;
            }
            tx.commit()?;
        }
        Ok(Self { conn })
    }

    /// Registers (or refreshes) station reference rows in one batch.
    pub fn register_stations<'a>(
        &mut self,
        stations: impl IntoIterator<Item = &'a Station>,
    ) -> Result<usize, EventLogError> {
        let sp = self.conn.savepoint()?;
        let mut count = 0;
        {
            let mut stmt =
                sp.prepare_cached("INSERT OR REPLACE INTO stations (id, name) VALUES (?1, ?2)")?;
            for station in stations {
                stmt.execute(params![station.id.0, station.name])?;
                count += 1;
            }
        }
        sp.commit()?;
        self.persist()?;
        debug!(count, "Stations registered.");
        Ok(count)
    }

    /// Registers (or refreshes) program reference rows, plus one row per
    /// station block, in one batch.
    pub fn register_programs<'a>(
        &mut self,
        programs: impl IntoIterator<Item = &'a Program>,
    ) -> Result<usize, EventLogError> {
        let sp = self.conn.savepoint()?;
        let mut count = 0;
        {
            let mut program_stmt = sp.prepare_cached(
                "INSERT OR REPLACE INTO programs (id, name, interval_type, time_of_day)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            let mut clear_stmt =
                sp.prepare_cached("DELETE FROM program_stations WHERE program_id = ?1")?;
            let mut block_stmt = sp.prepare_cached(
                "INSERT INTO program_stations (program_id, position, station_id, duration)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            for program in programs {
                let id = program.id().0;
                program_stmt.execute(params![
                    id,
                    program.name(),
                    IntervalType::from(program.trigger()).code(),
                    program.time_of_day().format("%H:%M:%S").to_string(),
                ])?;
                clear_stmt.execute(params![id])?;
                for (position, block) in program.station_blocks().iter().enumerate() {
                    block_stmt.execute(params![
                        id,
                        position as i64,
                        block.station_id.0,
                        block.duration
                    ])?;
                }
                count += 1;
            }
        }
        sp.commit()?;
        self.persist()?;
        debug!(count, "Programs registered.");
        Ok(count)
    }

    pub fn log_program_start(
        &mut self,
        program: ProgramId,
        now: Option<&Now>,
    ) -> Result<(), EventLogError> {
        self.append("program_events", "program_id", program.0, EventType::Start, now)
    }

    pub fn log_program_stop(
        &mut self,
        program: ProgramId,
        now: Option<&Now>,
    ) -> Result<(), EventLogError> {
        self.append("program_events", "program_id", program.0, EventType::Stop, now)
    }

    pub fn log_station_start(
        &mut self,
        station: StationId,
        now: Option<&Now>,
    ) -> Result<(), EventLogError> {
        self.append("station_events", "station_id", station.0, EventType::Start, now)
    }

    pub fn log_station_stop(
        &mut self,
        station: StationId,
        now: Option<&Now>,
    ) -> Result<(), EventLogError> {
        self.append("station_events", "station_id", station.0, EventType::Stop, now)
    }

    /// Commits every pending event row. A no-op when nothing is pending.
    pub fn persist(&mut self) -> Result<(), EventLogError> {
        if self.has_pending() {
            self.conn.execute_batch("COMMIT")?;
        }
        Ok(())
    }

    /// True while event rows are waiting for `persist`.
    pub fn has_pending(&self) -> bool {
        !self.conn.is_autocommit()
    }

    /// Rows inserted, updated or deleted since the connection was opened.
    pub fn total_changes(&self) -> Result<u64, EventLogError> {
        let changes: i64 = self
            .conn
            .prepare_cached("SELECT total_changes()")?
            .query_row([], |row| row.get(0))?;
        Ok(changes.max(0) as u64)
    }

    /// Every event recorded for `program`, oldest first.
    pub fn program_events(&self, program: ProgramId) -> Result<Vec<LoggedEvent>, EventLogError> {
        self.events("program_events", "program_id", program.0)
    }

    /// Every event recorded for `station`, oldest first.
    pub fn station_events(&self, station: StationId) -> Result<Vec<LoggedEvent>, EventLogError> {
        self.events("station_events", "station_id", station.0)
    }

    fn append(
        &mut self,
        table: &str,
        column: &str,
        subject: u32,
        event: EventType,
        now: Option<&Now>,
    ) -> Result<(), EventLogError> {
        let epoch = now.map_or_else(|| Utc::now().timestamp(), |n| n.epoch);
        if self.conn.is_autocommit() {
            self.conn.execute_batch("BEGIN")?;
        }
        self.conn
            .prepare_cached(&format!(
                "INSERT INTO {table} (epoch, {column}, event_type) VALUES (?1, ?2, ?3)"
            ))?
            .execute(params![epoch, subject, event.code()])?;
        Ok(())
    }

    fn events(
        &self,
        table: &str,
        column: &str,
        subject: u32,
    ) -> Result<Vec<LoggedEvent>, EventLogError> {
        let mut stmt = self.conn.prepare_cached(&format!(
            "SELECT epoch, event_type FROM {table} WHERE {column} = ?1 ORDER BY id"
        ))?;
        let rows = stmt.query_map(params![subject], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?))
        })?;
        let mut events = Vec::new();
        for row in rows {
            let (epoch, code) = row?;
            events.push(LoggedEvent {
                epoch,
                event: EventType::from_code(code)?,
            });
        }
        Ok(events)
    }
}
