//! The program registry: the single source of truth for program definitions.
//!
//! The registry owns every `Program`, hands out identifiers, and mediates
//! between the in-memory set and the per-program JSON files in its directory.
//! Scheduling state (which program is running, and the trigger index used to
//! find candidates) also lives here, see `crate::scheduler`.

use crate::common::{ProgramId, StationMap};
use crate::error::RegistryError;
use crate::program::{Program, TriggerPattern};
use crate::scheduler::{RunState, TriggerIndex};
use indexmap::IndexMap;
use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, info, warn};

const FILE_PREFIX: &str = "program_";
const FILE_SUFFIX: &str = ".json";

/// Owns all programs and their backing files.
#[derive(Debug)]
pub struct ProgramRegistry {
    programs_dir: PathBuf,
    programs: IndexMap<ProgramId, Program>,
    mtimes: HashMap<PathBuf, SystemTime>,
    load_failures: Vec<RegistryError>,
    pub(crate) index: TriggerIndex,
    pub(crate) run_state: RunState,
    pub(crate) tick_granularity: u32,
}

// Core implementation block for file handling.
impl ProgramRegistry {
    /// Creates an empty registry backed by `programs_dir`, creating the
    /// directory if it does not exist.
    pub fn new(programs_dir: impl Into<PathBuf>) -> Result<Self, RegistryError> {
        let programs_dir = programs_dir.into();
        fs::create_dir_all(&programs_dir).map_err(|e| RegistryError::io(&programs_dir, e))?;
        Ok(Self {
            programs_dir,
            programs: IndexMap::new(),
            mtimes: HashMap::new(),
            load_failures: Vec::new(),
            index: TriggerIndex::default(),
            run_state: RunState::Idle,
            tick_granularity: 1,
        })
    }

    /// Sets how many seconds a single tick spans when matching start times.
    pub fn with_tick_granularity(mut self, seconds: u32) -> Self {
        self.tick_granularity = seconds.max(1);
        self
    }

    pub fn programs_dir(&self) -> &Path {
        &self.programs_dir
    }

    /// Points the registry at a different directory. Cached modification
    /// times are dropped, so the next `load_all` reads every file there.
    pub fn change_programs_dir(&mut self, path: impl Into<PathBuf>) -> Result<(), RegistryError> {
        let path = path.into();
        if path == self.programs_dir {
            return Ok(());
        }
        fs::create_dir_all(&path).map_err(|e| RegistryError::io(&path, e))?;
        self.programs_dir = path;
        self.mtimes.clear();
        Ok(())
    }

    /// The file a program with `id` is persisted to.
    pub fn program_path(&self, id: ProgramId) -> PathBuf {
        self.programs_dir
            .join(format!("{FILE_PREFIX}{}{FILE_SUFFIX}", id.0))
    }

    /// Serializes one program to its file and clears its dirty flag.
    ///
    /// The JSON is written to a temporary sibling and renamed into place, so
    /// a reader never observes a half-written file.
    pub fn write(&mut self, id: ProgramId) -> Result<(), RegistryError> {
        let path = self.program_path(id);
        let program = self.programs.get(&id).ok_or(RegistryError::NotFound(id))?;
        let json = serde_json::to_vec_pretty(program).map_err(|source| RegistryError::Parse {
            path: path.clone(),
            source,
        })?;

        let temp_path = path.with_extension("json.tmp");
        write_synced(&temp_path, &json).map_err(|e| RegistryError::io(&temp_path, e))?;
        fs::rename(&temp_path, &path).map_err(|e| RegistryError::io(&path, e))?;

        // Our own writes must not look like external edits on the next scan.
        if let Ok(modified) = fs::metadata(&path).and_then(|m| m.modified()) {
            self.mtimes.insert(path.clone(), modified);
        }
        if let Some(program) = self.programs.get_mut(&id) {
            program.dirty = false;
        }
        debug!(program = %id, path = %path.display(), "Program written.");
        Ok(())
    }

    /// Writes every dirty program. Clean programs are skipped.
    pub fn write_all(&mut self) -> Result<usize, RegistryError> {
        let dirty: Vec<ProgramId> = self
            .programs
            .values()
            .filter(|p| p.dirty)
            .map(|p| p.id)
            .collect();
        for id in &dirty {
            self.write(*id)?;
        }
        Ok(dirty.len())
    }

    /// Scans the programs directory and (re)loads every file that is new or
    /// has changed since it was last read.
    ///
    /// A file that cannot be read or parsed, whose blocks overflow the offset
    /// range, or whose `program_id` disagrees with its file name is logged
    /// and skipped; the failures of the latest scan are available from `load_failures`.
    /// Returns the number of programs loaded by this call.
    pub fn load_all(&mut self) -> Result<usize, RegistryError> {
        self.load_failures.clear();
        let entries =
            fs::read_dir(&self.programs_dir).map_err(|e| RegistryError::io(&self.programs_dir, e))?;

        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| is_program_file(path))
            .collect();
        paths.sort();

        let mut loaded = Vec::new();
        for path in paths {
            let modified = match fs::metadata(&path).and_then(|m| m.modified()) {
                Ok(modified) => modified,
                Err(e) => {
                    self.record_failure(RegistryError::io(&path, e));
                    continue;
                }
            };
            if self.mtimes.get(&path).is_some_and(|cached| *cached >= modified) {
                continue;
            }
            match read_program(&path) {
                Ok(program) => {
                    self.mtimes.insert(path, modified);
                    loaded.push(program);
                }
                Err(e) => self.record_failure(e),
            }
        }

        let count = loaded.len();
        for mut program in loaded {
            program.fix_start_end();
            if let Some(id) = self.run_state.running_id() {
                program.running = id == program.id;
            }
            self.index.insert(program.id, program.trigger());
            self.programs.insert(program.id, program);
        }
        if count > 0 {
            info!(count, dir = %self.programs_dir.display(), "Programs loaded.");
        }
        Ok(count)
    }

    /// Failures recorded by the most recent `load_all`.
    pub fn load_failures(&self) -> &[RegistryError] {
        &self.load_failures
    }

    fn record_failure(&mut self, error: RegistryError) {
        warn!("Skipping program file: {}", error);
        self.load_failures.push(error);
    }
}

// Public API implementation block.
impl ProgramRegistry {
    /// Adds a program under the smallest unused id and marks it dirty.
    pub fn add(&mut self, program: Program) -> ProgramId {
        let id = next_free_id(self.programs.keys().copied());
        let mut program = program;
        program.id = id;
        program.running = false;
        program.dirty = true;
        program.fix_start_end();
        self.index.insert(id, program.trigger());
        self.programs.insert(id, program);
        debug!(program = %id, "Program added.");
        id
    }

    /// Adds a program and, when `write_through` is set, persists it at once.
    pub fn add_with(
        &mut self,
        program: Program,
        write_through: bool,
    ) -> Result<ProgramId, RegistryError> {
        let id = self.add(program);
        if write_through {
            self.write(id)?;
        }
        Ok(id)
    }

    /// Replaces the program stored under `id`, or adds it when `id` is free.
    ///
    /// Returns the id the program ended up under.
    pub fn replace(&mut self, id: ProgramId, program: Program) -> ProgramId {
        let Some(existing) = self.programs.get_mut(&id) else {
            return self.add(program);
        };
        let running = existing.running;
        *existing = program;
        existing.id = id;
        existing.running = running;
        existing.dirty = true;
        existing.fix_start_end();
        let trigger = existing.trigger();
        self.index.insert(id, trigger);
        id
    }

    /// Removes a program and deletes its file.
    pub fn delete(&mut self, id: ProgramId) -> Result<Program, RegistryError> {
        if !self.programs.contains_key(&id) {
            return Err(RegistryError::NotFound(id));
        }
        let path = self.program_path(id);
        match fs::remove_file(&path) {
            Ok(()) => {}
            // Never written, nothing to remove.
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(RegistryError::io(&path, e)),
        }
        self.mtimes.remove(&path);
        self.index.remove(id);
        if self.run_state.running_id() == Some(id) {
            warn!(program = %id, "Deleted the running program; scheduler is now idle.");
            self.run_state = RunState::Idle;
        }

        let mut program = self
            .programs
            .shift_remove(&id)
            .ok_or(RegistryError::NotFound(id))?;
        program.id = ProgramId::UNASSIGNED;
        program.running = false;
        program.dirty = false;
        info!(program = %id, "Program deleted.");
        Ok(program)
    }

    /// Binds every station block to its station and recomputes block offsets.
    pub fn bind_stations(&mut self, stations: &StationMap) {
        for program in self.programs.values_mut() {
            let unbound = program.bind(stations);
            if unbound > 0 {
                warn!(
                    program = %program.id,
                    unbound,
                    "Program references stations the controller does not have."
                );
            }
        }
    }

    pub fn get(&self, id: ProgramId) -> Option<&Program> {
        self.programs.get(&id)
    }

    /// Changes a registered program's trigger pattern and moves it to the
    /// matching candidate set.
    pub fn set_trigger(
        &mut self,
        id: ProgramId,
        trigger: TriggerPattern,
        days: impl IntoIterator<Item = u8>,
    ) -> Result<(), RegistryError> {
        let program = self.programs.get_mut(&id).ok_or(RegistryError::NotFound(id))?;
        program.set_trigger(trigger, days);
        self.index.insert(id, trigger);
        debug!(program = %id, ?trigger, "Trigger changed.");
        Ok(())
    }

    /// Mutable access for edits. The program is marked dirty up front.
    pub fn get_mut(&mut self, id: ProgramId) -> Option<&mut Program> {
        let program = self.programs.get_mut(&id)?;
        program.dirty = true;
        Some(program)
    }

    pub fn contains(&self, id: ProgramId) -> bool {
        self.programs.contains_key(&id)
    }

    pub fn ids(&self) -> impl Iterator<Item = ProgramId> + '_ {
        self.programs.keys().copied()
    }

    /// Programs in insertion order.
    pub fn programs(&self) -> impl Iterator<Item = &Program> {
        self.programs.values()
    }

    pub fn non_running_programs(&self) -> impl Iterator<Item = &Program> {
        self.programs.values().filter(|p| !p.running)
    }

    pub fn len(&self) -> usize {
        self.programs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.programs.is_empty()
    }

    /// True when any program has unsaved changes.
    pub fn dirty(&self) -> bool {
        self.programs.values().any(|p| p.dirty)
    }

    pub(crate) fn program_mut(&mut self, id: ProgramId) -> Option<&mut Program> {
        self.programs.get_mut(&id)
    }
}

impl std::ops::Index<ProgramId> for ProgramRegistry {
    type Output = Program;

    fn index(&self, id: ProgramId) -> &Program {
        &self.programs[&id]
    }
}

/// Smallest non-negative id not present in `used`.
fn next_free_id(used: impl Iterator<Item = ProgramId>) -> ProgramId {
    let mut ids: Vec<u32> = used.map(|id| id.0).collect();
    ids.sort_unstable();
    let mut candidate = 0;
    for id in ids {
        if id == candidate {
            candidate += 1;
        } else if id > candidate {
            break;
        }
    }
    ProgramId(candidate)
}

fn is_program_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.starts_with(FILE_PREFIX) && name.ends_with(FILE_SUFFIX))
}

/// The id encoded in a `program_<id>.json` file name.
fn file_id(path: &Path) -> Option<ProgramId> {
    let name = path.file_name()?.to_str()?;
    let digits = name.strip_prefix(FILE_PREFIX)?.strip_suffix(FILE_SUFFIX)?;
    digits.parse().ok().map(ProgramId)
}

fn read_program(path: &Path) -> Result<Program, RegistryError> {
    let invalid = |reason: String| RegistryError::Invalid {
        path: path.to_path_buf(),
        reason,
    };
    let bytes = fs::read(path).map_err(|e| RegistryError::io(path, e))?;
    let program: Program = serde_json::from_slice(&bytes).map_err(|source| RegistryError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    match file_id(path) {
        Some(id) if id == program.id => {}
        Some(id) => {
            return Err(invalid(format!(
                "file is named for {id} but holds {}",
                program.id
            )))
        }
        None => return Err(invalid("file name carries no program id".to_string())),
    }
    program.validate().map_err(invalid)?;
    Ok(program)
}

fn write_synced(path: &Path, contents: &[u8]) -> io::Result<()> {
    let mut file = fs::File::create(path)?;
    file.write_all(contents)?;
    file.sync_all()
}
