//! Contains common, primitive types shared across the controller.
//!
//! This module defines the identifier types for programs and stations, plus the
//! `Station` entity itself. Stations are supplied by the hardware layer and are
//! only ever referenced by the scheduling core, never owned by it.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Uniquely identifies a watering program within a `ProgramRegistry`.
///
/// Identifiers are handed out with gap-fill allocation, so a freed id is
/// reused by the next `add`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ProgramId(pub u32);

impl ProgramId {
    /// The id carried by a program that has not been added to a registry yet,
    /// or that has been deleted from one.
    pub const UNASSIGNED: ProgramId = ProgramId(0);
}

impl fmt::Display for ProgramId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P{}", self.0)
    }
}

/// Identifies a physical (or simulated) output on the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StationId(pub u32);

impl fmt::Display for StationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "S{}", self.0)
    }
}

/// A controllable output, such as a single valve.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Station {
    pub id: StationId,
    pub name: String,
}

impl Station {
    pub fn new(id: u32, name: impl Into<String>) -> Self {
        Self {
            id: StationId(id),
            name: name.into(),
        }
    }
}

/// Lookup table that resolves station ids for the registry's binding pass.
///
/// Programs only ever hold weak handles into this map, so the hardware layer
/// is free to rebuild it.
pub type StationMap = BTreeMap<StationId, Arc<Station>>;

/// Builds a `StationMap` from a list of stations.
pub fn station_map(stations: impl IntoIterator<Item = Station>) -> StationMap {
    stations
        .into_iter()
        .map(|station| (station.id, Arc::new(station)))
        .collect()
}
