//! Defines all configuration structures for the controller.
//!
//! These structs are deserialized from a TOML file (plus `WATERCLOCK_*`
//! environment overrides) using the `config` crate, so where programs live,
//! where the event log is kept and how time advances can be changed without
//! touching code.

use crate::common::Station;
use anyhow::Context;
use chrono::NaiveDate;
use chrono_tz::Tz;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// The top-level configuration for the `WaterclockEngine`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WaterclockConfig {
    /// Directory holding one JSON file per program.
    pub programs_dir: PathBuf,

    /// SQLite file the event log is written to.
    pub event_log: PathBuf,

    /// How the driver advances the clock.
    pub resolution: ClockResolution,

    /// Timezone used to derive local days and times of day.
    /// Uses the IANA Time Zone Database names (e.g., "America/Denver").
    pub timezone: Tz,

    /// Seconds covered by a single tick when matching program start times.
    pub tick_granularity_secs: u32,

    /// The stations (outputs) wired to this controller.
    pub stations: Vec<Station>,
}

/// Defines how the driver's clock advances.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClockResolution {
    /// One tick per wall-clock second.
    Realtime,
    /// Run `days` simulated days as fast as possible, one second per tick,
    /// starting at midnight of `start` (today when omitted).
    Simulated {
        days: u32,
        #[serde(default)]
        start: Option<NaiveDate>,
    },
}

impl WaterclockConfig {
    /// Loads the configuration from an optional TOML file, then applies any
    /// `WATERCLOCK_*` environment variables on top.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        builder = builder.add_source(config::Environment::with_prefix("WATERCLOCK"));

        let settings = builder
            .build()
            .context("failed to read controller configuration")?;
        settings
            .try_deserialize()
            .context("controller configuration is invalid")
    }
}

impl Default for WaterclockConfig {
    fn default() -> Self {
        Self {
            programs_dir: PathBuf::from("programs"),
            event_log: PathBuf::from("waterclock.db3"),
            resolution: ClockResolution::Realtime,
            timezone: Tz::UTC,
            tick_granularity_secs: 1,
            stations: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toml_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("waterclock.toml");
        std::fs::write(
            &path,
            r#"
programs_dir = "/var/lib/waterclock/programs"
timezone = "America/Denver"

[resolution.simulated]
days = 7
start = "2024-05-01"

[[stations]]
id = 1
name = "front lawn"

[[stations]]
id = 2
name = "drip line"
"#,
        )
        .unwrap();

        let config = WaterclockConfig::load(Some(&path)).unwrap();
        assert_eq!(config.programs_dir, PathBuf::from("/var/lib/waterclock/programs"));
        assert_eq!(config.timezone, chrono_tz::America::Denver);
        assert_eq!(
            config.resolution,
            ClockResolution::Simulated {
                days: 7,
                start: NaiveDate::from_ymd_opt(2024, 5, 1)
            }
        );
        assert_eq!(config.stations.len(), 2);
        assert_eq!(config.stations[1].name, "drip line");
        assert_eq!(config.tick_granularity_secs, 1);
    }
}
