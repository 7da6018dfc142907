//! System settings loaded from YAML.
//!
//! Every field has a default, so an empty file (or no file) yields a usable
//! configuration with persistence disabled.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SystemError};
use crate::tracking::ReplayConfig;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    pub map: MapConfig,
    pub viewer: ViewerConfig,
    pub timing: TimingConfig,
    pub multi_map: MultiMapConfig,
    /// Reference tracker settings, ignored by other tracking engines.
    pub replay: ReplayConfig,
}

impl SystemConfig {
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| SystemError::Settings {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Self::from_yaml_str(&text).map_err(|e| match e {
            SystemError::Settings { reason, .. } => SystemError::Settings {
                path: path.to_path_buf(),
                reason,
            },
            other => other,
        })
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(text).map_err(|e| SystemError::Settings {
            path: PathBuf::new(),
            reason: e.to_string(),
        })
    }

    /// Map persistence is on when a base name is configured and saving is
    /// enabled.
    pub fn persistence_enabled(&self) -> bool {
        self.map.file.is_some() && self.map.save
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MapConfig {
    /// Base name of the map segment files. Segment `i` lives in `<i><file>`.
    /// Unset disables persistence and multi-map swaps.
    pub file: Option<String>,
    /// Directory holding map segments and their keyframe trajectories.
    pub output_dir: PathBuf,
    /// Persist the map on reset and shutdown.
    pub save: bool,
}

impl Default for MapConfig {
    fn default() -> Self {
        Self {
            file: None,
            output_dir: PathBuf::from("."),
            save: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewerConfig {
    pub enabled: bool,
}

/// Poll intervals used while waiting on workers that do not signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub stop_poll_us: u64,
    pub finish_poll_us: u64,
}

impl TimingConfig {
    pub fn stop_poll(&self) -> Duration {
        Duration::from_micros(self.stop_poll_us)
    }

    pub fn finish_poll(&self) -> Duration {
        Duration::from_micros(self.finish_poll_us)
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            stop_poll_us: 1_000,
            finish_poll_us: 5_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MultiMapConfig {
    /// Added to the distance from the origin before comparing it with the
    /// loaded map's extent.
    pub distance_bias: f64,
}

impl Default for MultiMapConfig {
    fn default() -> Self {
        Self { distance_bias: 0.1 }
    }
}
