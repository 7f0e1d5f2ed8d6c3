// SPDX-License-Identifier: Apache-2.0

//! Configuration of tailing targets.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::input::file::LineBudget;

/// Default number of lines sent per second.
pub const DEFAULT_MAX_LINES: u32 = 20;
/// Smallest accepted lines per second.
pub const MIN_MAX_LINES: u32 = 1;
/// Largest accepted lines per second in lines mode.
pub const MAX_MAX_LINES: u32 = 1000;
/// Count mode scales the default and upper bound, inspected lines scale the send budget.
pub const MAX_LINES_MULTIPLIER: u32 = 10;

/// How rotation is detected for a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RotationMode {
    /// A file whose mtime changed without a size change is read again.
    #[serde(rename = "mtime-reread")]
    MtimeReread,
    /// Files are renamed away and recreated.
    #[serde(rename = "rotate")]
    Rotate,
    /// Files are copied away and truncated in place.
    #[serde(rename = "copytruncate")]
    CopyTruncate,
    /// A file whose mtime changed without a size change is not read again.
    #[serde(rename = "mtime-noreread")]
    MtimeNoReread,
}

/// What is reported for matching lines.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemMode {
    /// Every matching line is sent.
    #[default]
    Lines,
    /// Only the number of matching lines is sent, once per poll.
    Count,
}

/// Which files belong to a target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum LogSource {
    /// One fixed file.
    #[serde(rename = "log")]
    Log { path: PathBuf },
    /// A directory plus a regular expression on file names, written as one path.
    #[serde(rename = "logrt")]
    LogRt { path: String },
}

impl LogSource {
    pub fn path_display(&self) -> String {
        match self {
            LogSource::Log { path } => path.display().to_string(),
            LogSource::LogRt { path } => path.clone(),
        }
    }

    pub fn is_logrt(&self) -> bool {
        matches!(self, LogSource::LogRt { .. })
    }
}

/// Split a `logrt` path into its directory and file name pattern at the last separator.
pub fn split_logrt_path(path: &str) -> Result<(PathBuf, String)> {
    #[cfg(windows)]
    let idx = path.rfind(['/', '\\']);
    #[cfg(not(windows))]
    let idx = path.rfind('/');

    let Some(idx) = idx else {
        return Err(Error::Config(format!(
            "Cannot find separator in \"{path}\", a directory is required"
        )));
    };

    let (dir, pattern) = (&path[..=idx], &path[idx + 1..]);
    if pattern.is_empty() {
        return Err(Error::Config(format!(
            "Missing file name pattern in \"{path}\""
        )));
    }

    Ok((PathBuf::from(dir), pattern.to_string()))
}

/// Configuration of one tailed target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Unique key of the target.
    pub key: String,

    #[serde(flatten)]
    pub source: LogSource,

    /// Lines must match this regular expression; empty matches all.
    #[serde(default)]
    pub pattern: String,

    /// Character encoding of the files; empty for single-byte input.
    #[serde(default)]
    pub encoding: String,

    /// Lines sent per second, or lines inspected per second in count mode.
    #[serde(default)]
    pub max_lines: Option<u32>,

    /// Start from the end of the existing data on the first poll.
    #[serde(default)]
    pub skip_existing: bool,

    /// Rewrite template for matching lines, ignored in count mode.
    #[serde(default)]
    pub output: Option<String>,

    /// Bound in seconds on how far behind the reader may fall; 0 disables.
    #[serde(default)]
    pub max_delay: f64,

    #[serde(default)]
    pub rotation: Option<RotationMode>,

    /// Root of the persistent state directory tree.
    #[serde(default)]
    pub persistent_dir: Option<PathBuf>,

    #[serde(default)]
    pub mode: ItemMode,

    /// Poll interval in seconds.
    #[serde(default = "default_refresh")]
    pub refresh: u64,
}

fn default_refresh() -> u64 {
    1
}

impl TargetConfig {
    pub fn new(key: impl Into<String>, source: LogSource) -> Self {
        Self {
            key: key.into(),
            source,
            pattern: String::new(),
            encoding: String::new(),
            max_lines: None,
            skip_existing: false,
            output: None,
            max_delay: 0.0,
            rotation: None,
            persistent_dir: None,
            mode: ItemMode::Lines,
            refresh: default_refresh(),
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.key.is_empty() {
            return Err("Target key must not be empty".to_string());
        }

        match &self.source {
            LogSource::Log { path } if path.as_os_str().is_empty() => {
                return Err(format!("Invalid file path for \"{}\"", self.key));
            }
            LogSource::LogRt { path } if path.is_empty() => {
                return Err(format!("Invalid file path for \"{}\"", self.key));
            }
            LogSource::LogRt { path } => {
                split_logrt_path(path).map_err(|e| e.to_string())?;
            }
            _ => {}
        }

        if let Some(lines) = self.max_lines {
            let upper = match self.mode {
                ItemMode::Lines => MAX_MAX_LINES,
                ItemMode::Count => MAX_LINES_MULTIPLIER * MAX_MAX_LINES,
            };
            if !(MIN_MAX_LINES..=upper).contains(&lines) {
                return Err(format!(
                    "Invalid max_lines {lines}, expected a value between {MIN_MAX_LINES} and {upper}"
                ));
            }
        }

        if !self.max_delay.is_finite() || self.max_delay < 0.0 {
            return Err(format!("Invalid max_delay {}", self.max_delay));
        }

        if let Some(rotation) = self.rotation {
            let allowed = match self.source {
                LogSource::Log { .. } => matches!(
                    rotation,
                    RotationMode::MtimeReread | RotationMode::MtimeNoReread
                ),
                LogSource::LogRt { .. } => true,
            };
            if !allowed {
                return Err(format!(
                    "Rotation option {rotation:?} is not supported for single file targets"
                ));
            }
        }

        if self.rotation_mode() == RotationMode::CopyTruncate && self.max_delay > 0.0 {
            return Err("max_delay > 0 is not supported with copytruncate option".to_string());
        }

        if let Some(dir) = &self.persistent_dir {
            if !dir.to_string_lossy().is_ascii() {
                return Err("Persistent directory contains non-ASCII characters".to_string());
            }
        }

        if self.refresh == 0 {
            return Err("Refresh interval must be at least one second".to_string());
        }

        Ok(())
    }

    /// Rotation mode with defaults applied.
    pub fn rotation_mode(&self) -> RotationMode {
        match (&self.source, self.rotation) {
            (LogSource::Log { .. }, None) => RotationMode::MtimeReread,
            (LogSource::LogRt { .. }, None) => RotationMode::Rotate,
            (LogSource::LogRt { .. }, Some(RotationMode::MtimeReread)) => RotationMode::Rotate,
            (_, Some(mode)) => mode,
        }
    }

    pub fn max_lines_per_sec(&self) -> u32 {
        match (self.max_lines, self.mode) {
            (Some(lines), _) => lines,
            (None, ItemMode::Lines) => DEFAULT_MAX_LINES,
            (None, ItemMode::Count) => MAX_LINES_MULTIPLIER * DEFAULT_MAX_LINES,
        }
    }

    /// Line budgets for one poll.
    pub fn budget(&self) -> LineBudget {
        let dispatched = i64::from(self.max_lines_per_sec()) * self.refresh as i64;
        let inspected = match self.mode {
            ItemMode::Lines => i64::from(MAX_LINES_MULTIPLIER) * dispatched,
            ItemMode::Count => dispatched,
        };
        LineBudget::new(inspected, dispatched)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh)
    }

    /// Output template, never used in count mode.
    pub fn output_template(&self) -> Option<&str> {
        match self.mode {
            ItemMode::Lines => self.output.as_deref(),
            ItemMode::Count => None,
        }
    }
}

/// Top-level configuration as loaded from a file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogtailConfig {
    /// Address values are reported to; also names the persistent state directory.
    pub destination: String,

    #[serde(default)]
    pub targets: Vec<TargetConfig>,

    /// How often unreferenced persistent files are checked for removal, in seconds.
    #[serde(default = "default_gc_interval")]
    pub gc_interval: u64,
}

fn default_gc_interval() -> u64 {
    3600
}

impl LogtailConfig {
    pub fn from_json(data: &str) -> Result<Self> {
        Ok(serde_json::from_str(data)?)
    }

    /// Validate the configuration
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.destination.is_empty() {
            return Err("Destination must not be empty".to_string());
        }

        let mut keys = std::collections::HashSet::new();
        for target in &self.targets {
            target.validate()?;
            if !keys.insert(target.key.as_str()) {
                return Err(format!("Duplicate target key \"{}\"", target.key));
            }
        }

        Ok(())
    }
}
