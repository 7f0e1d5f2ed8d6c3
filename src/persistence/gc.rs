// SPDX-License-Identifier: Apache-2.0

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

/// How long an unreferenced snapshot is kept.
pub const INACTIVE_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

/// Snapshot files no longer used by a configured target, with the time (seconds
/// since the epoch) they became unused.
#[derive(Debug, Default)]
pub struct InactiveFiles {
    files: HashMap<PathBuf, i64>,
}

impl InactiveFiles {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start the retention clock for `path`. A file already scheduled keeps its time.
    pub fn schedule(&mut self, path: impl Into<PathBuf>, now: i64) {
        let path = path.into();
        debug!(path = ?path, "Scheduling persistent file for removal");
        self.files.entry(path).or_insert(now);
    }

    /// Schedule every snapshot in `dir` that is not in `active`. Returns how many
    /// were newly scheduled. A missing directory holds nothing.
    pub fn schedule_unused(
        &mut self,
        dir: &Path,
        active: &HashSet<PathBuf>,
        now: i64,
    ) -> io::Result<usize> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e),
        };

        let mut scheduled = 0;
        for entry in entries {
            let path = entry?.path();
            // Leftovers of interrupted writes go too
            if !path.is_file() || active.contains(&path) || self.files.contains_key(&path) {
                continue;
            }
            self.schedule(path, now);
            scheduled += 1;
        }
        Ok(scheduled)
    }

    /// The file is in use again.
    pub fn unschedule(&mut self, path: &Path) {
        self.files.remove(path);
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Delete files unused for longer than [`INACTIVE_RETENTION`]. Returns the removed paths.
    pub fn collect(&mut self, now: i64) -> Vec<PathBuf> {
        let retention = INACTIVE_RETENTION.as_secs() as i64;
        let mut removed = Vec::new();

        self.files.retain(|path, since| {
            if now - *since <= retention {
                return true;
            }

            match fs::remove_file(path) {
                Ok(()) => debug!(path = ?path, "Removed inactive persistent file"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(path = ?path, error = %e, "Cannot remove inactive persistent file");
                }
            }
            removed.push(path.clone());
            false
        });

        removed
    }
}
