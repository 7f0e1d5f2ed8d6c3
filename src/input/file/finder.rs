// SPDX-License-Identifier: Apache-2.0

use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::input::file::file_id::IdentityMode;
use crate::input::file::record::{FileSet, LogFileRecord, mtime_secs};

/// Outcome of a successful scan.
#[derive(Debug)]
pub enum Scan {
    /// Files currently present, possibly none.
    Found {
        files: FileSet,
        identity_mode: IdentityMode,
    },
    /// Nothing to read; the reason is suitable for logging.
    Missing(String),
}

/// Produces the current snapshot of files belonging to a target.
pub trait FileFinder: Send {
    /// Scan for files. `mtime_floor` excludes files modified before it; fixed
    /// single-file targets ignore it.
    fn scan(&mut self, mtime_floor: i64) -> Result<Scan>;
}

/// Finder for a target naming exactly one file.
#[derive(Debug, Clone)]
pub struct SingleFileFinder {
    path: PathBuf,
}

impl SingleFileFinder {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl FileFinder for SingleFileFinder {
    fn scan(&mut self, _mtime_floor: i64) -> Result<Scan> {
        let metadata = match fs::metadata(&self.path) {
            Ok(m) => m,
            Err(e) => {
                return Ok(Scan::Missing(format!(
                    "Cannot obtain information for file \"{}\": {e}",
                    self.path.display()
                )));
            }
        };

        if !metadata.is_file() {
            return Err(Error::access(
                &self.path,
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "not a regular file"),
            ));
        }

        let identity_mode = identity_mode_for(&self.path)?;

        // mtime of a single file is not tracked, rotation cannot happen to it
        let record = LogFileRecord::observe(&self.path, 0, metadata.len(), identity_mode)?;

        let mut files = FileSet::new();
        files.insert_sorted(record);
        Ok(Scan::Found {
            files,
            identity_mode,
        })
    }
}

/// Finder for a directory plus a regular expression on file names.
#[derive(Debug, Clone)]
pub struct DirectoryFinder {
    dir: PathBuf,
    pattern: Regex,
}

impl DirectoryFinder {
    /// Compile the file name pattern. Invalid patterns are a configuration error.
    pub fn new(dir: impl Into<PathBuf>, pattern: &str) -> Result<Self> {
        let pattern = Regex::new(pattern).map_err(|e| {
            Error::Config(format!("Cannot compile file name pattern \"{pattern}\": {e}"))
        })?;
        Ok(Self {
            dir: dir.into(),
            pattern,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn pick(&self, mtime_floor: i64, identity_mode: IdentityMode) -> Result<FileSet> {
        let entries = fs::read_dir(&self.dir).map_err(|e| Error::access(&self.dir, e))?;
        let mut files = FileSet::new();

        for entry in entries {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    debug!(dir = ?self.dir, error = %e, "Cannot read directory entry");
                    continue;
                }
            };

            let path = entry.path();
            let metadata = match fs::metadata(&path) {
                Ok(m) => m,
                Err(e) => {
                    debug!(path = ?path, error = %e, "Cannot process entry");
                    continue;
                }
            };

            if !metadata.is_file() {
                continue;
            }

            let mtime = mtime_secs(&metadata);
            if mtime < mtime_floor {
                continue;
            }

            let name = entry.file_name();
            if !self.pattern.is_match(&name.to_string_lossy()) {
                continue;
            }

            let record = LogFileRecord::observe(&path, mtime, metadata.len(), identity_mode)?;
            files.insert_sorted(record);
        }

        Ok(files)
    }
}

impl FileFinder for DirectoryFinder {
    fn scan(&mut self, mtime_floor: i64) -> Result<Scan> {
        let metadata = fs::metadata(&self.dir).map_err(|e| Error::access(&self.dir, e))?;
        if !metadata.is_dir() {
            return Err(Error::access(
                &self.dir,
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "not a directory"),
            ));
        }

        let identity_mode = identity_mode_for(&self.dir)?;
        let files = self.pick(mtime_floor, identity_mode)?;

        if files.is_empty() {
            if !is_searchable(&self.dir) {
                // Rotation tools may briefly change permissions
                warn!(dir = ?self.dir, "Cannot access directory, assuming it is being rotated");
                return Ok(Scan::Found {
                    files,
                    identity_mode,
                });
            }

            return Ok(Scan::Missing(format!(
                "There are no files matching \"{}\" in \"{}\"",
                self.pattern.as_str(),
                self.dir.display()
            )));
        }

        Ok(Scan::Found {
            files,
            identity_mode,
        })
    }
}

fn identity_mode_for(path: &Path) -> Result<IdentityMode> {
    IdentityMode::for_path(path).map_err(|e| Error::access(path, e))
}

#[cfg(unix)]
fn is_searchable(dir: &Path) -> bool {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    match CString::new(dir.as_os_str().as_bytes()) {
        Ok(c) => unsafe { libc::access(c.as_ptr(), libc::X_OK) == 0 },
        Err(_) => false,
    }
}

#[cfg(not(unix))]
fn is_searchable(_dir: &Path) -> bool {
    true
}

/// Finder wrapper that fails every scan after a given number of successful ones.
#[cfg(any(test, feature = "test-util"))]
pub struct MockFileFinder {
    inner: Box<dyn FileFinder>,
    remaining: Option<usize>,
    pub scans: usize,
}

#[cfg(any(test, feature = "test-util"))]
impl MockFileFinder {
    pub fn new(inner: impl FileFinder + 'static) -> Self {
        Self {
            inner: Box::new(inner),
            remaining: None,
            scans: 0,
        }
    }

    pub fn fail_after(mut self, n: usize) -> Self {
        self.remaining = Some(n);
        self
    }
}

#[cfg(any(test, feature = "test-util"))]
impl FileFinder for MockFileFinder {
    fn scan(&mut self, mtime_floor: i64) -> Result<Scan> {
        self.scans += 1;
        if let Some(remaining) = self.remaining.as_mut() {
            if *remaining == 0 {
                return Err(Error::access(
                    "/mock",
                    std::io::Error::other("simulated scan failure"),
                ));
            }
            *remaining -= 1;
        }
        self.inner.scan(mtime_floor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn names(scan: Scan) -> Vec<String> {
        match scan {
            Scan::Found { files, .. } => files
                .iter()
                .map(|f| {
                    f.filename
                        .file_name()
                        .unwrap()
                        .to_string_lossy()
                        .into_owned()
                })
                .collect(),
            Scan::Missing(reason) => panic!("unexpected missing: {reason}"),
        }
    }

    #[test]
    fn test_directory_finder_matches_pattern() {
        let dir = TempDir::new().unwrap();
        for name in ["app.log", "app.log.1", "other.txt"] {
            fs::write(dir.path().join(name), format!("content of {name}\n")).unwrap();
        }

        let mut finder = DirectoryFinder::new(dir.path(), r"^app\.log").unwrap();
        let mut found = names(finder.scan(0).unwrap());
        found.sort();
        assert_eq!(found, vec!["app.log", "app.log.1"]);
    }

    #[test]
    fn test_directory_finder_skips_subdirectories() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("app.log.d")).unwrap();
        fs::write(dir.path().join("app.log"), "x\n").unwrap();

        let mut finder = DirectoryFinder::new(dir.path(), "app").unwrap();
        assert_eq!(names(finder.scan(0).unwrap()), vec!["app.log"]);
    }

    #[test]
    fn test_directory_finder_mtime_floor() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("app.log"), "x\n").unwrap();

        let mut finder = DirectoryFinder::new(dir.path(), "app").unwrap();
        let future = chrono::Utc::now().timestamp() + 3600;
        assert!(matches!(finder.scan(future).unwrap(), Scan::Missing(_)));
    }

    #[test]
    fn test_directory_finder_no_match_is_missing() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("other.txt"), "x\n").unwrap();

        let mut finder = DirectoryFinder::new(dir.path(), r"\.log$").unwrap();
        assert!(matches!(finder.scan(0).unwrap(), Scan::Missing(_)));
    }

    #[test]
    fn test_directory_finder_missing_directory_fails() {
        let dir = TempDir::new().unwrap();
        let mut finder = DirectoryFinder::new(dir.path().join("gone"), "log").unwrap();

        let err = finder.scan(0).unwrap_err();
        assert!(matches!(err, Error::Access { .. }));
    }

    #[test]
    fn test_invalid_pattern_is_config_error() {
        let err = DirectoryFinder::new("/tmp", "app(").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_single_file_finder() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.log");

        let mut finder = SingleFileFinder::new(&path);
        assert!(matches!(finder.scan(0).unwrap(), Scan::Missing(_)));

        fs::write(&path, "hello\n").unwrap();
        match finder.scan(0).unwrap() {
            Scan::Found { files, .. } => {
                assert_eq!(files.len(), 1);
                assert_eq!(files[0].mtime, 0);
                assert_eq!(files[0].size, 6);
            }
            Scan::Missing(reason) => panic!("unexpected missing: {reason}"),
        }
    }

    #[test]
    fn test_single_file_finder_rejects_directory() {
        let dir = TempDir::new().unwrap();
        let mut finder = SingleFileFinder::new(dir.path());
        assert!(finder.scan(0).is_err());
    }

    #[test]
    fn test_mock_finder_fail_after() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("app.log"), "x\n").unwrap();

        let mut finder =
            MockFileFinder::new(DirectoryFinder::new(dir.path(), "app").unwrap()).fail_after(1);
        assert!(finder.scan(0).is_ok());
        assert!(finder.scan(0).is_err());
        assert_eq!(finder.scans, 2);
    }
}
