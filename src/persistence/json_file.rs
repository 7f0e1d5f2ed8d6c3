// SPDX-License-Identifier: Apache-2.0

//! Snapshot files on disk, replaced atomically.

use md5::{Digest, Md5};
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{Error, Result};
use crate::persistence::schema::PersistedRecord;
use crate::persistence::store::Persister;

/// MD5 hex digest of `s` followed by its length, so different ways of joining the
/// same parts never collide.
pub fn hash_with_len(s: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(s.as_bytes());
    hasher.update(s.len().to_string().as_bytes());
    hex::encode(hasher.finalize())
}

/// `<root>/<hash(destination)>/<hash(key)>`
pub fn persistent_file_path(root: &Path, destination: &str, key: &str) -> PathBuf {
    root.join(hash_with_len(destination)).join(hash_with_len(key))
}

/// Persister keeping one target's snapshot in a JSON file.
#[derive(Debug, Clone)]
pub struct JsonFilePersister {
    path: PathBuf,
}

impl JsonFilePersister {
    /// Use the snapshot file for `key` under `root`, creating the destination
    /// directory if needed.
    pub fn open(root: &Path, destination: &str, key: &str) -> Result<Self> {
        let path = persistent_file_path(root, destination, key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                Error::Persistence(format!(
                    "failed to create directory \"{}\": {e}",
                    parent.display()
                ))
            })?;
        }
        debug!(path = ?path, key, "Using persistent file");
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Persister for JsonFilePersister {
    fn read(&self) -> Result<Option<PersistedRecord>> {
        let file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(Error::Persistence(format!(
                    "failed to open \"{}\": {e}",
                    self.path.display()
                )));
            }
        };

        serde_json::from_reader(BufReader::new(file))
            .map(Some)
            .map_err(|e| {
                Error::Persistence(format!("failed to parse \"{}\": {e}", self.path.display()))
            })
    }

    fn write(&mut self, record: &PersistedRecord) -> Result<()> {
        atomic_write(&self.path, record)
    }

    fn remove(&mut self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Persistence(format!(
                "failed to remove \"{}\": {e}",
                self.path.display()
            ))),
        }
    }
}

/// Write to a temporary file next to `path`, then rename over it.
fn atomic_write(path: &Path, record: &PersistedRecord) -> Result<()> {
    replace_with(path, |writer| {
        serde_json::to_writer(&mut *writer, record)
            .map_err(|e| Error::Persistence(format!("failed to write snapshot: {e}")))
    })
}

/// Fill a temporary file next to `path` with `fill` and rename it over `path`. The
/// temporary file is removed on any failure.
fn replace_with(
    path: &Path,
    fill: impl FnOnce(&mut BufWriter<File>) -> Result<()>,
) -> Result<()> {
    use portable_atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);

    // Process id and counter keep concurrent writers apart
    let unique_id = COUNTER.fetch_add(1, Ordering::SeqCst);
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let temp_path = path.with_file_name(format!(
        "{file_name}.tmp.{}.{unique_id}",
        std::process::id()
    ));

    let file = File::create(&temp_path)
        .map_err(|e| Error::Persistence(format!("failed to create temp file: {e}")))?;

    let written = {
        let mut writer = BufWriter::new(file);
        fill(&mut writer).and_then(|()| {
            writer
                .flush()
                .map_err(|e| Error::Persistence(format!("failed to flush snapshot: {e}")))
        })
    };

    let result = written.and_then(|()| {
        fs::rename(&temp_path, path)
            .map_err(|e| Error::Persistence(format!("failed to rename snapshot file: {e}")))
    });

    if result.is_err() {
        if let Err(e) = fs::remove_file(&temp_path) {
            debug!(path = ?temp_path, error = %e, "Cannot remove temporary snapshot file");
        }
    }
    result
}
