// SPDX-License-Identifier: Apache-2.0

//! Decides whether a file from the previous scan and a file from the current scan
//! hold the same log.

use std::fs::File;
use std::path::Path;
use tracing::{debug, warn};

use crate::config::RotationMode;
use crate::error::{Error, Result};
use crate::input::file::fingerprint::part_hash;
use crate::input::file::{Fingerprint, IdentityMode, LogFileRecord, Place};
use crate::rotation::resolver::{Mapping, MappingMatrix};

/// Classification of one (old, new) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Identity {
    NotSame,
    Same,
    /// Same content at a different place, left behind by copy-truncate.
    Copy,
    /// The mtime changed but the size did not; decide on the next poll.
    Defer,
}

/// Classify `old` against `new`. `new_files` is the whole current scan.
pub fn classify(
    old: &LogFileRecord,
    new: &LogFileRecord,
    mode: IdentityMode,
    rotation: RotationMode,
    new_files: &[LogFileRecord],
) -> Result<Identity> {
    if rotation == RotationMode::CopyTruncate {
        return classify_copytruncate(old, new, mode, new_files);
    }

    if old.id.place(&new.id, mode) == Place::Other {
        return Ok(Identity::NotSame);
    }

    // Size never decreases, truncation or replacement makes it another file
    if old.size > new.size || old.processed_size > new.size {
        return Ok(Identity::NotSame);
    }

    let no_reread = rotation == RotationMode::MtimeNoReread;

    if old.size == new.size && old.mtime < new.mtime {
        let mut same_first = false;
        let mut same_last = false;

        if let (Some(o), Some(n)) = (&old.fingerprint, &new.fingerprint) {
            if o.block_size() > 0 && o.block_size() == n.block_size() {
                if o.first() != n.first() {
                    return Ok(Identity::NotSame);
                }
                same_first = true;

                if o.last_offset() == n.last_offset() {
                    if o.last() != n.last() {
                        return Ok(Identity::NotSame);
                    }
                    same_last = true;
                }
            }
        }

        if same_first && same_last && no_reread {
            return Ok(Identity::Same);
        }

        if !old.retry {
            if !no_reread {
                warn!(
                    path = ?old.filename,
                    "Modification time of log file has been updated without changing its size, checking again later"
                );
            }
            return Ok(Identity::Defer);
        }

        if no_reread {
            warn!(
                path = ?old.filename,
                "Size of log file still has not changed after its modification time did, considering it the same file"
            );
            return Ok(Identity::Same);
        }

        warn!(
            path = ?old.filename,
            "Size of log file still has not changed after its modification time did, considering it a new file"
        );
        return Ok(Identity::NotSame);
    }

    let (Some(o), Some(n)) = (&old.fingerprint, &new.fingerprint) else {
        // Reporting twice is better than skipping
        return Ok(Identity::NotSame);
    };

    if o.block_size() > n.block_size() {
        return Ok(Identity::NotSame);
    }

    if o.block_size() == n.block_size() {
        if o.first() != n.first() {
            return Ok(Identity::NotSame);
        }
        if o.last_offset() == n.last_offset() && o.last() == n.last() {
            return Ok(Identity::Same);
        }
    }

    if o.block_size() > 0 {
        // Old hashes came from a smaller block or another offset, rehash the new file to match
        let mut probe = Probe::open(&new.filename).map_err(|e| Error::identity(&new.filename, e))?;

        if probe.hash(0, o.block_size())? != *o.first() {
            return Ok(Identity::NotSame);
        }
        if o.last_offset() == 0 {
            return Ok(Identity::Same);
        }
        if probe.hash(o.last_offset(), o.block_size())? == *o.last() {
            return Ok(Identity::Same);
        }
        return Ok(Identity::NotSame);
    }

    Ok(Identity::Same)
}

/// Classify every old file against every new file.
///
/// Copies found under copy-truncate are recorded in `copy_of` of the new file. A
/// deferred pair marks the old file for retry and fails the whole step so the
/// previous state is kept until the next poll.
pub fn build_matrix(
    old: &mut [LogFileRecord],
    new: &mut [LogFileRecord],
    mode: IdentityMode,
    rotation: RotationMode,
) -> Result<MappingMatrix> {
    let mut matrix = MappingMatrix::new(old.len(), new.len());

    for i in 0..old.len() {
        for j in 0..new.len() {
            let identity = classify(&old[i], &new[j], mode, rotation, new)?;

            match identity {
                Identity::NotSame => {}
                Identity::Same => {
                    if old[i].retry {
                        debug!(
                            path = ?old[i].filename,
                            "Size of log file has changed since its modification time did, considering it the same file"
                        );
                        old[i].retry = false;
                    }
                    matrix.set(i, j, Mapping::Same);
                }
                Identity::Copy => {
                    matrix.set(i, j, Mapping::Copy);
                    new[j].copy_of = Some(i);
                }
                Identity::Defer => {
                    old[i].retry = true;
                    return Err(Error::Deferred(old[i].filename.clone()));
                }
            }

            debug!(old = ?old[i].filename, new = ?new[j].filename, result = ?identity, "Compared files");
        }
    }

    if rotation != RotationMode::CopyTruncate && (old.len() > 1 || new.len() > 1) {
        matrix.resolve();
    }

    Ok(matrix)
}

fn classify_copytruncate(
    old: &LogFileRecord,
    new: &LogFileRecord,
    mode: IdentityMode,
    new_files: &[LogFileRecord],
) -> Result<Identity> {
    if old.mtime > new.mtime {
        return Ok(Identity::NotSame);
    }

    let (Some(o), Some(n)) = (&old.fingerprint, &new.fingerprint) else {
        return Ok(Identity::NotSame);
    };

    let place = old.id.place(&new.id, mode);

    if o.block_size() == n.block_size() && o.last_offset() == n.last_offset() {
        if by_hash(o.first(), n.first(), place) == Identity::NotSame {
            return Ok(Identity::NotSame);
        }
        return Ok(by_hash(o.last(), n.last(), place));
    }

    if o.block_size() == 0 || n.block_size() == 0 {
        return Ok(Identity::NotSame);
    }

    if o.block_size() <= n.block_size() {
        let mut probe = Probe::open(&new.filename).map_err(|e| Error::identity(&new.filename, e))?;

        let ret = by_hash(o.first(), &probe.hash(0, o.block_size())?, place);
        if ret == Identity::NotSame || o.last_offset() == 0 {
            return Ok(ret);
        }
        return Ok(by_hash(
            o.last(),
            &probe.hash(o.last_offset(), o.block_size())?,
            place,
        ));
    }

    // The old file hashed a larger block than the new one. Its name may be gone or
    // taken by another file now, so look for the new file's content among the
    // other current files first.
    let mut ret = Identity::NotSame;
    let mut found = false;
    let mut same_name_in_new_list = false;

    for candidate in new_files {
        if n.block_size() > candidate.size {
            continue;
        }

        if old.filename == new.filename || candidate.filename == new.filename {
            same_name_in_new_list = true;
            continue;
        }

        let place = old.id.place(&candidate.id, mode);
        let mut probe = Probe::open(&candidate.filename)
            .map_err(|e| Error::identity(&candidate.filename, e))?;

        ret = compare_with(n, &mut probe, place)?;
        if matches!(ret, Identity::Same | Identity::Copy) {
            found = true;
            break;
        }
    }

    if !found && !same_name_in_new_list {
        // Last try with the name from the old list; it may no longer exist
        let Ok(mut probe) = Probe::open(&old.filename) else {
            return Ok(Identity::NotSame);
        };
        ret = compare_with(n, &mut probe, place).unwrap_or(Identity::NotSame);
    }

    Ok(ret)
}

/// Compare `fp` with the same geometry read from `probe`.
fn compare_with(fp: &Fingerprint, probe: &mut Probe<'_>, place: Place) -> Result<Identity> {
    let ret = by_hash(fp.first(), &probe.hash(0, fp.block_size())?, place);
    if ret == Identity::NotSame || fp.last_offset() == 0 {
        return Ok(ret);
    }
    Ok(by_hash(
        fp.last(),
        &probe.hash(fp.last_offset(), fp.block_size())?,
        place,
    ))
}

fn by_hash(a: &[u8; 16], b: &[u8; 16], place: Place) -> Identity {
    if a != b {
        return Identity::NotSame;
    }
    match place {
        Place::Same | Place::Unknown => Identity::Same,
        Place::Other => Identity::Copy,
    }
}

/// An open file used to hash blocks at an arbitrary geometry.
struct Probe<'a> {
    path: &'a Path,
    file: File,
}

impl<'a> Probe<'a> {
    fn open(path: &'a Path) -> std::io::Result<Self> {
        Ok(Self {
            path,
            file: File::open(path)?,
        })
    }

    fn hash(&mut self, offset: u64, len: u64) -> Result<[u8; 16]> {
        part_hash(&mut self.file, offset, len).map_err(|e| Error::identity(self.path, e))
    }
}
