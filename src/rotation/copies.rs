// SPDX-License-Identifier: Apache-2.0

//! Handling of files that hold the same content, as left behind by copy-truncate
//! rotation or by copying a log without truncating it.

use std::fs::File;
use tracing::debug;

use crate::input::file::fingerprint::part_hash;
use crate::input::file::{IdentityMode, LogFileRecord, Place};

/// Whether two files from the same scan start and end with the same blocks.
///
/// Hashes taken with different block sizes are compared by rehashing the file with
/// the larger block at the smaller geometry. Only use this on files of one scan, a
/// name from an older scan may point to another file by now.
pub fn same_blocks(a: &LogFileRecord, b: &LogFileRecord) -> bool {
    let (Some(fa), Some(fb)) = (&a.fingerprint, &b.fingerprint) else {
        return false;
    };

    if fa.block_size() == fb.block_size() {
        if fa.first() != fb.first() {
            return false;
        }
        if fa.last_offset() == fb.last_offset() {
            return fa.last() == fb.last();
        }
    }

    if fa.block_size() == 0 || fb.block_size() == 0 {
        return false;
    }

    let (smaller, larger_path) = if fa.block_size() < fb.block_size() {
        (fa, &b.filename)
    } else {
        (fb, &a.filename)
    };

    let Ok(mut file) = File::open(larger_path) else {
        return false;
    };

    let hash = |file: &mut File, offset| part_hash(file, offset, smaller.block_size()).ok();

    if hash(&mut file, 0).as_ref() != Some(smaller.first()) {
        return false;
    }
    if smaller.last_offset() == 0 {
        return true;
    }
    hash(&mut file, smaller.last_offset()).as_ref() == Some(smaller.last())
}

/// Share the larger processed size between file `i` and every later copy of it.
pub fn handle_multiple_copies(files: &mut [LogFileRecord], i: usize) {
    for j in i + 1..files.len() {
        if !same_blocks(&files[i], &files[j]) {
            continue;
        }

        let (from, to) = if files[j].processed_size < files[i].processed_size {
            (i, j)
        } else if files[i].processed_size < files[j].processed_size {
            (j, i)
        } else {
            continue;
        };

        files[to].processed_size = files[from].processed_size.min(files[to].size);
        debug!(
            from = ?files[from].filename,
            to = ?files[to].filename,
            processed_size = files[to].processed_size,
            "Transferred processed size to copy"
        );
    }
}

/// Largest processed size among the other copies of file `i`.
pub fn max_processed_size_in_copies(files: &[LogFileRecord], i: usize) -> u64 {
    files
        .iter()
        .enumerate()
        .filter(|(j, other)| *j != i && same_blocks(&files[i], other))
        .map(|(_, other)| other.processed_size)
        .max()
        .unwrap_or(0)
}

/// Hold back the persisted cursor while copies exist.
///
/// The earliest file that still has a copy must appear in the next scan, so the
/// cursor mtime is moved back to it and later files are marked unprocessed.
pub fn delay_update_if_copies(files: &mut [LogFileRecord], mtime: &mut i64, lastlogsize: &mut u64) {
    let Some(mut idx_to_keep) = files.len().checked_sub(1) else {
        return;
    };

    for i in 0..files.len() - 1 {
        if files[i].size == 0 {
            continue;
        }

        let mut largest_for_i = None;
        for j in i + 1..files.len() {
            if files[j].size == 0 || !same_blocks(&files[i], &files[j]) {
                continue;
            }
            let more_processed = if files[i].processed_size > files[j].processed_size {
                i
            } else {
                j
            };
            largest_for_i = largest_for_i.max(Some(more_processed));
        }

        if let Some(largest) = largest_for_i {
            idx_to_keep = idx_to_keep.min(largest);
        }
    }

    let keep = &files[idx_to_keep];
    if keep.mtime < *mtime {
        debug!(
            from_mtime = *mtime,
            to_mtime = keep.mtime,
            from_lastlogsize = *lastlogsize,
            to_lastlogsize = keep.processed_size,
            "Setting cursor back to keep copies in the next scan"
        );
        *mtime = keep.mtime;
        *lastlogsize = keep.processed_size;

        for f in files.iter_mut().skip(idx_to_keep + 1) {
            f.seq = 0;
        }
    }
}

/// Put a copy before its truncated original when both share an mtime.
///
/// Files with equal mtime sort by name descending, which can put the truncated
/// original first. `start_idx` follows a moved file.
pub fn ensure_order_if_mtimes_equal(
    old: Option<&[LogFileRecord]>,
    files: &mut [LogFileRecord],
    mode: IdentityMode,
    start_idx: &mut usize,
) {
    for i in 0..files.len().saturating_sub(1) {
        if files[i].mtime == files[i + 1].mtime && is_swap_required(old, files, mode, i) {
            debug!(
                first = ?files[i].filename,
                second = ?files[i + 1].filename,
                "Swapping files with equal modification time"
            );
            files.swap(i, i + 1);

            if *start_idx == i + 1 {
                *start_idx = i;
            }
        }
    }
}

fn is_swap_required(
    old: Option<&[LogFileRecord]>,
    files: &[LogFileRecord],
    mode: IdentityMode,
    idx: usize,
) -> bool {
    let (first, second) = (&files[idx], &files[idx + 1]);

    if first.seq == 0 && second.seq > 0 {
        return true;
    }

    let Some(copy_of) = second.copy_of else {
        return false;
    };
    let Some(original) = old.and_then(|o| o.get(copy_of)) else {
        return false;
    };

    // A truncated file most likely kept its inode
    match original.id.place(&first.id, mode) {
        Place::Same => first.seq >= second.seq,
        Place::Other | Place::Unknown => original.filename == first.filename,
    }
}
