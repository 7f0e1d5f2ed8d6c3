// SPDX-License-Identifier: Apache-2.0

//! Carries reading progress from the previous scan to the current one.

use tracing::{debug, warn};

use crate::config::RotationMode;
use crate::error::Result;
use crate::input::file::{IdentityMode, LogFileRecord};
use crate::rotation::matcher::build_matrix;
use crate::rotation::resolver::MappingMatrix;

/// Where processing continues after progress was transferred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Continuation {
    /// Index in the new list of the successor of the last processed old file.
    pub start_idx: usize,
    /// Set when the last processed file has no successor and the offset must restart.
    pub lastlogsize: Option<u64>,
}

/// Map `old` onto `new` and move processed sizes, sequence numbers and incomplete
/// flags across.
///
/// `seq` is the running sequence counter of the poll. Fails without touching `new`
/// progress when the mapping cannot be built.
pub fn update_new_list_from_old(
    rotation: RotationMode,
    old: &mut [LogFileRecord],
    new: &mut [LogFileRecord],
    mode: IdentityMode,
    seq: &mut u32,
    start_idx: usize,
) -> Result<Continuation> {
    let matrix = build_matrix(old, new, mode, rotation)?;
    debug!(matrix = ?matrix, "File mapping");

    let mut max_old_seq = 0;
    let mut old_last = 0;

    for (i, record) in old.iter().enumerate() {
        if rotation == RotationMode::CopyTruncate {
            transfer_for_copytruncate(record, i, new, &matrix, seq);
        } else {
            transfer_for_rotate(record, i, new, &matrix, seq);
        }

        if record.seq > max_old_seq {
            max_old_seq = record.seq;
            old_last = i;
        }
    }

    let mut cont = Continuation {
        start_idx,
        lastlogsize: None,
    };

    if max_old_seq > 0 {
        match matrix.find(old_last) {
            Some(j) => cont.start_idx = j,
            None => {
                warn!(
                    path = ?old[old_last].filename,
                    "No successor found for the last processed log file, restarting from the first file"
                );
                cont.start_idx = 0;
                cont.lastlogsize = new.first().map(|f| f.processed_size);
            }
        }
    }

    Ok(cont)
}

fn transfer_for_rotate(
    old: &LogFileRecord,
    row: usize,
    new: &mut [LogFileRecord],
    matrix: &MappingMatrix,
    seq: &mut u32,
) {
    let Some(j) = matrix.find(row) else {
        return;
    };

    if old.processed_size > 0 && !old.incomplete {
        carry_processed(old, &mut new[j], seq);
    } else if old.incomplete {
        carry_incomplete(old, &mut new[j]);
    }
}

fn transfer_for_copytruncate(
    old: &LogFileRecord,
    row: usize,
    new: &mut [LogFileRecord],
    matrix: &MappingMatrix,
    seq: &mut u32,
) {
    if old.processed_size > 0 && !old.incomplete {
        for j in matrix.mapped_cols(row) {
            carry_processed(old, &mut new[j], seq);
        }
    } else if old.incomplete {
        for j in matrix.mapped_cols(row) {
            carry_incomplete(old, &mut new[j]);
        }
    }
}

fn carry_processed(old: &LogFileRecord, new: &mut LogFileRecord, seq: &mut u32) {
    if old.is_fully_processed() && old.size == new.size {
        // Nothing new since the last poll
        new.processed_size = new.size;
        new.seq = *seq;
        *seq += 1;
    } else if new.processed_size < old.processed_size {
        new.processed_size = new.size.min(old.processed_size);
    }
}

fn carry_incomplete(old: &LogFileRecord, new: &mut LogFileRecord) {
    // A grown file may have completed its last record
    new.incomplete = old.size >= new.size;

    if new.processed_size < old.processed_size {
        new.processed_size = new.size.min(old.processed_size);
    }
}
