// SPDX-License-Identifier: Apache-2.0

//! Snapshot format of a target's progress.
//!
//! One JSON object per target. Before any file was seen only `mtime` and
//! `processed_size` are present.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{Error, Result};
use crate::input::file::{FileId, Fingerprint, LogFileRecord};

/// Persisted state of the last processed file of a target.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    pub mtime: i64,
    pub processed_size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub incomplete: Option<bool>,
    /// Index into the file list the record was a copy of, -1 for none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub copy_of: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dev: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ino_lo: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ino_hi: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    /// -1 while the fingerprint has not been computed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_size: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_block_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_block_offset: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_block_hash: Option<String>,
}

impl PersistedRecord {
    /// A snapshot with offsets only, for targets that have not seen a file yet.
    pub fn offsets(processed_size: u64, mtime: i64) -> Self {
        Self {
            mtime,
            processed_size,
            ..Default::default()
        }
    }

    pub fn from_record(record: &LogFileRecord) -> Self {
        let (block_size, first, last_offset, last) = match &record.fingerprint {
            Some(fp) => (
                fp.block_size() as i64,
                hex::encode(fp.first()),
                fp.last_offset(),
                hex::encode(fp.last()),
            ),
            None => (-1, hex::encode([0u8; 16]), 0, hex::encode([0u8; 16])),
        };

        Self {
            filename: Some(record.filename.to_string_lossy().into_owned()),
            mtime: record.mtime,
            processed_size: record.processed_size,
            seq: Some(record.seq),
            incomplete: Some(record.incomplete),
            copy_of: Some(record.copy_of.map_or(-1, |i| i as i64)),
            dev: Some(record.id.dev()),
            ino_lo: Some(record.id.ino_lo()),
            ino_hi: Some(record.id.ino_hi()),
            size: Some(record.size),
            block_size: Some(block_size),
            first_block_hash: Some(first),
            last_block_offset: Some(last_offset),
            last_block_hash: Some(last),
        }
    }

    /// Rebuild the file record, if the snapshot holds one.
    pub fn to_record(&self) -> Result<Option<LogFileRecord>> {
        let Some(filename) = &self.filename else {
            return Ok(None);
        };

        let id = FileId::new(
            self.dev.unwrap_or_default(),
            self.ino_lo.unwrap_or_default(),
            self.ino_hi.unwrap_or_default(),
        );
        let mut record = LogFileRecord::new(
            PathBuf::from(filename),
            self.mtime,
            self.size.unwrap_or(self.processed_size),
            id,
        );
        record.processed_size = self.processed_size;
        record.seq = self.seq.unwrap_or_default();
        record.incomplete = self.incomplete.unwrap_or_default();
        record.copy_of = self
            .copy_of
            .and_then(|i| usize::try_from(i).ok());

        record.fingerprint = match self.block_size {
            Some(block_size) if block_size >= 0 => Some(Fingerprint::from_parts(
                block_size as u64,
                decode_hash("first_block_hash", self.first_block_hash.as_deref())?,
                self.last_block_offset.unwrap_or_default(),
                decode_hash("last_block_hash", self.last_block_hash.as_deref())?,
            )),
            _ => None,
        };

        if record.processed_size > record.size {
            return Err(Error::Persistence(format!(
                "processed_size {} exceeds size {} of \"{filename}\"",
                record.processed_size, record.size
            )));
        }

        Ok(Some(record))
    }
}

fn decode_hash(field: &str, value: Option<&str>) -> Result<[u8; 16]> {
    let value = value.ok_or_else(|| Error::Persistence(format!("missing {field}")))?;
    let mut out = [0u8; 16];
    hex::decode_to_slice(value, &mut out)
        .map_err(|e| Error::Persistence(format!("invalid {field} \"{value}\": {e}")))?;
    Ok(out)
}
