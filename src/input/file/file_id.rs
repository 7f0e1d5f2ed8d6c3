// SPDX-License-Identifier: Apache-2.0

//! Platform-independent file identity based on inode (Unix) or file index (Windows).
//!
//! Whether the identity can be trusted depends on the filesystem, so every
//! comparison goes through an [`IdentityMode`] chosen when the files are scanned.

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io;
use std::path::Path;

/// A platform-independent identifier for a file.
///
/// On Unix systems, this is the device ID + inode number (`ino_hi` is always 0).
/// On Windows, this is the volume serial number + file index, where ReFS
/// needs the full 128-bit file id split over `ino_lo`/`ino_hi`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileId {
    dev: u64,
    ino_lo: u64,
    ino_hi: u64,
}

/// How device and inode numbers are interpreted on the filesystem holding a target.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum IdentityMode {
    /// Identifiers are not stable (e.g. FAT32), only content decides.
    Ignore,
    /// Device + 64-bit inode or file index.
    #[default]
    DevInode,
    /// Device + 128-bit file id.
    DevInodeFull,
}

/// Result of comparing where two records live on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Place {
    Same,
    Other,
    Unknown,
}

impl FileId {
    /// Create a FileId from raw values.
    /// Used for loading persisted state.
    pub fn new(dev: u64, ino_lo: u64, ino_hi: u64) -> Self {
        Self {
            dev,
            ino_lo,
            ino_hi,
        }
    }

    /// Create a FileId from an open file handle.
    #[cfg(unix)]
    pub fn from_file(file: &File, _mode: IdentityMode) -> io::Result<Self> {
        use std::os::unix::fs::MetadataExt;

        let metadata = file.metadata()?;
        Ok(Self {
            dev: metadata.dev(),
            ino_lo: metadata.ino(),
            ino_hi: 0,
        })
    }

    /// Create a FileId from an open file handle.
    #[cfg(windows)]
    pub fn from_file(file: &File, mode: IdentityMode) -> io::Result<Self> {
        use std::os::windows::io::AsRawHandle;
        use windows_sys::Win32::Foundation::HANDLE;
        use windows_sys::Win32::Storage::FileSystem::{
            BY_HANDLE_FILE_INFORMATION, FILE_ID_INFO, FileIdInfo, GetFileInformationByHandle,
            GetFileInformationByHandleEx,
        };

        let handle = file.as_raw_handle() as HANDLE;

        if mode == IdentityMode::DevInodeFull {
            let mut info: FILE_ID_INFO = unsafe { std::mem::zeroed() };
            let result = unsafe {
                GetFileInformationByHandleEx(
                    handle,
                    FileIdInfo,
                    &mut info as *mut FILE_ID_INFO as *mut std::ffi::c_void,
                    std::mem::size_of::<FILE_ID_INFO>() as u32,
                )
            };
            if result == 0 {
                return Err(io::Error::last_os_error());
            }

            let id = u128::from_le_bytes(info.FileId.Identifier);
            return Ok(Self {
                dev: info.VolumeSerialNumber,
                ino_lo: id as u64,
                ino_hi: (id >> 64) as u64,
            });
        }

        // Indexes are copied even when they cannot be trusted so that debug output stays useful
        let mut info: BY_HANDLE_FILE_INFORMATION = unsafe { std::mem::zeroed() };
        let result = unsafe { GetFileInformationByHandle(handle, &mut info) };
        if result == 0 {
            return Err(io::Error::last_os_error());
        }

        let file_index = ((info.nFileIndexHigh as u64) << 32) | (info.nFileIndexLow as u64);

        Ok(Self {
            dev: info.dwVolumeSerialNumber as u64,
            ino_lo: file_index,
            ino_hi: 0,
        })
    }

    /// Create a FileId from a path by opening the file.
    pub fn from_path(path: impl AsRef<Path>, mode: IdentityMode) -> io::Result<Self> {
        let file = File::open(path)?;
        Self::from_file(&file, mode)
    }

    /// Device ID (Unix) or volume serial number (Windows).
    pub fn dev(&self) -> u64 {
        self.dev
    }

    /// Inode number (Unix) or file index (Windows).
    pub fn ino_lo(&self) -> u64 {
        self.ino_lo
    }

    /// Upper half of a 128-bit file id, 0 elsewhere.
    pub fn ino_hi(&self) -> u64 {
        self.ino_hi
    }

    /// Compare the places of two files under the given identity mode.
    pub fn place(&self, other: &FileId, mode: IdentityMode) -> Place {
        match mode {
            IdentityMode::Ignore => Place::Unknown,
            IdentityMode::DevInode => {
                if self.dev != other.dev || self.ino_lo != other.ino_lo {
                    Place::Other
                } else {
                    Place::Same
                }
            }
            IdentityMode::DevInodeFull => {
                if self.dev != other.dev
                    || self.ino_lo != other.ino_lo
                    || self.ino_hi != other.ino_hi
                {
                    Place::Other
                } else {
                    Place::Same
                }
            }
        }
    }
}

impl std::fmt::Display for FileId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.ino_hi == 0 {
            write!(f, "{}:{}", self.dev, self.ino_lo)
        } else {
            write!(f, "{}:{}:{}", self.dev, self.ino_hi, self.ino_lo)
        }
    }
}

impl IdentityMode {
    /// Decide how identifiers are used for files under `path`.
    ///
    /// On Unix inodes are always usable.
    #[cfg(unix)]
    pub fn for_path(_path: &Path) -> io::Result<Self> {
        Ok(IdentityMode::DevInode)
    }

    /// Decide how identifiers are used for files under `path`.
    ///
    /// NTFS provides a stable 64-bit file index, ReFS needs the 128-bit file id and
    /// anything else (FAT32, exFAT, network shares) cannot be trusted.
    #[cfg(windows)]
    pub fn for_path(path: &Path) -> io::Result<Self> {
        use std::os::windows::ffi::OsStrExt;
        use windows_sys::Win32::Storage::FileSystem::{GetVolumeInformationW, GetVolumePathNameW};

        const MAX_PATH: usize = 260;

        let wide: Vec<u16> = path
            .as_os_str()
            .encode_wide()
            .chain(std::iter::once(0))
            .collect();
        let mut mount_point = [0u16; MAX_PATH + 1];

        let result =
            unsafe { GetVolumePathNameW(wide.as_ptr(), mount_point.as_mut_ptr(), MAX_PATH as u32) };
        if result == 0 {
            return Err(io::Error::last_os_error());
        }

        let mut fs_type = [0u16; MAX_PATH + 1];
        let result = unsafe {
            GetVolumeInformationW(
                mount_point.as_ptr(),
                std::ptr::null_mut(),
                0,
                std::ptr::null_mut(),
                std::ptr::null_mut(),
                std::ptr::null_mut(),
                fs_type.as_mut_ptr(),
                MAX_PATH as u32,
            )
        };
        if result == 0 {
            return Err(io::Error::last_os_error());
        }

        let len = fs_type.iter().position(|&c| c == 0).unwrap_or(fs_type.len());
        let fs_name = String::from_utf16_lossy(&fs_type[..len]);
        tracing::debug!(path = ?path, fs = %fs_name, "Log files reside on filesystem");

        Ok(Self::from_fs_name(&fs_name))
    }

    /// Map a filesystem type name to the identity mode usable on it.
    pub fn from_fs_name(name: &str) -> Self {
        match name {
            "NTFS" => IdentityMode::DevInode,
            "ReFS" => IdentityMode::DevInodeFull,
            _ => IdentityMode::Ignore,
        }
    }
}
