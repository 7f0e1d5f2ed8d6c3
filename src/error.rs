// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Cannot access \"{}\": {source}", .path.display())]
    Access {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Cannot fingerprint \"{}\": {source}", .path.display())]
    Identity {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{0}")]
    NoFile(String),

    #[error(
        "Modification time of \"{}\" changed without a size change, retrying on next poll",
        .0.display()
    )]
    Deferred(PathBuf),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Regex error: {0}")]
    Regex(String),
}

impl Error {
    pub(crate) fn access(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Access {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn identity(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Identity {
            path: path.into(),
            source,
        }
    }

    /// Whether the condition is expected to clear up by itself on a later poll.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Io(_)
                | Error::Access { .. }
                | Error::Identity { .. }
                | Error::NoFile(_)
                | Error::Deferred(_)
                | Error::Persistence(_)
        )
    }
}

impl From<regex::Error> for Error {
    fn from(e: regex::Error) -> Self {
        Error::Regex(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
