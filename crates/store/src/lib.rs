//! Lock-guarded state containers that can be flushed to and reloaded from JSON files.
//!
//! [`PersistentKeyedStore`] holds one global value plus a map keyed by server
//! identifier; [`PersistentValue`] holds a single value (a strategy's config).
//! Both hand out exclusive RAII guards, so a section is released on every exit
//! path, unwinding included.

use std::{
    io,
    path::{Path, PathBuf},
};

use serde::{Serialize, de::DeserializeOwned};

use waypoint_utils::fs::{read_file, write_file_atomic};

pub mod keyed;
pub mod value;

pub use keyed::{PersistentKeyedStore, StoreData, StoreGuard};
pub use value::{PersistentValue, ValueGuard};

#[derive(Debug)]
pub enum StoreError {
    Io { path: PathBuf, source: io::Error },
    Format { path: PathBuf, source: serde_json::Error },
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Io { path, source } => {
                write!(f, "I/O error on {}: {}", path.display(), source)
            }
            StoreError::Format { path, source } => {
                write!(f, "malformed JSON in {}: {}", path.display(), source)
            }
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::Io { source, .. } => Some(source),
            StoreError::Format { source, .. } => Some(source),
        }
    }
}

/// `Ok(None)` when the file does not exist.
pub(crate) fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    let bytes = read_file(path).map_err(|source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    match bytes {
        Some(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| StoreError::Format {
                path: path.to_path_buf(),
                source,
            }),
        None => Ok(None),
    }
}

pub(crate) fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec_pretty(value).map_err(|source| StoreError::Format {
        path: path.to_path_buf(),
        source,
    })?;

    write_file_atomic(path, &bytes).map_err(|source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    })
}
