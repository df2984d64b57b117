//! Small JSON documents that act as the system's durable state.
//!
//! Each store owns exactly one file and serialises every access through an
//! internal lock, so concurrent handlers cannot lose each other's updates.

pub mod aliases;
pub mod exceptions;
pub mod settlements;

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;

pub use aliases::{validate_alias, AliasStore};
pub use exceptions::ExceptionStore;
pub use settlements::SettlementGroupStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store io failed for {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("store document {} is malformed: {source}", path.display())]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid value: {0}")]
    Invalid(String),
    #[error("store lock poisoned")]
    Poisoned,
}

/// Reads `path`, returning the document default when the file does not exist yet.
pub(crate) fn read_document<T>(path: &Path) -> Result<T, StoreError>
where
    T: DeserializeOwned + Default,
{
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(T::default()),
        Err(source) => {
            return Err(StoreError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    serde_json::from_str(&raw).map_err(|source| StoreError::Malformed {
        path: path.to_path_buf(),
        source,
    })
}

/// Writes through a sibling temp file and renames it over the target.
pub(crate) fn write_document<T>(path: &Path, document: &T) -> Result<(), StoreError>
where
    T: Serialize,
{
    let io_error = |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(io_error)?;
    }

    let body = serde_json::to_string_pretty(document).map_err(|source| StoreError::Malformed {
        path: path.to_path_buf(),
        source,
    })?;

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, body).map_err(io_error)?;
    fs::rename(&tmp, path).map_err(io_error)
}
