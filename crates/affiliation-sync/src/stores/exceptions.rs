use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{read_document, write_document, StoreError};
use crate::platform::UserId;

#[derive(Debug, Default, Serialize, Deserialize)]
struct ExceptionDocument {
    #[serde(default)]
    exceptions: Vec<String>,
}

impl ExceptionDocument {
    fn into_set(self) -> Result<BTreeSet<UserId>, StoreError> {
        self.exceptions
            .iter()
            .map(|raw| {
                raw.trim()
                    .parse::<u64>()
                    .map(UserId)
                    .map_err(|_| StoreError::Invalid(format!("exception entry '{raw}'")))
            })
            .collect()
    }

    fn from_set(set: &BTreeSet<UserId>) -> Self {
        Self {
            exceptions: set.iter().map(|id| id.to_string()).collect(),
        }
    }
}

/// Identifiers excluded from automated verification.
///
/// The file is authoritative and is re-read on every query, so writes made
/// through another handle or process are visible immediately. The lock only
/// serialises this handle's read-modify-write cycles.
#[derive(Debug)]
pub struct ExceptionStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl ExceptionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<BTreeSet<UserId>, StoreError> {
        read_document::<ExceptionDocument>(&self.path)?.into_set()
    }

    pub fn contains(&self, id: UserId) -> Result<bool, StoreError> {
        let _guard = self.lock.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(self.load()?.contains(&id))
    }

    /// Fails closed: an unreadable store treats every identifier as excepted.
    pub fn is_excepted(&self, id: UserId) -> bool {
        match self.contains(id) {
            Ok(excepted) => excepted,
            Err(err) => {
                warn!(user_id = %id, error = %err, "exception store unreadable, treating user as excepted");
                true
            }
        }
    }

    pub fn add(&self, id: UserId) -> Result<bool, StoreError> {
        self.mutate(|set| set.insert(id))
            .inspect(|added| {
                if *added {
                    info!(user_id = %id, "exception added");
                }
            })
    }

    pub fn remove(&self, id: UserId) -> Result<bool, StoreError> {
        self.mutate(|set| set.remove(&id))
            .inspect(|removed| {
                if *removed {
                    info!(user_id = %id, "exception removed");
                }
            })
    }

    pub fn list(&self) -> Result<Vec<UserId>, StoreError> {
        let _guard = self.lock.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(self.load()?.into_iter().collect())
    }

    fn mutate<F>(&self, change: F) -> Result<bool, StoreError>
    where
        F: FnOnce(&mut BTreeSet<UserId>) -> bool,
    {
        let _guard = self.lock.lock().map_err(|_| StoreError::Poisoned)?;
        let mut set = self.load()?;
        let changed = change(&mut set);
        if changed {
            write_document(&self.path, &ExceptionDocument::from_set(&set))?;
        }
        Ok(changed)
    }
}
