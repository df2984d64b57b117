use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::info;

use super::{read_document, write_document, StoreError};
use crate::platform::GroupId;

#[derive(Debug, Default, Serialize, Deserialize)]
struct SettlementDocument {
    #[serde(default)]
    settlement_groups: BTreeMap<String, GroupId>,
}

/// Maps a settlement name to the platform group its residents receive.
#[derive(Debug)]
pub struct SettlementGroupStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl SettlementGroupStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn get(&self, settlement: &str) -> Result<Option<GroupId>, StoreError> {
        Ok(self.list()?.get(settlement).copied())
    }

    pub fn set(&self, settlement: &str, group: GroupId) -> Result<(), StoreError> {
        let settlement = settlement.trim();
        if settlement.is_empty() {
            return Err(StoreError::Invalid(
                "settlement name must not be empty".to_string(),
            ));
        }
        let _guard = self.lock.lock().map_err(|_| StoreError::Poisoned)?;
        let mut document: SettlementDocument = read_document(&self.path)?;
        document
            .settlement_groups
            .insert(settlement.to_string(), group);
        write_document(&self.path, &document)?;
        info!(settlement, group_id = %group, "settlement group mapped");
        Ok(())
    }

    pub fn remove(&self, settlement: &str) -> Result<bool, StoreError> {
        let _guard = self.lock.lock().map_err(|_| StoreError::Poisoned)?;
        let mut document: SettlementDocument = read_document(&self.path)?;
        if document.settlement_groups.remove(settlement).is_none() {
            return Ok(false);
        }
        write_document(&self.path, &document)?;
        Ok(true)
    }

    pub fn list(&self) -> Result<BTreeMap<String, GroupId>, StoreError> {
        let _guard = self.lock.lock().map_err(|_| StoreError::Poisoned)?;
        let document: SettlementDocument = read_document(&self.path)?;
        Ok(document.settlement_groups)
    }
}
