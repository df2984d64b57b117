use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::info;

use super::{read_document, write_document, StoreError};
use crate::platform::UserId;

const MAX_ALIAS_LEN: usize = 20;
const FORBIDDEN: [&str; 4] = ["@", "#", ":", "`"];

#[derive(Debug, Default, Serialize, Deserialize)]
struct AliasDocument {
    #[serde(default)]
    aliases: BTreeMap<String, String>,
}

/// Operator-chosen secondary labels keyed by user.
#[derive(Debug)]
pub struct AliasStore {
    path: PathBuf,
    separator: String,
    lock: Mutex<()>,
}

/// Rejects labels that would break display names or render as mentions.
///
/// A label may not contain the display-name separator (ignoring its padding),
/// otherwise the label could not be recovered from a composed name.
pub fn validate_alias(alias: &str, separator: &str) -> Result<(), StoreError> {
    let length = alias.chars().count();
    if length == 0 {
        return Err(StoreError::Invalid("alias must not be empty".to_string()));
    }
    if length > MAX_ALIAS_LEN {
        return Err(StoreError::Invalid(format!(
            "alias must be at most {MAX_ALIAS_LEN} characters"
        )));
    }
    if let Some(token) = FORBIDDEN.iter().find(|token| alias.contains(*token)) {
        return Err(StoreError::Invalid(format!(
            "alias must not contain '{token}'"
        )));
    }
    let mark = match separator.trim() {
        "" => separator,
        trimmed => trimmed,
    };
    if !mark.is_empty() && alias.contains(mark) {
        return Err(StoreError::Invalid(format!(
            "alias must not contain the separator '{mark}'"
        )));
    }
    if alias.starts_with('<') && alias.ends_with('>') {
        return Err(StoreError::Invalid(
            "alias must not look like a mention".to_string(),
        ));
    }
    Ok(())
}

impl AliasStore {
    pub fn new(path: impl Into<PathBuf>, separator: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            separator: separator.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn get(&self, id: UserId) -> Result<Option<String>, StoreError> {
        let _guard = self.lock.lock().map_err(|_| StoreError::Poisoned)?;
        let document: AliasDocument = read_document(&self.path)?;
        Ok(document.aliases.get(&id.to_string()).cloned())
    }

    pub fn set(&self, id: UserId, alias: &str) -> Result<(), StoreError> {
        let alias = alias.trim();
        validate_alias(alias, &self.separator)?;
        let _guard = self.lock.lock().map_err(|_| StoreError::Poisoned)?;
        let mut document: AliasDocument = read_document(&self.path)?;
        document.aliases.insert(id.to_string(), alias.to_string());
        write_document(&self.path, &document)?;
        info!(user_id = %id, alias, "alias set");
        Ok(())
    }

    pub fn remove(&self, id: UserId) -> Result<bool, StoreError> {
        let _guard = self.lock.lock().map_err(|_| StoreError::Poisoned)?;
        let mut document: AliasDocument = read_document(&self.path)?;
        if document.aliases.remove(&id.to_string()).is_none() {
            return Ok(false);
        }
        write_document(&self.path, &document)?;
        Ok(true)
    }

    /// Entries whose key is not a numeric id are skipped.
    pub fn list(&self) -> Result<BTreeMap<UserId, String>, StoreError> {
        let _guard = self.lock.lock().map_err(|_| StoreError::Poisoned)?;
        let document: AliasDocument = read_document(&self.path)?;
        Ok(document
            .aliases
            .into_iter()
            .filter_map(|(key, alias)| key.parse::<u64>().ok().map(|id| (UserId(id), alias)))
            .collect())
    }
}
