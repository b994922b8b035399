use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::QcError;

/// Logical name to raw column names.
///
/// Merging replaces whole keys: a later dictionary's entry for a key
/// discards the earlier columns for that key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Translation {
    groups: BTreeMap<String, Vec<String>>,
}

impl Translation {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, columns: Vec<String>) {
        let key = key.into();
        match self.groups.get(&key) {
            Some(previous) if previous != &columns => {
                debug!(key = %key, ?previous, replacement = ?columns, "translation key replaced");
            }
            _ => {}
        }
        self.groups.insert(key, columns);
    }

    pub fn merge<K, I, V>(&mut self, dict: I)
    where
        I: IntoIterator<Item = (K, Vec<V>)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (key, columns) in dict {
            self.insert(key, columns.into_iter().map(Into::into).collect());
        }
    }

    /// Raw columns behind `key`.
    pub fn resolve(&self, key: &str) -> Result<&[String], QcError> {
        self.groups
            .get(key)
            .map(Vec::as_slice)
            .ok_or_else(|| QcError::Configuration(format!("undefined key: {key}")))
    }

    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.groups.contains_key(key)
    }

    #[must_use]
    pub fn groups(&self) -> &BTreeMap<String, Vec<String>> {
        &self.groups
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}
