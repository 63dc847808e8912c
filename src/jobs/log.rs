use std::collections::HashMap;
use std::fmt;

use serde::de::Deserializer;
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Items stored in a [`KeyedLog`].
pub trait Keyed {
    fn key(&self) -> &str;
}

/// Append-only log with a key index.
///
/// Insertion order is kept on disk (serialized as a plain array) and restored
/// on load; the index is rebuilt from the array. Duplicate keys in a loaded
/// array keep the first occurrence.
#[derive(Clone)]
pub struct KeyedLog<T> {
    entries: Vec<T>,
    index: HashMap<String, usize>,
}

impl<T> Default for KeyedLog<T> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            index: HashMap::new(),
        }
    }
}

impl<T: Keyed> KeyedLog<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: Vec<T>) -> Self {
        let mut log = Self::new();
        for entry in entries {
            let key = entry.key().to_string();
            if !log.append(entry) {
                warn!("Dropping duplicate log entry '{}'", key);
            }
        }
        log
    }

    /// Append unless the key is already present. Returns whether it was added.
    pub fn append(&mut self, entry: T) -> bool {
        if self.index.contains_key(entry.key()) {
            return false;
        }
        self.index.insert(entry.key().to_string(), self.entries.len());
        self.entries.push(entry);
        true
    }

    pub fn get(&self, key: &str) -> Option<&T> {
        self.index.get(key).and_then(|&i| self.entries.get(i))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.index.contains_key(key)
    }

    /// Entries in insertion order (oldest first).
    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<T: PartialEq> PartialEq for KeyedLog<T> {
    fn eq(&self, other: &Self) -> bool {
        self.entries == other.entries
    }
}

impl<T: fmt::Debug> fmt::Debug for KeyedLog<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.entries.iter()).finish()
    }
}

impl<T: Serialize> Serialize for KeyedLog<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.entries.iter())
    }
}

impl<'de, T: Deserialize<'de> + Keyed> Deserialize<'de> for KeyedLog<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let entries = Vec::<T>::deserialize(deserializer)?;
        Ok(Self::from_entries(entries))
    }
}
