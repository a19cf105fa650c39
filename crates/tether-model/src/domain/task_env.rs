use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::KeyValue;

/// Environment handed to a task process.
///
/// Stored as an ordered list of key–value pairs; later entries override earlier ones.
/// This lets the environment builder layer generated variables first and the task's own
/// `env` map last without tracking precedence separately.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskEnv(pub Vec<KeyValue>);

impl TaskEnv {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &KeyValue> {
        self.0.iter()
    }

    /// Get the value for a key, returning the last matching entry.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .rev()
            .find(|kv| kv.key() == key)
            .map(|kv| kv.value())
    }

    /// Append a key–value pair. Later entries override earlier ones.
    pub fn push<K, V>(&mut self, key: K, value: V)
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.0.push(KeyValue::new(key, value));
    }

    /// Append every entry of `map` in key order.
    pub fn extend_from_map(&mut self, map: &BTreeMap<String, String>) {
        for (k, v) in map {
            self.push(k.as_str(), v.as_str());
        }
    }

    /// Resolve overrides into a map with exactly one value per key.
    pub fn to_map(&self) -> BTreeMap<String, String> {
        self.0
            .iter()
            .map(|kv| (kv.key().to_string(), kv.value().to_string()))
            .collect()
    }
}

impl Default for TaskEnv {
    fn default() -> Self {
        Self::new()
    }
}
