use std::{collections::BTreeMap, fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::ModelError;

/// Free-form, per-task driver configuration.
///
/// Recognized keys are backend-specific (`command`, `args`, `artifact_source`, `checksum`,
/// `jvm_options`, `base_image_path`, ...). Unknown keys are ignored by drivers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DriverConfig(BTreeMap<String, String>);

impl DriverConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<K, V>(mut self, key: K, value: V) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Value for `key`; empty strings count as absent.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.trim().is_empty())
    }

    /// Optional value parsed as `T`; a value that does not parse is an error, not absent.
    pub fn parse<T>(&self, key: &str) -> Result<Option<T>, ModelError>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        self.get(key)
            .map(|raw| {
                raw.trim().parse().map_err(|e: T::Err| ModelError::InvalidValue {
                    key: key.to_string(),
                    reason: format!("'{raw}': {e}"),
                })
            })
            .transpose()
    }

    /// Value for a key the backend cannot run without.
    pub fn require(&self, key: &str) -> Result<&str, ModelError> {
        self.get(key)
            .ok_or_else(|| ModelError::MissingKey(key.to_string()))
    }
}

impl<K, V> FromIterator<(K, V)> for DriverConfig
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn require_names_the_missing_key() {
        let cfg = DriverConfig::new().with("args", "-v");
        assert_eq!(
            cfg.require("command"),
            Err(ModelError::MissingKey("command".into()))
        );
        assert_eq!(
            cfg.require("command").unwrap_err().to_string(),
            "missing required config key 'command'"
        );
    }

    #[test]
    fn blank_values_are_absent() {
        let cfg: DriverConfig = [("command", "  "), ("args", "x")].into_iter().collect();
        assert!(cfg.get("command").is_none());
        assert_eq!(cfg.get("args"), Some("x"));
    }

    #[test]
    fn parse_reports_malformed_values() {
        let cfg = DriverConfig::new().with("vcpus", "2").with("port", "many");
        assert_eq!(cfg.parse::<u32>("vcpus"), Ok(Some(2)));
        assert_eq!(cfg.parse::<u32>("memory"), Ok(None));

        let err = cfg.parse::<u16>("port").unwrap_err();
        assert!(matches!(&err, ModelError::InvalidValue { key, .. } if key == "port"));
        assert!(err.to_string().contains("'many'"));
    }
}
