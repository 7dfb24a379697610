//! Job configuration: an ordered string-to-string map.
//!
//! Loads configuration from YAML and merges `key=value` overrides on top.

use std::fs;
use std::path::Path;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::bridge::BridgeError;

/// Comma separated input paths read by the default input format
pub const INPUT_PATHS_KEY: &str = "luadoop.input.paths";
/// Output directory of the local engine
pub const OUTPUT_PATH_KEY: &str = "luadoop.output.path";
/// Number of reduce partitions; 0 runs map only
pub const REDUCE_TASKS_KEY: &str = "luadoop.reduce.tasks";

/// Ordered key/value job configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Configuration {
    entries: IndexMap<String, String>,
}

impl Configuration {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from a YAML mapping file.
    ///
    /// Scalar values (strings, numbers, booleans) are stringified; nested
    /// mappings and sequences are rejected.
    ///
    /// # Arguments
    /// * `path` - Path to a YAML file whose top level is a mapping
    ///
    /// # Errors
    /// Returns `BridgeError::Configuration` if the file can't be read or has
    /// an invalid shape
    ///
    /// # Example
    /// ```ignore
    /// use luadoop::host::Configuration;
    ///
    /// let conf = Configuration::load_from_file("job.yaml")?;
    /// println!("mapper: {:?}", conf.get("luadoop.mapper"));
    /// ```
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, BridgeError> {
        let path = path.as_ref();

        let contents = fs::read_to_string(path).map_err(|e| {
            BridgeError::configuration(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;

        Self::from_yaml_str(&contents)
    }

    /// Parse configuration from YAML text
    pub fn from_yaml_str(contents: &str) -> Result<Self, BridgeError> {
        let yaml: serde_yaml::Value = serde_yaml::from_str(contents)
            .map_err(|e| BridgeError::configuration(format!("Failed to parse YAML: {}", e)))?;

        let mut conf = Configuration::new();
        let mapping = match yaml {
            serde_yaml::Value::Null => return Ok(conf),
            serde_yaml::Value::Mapping(mapping) => mapping,
            _ => {
                return Err(BridgeError::configuration(
                    "Configuration file must contain a mapping",
                ))
            }
        };

        for (key, value) in mapping {
            let key = yaml_scalar_to_string(&key).ok_or_else(|| {
                BridgeError::configuration(format!("Invalid configuration key: {:?}", key))
            })?;
            let value = yaml_scalar_to_string(&value).ok_or_else(|| {
                BridgeError::configuration(format!(
                    "Configuration key {} must have a scalar value",
                    key
                ))
            })?;
            conf.set(key, value);
        }

        Ok(conf)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    /// Get a value, falling back to `default` when unset
    pub fn get_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.get(key).unwrap_or(default)
    }

    /// Parse a value as an integer, `None` when unset
    pub fn get_int(&self, key: &str) -> Result<Option<i64>, BridgeError> {
        match self.get(key) {
            None => Ok(None),
            Some(raw) => raw.trim().parse::<i64>().map(Some).map_err(|_| {
                BridgeError::configuration(format!(
                    "Configuration key {} is not an integer: {}",
                    key, raw
                ))
            }),
        }
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.entries.shift_remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Copy every entry of `other` into this configuration, overwriting
    pub fn merge(&mut self, other: &Configuration) {
        for (key, value) in other.iter() {
            self.set(key, value);
        }
    }

    /// Apply a `key=value` override, as given on the command line
    pub fn apply_override(&mut self, assignment: &str) -> Result<(), BridgeError> {
        let (key, value) = assignment.split_once('=').ok_or_else(|| {
            BridgeError::configuration(format!(
                "Invalid override '{}', expected key=value",
                assignment
            ))
        })?;
        let key = key.trim();
        if key.is_empty() {
            return Err(BridgeError::configuration(format!(
                "Invalid override '{}', empty key",
                assignment
            )));
        }
        self.set(key, value);
        Ok(())
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Configuration {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut conf = Configuration::new();
        for (k, v) in iter {
            conf.set(k, v);
        }
        conf
    }
}

fn yaml_scalar_to_string(value: &serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::String(s) => Some(s.clone()),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        serde_yaml::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_load_from_file_stringifies_scalars() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            "luadoop.mapper: WordCount.Mapper\nluadoop.reduce.tasks: 3\nfeature.enabled: true"
        )
        .unwrap();

        let conf = Configuration::load_from_file(file.path()).unwrap();
        assert_eq!(conf.get("luadoop.mapper"), Some("WordCount.Mapper"));
        assert_eq!(conf.get("luadoop.reduce.tasks"), Some("3"));
        assert_eq!(conf.get("feature.enabled"), Some("true"));
        assert_eq!(conf.get_int("luadoop.reduce.tasks").unwrap(), Some(3));
    }

    #[test]
    fn test_nested_values_are_rejected() {
        let err = Configuration::from_yaml_str("a:\n  b: c\n").unwrap_err();
        assert!(err.is_configuration());
        assert!(err.message().contains("scalar"));
    }

    #[test]
    fn test_empty_document_is_empty_configuration() {
        let conf = Configuration::from_yaml_str("").unwrap();
        assert!(conf.is_empty());
    }

    #[test]
    fn test_overrides_and_merge_preserve_order() {
        let mut conf: Configuration = vec![("b", "1"), ("a", "2")].into_iter().collect();
        conf.apply_override("c=x=y").unwrap();
        assert_eq!(conf.get("c"), Some("x=y"));
        assert!(conf.apply_override("novalue").is_err());

        let other: Configuration = vec![("a", "3")].into_iter().collect();
        conf.merge(&other);
        let keys: Vec<&str> = conf.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["b", "a", "c"]);
        assert_eq!(conf.get("a"), Some("3"));
    }

    #[test]
    fn test_get_int_rejects_garbage() {
        let conf: Configuration = vec![("n", "many")].into_iter().collect();
        assert!(conf.get_int("n").is_err());
        assert_eq!(conf.get_int("missing").unwrap(), None);
    }
}
