//! Configuration overlays
//!
//! An overlay is an ordered list of `cassandra.yaml` overrides. A key mapped
//! to a value replaces the distribution default; a key mapped to nothing
//! (YAML `null`, or the string `unset`) deletes the default key. Setting a key again replaces the
//! earlier entry and moves it to the end, so the last write always wins.

use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};

use crate::error::{Error, Result};

/// Value that marks a key for deletion, like `null`
pub const UNSET: &str = "unset";

/// Ordered `(key, value-or-absent)` overrides
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Mapping", into = "Mapping")]
pub struct ConfigOverlay {
    entries: Vec<(String, Option<Value>)>,
}

impl ConfigOverlay {
    /// Create an empty overlay
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `key` to `value`, or mark it for deletion with `None` or
    /// [`UNSET`]
    pub fn set(&mut self, key: impl Into<String>, value: Option<Value>) -> Result<()> {
        let key = key.into();
        validate_key(&key)?;
        let value = value.filter(|v| v.as_str() != Some(UNSET));
        self.entries.retain(|(k, _)| *k != key);
        self.entries.push((key, value));
        Ok(())
    }

    /// Set every pair in order
    pub fn extend<I, K>(&mut self, values: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, Option<Value>)>,
        K: Into<String>,
    {
        for (key, value) in values {
            self.set(key, value)?;
        }
        Ok(())
    }

    /// Override registered for `key`: `Some(None)` means "delete the default"
    pub fn get(&self, key: &str) -> Option<Option<&Value>> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_ref())
    }

    /// Forget any override for `key`
    pub fn remove(&mut self, key: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(k, _)| k != key);
        self.entries.len() != before
    }

    /// Iterate overrides in application order
    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<&Value>)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_ref()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// This overlay with `top` applied over it
    pub fn merged_with(&self, top: &ConfigOverlay) -> ConfigOverlay {
        let mut merged = self.clone();
        for (key, value) in &top.entries {
            merged.entries.retain(|(k, _)| k != key);
            merged.entries.push((key.clone(), value.clone()));
        }
        merged
    }

    /// Apply overrides to a YAML document
    pub fn apply_to(&self, doc: &mut Mapping) {
        for (key, value) in &self.entries {
            let key = Value::String(key.clone());
            match value {
                Some(v) => {
                    doc.insert(key, v.clone());
                }
                None => {
                    doc.remove(&key);
                }
            }
        }
    }

    /// Parse a `key: value` entry, the value being any YAML scalar or
    /// collection. An empty value, `null` or `unset` marks the key for
    /// deletion.
    pub fn parse_entry(entry: &str) -> Result<(String, Option<Value>)> {
        let (key, raw) = entry
            .split_once(':')
            .ok_or_else(|| {
                Error::Argument(format!("malformed option {} (expected key:value)", entry))
            })?;
        let key = key.trim().to_string();
        validate_key(&key)?;

        let raw = raw.trim();
        if raw.is_empty() {
            return Ok((key, None));
        }
        let value: Value = serde_yaml::from_str(raw)
            .map_err(|e| Error::Argument(format!("malformed value for {}: {}", key, e)))?;
        match value {
            Value::Null => Ok((key, None)),
            Value::String(s) if s == UNSET => Ok((key, None)),
            v => Ok((key, Some(v))),
        }
    }
}

fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() || key.chars().any(char::is_whitespace) {
        return Err(Error::Argument(format!("invalid configuration key {:?}", key)));
    }
    Ok(())
}

impl TryFrom<Mapping> for ConfigOverlay {
    type Error = Error;

    fn try_from(mapping: Mapping) -> Result<Self> {
        let mut overlay = ConfigOverlay::new();
        for (key, value) in mapping {
            let key = match key {
                Value::String(s) => s,
                other => {
                    return Err(Error::Argument(format!(
                        "configuration keys must be strings, got {:?}",
                        other
                    )))
                }
            };
            let value = match value {
                Value::Null => None,
                v => Some(v),
            };
            overlay.set(key, value)?;
        }
        Ok(overlay)
    }
}

impl From<ConfigOverlay> for Mapping {
    fn from(overlay: ConfigOverlay) -> Self {
        overlay
            .entries
            .into_iter()
            .map(|(k, v)| (Value::String(k), v.unwrap_or(Value::Null)))
            .collect()
    }
}
