// Command-line `key.path=value` overrides.

use anyhow::{anyhow, bail, Result};
use serde::de::DeserializeOwned;
use std::{fmt, str::FromStr};

/// Keys that select a preset instead of setting a field.
const GROUP_SELECTORS: [&str; 2] = ["data", "model"];

#[derive(Debug, Clone, PartialEq)]
pub struct Override {
    pub key:   String,
    pub value: toml::Value,
    raw:       String,
}

impl Override {
    pub fn is_group_selector(&self) -> bool {
        GROUP_SELECTORS.contains(&self.key.as_str())
    }

    /// Deserialize the value into a concrete type (e.g. an enum choice).
    pub fn parse_value<T: DeserializeOwned>(&self) -> Result<T> {
        self.value
            .clone()
            .try_into::<T>()
            .map_err(|e| anyhow!("{}: {e}", self.key))
    }
}

impl FromStr for Override {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let Some((key, raw)) = s.split_once('=') else {
            bail!("Override '{s}' must have the form key.path=value");
        };
        let key = key.trim();
        if key.is_empty() || key.split('.').any(str::is_empty) {
            bail!("Override '{s}' has an empty key segment");
        }
        let raw = raw.trim();
        Ok(Self {
            key:   key.to_string(),
            value: parse_scalar(raw),
            raw:   raw.to_string(),
        })
    }
}

impl fmt::Display for Override {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.key, self.raw)
    }
}

/// TOML literal if it parses as one, plain string otherwise.
fn parse_scalar(raw: &str) -> toml::Value {
    toml::from_str::<toml::Table>(&format!("v = {raw}"))
        .ok()
        .and_then(|mut table| table.remove("v"))
        .unwrap_or_else(|| toml::Value::String(raw.to_string()))
}
