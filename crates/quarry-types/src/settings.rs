//! Flat string settings with typed getters.

use std::collections::BTreeMap;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Well-known setting keys.
pub mod keys {
    pub const CLUSTER_NAME: &str = "cluster.name";
    pub const NODE_NAME: &str = "node.name";
    pub const PATH_DATA: &str = "path.data";
    pub const NODE_MASTER: &str = "node.master";
    pub const NODE_DATA: &str = "node.data";
    pub const STORE_TYPE: &str = "index.store.type";
    pub const NUMBER_OF_SHARDS: &str = "index.number_of_shards";
    pub const NUMBER_OF_REPLICAS: &str = "index.number_of_replicas";
    pub const MINIMUM_MASTER_NODES: &str = "discovery.zen.minimum_master_nodes";
    pub const ALLOCATION_DELAY_MS: &str = "cluster.routing.allocation.delay_ms";
    pub const HTTP_ENABLED: &str = "http.enabled";
    pub const HTTP_PORT: &str = "http.port";
    pub const TRANSPORT_PORT: &str = "transport.tcp.port";
    pub const NETWORK_HOST: &str = "network.host";

    /// Keys the orchestrator owns; user callbacks cannot change them.
    pub const MANDATED: [&str; 3] = [CLUSTER_NAME, NODE_NAME, PATH_DATA];
}

/// A setting was present but could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid value {value:?} for setting {key}: {reason}")]
pub struct SettingsError {
    pub key: String,
    pub value: String,
    pub reason: String,
}

/// Immutable node or index settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    map: BTreeMap<String, String>,
}

impl Settings {
    pub fn builder() -> SettingsBuilder {
        SettingsBuilder::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.map.get(key).map(String::as_str)
    }

    /// Parses `key` as `T`. Missing keys yield `Ok(None)`.
    pub fn get_as<T>(&self, key: &str) -> Result<Option<T>, SettingsError>
    where
        T: FromStr,
        T::Err: Display,
    {
        match self.map.get(key) {
            None => Ok(None),
            Some(raw) => raw.trim().parse::<T>().map(Some).map_err(|e| SettingsError {
                key: key.to_string(),
                value: raw.clone(),
                reason: e.to_string(),
            }),
        }
    }

    /// Parses `key` as `T`, falling back to `default` when absent.
    pub fn get_or<T>(&self, key: &str, default: T) -> Result<T, SettingsError>
    where
        T: FromStr,
        T::Err: Display,
    {
        Ok(self.get_as(key)?.unwrap_or(default))
    }

    /// Boolean setting; accepts `true/false`, `on/off`, `yes/no`, `1/0`.
    pub fn get_bool(&self, key: &str, default: bool) -> Result<bool, SettingsError> {
        let Some(raw) = self.map.get(key) else {
            return Ok(default);
        };
        match raw.trim().to_ascii_lowercase().as_str() {
            "true" | "on" | "yes" | "1" => Ok(true),
            "false" | "off" | "no" | "0" => Ok(false),
            _ => Err(SettingsError {
                key: key.to_string(),
                value: raw.clone(),
                reason: "expected a boolean".to_string(),
            }),
        }
    }

    /// Duration setting expressed in milliseconds.
    pub fn get_duration_ms(&self, key: &str, default: Duration) -> Result<Duration, SettingsError> {
        Ok(self
            .get_as::<u64>(key)?
            .map_or(default, Duration::from_millis))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.map.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.map.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Returns a builder seeded with these settings.
    pub fn to_builder(&self) -> SettingsBuilder {
        SettingsBuilder {
            map: self.map.clone(),
        }
    }
}

/// Mutable settings under construction.
#[derive(Debug, Clone, Default)]
pub struct SettingsBuilder {
    map: BTreeMap<String, String>,
}

impl SettingsBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets `key`, replacing any previous value.
    pub fn put(&mut self, key: impl Into<String>, value: impl ToString) -> &mut Self {
        self.map.insert(key.into(), value.to_string());
        self
    }

    /// Copies every entry of `settings`, overriding existing keys.
    pub fn put_all(&mut self, settings: &Settings) -> &mut Self {
        for (k, v) in settings.iter() {
            self.map.insert(k.to_string(), v.to_string());
        }
        self
    }

    /// Sets `key` only when it is not already present.
    pub fn put_if_absent(&mut self, key: impl Into<String>, value: impl ToString) -> &mut Self {
        self.map.entry(key.into()).or_insert_with(|| value.to_string());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.map.get(key).map(String::as_str)
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.map.remove(key)
    }

    pub fn build(&self) -> Settings {
        Settings {
            map: self.map.clone(),
        }
    }
}

impl From<SettingsBuilder> for Settings {
    fn from(builder: SettingsBuilder) -> Self {
        Settings { map: builder.map }
    }
}

impl<K: Into<String>, V: ToString> FromIterator<(K, V)> for Settings {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Settings {
            map: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.to_string()))
                .collect(),
        }
    }
}
