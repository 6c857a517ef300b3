//! Typed model for the k3s config and registry documents.
//!
//! The k3s surface is YAML made of scalars, flags and string lists. Keeping
//! the value space closed gives the renderer and the resync round-trip a
//! precise contract; anything outside it is rejected at parse time instead of
//! being carried around as dynamic YAML.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{NodeError, DATA_DIR};

/// One k3s configuration value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigValue {
    Bool(bool),
    Int(i64),
    String(String),
    List(Vec<String>),
}

/// Ordered key/value configuration. `BTreeMap` keeps the rendered document
/// deterministic across runs.
pub type ConfigMap = BTreeMap<String, ConfigValue>;

impl From<&str> for ConfigValue {
    fn from(value: &str) -> Self {
        ConfigValue::String(value.to_string())
    }
}

impl From<String> for ConfigValue {
    fn from(value: String) -> Self {
        ConfigValue::String(value)
    }
}

impl From<bool> for ConfigValue {
    fn from(value: bool) -> Self {
        ConfigValue::Bool(value)
    }
}

impl From<i64> for ConfigValue {
    fn from(value: i64) -> Self {
        ConfigValue::Int(value)
    }
}

impl From<Vec<String>> for ConfigValue {
    fn from(value: Vec<String>) -> Self {
        ConfigValue::List(value)
    }
}

/// Renders a config map to its on-disk YAML form.
pub fn render(map: &ConfigMap) -> Result<String, NodeError> {
    serde_yaml::to_string(map).map_err(|source| NodeError::ConfigRender { source })
}

/// Parses on-disk YAML back into a config map. Empty or whitespace-only
/// documents yield an empty map.
pub fn parse(yaml: &str) -> Result<ConfigMap, NodeError> {
    if yaml.trim().is_empty() {
        return Ok(ConfigMap::new());
    }
    serde_yaml::from_str(yaml).map_err(|source| NodeError::ConfigParse { source })
}

/// The node's data directory: the `data-dir` config key, or the k3s default.
pub fn data_dir(config: &ConfigMap) -> &str {
    match config.get("data-dir") {
        Some(ConfigValue::String(dir)) if !dir.is_empty() => dir,
        _ => DATA_DIR,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ConfigMap {
        ConfigMap::from([
            ("cluster-init".to_string(), ConfigValue::from(true)),
            (
                "etcd-s3-timeout".to_string(),
                ConfigValue::from("5m30s"),
            ),
            (
                "node-label".to_string(),
                ConfigValue::from(vec!["foo=bar".to_string(), "tier=edge".to_string()]),
            ),
            ("etcd-snapshot-retention".to_string(), ConfigValue::Int(5)),
        ])
    }

    #[test]
    fn render_parse_round_trip() {
        let map = sample();
        let yaml = render(&map).unwrap();
        assert_eq!(parse(&yaml).unwrap(), map);
    }

    #[test]
    fn parse_types_scalars() {
        let map = parse("cluster-init: true\nnode-name: edge-1\nhttps-listen-port: 6443\n").unwrap();
        assert_eq!(map["cluster-init"], ConfigValue::Bool(true));
        assert_eq!(map["node-name"], ConfigValue::String("edge-1".to_string()));
        assert_eq!(map["https-listen-port"], ConfigValue::Int(6443));
    }

    #[test]
    fn parse_empty_document() {
        assert!(parse("").unwrap().is_empty());
        assert!(parse("  \n").unwrap().is_empty());
    }

    #[test]
    fn data_dir_defaults_when_unset() {
        assert_eq!(data_dir(&ConfigMap::new()), DATA_DIR);

        let mut map = ConfigMap::new();
        map.insert("data-dir".to_string(), ConfigValue::from("/mnt/k3s"));
        assert_eq!(data_dir(&map), "/mnt/k3s");

        map.insert("data-dir".to_string(), ConfigValue::from(""));
        assert_eq!(data_dir(&map), DATA_DIR);
    }

    #[test]
    fn render_is_deterministic() {
        let map = sample();
        assert_eq!(render(&map).unwrap(), render(&map.clone()).unwrap());
    }
}
