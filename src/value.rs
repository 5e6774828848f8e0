//! Generic configuration value tree.
//!
//! Configuration fragments (defaults, datasource, cloud-config) are decoded
//! into a [`ConfigValue`] before they are merged or diffed. The tree is a
//! closed set of variants so the merge algorithms can match exhaustively.
//!
//! `Clone` is a deep copy: no part of a cloned tree is shared with its
//! source, so snapshots taken at one boot stage never alias later ones.

use crate::error::{Error, Result};
use indexmap::IndexMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// A mapping from scalar keys to values. Equality ignores key order.
pub type Mapping = IndexMap<ConfigKey, ConfigValue>;

/// Scalar key of a [`Mapping`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ConfigKey {
    Bool(bool),
    Int(i64),
    String(String),
}

/// A node of the configuration tree.
///
/// Equality is reflexive: `.nan` equals `.nan`, so merging a tree with
/// itself behaves like any other value.
#[derive(Debug, Clone, Default)]
pub enum ConfigValue {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Sequence(Vec<ConfigValue>),
    Mapping(Mapping),
}

impl PartialEq for ConfigValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (ConfigValue::Null, ConfigValue::Null) => true,
            (ConfigValue::Bool(a), ConfigValue::Bool(b)) => a == b,
            (ConfigValue::Int(a), ConfigValue::Int(b)) => a == b,
            (ConfigValue::Float(a), ConfigValue::Float(b)) => a == b || (a.is_nan() && b.is_nan()),
            (ConfigValue::String(a), ConfigValue::String(b)) => a == b,
            (ConfigValue::Sequence(a), ConfigValue::Sequence(b)) => a == b,
            (ConfigValue::Mapping(a), ConfigValue::Mapping(b)) => a == b,
            _ => false,
        }
    }
}

impl ConfigValue {
    /// Parse a YAML document. An empty document is `Null`.
    pub fn from_yaml(text: &str) -> Result<Self> {
        if text.trim().is_empty() {
            return Ok(ConfigValue::Null);
        }
        Ok(serde_yaml::from_str(text)?)
    }

    /// Render as a YAML document.
    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Look up a string key in a mapping value.
    pub fn get(&self, key: &str) -> Option<&ConfigValue> {
        self.as_mapping()
            .and_then(|m| m.get(&ConfigKey::String(key.to_string())))
    }

    /// Look up a dotted path such as `system.state.dev`.
    pub fn get_path(&self, path: &str) -> Option<&ConfigValue> {
        path.split('.')
            .filter(|part| !part.is_empty())
            .try_fold(self, |node, part| node.get(part))
    }

    pub fn as_mapping(&self) -> Option<&Mapping> {
        match self {
            ConfigValue::Mapping(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ConfigValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_mapping(&self) -> bool {
        matches!(self, ConfigValue::Mapping(_))
    }

    /// Consume into a mapping; `Null` becomes an empty mapping.
    pub fn into_mapping(self) -> Result<Mapping> {
        match self {
            ConfigValue::Mapping(m) => Ok(m),
            ConfigValue::Null => Ok(Mapping::new()),
            other => Err(Error::Config(format!(
                "expected a mapping, found {}",
                other.kind()
            ))),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            ConfigValue::Null => "null",
            ConfigValue::Bool(_) => "bool",
            ConfigValue::Int(_) => "integer",
            ConfigValue::Float(_) => "float",
            ConfigValue::String(_) => "string",
            ConfigValue::Sequence(_) => "sequence",
            ConfigValue::Mapping(_) => "mapping",
        }
    }
}

/// Parse a YAML document that must be a mapping.
pub fn mapping_from_yaml(text: &str) -> Result<Mapping> {
    ConfigValue::from_yaml(text)?.into_mapping()
}

/// Convert between two serializable shapes by marshalling through YAML.
///
/// This is how typed configuration structs are turned into a
/// [`ConfigValue`] tree and back.
pub fn convert<T, U>(from: &T) -> Result<U>
where
    T: Serialize + ?Sized,
    U: DeserializeOwned,
{
    let value = serde_yaml::to_value(from).map_err(|e| {
        tracing::warn!(error = %e, "Error serializing to YAML");
        e
    })?;
    Ok(serde_yaml::from_value(value)?)
}

impl fmt::Display for ConfigKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigKey::Bool(b) => write!(f, "{}", b),
            ConfigKey::Int(i) => write!(f, "{}", i),
            ConfigKey::String(s) => write!(f, "{}", s),
        }
    }
}

impl From<&str> for ConfigKey {
    fn from(s: &str) -> Self {
        ConfigKey::String(s.to_string())
    }
}

impl From<String> for ConfigKey {
    fn from(s: String) -> Self {
        ConfigKey::String(s)
    }
}

impl From<&str> for ConfigValue {
    fn from(s: &str) -> Self {
        ConfigValue::String(s.to_string())
    }
}

impl From<String> for ConfigValue {
    fn from(s: String) -> Self {
        ConfigValue::String(s)
    }
}

impl From<bool> for ConfigValue {
    fn from(b: bool) -> Self {
        ConfigValue::Bool(b)
    }
}

impl From<i64> for ConfigValue {
    fn from(i: i64) -> Self {
        ConfigValue::Int(i)
    }
}

impl From<f64> for ConfigValue {
    fn from(f: f64) -> Self {
        ConfigValue::Float(f)
    }
}

impl From<Vec<ConfigValue>> for ConfigValue {
    fn from(seq: Vec<ConfigValue>) -> Self {
        ConfigValue::Sequence(seq)
    }
}

impl From<Mapping> for ConfigValue {
    fn from(m: Mapping) -> Self {
        ConfigValue::Mapping(m)
    }
}

impl From<serde_yaml::Value> for ConfigValue {
    fn from(value: serde_yaml::Value) -> Self {
        use serde_yaml::Value;

        match value {
            Value::Null => ConfigValue::Null,
            Value::Bool(b) => ConfigValue::Bool(b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => ConfigValue::Int(i),
                None => ConfigValue::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            Value::String(s) => ConfigValue::String(s),
            Value::Sequence(seq) => {
                ConfigValue::Sequence(seq.into_iter().map(ConfigValue::from).collect())
            }
            Value::Mapping(map) => ConfigValue::Mapping(
                map.into_iter()
                    .map(|(k, v)| (ConfigKey::from(k), ConfigValue::from(v)))
                    .collect(),
            ),
            Value::Tagged(tagged) => ConfigValue::from(tagged.value),
        }
    }
}

impl From<serde_yaml::Value> for ConfigKey {
    fn from(value: serde_yaml::Value) -> Self {
        use serde_yaml::Value;

        match value {
            Value::Bool(b) => ConfigKey::Bool(b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => ConfigKey::Int(i),
                None => ConfigKey::String(n.to_string()),
            },
            Value::String(s) => ConfigKey::String(s),
            Value::Tagged(tagged) => ConfigKey::from(tagged.value),
            other => ConfigKey::String(
                serde_yaml::to_string(&other)
                    .map(|s| s.trim_end().to_string())
                    .unwrap_or_default(),
            ),
        }
    }
}

impl Serialize for ConfigKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            ConfigKey::Bool(b) => serializer.serialize_bool(*b),
            ConfigKey::Int(i) => serializer.serialize_i64(*i),
            ConfigKey::String(s) => serializer.serialize_str(s),
        }
    }
}

impl Serialize for ConfigValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            ConfigValue::Null => serializer.serialize_unit(),
            ConfigValue::Bool(b) => serializer.serialize_bool(*b),
            ConfigValue::Int(i) => serializer.serialize_i64(*i),
            ConfigValue::Float(f) => serializer.serialize_f64(*f),
            ConfigValue::String(s) => serializer.serialize_str(s),
            ConfigValue::Sequence(seq) => serializer.collect_seq(seq),
            ConfigValue::Mapping(m) => serializer.collect_map(m),
        }
    }
}

impl<'de> Deserialize<'de> for ConfigValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        serde_yaml::Value::deserialize(deserializer).map(ConfigValue::from)
    }
}

impl<'de> Deserialize<'de> for ConfigKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        serde_yaml::Value::deserialize(deserializer).map(ConfigKey::from)
    }
}
