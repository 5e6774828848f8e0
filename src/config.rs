//! Cloud-config aggregate.
//!
//! The [`CloudConfig`] is decoded from YAML fragments and threaded through
//! the bootstrap pipeline. Only the settings the bootstrap inspects are
//! typed; every other top-level section is kept in [`CloudConfig::extra`]
//! so merging fragments never drops data.

use crate::error::Result;
use crate::merge;
use crate::value::{self, ConfigValue, Mapping};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default bootstrap engine daemon binary.
pub const DEFAULT_ENGINE_BIN: &str = "/usr/bin/dockerd";

/// Default client binary used to drive the bootstrap engine.
pub const DEFAULT_ENGINE_CLIENT: &str = "docker";

/// Private state directory of the bootstrap engine.
pub const DEFAULT_ENGINE_HOME: &str = "/var/lib/system-docker";

/// Control socket of the bootstrap engine.
pub const DEFAULT_ENGINE_SOCKET: &str = "/var/run/system-docker.sock";

/// Directory holding image archives to preload.
pub const DEFAULT_PRELOAD_DIR: &str = "/var/lib/buckos/preload";

/// Grace period between SIGTERM and SIGKILL when stopping the engine.
pub const DEFAULT_STOP_TIMEOUT_SECS: u64 = 30;

/// Name of the bootstrap service set.
pub const BOOTSTRAP_SET: &str = "bootstrap";

/// Name of the autoformat service set.
pub const AUTOFORMAT_SET: &str = "autoformat";

/// An ordered, named collection of services.
pub type ServiceSet = IndexMap<String, ServiceSpec>;

/// Top-level boot configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudConfig {
    /// Settings consumed by the bootstrap
    pub system: SystemConfig,
    /// All other top-level sections
    #[serde(flatten)]
    pub extra: Mapping,
}

/// Bootstrap-relevant system settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    /// Persistent state device settings
    pub state: StateConfig,
    /// Services that format the state device
    pub autoformat: ServiceSet,
    /// Services run once against the bootstrap engine
    pub bootstrap_containers: ServiceSet,
    /// How to launch the bootstrap engine
    pub bootstrap_engine: EngineConfig,
    /// Image preloading
    pub images: ImageConfig,
    /// Trees copied out of the engine's filesystem before it is removed
    pub transfers: Vec<TransferSpec>,
}

/// A directory tree to move out of the bootstrap engine's filesystem.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferSpec {
    pub source: PathBuf,
    pub dest: PathBuf,
}

/// Persistent state device settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    /// Device path or `LABEL=`/`UUID=` spec
    pub dev: String,
    /// Filesystem types eligible for autoformat
    pub autoformat: Vec<String>,
    /// Zero the whole device when formatting
    pub format_zero: bool,
}

/// Launch settings for the ephemeral engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Engine daemon binary
    pub binary: PathBuf,
    /// Engine daemon arguments
    pub args: Vec<String>,
    /// Environment as `KEY=VALUE`
    pub environment: Vec<String>,
    /// Private state directory, removed on stop
    pub home: PathBuf,
    /// Client binary used to run services against the engine
    pub client: PathBuf,
    /// Engine control socket
    pub socket: PathBuf,
    /// Seconds to wait after SIGTERM before SIGKILL; `None` waits forever
    pub stop_timeout_secs: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from(DEFAULT_ENGINE_BIN),
            args: vec![
                "--host".to_string(),
                format!("unix://{}", DEFAULT_ENGINE_SOCKET),
                "--data-root".to_string(),
                DEFAULT_ENGINE_HOME.to_string(),
                "--bridge".to_string(),
                "none".to_string(),
                "--iptables=false".to_string(),
            ],
            environment: Vec::new(),
            home: PathBuf::from(DEFAULT_ENGINE_HOME),
            client: PathBuf::from(DEFAULT_ENGINE_CLIENT),
            socket: PathBuf::from(DEFAULT_ENGINE_SOCKET),
            stop_timeout_secs: Some(DEFAULT_STOP_TIMEOUT_SECS),
        }
    }
}

impl EngineConfig {
    pub fn stop_timeout(&self) -> Option<Duration> {
        self.stop_timeout_secs.map(Duration::from_secs)
    }
}

/// Image preloading settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageConfig {
    /// Directory of image archives loaded before anything runs
    pub preload_dir: PathBuf,
    /// Pull images that are still missing after preloading
    pub pull: bool,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            preload_dir: PathBuf::from(DEFAULT_PRELOAD_DIR),
            pull: true,
        }
    }
}

/// A single container service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceSpec {
    /// Image reference
    pub image: String,
    /// Command and arguments
    pub command: Vec<String>,
    /// Environment as `KEY=VALUE`
    pub environment: Vec<String>,
    /// Volumes as `host:container[:mode]`
    pub volumes: Vec<String>,
    /// Run privileged
    pub privileged: bool,
    /// Network mode
    pub net: Option<String>,
}

impl ServiceSpec {
    /// Set an environment variable, replacing any previous value.
    pub fn set_env(&mut self, key: &str, value: &str) {
        let prefix = format!("{}=", key);
        self.environment
            .retain(|kv| !kv.starts_with(&prefix) && kv != key);
        self.environment.push(format!("{}{}", prefix, value));
    }

    /// Get an environment variable.
    pub fn env(&self, key: &str) -> Option<&str> {
        self.environment.iter().find_map(|kv| {
            let (k, v) = kv.split_once('=')?;
            (k == key).then_some(v)
        })
    }
}

impl CloudConfig {
    /// Parse a YAML fragment. An empty fragment yields the defaults.
    pub fn from_yaml(text: &str) -> Result<Self> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(text)?)
    }

    /// Load a YAML fragment from disk.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml(&text)
    }

    /// Render as YAML.
    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// The configuration as a generic mapping.
    pub fn to_mapping(&self) -> Result<Mapping> {
        value::convert::<_, ConfigValue>(self)?.into_mapping()
    }

    /// Build a configuration from a generic mapping.
    pub fn from_mapping(mapping: &Mapping) -> Result<Self> {
        value::convert(mapping)
    }

    /// Apply an overlay fragment on top of this configuration.
    pub fn merge(&self, overlay: &Mapping) -> Result<Self> {
        let merged = merge::union(&self.to_mapping()?, overlay);
        Self::from_mapping(&merged)
    }

    /// Settings of this configuration that differ from `base`.
    pub fn diff(&self, base: &CloudConfig) -> Result<Mapping> {
        Ok(merge::difference(&self.to_mapping()?, &base.to_mapping()?))
    }

    /// Images referenced by the bootstrap and autoformat service sets.
    pub fn referenced_images(&self) -> Vec<String> {
        let mut images: Vec<String> = Vec::new();
        for service in self
            .system
            .bootstrap_containers
            .values()
            .chain(self.system.autoformat.values())
        {
            if !service.image.is_empty() && !images.contains(&service.image) {
                images.push(service.image.clone());
            }
        }
        images
    }
}

/// Merge fragments left to right; later fragments win.
pub fn merge_fragments(fragments: &[Mapping]) -> Result<CloudConfig> {
    let merged = fragments
        .iter()
        .fold(CloudConfig::default().to_mapping()?, |acc, fragment| {
            merge::union(&acc, fragment)
        });
    CloudConfig::from_mapping(&merged)
}
