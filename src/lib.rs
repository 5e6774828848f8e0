//! BuckOS boot-time bootstrap.
//!
//! Runs early in boot, before the normal service runtime exists. It
//! assembles the boot configuration from YAML fragments, starts a private
//! container engine, and uses it to prepare the system:
//!
//! - Loading every image the bootstrap needs
//! - Running the one-shot `bootstrap` services
//! - Formatting the state device when it does not exist yet
//!
//! The engine is stopped and its home directory removed before the
//! bootstrap returns, whether or not it succeeded.
//!
//! # Architecture
//!
//! - **value / merge**: Generic config tree and its set algebra
//! - **config**: Typed [`CloudConfig`] over the generic tree
//! - **resource**: Fetching fragments from paths, URLs and mirrors
//! - **pipeline**: The ordered bootstrap transforms
//! - **supervisor**: Lifecycle of the bootstrap engine process
//! - **transfer**: Streaming directory copies across filesystems
//! - **reaper**: Zombie reaping when running as PID 1
//!
//! # Example
//!
//! ```no_run
//! use buckos_bootstrap::{load_config, Bootstrap, ResourceLoader};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let loader = ResourceLoader::new()?;
//!     let cfg = load_config(&loader, &["/etc/buckos/boot.yml".to_string()], false, &[]).await?;
//!     let bootstrap = Bootstrap::for_engine(&cfg.system.bootstrap_engine);
//!     let (cfg, _report) = bootstrap.run(cfg).await?;
//!     println!("{}", cfg.to_yaml()?);
//!     Ok(())
//! }
//! ```

pub mod bootstrap;
pub mod config;
pub mod device;
pub mod error;
pub mod merge;
pub mod pipeline;
pub mod reaper;
pub mod resource;
pub mod services;
pub mod supervisor;
pub mod transfer;
pub mod value;

// Re-export main types
pub use bootstrap::{load_config, Bootstrap};
pub use config::{
    merge_fragments, CloudConfig, EngineConfig, ServiceSet, ServiceSpec, SystemConfig,
    TransferSpec,
};
pub use device::{DeviceResolver, SystemDevices};
pub use error::{Error, Result};
pub use pipeline::{
    Autoformat, ConfigTransform, LoadImages, Pipeline, PipelineReport, RunBootstrapContainers,
};
pub use reaper::{reap_zombies, spawn_reaper};
pub use resource::{ResourceLoader, ResourceLocation};
pub use services::{EngineClient, ServiceRunner};
pub use supervisor::{EngineHandle, EngineSupervisor};
pub use transfer::copy_dir;
pub use value::{ConfigKey, ConfigValue, Mapping};
