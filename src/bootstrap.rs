//! Top-level bootstrap routine.
//!
//! Assembles the configuration from its fragments, starts the bootstrap
//! engine, runs the pipeline against it, copies configured trees out of the
//! engine's filesystem and stops the engine again, on success or failure.

use crate::config::{merge_fragments, CloudConfig, EngineConfig, TransferSpec};
use crate::device::{DeviceResolver, SystemDevices};
use crate::error::{Error, Result};
use crate::pipeline::{Pipeline, PipelineReport};
use crate::resource::ResourceLoader;
use crate::services::{EngineClient, ServiceRunner};
use crate::supervisor::EngineSupervisor;
use crate::transfer::copy_dir;
use crate::value::{mapping_from_yaml, Mapping};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Load every location and merge the fragments in order.
///
/// Any fragment that cannot be loaded or decoded fails the whole load.
pub async fn load_config(
    loader: &ResourceLoader,
    locations: &[String],
    network: bool,
    mirrors: &[String],
) -> Result<CloudConfig> {
    let mut fragments: Vec<Mapping> = Vec::with_capacity(locations.len());

    for location in locations {
        let bytes = loader.load(location, network, mirrors).await?;
        let text = String::from_utf8_lossy(&bytes);
        debug!(location = %location, bytes = bytes.len(), "Loaded config fragment");
        fragments.push(mapping_from_yaml(&text)?);
    }

    merge_fragments(&fragments)
}

/// The bootstrap with its external collaborators.
pub struct Bootstrap {
    runner: Arc<dyn ServiceRunner>,
    devices: Arc<dyn DeviceResolver>,
}

impl Bootstrap {
    pub fn new(runner: Arc<dyn ServiceRunner>, devices: Arc<dyn DeviceResolver>) -> Self {
        Self { runner, devices }
    }

    /// Drive the configured engine's client and resolve against `/dev`.
    pub fn for_engine(engine: &EngineConfig) -> Self {
        Self::new(
            Arc::new(EngineClient::from_config(engine)),
            Arc::new(SystemDevices::default()),
        )
    }

    /// Run the whole bootstrap and return the config later boot stages see.
    pub async fn run(&self, cfg: CloudConfig) -> Result<(CloudConfig, PipelineReport)> {
        info!("Launching Bootstrap Engine");

        let engine = cfg.system.bootstrap_engine.clone();
        let pipeline = Pipeline::bootstrap(Arc::clone(&self.runner), Arc::clone(&self.devices));

        let (cfg, report) = EngineSupervisor::scoped(&engine, async {
            let (cfg, report) = pipeline.run(cfg).await?;
            extract(&engine.home, &cfg.system.transfers).await?;
            Ok::<_, Error>((cfg, report))
        })
        .await?;

        info!(
            steps = report.steps.len(),
            total_ms = report.total.as_millis() as u64,
            "Bootstrap complete"
        );
        Ok((cfg, report))
    }
}

/// Where a transfer's source lives. Relative sources are inside the engine
/// home.
pub fn transfer_source(home: &Path, spec: &TransferSpec) -> PathBuf {
    if spec.source.is_absolute() {
        spec.source.clone()
    } else {
        home.join(&spec.source)
    }
}

async fn extract(home: &Path, transfers: &[TransferSpec]) -> Result<()> {
    for spec in transfers {
        let source = transfer_source(home, spec);
        info!(src = %source.display(), dest = %spec.dest.display(), "Extracting from bootstrap engine");
        copy_dir(&source, &spec.dest).await?;
    }
    Ok(())
}
