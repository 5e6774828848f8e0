//! Bootstrap orchestration.
//!
//! The bootstrap is an ordered list of configuration transforms:
//!
//! ```text
//! LoadImages ──→ RunBootstrapContainers ──→ Autoformat
//! ```
//!
//! Each step takes ownership of the [`CloudConfig`] produced by the previous
//! one and returns the config for the next. A step that changes the config
//! does so on its own copy, so a failing step never leaks a half-applied
//! change. The first failure stops the pipeline and is returned unchanged.

use crate::config::{CloudConfig, AUTOFORMAT_SET, BOOTSTRAP_SET};
use crate::device::DeviceResolver;
use crate::error::Result;
use crate::services::ServiceRunner;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Environment variable listing filesystems eligible for autoformat.
pub const AUTOFORMAT_ENV: &str = "AUTOFORMAT";

/// Environment variable carrying the zero-fill flag.
pub const FORMATZERO_ENV: &str = "FORMATZERO";

/// A single configuration transform.
#[async_trait]
pub trait ConfigTransform: Send + Sync {
    /// Human-readable step name for logging.
    fn name(&self) -> &str;

    /// Consume the config and return the one later steps should see.
    async fn apply(&self, cfg: CloudConfig) -> Result<CloudConfig>;
}

pub type BoxedTransform = Box<dyn ConfigTransform>;

/// Timing of a completed step.
#[derive(Debug, Clone)]
pub struct StepReport {
    pub name: String,
    pub duration: Duration,
}

/// Timing of a completed pipeline.
#[derive(Debug, Clone, Default)]
pub struct PipelineReport {
    pub steps: Vec<StepReport>,
    pub total: Duration,
}

impl PipelineReport {
    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.name.as_str()).collect()
    }
}

/// Ordered list of transforms, run strictly in sequence.
pub struct Pipeline {
    steps: Vec<BoxedTransform>,
}

impl Pipeline {
    pub fn new(steps: Vec<BoxedTransform>) -> Self {
        Self { steps }
    }

    /// The fixed bootstrap plan.
    pub fn bootstrap(runner: Arc<dyn ServiceRunner>, devices: Arc<dyn DeviceResolver>) -> Self {
        Self::new(vec![
            Box::new(LoadImages::new(Arc::clone(&runner))),
            Box::new(RunBootstrapContainers::new(Arc::clone(&runner))),
            Box::new(Autoformat::new(runner, devices)),
        ])
    }

    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.name()).collect()
    }

    /// Run every step in order, stopping at the first error.
    pub async fn run(&self, cfg: CloudConfig) -> Result<(CloudConfig, PipelineReport)> {
        let total_start = Instant::now();
        let mut report = PipelineReport::default();
        let mut cfg = cfg;

        for step in &self.steps {
            let start = Instant::now();
            debug!(step = step.name(), "Starting bootstrap step");

            cfg = step.apply(cfg).await.map_err(|e| {
                warn!(step = step.name(), error = %e, "Bootstrap step failed");
                e
            })?;

            let duration = start.elapsed();
            info!(
                step = step.name(),
                duration_ms = duration.as_millis() as u64,
                "Bootstrap step complete"
            );
            report.steps.push(StepReport {
                name: step.name().to_string(),
                duration,
            });
        }

        report.total = total_start.elapsed();
        Ok((cfg, report))
    }
}

/// Makes sure every image later steps need is present in the engine.
pub struct LoadImages {
    runner: Arc<dyn ServiceRunner>,
}

impl LoadImages {
    pub fn new(runner: Arc<dyn ServiceRunner>) -> Self {
        Self { runner }
    }
}

/// Image archives (`*.tar`) in `dir`, sorted by name. A missing directory
/// has no archives.
pub fn preload_archives(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }

    let mut archives = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == "tar") {
            archives.push(path);
        }
    }
    archives.sort();
    Ok(archives)
}

#[async_trait]
impl ConfigTransform for LoadImages {
    fn name(&self) -> &str {
        "load_images"
    }

    async fn apply(&self, cfg: CloudConfig) -> Result<CloudConfig> {
        for archive in preload_archives(&cfg.system.images.preload_dir)? {
            self.runner.load_archive(&archive).await?;
        }

        let images = cfg.referenced_images();
        if !images.is_empty() {
            self.runner
                .ensure_images(&images, cfg.system.images.pull)
                .await?;
        }

        Ok(cfg)
    }
}

/// Runs the `bootstrap` service set.
pub struct RunBootstrapContainers {
    runner: Arc<dyn ServiceRunner>,
}

impl RunBootstrapContainers {
    pub fn new(runner: Arc<dyn ServiceRunner>) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl ConfigTransform for RunBootstrapContainers {
    fn name(&self) -> &str {
        "run_bootstrap_containers"
    }

    async fn apply(&self, cfg: CloudConfig) -> Result<CloudConfig> {
        info!("Running Bootstrap services");
        self.runner
            .run_service_set(BOOTSTRAP_SET, &cfg, &cfg.system.bootstrap_containers)
            .await?;
        Ok(cfg)
    }
}

/// Formats the state device when it does not exist yet.
pub struct Autoformat {
    runner: Arc<dyn ServiceRunner>,
    devices: Arc<dyn DeviceResolver>,
}

impl Autoformat {
    pub fn new(runner: Arc<dyn ServiceRunner>, devices: Arc<dyn DeviceResolver>) -> Self {
        Self { runner, devices }
    }

    /// Whether formatting is needed for this config.
    pub fn needed(&self, cfg: &CloudConfig) -> bool {
        let state = &cfg.system.state;
        if state.autoformat.is_empty() {
            return false;
        }
        match self.devices.resolve(&state.dev) {
            Some(device) => {
                debug!(device = %device.display(), "State device present, skipping autoformat");
                false
            }
            None => true,
        }
    }
}

/// Copy of `cfg` with the autoformat environment injected into every
/// autoformat service.
pub fn with_autoformat_env(cfg: &CloudConfig) -> CloudConfig {
    let mut cfg = cfg.clone();
    let filesystems = cfg.system.state.autoformat.join(" ");
    let format_zero = cfg.system.state.format_zero.to_string();

    for service in cfg.system.autoformat.values_mut() {
        service.set_env(AUTOFORMAT_ENV, &filesystems);
        service.set_env(FORMATZERO_ENV, &format_zero);
    }
    cfg
}

#[async_trait]
impl ConfigTransform for Autoformat {
    fn name(&self) -> &str {
        "autoformat"
    }

    async fn apply(&self, cfg: CloudConfig) -> Result<CloudConfig> {
        if !self.needed(&cfg) {
            return Ok(cfg);
        }

        let cfg = with_autoformat_env(&cfg);
        info!(
            dev = %cfg.system.state.dev,
            filesystems = ?cfg.system.state.autoformat,
            "Running Autoformat services"
        );
        self.runner
            .run_service_set(AUTOFORMAT_SET, &cfg, &cfg.system.autoformat)
            .await?;
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceSpec;

    #[test]
    fn test_bootstrap_plan_order() {
        struct Noop;

        #[async_trait]
        impl ServiceRunner for Noop {
            async fn run_service_set(
                &self,
                _name: &str,
                _cfg: &CloudConfig,
                _services: &crate::config::ServiceSet,
            ) -> Result<()> {
                Ok(())
            }
            async fn load_archive(&self, _archive: &Path) -> Result<()> {
                Ok(())
            }
            async fn ensure_images(&self, _images: &[String], _pull: bool) -> Result<()> {
                Ok(())
            }
        }

        let resolver = |_: &str| -> Option<PathBuf> { None };
        let pipeline = Pipeline::bootstrap(Arc::new(Noop), Arc::new(resolver));
        assert_eq!(
            pipeline.step_names(),
            vec!["load_images", "run_bootstrap_containers", "autoformat"]
        );
    }

    #[test]
    fn test_autoformat_env_injection() {
        let mut cfg = CloudConfig::default();
        cfg.system.state.autoformat = vec!["ext4".to_string(), "xfs".to_string()];
        cfg.system.state.format_zero = true;
        cfg.system.autoformat.insert(
            "autoformat".to_string(),
            ServiceSpec {
                environment: vec!["AUTOFORMAT=stale".to_string(), "DEBUG=1".to_string()],
                ..Default::default()
            },
        );

        let updated = with_autoformat_env(&cfg);
        let service = &updated.system.autoformat["autoformat"];
        assert_eq!(service.env(AUTOFORMAT_ENV), Some("ext4 xfs"));
        assert_eq!(service.env(FORMATZERO_ENV), Some("true"));
        assert_eq!(service.env("DEBUG"), Some("1"));

        // Source config is untouched.
        assert_eq!(cfg.system.autoformat["autoformat"].env(AUTOFORMAT_ENV), Some("stale"));
    }

    #[test]
    fn test_preload_archives() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.tar"), b"").unwrap();
        std::fs::write(dir.path().join("a.tar"), b"").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"").unwrap();

        let archives = preload_archives(dir.path()).unwrap();
        assert_eq!(
            archives,
            vec![dir.path().join("a.tar"), dir.path().join("b.tar")]
        );
        assert!(preload_archives(&dir.path().join("missing")).unwrap().is_empty());
    }
}
