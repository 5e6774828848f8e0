//! BuckOS bootstrap binary.
//!
//! Runs the boot-time bootstrap, either as PID 1 or under an init system,
//! and exposes the config and transfer tooling it is built on.

use anyhow::Context;
use buckos_bootstrap::{
    copy_dir, load_config, merge, reaper, value, Bootstrap, CloudConfig, ConfigValue,
    ResourceLoader,
};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "bootstrap",
    about = "BuckOS boot-time bootstrap",
    version,
    author
)]
struct Cli {
    /// Config fragment locations (path, URL or bare name), merged in order
    #[arg(
        short = 'c',
        long = "config",
        env = "BOOTSTRAP_CONFIG",
        value_delimiter = ',',
        global = true
    )]
    config: Vec<String>,

    /// Mirrors consulted for bare resource names
    #[arg(
        long = "mirror",
        env = "BOOTSTRAP_MIRRORS",
        value_delimiter = ',',
        global = true
    )]
    mirrors: Vec<String>,

    /// Allow network fetches
    #[arg(long, env = "BOOTSTRAP_NETWORK", global = true)]
    network: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the bootstrap
    Run,

    /// List services offered by the mirrors
    Services,

    /// Copy a directory tree, preserving links and modes
    CopyDir {
        /// Source directory
        src: PathBuf,
        /// Destination directory (created if missing)
        dest: PathBuf,
    },

    /// Print the settings of LEFT that differ from RIGHT
    Diff {
        /// Left YAML document
        left: PathBuf,
        /// Right YAML document
        right: PathBuf,
    },

    /// Print the merged configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Run) | None => {
            run_bootstrap(&cli).await?;
        }

        Some(Commands::Services) => {
            let loader = ResourceLoader::new()?;
            let services = loader.services(&cli.mirrors).await;
            if services.is_empty() {
                println!("No services found");
            } else {
                for name in services {
                    println!("{}", name);
                }
            }
        }

        Some(Commands::CopyDir { ref src, ref dest }) => {
            copy_dir(src, dest)
                .await
                .with_context(|| format!("copying {} to {}", src.display(), dest.display()))?;
        }

        Some(Commands::Diff {
            ref left,
            ref right,
        }) => {
            let left = read_yaml(left)?;
            let right = read_yaml(right)?;
            let diff = ConfigValue::Mapping(merge::difference(&left, &right));
            print!("{}", diff.to_yaml()?);
        }

        Some(Commands::Config) => {
            let loader = ResourceLoader::new()?;
            let cfg = load_config(&loader, &cli.config, cli.network, &cli.mirrors).await?;
            print!("{}", cfg.to_yaml()?);
        }
    }

    Ok(())
}

async fn run_bootstrap(cli: &Cli) -> anyhow::Result<()> {
    let _reaper = reaper::spawn_reaper()?;

    let loader = ResourceLoader::new()?;
    let cfg = if cli.config.is_empty() {
        warn!("No config fragments given, using defaults");
        CloudConfig::default()
    } else {
        load_config(&loader, &cli.config, cli.network, &cli.mirrors)
            .await
            .context("loading bootstrap config")?
    };

    let bootstrap = Bootstrap::for_engine(&cfg.system.bootstrap_engine);
    let (_cfg, report) = bootstrap.run(cfg).await?;

    for step in &report.steps {
        info!(step = %step.name, duration_ms = step.duration.as_millis() as u64, "Step timing");
    }
    Ok(())
}

fn read_yaml(path: &Path) -> anyhow::Result<value::Mapping> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    Ok(value::mapping_from_yaml(&text)?)
}
