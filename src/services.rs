//! Service execution against the bootstrap engine.
//!
//! The pipeline only needs "run this named set of services" and "make sure
//! these images are present"; [`ServiceRunner`] is that seam.
//! [`EngineClient`] implements it by driving the engine's CLI client over
//! the bootstrap engine's control socket.

use crate::config::{CloudConfig, EngineConfig, ServiceSet, ServiceSpec};
use crate::error::{Error, Result};
use crate::reaper;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use tokio::process::Command;
use tracing::{debug, info};

/// External collaborator that runs services and manages images.
#[async_trait]
pub trait ServiceRunner: Send + Sync {
    /// Run every service of `services` to completion, in order.
    async fn run_service_set(
        &self,
        name: &str,
        cfg: &CloudConfig,
        services: &ServiceSet,
    ) -> Result<()>;

    /// Import an image archive into the engine.
    async fn load_archive(&self, archive: &Path) -> Result<()>;

    /// Make sure every image is available locally, pulling when allowed.
    async fn ensure_images(&self, images: &[String], pull: bool) -> Result<()>;
}

/// Drives the bootstrap engine through its CLI client.
#[derive(Debug, Clone)]
pub struct EngineClient {
    /// Client binary
    client: PathBuf,
    /// Engine control socket
    socket: PathBuf,
}

impl EngineClient {
    pub fn new(client: impl Into<PathBuf>, socket: impl Into<PathBuf>) -> Self {
        Self {
            client: client.into(),
            socket: socket.into(),
        }
    }

    pub fn from_config(engine: &EngineConfig) -> Self {
        Self::new(&engine.client, &engine.socket)
    }

    /// Arguments for running a single service.
    pub fn run_args(name: &str, service: &ServiceSpec) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "--rm".to_string(),
            "--name".to_string(),
            name.to_string(),
        ];

        if service.privileged {
            args.push("--privileged".to_string());
        }
        if let Some(ref net) = service.net {
            args.push("--net".to_string());
            args.push(net.clone());
        }
        for env in &service.environment {
            args.push("-e".to_string());
            args.push(env.clone());
        }
        for volume in &service.volumes {
            args.push("-v".to_string());
            args.push(volume.clone());
        }

        args.push(service.image.clone());
        args.extend(service.command.iter().cloned());
        args
    }

    async fn exec(&self, args: &[String]) -> Result<Output> {
        debug!(client = %self.client.display(), args = ?args, "Invoking engine client");

        let mut cmd = Command::new(&self.client);
        cmd.arg("--host")
            .arg(format!("unix://{}", self.socket.display()))
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        // Owned so the PID 1 reaper leaves the exit status to us.
        let (child, _owned) = reaper::spawn_owned(&mut cmd)?;
        Ok(child.wait_with_output().await?)
    }

    async fn has_image(&self, image: &str) -> Result<bool> {
        let output = self
            .exec(&["image".to_string(), "inspect".to_string(), image.to_string()])
            .await?;
        Ok(output.status.success())
    }
}

fn failure_reason(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let stderr = stderr.trim();
    if stderr.is_empty() {
        output.status.to_string()
    } else {
        stderr.to_string()
    }
}

#[async_trait]
impl ServiceRunner for EngineClient {
    async fn run_service_set(
        &self,
        name: &str,
        _cfg: &CloudConfig,
        services: &ServiceSet,
    ) -> Result<()> {
        for (service_name, service) in services {
            info!(set = %name, service = %service_name, image = %service.image, "Running service");

            let output = self.exec(&Self::run_args(service_name, service)).await?;
            if !output.status.success() {
                return Err(Error::ServiceFailed {
                    set: name.to_string(),
                    service: service_name.clone(),
                    reason: failure_reason(&output),
                });
            }
        }
        Ok(())
    }

    async fn load_archive(&self, archive: &Path) -> Result<()> {
        info!(archive = %archive.display(), "Loading image archive");

        let output = self
            .exec(&[
                "load".to_string(),
                "-i".to_string(),
                archive.display().to_string(),
            ])
            .await?;
        if !output.status.success() {
            return Err(Error::ServiceFailed {
                set: "images".to_string(),
                service: archive.display().to_string(),
                reason: failure_reason(&output),
            });
        }
        Ok(())
    }

    async fn ensure_images(&self, images: &[String], pull: bool) -> Result<()> {
        for image in images {
            if self.has_image(image).await? {
                debug!(image = %image, "Image already present");
                continue;
            }
            if !pull {
                return Err(Error::NotFound(image.clone()));
            }

            info!(image = %image, "Pulling image");
            let output = self.exec(&["pull".to_string(), image.clone()]).await?;
            if !output.status.success() {
                return Err(Error::ServiceFailed {
                    set: "images".to_string(),
                    service: image.clone(),
                    reason: failure_reason(&output),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_run_args() {
        let service = ServiceSpec {
            image: "buckos/autoformat:v1".to_string(),
            command: vec!["format".to_string(), "--all".to_string()],
            environment: vec!["AUTOFORMAT=ext4".to_string()],
            volumes: vec!["/dev:/host/dev".to_string()],
            privileged: true,
            net: Some("none".to_string()),
        };

        assert_eq!(
            EngineClient::run_args("autoformat", &service),
            vec![
                "run",
                "--rm",
                "--name",
                "autoformat",
                "--privileged",
                "--net",
                "none",
                "-e",
                "AUTOFORMAT=ext4",
                "-v",
                "/dev:/host/dev",
                "buckos/autoformat:v1",
                "format",
                "--all",
            ]
        );
    }

    #[tokio::test]
    async fn test_failing_client_reports_service() {
        // `false` ignores its arguments and exits 1.
        let client = EngineClient::new("false", "/nonexistent.sock");
        let mut services = ServiceSet::new();
        services.insert(
            "udev".to_string(),
            ServiceSpec {
                image: "buckos/udev".to_string(),
                ..Default::default()
            },
        );

        let err = client
            .run_service_set("bootstrap", &CloudConfig::default(), &services)
            .await
            .unwrap_err();
        match err {
            Error::ServiceFailed { set, service, .. } => {
                assert_eq!(set, "bootstrap");
                assert_eq!(service, "udev");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_succeeding_client_runs_all() {
        let client = EngineClient::new("true", "/nonexistent.sock");
        let mut services = ServiceSet::new();
        services.insert("a".to_string(), ServiceSpec::default());
        services.insert("b".to_string(), ServiceSpec::default());

        client
            .run_service_set("bootstrap", &CloudConfig::default(), &services)
            .await
            .unwrap();
        client.ensure_images(&["img".to_string()], false).await.unwrap();
    }
}
