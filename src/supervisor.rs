//! Bootstrap engine supervision.
//!
//! The bootstrap engine is started once, used by the pipeline, and stopped
//! once. An [`EngineHandle`] is the running engine: [`EngineHandle::stop`]
//! consumes it, so a handle cannot be stopped twice. A watcher task owns
//! the child process and waits for a stop request; on request it sends
//! SIGTERM, waits for exit (escalating to SIGKILL after the configured
//! timeout) and acknowledges.
//!
//! Dropping a handle without stopping it still terminates the engine; the
//! watcher removes the home directory once the engine has exited.

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::reaper::{self, OwnedPid};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

/// PATH given to the engine before its configured environment.
pub const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// A running bootstrap engine.
#[derive(Debug)]
pub struct EngineHandle {
    pid: u32,
    home: PathBuf,
    stop_tx: Option<oneshot::Sender<()>>,
    done_rx: Option<oneshot::Receiver<Result<Option<ExitStatus>>>>,
}

/// Starts the bootstrap engine.
pub struct EngineSupervisor;

impl EngineSupervisor {
    /// Launch the engine and return as soon as the process exists.
    ///
    /// Readiness is not awaited. Must be called within a tokio runtime.
    pub fn start(cfg: &EngineConfig) -> Result<EngineHandle> {
        std::fs::create_dir_all(&cfg.home)?;

        let mut cmd = Command::new(&cfg.binary);
        cmd.args(&cfg.args);

        cmd.env_clear();
        cmd.env("PATH", DEFAULT_PATH);
        for kv in &cfg.environment {
            match kv.split_once('=') {
                Some((key, value)) => {
                    cmd.env(key, value);
                }
                // Bare names pass through our own value.
                None => {
                    if let Ok(value) = std::env::var(kv) {
                        cmd.env(kv, value);
                    }
                }
            }
        }

        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::inherit());
        cmd.stderr(Stdio::inherit());
        // Never outlive the runtime that owns the watcher.
        cmd.kill_on_drop(true);

        let (child, owned) = match reaper::spawn_owned(&mut cmd) {
            Ok(spawned) => spawned,
            Err(e) => {
                let msg = format!("{}: {}", cfg.binary.display(), e);
                error!("{}", msg);
                remove_home(&cfg.home)?;
                return Err(Error::EngineSpawn(msg));
            }
        };
        let pid = child
            .id()
            .ok_or_else(|| Error::EngineSpawn("engine exited before it could be tracked".into()))?;

        info!(pid = pid, binary = %cfg.binary.display(), "Launched bootstrap engine");

        let (stop_tx, stop_rx) = oneshot::channel();
        let (done_tx, done_rx) = oneshot::channel();
        tokio::spawn(watch(
            Watched {
                child,
                pid,
                home: cfg.home.clone(),
                _owned: owned,
            },
            stop_rx,
            done_tx,
            cfg.stop_timeout(),
        ));

        Ok(EngineHandle {
            pid,
            home: cfg.home.clone(),
            stop_tx: Some(stop_tx),
            done_rx: Some(done_rx),
        })
    }

    /// Run `work` with the engine up, stopping the engine on every path.
    ///
    /// An error from `work` is returned unchanged; a stop failure after a
    /// failed `work` is only logged.
    pub async fn scoped<T, F>(cfg: &EngineConfig, work: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let engine = Self::start(cfg)?;
        let result = work.await;
        let stopped = engine.stop().await;

        match (result, stopped) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), stopped) => {
                if let Err(stop_err) = stopped {
                    error!(error = %stop_err, "Failed to stop bootstrap engine");
                }
                Err(e)
            }
        }
    }
}

impl EngineHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    /// Stop the engine, wait for it to exit and remove its home directory.
    pub async fn stop(mut self) -> Result<()> {
        let (Some(stop_tx), Some(done_rx)) = (self.stop_tx.take(), self.done_rx.take()) else {
            return Ok(());
        };

        info!(pid = self.pid, "Stopping bootstrap engine");
        let _ = stop_tx.send(());

        let status = done_rx
            .await
            .map_err(|_| Error::EngineStop("engine watcher exited without acknowledging".into()))??;
        match status {
            Some(status) => info!(pid = self.pid, status = %status, "Bootstrap engine exited"),
            None => debug!(pid = self.pid, "Bootstrap engine already reaped"),
        }

        remove_home(&self.home)
    }
}

impl Drop for EngineHandle {
    /// Best-effort teardown: the watcher sees the closed channel as a stop
    /// request and removes the home once the engine has exited. Nothing
    /// waits for that to finish.
    fn drop(&mut self) {
        if self.stop_tx.take().is_some() {
            warn!(pid = self.pid, "Bootstrap engine handle dropped without stop");
        }
    }
}

fn remove_home(home: &Path) -> Result<()> {
    match std::fs::remove_dir_all(home) {
        Ok(()) => {
            debug!(home = %home.display(), "Removed engine home");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// The engine process as owned by its watcher.
struct Watched {
    child: Child,
    pid: u32,
    home: PathBuf,
    _owned: Option<OwnedPid>,
}

/// Owns the engine process until a stop request (or a dropped handle).
async fn watch(
    mut engine: Watched,
    stop_rx: oneshot::Receiver<()>,
    done_tx: oneshot::Sender<Result<Option<ExitStatus>>>,
    timeout: Option<Duration>,
) {
    let requested = stop_rx.await.is_ok();
    let result = terminate(&mut engine.child, engine.pid, timeout).await;

    if !requested {
        // No handle is left to remove the home.
        if let Err(e) = remove_home(&engine.home) {
            warn!(error = %e, home = %engine.home.display(), "Failed to remove engine home");
        }
    }
    let _ = done_tx.send(result);
}

async fn terminate(
    child: &mut Child,
    pid: u32,
    timeout: Option<Duration>,
) -> Result<Option<ExitStatus>> {
    match signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        Ok(()) | Err(nix::Error::ESRCH) => {}
        Err(e) => return Err(e.into()),
    }

    let Some(timeout) = timeout else {
        return wait_child(child).await;
    };

    match tokio::time::timeout(timeout, wait_child(child)).await {
        Ok(result) => result,
        Err(_) => {
            warn!(pid = pid, timeout_secs = timeout.as_secs(), "Engine did not exit in time, sending SIGKILL");
            match signal::kill(Pid::from_raw(pid as i32), Signal::SIGKILL) {
                Ok(()) | Err(nix::Error::ESRCH) => {}
                Err(e) => return Err(e.into()),
            }
            wait_child(child).await
        }
    }
}

/// Wait for the child. `None` means it was already reaped elsewhere.
async fn wait_child(child: &mut Child) -> Result<Option<ExitStatus>> {
    match child.wait().await {
        Ok(status) => Ok(Some(status)),
        Err(e) if e.raw_os_error() == Some(libc::ECHILD) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_spawn_failure() {
        let home = tempfile::tempdir().unwrap();
        let cfg = EngineConfig {
            binary: PathBuf::from("/nonexistent/engine"),
            args: Vec::new(),
            home: home.path().join("engine"),
            ..Default::default()
        };

        let err = EngineSupervisor::start(&cfg).unwrap_err();
        assert!(matches!(err, Error::EngineSpawn(_)));
        assert!(!cfg.home.exists());
    }
}
