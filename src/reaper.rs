//! Zombie reaping for PID 1.
//!
//! Orphaned processes are reparented to PID 1, which must wait on them or
//! they stay zombies forever. The reaper task wakes on every SIGCHLD and
//! drains all terminated children without blocking. It shares no state
//! with the bootstrap pipeline.
//!
//! Children spawned through [`spawn_owned`] belong to their spawner: the
//! reaper peeks at each terminated child with `WNOWAIT` and leaves owned
//! ones for the code awaiting their exit status. When an owned child is
//! released the reaper runs another pass for anything queued behind it.

use crate::error::Result;
use nix::sys::wait::{waitid, waitpid, Id, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::collections::BTreeSet;
use std::io;
use std::sync::{Mutex, MutexGuard, OnceLock};
use tokio::process::{Child, Command};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// PIDs whose exit status is collected by their spawner.
static OWNED: Mutex<BTreeSet<i32>> = Mutex::new(BTreeSet::new());

/// Signalled when an owned child is released.
static RELEASED: OnceLock<Notify> = OnceLock::new();

fn owned() -> MutexGuard<'static, BTreeSet<i32>> {
    // The set stays consistent even if a holder panicked.
    OWNED.lock().unwrap_or_else(|e| e.into_inner())
}

fn released() -> &'static Notify {
    RELEASED.get_or_init(Notify::new)
}

/// Marks a child as owned until dropped.
#[derive(Debug)]
pub struct OwnedPid {
    pid: i32,
}

impl OwnedPid {
    pub fn pid(&self) -> i32 {
        self.pid
    }
}

impl Drop for OwnedPid {
    fn drop(&mut self) {
        owned().remove(&self.pid);
        released().notify_one();
    }
}

/// Spawn `cmd` with its exit status reserved for the caller.
///
/// The child is registered before the reaper can observe it exiting. Keep
/// the returned [`OwnedPid`] alive until the child has been waited on.
pub fn spawn_owned(cmd: &mut Command) -> io::Result<(Child, Option<OwnedPid>)> {
    let mut registry = owned();
    let child = cmd.spawn()?;
    let guard = child.id().map(|pid| {
        let pid = pid as i32;
        registry.insert(pid);
        OwnedPid { pid }
    });
    Ok((child, guard))
}

/// Whether this process is the init process.
pub fn is_pid1() -> bool {
    std::process::id() == 1
}

/// Reap every terminated child not owned by a spawner, returning how many
/// were reaped.
///
/// Stops at the first terminated owned child; the pass is repeated once it
/// is released.
pub fn reap_zombies() -> usize {
    let registry = owned();
    let mut reaped = 0;

    loop {
        let flags = WaitPidFlag::WEXITED | WaitPidFlag::WNOHANG | WaitPidFlag::WNOWAIT;
        let pid = match waitid(Id::All, flags) {
            Ok(WaitStatus::StillAlive) | Err(nix::Error::ECHILD) => break,
            Ok(status) => match status.pid() {
                Some(pid) => pid,
                None => break,
            },
            Err(nix::Error::EINTR) => continue,
            Err(e) => {
                error!(error = %e, "Error reaping zombies");
                break;
            }
        };

        if registry.contains(&pid.as_raw()) {
            debug!(pid = pid.as_raw(), "Leaving owned child to its spawner");
            break;
        }

        match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::Exited(pid, code)) => {
                debug!(pid = pid.as_raw(), code = code, "Reaped zombie process");
                reaped += 1;
            }
            Ok(WaitStatus::Signaled(pid, sig, _)) => {
                debug!(pid = pid.as_raw(), signal = ?sig, "Reaped signaled process");
                reaped += 1;
            }
            Ok(_) | Err(nix::Error::EINTR) | Err(nix::Error::ECHILD) => continue,
            Err(e) => {
                error!(pid = pid.as_raw(), error = %e, "Error reaping zombie");
                break;
            }
        }
    }

    reaped
}

/// Start the reaper if running as PID 1.
pub fn spawn_reaper() -> Result<Option<JoinHandle<()>>> {
    if !is_pid1() {
        debug!("Not PID 1, zombie reaper disabled");
        return Ok(None);
    }
    spawn_reaper_forced().map(Some)
}

/// Start the reaper regardless of PID (e.g. as a child subreaper).
pub fn spawn_reaper_forced() -> Result<JoinHandle<()>> {
    let mut sigchld = signal(SignalKind::child())?;
    info!("Starting zombie reaper");

    Ok(tokio::spawn(async move {
        // Children that exited before the handler was installed.
        reap_zombies();
        loop {
            tokio::select! {
                received = sigchld.recv() => {
                    if received.is_none() {
                        break;
                    }
                }
                _ = released().notified() => {}
            }
            let reaped = reap_zombies();
            if reaped > 0 {
                debug!(count = reaped, "Reaped children");
            }
        }
    }))
}
