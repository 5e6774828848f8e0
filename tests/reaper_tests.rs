//! Tests for zombie reaping
//!
//! Reaping waits on any child of the test process, so everything that
//! spawns children lives in one test to keep the counts deterministic.

use buckos_bootstrap::reaper::{is_pid1, reap_zombies, spawn_reaper, spawn_reaper_forced};
use nix::sys::signal::kill;
use nix::unistd::Pid;
use std::process::Command;
use std::time::{Duration, Instant};

/// Whether `pid` still exists, zombies included
fn is_process_alive(pid: u32) -> bool {
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

/// Spawn a short-lived child and never wait on it
fn spawn_zombie() -> u32 {
    let child = Command::new("/bin/true")
        .spawn()
        .expect("Failed to spawn child");
    child.id()
}

#[tokio::test]
async fn test_reaping() {
    // Synchronous drain.
    let first = spawn_zombie();
    let second = spawn_zombie();
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert!(is_process_alive(first), "exited child should linger as a zombie");
    assert!(reap_zombies() >= 2);
    assert!(!is_process_alive(first));
    assert!(!is_process_alive(second));
    assert_eq!(reap_zombies(), 0);

    // Background reaper, woken by SIGCHLD.
    let handle = spawn_reaper_forced().unwrap();
    let pid = spawn_zombie();

    let deadline = Instant::now() + Duration::from_secs(5);
    while is_process_alive(pid) && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(!is_process_alive(pid));

    handle.abort();
}

#[tokio::test]
async fn test_reaper_only_as_pid1() {
    if is_pid1() {
        return;
    }
    assert!(spawn_reaper().unwrap().is_none());
}
