//! Process tree termination.
//!
//! Scan tools fork helpers; some of them leave the process group. The
//! descendant tree is captured from the process table before signalling so
//! that escaped processes can be killed after the group is gone.

use std::collections::HashSet;
use std::io;
use std::process::ExitStatus;
use std::time::Duration;

use log::{debug, warn};
use sysinfo::{Pid, ProcessRefreshKind, Signal, System};
use tokio::process::Child;

/// A process identified by pid and start time, so a recycled pid is not
/// mistaken for the original process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct ProcessId {
    pid: Pid,
    start_time: u64,
}

/// Terminates `child` and everything it spawned.
///
/// Sends SIGTERM to the process group, escalates to SIGKILL once `grace`
/// has elapsed, then kills any recorded descendant still alive.
pub(super) async fn terminate(child: &mut Child, grace: Duration) -> io::Result<ExitStatus> {
    let Some(pid) = child.id() else {
        // Already reaped
        return child.wait().await;
    };

    let descendants = descendants_of(pid);
    debug!("pid {} has {} descendants", pid, descendants.len());

    signal_group(pid, Termination::Graceful);

    let status = match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => status,
        Err(_) => {
            warn!("pid {} ignored SIGTERM for {:?}; killing", pid, grace);
            signal_group(pid, Termination::Forced);
            child.kill().await?;
            child.wait().await
        }
    };

    // Group members that survived the leader
    signal_group(pid, Termination::Forced);
    kill_escaped(&descendants);

    status
}

#[derive(Debug, Clone, Copy)]
enum Termination {
    Graceful,
    Forced,
}

#[cfg(unix)]
fn signal_group(pgid: u32, how: Termination) {
    let signal = match how {
        Termination::Graceful => libc::SIGTERM,
        Termination::Forced => libc::SIGKILL,
    };
    // ESRCH just means the group is already gone
    unsafe {
        libc::kill(-(pgid as i32), signal);
    }
}

#[cfg(not(unix))]
fn signal_group(_pgid: u32, _how: Termination) {}

/// Walks the process table for every transitive child of `root`.
fn descendants_of(root: u32) -> Vec<ProcessId> {
    let mut system = System::new();
    system.refresh_processes_specifics(ProcessRefreshKind::new());

    let mut family: HashSet<Pid> = HashSet::from([Pid::from_u32(root)]);
    let mut found = Vec::new();

    // Repeat until no new children turn up; the table is not ordered
    loop {
        let before = family.len();
        for (pid, process) in system.processes() {
            if family.contains(pid) {
                continue;
            }
            if process.parent().is_some_and(|parent| family.contains(&parent)) {
                family.insert(*pid);
                found.push(ProcessId {
                    pid: *pid,
                    start_time: process.start_time(),
                });
            }
        }
        if family.len() == before {
            break;
        }
    }

    found
}

/// Kills the recorded descendants that are still alive.
fn kill_escaped(descendants: &[ProcessId]) {
    if descendants.is_empty() {
        return;
    }

    let mut system = System::new();
    system.refresh_processes_specifics(ProcessRefreshKind::new());

    for id in descendants {
        let Some(process) = system.process(id.pid) else {
            continue;
        };
        if process.start_time() != id.start_time {
            continue;
        }
        if process.kill_with(Signal::Kill).unwrap_or(false) {
            warn!("Killed escaped descendant pid {}", id.pid);
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_descendants_of_missing_process() {
        // A pid that cannot exist has no children
        let found = descendants_of(u32::MAX - 1);
        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn test_descendants_of_shell() {
        let mut child = tokio::process::Command::new("/bin/sh")
            .args(["-c", "sleep 5 & wait"])
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let found = descendants_of(child.id().unwrap());
        assert!(!found.is_empty());

        child.kill().await.unwrap();
        kill_escaped(&found);
    }
}
