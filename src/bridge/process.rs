//! Bridge executable discovery and process operations
//!
//! The delivery bridge is a sibling binary: discovery probes the build-tree
//! candidates before falling back to `PATH`. The spawn is fully detached
//! (null stdio, no kill-on-drop) because the bridge must outlive any single
//! MCP session. Termination goes polite first, forceful after a grace
//! period.

use crate::error::{CoreError, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use sysinfo::{ProcessesToUpdate, Signal, System};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Grace period between polite and forceful termination
const TERMINATION_GRACE: Duration = Duration::from_secs(1);

/// Ordered candidate paths for the bridge executable
pub fn candidate_paths(executable: &str) -> Vec<PathBuf> {
    vec![
        PathBuf::from("./target/release").join(executable),
        PathBuf::from("./target/debug").join(executable),
        PathBuf::from("../target/release").join(executable),
        PathBuf::from("../target/debug").join(executable),
    ]
}

/// Locates the bridge executable: build-tree candidates first, then `PATH`
pub fn discover_executable(executable: &str) -> Result<PathBuf> {
    let candidates = candidate_paths(executable);
    for candidate in &candidates {
        if candidate.is_file() {
            debug!(path = %candidate.display(), "bridge executable found");
            return Ok(candidate.clone());
        }
    }

    if let Some(paths) = std::env::var_os("PATH") {
        for dir in std::env::split_paths(&paths) {
            let candidate = dir.join(executable);
            if candidate.is_file() {
                debug!(path = %candidate.display(), "bridge executable found on PATH");
                return Ok(candidate);
            }
        }
    }

    Err(CoreError::BridgeNotFound {
        searched: candidates
            .iter()
            .map(|p| p.display().to_string())
            .chain(std::iter::once("$PATH".to_string()))
            .collect(),
    })
}

/// Spawns the bridge detached from this process
///
/// Stdio is redirected to null and the child is not tracked; readiness is
/// established separately through the health endpoint.
pub fn spawn_detached(path: &PathBuf, env: &HashMap<String, String>) -> Result<u32> {
    let mut command = Command::new(path);
    command
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(false);
    for (key, value) in env {
        command.env(key, value);
    }
    #[cfg(unix)]
    command.process_group(0);

    let child = command.spawn().map_err(|err| CoreError::BridgeStartFailed {
        attempts: 1,
        reason: format!("spawn failed: {err}"),
    })?;
    let pid = child.id().ok_or_else(|| CoreError::BridgeStartFailed {
        attempts: 1,
        reason: "spawned process exited immediately".to_string(),
    })?;
    info!(pid, path = %path.display(), "bridge process spawned");
    Ok(pid)
}

/// Whether a process was launched from the given executable filename
///
/// The short process name alone is unreliable (Linux truncates it to 15
/// bytes), so the executable path and the command line are consulted too.
fn matches_executable(process: &sysinfo::Process, executable: &str) -> bool {
    if process.name().to_string_lossy() == executable {
        return true;
    }
    if process
        .exe()
        .and_then(|path| path.file_name())
        .is_some_and(|name| name.to_string_lossy() == executable)
    {
        return true;
    }
    process.cmd().iter().any(|arg| {
        std::path::Path::new(arg)
            .file_name()
            .is_some_and(|name| name.to_string_lossy() == executable)
    })
}

/// PIDs of running processes whose executable filename matches
pub fn find_pids_by_name(executable: &str) -> Vec<u32> {
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::All, true);
    system
        .processes()
        .iter()
        .filter(|(_, process)| matches_executable(process, executable))
        .map(|(pid, _)| pid.as_u32())
        .collect()
}

/// Terminates every bridge process: SIGTERM, a grace period, then SIGKILL
/// for survivors; returns the number of processes terminated
pub async fn terminate_by_name(executable: &str) -> usize {
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::All, true);

    let targets: Vec<_> = system
        .processes()
        .iter()
        .filter(|(_, process)| matches_executable(process, executable))
        .map(|(pid, _)| *pid)
        .collect();
    if targets.is_empty() {
        return 0;
    }

    for pid in &targets {
        if let Some(process) = system.process(*pid) {
            if process.kill_with(Signal::Term).is_none() {
                // platform without SIGTERM support falls through to kill
                process.kill();
            }
        }
    }
    tokio::time::sleep(TERMINATION_GRACE).await;

    system.refresh_processes(ProcessesToUpdate::Some(&targets), true);
    for pid in &targets {
        if let Some(process) = system.process(*pid) {
            warn!(pid = pid.as_u32(), "bridge ignored SIGTERM, killing");
            process.kill();
        }
    }
    targets.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidate_order_prefers_release_then_debug() {
        let candidates = candidate_paths("cctelegram-bridge");
        assert_eq!(candidates.len(), 4);
        assert!(candidates[0].ends_with("target/release/cctelegram-bridge"));
        assert!(candidates[1].ends_with("target/debug/cctelegram-bridge"));
        assert!(candidates[2].starts_with("../target/release"));
    }

    #[test]
    fn missing_executable_reports_search_paths() {
        let err = discover_executable("definitely-not-a-real-binary-name").unwrap_err();
        match err {
            CoreError::BridgeNotFound { searched } => {
                assert_eq!(searched.len(), 5);
                assert_eq!(searched.last().map(String::as_str), Some("$PATH"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn find_pids_returns_empty_for_unknown_name() {
        assert!(find_pids_by_name("no-such-process-xyz").is_empty());
    }
}
