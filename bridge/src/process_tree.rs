//! Process tree inspection — list every process with its parent, compute the
//! descendants of a pid, and force-kill single pids.
//!
//! Listings are never cached: the tree is re-read on every kill request.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use tokio::process::Command;
use tracing::debug;

use crate::error::{BridgeError, Result};

/// One row of the platform process listing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessEntry {
    pub pid: u32,
    pub parent_pid: u32,
}

#[async_trait]
pub trait ProcessInspector: Send + Sync {
    /// Every process on the machine right now.
    async fn list_processes(&self) -> Result<Vec<ProcessEntry>>;

    /// Force-kill one pid. `Ok(false)` means it was already gone.
    async fn kill_one(&self, pid: u32) -> Result<bool>;

    /// Descendants of `pid`, leaves first.
    async fn list_children(&self, pid: u32) -> Result<Vec<u32>> {
        let entries = self.list_processes().await?;
        Ok(descendants(&entries, pid))
    }
}

/// Transitive children of `root`, depth-first with every child placed after
/// its own descendants, so killing in order takes leaves before parents.
pub fn descendants(entries: &[ProcessEntry], root: u32) -> Vec<u32> {
    let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
    for entry in entries {
        if entry.pid != entry.parent_pid {
            children.entry(entry.parent_pid).or_default().push(entry.pid);
        }
    }

    let mut ordered = Vec::new();
    let mut seen = HashSet::from([root]);
    collect(&children, root, &mut seen, &mut ordered);
    ordered
}

fn collect(
    children: &HashMap<u32, Vec<u32>>,
    pid: u32,
    seen: &mut HashSet<u32>,
    ordered: &mut Vec<u32>,
) {
    let Some(kids) = children.get(&pid) else {
        return;
    };
    for &child in kids {
        // pid reuse can produce loops in a racy snapshot
        if !seen.insert(child) {
            continue;
        }
        collect(children, child, seen, ordered);
        ordered.push(child);
    }
}

/// Parse `PARENT PID` column pairs; headers and junk lines are skipped.
pub fn parse_listing(output: &str) -> Vec<ProcessEntry> {
    output
        .lines()
        .filter_map(|line| {
            let mut cols = line.split_whitespace();
            let parent_pid = cols.next()?.parse::<u32>().ok()?;
            let pid = cols.next()?.parse::<u32>().ok()?;
            Some(ProcessEntry { pid, parent_pid })
        })
        .collect()
}

/// Inspector backed by the platform's own tools.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProcessTree;

impl SystemProcessTree {
    fn listing_command() -> Command {
        if cfg!(windows) {
            let mut cmd = Command::new("wmic");
            cmd.args(["process", "get", "ParentProcessId,ProcessId"]);
            cmd
        } else {
            let mut cmd = Command::new("ps");
            cmd.args(["-A", "-o", "ppid,pid"]);
            cmd
        }
    }
}

#[async_trait]
impl ProcessInspector for SystemProcessTree {
    async fn list_processes(&self) -> Result<Vec<ProcessEntry>> {
        let output = Self::listing_command().output().await?;
        if !output.status.success() {
            return Err(BridgeError::Execution {
                detail: format!(
                    "process listing failed: {}",
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }
        let entries = parse_listing(&String::from_utf8_lossy(&output.stdout));
        debug!("Process listing returned {} entries", entries.len());
        Ok(entries)
    }

    #[cfg(unix)]
    async fn kill_one(&self, pid: u32) -> Result<bool> {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let raw = i32::try_from(pid).map_err(|_| BridgeError::Execution {
            detail: format!("pid out of range: {pid}"),
        })?;
        match kill(Pid::from_raw(raw), Signal::SIGKILL) {
            Ok(()) => Ok(true),
            Err(nix::errno::Errno::ESRCH) => Ok(false), // No such process
            Err(e) => Err(BridgeError::Io(std::io::Error::from(e))),
        }
    }

    #[cfg(not(unix))]
    async fn kill_one(&self, pid: u32) -> Result<bool> {
        let output = Command::new("taskkill")
            .args(["/F", "/PID", &pid.to_string()])
            .output()
            .await?;
        taskkill_outcome(
            pid,
            output.status.code(),
            &String::from_utf8_lossy(&output.stderr),
        )
    }
}

/// taskkill's exit code for a pid that does not exist
#[cfg(any(not(unix), test))]
const TASKKILL_NOT_FOUND: i32 = 128;

#[cfg(any(not(unix), test))]
fn taskkill_outcome(pid: u32, code: Option<i32>, stderr: &str) -> Result<bool> {
    match code {
        Some(0) => Ok(true),
        Some(TASKKILL_NOT_FOUND) => Ok(false), // No such process
        _ if stderr.contains("not found") => Ok(false),
        _ => Err(BridgeError::Execution {
            detail: format!("taskkill {pid} failed: {}", stderr.trim()),
        }),
    }
}
