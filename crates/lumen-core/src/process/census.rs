//! Discovery of live worker processes.
//!
//! A [`ProcessTable`] snapshots the OS process list; [`WorkerCensus`]
//! filters that snapshot down to processes running one of the known worker
//! scripts. Listing failures are never errors here: a census that cannot
//! see the process table reports nothing.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::io;
use std::path::Path;
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use super::signal;
use crate::launch::StageKind;

/// One row of the process table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessEntry {
    pub pid: u32,
    pub ppid: u32,
    pub args: Vec<String>,
}

/// A source of process table snapshots.
pub trait ProcessTable: Send + Sync {
    fn snapshot(&self) -> io::Result<Vec<ProcessEntry>>;
}

/// The process table backend for the current platform.
#[cfg(target_os = "linux")]
pub fn system_table() -> Arc<dyn ProcessTable> {
    Arc::new(ProcFsTable)
}

/// The process table backend for the current platform.
#[cfg(all(unix, not(target_os = "linux")))]
pub fn system_table() -> Arc<dyn ProcessTable> {
    Arc::new(PsTable)
}

/// The process table backend for the current platform.
#[cfg(windows)]
pub fn system_table() -> Arc<dyn ProcessTable> {
    Arc::new(WmicTable)
}

// ---------------------------------------------------------------------------
// /proc
// ---------------------------------------------------------------------------

/// Reads `/proc` through `procfs` (Linux). Zombies are skipped.
#[cfg(target_os = "linux")]
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcFsTable;

#[cfg(target_os = "linux")]
impl ProcessTable for ProcFsTable {
    fn snapshot(&self) -> io::Result<Vec<ProcessEntry>> {
        let all = procfs::process::all_processes().map_err(io::Error::other)?;
        let mut entries = Vec::new();
        for proc in all {
            // Processes may vanish between listing and the reads below.
            let Ok(proc) = proc else { continue };
            let Ok(stat) = proc.stat() else { continue };
            if stat.state == 'Z' {
                continue;
            }
            let (Ok(pid), Ok(ppid)) = (u32::try_from(stat.pid), u32::try_from(stat.ppid)) else {
                continue;
            };
            entries.push(ProcessEntry {
                pid,
                ppid,
                args: proc.cmdline().unwrap_or_default(),
            });
        }
        Ok(entries)
    }
}

// ---------------------------------------------------------------------------
// ps
// ---------------------------------------------------------------------------

/// Parse `ps -axo pid=,ppid=,command=` output.
pub fn parse_ps_output(output: &str) -> Vec<ProcessEntry> {
    output
        .lines()
        .filter_map(|line| {
            let line = line.trim_start();
            let (pid, rest) = split_field(line)?;
            let (ppid, command) = split_field(rest)?;
            Some(ProcessEntry {
                pid: pid.parse().ok()?,
                ppid: ppid.parse().ok()?,
                args: command.split_whitespace().map(str::to_owned).collect(),
            })
        })
        .collect()
}

fn split_field(s: &str) -> Option<(&str, &str)> {
    let s = s.trim_start();
    if s.is_empty() {
        return None;
    }
    match s.find(char::is_whitespace) {
        Some(pos) => Some((&s[..pos], s[pos..].trim_start())),
        None => Some((s, "")),
    }
}

/// Shells out to `ps` (non-Linux Unix).
#[derive(Debug, Clone, Copy, Default)]
pub struct PsTable;

impl ProcessTable for PsTable {
    fn snapshot(&self) -> io::Result<Vec<ProcessEntry>> {
        let output = Command::new("ps")
            .args(["-axo", "pid=,ppid=,command="])
            .output()?;
        if !output.status.success() {
            return Err(io::Error::other(format!("ps exited with {}", output.status)));
        }
        Ok(parse_ps_output(&String::from_utf8_lossy(&output.stdout)))
    }
}

// ---------------------------------------------------------------------------
// wmic
// ---------------------------------------------------------------------------

/// Parse `wmic process get ProcessId,ParentProcessId,CommandLine /format:csv`.
///
/// wmic orders columns alphabetically (`Node,CommandLine,ParentProcessId,
/// ProcessId`); the command line may contain commas, so the numeric columns
/// are taken from the right.
pub fn parse_wmic_csv(output: &str) -> Vec<ProcessEntry> {
    output
        .lines()
        .map(|line| line.trim_end_matches('\r'))
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| {
            let mut right = line.rsplitn(3, ',');
            let pid = right.next()?.trim().parse().ok()?;
            let ppid = right.next()?.trim().parse().ok()?;
            let (_node, command) = right.next()?.split_once(',')?;
            Some(ProcessEntry {
                pid,
                ppid,
                args: split_command_line(command),
            })
        })
        .collect()
}

/// Split a Windows command line on whitespace, honouring double quotes.
fn split_command_line(command: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut in_arg = false;
    for c in command.chars() {
        match c {
            '"' => {
                quoted = !quoted;
                in_arg = true;
            }
            c if c.is_whitespace() && !quoted => {
                if in_arg {
                    args.push(std::mem::take(&mut current));
                    in_arg = false;
                }
            }
            c => {
                current.push(c);
                in_arg = true;
            }
        }
    }
    if in_arg {
        args.push(current);
    }
    args
}

fn decode_wmic(raw: &[u8]) -> String {
    // Redirected wmic output is UTF-16LE with a BOM.
    if let Some(body) = raw.strip_prefix(&[0xFF, 0xFE]) {
        let units: Vec<u16> = body
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        return String::from_utf16_lossy(&units);
    }
    String::from_utf8_lossy(raw).into_owned()
}

/// Shells out to `wmic` (Windows).
#[derive(Debug, Clone, Copy, Default)]
pub struct WmicTable;

impl ProcessTable for WmicTable {
    fn snapshot(&self) -> io::Result<Vec<ProcessEntry>> {
        let output = Command::new("wmic")
            .args([
                "process",
                "get",
                "ProcessId,ParentProcessId,CommandLine",
                "/format:csv",
            ])
            .output()?;
        if !output.status.success() {
            return Err(io::Error::other(format!(
                "wmic exited with {}",
                output.status
            )));
        }
        Ok(parse_wmic_csv(&decode_wmic(&output.stdout)))
    }
}

// ---------------------------------------------------------------------------
// process trees
// ---------------------------------------------------------------------------

/// Every transitive child of `root` in `entries`, `root` excluded.
pub fn descendants_in(entries: &[ProcessEntry], root: u32) -> BTreeSet<u32> {
    let mut children: BTreeMap<u32, Vec<u32>> = BTreeMap::new();
    for entry in entries {
        if entry.pid != entry.ppid {
            children.entry(entry.ppid).or_default().push(entry.pid);
        }
    }

    let mut found = BTreeSet::new();
    let mut queue = VecDeque::from([root]);
    while let Some(pid) = queue.pop_front() {
        for &child in children.get(&pid).into_iter().flatten() {
            if child != root && found.insert(child) {
                queue.push_back(child);
            }
        }
    }
    found
}

fn snapshot_or_empty(table: &dyn ProcessTable) -> Vec<ProcessEntry> {
    match table.snapshot() {
        Ok(entries) => entries,
        Err(e) => {
            debug!(error = %e, "process table listing failed");
            Vec::new()
        }
    }
}

/// A process and the descendants it had when termination was requested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelTarget {
    pub target_pid: u32,
    pub descendant_pids: BTreeSet<u32>,
}

impl CancelTarget {
    /// Snapshot the descendants of `pid`.
    pub fn discover(table: &dyn ProcessTable, pid: u32) -> Self {
        let entries = snapshot_or_empty(table);
        Self {
            target_pid: pid,
            descendant_pids: descendants_in(&entries, pid),
        }
    }

    /// Ask the target's group and every descendant to exit.
    pub fn signal_terminate(&self) {
        if let Err(e) = signal::terminate_group(self.target_pid) {
            debug!(pid = self.target_pid, error = %e, "group SIGTERM failed, signalling process");
            if let Err(e) = signal::terminate(self.target_pid) {
                debug!(pid = self.target_pid, error = %e, "SIGTERM failed");
            }
        }
        for &pid in &self.descendant_pids {
            if let Err(e) = signal::terminate(pid) {
                debug!(pid, error = %e, "SIGTERM to descendant failed");
            }
        }
    }

    /// Force-kill the target's group and every descendant still alive.
    pub fn signal_kill(&self) {
        if let Err(e) = signal::kill_group(self.target_pid) {
            debug!(pid = self.target_pid, error = %e, "group SIGKILL failed");
        }
        if signal::is_alive(self.target_pid) {
            if let Err(e) = signal::kill(self.target_pid) {
                warn!(pid = self.target_pid, error = %e, "SIGKILL failed");
            }
        }
        self.kill_surviving_descendants();
    }

    /// SIGKILL descendants that outlived the target; returns how many.
    pub fn kill_surviving_descendants(&self) -> usize {
        let mut killed = 0;
        for &pid in &self.descendant_pids {
            if signal::is_alive(pid) {
                match signal::kill(pid) {
                    Ok(()) => killed += 1,
                    Err(e) => warn!(pid, error = %e, "SIGKILL to descendant failed"),
                }
            }
        }
        killed
    }

    pub fn any_alive(&self) -> bool {
        signal::is_alive(self.target_pid)
            || self.descendant_pids.iter().any(|&pid| signal::is_alive(pid))
    }

    /// Terminate a process family this process does not own: SIGTERM, poll
    /// for up to `grace`, then SIGKILL whatever is left.
    pub async fn terminate(&self, grace: Duration) {
        self.signal_terminate();
        let deadline = tokio::time::Instant::now() + grace;
        while self.any_alive() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        if self.any_alive() {
            debug!(pid = self.target_pid, "process family survived SIGTERM, sending SIGKILL");
            self.signal_kill();
        }
    }
}

// ---------------------------------------------------------------------------
// census
// ---------------------------------------------------------------------------

/// Finds live processes running a known worker script.
#[derive(Clone)]
pub struct WorkerCensus {
    scripts: BTreeSet<String>,
    table: Arc<dyn ProcessTable>,
    own_pid: u32,
}

impl std::fmt::Debug for WorkerCensus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerCensus")
            .field("scripts", &self.scripts)
            .field("own_pid", &self.own_pid)
            .finish()
    }
}

impl WorkerCensus {
    pub fn new<I, S>(scripts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            scripts: scripts.into_iter().map(Into::into).collect(),
            table: system_table(),
            own_pid: std::process::id(),
        }
    }

    /// A census over the three stage scripts.
    pub fn for_stages() -> Self {
        Self::new(StageKind::ALL.map(StageKind::script_name))
    }

    /// A census over every `.py` file in `dir`, or the stage scripts when
    /// the directory is unreadable or holds none.
    pub fn from_script_dir(dir: &Path) -> Self {
        let scripts: BTreeSet<String> = match std::fs::read_dir(dir) {
            Ok(entries) => entries
                .filter_map(Result::ok)
                .filter(|e| e.path().extension().is_some_and(|ext| ext == "py"))
                .filter_map(|e| e.file_name().into_string().ok())
                .collect(),
            Err(e) => {
                debug!(dir = %dir.display(), error = %e, "cannot read worker script directory");
                BTreeSet::new()
            }
        };
        if scripts.is_empty() {
            Self::for_stages()
        } else {
            Self::new(scripts)
        }
    }

    pub fn with_table(mut self, table: Arc<dyn ProcessTable>) -> Self {
        self.table = table;
        self
    }

    pub fn scripts(&self) -> &BTreeSet<String> {
        &self.scripts
    }

    fn is_worker(&self, entry: &ProcessEntry) -> bool {
        entry.args.iter().any(|arg| {
            arg.rsplit(['/', '\\'])
                .next()
                .is_some_and(|name| self.scripts.contains(name))
        })
    }

    /// PIDs of live worker processes, this process excluded.
    pub fn list_worker_pids(&self) -> BTreeSet<u32> {
        snapshot_or_empty(self.table.as_ref())
            .into_iter()
            .filter(|entry| entry.pid != self.own_pid && self.is_worker(entry))
            .map(|entry| entry.pid)
            .collect()
    }

    pub fn is_any_worker_running(&self) -> bool {
        !self.list_worker_pids().is_empty()
    }

    pub fn descendants_of(&self, pid: u32) -> BTreeSet<u32> {
        descendants_in(&snapshot_or_empty(self.table.as_ref()), pid)
    }

    pub fn cancel_target(&self, pid: u32) -> CancelTarget {
        CancelTarget::discover(self.table.as_ref(), pid)
    }
}
