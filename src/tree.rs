//! Process-tree enumeration and termination.
//!
//! Dev servers rarely run as the spawned process itself: a shell starts a package
//! manager which starts the server which starts watchers. Stopping a project means
//! walking the OS process table from the spawned root and killing every descendant.

use std::collections::{HashMap, HashSet, VecDeque};
use std::io;

use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, System};
use tracing::debug;

use crate::error::KillError;

const MAX_PID: u32 = 10_000_000;

/// One row of the OS process table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub parent: Option<u32>,
}

/// Access to the OS process table.
pub trait ProcessTable: Send + Sync {
    /// Returns every process currently known to the OS.
    fn snapshot(&self) -> Vec<ProcessInfo>;

    /// Forcefully terminates a single process.
    fn kill(&self, pid: u32) -> io::Result<()>;
}

/// The real process table, read through `sysinfo`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProcessTable;

impl ProcessTable for SystemProcessTable {
    fn snapshot(&self) -> Vec<ProcessInfo> {
        let mut system = System::new();
        system.refresh_processes_specifics(ProcessesToUpdate::All, true, ProcessRefreshKind::new());
        system
            .processes()
            .iter()
            .map(|(pid, process)| ProcessInfo {
                pid: pid.as_u32(),
                parent: process.parent().map(|parent| parent.as_u32()),
            })
            .collect()
    }

    fn kill(&self, pid: u32) -> io::Result<()> {
        terminate(pid)
    }
}

#[cfg(unix)]
fn terminate(pid: u32) -> io::Result<()> {
    let pid = libc::pid_t::try_from(pid)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
    let rc = unsafe { libc::kill(pid, libc::SIGKILL) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(windows)]
fn terminate(pid: u32) -> io::Result<()> {
    use windows_sys::Win32::Foundation::CloseHandle;
    use windows_sys::Win32::System::Threading::{OpenProcess, TerminateProcess, PROCESS_TERMINATE};

    unsafe {
        let handle = OpenProcess(PROCESS_TERMINATE, 0, pid);
        if handle == 0 {
            return Err(io::Error::last_os_error());
        }
        let ok = TerminateProcess(handle, 1);
        let err = io::Error::last_os_error();
        CloseHandle(handle);
        if ok == 0 {
            Err(err)
        } else {
            Ok(())
        }
    }
}

#[cfg(not(any(unix, windows)))]
fn terminate(_pid: u32) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "process termination is not supported on this platform",
    ))
}

/// Rejects pids that must never be targeted.
pub fn validate_pid(pid: u32) -> Result<u32, KillError> {
    match pid {
        0 => Err(KillError::InvalidPid {
            pid,
            reason: "0 is reserved for the kernel",
        }),
        1 => Err(KillError::InvalidPid {
            pid,
            reason: "1 is the init process",
        }),
        pid if pid > MAX_PID => Err(KillError::InvalidPid {
            pid,
            reason: "out of range",
        }),
        pid => Ok(pid),
    }
}

/// Descendants of `root` in breadth-first order, excluding `root` itself.
pub fn descendants(snapshot: &[ProcessInfo], root: u32) -> Vec<u32> {
    let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
    for info in snapshot {
        if let Some(parent) = info.parent {
            if parent != info.pid {
                children.entry(parent).or_default().push(info.pid);
            }
        }
    }
    for kids in children.values_mut() {
        kids.sort_unstable();
    }

    let mut seen = HashSet::from([root]);
    let mut order = Vec::new();
    let mut queue = VecDeque::from([root]);
    while let Some(pid) = queue.pop_front() {
        let Some(kids) = children.get(&pid) else {
            continue;
        };
        for &kid in kids {
            if seen.insert(kid) {
                order.push(kid);
                queue.push_back(kid);
            }
        }
    }
    order
}

/// `root` followed by its descendants in breadth-first order.
pub fn process_tree(snapshot: &[ProcessInfo], root: u32) -> Vec<u32> {
    let mut tree = vec![root];
    tree.extend(descendants(snapshot, root));
    tree
}

/// This process and every ancestor up to init.
pub fn protected_pids(snapshot: &[ProcessInfo]) -> HashSet<u32> {
    let parents: HashMap<u32, Option<u32>> =
        snapshot.iter().map(|info| (info.pid, info.parent)).collect();
    let mut protected = HashSet::new();
    let mut current = Some(std::process::id());
    while let Some(pid) = current {
        if pid <= 1 || !protected.insert(pid) {
            break;
        }
        current = parents.get(&pid).copied().flatten();
    }
    protected
}

/// Outcome of a tree kill whose root was signalled.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KillReport {
    /// Processes that were signalled successfully, root last.
    pub killed: Vec<u32>,
    /// Descendants that could not be signalled, with the reason.
    pub failed: Vec<(u32, String)>,
    /// Descendants left alone because they belong to this supervisor's ancestry.
    pub skipped: Vec<u32>,
}

/// Kills `root` and every descendant.
///
/// Descendants are signalled deepest-first and their failures are collected, not
/// returned: an already-exited worker is the common case. Only a failure to signal
/// the root itself is an error.
pub fn kill_tree(table: &dyn ProcessTable, root: u32) -> Result<KillReport, KillError> {
    let root = validate_pid(root)?;
    let snapshot = table.snapshot();
    if !snapshot.iter().any(|info| info.pid == root) {
        return Err(KillError::NotFound { pid: root });
    }
    let protected = protected_pids(&snapshot);
    if protected.contains(&root) {
        return Err(KillError::Protected { pid: root });
    }

    let mut report = KillReport::default();
    for pid in descendants(&snapshot, root).into_iter().rev() {
        if protected.contains(&pid) {
            report.skipped.push(pid);
            continue;
        }
        match table.kill(pid) {
            Ok(()) => report.killed.push(pid),
            Err(err) => {
                debug!(pid, error = %err, "descendant could not be killed");
                report.failed.push((pid, err.to_string()));
            }
        }
    }

    table
        .kill(root)
        .map_err(|source| KillError::Signal { pid: root, source })?;
    report.killed.push(root);
    debug!(
        root,
        killed = report.killed.len(),
        failed = report.failed.len(),
        "process tree killed"
    );
    Ok(report)
}


#[cfg(test)]
mod tests {
    use super::fake::FakeTable;
    use super::*;

    // 100 -> 200 -> 300 -> 400, 100 -> 201, 900 unrelated
    fn sample() -> FakeTable {
        FakeTable::with_edges(&[(200, 100), (201, 100), (300, 200), (400, 300), (900, 800)])
    }

    #[test]
    fn descendants_are_breadth_first_and_exclude_root() {
        let table = sample();
        assert_eq!(descendants(&table.processes, 100), vec![200, 201, 300, 400]);
        assert_eq!(descendants(&table.processes, 400), Vec::<u32>::new());
        assert_eq!(process_tree(&table.processes, 300), vec![300, 400]);
    }

    #[test]
    fn descendants_survive_parent_cycles() {
        let snapshot = vec![
            ProcessInfo { pid: 10, parent: Some(11) },
            ProcessInfo { pid: 11, parent: Some(10) },
        ];
        assert_eq!(descendants(&snapshot, 10), vec![11]);
    }

    #[test]
    fn kills_whole_tree_root_last() {
        let table = sample();
        let report = kill_tree(&table, 100).unwrap();
        let attempts = table.attempts();
        assert_eq!(attempts.len(), 5);
        assert_eq!(attempts.last(), Some(&100));
        assert!(!attempts.contains(&900));
        assert_eq!(report.killed.len(), 5);
        assert!(report.failed.is_empty());
    }

    #[test]
    fn descendant_failures_do_not_abort() {
        let mut table = sample();
        table.failing = HashSet::from([200, 400]);
        let report = kill_tree(&table, 100).unwrap();
        assert_eq!(table.attempts().len(), 5);
        let failed: HashSet<u32> = report.failed.iter().map(|(pid, _)| *pid).collect();
        assert_eq!(failed, HashSet::from([200, 400]));
        assert_eq!(report.killed.last(), Some(&100));
    }

    #[test]
    fn root_failure_is_an_error_after_trying_everything() {
        let mut table = sample();
        table.failing = HashSet::from([100]);
        let err = kill_tree(&table, 100).unwrap_err();
        assert!(matches!(err, KillError::Signal { pid: 100, .. }));
        assert_eq!(table.attempts().len(), 5);
    }

    #[test]
    fn missing_root_is_not_found() {
        let table = sample();
        let err = kill_tree(&table, 12345).unwrap_err();
        assert!(matches!(err, KillError::NotFound { pid: 12345 }));
        assert!(table.attempts().is_empty());
    }

    #[test]
    fn refuses_own_process() {
        let me = std::process::id();
        let table = FakeTable::with_edges(&[(me, 2)]);
        let err = kill_tree(&table, me).unwrap_err();
        assert!(matches!(err, KillError::Protected { .. }));
        assert!(table.attempts().is_empty());
    }

    #[test]
    fn validates_pids() {
        assert!(validate_pid(0).is_err());
        assert!(validate_pid(1).is_err());
        assert!(validate_pid(10_000_001).is_err());
        assert_eq!(validate_pid(12345).unwrap(), 12345);
    }

    #[cfg(unix)]
    #[test]
    fn kills_real_process_tree() {
        use std::process::Command;
        use std::time::{Duration, Instant};

        let mut child = Command::new("sh")
            .args(["-c", "sleep 30 & sleep 30; wait"])
            .spawn()
            .unwrap();
        let root = child.id();
        let table = SystemProcessTable;

        let deadline = Instant::now() + Duration::from_secs(5);
        while descendants(&table.snapshot(), root).len() < 2 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(50));
        }
        let sleepers = descendants(&table.snapshot(), root);
        assert!(!sleepers.is_empty());

        let report = kill_tree(&table, root).unwrap();
        assert!(report.killed.contains(&root));
        let status = child.wait().unwrap();
        assert!(!status.success());
    }
}
