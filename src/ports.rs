//! Listening-port discovery.
//!
//! A dev server never tells us which port it picked. The detector polls the OS
//! socket table for TCP listeners owned by the spawned process or any of its
//! descendants, with caller-supplied retry policy, until one shows up.

use std::collections::HashSet;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, info};

use crate::error::KillError;
use crate::tree::{self, ProcessTable};

/// A TCP socket in the LISTEN state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Listener {
    pub port: u16,
    pub pid: u32,
}

/// Access to the OS table of listening sockets.
pub trait ListenerProbe: Send + Sync {
    fn listeners(&self) -> io::Result<Vec<Listener>>;
}

/// Reads the real socket table of this machine.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemListenerProbe;

impl ListenerProbe for SystemListenerProbe {
    fn listeners(&self) -> io::Result<Vec<Listener>> {
        system_listeners()
    }
}

/// Retry policy for one detection call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DetectionPolicy {
    pub attempts: u32,
    pub initial_delay: Duration,
    pub interval: Duration,
}

impl DetectionPolicy {
    /// Patient policy used right after a launch.
    pub const AFTER_LAUNCH: DetectionPolicy = DetectionPolicy {
        attempts: 15,
        initial_delay: Duration::from_millis(1500),
        interval: Duration::from_millis(1000),
    };

    /// Quick policy for an on-demand lookup.
    pub const QUICK: DetectionPolicy = DetectionPolicy {
        attempts: 3,
        initial_delay: Duration::ZERO,
        interval: Duration::from_millis(500),
    };

    pub fn new(attempts: u32, initial_delay: Duration, interval: Duration) -> Self {
        Self {
            attempts,
            initial_delay,
            interval,
        }
    }
}

/// What to report when detection finds nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum PortFallback {
    /// Leave the port unknown.
    #[default]
    Unknown,
    /// Assume the framework's default port.
    FrameworkDefault,
}

impl PortFallback {
    pub fn apply(self, detected: Option<u16>, framework: Option<&str>) -> Option<u16> {
        match (detected, self) {
            (Some(port), _) => Some(port),
            (None, PortFallback::Unknown) => None,
            (None, PortFallback::FrameworkDefault) => Some(default_port(framework)),
        }
    }
}

/// Port a framework's dev server binds when nothing else is configured.
pub fn default_port(framework: Option<&str>) -> u16 {
    match framework.map(str::to_ascii_lowercase).as_deref() {
        Some("astro") => 4321,
        Some("vite") | Some("sveltekit") => 5173,
        Some("deno") => 8000,
        Some("nextjs") | Some("react") | Some("nuxt") => 3000,
        _ => 3000,
    }
}

/// Picks the listener of the earliest process in `tree` order, lowest port first.
pub fn select_port(listeners: &[Listener], tree: &[u32]) -> Option<u16> {
    tree.iter().find_map(|pid| {
        listeners
            .iter()
            .filter(|listener| listener.pid == *pid && listener.port > 0)
            .map(|listener| listener.port)
            .min()
    })
}

fn poll_once(probe: &dyn ListenerProbe, table: &dyn ProcessTable, pid: u32) -> Option<u16> {
    let listeners = match probe.listeners() {
        Ok(listeners) => listeners,
        Err(err) => {
            debug!(pid, error = %err, "socket table unavailable");
            return None;
        }
    };
    if listeners.is_empty() {
        return None;
    }
    let tree = tree::process_tree(&table.snapshot(), pid);
    select_port(&listeners, &tree)
}

/// Polls for the first port bound by `pid` or any of its descendants.
///
/// Returns `None` once the attempts are exhausted. Not finding a port is an
/// expected outcome and never an error.
pub async fn detect_port(
    probe: Arc<dyn ListenerProbe>,
    table: Arc<dyn ProcessTable>,
    pid: u32,
    policy: DetectionPolicy,
) -> Option<u16> {
    if tree::validate_pid(pid).is_err() {
        return None;
    }
    if !policy.initial_delay.is_zero() {
        tokio::time::sleep(policy.initial_delay).await;
    }
    for attempt in 1..=policy.attempts {
        let probe = Arc::clone(&probe);
        let table = Arc::clone(&table);
        let found = tokio::task::spawn_blocking(move || poll_once(&*probe, &*table, pid))
            .await
            .unwrap_or(None);
        if let Some(port) = found {
            debug!(pid, port, attempt, "listening port detected");
            return Some(port);
        }
        if attempt < policy.attempts {
            tokio::time::sleep(policy.interval).await;
        }
    }
    info!(pid, attempts = policy.attempts, "no listening port detected");
    None
}

/// Kills whatever processes currently listen on `port`.
///
/// Returns the pids that were signalled; an unused port yields an empty list.
pub fn kill_by_port(
    probe: &dyn ListenerProbe,
    table: &dyn ProcessTable,
    port: u16,
) -> Result<Vec<u32>, KillError> {
    let owners: HashSet<u32> = probe
        .listeners()
        .map_err(KillError::Probe)?
        .into_iter()
        .filter(|listener| listener.port == port)
        .map(|listener| listener.pid)
        .collect();
    if owners.is_empty() {
        return Ok(Vec::new());
    }
    let protected = tree::protected_pids(&table.snapshot());
    let mut killed = Vec::new();
    for pid in owners {
        if protected.contains(&pid) || tree::validate_pid(pid).is_err() {
            debug!(pid, port, "skipping protected port owner");
            continue;
        }
        match table.kill(pid) {
            Ok(()) => killed.push(pid),
            Err(err) => debug!(pid, port, error = %err, "port owner could not be killed"),
        }
    }
    killed.sort_unstable();
    Ok(killed)
}

#[cfg(target_os = "linux")]
fn system_listeners() -> io::Result<Vec<Listener>> {
    use std::collections::HashMap;

    let mut inodes: HashMap<u64, u16> = HashMap::new();
    let mut readable = false;
    for table in ["/proc/net/tcp", "/proc/net/tcp6"] {
        if let Ok(content) = std::fs::read_to_string(table) {
            readable = true;
            inodes.extend(parse_proc_net_tcp(&content));
        }
    }
    if !readable {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            "/proc/net/tcp is not readable",
        ));
    }
    if inodes.is_empty() {
        return Ok(Vec::new());
    }

    let mut listeners = HashSet::new();
    for entry in std::fs::read_dir("/proc")?.flatten() {
        let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) else {
            continue;
        };
        let Ok(fds) = std::fs::read_dir(entry.path().join("fd")) else {
            continue;
        };
        for fd in fds.flatten() {
            let Ok(target) = std::fs::read_link(fd.path()) else {
                continue;
            };
            let Some(inode) = target
                .to_str()
                .and_then(|t| t.strip_prefix("socket:["))
                .and_then(|t| t.strip_suffix(']'))
                .and_then(|t| t.parse::<u64>().ok())
            else {
                continue;
            };
            if let Some(&port) = inodes.get(&inode) {
                listeners.insert(Listener { port, pid });
            }
        }
    }
    Ok(listeners.into_iter().collect())
}

/// Parses `/proc/net/tcp{,6}` into `(inode, port)` pairs for sockets in LISTEN state.
#[cfg(target_os = "linux")]
fn parse_proc_net_tcp(content: &str) -> Vec<(u64, u16)> {
    const TCP_LISTEN: &str = "0A";
    content
        .lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 10 || fields[3] != TCP_LISTEN {
                return None;
            }
            let port_hex = fields[1].rsplit(':').next()?;
            let port = u16::from_str_radix(port_hex, 16).ok()?;
            let inode = fields[9].parse::<u64>().ok()?;
            (inode != 0).then_some((inode, port))
        })
        .collect()
}

#[cfg(all(unix, not(target_os = "linux")))]
fn system_listeners() -> io::Result<Vec<Listener>> {
    let output = std::process::Command::new("lsof")
        .args(["-nP", "-iTCP", "-sTCP:LISTEN", "-F", "pn"])
        .output()?;
    // lsof exits 1 when nothing matches.
    Ok(parse_lsof_fields(&String::from_utf8_lossy(&output.stdout)))
}

/// Parses `lsof -F pn` output: `p<pid>` starts a process, `n<addr>:<port>` names a socket.
#[cfg(all(unix, not(target_os = "linux")))]
fn parse_lsof_fields(content: &str) -> Vec<Listener> {
    let mut listeners = Vec::new();
    let mut current_pid = None;
    for line in content.lines() {
        if let Some(pid) = line.strip_prefix('p') {
            current_pid = pid.trim().parse::<u32>().ok();
        } else if let (Some(name), Some(pid)) = (line.strip_prefix('n'), current_pid) {
            if let Some(port) = name.rsplit(':').next().and_then(|p| p.parse::<u16>().ok()) {
                let listener = Listener { port, pid };
                if !listeners.contains(&listener) {
                    listeners.push(listener);
                }
            }
        }
    }
    listeners
}

#[cfg(windows)]
fn system_listeners() -> io::Result<Vec<Listener>> {
    let output = std::process::Command::new("netstat")
        .args(["-ano", "-p", "TCP"])
        .output()?;
    let mut listeners = parse_netstat(&String::from_utf8_lossy(&output.stdout));
    let output_v6 = std::process::Command::new("netstat")
        .args(["-ano", "-p", "TCPv6"])
        .output()?;
    for listener in parse_netstat(&String::from_utf8_lossy(&output_v6.stdout)) {
        if !listeners.contains(&listener) {
            listeners.push(listener);
        }
    }
    Ok(listeners)
}

/// Parses `netstat -ano` rows such as `TCP 0.0.0.0:3000 0.0.0.0:0 LISTENING 1234`.
#[cfg(windows)]
fn parse_netstat(content: &str) -> Vec<Listener> {
    content
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 5 || !fields[0].eq_ignore_ascii_case("TCP") || fields[3] != "LISTENING" {
                return None;
            }
            let port = fields[1].rsplit(':').next()?.parse::<u16>().ok()?;
            let pid = fields[4].parse::<u32>().ok()?;
            Some(Listener { port, pid })
        })
        .collect()
}

#[cfg(not(any(unix, windows)))]
fn system_listeners() -> io::Result<Vec<Listener>> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "socket inspection is not supported on this platform",
    ))
}

#[cfg(test)]
pub(crate) mod fake {
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use super::{Listener, ListenerProbe};

    /// Probe returning a fixed listener table and counting polls.
    #[derive(Debug, Default)]
    pub struct FakeProbe {
        pub listeners: Mutex<Vec<Listener>>,
        pub polls: AtomicUsize,
    }

    impl FakeProbe {
        pub fn with(listeners: Vec<Listener>) -> Self {
            Self {
                listeners: Mutex::new(listeners),
                polls: AtomicUsize::new(0),
            }
        }

        pub fn polls(&self) -> usize {
            self.polls.load(Ordering::SeqCst)
        }
    }

    impl ListenerProbe for FakeProbe {
        fn listeners(&self) -> io::Result<Vec<Listener>> {
            self.polls.fetch_add(1, Ordering::SeqCst);
            Ok(self.listeners.lock().map(|l| l.clone()).unwrap_or_default())
        }
    }
}
