//! Process creation and output capture.
//!
//! A `Spawner` starts a dev command in a project directory and hands back a
//! `ProcessHandle`: the pid plus a channel carrying every output line and, last, the
//! exit notification. Reader tasks end on their own when the child closes its pipes.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::SpawnError;
use crate::output::StreamKind;
use crate::shell::{self, ShellCandidate};

/// How long the exit notification waits for readers still attached to a pipe that a
/// surviving grandchild keeps open.
const READER_DRAIN_GRACE: Duration = Duration::from_millis(500);

/// A command to start.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub command: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: HashMap<String, String>,
}

/// Something observed on a spawned process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    /// A complete line was read from one of the output streams.
    Output { stream: StreamKind, line: String },
    /// The process exited; `None` means it was terminated by a signal.
    Exited { code: Option<i32> },
    /// Waiting on the process failed.
    WaitFailed { error: String },
}

/// The preferred shell could not be started and another one was used instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellFallback {
    pub preferred: String,
    pub used: String,
    pub reason: String,
}

impl ShellFallback {
    pub fn message(&self) -> String {
        format!(
            "could not start {} ({}); using {} instead, environment and PATH may differ",
            self.preferred, self.reason, self.used
        )
    }
}

/// A running process and the channel carrying its output.
#[derive(Debug)]
pub struct ProcessHandle {
    pub pid: u32,
    pub fallback: Option<ShellFallback>,
    pub events: mpsc::Receiver<ProcessEvent>,
}

/// Starts processes. Must be called from within a Tokio runtime.
pub trait Spawner: Send + Sync {
    fn spawn(&self, spec: &LaunchSpec) -> Result<ProcessHandle, SpawnError>;
}

/// Runs the command itself, without a wrapping shell.
#[derive(Debug, Default, Clone, Copy)]
pub struct DirectSpawner;

impl Spawner for DirectSpawner {
    fn spawn(&self, spec: &LaunchSpec) -> Result<ProcessHandle, SpawnError> {
        let mut command = Command::new(&spec.command);
        command.args(&spec.args);
        let child = start(command, spec).map_err(|err| SpawnError::from_io(&spec.command, err))?;
        Ok(supervise(child, None))
    }
}

/// Runs the command through a login shell, falling back to other shells when the
/// preferred one cannot be started.
#[derive(Debug, Clone)]
pub struct ShellSpawner {
    candidates: Vec<ShellCandidate>,
}

impl ShellSpawner {
    /// Uses `preferred` (or `$SHELL`) first, then the platform fallbacks.
    pub fn new(preferred: Option<&str>) -> Self {
        Self::with_candidates(shell::shell_candidates(preferred))
    }

    pub fn with_candidates(candidates: Vec<ShellCandidate>) -> Self {
        Self { candidates }
    }
}

impl Spawner for ShellSpawner {
    fn spawn(&self, spec: &LaunchSpec) -> Result<ProcessHandle, SpawnError> {
        let mut first_failure: Option<(String, String)> = None;
        let mut tried = Vec::new();
        for candidate in &self.candidates {
            let mut command = Command::new(&candidate.program);
            command
                .args(&candidate.flags)
                .arg(candidate.script(&spec.command, &spec.args));
            match start(command, spec) {
                Ok(child) => {
                    let fallback = first_failure.map(|(preferred, reason)| ShellFallback {
                        preferred,
                        used: candidate.name().to_string(),
                        reason,
                    });
                    if let Some(fallback) = &fallback {
                        warn!(
                            preferred = %fallback.preferred,
                            used = %fallback.used,
                            "preferred shell unavailable, using fallback"
                        );
                    }
                    return Ok(supervise(child, fallback));
                }
                Err(err) => {
                    debug!(shell = %candidate.program, error = %err, "shell failed to start");
                    if first_failure.is_none() {
                        first_failure = Some((candidate.name().to_string(), err.to_string()));
                    }
                    tried.push(candidate.name().to_string());
                }
            }
        }
        Err(SpawnError::NoShell {
            command: shell::command_line(&spec.command, &spec.args),
            tried: tried.join(", "),
        })
    }
}

fn start(mut command: Command, spec: &LaunchSpec) -> std::io::Result<Child> {
    command.current_dir(&spec.cwd);
    if !spec.env.is_empty() {
        command.envs(&spec.env);
    }
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    command.kill_on_drop(true);

    #[cfg(windows)]
    {
        const CREATE_NEW_PROCESS_GROUP: u32 = 0x00000200;
        command.creation_flags(CREATE_NEW_PROCESS_GROUP);
    }

    // Own process group: a terminal Ctrl-C reaches only the supervisor, which then
    // stops each tree itself.
    #[cfg(unix)]
    unsafe {
        command.pre_exec(|| {
            let _ = libc::setpgid(0, 0);
            Ok(())
        });
    }

    command.spawn()
}

fn supervise(mut child: Child, fallback: Option<ShellFallback>) -> ProcessHandle {
    let pid = child.id().unwrap_or(0);
    let (tx, rx) = mpsc::channel(256);

    let mut readers: Vec<JoinHandle<()>> = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        readers.push(tokio::spawn(read_stream(StreamKind::Stdout, stdout, tx.clone())));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(tokio::spawn(read_stream(StreamKind::Stderr, stderr, tx.clone())));
    }

    tokio::spawn(async move {
        let status = child.wait().await;
        for reader in readers {
            let _ = tokio::time::timeout(READER_DRAIN_GRACE, reader).await;
        }
        let event = match status {
            Ok(status) => ProcessEvent::Exited {
                code: status.code(),
            },
            Err(err) => ProcessEvent::WaitFailed {
                error: err.to_string(),
            },
        };
        debug!(pid, ?event, "process finished");
        let _ = tx.send(event).await;
    });

    ProcessHandle {
        pid,
        fallback,
        events: rx,
    }
}

async fn read_stream<R>(stream: StreamKind, reader: R, tx: mpsc::Sender<ProcessEvent>)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if tx.send(ProcessEvent::Output { stream, line }).await.is_err() {
            break;
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn spec(command: &str, args: &[&str]) -> LaunchSpec {
        LaunchSpec {
            command: command.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            cwd: std::env::temp_dir(),
            env: HashMap::new(),
        }
    }

    async fn collect(mut handle: ProcessHandle) -> Vec<ProcessEvent> {
        let mut events = Vec::new();
        while let Some(event) = handle.events.recv().await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn missing_executable_is_a_spawn_error() {
        let err = DirectSpawner
            .spawn(&spec("devrack-definitely-not-installed", &["dev"]))
            .unwrap_err();
        assert!(matches!(err, SpawnError::NotFound { .. }));
    }

    #[tokio::test]
    async fn non_zero_exit_is_reported_after_spawn() {
        let handle = DirectSpawner.spawn(&spec("sh", &["-c", "exit 1"])).unwrap();
        assert!(handle.pid > 0);
        let events = collect(handle).await;
        assert_eq!(events.last(), Some(&ProcessEvent::Exited { code: Some(1) }));
    }

    #[tokio::test]
    async fn streams_lines_per_stream_in_order_before_exit() {
        let handle = DirectSpawner
            .spawn(&spec("sh", &["-c", "echo one; echo two; echo oops >&2"]))
            .unwrap();
        let events = collect(handle).await;

        let stdout: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                ProcessEvent::Output {
                    stream: StreamKind::Stdout,
                    line,
                } => Some(line.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(stdout, vec!["one", "two"]);
        assert!(events.contains(&ProcessEvent::Output {
            stream: StreamKind::Stderr,
            line: "oops".into()
        }));
        assert_eq!(events.last(), Some(&ProcessEvent::Exited { code: Some(0) }));
    }

    #[tokio::test]
    async fn runs_in_the_working_directory() {
        let dir = tempfile::tempdir().unwrap();
        let mut launch = spec("pwd", &[]);
        launch.cwd = dir.path().to_path_buf();
        let events = collect(DirectSpawner.spawn(&launch).unwrap()).await;
        let expected = dir.path().canonicalize().unwrap();
        let printed = events.iter().find_map(|e| match e {
            ProcessEvent::Output { line, .. } => Some(PathBuf::from(line)),
            _ => None,
        });
        assert_eq!(printed.map(|p| p.canonicalize().unwrap()), Some(expected));
    }

    #[tokio::test]
    async fn shell_fallback_is_reported() {
        let spawner = ShellSpawner::with_candidates(vec![
            ShellCandidate {
                program: "/nonexistent/bin/zsh".into(),
                flags: vec!["-l", "-c"],
                init: None,
            },
            ShellCandidate {
                program: "/bin/sh".into(),
                flags: vec!["-c"],
                init: None,
            },
        ]);
        let handle = spawner.spawn(&spec("echo", &["hello"])).unwrap();
        let fallback = handle.fallback.clone().unwrap();
        assert_eq!(fallback.preferred, "zsh");
        assert_eq!(fallback.used, "sh");
        assert!(fallback.message().contains("zsh"));

        let events = collect(handle).await;
        assert!(events.contains(&ProcessEvent::Output {
            stream: StreamKind::Stdout,
            line: "hello".into()
        }));
    }

    #[tokio::test]
    async fn preferred_shell_success_has_no_fallback() {
        let spawner = ShellSpawner::with_candidates(vec![ShellCandidate {
            program: "/bin/sh".into(),
            flags: vec!["-c"],
            init: None,
        }]);
        let handle = spawner.spawn(&spec("true", &[])).unwrap();
        assert!(handle.fallback.is_none());
    }

    #[tokio::test]
    async fn all_shells_failing_is_a_spawn_error() {
        let spawner = ShellSpawner::with_candidates(vec![ShellCandidate {
            program: "/nonexistent/bin/bash".into(),
            flags: vec!["-c"],
            init: None,
        }]);
        let err = spawner.spawn(&spec("npm", &["run", "dev"])).unwrap_err();
        assert!(matches!(err, SpawnError::NoShell { ref tried, .. } if tried == "bash"));
    }
}
