//! Error taxonomy for launching and stopping projects.
//!
//! OS-level failures are classified here, as close to the boundary as possible, into
//! the kinds reported to the user. `ErrorKind` is the serializable classification that
//! travels in notifications.

use std::io;
use std::path::PathBuf;
use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;
use thiserror::Error;

/// User-facing classification of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Spawn,
    UnsupportedRuntime,
    PortInUse,
    Permission,
    InvalidProject,
    NotFound,
}

impl ErrorKind {
    /// Guidance shown next to the error message.
    pub fn hint(self) -> &'static str {
        match self {
            ErrorKind::Spawn => "make sure the command is installed and available on PATH",
            ErrorKind::UnsupportedRuntime => "only Node.js, Deno and Bun projects can be launched",
            ErrorKind::PortInUse => {
                "another process is already listening on that port; stop it or free the port and start again"
            }
            ErrorKind::Permission => "the operating system denied the operation; check file and process permissions",
            ErrorKind::InvalidProject => "check that the project directory exists and is readable",
            ErrorKind::NotFound => "the process may already have exited",
        }
    }
}

/// Failure to create a process.
#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("command `{command}` was not found")]
    NotFound { command: String },
    #[error("permission denied while starting `{command}`")]
    PermissionDenied { command: String },
    #[error("failed to start `{command}`: {source}")]
    Io {
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("no usable shell could start `{command}` (tried {tried})")]
    NoShell { command: String, tried: String },
}

impl SpawnError {
    pub fn from_io(command: &str, err: io::Error) -> Self {
        let command = command.to_string();
        match err.kind() {
            io::ErrorKind::NotFound => SpawnError::NotFound { command },
            io::ErrorKind::PermissionDenied => SpawnError::PermissionDenied { command },
            _ => SpawnError::Io {
                command,
                source: err,
            },
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            SpawnError::PermissionDenied { .. } => ErrorKind::Permission,
            SpawnError::Io { source, .. } if source.kind() == io::ErrorKind::PermissionDenied => {
                ErrorKind::Permission
            }
            _ => ErrorKind::Spawn,
        }
    }
}

/// Failure to terminate a process or process tree.
#[derive(Debug, Error)]
pub enum KillError {
    #[error("invalid pid {pid}: {reason}")]
    InvalidPid { pid: u32, reason: &'static str },
    #[error("process {pid} does not exist")]
    NotFound { pid: u32 },
    #[error("refusing to kill process {pid}: it is this supervisor or one of its ancestors")]
    Protected { pid: u32 },
    #[error("failed to signal process {pid}: {source}")]
    Signal {
        pid: u32,
        #[source]
        source: io::Error,
    },
    #[error("failed to read the listening socket table: {0}")]
    Probe(#[source] io::Error),
}

impl KillError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            KillError::NotFound { .. } => ErrorKind::NotFound,
            KillError::Signal { source, .. }
                if source.kind() == io::ErrorKind::PermissionDenied =>
            {
                ErrorKind::Permission
            }
            KillError::Protected { .. } | KillError::Signal { .. } => ErrorKind::Permission,
            KillError::InvalidPid { .. } | KillError::Probe(_) => ErrorKind::NotFound,
        }
    }
}

/// Failure to launch a project.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("unsupported runtime `{0}`")]
    UnsupportedRuntime(String),
    #[error("unknown project {}", .0.display())]
    UnknownProject(PathBuf),
    #[error("invalid project directory {}: {reason}", .path.display())]
    InvalidDirectory { path: PathBuf, reason: String },
    #[error(transparent)]
    Spawn(#[from] SpawnError),
}

impl RunError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RunError::UnsupportedRuntime(_) => ErrorKind::UnsupportedRuntime,
            RunError::UnknownProject(_) | RunError::InvalidDirectory { .. } => {
                ErrorKind::InvalidProject
            }
            RunError::Spawn(err) => err.kind(),
        }
    }
}

fn port_in_use_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            Regex::new(r"(?i)EADDRINUSE|address already in use|port \d+ is (already )?in use").ok()
        })
        .as_ref()
}

fn permission_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"EACCES|(?i)permission denied").ok())
        .as_ref()
}

/// Classifies a line of process output that reports a known failure.
pub fn classify_output_line(line: &str) -> Option<ErrorKind> {
    if port_in_use_pattern().is_some_and(|re| re.is_match(line)) {
        Some(ErrorKind::PortInUse)
    } else if permission_pattern().is_some_and(|re| re.is_match(line)) {
        Some(ErrorKind::Permission)
    } else {
        None
    }
}

/// Classifies a shell exit code that means the command never ran.
pub fn classify_exit_code(code: Option<i32>) -> Option<ErrorKind> {
    match code {
        Some(127) => Some(ErrorKind::Spawn),
        Some(126) => Some(ErrorKind::Permission),
        _ => None,
    }
}
