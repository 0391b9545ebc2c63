//! Event definitions for the runner event loop and its observers.
//!
//! `Event` is the internal message type: per-process forwarders and detection tasks
//! send it to the single task that owns the `ProjectRunner`. `Notification` is what the
//! runner emits outward for a presentation layer to render.

use std::path::PathBuf;

use serde::Serialize;

use crate::error::ErrorKind;
use crate::output::StreamKind;
use crate::project::ProjectStatus;

/// Represents an event in the runner's main event loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A line of output was received from a project's process.
    ProcessOutput {
        project: PathBuf,
        pid: u32,
        stream: StreamKind,
        line: String,
    },
    /// A project's process exited (None usually implies signal termination).
    ProcessExited {
        project: PathBuf,
        pid: u32,
        code: Option<i32>,
    },
    /// Waiting on a project's process failed.
    ProcessExitError {
        project: PathBuf,
        pid: u32,
        error: String,
    },
    /// Port detection for the process `pid` finished.
    PortDetected {
        project: PathBuf,
        pid: u32,
        port: Option<u16>,
    },
    /// Stop every project and leave the loop.
    Shutdown,
}

/// A message for the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum Notification {
    #[serde(rename_all = "camelCase")]
    ProcessStdout { project_path: PathBuf, content: String },
    #[serde(rename_all = "camelCase")]
    ProcessStderr { project_path: PathBuf, content: String },
    #[serde(rename_all = "camelCase")]
    ProcessExit {
        project_path: PathBuf,
        pid: u32,
        code: Option<i32>,
    },
    #[serde(rename_all = "camelCase")]
    ProcessExitError {
        project_path: PathBuf,
        pid: u32,
        error: String,
    },
    #[serde(rename_all = "camelCase")]
    ProcessShellFallback {
        project_path: PathBuf,
        preferred_shell: String,
        used_shell: String,
        message: String,
    },
    #[serde(rename_all = "camelCase")]
    ProcessStarted {
        project_path: PathBuf,
        pid: u32,
        command: String,
    },
    #[serde(rename_all = "camelCase")]
    ProcessError {
        project_path: PathBuf,
        kind: ErrorKind,
        message: String,
        hint: String,
    },
    #[serde(rename_all = "camelCase")]
    PortUpdate {
        project_path: PathBuf,
        port: Option<u16>,
    },
    #[serde(rename_all = "camelCase")]
    StatusChanged {
        project_path: PathBuf,
        status: ProjectStatus,
    },
}

impl Notification {
    pub fn project_path(&self) -> &PathBuf {
        match self {
            Notification::ProcessStdout { project_path, .. }
            | Notification::ProcessStderr { project_path, .. }
            | Notification::ProcessExit { project_path, .. }
            | Notification::ProcessExitError { project_path, .. }
            | Notification::ProcessShellFallback { project_path, .. }
            | Notification::ProcessStarted { project_path, .. }
            | Notification::ProcessError { project_path, .. }
            | Notification::PortUpdate { project_path, .. }
            | Notification::StatusChanged { project_path, .. } => project_path,
        }
    }

    /// Builds the error notification for a classified failure.
    pub fn error(project_path: PathBuf, kind: ErrorKind, message: impl Into<String>) -> Self {
        Notification::ProcessError {
            project_path,
            kind,
            message: message.into(),
            hint: kind.hint().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notifications_use_kebab_event_names_and_camel_fields() {
        let value = serde_json::to_value(Notification::ProcessShellFallback {
            project_path: PathBuf::from("/work/web"),
            preferred_shell: "zsh".into(),
            used_shell: "sh".into(),
            message: "fallback".into(),
        })
        .unwrap();
        assert_eq!(value["event"], "process-shell-fallback");
        assert_eq!(value["projectPath"], "/work/web");
        assert_eq!(value["preferredShell"], "zsh");
        assert_eq!(value["usedShell"], "sh");

        let value = serde_json::to_value(Notification::error(
            PathBuf::from("/work/web"),
            ErrorKind::PortInUse,
            "EADDRINUSE",
        ))
        .unwrap();
        assert_eq!(value["event"], "process-error");
        assert_eq!(value["kind"], "port_in_use");
        assert!(value["hint"].as_str().unwrap().contains("port"));

        let value = serde_json::to_value(Notification::StatusChanged {
            project_path: PathBuf::from("/work/web"),
            status: ProjectStatus::Running,
        })
        .unwrap();
        assert_eq!(value["event"], "status-changed");
        assert_eq!(value["status"], "running");
    }
}
