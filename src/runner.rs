//! Project orchestration.
//!
//! This module contains the `ProjectRunner`, which owns every piece of mutable
//! supervision state (known projects, the process registry, the log store) and drives
//! each project through `Stopped -> Starting -> Running -> Stopped`. Spawned processes
//! and port-detection tasks never touch that state directly: they send `Event`s to the
//! task owning the runner, which applies them one at a time.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::command::{self, ResolvedCommand};
use crate::error::{self, KillError, RunError};
use crate::events::{Event, Notification};
use crate::output::{LogEntry, LogStore, StreamKind, DEFAULT_MAX_ENTRIES};
use crate::ports::{self, DetectionPolicy, ListenerProbe, PortFallback};
use crate::project::{self, Project, ProjectStatus};
use crate::registry::ProcessRegistry;
use crate::spawner::{LaunchSpec, ProcessEvent, ProcessHandle, Spawner};
use crate::tree::{self, ProcessTable};

/// Which kill paths a stop request runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum StopStrategy {
    /// Kill the process tree, then whatever still holds the known port.
    #[default]
    PidAndPort,
    /// Kill by port only when there is no pid or the tree kill failed.
    PortOnFailure,
}

/// Tunables of the runner.
#[derive(Debug, Clone, Copy)]
pub struct RunnerSettings {
    pub max_log_entries: usize,
    pub detection: DetectionPolicy,
    pub port_fallback: PortFallback,
    pub stop_strategy: StopStrategy,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            max_log_entries: DEFAULT_MAX_ENTRIES,
            detection: DetectionPolicy::AFTER_LAUNCH,
            port_fallback: PortFallback::default(),
            stop_strategy: StopStrategy::default(),
        }
    }
}

/// Launches, tracks and stops project dev servers.
pub struct ProjectRunner {
    projects: HashMap<PathBuf, Project>,
    registry: ProcessRegistry,
    logs: LogStore,
    spawner: Arc<dyn Spawner>,
    table: Arc<dyn ProcessTable>,
    probe: Arc<dyn ListenerProbe>,
    settings: RunnerSettings,
    event_tx: mpsc::Sender<Event>,
    notify_tx: mpsc::Sender<Notification>,
}

impl ProjectRunner {
    /// Creates a runner. Events for the loop owning it are sent on `event_tx`;
    /// notifications for observers on `notify_tx`.
    pub fn new(
        spawner: Arc<dyn Spawner>,
        table: Arc<dyn ProcessTable>,
        probe: Arc<dyn ListenerProbe>,
        settings: RunnerSettings,
        event_tx: mpsc::Sender<Event>,
        notify_tx: mpsc::Sender<Notification>,
    ) -> Self {
        Self {
            projects: HashMap::new(),
            registry: ProcessRegistry::new(),
            logs: LogStore::new(settings.max_log_entries),
            spawner,
            table,
            probe,
            settings,
            event_tx,
            notify_tx,
        }
    }

    /// Replaces the known projects with a fresh scan.
    ///
    /// Every port is cleared. Projects that are still running keep their record even
    /// when the scan no longer reports them, so they can still be stopped.
    pub fn load_projects(&mut self, projects: Vec<Project>) {
        let mut previous = std::mem::take(&mut self.projects);
        for project in projects {
            self.add_project(project);
        }
        for path in self.registry.projects() {
            if let Some(mut project) = previous.remove(path) {
                if !self.projects.contains_key(path) {
                    project.port = None;
                    project.detected_port = None;
                    self.projects.insert(path.to_path_buf(), project);
                }
            }
        }
    }

    pub fn add_project(&mut self, mut project: Project) {
        project.port = None;
        project.detected_port = None;
        self.projects.insert(project.path.clone(), project);
    }

    pub fn project(&self, path: &Path) -> Option<&Project> {
        self.projects.get(path)
    }

    pub fn status(&self, path: &Path) -> ProjectStatus {
        if self.is_running(path) {
            ProjectStatus::Running
        } else {
            ProjectStatus::Stopped
        }
    }

    pub fn is_running(&self, path: &Path) -> bool {
        self.registry.contains(path)
    }

    pub fn has_running(&self) -> bool {
        !self.registry.is_empty()
    }

    /// Captured output of a project, oldest first.
    pub fn logs(&self, path: &Path) -> impl Iterator<Item = &LogEntry> {
        self.logs.entries(path)
    }

    /// Returns the command `run_project` would launch for `path`.
    pub fn planned_command(&self, path: &Path) -> Result<ResolvedCommand, RunError> {
        let project = self
            .projects
            .get(path)
            .ok_or_else(|| RunError::UnknownProject(path.to_path_buf()))?;
        launch_command(project)
    }

    /// Launches the project's dev server.
    ///
    /// Returns `Ok(false)` without spawning when the project is already running.
    /// Launch failures are also reported as a `process-error` notification and leave
    /// the project stopped.
    pub async fn run_project(&mut self, path: &Path) -> Result<bool, RunError> {
        let Some(project) = self.projects.get(path).cloned() else {
            return Err(RunError::UnknownProject(path.to_path_buf()));
        };
        if self.registry.contains(path) {
            debug!(project = %path.display(), "already running, launch ignored");
            return Ok(false);
        }

        self.logs.clear(path);
        self.set_port(path, None).await;
        self.notify_status(path, ProjectStatus::Starting).await;

        let (command, handle) = match self.launch(&project) {
            Ok(launched) => launched,
            Err(err) => {
                warn!(project = %path.display(), error = %err, "launch failed");
                self.logs
                    .append(path, StreamKind::Stderr, format!("Failed to start: {err}"));
                self.notify(Notification::error(path.to_path_buf(), err.kind(), err.to_string()))
                    .await;
                self.notify_status(path, ProjectStatus::Stopped).await;
                return Err(err);
            }
        };

        let pid = handle.pid;
        self.registry.record(path, pid);
        info!(project = %path.display(), pid, command = %command, "dev server started");

        if let Some(fallback) = &handle.fallback {
            let message = fallback.message();
            self.logs.append(path, StreamKind::Stderr, message.clone());
            self.notify(Notification::ProcessShellFallback {
                project_path: path.to_path_buf(),
                preferred_shell: fallback.preferred.clone(),
                used_shell: fallback.used.clone(),
                message,
            })
            .await;
        }
        self.logs.append(
            path,
            StreamKind::Stdout,
            format!("Starting {} with `{command}` (pid {pid})", project.name),
        );
        self.notify(Notification::ProcessStarted {
            project_path: path.to_path_buf(),
            pid,
            command: command.to_string(),
        })
        .await;
        self.notify_status(path, ProjectStatus::Running).await;

        tokio::spawn(forward_process_events(
            path.to_path_buf(),
            pid,
            handle,
            self.event_tx.clone(),
        ));
        self.spawn_port_detection(path.to_path_buf(), pid);
        Ok(true)
    }

    fn launch(&self, project: &Project) -> Result<(ResolvedCommand, ProcessHandle), RunError> {
        let command = launch_command(project)?;
        let cwd = project::validate_project_dir(&project.path)?;
        let spec = LaunchSpec {
            command: command.program.clone(),
            args: command.args.clone(),
            cwd,
            env: project.env.clone(),
        };
        let handle = self.spawner.spawn(&spec)?;
        Ok((command, handle))
    }

    fn spawn_port_detection(&self, project: PathBuf, pid: u32) {
        let probe = Arc::clone(&self.probe);
        let table = Arc::clone(&self.table);
        let policy = self.settings.detection;
        let tx = self.event_tx.clone();
        tokio::spawn(async move {
            let port = ports::detect_port(probe, table, pid, policy).await;
            let _ = tx.send(Event::PortDetected { project, pid, port }).await;
        });
    }

    /// Stops the project's process tree and clears its running state.
    ///
    /// The registry entry, running status and port are cleared whether or not the
    /// kills succeed. The returned error only reports that nothing could be killed.
    pub async fn stop_project(&mut self, path: &Path) -> Result<(), KillError> {
        let pid = self.registry.lookup(path);
        let port = self.projects.get(path).and_then(|project| project.detected_port);

        let mut outcome = Ok(());
        let mut tree_killed = false;
        if let Some(pid) = pid {
            let table = Arc::clone(&self.table);
            let result = tokio::task::spawn_blocking(move || tree::kill_tree(&*table, pid))
                .await
                .unwrap_or_else(|err| {
                    Err(KillError::Signal {
                        pid,
                        source: std::io::Error::other(err.to_string()),
                    })
                });
            match result {
                Ok(report) => {
                    tree_killed = true;
                    debug!(
                        project = %path.display(),
                        pid,
                        killed = report.killed.len(),
                        failed = report.failed.len(),
                        "process tree stopped"
                    );
                }
                Err(err) => {
                    warn!(project = %path.display(), pid, error = %err, "failed to kill process tree");
                    outcome = Err(err);
                }
            }
        }

        let kill_port = match self.settings.stop_strategy {
            StopStrategy::PidAndPort => true,
            StopStrategy::PortOnFailure => !tree_killed,
        };
        if let (true, Some(port)) = (kill_port, port) {
            let probe = Arc::clone(&self.probe);
            let table = Arc::clone(&self.table);
            let result =
                tokio::task::spawn_blocking(move || ports::kill_by_port(&*probe, &*table, port))
                    .await
                    .unwrap_or_else(|err| Err(KillError::Probe(std::io::Error::other(err.to_string()))));
            match result {
                Ok(killed) if !killed.is_empty() => {
                    debug!(project = %path.display(), port, ?killed, "port owners stopped");
                    outcome = Ok(());
                }
                Ok(_) => {}
                Err(err) => warn!(project = %path.display(), port, error = %err, "failed to kill by port"),
            }
        }

        self.mark_stopped(path).await;
        if let Err(err) = &outcome {
            self.notify(Notification::error(path.to_path_buf(), err.kind(), err.to_string()))
                .await;
        }
        outcome
    }

    /// Stops every running project.
    pub async fn stop_all(&mut self) {
        let running: Vec<PathBuf> = self.registry.projects().map(Path::to_path_buf).collect();
        for path in running {
            if let Err(err) = self.stop_project(&path).await {
                debug!(project = %path.display(), error = %err, "stop during shutdown failed");
            }
        }
    }

    /// Applies one event from a process forwarder or detection task.
    pub async fn handle_event(&mut self, event: Event) {
        match event {
            Event::ProcessOutput {
                project,
                pid,
                stream,
                line,
            } => {
                if self.registry.lookup(&project).is_some_and(|current| current != pid) {
                    return;
                }
                self.logs.append(&project, stream, line.clone());
                if let Some(kind) = error::classify_output_line(&line) {
                    self.notify(Notification::error(project.clone(), kind, line.clone()))
                        .await;
                }
                let notification = match stream {
                    StreamKind::Stdout => Notification::ProcessStdout {
                        project_path: project,
                        content: line,
                    },
                    StreamKind::Stderr => Notification::ProcessStderr {
                        project_path: project,
                        content: line,
                    },
                };
                self.notify(notification).await;
            }
            Event::ProcessExited { project, pid, code } => {
                let message = match code {
                    Some(code) => format!("Process {pid} exited with code {code}"),
                    None => format!("Process {pid} was terminated by a signal"),
                };
                let uptime = self
                    .registry
                    .get(&project)
                    .filter(|record| record.pid == pid)
                    .map(|record| record.started_at.elapsed());
                info!(project = %project.display(), pid, ?code, ?uptime, "process exited");
                if let Some(kind) = error::classify_exit_code(code) {
                    self.notify(Notification::error(project.clone(), kind, message.clone()))
                        .await;
                }
                self.notify(Notification::ProcessExit {
                    project_path: project.clone(),
                    pid,
                    code,
                })
                .await;
                if self.registry.lookup(&project) == Some(pid) {
                    self.logs.append(&project, StreamKind::Stdout, message);
                    self.mark_stopped(&project).await;
                }
            }
            Event::ProcessExitError {
                project,
                pid,
                error,
            } => {
                warn!(project = %project.display(), pid, error = %error, "waiting on process failed");
                self.notify(Notification::ProcessExitError {
                    project_path: project.clone(),
                    pid,
                    error,
                })
                .await;
                if self.registry.lookup(&project) == Some(pid) {
                    self.mark_stopped(&project).await;
                }
            }
            Event::PortDetected { project, pid, port } => {
                if self.registry.lookup(&project) != Some(pid) {
                    debug!(project = %project.display(), pid, ?port, "discarding stale port detection");
                    return;
                }
                let Some(known) = self.projects.get_mut(&project) else {
                    return;
                };
                known.detected_port = port;
                let framework = known.framework.clone();
                let port = self
                    .settings
                    .port_fallback
                    .apply(port, framework.as_deref());
                let line = match port {
                    Some(port) => format!("Listening on port {port}"),
                    None => "Could not detect a listening port".to_string(),
                };
                self.logs.append(&project, StreamKind::Stdout, line);
                self.set_port(&project, port).await;
            }
            Event::Shutdown => self.stop_all().await,
        }
    }

    async fn mark_stopped(&mut self, path: &Path) {
        self.registry.remove(path);
        self.set_port(path, None).await;
        self.notify_status(path, ProjectStatus::Stopped).await;
    }

    async fn set_port(&mut self, path: &Path, port: Option<u16>) {
        let Some(project) = self.projects.get_mut(path) else {
            return;
        };
        if port.is_none() {
            project.detected_port = None;
        }
        if project.port == port {
            return;
        }
        project.port = port;
        self.notify(Notification::PortUpdate {
            project_path: path.to_path_buf(),
            port,
        })
        .await;
    }

    async fn notify_status(&self, path: &Path, status: ProjectStatus) {
        self.notify(Notification::StatusChanged {
            project_path: path.to_path_buf(),
            status,
        })
        .await;
    }

    async fn notify(&self, notification: Notification) {
        let _ = self.notify_tx.send(notification).await;
    }
}

/// Resolves the project's command, adding `--port` when its dev script allows it.
fn launch_command(project: &Project) -> Result<ResolvedCommand, RunError> {
    let command = command::resolve_command(project)?;
    let Some(port) = project.preferred_port else {
        return Ok(command);
    };
    let script = project.dev_script().unwrap_or_default();
    if command::can_safely_inject_port_flag(project.framework.as_deref(), &script) {
        Ok(command.with_port_flag(port))
    } else {
        debug!(project = %project.path.display(), "dev script too complex for a port flag");
        Ok(command)
    }
}

async fn forward_process_events(
    project: PathBuf,
    pid: u32,
    mut handle: ProcessHandle,
    tx: mpsc::Sender<Event>,
) {
    while let Some(event) = handle.events.recv().await {
        let event = match event {
            ProcessEvent::Output { stream, line } => Event::ProcessOutput {
                project: project.clone(),
                pid,
                stream,
                line,
            },
            ProcessEvent::Exited { code } => Event::ProcessExited {
                project: project.clone(),
                pid,
                code,
            },
            ProcessEvent::WaitFailed { error } => Event::ProcessExitError {
                project: project.clone(),
                pid,
                error,
            },
        };
        if tx.send(event).await.is_err() {
            break;
        }
    }
}
