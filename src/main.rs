//! devrack: launch and supervise local JavaScript dev servers.
//!
//! This is the entry point of the application. It parses command-line arguments,
//! loads configuration, and runs the event loop that owns the `ProjectRunner`.

mod command;
mod config;
mod error;
mod events;
mod output;
mod ports;
mod project;
mod registry;
mod runner;
mod shell;
mod spawner;
mod tree;

use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::builder::styling::{AnsiColor, Effects, Style};
use clap::builder::Styles;
use clap::{Args, Parser, Subcommand};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

use crate::config::{Config, LaunchMode};
use crate::events::{Event, Notification};
use crate::output::{sanitize_text, DEFAULT_MAX_ENTRIES};
use crate::ports::{DetectionPolicy, PortFallback, SystemListenerProbe};
use crate::project::{Project, Runtime};
use crate::runner::{ProjectRunner, RunnerSettings, StopStrategy};
use crate::spawner::{DirectSpawner, ShellSpawner, Spawner};
use crate::tree::SystemProcessTable;

/// Command-line interface definition.
#[derive(Debug, Parser)]
#[command(
    name = "devrack",
    version,
    about = "Launch local dev servers, find their ports, stop their process trees",
    styles = help_styles(),
    disable_help_subcommand = true
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
    /// Path to devrack.toml configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Ignore any devrack.toml in the current directory.
    #[arg(long, global = true)]
    no_config: bool,
    /// Enable debug logging on stderr.
    #[arg(long, short, global = true)]
    verbose: bool,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Launch the dev server of each project and stream its output.
    Run(RunArgs),
    /// Find the TCP port a process or one of its descendants listens on.
    DetectPort {
        pid: u32,
        #[arg(long)]
        attempts: Option<u32>,
        #[arg(long)]
        initial_delay_ms: Option<u64>,
        #[arg(long)]
        interval_ms: Option<u64>,
        /// Print a JSON object instead of plain text.
        #[arg(long)]
        json: bool,
    },
    /// Kill a process and all of its descendants.
    KillTree {
        pid: u32,
        #[arg(long)]
        json: bool,
    },
    /// Kill whatever process listens on a TCP port.
    KillPort {
        port: u16,
        #[arg(long)]
        json: bool,
    },
}

#[derive(Debug, Args)]
struct RunArgs {
    /// Project directories to launch in addition to those in devrack.toml.
    paths: Vec<PathBuf>,
    /// Runtime of the projects given as paths ("Node.js", "Deno", "Bun").
    #[arg(long, default_value = "Node.js")]
    runtime: String,
    /// Package manager of the projects given as paths.
    #[arg(long)]
    package_manager: Option<String>,
    /// Framework of the projects given as paths.
    #[arg(long)]
    framework: Option<String>,
    /// Port requested from the dev server when its script allows it.
    #[arg(long)]
    port: Option<u16>,
    /// Print notifications as JSON lines.
    #[arg(long)]
    json: bool,
    /// Remove ANSI escape codes from process output.
    #[arg(long)]
    strip_ansi: bool,
    /// Print the commands that would run and exit.
    #[arg(long)]
    dry_run: bool,
    /// Max log entries kept per project.
    #[arg(long)]
    max_log_entries: Option<usize>,
    /// Preferred shell for launching dev commands.
    #[arg(long)]
    shell: Option<String>,
    /// Run dev commands directly instead of through a login shell.
    #[arg(long)]
    direct: bool,
    /// What to report when no port is detected.
    #[arg(long, value_enum)]
    port_fallback: Option<PortFallback>,
    /// Which kill paths a stop runs.
    #[arg(long, value_enum)]
    stop_strategy: Option<StopStrategy>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            if cli.verbose {
                EnvFilter::new("debug")
            } else {
                EnvFilter::new("warn")
            }
        }))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Run(args) => {
            let config = load_config(cli.config.as_deref(), cli.no_config)?;
            run(config, args).await
        }
        Commands::DetectPort {
            pid,
            attempts,
            initial_delay_ms,
            interval_ms,
            json,
        } => {
            tree::validate_pid(pid)?;
            let quick = DetectionPolicy::QUICK;
            let policy = DetectionPolicy::new(
                attempts.unwrap_or(quick.attempts),
                initial_delay_ms
                    .map(Duration::from_millis)
                    .unwrap_or(quick.initial_delay),
                interval_ms
                    .map(Duration::from_millis)
                    .unwrap_or(quick.interval),
            );
            let port = ports::detect_port(
                Arc::new(SystemListenerProbe),
                Arc::new(SystemProcessTable),
                pid,
                policy,
            )
            .await;
            if json {
                println!("{}", serde_json::json!({ "pid": pid, "port": port }));
            } else {
                match port {
                    Some(port) => println!("{port}"),
                    None => println!("unknown"),
                }
            }
            Ok(())
        }
        Commands::KillTree { pid, json } => {
            let report =
                tokio::task::spawn_blocking(move || tree::kill_tree(&SystemProcessTable, pid))
                    .await
                    .context("kill task panicked")??;
            if json {
                let failed: Vec<_> = report
                    .failed
                    .iter()
                    .map(|(pid, error)| serde_json::json!({ "pid": pid, "error": error }))
                    .collect();
                println!(
                    "{}",
                    serde_json::json!({
                        "killed": report.killed,
                        "failed": failed,
                        "skipped": report.skipped,
                    })
                );
            } else {
                println!("killed {} process(es)", report.killed.len());
                for (pid, error) in &report.failed {
                    println!("  could not kill {pid}: {error}");
                }
            }
            Ok(())
        }
        Commands::KillPort { port, json } => {
            let killed = tokio::task::spawn_blocking(move || {
                ports::kill_by_port(&SystemListenerProbe, &SystemProcessTable, port)
            })
            .await
            .context("kill task panicked")??;
            if json {
                println!("{}", serde_json::json!({ "port": port, "killed": killed }));
            } else if killed.is_empty() {
                println!("no process is listening on port {port}");
            } else {
                let pids: Vec<String> = killed.iter().map(u32::to_string).collect();
                println!("killed {} on port {port}", pids.join(", "));
            }
            Ok(())
        }
    }
}

async fn run(loaded: Option<(Config, PathBuf)>, args: RunArgs) -> Result<()> {
    let (config, base) = loaded.unwrap_or_default();
    let settings = runner_settings(&config, &args);
    let launch = if args.direct {
        LaunchMode::Direct
    } else {
        config.launch.unwrap_or_default()
    };
    let shell = args.shell.clone().or(config.shell.clone());

    let mut projects: Vec<Project> = config
        .projects
        .into_iter()
        .map(|project| project.into_project(&base))
        .collect();
    projects.extend(args.paths.iter().map(|path| project_from_args(path, &args)));
    if projects.is_empty() {
        bail!("no projects to run (pass a project directory or add [[project]] to devrack.toml)");
    }
    ensure_unique_paths(&projects)?;

    let spawner: Arc<dyn Spawner> = match launch {
        LaunchMode::Shell => Arc::new(ShellSpawner::new(shell.as_deref())),
        LaunchMode::Direct => Arc::new(DirectSpawner),
    };
    let names: HashMap<PathBuf, String> = projects
        .iter()
        .map(|project| (project.path.clone(), project.name.clone()))
        .collect();
    let paths: Vec<PathBuf> = projects.iter().map(|project| project.path.clone()).collect();

    let (event_tx, mut event_rx) = mpsc::channel(256);
    let (notify_tx, notify_rx) = mpsc::channel(256);
    let mut runner = ProjectRunner::new(
        spawner,
        Arc::new(SystemProcessTable),
        Arc::new(SystemListenerProbe),
        settings,
        event_tx.clone(),
        notify_tx,
    );
    runner.load_projects(projects);

    if args.dry_run {
        for path in &paths {
            let name = names.get(path).map(String::as_str).unwrap_or_default();
            match runner.planned_command(path) {
                Ok(command) => println!("[{name}] {command} (in {})", path.display()),
                Err(err) => println!("[{name}] error: {err}"),
            }
        }
        return Ok(());
    }

    let printer = tokio::spawn(print_notifications(
        notify_rx,
        names,
        args.json,
        args.strip_ansi,
    ));
    spawn_signal_listener(event_tx);

    let mut started = 0;
    for path in &paths {
        match runner.run_project(path).await {
            Ok(_) => started += 1,
            Err(err) => debug!(project = %path.display(), error = %err, "project not started"),
        }
    }

    while runner.has_running() {
        let Some(event) = event_rx.recv().await else {
            break;
        };
        let shutdown = matches!(event, Event::Shutdown);
        runner.handle_event(event).await;
        if shutdown {
            break;
        }
    }
    runner.stop_all().await;
    for path in &paths {
        debug!(
            project = runner.project(path).map(|p| p.name.as_str()).unwrap_or_default(),
            status = ?runner.status(path),
            log_entries = runner.logs(path).count(),
            "final state"
        );
    }
    drop(runner);
    let _ = printer.await;

    if started == 0 {
        bail!("no project could be started");
    }
    Ok(())
}

fn runner_settings(config: &Config, args: &RunArgs) -> RunnerSettings {
    let defaults = DetectionPolicy::AFTER_LAUNCH;
    let detection = config.detection.clone().unwrap_or_default();
    RunnerSettings {
        max_log_entries: args
            .max_log_entries
            .or(config.max_log_entries)
            .unwrap_or(DEFAULT_MAX_ENTRIES),
        detection: DetectionPolicy::new(
            detection.attempts.unwrap_or(defaults.attempts),
            detection
                .initial_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.initial_delay),
            detection
                .interval_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.interval),
        ),
        port_fallback: args
            .port_fallback
            .or(config.port_fallback)
            .unwrap_or_default(),
        stop_strategy: args
            .stop_strategy
            .or(config.stop_strategy)
            .unwrap_or_default(),
    }
}

fn project_from_args(path: &Path, args: &RunArgs) -> Project {
    let path = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    let name = config::directory_name(&path);
    let mut project = Project::new(name, path, Runtime::from(args.runtime.clone()));
    project.package_manager = args.package_manager.clone();
    project.framework = args.framework.clone();
    project.preferred_port = args.port;
    project
}

fn ensure_unique_paths(projects: &[Project]) -> Result<()> {
    let mut seen = HashSet::new();
    for project in projects {
        if !seen.insert(project.path.clone()) {
            bail!("duplicate project path: {}", project.path.display());
        }
    }
    Ok(())
}

/// Loads the configuration and returns it with the directory its relative paths
/// resolve against.
fn load_config(explicit: Option<&Path>, no_config: bool) -> Result<Option<(Config, PathBuf)>> {
    if no_config {
        return Ok(None);
    }
    let path = match explicit {
        Some(path) => path.to_path_buf(),
        None => match default_config_path() {
            Some(path) => path,
            None => return Ok(None),
        },
    };
    let config = config::load_config(&path)?;
    let base = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    Ok(Some((config, base)))
}

fn default_config_path() -> Option<PathBuf> {
    let path = Path::new("devrack.toml");
    if path.exists() {
        Some(path.to_path_buf())
    } else {
        None
    }
}

fn spawn_signal_listener(tx: mpsc::Sender<Event>) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(_) => return,
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        let _ = tx.send(Event::Shutdown).await;
    });
}

async fn print_notifications(
    mut rx: mpsc::Receiver<Notification>,
    names: HashMap<PathBuf, String>,
    json: bool,
    strip_ansi: bool,
) {
    let mut stdout = std::io::stdout();
    while let Some(notification) = rx.recv().await {
        let line = if json {
            match serde_json::to_string(&notification) {
                Ok(line) => line,
                Err(err) => {
                    warn!(error = %err, "failed to encode notification");
                    continue;
                }
            }
        } else {
            let name = names
                .get(notification.project_path())
                .map(String::as_str)
                .unwrap_or("?");
            match format_notification(&notification, name, strip_ansi) {
                Some(line) => line,
                None => continue,
            }
        };
        if writeln!(stdout, "{line}").is_err() {
            break;
        }
    }
    // Keep draining so the runner never blocks on a closed stdout.
    while rx.recv().await.is_some() {}
}

/// Renders a notification as a prefixed line; status changes print nothing.
fn format_notification(notification: &Notification, name: &str, strip_ansi: bool) -> Option<String> {
    let text = match notification {
        Notification::ProcessStdout { content, .. } | Notification::ProcessStderr { content, .. } => {
            sanitize_text(content, strip_ansi)
        }
        Notification::ProcessStarted { pid, command, .. } => {
            format!("started `{command}` (pid {pid})")
        }
        Notification::ProcessExit { code: Some(code), .. } => format!("exited with code {code}"),
        Notification::ProcessExit { code: None, .. } => "terminated by signal".to_string(),
        Notification::ProcessExitError { error, .. } => format!("failed to wait for process: {error}"),
        Notification::ProcessShellFallback { message, .. } => format!("warning: {message}"),
        Notification::ProcessError { message, hint, .. } => format!("error: {message} ({hint})"),
        Notification::PortUpdate { port: Some(port), .. } => {
            format!("listening on http://localhost:{port}")
        }
        Notification::PortUpdate { port: None, .. } | Notification::StatusChanged { .. } => {
            return None;
        }
    };
    Some(format!("[{name}] {text}"))
}

fn help_styles() -> Styles {
    Styles::styled()
        .header(
            Style::new()
                .fg_color(Some(AnsiColor::Cyan.into()))
                .effects(Effects::BOLD),
        )
        .usage(
            Style::new()
                .fg_color(Some(AnsiColor::Green.into()))
                .effects(Effects::BOLD),
        )
        .literal(Style::new().fg_color(Some(AnsiColor::Yellow.into())))
        .placeholder(Style::new().fg_color(Some(AnsiColor::Magenta.into())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::project::ProjectStatus;

    fn run_args(argv: &[&str]) -> RunArgs {
        let mut full = vec!["devrack", "run"];
        full.extend_from_slice(argv);
        match Cli::try_parse_from(full).unwrap().command {
            Commands::Run(args) => args,
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn cli_overrides_config() {
        let config: Config = toml::from_str(
            r#"
max_log_entries = 50
port_fallback = "framework-default"
[detection]
attempts = 4
"#,
        )
        .unwrap();
        let settings = runner_settings(&config, &run_args(&["--max-log-entries", "10"]));
        assert_eq!(settings.max_log_entries, 10);
        assert_eq!(settings.port_fallback, PortFallback::FrameworkDefault);
        assert_eq!(settings.stop_strategy, StopStrategy::PidAndPort);
        assert_eq!(settings.detection.attempts, 4);
        assert_eq!(
            settings.detection.interval,
            DetectionPolicy::AFTER_LAUNCH.interval
        );

        let settings = runner_settings(
            &config,
            &run_args(&["--port-fallback", "unknown", "--stop-strategy", "port-on-failure"]),
        );
        assert_eq!(settings.port_fallback, PortFallback::Unknown);
        assert_eq!(settings.stop_strategy, StopStrategy::PortOnFailure);
    }

    #[test]
    fn parses_detect_port_flags() {
        let cli = Cli::try_parse_from(["devrack", "detect-port", "4242", "--attempts", "5"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::DetectPort {
                pid: 4242,
                attempts: Some(5),
                initial_delay_ms: None,
                ..
            }
        ));
    }

    #[test]
    fn projects_from_paths_use_run_flags() {
        let dir = tempfile::tempdir().unwrap();
        let args = run_args(&["--runtime", "deno", "--framework", "fresh"]);
        let project = project_from_args(dir.path(), &args);
        assert_eq!(project.runtime, Runtime::Deno);
        assert_eq!(project.framework.as_deref(), Some("fresh"));
        assert!(project.path.is_absolute());
        assert!(ensure_unique_paths(&[project.clone(), project]).is_err());
    }

    #[test]
    fn formats_notifications_with_project_prefix() {
        let path = PathBuf::from("/work/web");
        let line = format_notification(
            &Notification::ProcessStdout {
                project_path: path.clone(),
                content: "\u{1b}[32mready\u{1b}[0m".into(),
            },
            "web",
            true,
        );
        assert_eq!(line.as_deref(), Some("[web] ready"));

        let line = format_notification(
            &Notification::PortUpdate {
                project_path: path.clone(),
                port: Some(5173),
            },
            "web",
            false,
        );
        assert_eq!(line.as_deref(), Some("[web] listening on http://localhost:5173"));

        let line = format_notification(
            &Notification::error(path.clone(), ErrorKind::Spawn, "command `pnpm` was not found"),
            "web",
            false,
        );
        assert!(line.unwrap().starts_with("[web] error: command `pnpm` was not found"));

        let status = Notification::StatusChanged {
            project_path: path,
            status: ProjectStatus::Running,
        };
        assert_eq!(format_notification(&status, "web", false), None);
    }
}
