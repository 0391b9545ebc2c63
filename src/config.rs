//! Configuration management for devrack.
//!
//! This module defines the structure of the `devrack.toml` configuration file
//! and provides functionality to load and parse it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::ports::PortFallback;
use crate::project::{Project, Runtime};
use crate::runner::StopStrategy;

/// Top-level configuration structure corresponding to `devrack.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Maximum number of log entries kept in memory per project.
    pub max_log_entries: Option<usize>,
    /// Preferred shell for launching dev commands (default: `$SHELL`).
    pub shell: Option<String>,
    /// Launch through a login shell or run the command directly.
    pub launch: Option<LaunchMode>,
    /// What to report when no listening port is detected.
    pub port_fallback: Option<PortFallback>,
    /// Which kill paths a stop runs.
    pub stop_strategy: Option<StopStrategy>,
    /// Port detection policy used after a launch.
    pub detection: Option<DetectionConfig>,
    /// Projects to launch.
    #[serde(default, rename = "project")]
    pub projects: Vec<ProjectConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LaunchMode {
    #[default]
    Shell,
    Direct,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DetectionConfig {
    pub attempts: Option<u32>,
    pub initial_delay_ms: Option<u64>,
    pub interval_ms: Option<u64>,
}

/// Configuration for a single project.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProjectConfig {
    /// Display name (default: the directory name).
    pub name: Option<String>,
    /// Project directory, relative to the config file.
    pub path: PathBuf,
    /// Runtime tag, e.g. "Node.js", "Deno" or "Bun" (default: "Node.js").
    pub runtime: Option<Runtime>,
    pub package_manager: Option<String>,
    pub framework: Option<String>,
    /// Port requested from the dev server when its script allows a `--port` flag.
    pub port: Option<u16>,
    /// Environment variables to set for the dev process.
    pub env: Option<HashMap<String, String>>,
}

impl ProjectConfig {
    /// Converts into a `Project`, resolving `path` against `base`.
    ///
    /// Existing directories are canonicalized so `..` segments and symlinks resolve
    /// the same way as paths given on the command line.
    pub fn into_project(self, base: &Path) -> Project {
        let joined = if self.path.is_absolute() {
            self.path
        } else {
            base.join(self.path)
        };
        let path = joined.canonicalize().unwrap_or(joined);
        let name = self.name.unwrap_or_else(|| directory_name(&path));
        let mut project = Project::new(name, path, self.runtime.unwrap_or(Runtime::NodeJs));
        project.package_manager = self.package_manager;
        project.framework = self.framework;
        project.preferred_port = self.port;
        project.env = self.env.unwrap_or_default();
        project
    }
}

/// Last path segment, used as a project's default name.
pub fn directory_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}

/// Loads and parses the configuration from a file path.
pub fn load_config(path: &Path) -> Result<Config> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let config: Config = toml::from_str(&raw)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_optional_fields() {
        let raw = r#"
max_log_entries = 200
shell = "/bin/zsh"
launch = "direct"
port_fallback = "framework-default"
stop_strategy = "port-on-failure"

[detection]
attempts = 10
initial_delay_ms = 500
interval_ms = 750

[[project]]
name = "web"
path = "./web"
runtime = "Node.js"
package_manager = "pnpm"
framework = "astro"
port = 4322
env = { NODE_ENV = "development" }

[[project]]
path = "/srv/api"
runtime = "Deno"
"#;
        let config: Config = toml::from_str(raw).unwrap();
        assert_eq!(config.max_log_entries, Some(200));
        assert_eq!(config.shell.as_deref(), Some("/bin/zsh"));
        assert_eq!(config.launch, Some(LaunchMode::Direct));
        assert_eq!(config.port_fallback, Some(PortFallback::FrameworkDefault));
        assert_eq!(config.stop_strategy, Some(StopStrategy::PortOnFailure));
        let detection = config.detection.unwrap();
        assert_eq!(detection.attempts, Some(10));
        assert_eq!(detection.initial_delay_ms, Some(500));
        assert_eq!(detection.interval_ms, Some(750));
        assert_eq!(config.projects.len(), 2);

        let mut projects = config.projects.into_iter();
        let web = projects.next().unwrap().into_project(Path::new("/home/me/code"));
        assert_eq!(web.name, "web");
        assert_eq!(web.path, Path::new("/home/me/code/./web"));
        assert_eq!(web.runtime, Runtime::NodeJs);
        assert_eq!(web.package_manager.as_deref(), Some("pnpm"));
        assert_eq!(web.preferred_port, Some(4322));
        assert_eq!(web.env.get("NODE_ENV").map(String::as_str), Some("development"));

        let api = projects.next().unwrap().into_project(Path::new("/home/me/code"));
        assert_eq!(api.name, "api");
        assert_eq!(api.path, Path::new("/srv/api"));
        assert_eq!(api.runtime, Runtime::Deno);
    }

    #[test]
    fn relative_paths_with_parent_segments_resolve() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("cfg");
        let web = dir.path().join("web");
        std::fs::create_dir(&base).unwrap();
        std::fs::create_dir(&web).unwrap();

        let config: Config = toml::from_str("[[project]]\npath = \"../web\"").unwrap();
        let project = config.projects.into_iter().next().unwrap().into_project(&base);
        assert_eq!(project.path, web.canonicalize().unwrap());
        assert_eq!(project.name, "web");
        assert_eq!(
            crate::project::validate_project_dir(&project.path).unwrap(),
            project.path
        );
    }

    #[test]
    fn empty_config_is_valid() {
        let config: Config = toml::from_str("").unwrap();
        assert!(config.projects.is_empty());
        assert!(config.launch.is_none());
    }

    #[test]
    fn rejects_unknown_keys() {
        assert!(toml::from_str::<Config>("max_lines = 5").is_err());
    }

    #[test]
    fn load_reports_the_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("devrack.toml");
        std::fs::write(&path, "launch = \"sometimes\"").unwrap();
        let err = load_config(&path).unwrap_err();
        assert!(format!("{err:#}").contains("devrack.toml"));
    }
}
