//! Data structures describing launchable projects.
//!
//! This module defines the projects handed over by a scanner (`Project`), the runtime
//! they target (`Runtime`), the lifecycle status tracked by the runner (`ProjectStatus`)
//! and the record kept for every launched process (`RunningProcess`).

use std::collections::HashMap;
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::error::RunError;

const MAX_PATH_LEN: usize = 4096;

/// JavaScript/TypeScript engine a project targets.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Runtime {
    NodeJs,
    Deno,
    Bun,
    /// Any runtime tag the launcher has no command for.
    Other(String),
}

impl From<String> for Runtime {
    fn from(value: String) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "node.js" | "nodejs" | "node" => Runtime::NodeJs,
            "deno" => Runtime::Deno,
            "bun" => Runtime::Bun,
            _ => Runtime::Other(value),
        }
    }
}

impl From<Runtime> for String {
    fn from(value: Runtime) -> Self {
        value.to_string()
    }
}

impl fmt::Display for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Runtime::NodeJs => f.write_str("Node.js"),
            Runtime::Deno => f.write_str("Deno"),
            Runtime::Bun => f.write_str("Bun"),
            Runtime::Other(name) => f.write_str(name),
        }
    }
}

/// A discovered development project.
#[derive(Debug, Clone, Serialize)]
pub struct Project {
    /// Display name.
    pub name: String,
    /// Project directory; unique key within one scan.
    pub path: PathBuf,
    /// Runtime used to pick the launch command.
    pub runtime: Runtime,
    /// Package manager, only meaningful for Node.js projects.
    pub package_manager: Option<String>,
    /// Framework tag, used for the default-port fallback and port flag injection.
    pub framework: Option<String>,
    /// Port reported for the running dev server: the detected one or, when
    /// configured, a framework default.
    pub port: Option<u16>,
    /// Port actually observed listening in the process tree. Only this one is
    /// ever killed by port.
    pub detected_port: Option<u16>,
    /// Port to request from the dev server when its script allows it.
    pub preferred_port: Option<u16>,
    /// Extra environment variables for the dev process.
    pub env: HashMap<String, String>,
    /// Size on disk in bytes.
    pub size: Option<u64>,
    /// Last modification time, seconds since the Unix epoch.
    pub modified: Option<i64>,
}

impl Project {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>, runtime: Runtime) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            runtime,
            package_manager: None,
            framework: None,
            port: None,
            detected_port: None,
            preferred_port: None,
            env: HashMap::new(),
            size: None,
            modified: None,
        }
    }

    /// Reads the `dev` script from the project's `package.json`, if any.
    pub fn dev_script(&self) -> Option<String> {
        let raw = std::fs::read_to_string(self.path.join("package.json")).ok()?;
        let json: serde_json::Value = serde_json::from_str(&raw).ok()?;
        json.get("scripts")?
            .get("dev")?
            .as_str()
            .map(str::to_string)
    }
}

/// Lifecycle status of a project as seen by the runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectStatus {
    Stopped,
    Starting,
    Running,
}

/// Record of a launched dev process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunningProcess {
    /// OS process id of the spawned root process.
    pub pid: u32,
    /// When the process was spawned.
    pub started_at: Instant,
}

/// Checks that `path` is a usable project directory and returns its canonical form.
pub fn validate_project_dir(path: &Path) -> Result<PathBuf, RunError> {
    let invalid = |reason: &str| RunError::InvalidDirectory {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    };
    let raw = path.as_os_str();
    if raw.is_empty() {
        return Err(invalid("path is empty"));
    }
    if raw.to_string_lossy().contains('\0') {
        return Err(invalid("path contains a NUL byte"));
    }
    if path.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(invalid("parent directory segments are not allowed"));
    }
    if raw.len() > MAX_PATH_LEN {
        return Err(invalid("path is too long"));
    }
    let metadata = std::fs::metadata(path).map_err(|_| invalid("path does not exist"))?;
    if !metadata.is_dir() {
        return Err(invalid("path is not a directory"));
    }
    path.canonicalize()
        .map_err(|err| invalid(&format!("failed to canonicalize: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_tags_parse_case_insensitively() {
        assert_eq!(Runtime::from("Node.js".to_string()), Runtime::NodeJs);
        assert_eq!(Runtime::from("node".to_string()), Runtime::NodeJs);
        assert_eq!(Runtime::from("DENO".to_string()), Runtime::Deno);
        assert_eq!(Runtime::from("bun".to_string()), Runtime::Bun);
        assert_eq!(
            Runtime::from("Python".to_string()),
            Runtime::Other("Python".to_string())
        );
        assert_eq!(Runtime::Other("Python".into()).to_string(), "Python");
    }

    #[test]
    fn reads_dev_script_from_package_json() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("package.json"),
            r#"{"scripts": {"dev": "astro dev", "build": "astro build"}}"#,
        )
        .unwrap();
        let project = Project::new("site", dir.path(), Runtime::NodeJs);
        assert_eq!(project.dev_script().as_deref(), Some("astro dev"));

        let empty = tempfile::tempdir().unwrap();
        let project = Project::new("bare", empty.path(), Runtime::NodeJs);
        assert_eq!(project.dev_script(), None);
    }

    #[test]
    fn validates_project_directories() {
        let dir = tempfile::tempdir().unwrap();
        let canonical = validate_project_dir(dir.path()).unwrap();
        assert!(canonical.is_absolute());

        let file = dir.path().join("file.txt");
        std::fs::write(&file, "x").unwrap();
        assert!(validate_project_dir(&file).is_err());
        assert!(validate_project_dir(&dir.path().join("missing")).is_err());
        assert!(validate_project_dir(Path::new("")).is_err());
        assert!(validate_project_dir(&dir.path().join("..")).is_err());
    }
}
