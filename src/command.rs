//! Runtime-specific dev command resolution.

use std::fmt;

use crate::error::RunError;
use crate::project::{Project, Runtime};

/// Script fragments that make a dev script too complex to append a flag to.
const COMPLEX_SCRIPT_MARKERS: &[&str] = &[
    "&&",
    "||",
    ";",
    "|",
    "&",
    "concurrently",
    "npm-run-all",
    "run-p",
    "run-s",
    "turbo",
    "nx ",
    "lerna",
    "wait-on",
    "nodemon",
];

/// Frameworks whose dev server accepts `--port N`.
const PORT_FLAG_FRAMEWORKS: &[&str] = &["astro"];

/// A program and its arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl ResolvedCommand {
    fn new(program: &str, args: &[&str]) -> Self {
        Self {
            program: program.to_string(),
            args: args.iter().map(|arg| arg.to_string()).collect(),
        }
    }

    /// Appends `--port N`, separated with `--` where the package manager needs it.
    pub fn with_port_flag(mut self, port: u16) -> Self {
        if self.program == "npm" {
            self.args.push("--".to_string());
        }
        self.args.push("--port".to_string());
        self.args.push(port.to_string());
        self
    }
}

impl fmt::Display for ResolvedCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&crate::shell::command_line(&self.program, &self.args))
    }
}

/// Picks the dev command for a project from its runtime and package manager.
pub fn resolve_command(project: &Project) -> Result<ResolvedCommand, RunError> {
    match &project.runtime {
        Runtime::NodeJs => {
            let manager = project
                .package_manager
                .as_deref()
                .map(|pm| pm.trim().to_ascii_lowercase());
            Ok(match manager.as_deref() {
                None | Some("") | Some("npm") => ResolvedCommand::new("npm", &["run", "dev"]),
                Some("yarn") => ResolvedCommand::new("yarn", &["dev"]),
                Some("pnpm") => ResolvedCommand::new("pnpm", &["dev"]),
                Some(_) => ResolvedCommand::new("bun", &["run", "dev"]),
            })
        }
        Runtime::Deno => Ok(ResolvedCommand::new("deno", &["task", "dev"])),
        Runtime::Bun => Ok(ResolvedCommand::new("bun", &["run", "dev"])),
        Runtime::Other(name) => Err(RunError::UnsupportedRuntime(name.clone())),
    }
}

/// Whether a `--port` flag can be appended to the dev script without breaking it.
///
/// Only plain single-command scripts of frameworks known to accept the flag qualify.
pub fn can_safely_inject_port_flag(framework: Option<&str>, script: &str) -> bool {
    let Some(framework) = framework else {
        return false;
    };
    if !PORT_FLAG_FRAMEWORKS
        .iter()
        .any(|known| known.eq_ignore_ascii_case(framework.trim()))
    {
        return false;
    }
    let script = script.trim();
    if script.is_empty() || script.contains("--port") {
        return false;
    }
    !COMPLEX_SCRIPT_MARKERS
        .iter()
        .any(|marker| script.contains(marker))
}
