//! Login shell discovery.
//!
//! Dev commands run through the user's login shell so that version managers
//! (nvm, fnm, volta, asdf) configured in rc files are on `PATH`. The candidate list
//! starts with the preferred shell and ends with a shell that always exists.

use std::path::Path;

/// A shell that can wrap a dev command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellCandidate {
    /// Executable path or name.
    pub program: String,
    /// Flags placed before the script.
    pub flags: Vec<&'static str>,
    /// Command sourcing the shell's rc file before the script runs.
    pub init: Option<&'static str>,
}

impl ShellCandidate {
    /// Short name used in notifications, e.g. `zsh`.
    pub fn name(&self) -> &str {
        shell_name(&self.program)
    }

    /// Builds the full script passed after the flags.
    pub fn script(&self, command: &str, args: &[String]) -> String {
        let line = command_line(command, args);
        match self.init {
            Some(init) => format!("{init}; {line}"),
            None => line,
        }
    }
}

/// Returns the final path segment of a shell path.
pub fn shell_name(program: &str) -> &str {
    Path::new(program)
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or(program)
}

/// Joins a command and its arguments into a single shell-quoted line.
pub fn command_line(command: &str, args: &[String]) -> String {
    let mut words = Vec::with_capacity(args.len() + 1);
    words.push(command);
    words.extend(args.iter().map(String::as_str));
    shell_words::join(words)
}

#[cfg(unix)]
fn candidate_for(program: &str) -> ShellCandidate {
    let login = vec!["-l", "-c"];
    match shell_name(program) {
        "zsh" => ShellCandidate {
            program: program.to_string(),
            flags: login,
            init: Some("source ~/.zshrc 2>/dev/null || source ~/.zprofile 2>/dev/null || true"),
        },
        "bash" => ShellCandidate {
            program: program.to_string(),
            flags: login,
            init: Some("source ~/.bashrc 2>/dev/null || source ~/.bash_profile 2>/dev/null || true"),
        },
        "ksh" => ShellCandidate {
            program: program.to_string(),
            flags: login,
            init: Some("source ~/.kshrc 2>/dev/null || source ~/.profile 2>/dev/null || true"),
        },
        "csh" | "tcsh" => ShellCandidate {
            program: program.to_string(),
            flags: login,
            init: None,
        },
        "fish" => ShellCandidate {
            program: program.to_string(),
            flags: vec!["-c"],
            init: Some("source ~/.config/fish/config.fish 2>/dev/null; or true"),
        },
        _ => ShellCandidate {
            program: program.to_string(),
            flags: vec!["-c"],
            init: None,
        },
    }
}

/// Shells to try, in order, for launching dev commands.
///
/// `preferred` overrides `$SHELL`. Duplicates are removed while keeping the first
/// occurrence, and `/bin/sh` is always the last resort.
#[cfg(unix)]
pub fn shell_candidates(preferred: Option<&str>) -> Vec<ShellCandidate> {
    let user_shell = preferred
        .map(str::to_string)
        .or_else(|| std::env::var("SHELL").ok())
        .filter(|shell| !shell.trim().is_empty());

    let mut programs: Vec<String> = Vec::new();
    if let Some(shell) = user_shell {
        programs.push(shell);
    }
    let defaults: &[&str] = if cfg!(target_os = "macos") {
        &["/bin/zsh", "/bin/bash"]
    } else {
        &["/bin/bash", "/bin/zsh"]
    };
    for default in defaults {
        let name = shell_name(default);
        if !programs.iter().any(|p| shell_name(p) == name) {
            programs.push(default.to_string());
        }
    }
    if !programs.iter().any(|p| shell_name(p) == "fish") {
        programs.push("/usr/local/bin/fish".to_string());
        programs.push("/opt/homebrew/bin/fish".to_string());
    }
    programs.push("/bin/sh".to_string());

    let mut candidates: Vec<ShellCandidate> = Vec::new();
    for program in programs {
        let candidate = candidate_for(&program);
        if !candidates.iter().any(|c| c.program == candidate.program) {
            candidates.push(candidate);
        }
    }
    candidates
}

#[cfg(windows)]
pub fn shell_candidates(preferred: Option<&str>) -> Vec<ShellCandidate> {
    let mut candidates = Vec::new();
    if let Some(shell) = preferred.filter(|s| !s.trim().is_empty()) {
        let flags = if shell_name(shell).to_ascii_lowercase().starts_with("powershell")
            || shell_name(shell).to_ascii_lowercase().starts_with("pwsh")
        {
            vec!["-NoProfile", "-Command"]
        } else {
            vec!["/C"]
        };
        candidates.push(ShellCandidate {
            program: shell.to_string(),
            flags,
            init: None,
        });
    }
    let comspec = std::env::var("ComSpec").unwrap_or_else(|_| "cmd.exe".to_string());
    for (program, flags) in [
        (comspec, vec!["/C"]),
        ("powershell".to_string(), vec!["-NoProfile", "-Command"]),
    ] {
        if !candidates.iter().any(|c| c.program == program) {
            candidates.push(ShellCandidate {
                program,
                flags,
                init: None,
            });
        }
    }
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quotes_arguments_with_spaces() {
        let line = command_line("npm", &["run".into(), "dev".into(), "my app".into()]);
        assert_eq!(line, "npm run dev 'my app'");
    }

    #[cfg(unix)]
    #[test]
    fn preferred_shell_comes_first_and_sh_last() {
        let candidates = shell_candidates(Some("/usr/bin/zsh"));
        assert_eq!(candidates[0].program, "/usr/bin/zsh");
        assert_eq!(candidates[0].flags, vec!["-l", "-c"]);
        assert_eq!(candidates.last().map(|c| c.program.as_str()), Some("/bin/sh"));
        assert!(!candidates[1..].iter().any(|c| c.name() == "zsh"));
    }

    #[cfg(unix)]
    #[test]
    fn fish_and_sh_skip_login_flag() {
        let candidates = shell_candidates(Some("/opt/homebrew/bin/fish"));
        assert_eq!(candidates[0].flags, vec!["-c"]);
        let sh = candidates.iter().find(|c| c.program == "/bin/sh").unwrap();
        assert_eq!(sh.flags, vec!["-c"]);
        assert_eq!(sh.init, None);
        assert_eq!(
            candidates.iter().filter(|c| c.name() == "fish").count(),
            1
        );
    }

    #[cfg(unix)]
    #[test]
    fn script_sources_rc_file_first() {
        let bash = shell_candidates(Some("/bin/bash")).remove(0);
        let script = bash.script("pnpm", &["dev".into()]);
        assert!(script.starts_with("source ~/.bashrc"));
        assert!(script.ends_with("; pnpm dev"));
    }
}
