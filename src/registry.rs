//! Mapping from project path to the pid of its spawned dev process.
//!
//! Every operation is idempotent: a natural exit and an explicit stop may both try
//! to remove the same entry, and neither needs to know about the other.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::project::RunningProcess;

#[derive(Debug, Default)]
pub struct ProcessRegistry {
    entries: HashMap<PathBuf, RunningProcess>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `pid` as the root process of `project`, replacing any previous record.
    pub fn record(&mut self, project: &Path, pid: u32) {
        self.entries.insert(
            project.to_path_buf(),
            RunningProcess {
                pid,
                started_at: Instant::now(),
            },
        );
    }

    pub fn lookup(&self, project: &Path) -> Option<u32> {
        self.entries.get(project).map(|record| record.pid)
    }

    pub fn get(&self, project: &Path) -> Option<&RunningProcess> {
        self.entries.get(project)
    }

    /// Removes the project's record. Removing a missing record is a no-op.
    pub fn remove(&mut self, project: &Path) -> Option<RunningProcess> {
        self.entries.remove(project)
    }

    pub fn contains(&self, project: &Path) -> bool {
        self.entries.contains_key(project)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Paths of every project with a live record.
    pub fn projects(&self) -> impl Iterator<Item = &Path> {
        self.entries.keys().map(PathBuf::as_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_lookup_remove() {
        let mut registry = ProcessRegistry::new();
        let project = Path::new("/work/app");
        assert_eq!(registry.lookup(project), None);

        registry.record(project, 4242);
        assert_eq!(registry.lookup(project), Some(4242));
        assert!(registry.contains(project));
        assert_eq!(registry.get(project).map(|r| r.pid), Some(4242));

        let removed = registry.remove(project).map(|r| r.pid);
        assert_eq!(removed, Some(4242));
        assert!(registry.is_empty());
    }

    #[test]
    fn removing_twice_is_harmless() {
        let mut registry = ProcessRegistry::new();
        let project = Path::new("/work/app");
        registry.record(project, 7);
        assert!(registry.remove(project).is_some());
        assert!(registry.remove(project).is_none());
        assert!(registry.remove(Path::new("/never/recorded")).is_none());
    }
}
