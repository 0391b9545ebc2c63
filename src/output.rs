//! Captured output of supervised projects.
//!
//! This module provides the per-project ring buffer of log entries (`LogBuffer`) and the
//! store that owns one buffer per project path (`LogStore`). It also handles text
//! sanitization for display.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::Serialize;
use strip_ansi_escapes::strip;

/// Number of entries retained per project unless configured otherwise.
pub const DEFAULT_MAX_ENTRIES: usize = 1000;

/// Indicates the source stream of a log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    /// Standard Output.
    Stdout,
    /// Standard Error.
    Stderr,
}

/// A single captured line of output.
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    /// Store-wide unique identity, increasing in arrival order.
    pub id: u64,
    /// Path of the project that produced the line.
    pub project: PathBuf,
    /// The stream it originated from (stdout/stderr).
    pub stream: StreamKind,
    /// The content of the line, without its trailing newline.
    pub text: String,
    /// When the line was captured.
    pub captured_at: SystemTime,
}

/// A fixed-capacity ring buffer for storing `LogEntry`s.
#[derive(Debug, Clone)]
pub struct LogBuffer {
    max_entries: usize,
    entries: VecDeque<LogEntry>,
}

impl LogBuffer {
    /// Creates a new `LogBuffer` with the specified maximum capacity.
    pub fn new(max_entries: usize) -> Self {
        Self {
            max_entries,
            entries: VecDeque::with_capacity(max_entries.min(1024)),
        }
    }

    /// Adds an entry to the buffer.
    ///
    /// Returns `true` if an old entry was dropped to make room.
    pub fn push(&mut self, entry: LogEntry) -> bool {
        let mut dropped = false;
        self.entries.push_back(entry);
        while self.entries.len() > self.max_entries {
            self.entries.pop_front();
            dropped = true;
        }
        dropped
    }

    /// Returns an iterator over the entries, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter()
    }

    /// Removes every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Log buffers keyed by project path.
#[derive(Debug)]
pub struct LogStore {
    max_entries: usize,
    next_id: u64,
    buffers: HashMap<PathBuf, LogBuffer>,
}

impl LogStore {
    pub fn new(max_entries: usize) -> Self {
        Self {
            max_entries: max_entries.max(1),
            next_id: 0,
            buffers: HashMap::new(),
        }
    }

    /// Appends a line to the project's buffer, evicting the oldest entry when full.
    ///
    /// Returns the identity assigned to the new entry.
    pub fn append(&mut self, project: &Path, stream: StreamKind, text: impl Into<String>) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        let max_entries = self.max_entries;
        let buffer = self
            .buffers
            .entry(project.to_path_buf())
            .or_insert_with(|| LogBuffer::new(max_entries));
        buffer.push(LogEntry {
            id,
            project: project.to_path_buf(),
            stream,
            text: text.into(),
            captured_at: SystemTime::now(),
        });
        id
    }

    /// Empties the project's buffer.
    pub fn clear(&mut self, project: &Path) {
        if let Some(buffer) = self.buffers.get_mut(project) {
            buffer.clear();
        }
    }

    /// Returns the project's entries in arrival order.
    pub fn entries(&self, project: &Path) -> impl Iterator<Item = &LogEntry> {
        self.buffers
            .get(project)
            .into_iter()
            .flat_map(|buffer| buffer.iter())
    }
}

/// Sanitizes text for display, optionally stripping ANSI escape codes.
///
/// If `strip_ansi` is true, ANSI codes are removed. Invalid UTF-8 sequences are replaced.
pub fn sanitize_text(text: &str, strip_ansi: bool) -> String {
    if !strip_ansi {
        return text.to_string();
    }
    let stripped = strip(text.as_bytes());
    String::from_utf8_lossy(&stripped).to_string()
}
