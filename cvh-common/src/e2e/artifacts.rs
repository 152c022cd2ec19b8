//! Per-run artifact directory for command traces and the final report.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use serde::Serialize;

/// Writes sequence-numbered artifacts into one directory.
///
/// Clones share the sequence counter so artifacts from every component of a
/// run sort in the order they were produced.
#[derive(Debug, Clone)]
pub struct ArtifactSink {
    dir: PathBuf,
    sequence: Arc<AtomicU32>,
}

impl ArtifactSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            sequence: Arc::new(AtomicU32::new(0)),
        }
    }

    /// `<root>/run_<utc timestamp>_<pid>`.
    pub fn for_run(root: &Path) -> Self {
        let stamp = chrono::Utc::now().format("%Y%m%d_%H%M%S_%3f");
        Self::new(root.join(format!("run_{stamp}_{}", std::process::id())))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn capture_text(&self, name: &str, content: &str) -> io::Result<PathBuf> {
        let path = self.next_path(name, "txt")?;
        fs::write(&path, content)?;
        Ok(path)
    }

    pub fn capture_json<T: Serialize>(&self, name: &str, value: &T) -> io::Result<PathBuf> {
        let serialized = serde_json::to_string_pretty(value)
            .map_err(|error| io::Error::other(format!("failed to serialize artifact json: {error}")))?;
        let path = self.next_path(name, "json")?;
        fs::write(&path, serialized)?;
        Ok(path)
    }

    /// Write `name` without a sequence prefix, replacing any earlier copy.
    pub fn write_named_json<T: Serialize>(&self, name: &str, value: &T) -> io::Result<PathBuf> {
        let serialized = serde_json::to_string_pretty(value)
            .map_err(|error| io::Error::other(format!("failed to serialize artifact json: {error}")))?;
        fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(format!("{}.json", sanitize_component(name)));
        fs::write(&path, serialized)?;
        Ok(path)
    }

    fn next_path(&self, name: &str, extension: &str) -> io::Result<PathBuf> {
        fs::create_dir_all(&self.dir)?;
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        Ok(self
            .dir
            .join(format!("{seq:04}_{}.{extension}", sanitize_component(name))))
    }
}

pub(crate) fn sanitize_component(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' || ch == '.' {
                ch
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "artifact".to_string()
    } else {
        cleaned
    }
}
