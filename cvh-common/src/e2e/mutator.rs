//! Anchored text edits on generated files.
//!
//! Every edit resolves its anchor exactly once before the file is touched.
//! A missing or repeated anchor is reported as [`AnchorError`] and the file
//! is left byte-for-byte as it was. Rewrites go through a temp file and a
//! rename so a crash never leaves a half-written source file behind.
//!
//! The mutator does not detect edits that were already applied; re-running
//! an insertion inserts the payload again.

use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use memchr::memmem;
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

/// Why an anchor could not be resolved to a single edit position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AnchorProblem {
    Missing,
    Ambiguous { occurrences: usize },
    Empty,
}

impl fmt::Display for AnchorProblem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Missing => write!(f, "anchor not found"),
            Self::Ambiguous { occurrences } => {
                write!(f, "anchor is ambiguous ({occurrences} occurrences)")
            }
            Self::Empty => write!(f, "anchor is empty"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AnchorError {
    #[error("{problem} in {}: {anchor:?}", path.display())]
    Unresolved {
        path: PathBuf,
        anchor: String,
        problem: AnchorProblem,
    },

    #[error("failed to access {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl AnchorError {
    /// The resolution problem, if the failure was about the anchor itself.
    pub fn problem(&self) -> Option<AnchorProblem> {
        match self {
            Self::Unresolved { problem, .. } => Some(*problem),
            Self::Io { .. } => None,
        }
    }
}

/// A file edit that a step can schedule before or after its command.
///
/// `file` is relative to the context's workspace and may contain
/// `${placeholder}` references.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "edit", rename_all = "snake_case")]
pub enum Edit {
    InsertAfter {
        file: String,
        anchor: String,
        payload: String,
    },
    Uncomment {
        file: String,
        anchor: String,
        prefix: String,
    },
    WriteFile {
        file: String,
        contents: String,
    },
}

impl Edit {
    pub fn file(&self) -> &str {
        match self {
            Self::InsertAfter { file, .. }
            | Self::Uncomment { file, .. }
            | Self::WriteFile { file, .. } => file,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Self::InsertAfter { file, anchor, .. } => {
                format!("insert after {:?} in {file}", first_line(anchor))
            }
            Self::Uncomment {
                file,
                anchor,
                prefix,
            } => format!("uncomment {prefix}{anchor:?} in {file}"),
            Self::WriteFile { file, .. } => format!("write {file}"),
        }
    }

    /// Apply the edit to an already-resolved path.
    pub fn apply(&self, path: &Path) -> Result<(), AnchorError> {
        match self {
            Self::InsertAfter {
                anchor, payload, ..
            } => insert_after(path, anchor, payload),
            Self::Uncomment { anchor, prefix, .. } => uncomment(path, anchor, prefix),
            Self::WriteFile { contents, .. } => write_file(path, contents),
        }
    }
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or(text)
}

/// Insert `payload` right after the line that ends the (unique) `anchor`.
pub fn insert_after(path: &Path, anchor: &str, payload: &str) -> Result<(), AnchorError> {
    let content = read(path)?;
    let updated =
        insert_after_in(&content, anchor, payload).map_err(|problem| unresolved(path, anchor, problem))?;
    write_atomic(path, updated.as_bytes())?;
    debug!(
        path = %path.display(),
        inserted_bytes = payload.len(),
        "inserted payload after anchor"
    );
    Ok(())
}

/// Strip `prefix` from the single line that starts with `prefix` + `anchor`.
///
/// Leading indentation before the prefix is kept.
pub fn uncomment(path: &Path, anchor: &str, prefix: &str) -> Result<(), AnchorError> {
    let content = read(path)?;
    let updated = uncomment_in(&content, anchor, prefix)
        .map_err(|problem| unresolved(path, &format!("{prefix}{anchor}"), problem))?;
    write_atomic(path, updated.as_bytes())?;
    debug!(path = %path.display(), prefix, anchor, "uncommented line");
    Ok(())
}

/// Replace the whole file, creating parent directories as needed.
pub fn write_file(path: &Path, contents: &str) -> Result<(), AnchorError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| AnchorError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    write_atomic(path, contents.as_bytes())?;
    debug!(path = %path.display(), bytes = contents.len(), "wrote file");
    Ok(())
}

/// In-memory form of [`insert_after`].
pub fn insert_after_in(content: &str, anchor: &str, payload: &str) -> Result<String, AnchorProblem> {
    let start = locate_unique(content, anchor)?;
    let anchor_end = start + anchor.len();
    let insert_at = if anchor.ends_with('\n') {
        anchor_end
    } else {
        match memchr::memchr(b'\n', &content.as_bytes()[anchor_end..]) {
            Some(offset) => anchor_end + offset + 1,
            None => content.len(),
        }
    };

    let mut out = String::with_capacity(content.len() + payload.len());
    out.push_str(&content[..insert_at]);
    out.push_str(payload);
    out.push_str(&content[insert_at..]);
    Ok(out)
}

/// In-memory form of [`uncomment`].
pub fn uncomment_in(content: &str, anchor: &str, prefix: &str) -> Result<String, AnchorProblem> {
    if anchor.is_empty() {
        return Err(AnchorProblem::Empty);
    }
    let needle = format!("{prefix}{anchor}");

    let mut target = None;
    let mut occurrences = 0;
    let mut line_start = 0;
    for line in content.split_inclusive('\n') {
        let indent = line.len() - line.trim_start_matches([' ', '\t']).len();
        if line[indent..].starts_with(&needle) {
            occurrences += 1;
            target.get_or_insert(line_start + indent);
        }
        line_start += line.len();
    }

    match (occurrences, target) {
        (1, Some(at)) => {
            let mut out = String::with_capacity(content.len() - prefix.len());
            out.push_str(&content[..at]);
            out.push_str(&content[at + prefix.len()..]);
            Ok(out)
        }
        (0, _) | (_, None) => Err(AnchorProblem::Missing),
        (n, _) => Err(AnchorProblem::Ambiguous { occurrences: n }),
    }
}

/// Byte offset of the only occurrence of `anchor`. Overlapping matches count.
fn locate_unique(content: &str, anchor: &str) -> Result<usize, AnchorProblem> {
    if anchor.is_empty() {
        return Err(AnchorProblem::Empty);
    }
    let finder = memmem::Finder::new(anchor.as_bytes());
    let haystack = content.as_bytes();

    let mut first = None;
    let mut occurrences = 0;
    let mut pos = 0;
    while pos < haystack.len() {
        let Some(offset) = finder.find(&haystack[pos..]) else {
            break;
        };
        let at = pos + offset;
        occurrences += 1;
        first.get_or_insert(at);
        pos = at + 1;
    }

    match (occurrences, first) {
        (1, Some(at)) => Ok(at),
        (0, _) | (_, None) => Err(AnchorProblem::Missing),
        (n, _) => Err(AnchorProblem::Ambiguous { occurrences: n }),
    }
}

fn unresolved(path: &Path, anchor: &str, problem: AnchorProblem) -> AnchorError {
    AnchorError::Unresolved {
        path: path.to_path_buf(),
        anchor: anchor.to_string(),
        problem,
    }
}

fn read(path: &Path) -> Result<String, AnchorError> {
    fs::read_to_string(path).map_err(|source| AnchorError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Writes content to a file atomically using a temporary file.
fn write_atomic(path: &Path, content: &[u8]) -> Result<(), AnchorError> {
    let io_err = |source| AnchorError::Io {
        path: path.to_path_buf(),
        source,
    };
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));

    let result = (|| {
        let mut file = fs::File::create(&temp_path)?;
        file.write_all(content)?;
        file.sync_all()?;
        fs::rename(&temp_path, path)
    })();
    if result.is_err() {
        let _ = fs::remove_file(&temp_path);
    }
    result.map_err(io_err)
}
