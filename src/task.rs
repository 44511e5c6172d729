//! Task descriptors — the unit of propagation.
//!
//! A `Task` is built by the interception facade after a local mutation
//! succeeds. Its metadata travels on the command channel as JSON; its
//! content (if any) travels over the data plane.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// The filesystem mutation a task replicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OperationKind {
    Write,
    Append,
    Copy,
    Move,
    Rename,
    MkdirTree,
    Symlink,
    Unlink,
    StreamWrite,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Write => "write",
            OperationKind::Append => "append",
            OperationKind::Copy => "copy",
            OperationKind::Move => "move",
            OperationKind::Rename => "rename",
            OperationKind::MkdirTree => "mkdirTree",
            OperationKind::Symlink => "symlink",
            OperationKind::Unlink => "unlink",
            OperationKind::StreamWrite => "streamWrite",
        }
    }

    /// Whether this operation carries file content over the data plane.
    pub fn carries_content(&self) -> bool {
        matches!(
            self,
            OperationKind::Write
                | OperationKind::Append
                | OperationKind::Copy
                | OperationKind::Move
                | OperationKind::StreamWrite
        )
    }
}

/// Content attached to a task.
#[derive(Debug, Clone)]
pub enum TaskPayload {
    /// No content (unlink, mkdirTree, symlink, site-local two-path ops).
    None,
    /// Content known at interception time.
    Inline(Bytes),
    /// Content streamed from a local file at send time.
    File(PathBuf),
}

impl TaskPayload {
    pub fn is_none(&self) -> bool {
        matches!(self, TaskPayload::None)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            TaskPayload::None => "none",
            TaskPayload::Inline(_) => "inline",
            TaskPayload::File(_) => "file",
        }
    }
}

/// Operation-specific flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskOptions {
    /// Remove an existing destination before copy/move.
    #[serde(default)]
    pub replace: bool,
    /// The first path of a two-path operation lies inside a watched
    /// directory, so the receiver can resolve it under its own root.
    #[serde(default)]
    pub source_in_site: bool,
    /// The operation targets a directory tree rather than a single file.
    #[serde(default)]
    pub dir: bool,
}

/// A single filesystem mutation to be replicated.
#[derive(Debug, Clone)]
pub struct Task {
    pub op: OperationKind,
    /// One path, or source-then-destination for two-path operations.
    pub paths: Vec<PathBuf>,
    pub payload: TaskPayload,
    pub options: TaskOptions,
    pub description: String,
    pub origin: String,
    pub created_at: DateTime<Utc>,
    /// Monotonic per `paths[0]`, assigned by the dispatcher.
    pub seq: u64,
}

impl Task {
    pub fn new(op: OperationKind, paths: Vec<PathBuf>, payload: TaskPayload) -> Self {
        debug_assert!(!paths.is_empty());
        let description = default_description(op, &paths);
        Self {
            op,
            paths,
            payload,
            options: TaskOptions::default(),
            description,
            origin: String::new(),
            created_at: Utc::now(),
            seq: 0,
        }
    }

    pub fn with_options(mut self, options: TaskOptions) -> Self {
        self.options = options;
        self
    }

    /// The ordering key: first source path.
    pub fn source(&self) -> &Path {
        &self.paths[0]
    }

    /// Apply a caller-supplied directive override.
    pub fn apply_override(&mut self, op: Option<OperationKind>, description: Option<String>) {
        if let Some(op) = op {
            self.op = op;
        }
        if let Some(description) = description {
            self.description = description;
        }
    }

    /// Metadata record published on the command channel.
    pub fn to_record(&self) -> TaskRecord {
        TaskRecord {
            op: self.op,
            paths: self.paths.clone(),
            options: self.options,
            description: self.description.clone(),
            origin: self.origin.clone(),
            created_at: self.created_at,
            seq: self.seq,
            payload: self.payload.kind().to_string(),
        }
    }
}

/// Serialized form of a task's metadata (the broker message body).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    pub op: OperationKind,
    pub paths: Vec<PathBuf>,
    pub options: TaskOptions,
    pub description: String,
    pub origin: String,
    pub created_at: DateTime<Utc>,
    pub seq: u64,
    pub payload: String,
}

fn default_description(op: OperationKind, paths: &[PathBuf]) -> String {
    match paths {
        [single] => format!("{} {}", op.as_str(), single.display()),
        [src, dst, ..] => format!("{} {} -> {}", op.as_str(), src.display(), dst.display()),
        [] => op.as_str().to_string(),
    }
}

/// Optional per-call override, consumed by the facade before the local
/// action runs. A dedicated type so it can never be mistaken for a real
/// argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    /// Suppress task generation entirely; only the local action runs.
    Skip,
    /// Replace the inferred operation kind and/or description.
    Override {
        op: Option<OperationKind>,
        description: Option<String>,
    },
}

impl Directive {
    pub fn skip() -> Self {
        Directive::Skip
    }

    pub fn describe(description: impl Into<String>) -> Self {
        Directive::Override {
            op: None,
            description: Some(description.into()),
        }
    }

    pub fn retag(op: OperationKind, description: impl Into<String>) -> Self {
        Directive::Override {
            op: Some(op),
            description: Some(description.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_description_single_path() {
        let task = Task::new(
            OperationKind::Write,
            vec![PathBuf::from("sites/a/file.txt")],
            TaskPayload::Inline(Bytes::from_static(b"x")),
        );
        assert_eq!(task.description, "write sites/a/file.txt");
    }

    #[test]
    fn default_description_two_paths() {
        let task = Task::new(
            OperationKind::Copy,
            vec![PathBuf::from("a"), PathBuf::from("b")],
            TaskPayload::None,
        );
        assert_eq!(task.description, "copy a -> b");
    }

    #[test]
    fn override_replaces_fields() {
        let mut task = Task::new(
            OperationKind::Write,
            vec![PathBuf::from("f")],
            TaskPayload::None,
        );
        task.apply_override(Some(OperationKind::StreamWrite), Some("custom".into()));
        assert_eq!(task.op, OperationKind::StreamWrite);
        assert_eq!(task.description, "custom");
    }

    #[test]
    fn record_roundtrips_as_json() {
        let mut task = Task::new(
            OperationKind::Unlink,
            vec![PathBuf::from("sites/a/file.txt")],
            TaskPayload::None,
        );
        task.origin = "primary".into();
        task.seq = 7;

        let body = serde_json::to_vec(&task.to_record()).unwrap();
        let parsed: TaskRecord = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed.op, OperationKind::Unlink);
        assert_eq!(parsed.seq, 7);
        assert_eq!(parsed.origin, "primary");
        assert_eq!(parsed.payload, "none");
    }
}
