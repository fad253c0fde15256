//! Domain types shared across the BoostGrid crates.
//!
//! Tasks are immutable once submitted. Instances are only ever described
//! here by the lightweight `InstanceHandle` handed to execution providers;
//! the pool owns the full instance record.

use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Unique identifier for a submitted task.
pub type TaskId = String;

/// Unique identifier for a booster instance.
pub type InstanceId = String;

// ── Task ──────────────────────────────────────────────────────────

/// Scheduling priority attached to a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

/// A code-transformation request.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Task {
    /// Transformation kind, e.g. "refactor" or "format".
    pub kind: Option<String>,
    /// Legacy alias for `kind`; either one satisfies validation.
    pub operation: Option<String>,
    pub file_path: Option<String>,
    /// Caller-estimated complexity (0.0–1.0).
    pub complexity: Option<f64>,
    #[serde(default)]
    pub priority: Priority,
    /// Opaque body forwarded to the execution provider.
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Task {
    /// Create a task of the given kind with default priority.
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: Some(kind.into()),
            ..Self::default()
        }
    }

    pub fn with_file_path(mut self, path: impl Into<String>) -> Self {
        self.file_path = Some(path.into());
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_complexity(mut self, complexity: f64) -> Self {
        self.complexity = Some(complexity);
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    /// The operation kind, preferring `kind` over `operation`.
    ///
    /// Blank strings count as missing.
    pub fn operation_kind(&self) -> Option<&str> {
        self.kind
            .as_deref()
            .or(self.operation.as_deref())
            .map(str::trim)
            .filter(|k| !k.is_empty())
    }

    /// Lower-cased file extension of `file_path`, if any.
    pub fn file_type(&self) -> Option<String> {
        let path = self.file_path.as_deref()?;
        Path::new(path)
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase)
    }
}

// ── Routing ───────────────────────────────────────────────────────

/// Which execution path a routing decision points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    Booster,
    General,
}

/// A routing decision produced by the external router.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub kind: TargetKind,
    pub id: String,
}

impl Target {
    pub fn booster(id: impl Into<String>) -> Self {
        Self {
            kind: TargetKind::Booster,
            id: id.into(),
        }
    }

    pub fn general(id: impl Into<String>) -> Self {
        Self {
            kind: TargetKind::General,
            id: id.into(),
        }
    }
}

// ── Instances ─────────────────────────────────────────────────────

/// What an execution provider needs to know about a pooled instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceHandle {
    pub id: InstanceId,
    pub specializations: BTreeSet<String>,
}

/// Capabilities reported by the driver when an instance finishes launching.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct InstanceProfile {
    /// File types this instance is tuned for (lower-case extensions).
    pub specializations: BTreeSet<String>,
    /// Overrides the pool-wide per-instance concurrency when set.
    pub max_concurrent_tasks: Option<u32>,
}

impl InstanceProfile {
    pub fn with_specializations<I, S>(specializations: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            specializations: specializations.into_iter().map(Into::into).collect(),
            max_concurrent_tasks: None,
        }
    }
}

// ── Execution ─────────────────────────────────────────────────────

/// Successful result of running a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOutput {
    pub data: serde_json::Value,
    /// Execution time as measured by the provider.
    pub exec_time: Duration,
}

/// Failure taxonomy for execution errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Panic,
    MemoryError,
    StackOverflow,
    Timeout,
    CompilationError,
    TypeError,
    ReferenceError,
    RangeError,
    ConnectionError,
    ResourceError,
    Unknown,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Panic => "panic",
            Self::MemoryError => "memory_error",
            Self::StackOverflow => "stack_overflow",
            Self::Timeout => "timeout",
            Self::CompilationError => "compilation_error",
            Self::TypeError => "type_error",
            Self::ReferenceError => "reference_error",
            Self::RangeError => "range_error",
            Self::ConnectionError => "connection_error",
            Self::ResourceError => "resource_error",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How bad a classified error is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// Error returned by execution providers.
///
/// Providers should set `kind` directly. Untyped errors are classified by
/// matching on `message`.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{message}")]
pub struct ExecutionError {
    pub kind: Option<ErrorKind>,
    pub message: String,
}

impl ExecutionError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind: Some(kind),
            message: message.into(),
        }
    }

    /// An error without a typed kind.
    pub fn untyped(message: impl Into<String>) -> Self {
        Self {
            kind: None,
            message: message.into(),
        }
    }
}
