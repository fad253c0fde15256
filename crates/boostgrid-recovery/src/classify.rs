//! Error classification.
//!
//! Providers are expected to return a typed [`ErrorKind`]. Untyped errors go
//! through a message-matching shim; the first pattern that matches wins.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use boostgrid_core::{ErrorKind, ExecutionError, Severity};

/// Broad grouping of error kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Runtime,
    Resource,
    Execution,
    Compilation,
    Network,
    Unknown,
}

/// Result of classifying one error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub error_type: ErrorKind,
    pub severity: Severity,
    pub recoverable: bool,
    /// Same instance and type hit the pattern threshold within the window.
    pub requires_fallback: bool,
    pub category: ErrorCategory,
}

/// Fixed severity, recoverability, and category for a kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorProfile {
    pub severity: Severity,
    pub recoverable: bool,
    pub category: ErrorCategory,
}

impl ErrorProfile {
    pub fn for_kind(kind: ErrorKind) -> Self {
        use ErrorCategory as C;
        use Severity as S;
        let (severity, recoverable, category) = match kind {
            ErrorKind::Panic => (S::Critical, true, C::Runtime),
            ErrorKind::MemoryError => (S::Critical, true, C::Resource),
            ErrorKind::StackOverflow => (S::High, true, C::Runtime),
            ErrorKind::Timeout => (S::Medium, true, C::Execution),
            ErrorKind::CompilationError => (S::High, false, C::Compilation),
            ErrorKind::TypeError | ErrorKind::ReferenceError | ErrorKind::RangeError => {
                (S::Medium, true, C::Runtime)
            }
            ErrorKind::ConnectionError => (S::Medium, true, C::Network),
            ErrorKind::ResourceError => (S::High, true, C::Resource),
            ErrorKind::Unknown => (S::Medium, true, C::Unknown),
        };
        Self {
            severity,
            recoverable,
            category,
        }
    }

    pub fn classification(self, error_type: ErrorKind, requires_fallback: bool) -> Classification {
        Classification {
            error_type,
            severity: self.severity,
            recoverable: self.recoverable,
            requires_fallback,
            category: self.category,
        }
    }
}

const MESSAGE_PATTERNS: &[(ErrorKind, &str)] = &[
    (ErrorKind::StackOverflow, r"(?i)stack overflow|maximum call stack|too much recursion"),
    (ErrorKind::MemoryError, r"(?i)out of memory|\boom\b|allocation failed|heap limit|memory"),
    (ErrorKind::Panic, r"(?i)\bpanic|unreachable|\babort"),
    (ErrorKind::Timeout, r"(?i)timed? ?out|deadline exceeded"),
    (ErrorKind::CompilationError, r"(?i)compil|syntax ?error|parse error"),
    (ErrorKind::TypeError, r"(?i)type ?error|is not a function|cannot read propert"),
    (ErrorKind::ReferenceError, r"(?i)reference ?error|is not defined"),
    (ErrorKind::RangeError, r"(?i)range ?error|out of range|out of bounds"),
    (ErrorKind::ConnectionError, r"(?i)connection|econnrefused|econnreset|network|socket"),
    (ErrorKind::ResourceError, r"(?i)resource|too many open files|quota|exhausted"),
];

static MESSAGE_MATCHERS: LazyLock<Vec<(ErrorKind, Regex)>> = LazyLock::new(|| {
    MESSAGE_PATTERNS
        .iter()
        .filter_map(|(kind, pattern)| Regex::new(pattern).ok().map(|re| (*kind, re)))
        .collect()
});

/// Kind of an execution error: the typed kind if present, else the message shim.
pub fn classify_kind(error: &ExecutionError) -> ErrorKind {
    error.kind.unwrap_or_else(|| kind_from_message(&error.message))
}

/// Match a free-form message against the known patterns.
pub fn kind_from_message(message: &str) -> ErrorKind {
    MESSAGE_MATCHERS
        .iter()
        .find(|(_, re)| re.is_match(message))
        .map_or(ErrorKind::Unknown, |(kind, _)| *kind)
}
