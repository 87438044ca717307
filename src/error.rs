use crate::build::{BuildState, Phase, StepStatus};
use crate::formula::ChecksumAlgorithm;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Whether a failed fetch is worth another attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchErrorKind {
    /// Connection reset, refused, 5xx, 429.
    Transient,
    /// The wait exceeded the configured fetch timeout.
    Timeout,
    /// 404 and friends. Retrying will not help.
    Permanent,
}

impl FetchErrorKind {
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Transient | Self::Timeout)
    }
}

impl fmt::Display for FetchErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient => f.write_str("transient"),
            Self::Timeout => f.write_str("timeout"),
            Self::Permanent => f.write_str("permanent"),
        }
    }
}

#[derive(Error, Debug, Clone)]
pub enum DebrewError {
    #[error("Malformed formula: {0}")]
    MalformedFormula(String),

    #[error("Fetch of {url} failed ({kind}): {reason}")]
    FetchError {
        url: String,
        kind: FetchErrorKind,
        reason: String,
    },

    #[error("Checksum mismatch for {url}: expected {algorithm} {expected}, got {actual}")]
    ChecksumMismatch {
        url: String,
        algorithm: ChecksumAlgorithm,
        expected: String,
        actual: String,
    },

    #[error("Extraction failed: {0}")]
    ExtractError(String),

    #[error("Patch #{index} ({patch}) failed: {reason}")]
    PatchFailed {
        index: usize,
        patch: String,
        reason: String,
    },

    #[error("{phase} step #{index} `{command}` {status}")]
    BuildStepFailed {
        phase: Phase,
        index: usize,
        command: String,
        status: StepStatus,
        output: String,
    },

    #[error("Build executor is {0}, a fresh run must start from unbuilt")]
    NotRunnable(BuildState),

    #[error("Assembly failed: {0}")]
    AssemblyError(String),

    #[error("Update check failed: {0}")]
    UpdateCheck(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    IoError(Arc<std::io::Error>),

    #[error("Failed to parse JSON: {0}")]
    JsonError(Arc<serde_json::Error>),
}

impl DebrewError {
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedFormula(msg.into())
    }

    pub fn fetch(url: &str, kind: FetchErrorKind, reason: impl fmt::Display) -> Self {
        Self::FetchError {
            url: url.to_string(),
            kind,
            reason: reason.to_string(),
        }
    }

    pub fn assembly(msg: impl Into<String>) -> Self {
        Self::AssemblyError(msg.into())
    }

    pub fn update(msg: impl Into<String>) -> Self {
        Self::UpdateCheck(msg.into())
    }

    /// True for fetch failures that the retry loop may attempt again.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::FetchError { kind, .. } if kind.is_retryable())
    }
}

impl From<std::io::Error> for DebrewError {
    fn from(err: std::io::Error) -> Self {
        Self::IoError(Arc::new(err))
    }
}

impl From<serde_json::Error> for DebrewError {
    fn from(err: serde_json::Error) -> Self {
        Self::JsonError(Arc::new(err))
    }
}

pub type Result<T> = std::result::Result<T, DebrewError>;

/// Pipeline stage a failure happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Prepare,
    Fetch,
    Extract,
    Patch,
    Build,
    Assemble,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Prepare => "prepare",
            Self::Fetch => "fetch",
            Self::Extract => "extract",
            Self::Patch => "patch",
            Self::Build => "build",
            Self::Assemble => "assemble",
        };
        f.write_str(name)
    }
}

/// A component failure with enough context to act on: which formula, which
/// stage, and the underlying cause.
#[derive(Error, Debug, Clone)]
#[error("{formula} {version}: {stage} failed: {source}")]
pub struct PipelineError {
    pub formula: String,
    pub version: String,
    pub stage: Stage,
    #[source]
    pub source: DebrewError,
}

impl PipelineError {
    pub fn new(formula: &str, version: &str, stage: Stage, source: DebrewError) -> Self {
        Self {
            formula: formula.to_string(),
            version: version.to_string(),
            stage,
            source,
        }
    }
}
