use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Errors that can occur across vfec.
///
/// Each variant wraps a specific error domain. Library crates use this type
/// directly; the binary crate converts to `miette` diagnostics at the boundary.
///
/// # Examples
///
/// ```
/// use vfec_core::{FailureKind, VfecError};
///
/// let err = VfecError::Calibration("dry run exited with 139".into());
/// assert!(err.to_string().contains("139"));
/// assert_eq!(err.kind(), Some(FailureKind::Calibration));
/// ```
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum VfecError {
    /// Filesystem I/O failure.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid or missing configuration.
    #[error("configuration error: {0}")]
    #[diagnostic(code(vfec::config), help("check vfec.toml or the file passed with --config"))]
    Config(String),

    /// Git operation failure.
    #[error("git error: {0}")]
    Git(String),

    /// Malformed diff hunk or coverage record.
    #[error("parse error: {0}")]
    Parse(String),

    /// A configure or build step exited unsuccessfully.
    #[error("build failed for {project}@{commit}: {detail}")]
    Build {
        /// Project identity.
        project: String,
        /// Commit being built.
        commit: String,
        /// Failing step and its captured output tail.
        detail: String,
    },

    /// A test invocation exited unsuccessfully.
    #[error("test {test} failed: {detail}")]
    TestExecution {
        /// Test identifier.
        test: String,
        /// Exit status and captured output tail.
        detail: String,
    },

    /// A counter-sampling invocation failed or produced no usable counters.
    #[error("measurement error: {0}")]
    Measurement(String),

    /// The calibration dry run did not complete successfully.
    #[error("calibration error: {0}")]
    Calibration(String),

    /// A child process exceeded its time limit and was terminated.
    #[error("{program} timed out after {limit:?}")]
    #[diagnostic(help("raise the timeouts under [execution] or [energy]"))]
    Timeout {
        /// Program that was terminated.
        program: String,
        /// Configured limit.
        limit: Duration,
    },

    /// State ledger failure.
    #[error("database error: {0}")]
    Database(String),

    /// JSON serialization / deserialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML deserialization failure.
    #[error("TOML parse error: {0}")]
    #[diagnostic(code(vfec::config))]
    Toml(#[from] toml::de::Error),

    /// A required file was not found.
    #[error("file not found: {}", .0.display())]
    FileNotFound(PathBuf),
}

impl VfecError {
    /// Map this error onto the failure taxonomy used in failure records.
    ///
    /// Timeouts count as the failure of whatever was running; callers that
    /// know the stage override this via [`FailureKind`] directly.
    pub fn kind(&self) -> Option<FailureKind> {
        match self {
            VfecError::Parse(_) => Some(FailureKind::Parse),
            VfecError::Build { .. } => Some(FailureKind::Build),
            VfecError::TestExecution { .. } => Some(FailureKind::TestExecution),
            VfecError::Measurement(_) => Some(FailureKind::Measurement),
            VfecError::Calibration(_) => Some(FailureKind::Calibration),
            _ => None,
        }
    }
}

/// Failure classes, each with its own propagation scope.
///
/// | Kind            | Scope of the failure                         |
/// |-----------------|----------------------------------------------|
/// | `Parse`         | one hunk header or coverage record           |
/// | `Build`         | every remaining phase of one commit          |
/// | `TestExecution` | one test run (artifacts are still extracted) |
/// | `Measurement`   | one sampling repetition                      |
/// | `Calibration`   | the energy phase of one test                 |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Parse,
    Build,
    TestExecution,
    Measurement,
    Calibration,
    /// Anything outside the taxonomy (I/O, git, ledger).
    Environment,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureKind::Parse => "parse",
            FailureKind::Build => "build",
            FailureKind::TestExecution => "test_execution",
            FailureKind::Measurement => "measurement",
            FailureKind::Calibration => "calibration",
            FailureKind::Environment => "environment",
        };
        f.write_str(s)
    }
}
