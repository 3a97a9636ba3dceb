use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use vfec_core::{FailureKind, UnitKey, UnitStage, VfecError};

/// One failure, scoped to the smallest unit it affects.
///
/// # Examples
///
/// ```
/// use vfec_core::{FailureKind, UnitKey, UnitStage};
/// use vfec_pipeline::FailureRecord;
///
/// let key = UnitKey { project: "curl".into(), commit: "da0db499".into(), test: "1300".into() };
/// let record = FailureRecord::new(key, UnitStage::Built, FailureKind::TestExecution, "exit code 1");
/// assert_eq!(record.kind, FailureKind::TestExecution);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureRecord {
    pub key: UnitKey,
    /// Last stage the unit reached before failing.
    pub stage: UnitStage,
    pub kind: FailureKind,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl FailureRecord {
    pub fn new(
        key: UnitKey,
        stage: UnitStage,
        kind: FailureKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            key,
            stage,
            kind,
            message: message.into(),
            at: Utc::now(),
        }
    }
}

type StageObserver = Box<dyn Fn(&UnitKey, UnitStage) + Send + Sync>;

/// Explicit state of one run, threaded through the pipeline.
///
/// Collects failure records and notifies an optional observer of stage
/// transitions (the CLI drives its progress bar from it).
#[derive(Default)]
pub struct RunContext {
    failures: Vec<FailureRecord>,
    observer: Option<StageObserver>,
}

impl RunContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_observer<F>(mut self, observer: F) -> Self
    where
        F: Fn(&UnitKey, UnitStage) + Send + Sync + 'static,
    {
        self.observer = Some(Box::new(observer));
        self
    }

    pub(crate) fn advanced(&self, key: &UnitKey, stage: UnitStage) {
        tracing::debug!(unit = %key, stage = %stage, "unit advanced");
        if let Some(observer) = &self.observer {
            observer(key, stage);
        }
    }

    /// Record `error` against `key`.
    ///
    /// Recording does not end the unit; some failures (a failing test, one
    /// lost repetition) leave it running.
    ///
    /// Errors outside the failure taxonomy are recorded as
    /// [`FailureKind::Environment`] unless `kind` overrides them.
    pub fn fail(
        &mut self,
        key: &UnitKey,
        stage: UnitStage,
        kind: Option<FailureKind>,
        error: &VfecError,
    ) -> &FailureRecord {
        let kind = kind
            .or_else(|| error.kind())
            .unwrap_or(FailureKind::Environment);
        tracing::warn!(unit = %key, stage = %stage, kind = %kind, error = %error, "failure recorded");

        self.failures
            .push(FailureRecord::new(key.clone(), stage, kind, error.to_string()));
        &self.failures[self.failures.len() - 1]
    }

    pub fn failures(&self) -> &[FailureRecord] {
        &self.failures
    }

    /// Drain the records collected so far.
    pub fn take_failures(&mut self) -> Vec<FailureRecord> {
        std::mem::take(&mut self.failures)
    }
}

impl std::fmt::Debug for RunContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunContext")
            .field("failures", &self.failures)
            .field("observer", &self.observer.is_some())
            .finish()
    }
}
