//! Per-unit orchestration of checkout, build, coverage, and energy phases.
//!
//! Ties the diff, coverage, and energy engines to a working tree:
//! - [`adapter`]: the build capability interface and its profile-driven
//!   implementation
//! - [`worktree`]: checkout of one commit into the shared working tree
//! - [`context`]: structured failure records for a run
//! - [`state`]: resumable per-(project, commit, test) stage ledger
//! - [`pipeline`]: the state machine driving one commit pair

pub mod adapter;
pub mod context;
pub mod pipeline;
pub mod state;
pub mod worktree;

pub use adapter::{BuildAdapter, ProfileAdapter};
pub use context::{FailureRecord, RunContext};
pub use pipeline::{PairOutcome, Pipeline, TestOutcome};
pub use state::{StateLedger, UnitRecord, UnitStatus};
pub use worktree::{GitWorkTree, WorkTree};
