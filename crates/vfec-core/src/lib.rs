//! Core types, configuration, error handling, and process execution for vfec.
//!
//! This crate provides the shared foundation used by all other vfec crates:
//! - [`VfecError`]: unified error type using `thiserror`, plus [`FailureKind`]
//! - [`VfecConfig`]: configuration loaded from `vfec.toml`
//! - Shared data model: [`DiffHunk`], [`LineCorrespondence`],
//!   [`LineClassification`], [`EnergyMeasurement`], [`CalibrationResult`],
//!   [`AggregatedMetric`], [`UnitKey`], [`UnitStage`]
//! - [`exec`]: argument-vector command descriptors and the process runner

mod config;
mod error;
pub mod exec;
mod types;

pub use config::{
    secs_to_duration, BuildSystem, CoverageConfig, EnergyConfig, ExecutionConfig, ProjectProfile,
    StateConfig, VfecConfig,
};
pub use error::{FailureKind, VfecError};
pub use types::{
    AggregatedMetric, CalibrationResult, ChangeType, DiffHunk, EnergyMeasurement,
    LineClassification, LineCorrespondence, OutputFormat, PairKey, Side, SourceLookup, UnitKey,
    UnitStage,
};

/// A convenience `Result` type for vfec operations.
pub type Result<T> = std::result::Result<T, VfecError>;
