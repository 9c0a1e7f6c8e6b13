//! # d2s-core
//!
//! Core types for two-stage difference-in-differences estimation.
//!
//! This crate holds no numerics. It provides:
//! - [`PanelFrame`]: named, typed columns of panel data,
//! - [`EstimatorConfig`]: what to estimate, addressed by column name,
//! - [`TwoStageResult`]: estimates, covariance and metadata,
//! - [`Error`]: the single error type of the workspace.

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Estimator configuration.
pub mod config;
/// Error types.
pub mod error;
/// Columnar panel data.
pub mod frame;
/// Result types.
pub mod types;

pub use config::{
    EstimatorConfig, FirstStageSpec, SolverKind, TailPolicy, TreatSpec, VarianceMethod,
};
pub use error::{Error, Result};
pub use frame::{Codes, Column, PanelFrame};
pub use types::{BucketPolicy, EstimationMetadata, FirstStageSummary, TermEstimate, TwoStageResult};
