//! # d2s-inference
//!
//! Numerical procedures for two-stage difference-in-differences.
//!
//! This crate provides:
//! - [`TwoStageEstimator`]: the imputation estimator with GMM or bootstrap
//!   standard errors,
//! - [`twfe`]: the conventional two-way fixed-effects baseline,
//! - [`simulate_panel`]: a staggered-adoption data generator for tests and
//!   benchmarks.
//!
//! ## Architecture
//!
//! The estimator depends on the [`FixedEffectSolver`] trait, NOT on a
//! concrete backend. Data and configuration types live in `d2s-core`.

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Two-stage DiD, its building blocks and the TWFE baseline.
pub mod econometrics;
/// Synthetic staggered-adoption panels.
pub mod simulate;

pub use econometrics::{
    DirectSolver, FixedEffectSolver, IterativeSolver, TwfeResult, TwoStageEstimator,
    shift_for_anticipation, twfe,
};
pub use simulate::{EffectShape, SimulationConfig, simulate_panel};
