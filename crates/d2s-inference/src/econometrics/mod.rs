//! Difference-in-differences under staggered adoption.
//!
//! This module provides:
//! - **Two-stage DiD** (imputation estimator): untreated-outcome model fitted
//!   on untreated rows, residualized outcomes regressed on treatment terms,
//!   GMM standard errors accounting for the generated dependent variable.
//! - **Fixed-effect backends**: direct Schur-complement factorization and
//!   iterative block Gauss–Seidel behind the [`FixedEffectSolver`] trait.
//! - **Event-study regressors** with windows, tail binning and reference
//!   periods.
//! - **Cluster bootstrap** of both stages (Rayon-parallel, seeded).
//! - **TWFE baseline** with alternating-projections demeaning and
//!   cluster-robust (Liang–Zeger) standard errors.

pub mod anticipation;
pub mod bootstrap;
pub mod design;
pub mod did2s;
pub mod event;
pub mod hdfe;
mod inputs;
pub mod sandwich;
pub mod solver;
pub mod twfe;

pub use anticipation::shift_for_anticipation;
pub use bootstrap::{BootstrapDraws, cluster_bootstrap};
pub use design::{FirstStageDesign, Grouping, Rows};
pub use did2s::TwoStageEstimator;
pub use event::{EventOptions, StageTwoDesign, event_design, grouped_design, static_design};
pub use hdfe::AlternatingProjections;
pub use sandwich::{cluster_robust_vcov, two_stage_vcov};
pub use solver::{DirectSolver, FirstStageFit, FixedEffectSolver, IterativeSolver, NormalEquations};
pub use twfe::{TwfeResult, twfe};
