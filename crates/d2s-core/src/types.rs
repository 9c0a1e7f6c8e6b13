//! Result types of a two-stage estimation

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::{TailPolicy, VarianceMethod};

/// One second-stage regressor with its estimate and uncertainty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TermEstimate {
    /// Regressor label (`treat`, `rel_time::-2`, `treat:g=2005`, …).
    pub label: String,
    /// Relative period for event-study terms.
    pub relative_time: Option<i64>,
    /// Point estimate.
    pub estimate: f64,
    /// Standard error.
    pub std_error: f64,
    /// `estimate / std_error`; `None` when the standard error is zero.
    pub t_stat: Option<f64>,
    /// Two-sided normal p-value; `None` when `t_stat` is.
    pub p_value: Option<f64>,
    /// Lower confidence bound.
    pub ci_lower: f64,
    /// Upper confidence bound.
    pub ci_upper: f64,
    /// Observations with a non-zero regressor value.
    pub n_obs: usize,
    /// Units with a non-zero regressor value.
    pub n_units: usize,
}

/// Relative-time bucketing applied to an event-study specification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketPolicy {
    /// Inclusive window, if any.
    pub window: Option<(i64, i64)>,
    /// Out-of-window policy.
    pub tails: TailPolicy,
    /// Buckets without a regressor.
    pub reference: Vec<i64>,
    /// Observations folded into a boundary bucket.
    pub n_binned: usize,
    /// Observations left without a regressor because they fall outside the window.
    pub n_dropped: usize,
    /// In-window buckets with no observations (omitted from the output).
    pub empty_buckets: Vec<i64>,
}

/// Summary of the untreated-outcome model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FirstStageSummary {
    /// Observations in the stage-1 subsample.
    pub n_obs: usize,
    /// Free parameters (fixed-effect levels net of normalization plus covariates).
    pub n_parameters: usize,
    /// Covariate coefficients `(name, β̂)`.
    pub covariates: Vec<(String, f64)>,
    /// Weighted residual sum of squares on the stage-1 subsample.
    pub rss: f64,
}

/// Bookkeeping attached to every result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EstimationMetadata {
    /// Total observations.
    pub n_obs: usize,
    /// Observations in stage 1.
    pub n_stage1: usize,
    /// Observations with at least one non-zero stage-2 regressor.
    pub n_stage2: usize,
    /// Distinct units.
    pub n_units: usize,
    /// Stage-1 subsample description, e.g. `treat == 0`.
    pub stage1_subsample: String,
    /// Cluster columns (empty = per-observation).
    pub cluster_vars: Vec<String>,
    /// Number of clusters.
    pub n_clusters: usize,
    /// First-stage backend name.
    pub solver: String,
    /// Standard-error method.
    pub variance: VarianceMethod,
    /// Event-study bucketing, if applicable.
    pub buckets: Option<BucketPolicy>,
    /// Units never treated.
    pub never_treated_units: usize,
    /// Never-treated observations with a non-zero stage-2 regressor.
    pub never_treated_stage2_obs: usize,
    /// Bootstrap replicates that failed and were skipped.
    pub bootstrap_failures: usize,
}

/// Output of a two-stage estimation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TwoStageResult {
    /// One row per second-stage regressor.
    pub terms: Vec<TermEstimate>,
    /// Covariance matrix of the estimates (row-major rows).
    pub vcov: Vec<Vec<f64>>,
    /// First-stage summary.
    pub first_stage: FirstStageSummary,
    /// Sizes and options.
    pub metadata: EstimationMetadata,
}

impl TwoStageResult {
    /// Look up a term by label.
    pub fn term(&self, label: &str) -> Option<&TermEstimate> {
        self.terms.iter().find(|t| t.label == label)
    }

    /// Look up an event-study term by relative period.
    pub fn relative(&self, k: i64) -> Option<&TermEstimate> {
        self.terms.iter().find(|t| t.relative_time == Some(k))
    }

    /// Point estimates in term order.
    pub fn estimates(&self) -> Vec<f64> {
        self.terms.iter().map(|t| t.estimate).collect()
    }

    /// Standard errors in term order.
    pub fn std_errors(&self) -> Vec<f64> {
        self.terms.iter().map(|t| t.std_error).collect()
    }
}

impl fmt::Display for TwoStageResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let m = &self.metadata;
        writeln!(
            f,
            "Two-stage DiD: {} obs ({} in stage 1, {} with treatment regressors), {} clusters",
            m.n_obs, m.n_stage1, m.n_stage2, m.n_clusters
        )?;
        writeln!(
            f,
            "{:<20} {:>12} {:>12} {:>9} {:>9} {:>12} {:>12}",
            "term", "estimate", "std.err", "t", "p", "ci.low", "ci.high"
        )?;
        for t in &self.terms {
            writeln!(
                f,
                "{:<20} {:>12.5} {:>12.5} {:>9.3} {:>9.4} {:>12.5} {:>12.5}",
                t.label,
                t.estimate,
                t.std_error,
                t.t_stat.unwrap_or(f64::NAN),
                t.p_value.unwrap_or(f64::NAN),
                t.ci_lower,
                t.ci_upper
            )?;
        }
        Ok(())
    }
}
