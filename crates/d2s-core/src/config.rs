//! Estimator configuration.
//!
//! Every variable is addressed by column name in a [`crate::PanelFrame`].
//! The configuration deserializes from JSON with defaults for all optional
//! fields, so a minimal document only names the outcome, the panel
//! identifiers, the first stage, the treatment regressors and the stage-1
//! indicator.

use serde::{Deserialize, Serialize};

use crate::{Error, PanelFrame, Result};

fn default_conf_level() -> f64 {
    0.95
}

fn default_label() -> String {
    "rel_time".to_string()
}

fn default_replications() -> usize {
    250
}

fn default_seed() -> u64 {
    42
}

fn default_tol() -> f64 {
    1e-10
}

fn default_max_iter() -> usize {
    10_000
}

/// Untreated-outcome model: fixed-effect groupings and covariates.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FirstStageSpec {
    /// Categorical columns absorbed as fixed effects, e.g. `["unit", "year"]`.
    pub fixed_effects: Vec<String>,
    /// Real-valued covariate columns.
    #[serde(default)]
    pub covariates: Vec<String>,
}

impl FirstStageSpec {
    /// Two-way unit/time model without covariates.
    pub fn two_way(unit: impl Into<String>, time: impl Into<String>) -> Self {
        Self { fixed_effects: vec![unit.into(), time.into()], covariates: Vec::new() }
    }

    /// Add covariate columns.
    pub fn with_covariates<I, S>(mut self, covariates: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.covariates.extend(covariates.into_iter().map(Into::into));
        self
    }

    fn columns(&self) -> impl Iterator<Item = &str> {
        self.fixed_effects.iter().chain(&self.covariates).map(String::as_str)
    }
}

/// Handling of relative-time buckets outside the event window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TailPolicy {
    /// Fold into the nearest boundary bucket.
    #[default]
    Bin,
    /// Give no regressor at all.
    Drop,
}

/// Second-stage treatment regressors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TreatSpec {
    /// Single treatment regressor: the static ATT.
    Static {
        /// Treatment column (usually the 0/1 treatment indicator).
        column: String,
    },
    /// One indicator per relative-time bucket `k = t - g`.
    EventStudy {
        /// First-treatment period column.
        cohort: String,
        /// Inclusive `(min, max)` window; `None` keeps every observed bucket.
        #[serde(default)]
        window: Option<(i64, i64)>,
        /// Buckets that get no regressor.
        #[serde(default)]
        reference: Vec<i64>,
        /// Policy for buckets outside `window`.
        #[serde(default)]
        tails: TailPolicy,
        /// Cohort value marking never-treated units.
        #[serde(default)]
        never_treated: i64,
        /// Term label prefix, e.g. `rel_time::-2`.
        #[serde(default = "default_label")]
        label: String,
    },
    /// One treatment regressor per level of a categorical column.
    ByGroup {
        /// Treatment column.
        treatment: String,
        /// Categorical column splitting the effect, e.g. the cohort.
        group: String,
    },
}

impl TreatSpec {
    /// Static effect of `column`.
    pub fn static_effect(column: impl Into<String>) -> Self {
        TreatSpec::Static { column: column.into() }
    }

    /// Event study over every observed bucket, binning nothing.
    pub fn event_study(cohort: impl Into<String>) -> Self {
        TreatSpec::EventStudy {
            cohort: cohort.into(),
            window: None,
            reference: Vec::new(),
            tails: TailPolicy::Bin,
            never_treated: 0,
            label: default_label(),
        }
    }

    /// Columns that define the second-stage regressors.
    pub fn columns(&self) -> Vec<&str> {
        match self {
            TreatSpec::Static { column } => vec![column.as_str()],
            TreatSpec::EventStudy { cohort, .. } => vec![cohort.as_str()],
            TreatSpec::ByGroup { treatment, group } => vec![treatment.as_str(), group.as_str()],
        }
    }
}

/// How second-stage standard errors are obtained.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum VarianceMethod {
    /// GMM sandwich over both stages' influence functions.
    #[default]
    Analytic,
    /// Cluster bootstrap of both stages.
    Bootstrap {
        /// Number of resamples.
        #[serde(default = "default_replications")]
        replications: usize,
        /// Base seed; replicate `b` uses `seed + b`.
        #[serde(default = "default_seed")]
        seed: u64,
    },
}

/// Backend for the first-stage normal equations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub enum SolverKind {
    /// Schur-complement factorization (dense in all but the first grouping).
    #[default]
    Direct,
    /// Block Gauss–Seidel sweeps over the groupings.
    Iterative {
        /// Convergence tolerance on the largest coefficient update.
        #[serde(default = "default_tol")]
        tol: f64,
        /// Iteration cap.
        #[serde(default = "default_max_iter")]
        max_iter: usize,
    },
}

/// Full configuration of a two-stage estimation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EstimatorConfig {
    /// Outcome column.
    pub outcome: String,
    /// Unit identifier column.
    pub unit: String,
    /// Integer period column.
    pub time: String,
    /// Untreated-outcome model.
    pub first_stage: FirstStageSpec,
    /// Second-stage regressors.
    pub treat_spec: TreatSpec,
    /// 0/1 column; rows with 0 form the stage-1 subsample.
    pub treatment_indicator: String,
    /// Cluster columns (intersection if several; none = per observation).
    #[serde(default)]
    pub cluster_vars: Vec<String>,
    /// Optional non-negative weight column.
    #[serde(default)]
    pub weights: Option<String>,
    /// Standard-error method.
    #[serde(default)]
    pub variance: VarianceMethod,
    /// First-stage backend.
    #[serde(default)]
    pub solver: SolverKind,
    /// Confidence level of reported bounds.
    #[serde(default = "default_conf_level")]
    pub conf_level: f64,
    /// Apply the G/(G-1) finite-cluster factor.
    #[serde(default)]
    pub cluster_adjustment: bool,
}

impl EstimatorConfig {
    /// Two-way fixed-effects first stage, static effect of `treatment`,
    /// clustered by unit.
    pub fn static_two_way(
        outcome: impl Into<String>,
        unit: impl Into<String>,
        time: impl Into<String>,
        treatment: impl Into<String>,
    ) -> Self {
        let unit = unit.into();
        let time = time.into();
        let treatment = treatment.into();
        Self {
            outcome: outcome.into(),
            first_stage: FirstStageSpec::two_way(unit.clone(), time.clone()),
            treat_spec: TreatSpec::static_effect(treatment.clone()),
            treatment_indicator: treatment,
            cluster_vars: vec![unit.clone()],
            unit,
            time,
            weights: None,
            variance: VarianceMethod::Analytic,
            solver: SolverKind::Direct,
            conf_level: default_conf_level(),
            cluster_adjustment: false,
        }
    }

    /// Replace the second-stage regressors.
    pub fn with_treat_spec(mut self, treat_spec: TreatSpec) -> Self {
        self.treat_spec = treat_spec;
        self
    }

    /// Replace the stage-1 indicator (e.g. by an anticipation-shifted one).
    pub fn with_treatment_indicator(mut self, column: impl Into<String>) -> Self {
        self.treatment_indicator = column.into();
        self
    }

    /// Parse from JSON.
    pub fn from_json(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks that need no data.
    pub fn validate(&self) -> Result<()> {
        if self.first_stage.fixed_effects.is_empty() {
            return Err(Error::Configuration(
                "first stage needs at least one fixed-effect grouping".into(),
            ));
        }
        let first_stage: Vec<&str> = self.first_stage.columns().collect();
        for col in self.treat_spec.columns() {
            if first_stage.contains(&col) {
                return Err(Error::Configuration(format!(
                    "treatment column `{}` also appears in the first stage",
                    col
                )));
            }
        }
        if first_stage.contains(&self.treatment_indicator.as_str()) {
            return Err(Error::Configuration(format!(
                "treatment indicator `{}` also appears in the first stage",
                self.treatment_indicator
            )));
        }
        if first_stage.contains(&self.outcome.as_str()) {
            return Err(Error::Configuration(format!(
                "outcome `{}` also appears in the first stage",
                self.outcome
            )));
        }
        if !(self.conf_level > 0.0 && self.conf_level < 1.0) {
            return Err(Error::Configuration(format!(
                "conf_level must be in (0, 1), got {}",
                self.conf_level
            )));
        }
        if let TreatSpec::EventStudy { window: Some((lo, hi)), .. } = &self.treat_spec {
            if lo > hi {
                return Err(Error::Configuration(format!(
                    "event window ({}, {}) is empty",
                    lo, hi
                )));
            }
        }
        if let VarianceMethod::Bootstrap { replications, .. } = self.variance {
            if replications < 2 {
                return Err(Error::Configuration("bootstrap needs at least 2 replications".into()));
            }
        }
        if let SolverKind::Iterative { tol, max_iter } = self.solver {
            if tol.is_nan() || tol <= 0.0 || max_iter == 0 {
                return Err(Error::Configuration(
                    "iterative solver needs tol > 0 and max_iter > 0".into(),
                ));
            }
        }
        Ok(())
    }

    /// [`EstimatorConfig::validate`] plus column existence against `frame`.
    pub fn validate_against(&self, frame: &PanelFrame) -> Result<()> {
        self.validate()?;
        let mut required = vec![
            self.outcome.as_str(),
            self.unit.as_str(),
            self.time.as_str(),
            self.treatment_indicator.as_str(),
        ];
        required.extend(self.first_stage.columns());
        required.extend(self.treat_spec.columns());
        required.extend(self.weights.as_deref());
        for col in required {
            if !frame.has_column(col) {
                return Err(Error::Configuration(format!("column `{}` not found", col)));
            }
        }
        for col in &self.cluster_vars {
            if !frame.has_column(col) {
                return Err(Error::Configuration(format!(
                    "cluster variable `{}` not found",
                    col
                )));
            }
        }
        Ok(())
    }
}
