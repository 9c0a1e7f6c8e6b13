//! Two-stage difference-in-differences (imputation) estimator.
//!
//! Stage 1 fits the untreated-outcome model `y = μ_i + μ_t + X β` on rows
//! whose treatment indicator is 0. Every row is then residualized against
//! its imputed untreated outcome, and stage 2 regresses that residual on the
//! treatment regressors (static indicator, relative-time buckets, or
//! group-specific indicators) without an intercept.
//!
//! Because the stage-2 dependent variable is generated by stage 1, the
//! reported covariance stacks both stages' moment conditions (GMM) instead of
//! trusting the stage-2 OLS residuals alone; see
//! [`super::sandwich::two_stage_vcov`].
//!
//! # References
//!
//! - Gardner (2021), "Two-stage differences in differences." Working paper.
//! - Butts & Gardner (2022), "did2s: Two-Stage Difference-in-Differences."
//!   *The R Journal*.
//! - Borusyak, Jaravel & Spiess (2024), "Revisiting Event-Study Designs:
//!   Robust and Efficient Estimation." *Review of Economic Studies*.

use std::sync::Arc;

use nalgebra::{DMatrix, DVector};
use statrs::distribution::{ContinuousCDF, Normal};

use d2s_core::{
    EstimationMetadata, EstimatorConfig, Error, FirstStageSummary, PanelFrame, Result, SolverKind,
    TermEstimate, TwoStageResult, VarianceMethod,
};

use super::bootstrap::cluster_bootstrap;
use super::design::{FirstStageDesign, Rows};
use super::event::StageTwoDesign;
use super::inputs::PanelInputs;
use super::sandwich::two_stage_vcov;
use super::solver::{
    DirectSolver, FirstStageFit, FixedEffectSolver, IterativeSolver, NormalEquations,
};

/// Two-stage DiD estimator bound to a configuration and a first-stage backend.
#[derive(Clone)]
pub struct TwoStageEstimator {
    config: EstimatorConfig,
    solver: Arc<dyn FixedEffectSolver>,
}

impl std::fmt::Debug for TwoStageEstimator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TwoStageEstimator")
            .field("config", &self.config)
            .field("solver", &self.solver.name())
            .finish()
    }
}

/// Stage-2 coefficients together with everything the variance needs.
pub(crate) struct PointEstimate {
    pub coefficients: Vec<f64>,
    pub first: FirstStageFit,
    pub second_resid: Vec<f64>,
    pub bread_inv: DMatrix<f64>,
}

impl TwoStageEstimator {
    /// Validate `config` and pick the backend it names.
    pub fn new(config: EstimatorConfig) -> Result<Self> {
        config.validate()?;
        let solver: Arc<dyn FixedEffectSolver> = match config.solver {
            SolverKind::Direct => Arc::new(DirectSolver),
            SolverKind::Iterative { tol, max_iter } => Arc::new(IterativeSolver::new(tol, max_iter)),
        };
        Ok(Self { config, solver })
    }

    /// Replace the first-stage backend.
    pub fn with_solver(mut self, solver: impl FixedEffectSolver + 'static) -> Self {
        self.solver = Arc::new(solver);
        self
    }

    /// Configuration in use.
    pub fn config(&self) -> &EstimatorConfig {
        &self.config
    }

    /// Run both stages and the variance computation on `frame`.
    pub fn fit(&self, frame: &PanelFrame) -> Result<TwoStageResult> {
        let inputs = PanelInputs::from_frame(&self.config, frame)?;
        let n = inputs.n_obs();
        if inputs.stage2.n_terms() == 0 {
            return Err(Error::Estimation("no second-stage regressor has observations".into()));
        }

        let design = FirstStageDesign::new(
            inputs.groupings.clone(),
            inputs.covariate_names.clone(),
            inputs.covariates.clone(),
            inputs.weights.clone(),
            inputs.treated.iter().map(|&t| !t).collect(),
        )?;
        log::debug!(
            "two-stage DiD: {} rows, {} in stage 1, {} stage-2 terms, solver {}",
            n,
            design.n_stage1(),
            inputs.stage2.n_terms(),
            self.solver.name()
        );

        let eqs = self.solver.factorize(&design)?;
        let point = estimate_point(eqs.as_ref(), &design, &inputs.y, &inputs.stage2)?;

        let (vcov, bootstrap_failures) = match self.config.variance {
            VarianceMethod::Analytic => {
                let v = analytic_vcov(
                    eqs.as_ref(),
                    &design,
                    &inputs,
                    &point,
                    self.config.cluster_adjustment,
                )?;
                (v, 0)
            }
            VarianceMethod::Bootstrap { replications, seed } => {
                let solver = Arc::clone(&self.solver);
                let y = &inputs.y;
                let stage2 = &inputs.stage2;
                let design_ref = &design;
                let boot = cluster_bootstrap(
                    &inputs.clusters,
                    inputs.n_clusters,
                    &inputs.weights,
                    replications,
                    seed,
                    |weights| {
                        let d = design_ref.reweighted(weights.to_vec())?;
                        let eqs = solver.factorize(&d)?;
                        Ok(estimate_point(eqs.as_ref(), &d, y, stage2)?.coefficients)
                    },
                )?;
                (boot.vcov, boot.failures)
            }
        };

        let terms = self.terms(&inputs, &point.coefficients, &vcov)?;

        let covariate_offset = design.covariate_offset();
        let first_stage = FirstStageSummary {
            n_obs: design.n_stage1(),
            n_parameters: design.n_free_params(),
            covariates: design
                .covariate_names()
                .iter()
                .enumerate()
                .map(|(j, name)| (name.clone(), point.first.coefficients[covariate_offset + j]))
                .collect(),
            rss: point.first.rss,
        };

        let w = &inputs.weights;
        let active: Vec<bool> = (0..n).map(|i| w[i] > 0.0 && inputs.stage2.row_active(i)).collect();
        let mut never_units = vec![false; inputs.units.n_levels()];
        for (i, &u) in inputs.units.codes.iter().enumerate() {
            if inputs.never_treated[i] {
                never_units[u] = true;
            }
        }
        let metadata = EstimationMetadata {
            n_obs: n,
            n_stage1: design.n_stage1(),
            n_stage2: active.iter().filter(|&&a| a).count(),
            n_units: inputs.units.n_levels(),
            stage1_subsample: format!("{} == 0", self.config.treatment_indicator),
            cluster_vars: self.config.cluster_vars.clone(),
            n_clusters: inputs.n_clusters,
            solver: self.solver.name().to_string(),
            variance: self.config.variance,
            buckets: inputs.stage2.buckets.clone(),
            never_treated_units: never_units.iter().filter(|&&v| v).count(),
            never_treated_stage2_obs: (0..n)
                .filter(|&i| inputs.never_treated[i] && inputs.stage2.row_active(i))
                .count(),
            bootstrap_failures,
        };

        log::info!(
            "two-stage DiD fitted: {} terms, {} obs, {} clusters",
            terms.len(),
            n,
            inputs.n_clusters
        );

        Ok(TwoStageResult {
            terms,
            vcov: (0..vcov.nrows()).map(|i| vcov.row(i).iter().copied().collect()).collect(),
            first_stage,
            metadata,
        })
    }

    fn terms(
        &self,
        inputs: &PanelInputs,
        coefficients: &[f64],
        vcov: &DMatrix<f64>,
    ) -> Result<Vec<TermEstimate>> {
        let normal = Normal::new(0.0, 1.0)
            .map_err(|e| Error::Computation(format!("standard normal: {}", e)))?;
        let z = normal.inverse_cdf(1.0 - (1.0 - self.config.conf_level) / 2.0);
        let stage2 = &inputs.stage2;

        let mut terms = Vec::with_capacity(stage2.n_terms());
        for (j, col) in stage2.columns.iter().enumerate() {
            let estimate = coefficients[j];
            let std_error = vcov[(j, j)].max(0.0).sqrt();
            let t_stat = (std_error > 0.0).then(|| estimate / std_error);
            let p_value = t_stat.map(|t| 2.0 * (1.0 - normal.cdf(t.abs())));

            let mut units = vec![false; inputs.units.n_levels()];
            let mut n_obs = 0;
            for (i, &v) in col.iter().enumerate() {
                if v != 0.0 && inputs.weights[i] > 0.0 {
                    n_obs += 1;
                    units[inputs.units.codes[i]] = true;
                }
            }

            terms.push(TermEstimate {
                label: stage2.labels[j].clone(),
                relative_time: stage2.relative[j],
                estimate,
                std_error,
                t_stat,
                p_value,
                ci_lower: estimate - z * std_error,
                ci_upper: estimate + z * std_error,
                n_obs,
                n_units: units.iter().filter(|&&u| u).count(),
            });
        }
        Ok(terms)
    }
}

/// Stage 1, imputation and stage 2 for one set of weights.
pub(crate) fn estimate_point(
    eqs: &dyn NormalEquations,
    design: &FirstStageDesign,
    y: &[f64],
    stage2: &StageTwoDesign,
) -> Result<PointEstimate> {
    let first = FirstStageFit::from_equations(eqs, design, y)?;
    let w = design.weights();
    let p = stage2.n_terms();
    let x2 = &stage2.columns;

    let mut gram = DMatrix::<f64>::zeros(p, p);
    let mut rhs = DVector::<f64>::zeros(p);
    for i in 0..design.n_obs() {
        if w[i] == 0.0 {
            continue;
        }
        for a in 0..p {
            let va = x2[a][i];
            if va == 0.0 {
                continue;
            }
            rhs[a] += w[i] * va * first.residuals[i];
            for b in 0..p {
                gram[(a, b)] += w[i] * va * x2[b][i];
            }
        }
    }

    let bread_inv = gram.try_inverse().ok_or_else(|| {
        Error::Estimation("second-stage regressors are collinear or have no observations".into())
    })?;
    let beta = &bread_inv * rhs;
    let coefficients: Vec<f64> = beta.iter().copied().collect();

    let second_resid: Vec<f64> = (0..design.n_obs())
        .map(|i| first.residuals[i] - (0..p).map(|j| x2[j][i] * coefficients[j]).sum::<f64>())
        .collect();

    Ok(PointEstimate { coefficients, first, second_resid, bread_inv })
}

/// Influence matrices of both stages and their GMM sandwich.
fn analytic_vcov(
    eqs: &dyn NormalEquations,
    design: &FirstStageDesign,
    inputs: &PanelInputs,
    point: &PointEstimate,
    cluster_adjustment: bool,
) -> Result<DMatrix<f64>> {
    let n = design.n_obs();
    let p = inputs.stage2.n_terms();
    let w = design.weights();

    let mut second = DMatrix::<f64>::zeros(n, p);
    let mut first = DMatrix::<f64>::zeros(n, p);
    for (j, x2) in inputs.stage2.columns.iter().enumerate() {
        // (X10'WX10)⁻¹ X1'W x2_j: projection of x2_j through the stage-1 design
        let b = eqs.solve(&design.cross(x2, Rows::All)?)?;
        for i in 0..n {
            second[(i, j)] = w[i] * x2[i] * point.second_resid[i];
            if design.is_stage1(i) {
                first[(i, j)] = design.fitted(i, &b) * w[i] * point.first.residuals[i];
            }
        }
    }

    two_stage_vcov(&point.bread_inv, &second, &first, &inputs.clusters, cluster_adjustment)
}

#[cfg(test)]
mod tests {
    use super::*;
    use d2s_core::{Column, TreatSpec};

    /// 6 units × 6 periods; units 4-5 treated from period 3, units 2-3 from 5.
    fn staggered(effect: impl Fn(i64) -> f64) -> PanelFrame {
        let mut unit = Vec::new();
        let mut year = Vec::new();
        let mut g = Vec::new();
        let mut treat = Vec::new();
        let mut y = Vec::new();
        for u in 0..6i64 {
            let cohort = match u {
                0 | 1 => 0,
                2 | 3 => 5,
                _ => 3,
            };
            for t in 1..=6i64 {
                let d = cohort != 0 && t >= cohort;
                unit.push(u);
                year.push(t);
                g.push(cohort);
                treat.push(d as i64);
                let tau = if d { effect(t - cohort) } else { 0.0 };
                y.push(3.0 * u as f64 - 0.7 * t as f64 + (t * t) as f64 * 0.1 + tau);
            }
        }
        PanelFrame::new()
            .with_column("unit", Column::Int(unit))
            .unwrap()
            .with_column("year", Column::Int(year))
            .unwrap()
            .with_column("g", Column::Int(g))
            .unwrap()
            .with_column("treat", Column::Int(treat))
            .unwrap()
            .with_column("y", Column::Float(y))
            .unwrap()
    }

    #[test]
    fn static_effect_exact() {
        let frame = staggered(|_| 2.5);
        let cfg = EstimatorConfig::static_two_way("y", "unit", "year", "treat");
        let res = TwoStageEstimator::new(cfg).unwrap().fit(&frame).unwrap();
        let t = res.term("treat").unwrap();
        assert!((t.estimate - 2.5).abs() < 1e-9, "estimate {}", t.estimate);
        assert_eq!(t.n_obs, 4 * 2 + 2 * 2);
        assert_eq!(t.n_units, 4);
        assert_eq!(res.metadata.n_stage1, 36 - 12);
        assert_eq!(res.metadata.never_treated_units, 2);
        assert_eq!(res.metadata.never_treated_stage2_obs, 0);
        assert_eq!(res.metadata.stage1_subsample, "treat == 0");
    }

    #[test]
    fn event_study_exact() {
        let frame = staggered(|k| 1.0 + k as f64);
        let cfg = EstimatorConfig::static_two_way("y", "unit", "year", "treat")
            .with_treat_spec(TreatSpec::event_study("g"));
        let res = TwoStageEstimator::new(cfg).unwrap().fit(&frame).unwrap();
        for t in &res.terms {
            let k = t.relative_time.unwrap();
            let expected = if k >= 0 { 1.0 + k as f64 } else { 0.0 };
            assert!((t.estimate - expected).abs() < 1e-8, "{} = {}", t.label, t.estimate);
        }
        assert_eq!(res.metadata.never_treated_stage2_obs, 0);
    }

    #[test]
    fn backends_agree() {
        let frame = staggered(|k| 0.5 * k as f64);
        let cfg = EstimatorConfig::static_two_way("y", "unit", "year", "treat")
            .with_treat_spec(TreatSpec::event_study("g"));
        let direct = TwoStageEstimator::new(cfg.clone()).unwrap().fit(&frame).unwrap();
        let iterative = TwoStageEstimator::new(cfg)
            .unwrap()
            .with_solver(IterativeSolver::new(1e-13, 100_000))
            .fit(&frame)
            .unwrap();
        assert_eq!(iterative.metadata.solver, "iterative");
        for (a, b) in direct.terms.iter().zip(&iterative.terms) {
            assert!((a.estimate - b.estimate).abs() < 1e-7);
        }
    }

    #[test]
    fn stage_two_without_regressors_fails() {
        let frame = staggered(|_| 1.0);
        let cfg = EstimatorConfig::static_two_way("y", "unit", "year", "treat").with_treat_spec(
            TreatSpec::EventStudy {
                cohort: "g".into(),
                window: Some((-1, 1)),
                reference: vec![-1, 0, 1],
                tails: d2s_core::TailPolicy::Drop,
                never_treated: 0,
                label: "k".into(),
            },
        );
        let err = TwoStageEstimator::new(cfg).unwrap().fit(&frame).unwrap_err();
        assert!(matches!(err, Error::Estimation(_)));
    }
}
