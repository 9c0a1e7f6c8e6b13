//! Conventional two-way fixed-effects regressions.
//!
//! Regresses the outcome on the same second-stage regressors the two-stage
//! estimator uses, after absorbing the first-stage fixed effects from the
//! full sample by alternating projections. Under staggered adoption with
//! heterogeneous effects this estimator is biased (already-treated units act
//! as controls), so it serves as the comparison baseline.
//!
//! # References
//!
//! - Goodman-Bacon (2021), "Difference-in-differences with variation in
//!   treatment timing." *Journal of Econometrics*.

use nalgebra::{DMatrix, DVector};
use statrs::distribution::{ContinuousCDF, Normal};

use d2s_core::{EstimatorConfig, Error, PanelFrame, Result, TermEstimate};

use super::hdfe::AlternatingProjections;
use super::inputs::PanelInputs;
use super::sandwich::cluster_robust_vcov;

/// Output of a TWFE regression.
#[derive(Debug, Clone)]
pub struct TwfeResult {
    /// One row per treatment regressor (covariates are not reported).
    pub terms: Vec<TermEstimate>,
    /// Observations used.
    pub n_obs: usize,
    /// Degrees of freedom absorbed by the fixed effects.
    pub df_absorbed: usize,
}

/// Fit `y = FE + D τ + X β + ε` on every row, with cluster-robust errors.
///
/// Uses the fixed effects, covariates, treatment regressors, weights and
/// clusters of `config`; the treatment indicator only enters through the
/// regressors.
pub fn twfe(config: &EstimatorConfig, frame: &PanelFrame) -> Result<TwfeResult> {
    let inputs = PanelInputs::from_frame(config, frame)?;
    let n = inputs.n_obs();
    let n_terms = inputs.stage2.n_terms();
    if n_terms == 0 {
        return Err(Error::Estimation("no treatment regressor has observations".into()));
    }

    let groups: Vec<Vec<usize>> = inputs.groupings.iter().map(|g| g.codes.codes.clone()).collect();
    let hdfe = AlternatingProjections::weighted(groups, inputs.weights.clone())?;

    // Weighted least squares on the demeaned data: scale rows by √w.
    let sw: Vec<f64> = inputs.weights.iter().map(|w| w.sqrt()).collect();
    let y_dm = hdfe.partial_out(&inputs.y)?;

    let regressors: Vec<&Vec<f64>> =
        inputs.stage2.columns.iter().chain(inputs.covariates.iter()).collect();
    let k = regressors.len();
    let mut x = DMatrix::<f64>::zeros(n, k);
    for (j, col) in regressors.into_iter().enumerate() {
        let dm = hdfe.partial_out(col)?;
        for i in 0..n {
            x[(i, j)] = sw[i] * dm[i];
        }
    }
    let y = DVector::from_iterator(n, y_dm.iter().zip(&sw).map(|(v, s)| v * s));

    let xtx_inv = (x.transpose() * &x)
        .try_inverse()
        .ok_or_else(|| Error::Estimation("X'X singular in TWFE regression".into()))?;
    let beta = &xtx_inv * x.transpose() * &y;
    let resid = &y - &x * &beta;

    let df_absorbed = hdfe.degrees_of_freedom_absorbed();
    let vcov = cluster_robust_vcov(&x, &resid, &xtx_inv, &inputs.clusters, df_absorbed)?;

    let normal = Normal::new(0.0, 1.0)
        .map_err(|e| Error::Computation(format!("standard normal: {}", e)))?;
    let z = normal.inverse_cdf(1.0 - (1.0 - config.conf_level) / 2.0);

    let terms = (0..n_terms)
        .map(|j| {
            let estimate = beta[j];
            let std_error = vcov[(j, j)].max(0.0).sqrt();
            let t_stat = (std_error > 0.0).then(|| estimate / std_error);
            let col = &inputs.stage2.columns[j];
            let mut units = vec![false; inputs.units.n_levels()];
            let mut n_obs = 0;
            for (i, &v) in col.iter().enumerate() {
                if v != 0.0 && inputs.weights[i] > 0.0 {
                    n_obs += 1;
                    units[inputs.units.codes[i]] = true;
                }
            }
            TermEstimate {
                label: inputs.stage2.labels[j].clone(),
                relative_time: inputs.stage2.relative[j],
                estimate,
                std_error,
                t_stat,
                p_value: t_stat.map(|t| 2.0 * (1.0 - normal.cdf(t.abs()))),
                ci_lower: estimate - z * std_error,
                ci_upper: estimate + z * std_error,
                n_obs,
                n_units: units.iter().filter(|&&u| u).count(),
            }
        })
        .collect();

    log::debug!("TWFE: {} obs, {} regressors, {} absorbed df", n, k, df_absorbed);
    Ok(TwfeResult { terms, n_obs: n, df_absorbed })
}

#[cfg(test)]
mod tests {
    use super::*;
    use d2s_core::Column;

    fn frame(effect: f64) -> PanelFrame {
        // 4 units × 4 periods; units 2-3 treated from period 3
        let mut unit = Vec::new();
        let mut year = Vec::new();
        let mut treat = Vec::new();
        let mut y = Vec::new();
        for u in 0..4i64 {
            for t in 1..=4i64 {
                let d = u >= 2 && t >= 3;
                unit.push(u);
                year.push(t);
                treat.push(d as i64);
                y.push(10.0 + u as f64 + 2.0 * t as f64 + if d { effect } else { 0.0 });
            }
        }
        PanelFrame::new()
            .with_column("unit", Column::Int(unit))
            .unwrap()
            .with_column("year", Column::Int(year))
            .unwrap()
            .with_column("treat", Column::Int(treat))
            .unwrap()
            .with_column("y", Column::Float(y))
            .unwrap()
    }

    #[test]
    fn homogeneous_block_design_is_unbiased() {
        let cfg = EstimatorConfig::static_two_way("y", "unit", "year", "treat");
        let res = twfe(&cfg, &frame(3.0)).unwrap();
        assert_eq!(res.terms.len(), 1);
        assert!((res.terms[0].estimate - 3.0).abs() < 1e-8);
        assert_eq!(res.terms[0].n_obs, 4);
        assert_eq!(res.n_obs, 16);
        // 4 + 4 levels, one connected component
        assert_eq!(res.df_absorbed, 7);
    }
}
