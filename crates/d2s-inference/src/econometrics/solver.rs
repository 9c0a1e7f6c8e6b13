//! First-stage least squares with absorbed fixed effects.
//!
//! The estimator only needs two things from a backend: the solution of the
//! stage-1 normal equations `(X10' W X10) b = c` for arbitrary right-hand
//! sides, and the fitted values `x1_i · b` that follow from it. The same
//! factorization serves the outcome model (`c = X10' W y`) and the
//! generated-regressor correction (`c = X1' W x2_j`).
//!
//! Two backends are provided:
//!
//! - [`DirectSolver`]: eliminates the first grouping (diagonal block) through
//!   its Schur complement and factors the remaining dense block by Cholesky.
//!   Exact; memory grows with `levels(first) × (other levels + covariates)`.
//! - [`IterativeSolver`]: block Gauss–Seidel over groupings (the normal
//!   equation form of alternating projections, Guimarães & Portugal 2010).
//!   Memory linear in `n`; suited to many levels in every grouping.

use nalgebra::{DMatrix, DVector};

use d2s_core::{Error, Result};

use super::design::{FirstStageDesign, Rows};
use super::hdfe::{AlternatingProjections, DEFAULT_MAX_ITER, DEFAULT_TOL};

/// Smallest admissible squared Cholesky pivot relative to its diagonal entry.
const PIVOT_TOL: f64 = 1e-10;

/// A factorized system `(X10' W X10) b = rhs`.
pub trait NormalEquations {
    /// Solve for `b`. Pinned entries of `rhs` are ignored and returned as zero.
    fn solve(&self, rhs: &[f64]) -> Result<Vec<f64>>;
}

/// Backend capable of absorbing categorical fixed effects.
pub trait FixedEffectSolver: Send + Sync {
    /// Backend name, recorded in result metadata.
    fn name(&self) -> &'static str;

    /// Factorize the stage-1 normal equations of `design`.
    fn factorize<'a>(&self, design: &'a FirstStageDesign)
    -> Result<Box<dyn NormalEquations + 'a>>;

    /// Fit `y` on the stage-1 subsample and impute for every row.
    fn fit(&self, design: &FirstStageDesign, y: &[f64]) -> Result<FirstStageFit> {
        let eqs = self.factorize(design)?;
        FirstStageFit::from_equations(eqs.as_ref(), design, y)
    }
}

/// Stage-1 coefficients with imputed untreated outcomes for all rows.
#[derive(Debug, Clone)]
pub struct FirstStageFit {
    /// Coefficients in design layout (pinned entries are zero).
    pub coefficients: Vec<f64>,
    /// `ŷ_it(0)` for every row.
    pub fitted: Vec<f64>,
    /// `y − ŷ(0)` for every row.
    pub residuals: Vec<f64>,
    /// Weighted residual sum of squares over stage-1 rows.
    pub rss: f64,
}

impl FirstStageFit {
    /// Solve with an existing factorization.
    pub fn from_equations(
        eqs: &dyn NormalEquations,
        design: &FirstStageDesign,
        y: &[f64],
    ) -> Result<Self> {
        let rhs = design.cross(y, Rows::Stage1)?;
        let coefficients = eqs.solve(&rhs)?;
        let fitted: Vec<f64> = (0..design.n_obs()).map(|i| design.fitted(i, &coefficients)).collect();
        let residuals: Vec<f64> = y.iter().zip(&fitted).map(|(yi, fi)| yi - fi).collect();
        let rss = residuals
            .iter()
            .enumerate()
            .filter(|&(i, _)| design.is_stage1(i))
            .map(|(i, r)| design.weights()[i] * r * r)
            .sum();
        Ok(Self { coefficients, fitted, residuals, rss })
    }
}

// ---------------------------------------------------------------------------
// Direct backend
// ---------------------------------------------------------------------------

/// Schur-complement factorization of the stage-1 normal equations.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectSolver;

struct SchurFactor<'a> {
    design: &'a FirstStageDesign,
    /// Weighted counts of grouping-0 levels on stage-1 rows.
    d0: Vec<f64>,
    /// Cross block between grouping 0 and the remaining parameters.
    c: DMatrix<f64>,
    chol: Option<nalgebra::Cholesky<f64, nalgebra::Dyn>>,
}

impl FixedEffectSolver for DirectSolver {
    fn name(&self) -> &'static str {
        "direct"
    }

    fn factorize<'a>(
        &self,
        design: &'a FirstStageDesign,
    ) -> Result<Box<dyn NormalEquations + 'a>> {
        let l0 = design.groupings()[0].codes.n_levels();
        let r = design.n_params() - l0;
        let cov_off = design.covariate_offset();
        let w = design.weights();

        let mut d0 = vec![0.0_f64; l0];
        let mut c = DMatrix::<f64>::zeros(l0, r);
        let mut rest = DMatrix::<f64>::zeros(r, r);
        let mut entries: Vec<(usize, f64)> = Vec::with_capacity(r.min(64));

        for i in 0..design.n_obs() {
            if !design.is_stage1(i) {
                continue;
            }
            entries.clear();
            for (d, g) in design.groupings().iter().enumerate().skip(1) {
                let p = design.offset(d) + g.codes.codes[i];
                if !design.is_pinned(p) {
                    entries.push((p - l0, 1.0));
                }
            }
            for (j, x) in design.covariates().iter().enumerate() {
                entries.push((cov_off + j - l0, x[i]));
            }

            let wi = w[i];
            let level = design.groupings()[0].codes.codes[i];
            d0[level] += wi;
            for &(a, va) in &entries {
                c[(level, a)] += wi * va;
                for &(b, vb) in &entries {
                    rest[(a, b)] += wi * va * vb;
                }
            }
        }

        let chol = if r > 0 {
            // S = R − C' D0⁻¹ C
            let mut c_scaled = c.clone();
            for (l, &dl) in d0.iter().enumerate() {
                let inv = if dl > 0.0 { 1.0 / dl } else { 0.0 };
                c_scaled.row_mut(l).scale_mut(inv);
            }
            let mut schur = rest - c.transpose() * c_scaled;
            for j in 0..r {
                if design.is_pinned(l0 + j) {
                    schur[(j, j)] = 1.0;
                }
            }
            let diag: Vec<f64> = (0..r).map(|j| schur[(j, j)]).collect();
            let chol = schur.cholesky().ok_or_else(|| {
                Error::Estimation("first-stage normal equations are rank-deficient".into())
            })?;
            // Squared pivot over original diagonal: 1 − R² of each column on
            // the ones before it.
            let l = chol.l();
            let min_ratio = (0..r)
                .map(|j| l[(j, j)] * l[(j, j)] / diag[j])
                .fold(f64::INFINITY, f64::min);
            if min_ratio.is_nan() || min_ratio < PIVOT_TOL {
                return Err(Error::Estimation(format!(
                    "first-stage normal equations are rank-deficient (pivot ratio {:.3e})",
                    min_ratio
                )));
            }
            Some(chol)
        } else {
            None
        };

        log::debug!(
            "direct solver: {} first-grouping levels, {} dense parameters",
            l0,
            r
        );
        Ok(Box::new(SchurFactor { design, d0, c, chol }))
    }
}

impl NormalEquations for SchurFactor<'_> {
    fn solve(&self, rhs: &[f64]) -> Result<Vec<f64>> {
        let design = self.design;
        let p = design.n_params();
        if rhs.len() != p {
            return Err(Error::Validation(format!("rhs length ({}) != {}", rhs.len(), p)));
        }
        let l0 = self.d0.len();
        let r = p - l0;

        let c0: Vec<f64> = (0..l0)
            .map(|l| if design.is_pinned(l) || self.d0[l] <= 0.0 { 0.0 } else { rhs[l] })
            .collect();

        let mut b = vec![0.0_f64; p];
        let br = match &self.chol {
            Some(chol) => {
                let mut t = DVector::from_iterator(
                    r,
                    (0..r).map(|j| if design.is_pinned(l0 + j) { 0.0 } else { rhs[l0 + j] }),
                );
                for (l, &dl) in self.d0.iter().enumerate() {
                    if dl > 0.0 && c0[l] != 0.0 {
                        t.axpy(-c0[l] / dl, &self.c.row(l).transpose(), 1.0);
                    }
                }
                chol.solve(&t)
            }
            None => DVector::zeros(0),
        };

        for (l, &dl) in self.d0.iter().enumerate() {
            if dl > 0.0 {
                let cross = if r > 0 { self.c.row(l).dot(&br.transpose()) } else { 0.0 };
                b[l] = (c0[l] - cross) / dl;
            }
        }
        for j in 0..r {
            if !design.is_pinned(l0 + j) {
                b[l0 + j] = br[j];
            }
        }
        if b.iter().any(|v| !v.is_finite()) {
            return Err(Error::Computation("non-finite first-stage solution".into()));
        }
        Ok(b)
    }
}

// ---------------------------------------------------------------------------
// Iterative backend
// ---------------------------------------------------------------------------

/// Block Gauss–Seidel over fixed-effect groupings and the covariate block.
#[derive(Debug, Clone, Copy)]
pub struct IterativeSolver {
    tol: f64,
    max_iter: usize,
}

impl Default for IterativeSolver {
    fn default() -> Self {
        Self { tol: DEFAULT_TOL, max_iter: DEFAULT_MAX_ITER }
    }
}

impl IterativeSolver {
    /// Solver with explicit convergence settings.
    pub fn new(tol: f64, max_iter: usize) -> Self {
        Self { tol, max_iter }
    }
}

struct GaussSeidel<'a> {
    design: &'a FirstStageDesign,
    /// Per grouping, per level: stage-1 member rows.
    members: Vec<Vec<Vec<usize>>>,
    /// Per grouping, per level: weighted count.
    diag: Vec<Vec<f64>>,
    cov_chol: Option<nalgebra::Cholesky<f64, nalgebra::Dyn>>,
    tol: f64,
    max_iter: usize,
}

impl FixedEffectSolver for IterativeSolver {
    fn name(&self) -> &'static str {
        "iterative"
    }

    fn factorize<'a>(
        &self,
        design: &'a FirstStageDesign,
    ) -> Result<Box<dyn NormalEquations + 'a>> {
        let w = design.weights();
        let mut members = Vec::with_capacity(design.groupings().len());
        let mut diag = Vec::with_capacity(design.groupings().len());
        for g in design.groupings() {
            let mut m: Vec<Vec<usize>> = vec![Vec::new(); g.codes.n_levels()];
            let mut dg = vec![0.0_f64; g.codes.n_levels()];
            for (i, &l) in g.codes.codes.iter().enumerate() {
                if design.is_stage1(i) {
                    m[l].push(i);
                    dg[l] += w[i];
                }
            }
            members.push(m);
            diag.push(dg);
        }

        let k = design.covariates().len();
        let cov_chol = if k > 0 {
            let x = design.covariates();
            let mut sxx = DMatrix::<f64>::zeros(k, k);
            for i in (0..design.n_obs()).filter(|&i| design.is_stage1(i)) {
                for a in 0..k {
                    for b in 0..k {
                        sxx[(a, b)] += w[i] * x[a][i] * x[b][i];
                    }
                }
            }
            let diag: Vec<f64> = (0..k).map(|j| sxx[(j, j)]).collect();
            let chol = sxx.cholesky().ok_or_else(|| {
                Error::Estimation("first-stage covariates are collinear".into())
            })?;
            check_partialled_rank(design, &diag)?;
            Some(chol)
        } else {
            None
        };

        Ok(Box::new(GaussSeidel {
            design,
            members,
            diag,
            cov_chol,
            tol: self.tol,
            max_iter: self.max_iter,
        }))
    }
}

/// Rank check of the covariates after absorbing every grouping.
///
/// Gauss–Seidel converges on singular systems too, so a covariate that the
/// fixed effects span (e.g. a time-invariant one under unit effects) must be
/// caught here: its stage-1 residual after demeaning is numerically zero
/// relative to its raw second moment `raw_diag`.
fn check_partialled_rank(design: &FirstStageDesign, raw_diag: &[f64]) -> Result<()> {
    let w: Vec<f64> = design
        .weights()
        .iter()
        .enumerate()
        .map(|(i, &wi)| if design.is_stage1(i) { wi } else { 0.0 })
        .collect();
    let groups: Vec<Vec<usize>> =
        design.groupings().iter().map(|g| g.codes.codes.clone()).collect();
    let map = AlternatingProjections::weighted(groups, w.clone())?;

    let k = design.covariates().len();
    let demeaned = design
        .covariates()
        .iter()
        .map(|x| map.partial_out(x))
        .collect::<Result<Vec<_>>>()?;
    let mut gram = DMatrix::<f64>::zeros(k, k);
    for i in (0..design.n_obs()).filter(|&i| w[i] > 0.0) {
        for a in 0..k {
            for b in 0..k {
                gram[(a, b)] += w[i] * demeaned[a][i] * demeaned[b][i];
            }
        }
    }

    let min_ratio = match gram.cholesky() {
        Some(chol) => {
            let l = chol.l();
            (0..k).map(|j| l[(j, j)] * l[(j, j)] / raw_diag[j]).fold(f64::INFINITY, f64::min)
        }
        None => 0.0,
    };
    if min_ratio.is_nan() || min_ratio < PIVOT_TOL {
        return Err(Error::Estimation(format!(
            "first-stage covariates are collinear with the fixed effects (pivot ratio {:.3e})",
            min_ratio
        )));
    }
    Ok(())
}

impl NormalEquations for GaussSeidel<'_> {
    fn solve(&self, rhs: &[f64]) -> Result<Vec<f64>> {
        let design = self.design;
        let p = design.n_params();
        if rhs.len() != p {
            return Err(Error::Validation(format!("rhs length ({}) != {}", rhs.len(), p)));
        }
        let w = design.weights();
        let x = design.covariates();
        let cov_off = design.covariate_offset();

        let mut b = vec![0.0_f64; p];
        // x10_i · b on stage-1 rows
        let mut f = vec![0.0_f64; design.n_obs()];

        for iter in 0..self.max_iter {
            let mut max_step = 0.0_f64;

            for (d, levels) in self.members.iter().enumerate() {
                for (l, rows) in levels.iter().enumerate() {
                    let pi = design.offset(d) + l;
                    let dl = self.diag[d][l];
                    if design.is_pinned(pi) || dl <= 0.0 {
                        continue;
                    }
                    let g: f64 = rows.iter().map(|&i| w[i] * f[i]).sum();
                    let step = (rhs[pi] - g) / dl;
                    if step != 0.0 {
                        b[pi] += step;
                        for &i in rows {
                            f[i] += step;
                        }
                        max_step = max_step.max(step.abs());
                    }
                }
            }

            if let Some(chol) = &self.cov_chol {
                let k = x.len();
                let mut g = DVector::<f64>::zeros(k);
                for i in (0..design.n_obs()).filter(|&i| design.is_stage1(i)) {
                    for j in 0..k {
                        g[j] += w[i] * x[j][i] * f[i];
                    }
                }
                let resid = DVector::from_iterator(k, (0..k).map(|j| rhs[cov_off + j] - g[j]));
                let step = chol.solve(&resid);
                for j in 0..k {
                    b[cov_off + j] += step[j];
                    max_step = max_step.max(step[j].abs());
                }
                for i in (0..design.n_obs()).filter(|&i| design.is_stage1(i)) {
                    f[i] += (0..k).map(|j| x[j][i] * step[j]).sum::<f64>();
                }
            }

            let scale = 1.0 + b.iter().fold(0.0_f64, |m, v| m.max(v.abs()));
            if !max_step.is_finite() {
                return Err(Error::Computation("Gauss-Seidel sweep diverged".into()));
            }
            if max_step < self.tol * scale {
                log::debug!("iterative solver converged after {} sweeps", iter + 1);
                return Ok(b);
            }
        }

        log::warn!("iterative solver did not converge in {} sweeps", self.max_iter);
        Err(Error::Computation(format!(
            "first-stage Gauss-Seidel did not converge in {} iterations",
            self.max_iter
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::econometrics::design::Grouping;
    use d2s_core::Codes;

    fn grouping(name: &str, codes: Vec<usize>) -> Grouping {
        let n_levels = codes.iter().max().map_or(0, |m| m + 1);
        Grouping {
            name: name.into(),
            codes: Codes { codes, labels: (0..n_levels).map(|l| l.to_string()).collect() },
        }
    }

    /// 4 units × 5 periods; unit 3 treated from period 3 on.
    fn panel() -> (FirstStageDesign, Vec<f64>) {
        let mut unit = Vec::new();
        let mut year = Vec::new();
        let mut x = Vec::new();
        let mut zero = Vec::new();
        let mut y = Vec::new();
        for u in 0..4usize {
            for t in 0..5usize {
                unit.push(u);
                year.push(t);
                let xi = ((u * 7 + t * 3) % 5) as f64 * 0.5;
                x.push(xi);
                let treated = u == 3 && t >= 3;
                zero.push(!treated);
                let effect = if treated { 4.0 } else { 0.0 };
                y.push(2.0 * u as f64 + 0.5 * t as f64 * t as f64 + 1.5 * xi + effect);
            }
        }
        let design = FirstStageDesign::new(
            vec![grouping("unit", unit), grouping("year", year)],
            vec!["x".into()],
            vec![x],
            vec![1.0; 20],
            zero,
        )
        .unwrap();
        (design, y)
    }

    #[test]
    fn direct_recovers_additive_model() {
        let (design, y) = panel();
        let fit = DirectSolver.fit(&design, &y).unwrap();
        let beta = fit.coefficients[design.covariate_offset()];
        assert!((beta - 1.5).abs() < 1e-9, "beta = {}", beta);
        for i in 0..20 {
            let expected = if i >= 18 { 4.0 } else { 0.0 };
            assert!((fit.residuals[i] - expected).abs() < 1e-9, "r[{}] = {}", i, fit.residuals[i]);
        }
        assert!(fit.rss < 1e-16);
    }

    #[test]
    fn iterative_matches_direct() {
        let (design, y) = panel();
        let direct = DirectSolver.fit(&design, &y).unwrap();
        let iterative = IterativeSolver::new(1e-12, 50_000).fit(&design, &y).unwrap();
        for (a, b) in direct.fitted.iter().zip(&iterative.fitted) {
            assert!((a - b).abs() < 1e-7);
        }
    }

    #[test]
    fn arbitrary_rhs_solutions_agree() {
        let (design, _) = panel();
        let v: Vec<f64> = (0..20).map(|i| ((i * 13) % 7) as f64 - 3.0).collect();
        let rhs = design.cross(&v, Rows::All).unwrap();
        let direct = DirectSolver.factorize(&design).unwrap();
        let iterative = IterativeSolver::new(1e-13, 100_000).factorize(&design).unwrap();
        let a = direct.solve(&rhs).unwrap();
        let b = iterative.solve(&rhs).unwrap();
        for i in 0..20 {
            assert!((design.fitted(i, &a) - design.fitted(i, &b)).abs() < 1e-6);
        }
    }

    #[test]
    fn collinear_covariate_is_rank_deficient() {
        // covariate equal to a unit dummy
        let unit = vec![0, 0, 1, 1, 2, 2];
        let year = vec![0, 1, 0, 1, 0, 1];
        let x = vec![1.0, 1.0, 0.0, 0.0, 0.0, 0.0];
        let design = FirstStageDesign::new(
            vec![grouping("unit", unit), grouping("year", year)],
            vec!["x".into()],
            vec![x],
            vec![1.0; 6],
            vec![true; 6],
        )
        .unwrap();
        let err = DirectSolver.factorize(&design).err().unwrap();
        assert!(matches!(err, Error::Estimation(_)));
    }

    #[test]
    fn time_invariant_covariate_rejected_by_both_backends() {
        // z is constant within unit, hence spanned by the unit effects
        let unit = vec![0, 0, 0, 1, 1, 1, 2, 2, 2, 3, 3, 3];
        let year = vec![0, 1, 2, 0, 1, 2, 0, 1, 2, 0, 1, 2];
        let z: Vec<f64> = unit.iter().map(|&u| (u % 3) as f64 + 0.5).collect();
        let design = FirstStageDesign::new(
            vec![grouping("unit", unit), grouping("year", year)],
            vec!["z".into()],
            vec![z],
            vec![1.0; 12],
            vec![true; 12],
        )
        .unwrap();
        let direct = DirectSolver.factorize(&design).err().unwrap();
        assert!(matches!(direct, Error::Estimation(_)));
        let iterative = IterativeSolver::default().factorize(&design).err().unwrap();
        assert!(matches!(iterative, Error::Estimation(ref m) if m.contains("collinear")));
    }

    #[test]
    fn iterative_accepts_time_varying_covariate() {
        let (design, _) = panel();
        assert!(IterativeSolver::default().factorize(&design).is_ok());
    }

    #[test]
    fn one_way_needs_no_dense_block() {
        let design = FirstStageDesign::new(
            vec![grouping("unit", vec![0, 0, 1, 1])],
            vec![],
            vec![],
            vec![1.0; 4],
            vec![true; 4],
        )
        .unwrap();
        let fit = DirectSolver.fit(&design, &[1.0, 3.0, 10.0, 20.0]).unwrap();
        assert_eq!(fit.coefficients, vec![2.0, 15.0]);
    }
}
