//! Sandwich covariance estimators.
//!
//! - [`cluster_robust_vcov`]: Liang–Zeger cluster-robust covariance for a
//!   single OLS regression.
//! - [`two_stage_vcov`]: GMM covariance of the second-stage coefficients of
//!   the two-stage DiD estimator. It is a pure function of the two stages'
//!   influence matrices, so it can be exercised with synthetic inputs.
//!
//! # References
//!
//! - Arellano (1987), "Computing robust standard errors for within-groups estimators."
//! - Gardner (2021), "Two-stage differences in differences." Working paper.

use nalgebra::{DMatrix, DVector};

use d2s_core::{Error, Result};

fn n_clusters(cluster_ids: &[usize]) -> usize {
    cluster_ids.iter().copied().max().map_or(0, |m| m + 1)
}

/// Sum the rows of `scores` within each cluster.
fn cluster_sums(scores: &DMatrix<f64>, cluster_ids: &[usize]) -> DMatrix<f64> {
    let g = n_clusters(cluster_ids);
    let mut sums = DMatrix::<f64>::zeros(g, scores.ncols());
    for (i, &c) in cluster_ids.iter().enumerate() {
        let mut row = sums.row_mut(c);
        row += scores.row(i);
    }
    sums
}

/// Liang–Zeger cluster-robust covariance `(X'X)⁻¹ B (X'X)⁻¹`,
/// `B = Σ_g X_g' e_g e_g' X_g`, with the usual
/// `G/(G−1) · (N−1)/(N−K)` small-sample factor where
/// `K = ncols(X) + df_absorbed`.
pub fn cluster_robust_vcov(
    x: &DMatrix<f64>,
    residuals: &DVector<f64>,
    xtx_inv: &DMatrix<f64>,
    cluster_ids: &[usize],
    df_absorbed: usize,
) -> Result<DMatrix<f64>> {
    let n = x.nrows();
    let p = x.ncols();
    if residuals.len() != n || cluster_ids.len() != n {
        return Err(Error::Validation("x, residuals and cluster_ids differ in length".into()));
    }
    if xtx_inv.nrows() != p || xtx_inv.ncols() != p {
        return Err(Error::Validation("xtx_inv has the wrong shape".into()));
    }

    let mut scores = x.clone();
    for (i, &e) in residuals.iter().enumerate() {
        scores.row_mut(i).scale_mut(e);
    }
    let sums = cluster_sums(&scores, cluster_ids);
    let meat = sums.transpose() * &sums;

    let g = n_clusters(cluster_ids) as f64;
    let n_f = n as f64;
    let k_f = (p + df_absorbed) as f64;
    let correction =
        if g > 1.0 && n_f > k_f { (g / (g - 1.0)) * ((n_f - 1.0) / (n_f - k_f)) } else { 1.0 };

    Ok(xtx_inv * meat * xtx_inv * correction)
}

/// Covariance of the second-stage coefficients of the two-stage estimator.
///
/// With `second` holding `w_i x2_i e2_i` and `first` holding
/// `(X2'WX1)(X10'WX10)⁻¹ w_i x10_i e1_i` row by row, the stacked influence of
/// observation `i` is `second_i − first_i`; summing within clusters gives
/// `ψ_g` and the result is `bread_inv · Σ_g ψ_g ψ_gᵀ · bread_inv`.
///
/// `bread_inv` is `(X2'WX2)⁻¹`. With `cluster_adjustment` the meat is scaled
/// by `G/(G−1)`.
pub fn two_stage_vcov(
    bread_inv: &DMatrix<f64>,
    second: &DMatrix<f64>,
    first: &DMatrix<f64>,
    cluster_ids: &[usize],
    cluster_adjustment: bool,
) -> Result<DMatrix<f64>> {
    let p = bread_inv.nrows();
    if bread_inv.ncols() != p {
        return Err(Error::Validation("bread must be square".into()));
    }
    if second.shape() != first.shape() {
        return Err(Error::Validation(format!(
            "influence matrices differ in shape: {:?} vs {:?}",
            second.shape(),
            first.shape()
        )));
    }
    if second.ncols() != p || second.nrows() != cluster_ids.len() {
        return Err(Error::Validation(format!(
            "influence matrix is {:?}, expected ({}, {})",
            second.shape(),
            cluster_ids.len(),
            p
        )));
    }

    let psi = cluster_sums(&(second - first), cluster_ids);
    let mut meat = psi.transpose() * &psi;
    let g = psi.nrows() as f64;
    if cluster_adjustment && g > 1.0 {
        meat *= g / (g - 1.0);
    }
    let vcov = bread_inv * meat * bread_inv;
    if vcov.iter().any(|v| !v.is_finite()) {
        return Err(Error::Computation("non-finite two-stage covariance".into()));
    }
    Ok(vcov)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn ols(x: &DMatrix<f64>, y: &DVector<f64>) -> (DMatrix<f64>, DVector<f64>) {
        let xtx_inv = (x.transpose() * x).try_inverse().unwrap();
        let beta = &xtx_inv * x.transpose() * y;
        let resid = y - x * beta;
        (xtx_inv, resid)
    }

    #[test]
    fn zero_first_stage_reduces_to_cluster_robust() {
        let x = DMatrix::from_row_slice(6, 2, &[1.0, 0.0, 1.0, 1.0, 0.0, 1.0, 1.0, 0.5, 0.0, 2.0, 1.0, 3.0]);
        let y = DVector::from_column_slice(&[1.0, 2.5, 1.7, 2.2, 3.1, 4.9]);
        let clusters = [0, 0, 1, 1, 2, 2];
        let (xtx_inv, resid) = ols(&x, &y);

        let mut second = x.clone();
        for i in 0..6 {
            second.row_mut(i).scale_mut(resid[i]);
        }
        let first = DMatrix::zeros(6, 2);
        let v = two_stage_vcov(&xtx_inv, &second, &first, &clusters, false).unwrap();

        // Plain CR0 without small-sample factors.
        let cr = cluster_robust_vcov(&x, &resid, &xtx_inv, &clusters, 0).unwrap();
        let (g, n, k) = (3.0, 6.0, 2.0);
        let factor = (g / (g - 1.0)) * ((n - 1.0) / (n - k));
        for (a, b) in v.iter().zip(cr.iter()) {
            assert_relative_eq!(a * factor, *b, epsilon = 1e-12);
        }
    }

    #[test]
    fn synthetic_influence_by_hand() {
        // One regressor, bread 1/4; influences per obs.
        let bread = DMatrix::from_element(1, 1, 0.25);
        let second = DMatrix::from_column_slice(4, 1, &[1.0, -2.0, 3.0, 0.5]);
        let first = DMatrix::from_column_slice(4, 1, &[0.5, 0.0, 1.0, -0.5]);
        let clusters = [0, 0, 1, 1];
        // ψ = [0.5 - 2.0, 2.0 + 1.0] = [-1.5, 3.0]; meat = 2.25 + 9 = 11.25
        let v = two_stage_vcov(&bread, &second, &first, &clusters, false).unwrap();
        assert_relative_eq!(v[(0, 0)], 11.25 / 16.0, epsilon = 1e-15);

        let adj = two_stage_vcov(&bread, &second, &first, &clusters, true).unwrap();
        assert_relative_eq!(adj[(0, 0)], 2.0 * 11.25 / 16.0, epsilon = 1e-15);
    }

    #[test]
    fn first_stage_influence_changes_variance() {
        let bread = DMatrix::identity(2, 2);
        let second = DMatrix::from_row_slice(3, 2, &[1.0, 0.0, 0.0, 1.0, 1.0, 1.0]);
        let first = DMatrix::from_row_slice(3, 2, &[0.2, 0.1, -0.3, 0.0, 0.0, 0.4]);
        let a = two_stage_vcov(&bread, &second, &DMatrix::zeros(3, 2), &[0, 1, 2], false).unwrap();
        let b = two_stage_vcov(&bread, &second, &first, &[0, 1, 2], false).unwrap();
        assert!((a - b).abs().max() > 1e-3);
    }

    #[test]
    fn shape_mismatch_rejected() {
        let bread = DMatrix::identity(2, 2);
        let s = DMatrix::zeros(3, 2);
        let f = DMatrix::zeros(3, 1);
        assert!(two_stage_vcov(&bread, &s, &f, &[0, 1, 2], false).is_err());
        assert!(two_stage_vcov(&bread, &s, &s, &[0, 1], false).is_err());
    }
}
