//! Cluster bootstrap of the full two-stage procedure.
//!
//! Each replicate draws `G` clusters with replacement and turns the draw
//! counts into frequency multipliers on the observation weights, so both
//! stages are refitted on the resampled panel without materializing it.
//! Replicates run in parallel; replicate `b` is seeded with `seed + b`, which
//! makes the output independent of the thread count.

use nalgebra::DMatrix;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;

use d2s_core::{Error, Result};

/// Replicate estimates and their sample covariance.
#[derive(Debug, Clone)]
pub struct BootstrapDraws {
    /// Successful replicate coefficient vectors, in replicate order.
    pub replicates: Vec<Vec<f64>>,
    /// Sample covariance of the replicates (divisor `R − 1`).
    pub vcov: DMatrix<f64>,
    /// Replicates whose refit failed.
    pub failures: usize,
}

/// Cluster draw counts for one replicate.
fn draw_counts(n_clusters: usize, seed: u64) -> Vec<f64> {
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    let mut counts = vec![0.0; n_clusters];
    for _ in 0..n_clusters {
        counts[rng.random_range(0..n_clusters)] += 1.0;
    }
    counts
}

/// Run `replications` cluster-bootstrap refits of `estimate`.
///
/// `estimate` receives the resampled observation weights and returns the
/// coefficient vector. Failing replicates are skipped and counted; fewer than
/// two successes is an error.
pub fn cluster_bootstrap<F>(
    clusters: &[usize],
    n_clusters: usize,
    weights: &[f64],
    replications: usize,
    seed: u64,
    estimate: F,
) -> Result<BootstrapDraws>
where
    F: Fn(&[f64]) -> Result<Vec<f64>> + Sync,
{
    if clusters.len() != weights.len() {
        return Err(Error::Validation("clusters and weights differ in length".into()));
    }
    if n_clusters < 2 {
        return Err(Error::Computation("cluster bootstrap needs at least 2 clusters".into()));
    }

    let t0 = std::time::Instant::now();
    let draws: Vec<Option<Vec<f64>>> = (0..replications)
        .into_par_iter()
        .map(|b| {
            let counts = draw_counts(n_clusters, seed.wrapping_add(b as u64));
            let w: Vec<f64> =
                weights.iter().zip(clusters).map(|(&wi, &c)| wi * counts[c]).collect();
            match estimate(&w) {
                Ok(beta) if beta.iter().all(|v| v.is_finite()) => Some(beta),
                Ok(_) => {
                    log::debug!("bootstrap replicate {} produced non-finite estimates", b);
                    None
                }
                Err(e) => {
                    log::debug!("bootstrap replicate {} failed: {}", b, e);
                    None
                }
            }
        })
        .collect();

    let replicates: Vec<Vec<f64>> = draws.into_iter().flatten().collect();
    let failures = replications - replicates.len();
    if replicates.len() < 2 {
        return Err(Error::Computation(format!(
            "only {} of {} bootstrap replicates succeeded",
            replicates.len(),
            replications
        )));
    }
    if failures > 0 {
        log::warn!("{} of {} bootstrap replicates failed and were skipped", failures, replications);
    }
    log::debug!(
        "cluster bootstrap: {} replicates in {:.3}s",
        replicates.len(),
        t0.elapsed().as_secs_f64()
    );

    let vcov = sample_covariance(&replicates)?;
    Ok(BootstrapDraws { replicates, vcov, failures })
}

fn sample_covariance(draws: &[Vec<f64>]) -> Result<DMatrix<f64>> {
    let r = draws.len();
    let p = draws[0].len();
    if draws.iter().any(|d| d.len() != p) {
        return Err(Error::Computation("bootstrap replicates differ in length".into()));
    }
    let mut mean = vec![0.0; p];
    for d in draws {
        for (m, v) in mean.iter_mut().zip(d) {
            *m += v / r as f64;
        }
    }
    let mut cov = DMatrix::<f64>::zeros(p, p);
    for d in draws {
        for a in 0..p {
            for b in 0..p {
                cov[(a, b)] += (d[a] - mean[a]) * (d[b] - mean[b]);
            }
        }
    }
    Ok(cov / (r as f64 - 1.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn draws_conserve_cluster_count() {
        for seed in 0..20 {
            let counts = draw_counts(7, seed);
            assert_eq!(counts.iter().sum::<f64>(), 7.0);
        }
    }

    #[test]
    fn weighted_mean_bootstrap_is_reproducible() {
        let y: Vec<f64> = (0..40).map(|i| (i % 7) as f64 + 0.1 * i as f64).collect();
        let clusters: Vec<usize> = (0..40).map(|i| i / 4).collect();
        let mean = |w: &[f64]| -> Result<Vec<f64>> {
            let sw: f64 = w.iter().sum();
            Ok(vec![w.iter().zip(&y).map(|(a, b)| a * b).sum::<f64>() / sw])
        };
        let a = cluster_bootstrap(&clusters, 10, &[1.0; 40], 64, 7, mean).unwrap();
        let b = cluster_bootstrap(&clusters, 10, &[1.0; 40], 64, 7, mean).unwrap();
        assert_eq!(a.replicates, b.replicates);
        assert_eq!(a.failures, 0);
        assert!(a.vcov[(0, 0)] > 0.0);

        let c = cluster_bootstrap(&clusters, 10, &[1.0; 40], 64, 8, mean).unwrap();
        assert_ne!(a.replicates, c.replicates);
    }

    #[test]
    fn failures_are_counted() {
        let est = |w: &[f64]| -> Result<Vec<f64>> {
            if w[0] == 0.0 { Err(Error::Estimation("dropped".into())) } else { Ok(vec![w[0]]) }
        };
        let clusters: Vec<usize> = (0..6).collect();
        let draws = cluster_bootstrap(&clusters, 6, &[1.0; 6], 100, 3, est).unwrap();
        assert!(draws.failures > 0);
        assert_eq!(draws.failures + draws.replicates.len(), 100);
    }

    #[test]
    fn too_few_successes_is_an_error() {
        let est = |_: &[f64]| -> Result<Vec<f64>> { Err(Error::Estimation("never".into())) };
        let err = cluster_bootstrap(&[0, 1, 2], 3, &[1.0; 3], 10, 0, est).unwrap_err();
        assert!(matches!(err, Error::Computation(_)));
    }

    #[test]
    fn covariance_uses_r_minus_one() {
        let v = sample_covariance(&[vec![1.0], vec![3.0]]).unwrap();
        assert_relative_eq!(v[(0, 0)], 2.0, epsilon = 1e-15);
    }
}
