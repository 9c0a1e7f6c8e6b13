//! First-stage design: fixed-effect groupings, covariates, weights and the
//! stage-1 row mask.
//!
//! The design matrix `X1` (one dummy per fixed-effect level plus covariate
//! columns) is never materialised. Parameters are laid out grouping by
//! grouping, followed by the covariates:
//!
//! ```text
//! [ levels of grouping 0 | levels of grouping 1 | … | covariates ]
//! ```
//!
//! Every level of grouping 0 is free. In each later grouping the first level
//! with stage-1 observations is pinned to zero, which removes the collinearity
//! between groupings. Levels with zero total weight (possible under bootstrap
//! reweighting) are pinned as well.

use d2s_core::{Codes, Error, Result};

use super::hdfe::connected_components;

/// Rows over which a cross product is accumulated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rows {
    /// Stage-1 subsample only (`X10`).
    Stage1,
    /// Every observation (`X1`).
    All,
}

/// A named categorical grouping absorbed as fixed effects.
#[derive(Debug, Clone)]
pub struct Grouping {
    /// Source column name.
    pub name: String,
    /// Dense codes and labels.
    pub codes: Codes,
}

/// First-stage design over the full sample.
#[derive(Debug, Clone)]
pub struct FirstStageDesign {
    n: usize,
    groupings: Vec<Grouping>,
    covariate_names: Vec<String>,
    covariates: Vec<Vec<f64>>,
    weights: Vec<f64>,
    indicator_zero: Vec<bool>,
    stage1: Vec<bool>,
    offsets: Vec<usize>,
    pinned: Vec<bool>,
}

impl FirstStageDesign {
    /// Build and check identification.
    ///
    /// `indicator_zero[i]` is `true` where the treatment indicator is 0; rows
    /// with zero weight never enter stage 1.
    pub fn new(
        groupings: Vec<Grouping>,
        covariate_names: Vec<String>,
        covariates: Vec<Vec<f64>>,
        weights: Vec<f64>,
        indicator_zero: Vec<bool>,
    ) -> Result<Self> {
        let n = weights.len();
        if groupings.is_empty() {
            return Err(Error::Configuration(
                "first stage needs at least one fixed-effect grouping".into(),
            ));
        }
        if indicator_zero.len() != n
            || groupings.iter().any(|g| g.codes.codes.len() != n)
            || covariates.iter().any(|c| c.len() != n)
        {
            return Err(Error::Validation("first-stage inputs differ in length".into()));
        }
        if covariate_names.len() != covariates.len() {
            return Err(Error::Validation("covariate names and columns differ in count".into()));
        }

        let mut offsets = Vec::with_capacity(groupings.len());
        let mut next = 0;
        for g in &groupings {
            offsets.push(next);
            next += g.codes.n_levels();
        }
        let n_params = next + covariates.len();

        let mut design = Self {
            n,
            groupings,
            covariate_names,
            covariates,
            weights,
            indicator_zero,
            stage1: Vec::new(),
            offsets,
            pinned: vec![false; n_params],
        };
        design.identify()?;
        Ok(design)
    }

    /// Same design under different observation weights.
    pub fn reweighted(&self, weights: Vec<f64>) -> Result<Self> {
        if weights.len() != self.n {
            return Err(Error::Validation(format!(
                "weights length ({}) != n ({})",
                weights.len(),
                self.n
            )));
        }
        let mut design = self.clone();
        design.weights = weights;
        design.pinned.iter_mut().for_each(|p| *p = false);
        design.identify()?;
        Ok(design)
    }

    fn identify(&mut self) -> Result<()> {
        self.stage1 = self
            .indicator_zero
            .iter()
            .zip(&self.weights)
            .map(|(&zero, &w)| zero && w > 0.0)
            .collect();
        if !self.stage1.iter().any(|&s| s) {
            return Err(Error::Estimation(
                "stage-1 subsample is empty: no untreated observations with positive weight"
                    .into(),
            ));
        }

        for (d, g) in self.groupings.iter().enumerate() {
            let levels = g.codes.n_levels();
            let mut total = vec![0.0_f64; levels];
            let mut untreated = vec![0.0_f64; levels];
            for i in 0..self.n {
                let l = g.codes.codes[i];
                total[l] += self.weights[i];
                if self.stage1[i] {
                    untreated[l] += self.weights[i];
                }
            }
            let mut reference_set = d == 0;
            for l in 0..levels {
                let p = self.offsets[d] + l;
                if total[l] <= 0.0 {
                    self.pinned[p] = true;
                } else if untreated[l] <= 0.0 {
                    return Err(Error::Estimation(format!(
                        "{} = {} has no untreated observations; its fixed effect is not identified",
                        g.name, g.codes.labels[l]
                    )));
                } else if !reference_set {
                    self.pinned[p] = true;
                    reference_set = true;
                }
            }
        }

        if self.groupings.len() == 2 {
            let comps = connected_components(
                &self.groupings[0].codes.codes,
                &self.groupings[1].codes.codes,
                &self.stage1,
            );
            if comps > 1 {
                return Err(Error::Estimation(format!(
                    "untreated observations split {} x {} into {} disconnected groups",
                    self.groupings[0].name, self.groupings[1].name, comps
                )));
            }
        }
        Ok(())
    }

    /// Number of observations.
    pub fn n_obs(&self) -> usize {
        self.n
    }

    /// Observations in stage 1.
    pub fn n_stage1(&self) -> usize {
        self.stage1.iter().filter(|&&s| s).count()
    }

    /// `true` if row `i` belongs to stage 1.
    #[inline]
    pub fn is_stage1(&self, i: usize) -> bool {
        self.stage1[i]
    }

    /// Stage-1 mask.
    pub fn stage1_mask(&self) -> &[bool] {
        &self.stage1
    }

    /// Observation weights.
    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    /// Fixed-effect groupings.
    pub fn groupings(&self) -> &[Grouping] {
        &self.groupings
    }

    /// First parameter index of grouping `d`.
    #[inline]
    pub fn offset(&self, d: usize) -> usize {
        self.offsets[d]
    }

    /// First covariate parameter index.
    #[inline]
    pub fn covariate_offset(&self) -> usize {
        self.pinned.len() - self.covariates.len()
    }

    /// Covariate columns.
    pub fn covariates(&self) -> &[Vec<f64>] {
        &self.covariates
    }

    /// Covariate names.
    pub fn covariate_names(&self) -> &[String] {
        &self.covariate_names
    }

    /// Total parameter slots (pinned included).
    pub fn n_params(&self) -> usize {
        self.pinned.len()
    }

    /// Parameters actually estimated.
    pub fn n_free_params(&self) -> usize {
        self.pinned.iter().filter(|&&p| !p).count()
    }

    /// `true` if parameter `p` is fixed at zero.
    #[inline]
    pub fn is_pinned(&self, p: usize) -> bool {
        self.pinned[p]
    }

    /// `x1_i · b` for any row.
    #[inline]
    pub fn fitted(&self, i: usize, b: &[f64]) -> f64 {
        let mut v = 0.0;
        for (d, g) in self.groupings.iter().enumerate() {
            v += b[self.offsets[d] + g.codes.codes[i]];
        }
        let off = self.covariate_offset();
        for (j, x) in self.covariates.iter().enumerate() {
            v += x[i] * b[off + j];
        }
        v
    }

    /// `X1' W v` over the selected rows; pinned entries are zero.
    pub fn cross(&self, v: &[f64], rows: Rows) -> Result<Vec<f64>> {
        if v.len() != self.n {
            return Err(Error::Validation(format!("v length ({}) != n ({})", v.len(), self.n)));
        }
        let off = self.covariate_offset();
        let mut out = vec![0.0_f64; self.n_params()];
        for i in 0..self.n {
            if rows == Rows::Stage1 && !self.stage1[i] {
                continue;
            }
            let wv = self.weights[i] * v[i];
            if wv == 0.0 {
                continue;
            }
            for (d, g) in self.groupings.iter().enumerate() {
                out[self.offsets[d] + g.codes.codes[i]] += wv;
            }
            for (j, x) in self.covariates.iter().enumerate() {
                out[off + j] += wv * x[i];
            }
        }
        for (o, &p) in out.iter_mut().zip(&self.pinned) {
            if p {
                *o = 0.0;
            }
        }
        Ok(out)
    }
}
