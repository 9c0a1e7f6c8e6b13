//! Second-stage regressors: static treatment, relative-time buckets, and
//! group-specific treatment columns.

use std::collections::BTreeSet;

use d2s_core::{BucketPolicy, Codes, Error, Result, TailPolicy};

/// Dense second-stage design with labels.
#[derive(Debug, Clone)]
pub struct StageTwoDesign {
    /// One label per column.
    pub labels: Vec<String>,
    /// Relative period per column (event-study terms only).
    pub relative: Vec<Option<i64>>,
    /// Regressor columns, each of length n.
    pub columns: Vec<Vec<f64>>,
    /// Bucketing record for event studies.
    pub buckets: Option<BucketPolicy>,
}

impl StageTwoDesign {
    /// Number of regressors.
    pub fn n_terms(&self) -> usize {
        self.columns.len()
    }

    /// `true` if row `i` has any non-zero regressor.
    pub fn row_active(&self, i: usize) -> bool {
        self.columns.iter().any(|c| c[i] != 0.0)
    }
}

/// A single treatment column.
pub fn static_design(label: &str, treatment: Vec<f64>) -> StageTwoDesign {
    StageTwoDesign {
        labels: vec![label.to_string()],
        relative: vec![None],
        columns: vec![treatment],
        buckets: None,
    }
}

/// Treatment split by the levels of `group`; all-zero columns are skipped.
pub fn grouped_design(
    treatment_name: &str,
    group_name: &str,
    treatment: &[f64],
    group: &Codes,
) -> Result<StageTwoDesign> {
    if group.codes.len() != treatment.len() {
        return Err(Error::Validation("treatment and group differ in length".into()));
    }
    let mut labels = Vec::new();
    let mut columns = Vec::new();
    for (level, label) in group.labels.iter().enumerate() {
        let col: Vec<f64> = treatment
            .iter()
            .zip(&group.codes)
            .map(|(&d, &g)| if g == level { d } else { 0.0 })
            .collect();
        if col.iter().all(|&v| v == 0.0) {
            log::debug!("{} = {} has no treated observations; skipped", group_name, label);
            continue;
        }
        labels.push(format!("{}:{}={}", treatment_name, group_name, label));
        columns.push(col);
    }
    let relative = vec![None; columns.len()];
    Ok(StageTwoDesign { labels, relative, columns, buckets: None })
}

/// Options of an event-study specification.
#[derive(Debug, Clone)]
pub struct EventOptions<'a> {
    /// Inclusive window.
    pub window: Option<(i64, i64)>,
    /// Buckets without a regressor.
    pub reference: &'a [i64],
    /// Out-of-window policy.
    pub tails: TailPolicy,
    /// Cohort sentinel for never-treated units.
    pub never_treated: i64,
    /// Label prefix.
    pub label: &'a str,
}

/// Relative period `t − g` of every row, `None` for never-treated units.
pub fn relative_times(time: &[i64], cohort: &[i64], never_treated: i64) -> Vec<Option<i64>> {
    time.iter()
        .zip(cohort)
        .map(|(&t, &g)| if g == never_treated { None } else { Some(t - g) })
        .collect()
}

/// One indicator per relative-time bucket.
pub fn event_design(time: &[i64], cohort: &[i64], opts: &EventOptions<'_>) -> Result<StageTwoDesign> {
    if time.len() != cohort.len() {
        return Err(Error::Validation("time and cohort differ in length".into()));
    }
    let n = time.len();
    let mut n_binned = 0usize;
    let mut n_dropped = 0usize;

    let bucket: Vec<Option<i64>> = relative_times(time, cohort, opts.never_treated)
        .into_iter()
        .map(|k| {
            let k = k?;
            let k = match opts.window {
                Some((lo, hi)) if k < lo || k > hi => match opts.tails {
                    TailPolicy::Bin => {
                        n_binned += 1;
                        k.clamp(lo, hi)
                    }
                    TailPolicy::Drop => {
                        n_dropped += 1;
                        return None;
                    }
                },
                _ => k,
            };
            (!opts.reference.contains(&k)).then_some(k)
        })
        .collect();

    let observed: BTreeSet<i64> = bucket.iter().flatten().copied().collect();
    let empty_buckets: Vec<i64> = match opts.window {
        Some((lo, hi)) => (lo..=hi)
            .filter(|k| !opts.reference.contains(k) && !observed.contains(k))
            .collect(),
        None => Vec::new(),
    };
    if !empty_buckets.is_empty() {
        log::warn!("event study: no observations for relative periods {:?}", empty_buckets);
    }

    let mut labels = Vec::with_capacity(observed.len());
    let mut relative = Vec::with_capacity(observed.len());
    let mut columns = Vec::with_capacity(observed.len());
    for &k in &observed {
        labels.push(format!("{}::{}", opts.label, k));
        relative.push(Some(k));
        columns.push((0..n).map(|i| if bucket[i] == Some(k) { 1.0 } else { 0.0 }).collect());
    }

    Ok(StageTwoDesign {
        labels,
        relative,
        columns,
        buckets: Some(BucketPolicy {
            window: opts.window,
            tails: opts.tails,
            reference: opts.reference.to_vec(),
            n_binned,
            n_dropped,
            empty_buckets,
        }),
    })
}
