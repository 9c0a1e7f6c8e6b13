//! Extraction and validation of estimator inputs from a [`PanelFrame`].

use d2s_core::{Codes, EstimatorConfig, Error, PanelFrame, Result, TreatSpec};

use super::design::Grouping;
use super::event::{EventOptions, StageTwoDesign, event_design, grouped_design, static_design};

/// Column data resolved against a configuration.
#[derive(Debug, Clone)]
pub(crate) struct PanelInputs {
    pub y: Vec<f64>,
    pub weights: Vec<f64>,
    /// `true` where the treatment indicator is 1.
    pub treated: Vec<bool>,
    pub units: Codes,
    pub groupings: Vec<Grouping>,
    pub covariate_names: Vec<String>,
    pub covariates: Vec<Vec<f64>>,
    pub stage2: StageTwoDesign,
    /// Row belongs to a never-treated unit.
    pub never_treated: Vec<bool>,
    pub clusters: Vec<usize>,
    pub n_clusters: usize,
}

impl PanelInputs {
    pub fn from_frame(config: &EstimatorConfig, frame: &PanelFrame) -> Result<Self> {
        config.validate_against(frame)?;
        let n = frame.n_rows();
        if n == 0 {
            return Err(Error::Validation("panel frame has no rows".into()));
        }

        let y = frame.floats(&config.outcome)?;
        if let Some(i) = y.iter().position(|v| !v.is_finite()) {
            return Err(Error::Validation(format!(
                "outcome `{}` is not finite at row {}",
                config.outcome, i
            )));
        }

        let treated = binary(frame, &config.treatment_indicator)?;

        let weights = match &config.weights {
            Some(col) => {
                let w = frame.floats(col)?;
                if let Some(i) = w.iter().position(|v| !v.is_finite() || *v < 0.0) {
                    return Err(Error::Validation(format!(
                        "weight `{}` must be finite and non-negative (row {})",
                        col, i
                    )));
                }
                w
            }
            None => vec![1.0; n],
        };

        let units = frame.codes(&config.unit)?;
        let time = frame.ints(&config.time)?;
        check_monotone(&units, &time, &treated, &config.treatment_indicator)?;

        let groupings = config
            .first_stage
            .fixed_effects
            .iter()
            .map(|name| Ok(Grouping { name: name.clone(), codes: frame.codes(name)? }))
            .collect::<Result<Vec<_>>>()?;

        let mut covariates = Vec::with_capacity(config.first_stage.covariates.len());
        for name in &config.first_stage.covariates {
            let x = frame.floats(name)?;
            if x.iter().any(|v| !v.is_finite()) {
                return Err(Error::Validation(format!("covariate `{}` is not finite", name)));
            }
            covariates.push(x);
        }

        let (stage2, never_treated) = match &config.treat_spec {
            TreatSpec::Static { column } => {
                let d = frame.floats(column)?;
                let never = never_by_unit(&units, |i| d[i] == 0.0);
                (static_design(column, d), never)
            }
            TreatSpec::ByGroup { treatment, group } => {
                let d = frame.floats(treatment)?;
                let never = never_by_unit(&units, |i| d[i] == 0.0);
                (grouped_design(treatment, group, &d, &frame.codes(group)?)?, never)
            }
            TreatSpec::EventStudy { cohort, window, reference, tails, never_treated, label } => {
                let g = frame.ints(cohort)?;
                check_constant_by_unit(&units, &g, cohort)?;
                let opts = EventOptions {
                    window: *window,
                    reference,
                    tails: *tails,
                    never_treated: *never_treated,
                    label,
                };
                let never = g.iter().map(|&gi| gi == *never_treated).collect();
                (event_design(&time, &g, &opts)?, never)
            }
        };

        let clusters = if config.cluster_vars.is_empty() {
            Codes { codes: (0..n).collect(), labels: (0..n).map(|i| i.to_string()).collect() }
        } else {
            let parts = config
                .cluster_vars
                .iter()
                .map(|c| frame.codes(c))
                .collect::<Result<Vec<_>>>()?;
            Codes::intersect(&parts)?
        };

        Ok(Self {
            y,
            weights,
            treated,
            units,
            groupings,
            covariate_names: config.first_stage.covariates.clone(),
            covariates,
            stage2,
            never_treated,
            n_clusters: clusters.n_levels(),
            clusters: clusters.codes,
        })
    }

    pub fn n_obs(&self) -> usize {
        self.y.len()
    }
}

fn binary(frame: &PanelFrame, name: &str) -> Result<Vec<bool>> {
    frame
        .ints(name)?
        .into_iter()
        .enumerate()
        .map(|(i, v)| match v {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(Error::Validation(format!(
                "treatment indicator `{}` must be 0/1, found {} at row {}",
                name, other, i
            ))),
        })
        .collect()
}

/// Row indices of each unit, sorted by time.
fn rows_by_unit(units: &Codes, time: &[i64]) -> Vec<Vec<usize>> {
    let mut rows: Vec<Vec<usize>> = vec![Vec::new(); units.n_levels()];
    for (i, &u) in units.codes.iter().enumerate() {
        rows[u].push(i);
    }
    for r in &mut rows {
        r.sort_by_key(|&i| time[i]);
    }
    rows
}

/// One row per (unit, period), and no switch back from treated to untreated.
fn check_monotone(units: &Codes, time: &[i64], treated: &[bool], name: &str) -> Result<()> {
    for (u, rows) in rows_by_unit(units, time).iter().enumerate() {
        if let Some(w) = rows.windows(2).find(|w| time[w[0]] == time[w[1]]) {
            return Err(Error::Validation(format!(
                "unit {} has more than one row for period {} (rows {} and {})",
                units.labels[u], time[w[0]], w[0], w[1]
            )));
        }
        if let Some(w) = rows.windows(2).find(|w| treated[w[0]] && !treated[w[1]]) {
            return Err(Error::Validation(format!(
                "`{}` switches back from 1 to 0 for unit {} at period {}",
                name, units.labels[u], time[w[1]]
            )));
        }
    }
    Ok(())
}

fn check_constant_by_unit(units: &Codes, values: &[i64], name: &str) -> Result<()> {
    let mut seen: Vec<Option<i64>> = vec![None; units.n_levels()];
    for (i, &u) in units.codes.iter().enumerate() {
        match seen[u] {
            None => seen[u] = Some(values[i]),
            Some(v) if v != values[i] => {
                return Err(Error::Validation(format!(
                    "`{}` varies within unit {} ({} vs {})",
                    name, units.labels[u], v, values[i]
                )));
            }
            Some(_) => {}
        }
    }
    Ok(())
}

/// Row flags for units where `untreated(i)` holds on every row.
fn never_by_unit(units: &Codes, untreated: impl Fn(usize) -> bool) -> Vec<bool> {
    let mut never = vec![true; units.n_levels()];
    for (i, &u) in units.codes.iter().enumerate() {
        if !untreated(i) {
            never[u] = false;
        }
    }
    units.codes.iter().map(|&u| never[u]).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use d2s_core::Column;

    fn frame(treat: Vec<i64>) -> PanelFrame {
        PanelFrame::new()
            .with_column("unit", Column::Int(vec![1, 1, 1, 2, 2, 2]))
            .unwrap()
            .with_column("year", Column::Int(vec![3, 1, 2, 1, 2, 3]))
            .unwrap()
            .with_column("y", Column::Float(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]))
            .unwrap()
            .with_column("treat", Column::Int(treat))
            .unwrap()
            .with_column("g", Column::Int(vec![2, 2, 2, 0, 0, 0]))
            .unwrap()
    }

    fn config() -> EstimatorConfig {
        EstimatorConfig::static_two_way("y", "unit", "year", "treat")
    }

    #[test]
    fn monotonicity_checked_in_time_order() {
        // rows are out of time order; unit 1 treated from year 2
        assert!(PanelInputs::from_frame(&config(), &frame(vec![1, 0, 1, 0, 0, 0])).is_ok());
        // unit 1 treated in year 2 but not year 3
        let err = PanelInputs::from_frame(&config(), &frame(vec![0, 0, 1, 0, 0, 0])).unwrap_err();
        assert!(matches!(err, Error::Validation(ref m) if m.contains("unit 1")));
    }

    #[test]
    fn duplicate_unit_period_rejected() {
        let mut f = frame(vec![0, 0, 0, 0, 0, 0]);
        // unit 2 observed twice in year 2
        f.insert("year", Column::Int(vec![3, 1, 2, 1, 2, 2])).unwrap();
        let err = PanelInputs::from_frame(&config(), &f).unwrap_err();
        assert!(matches!(err, Error::Validation(ref m) if m.contains("unit 2") && m.contains("period 2")));
    }

    #[test]
    fn non_binary_indicator_rejected() {
        let err = PanelInputs::from_frame(&config(), &frame(vec![2, 0, 0, 0, 0, 0])).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn never_treated_flags_static() {
        let inputs = PanelInputs::from_frame(&config(), &frame(vec![1, 0, 1, 0, 0, 0])).unwrap();
        assert_eq!(inputs.never_treated, vec![false, false, false, true, true, true]);
        assert_eq!(inputs.n_clusters, 2);
    }

    #[test]
    fn cohort_must_be_constant_within_unit() {
        let cfg = config().with_treat_spec(TreatSpec::event_study("g"));
        let mut f = frame(vec![1, 0, 1, 0, 0, 0]);
        f.insert("g", Column::Int(vec![2, 2, 3, 0, 0, 0])).unwrap();
        assert!(PanelInputs::from_frame(&cfg, &f).is_err());
    }

    #[test]
    fn no_cluster_vars_means_one_cluster_per_row() {
        let mut cfg = config();
        cfg.cluster_vars.clear();
        let inputs = PanelInputs::from_frame(&cfg, &frame(vec![1, 0, 1, 0, 0, 0])).unwrap();
        assert_eq!(inputs.n_clusters, 6);
    }
}
