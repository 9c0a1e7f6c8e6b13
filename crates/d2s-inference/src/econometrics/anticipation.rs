//! Anticipation-shifted treatment indicators.
//!
//! When units react before their treatment date, rows in the `periods`
//! before adoption are contaminated and must leave the first-stage sample.
//! Passing the shifted indicator as `treatment_indicator` does exactly that
//! while the second-stage regressors keep using the actual adoption date.

use d2s_core::{Column, Error, PanelFrame, Result};

/// Indicator equal to 1 from `g − periods` onward for treated units.
///
/// `cohort` holds the adoption period `g` (constant within `unit`); units with
/// `g == never_treated` get 0 throughout. With `periods == 0` this is the
/// plain absorbing treatment indicator `t >= g`.
pub fn shift_for_anticipation(
    frame: &PanelFrame,
    unit: &str,
    time: &str,
    cohort: &str,
    periods: i64,
    never_treated: i64,
) -> Result<Column> {
    if periods < 0 {
        return Err(Error::Configuration(format!(
            "anticipation periods must be non-negative, got {}",
            periods
        )));
    }
    let units = frame.codes(unit)?;
    let t = frame.ints(time)?;
    let g = frame.ints(cohort)?;

    let mut seen: Vec<Option<i64>> = vec![None; units.n_levels()];
    for (i, &u) in units.codes.iter().enumerate() {
        match seen[u] {
            Some(prev) if prev != g[i] => {
                return Err(Error::Validation(format!(
                    "`{}` varies within unit {}",
                    cohort, units.labels[u]
                )));
            }
            _ => seen[u] = Some(g[i]),
        }
    }

    Ok(Column::Int(
        t.iter()
            .zip(&g)
            .map(|(&ti, &gi)| (gi != never_treated && ti >= gi - periods) as i64)
            .collect(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame() -> PanelFrame {
        PanelFrame::new()
            .with_column("unit", Column::Int(vec![1, 1, 1, 1, 2, 2, 2, 2]))
            .unwrap()
            .with_column("year", Column::Int(vec![1, 2, 3, 4, 1, 2, 3, 4]))
            .unwrap()
            .with_column("g", Column::Int(vec![3, 3, 3, 3, 0, 0, 0, 0]))
            .unwrap()
    }

    #[test]
    fn shifts_treated_units_only() {
        let f = frame();
        let plain = shift_for_anticipation(&f, "unit", "year", "g", 0, 0).unwrap();
        assert_eq!(plain, Column::Int(vec![0, 0, 1, 1, 0, 0, 0, 0]));
        let shifted = shift_for_anticipation(&f, "unit", "year", "g", 1, 0).unwrap();
        assert_eq!(shifted, Column::Int(vec![0, 1, 1, 1, 0, 0, 0, 0]));
    }

    #[test]
    fn negative_periods_rejected() {
        let err = shift_for_anticipation(&frame(), "unit", "year", "g", -1, 0).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }
}
