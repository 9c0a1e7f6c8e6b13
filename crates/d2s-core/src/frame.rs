//! In-memory columnar panel data.
//!
//! A [`PanelFrame`] is an ordered set of equally long named columns. The
//! estimator addresses everything by column name, so the frame is the only
//! input it needs besides its configuration.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// A single typed column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Column {
    /// Real-valued column (outcomes, covariates, weights).
    Float(Vec<f64>),
    /// Integer column (periods, cohorts, integer ids, 0/1 indicators).
    Int(Vec<i64>),
    /// Text column (categorical labels).
    Text(Vec<String>),
}

impl Column {
    /// Number of rows.
    pub fn len(&self) -> usize {
        match self {
            Column::Float(v) => v.len(),
            Column::Int(v) => v.len(),
            Column::Text(v) => v.len(),
        }
    }

    /// `true` if the column has no rows.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn type_name(&self) -> &'static str {
        match self {
            Column::Float(_) => "float",
            Column::Int(_) => "int",
            Column::Text(_) => "text",
        }
    }
}

/// Dense 0-based codes of a categorical column.
///
/// Levels are numbered in order of first appearance, which keeps every
/// downstream computation independent of hash ordering.
#[derive(Debug, Clone, PartialEq)]
pub struct Codes {
    /// Code of each row.
    pub codes: Vec<usize>,
    /// Original label of each level.
    pub labels: Vec<String>,
}

impl Codes {
    /// Number of distinct levels.
    pub fn n_levels(&self) -> usize {
        self.labels.len()
    }

    /// Combine several code vectors into the codes of their intersection.
    pub fn intersect(parts: &[Codes]) -> Result<Codes> {
        let first = parts
            .first()
            .ok_or_else(|| Error::Validation("at least one categorical column required".into()))?;
        let n = first.codes.len();
        if parts.iter().any(|p| p.codes.len() != n) {
            return Err(Error::Validation("categorical columns differ in length".into()));
        }
        if parts.len() == 1 {
            return Ok(first.clone());
        }

        let mut index: HashMap<Vec<usize>, usize> = HashMap::new();
        let mut codes = Vec::with_capacity(n);
        let mut labels = Vec::new();
        for i in 0..n {
            let key: Vec<usize> = parts.iter().map(|p| p.codes[i]).collect();
            let next = index.len();
            let code = *index.entry(key).or_insert_with(|| {
                let label =
                    parts.iter().map(|p| p.labels[p.codes[i]].as_str()).collect::<Vec<_>>().join("^");
                labels.push(label);
                next
            });
            codes.push(code);
        }
        Ok(Codes { codes, labels })
    }
}

/// Ordered collection of named, equally long columns.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PanelFrame {
    n_rows: usize,
    columns: Vec<(String, Column)>,
}

impl PanelFrame {
    /// Create an empty frame.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style [`PanelFrame::insert`].
    pub fn with_column(mut self, name: impl Into<String>, column: Column) -> Result<Self> {
        self.insert(name, column)?;
        Ok(self)
    }

    /// Insert a column, replacing any existing column of the same name.
    ///
    /// The first column fixes the number of rows; later columns must match it.
    pub fn insert(&mut self, name: impl Into<String>, column: Column) -> Result<()> {
        let name = name.into();
        if self.columns.is_empty() {
            self.n_rows = column.len();
        } else if column.len() != self.n_rows {
            return Err(Error::Validation(format!(
                "column `{}` has {} rows, frame has {}",
                name,
                column.len(),
                self.n_rows
            )));
        }
        if let Some(slot) = self.columns.iter_mut().find(|(n, _)| *n == name) {
            slot.1 = column;
        } else {
            self.columns.push((name, column));
        }
        Ok(())
    }

    /// Number of rows.
    pub fn n_rows(&self) -> usize {
        self.n_rows
    }

    /// Column names in insertion order.
    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|(n, _)| n.as_str())
    }

    /// `true` if a column with this name exists.
    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|(n, _)| n == name)
    }

    /// Look up a column by name.
    pub fn column(&self, name: &str) -> Result<&Column> {
        self.columns
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, c)| c)
            .ok_or_else(|| Error::Configuration(format!("column `{}` not found", name)))
    }

    /// Column as `f64` values; integer columns are widened.
    pub fn floats(&self, name: &str) -> Result<Vec<f64>> {
        match self.column(name)? {
            Column::Float(v) => Ok(v.clone()),
            Column::Int(v) => Ok(v.iter().map(|&x| x as f64).collect()),
            Column::Text(_) => Err(Error::Configuration(format!(
                "column `{}` is text, expected a numeric column",
                name
            ))),
        }
    }

    /// Column as `i64` values; float columns must hold integral values.
    pub fn ints(&self, name: &str) -> Result<Vec<i64>> {
        match self.column(name)? {
            Column::Int(v) => Ok(v.clone()),
            Column::Float(v) => v
                .iter()
                .map(|&x| {
                    if x.is_finite() && x.fract() == 0.0 {
                        Ok(x as i64)
                    } else {
                        Err(Error::Validation(format!(
                            "column `{}` holds non-integral value {}",
                            name, x
                        )))
                    }
                })
                .collect(),
            Column::Text(_) => Err(Error::Configuration(format!(
                "column `{}` is text, expected an integer column",
                name
            ))),
        }
    }

    /// Dense codes of a categorical (`Int` or `Text`) column.
    pub fn codes(&self, name: &str) -> Result<Codes> {
        let column = self.column(name)?;
        match column {
            Column::Int(v) => Ok(encode(v.iter().copied(), |x| x.to_string())),
            Column::Text(v) => Ok(encode(v.iter().map(String::as_str), |s| s.to_string())),
            Column::Float(_) => Err(Error::Configuration(format!(
                "column `{}` is {}; categorical columns must be int or text",
                name,
                column.type_name()
            ))),
        }
    }
}

fn encode<K, I, F>(values: I, label: F) -> Codes
where
    K: std::hash::Hash + Eq + Copy,
    I: Iterator<Item = K>,
    F: Fn(K) -> String,
{
    let mut index: HashMap<K, usize> = HashMap::new();
    let mut codes = Vec::new();
    let mut labels = Vec::new();
    for v in values {
        let next = index.len();
        let code = *index.entry(v).or_insert_with(|| {
            labels.push(label(v));
            next
        });
        codes.push(code);
    }
    Codes { codes, labels }
}
