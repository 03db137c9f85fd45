use std::fmt;
use std::error::Error;
use serde::{Serialize, Deserialize};

#[derive(Debug)]
pub enum TimeseriesError {
    Io(std::io::Error),
    Json(serde_json::Error),
    RowWidthMismatch { row: usize, found: usize, expected: usize },
    ObservableNotFound(String),
}

impl fmt::Display for TimeseriesError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {}", e),
            Self::Json(e) => write!(f, "JSON parse error: {}", e),
            Self::RowWidthMismatch { row, found, expected } =>
                write!(f, "Row {row} has {found} observable values, expected {expected}"),
            Self::ObservableNotFound(name) =>
                write!(f, "Observable '{name}' not found in time series"),
        }
    }
}

impl Error for TimeseriesError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Json(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for TimeseriesError {
    fn from(e: std::io::Error) -> Self { Self::Io(e) }
}

impl From<serde_json::Error> for TimeseriesError {
    fn from(e: serde_json::Error) -> Self { Self::Json(e) }
}

/// One output time point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeRow {
    pub time: f64,
    /// Observable values, in the order of `Timeseries::observable_names`.
    pub observables: Vec<f64>,
    /// Species concentrations, indexed like the network's species.
    pub species: Vec<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Timeseries {
    pub observable_names: Vec<String>,
    pub rows: Vec<TimeRow>,
}

impl Timeseries {
    pub fn new(observable_names: Vec<String>) -> Self {
        Self { observable_names, rows: Vec::new() }
    }

    pub fn push(&mut self, row: TimeRow) {
        debug_assert_eq!(row.observables.len(), self.observable_names.len());
        self.rows.push(row);
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn last(&self) -> Option<&TimeRow> {
        self.rows.last()
    }

    pub fn times(&self) -> Vec<f64> {
        self.rows.iter().map(|r| r.time).collect()
    }

    /// All values of one observable over time.
    pub fn observable(&self, name: &str) -> Result<Vec<f64>, TimeseriesError> {
        let i = self.observable_names.iter()
            .position(|n| n == name)
            .ok_or_else(|| TimeseriesError::ObservableNotFound(name.to_string()))?;
        Ok(self.rows.iter().map(|r| r.observables[i]).collect())
    }

    pub fn validate(&self) -> Result<(), TimeseriesError> {
        let expected = self.observable_names.len();
        for (row, r) in self.rows.iter().enumerate() {
            if r.observables.len() != expected {
                return Err(TimeseriesError::RowWidthMismatch { row, found: r.observables.len(), expected });
            }
        }
        Ok(())
    }
}

/// A whitespace separated table of time and observables.
impl fmt::Display for Timeseries {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:>15}", "time")?;
        for name in &self.observable_names {
            write!(f, " {:>16}", name)?;
        }
        for row in &self.rows {
            write!(f, "\n {:>15.8e}", row.time)?;
            for v in &row.observables {
                write!(f, " {:>16.8e}", v)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_columns_and_table() {
        let mut ts = Timeseries::new(vec!["A".to_string(), "B".to_string()]);
        ts.push(TimeRow { time: 0., observables: vec![1., 0.], species: vec![1., 0.] });
        ts.push(TimeRow { time: 1., observables: vec![0.5, 0.5], species: vec![0.5, 0.5] });
        assert_eq!(ts.observable("B").unwrap(), vec![0., 0.5]);
        assert!(matches!(ts.observable("C"), Err(TimeseriesError::ObservableNotFound(_))));
        assert_eq!(ts.times(), vec![0., 1.]);

        let table = ts.to_string();
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with('#'));
        assert_eq!(lines[2].split_whitespace().count(), 3);
        assert_eq!(lines[2].split_whitespace().next().unwrap().parse::<f64>().unwrap(), 1.);
    }
}
