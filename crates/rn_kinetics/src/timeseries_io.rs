use std::fs;
use std::path::Path;

use crate::timeseries::Timeseries;
use crate::timeseries::TimeseriesError;

impl Timeseries {
    pub fn to_json(&self) -> Result<String, TimeseriesError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(data: &str) -> Result<Self, TimeseriesError> {
        let series: Timeseries = serde_json::from_str(data)?;
        series.validate()?;
        Ok(series)
    }

    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), TimeseriesError> {
        fs::write(path, self.to_json()?)?;
        Ok(())
    }

    /// Load a time series from a JSON file, checking that every row has one
    /// value per observable.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, TimeseriesError> {
        let data = fs::read_to_string(path)?;
        Self::from_json(&data)
    }

    /// The gdat-like table, written to a file.
    pub fn to_table_file<P: AsRef<Path>>(&self, path: P) -> Result<(), TimeseriesError> {
        fs::write(path, format!("{}\n", self))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timeseries::TimeRow;

    #[test]
    fn test_json_and_width_check() {
        let mut ts = Timeseries::new(vec!["Atot".to_string()]);
        ts.push(TimeRow { time: 0.5, observables: vec![2.], species: vec![1., 0.5] });
        let json = ts.to_json().unwrap();
        assert_eq!(Timeseries::from_json(&json).unwrap(), ts);

        let broken = json.replace("\"Atot\"", "\"Atot\", \"Btot\"");
        assert!(matches!(
            Timeseries::from_json(&broken),
            Err(TimeseriesError::RowWidthMismatch { row: 0, found: 1, expected: 2 })
        ));
        assert!(matches!(Timeseries::from_json("{"), Err(TimeseriesError::Json(_))));
    }

    #[test]
    fn test_file_roundtrip() {
        let mut ts = Timeseries::new(vec!["X".to_string()]);
        ts.push(TimeRow { time: 0., observables: vec![1.], species: vec![1.] });
        let path = std::env::temp_dir().join(format!("rn_kinetics_ts_{}.json", std::process::id()));
        ts.to_file(&path).unwrap();
        assert_eq!(Timeseries::from_file(&path).unwrap(), ts);
        std::fs::remove_file(&path).unwrap();
        assert!(matches!(Timeseries::from_file(&path), Err(TimeseriesError::Io(_))));
    }
}
