use crate::calibrator::{SurvivalCurve, kaplan_meier};
use crate::dataset::{
    AGE, ClinicalRecord, EVENT, FOLLOW_UP, NUM_COVARIATES, findings, token_for,
};
use crate::encoder::encode_cohort;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use serde::Serialize;
use thiserror::Error;

/// Not enough patients (or events) to fit or calibrate.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{context}: at least {required} patients are required, found {found}.")]
pub struct DataInsufficientError {
    pub required: usize,
    pub found: usize,
    pub context: String,
}

impl DataInsufficientError {
    pub fn new(required: usize, found: usize, context: impl Into<String>) -> Self {
        Self {
            required,
            found,
            context: context.into(),
        }
    }
}

/// Encoded covariates and observed outcomes for a set of patients.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingCohort {
    features: Array2<f64>,
    time: Array1<f64>,
    event: Array1<bool>,
}

impl TrainingCohort {
    pub fn from_records(records: &[ClinicalRecord]) -> Self {
        Self {
            features: encode_cohort(records),
            time: records.iter().map(ClinicalRecord::follow_up).collect(),
            event: records.iter().map(ClinicalRecord::event).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.time.len()
    }

    pub fn is_empty(&self) -> bool {
        self.time.is_empty()
    }

    pub fn n_events(&self) -> usize {
        self.event.iter().filter(|&&event| event).count()
    }

    pub fn features(&self) -> ArrayView2<'_, f64> {
        self.features.view()
    }

    pub fn time(&self) -> ArrayView1<'_, f64> {
        self.time.view()
    }

    pub fn event(&self) -> ArrayView1<'_, bool> {
        self.event.view()
    }

    /// Rows at `indices`, in that order.
    pub fn subset(&self, indices: &[usize]) -> Self {
        Self {
            features: self.features.select(Axis(0), indices),
            time: self.time.select(Axis(0), indices),
            event: self.event.select(Axis(0), indices),
        }
    }

    pub fn require(&self, required: usize, context: &str) -> Result<(), DataInsufficientError> {
        if self.len() < required {
            return Err(DataInsufficientError::new(required, self.len(), context));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NumericSummary {
    pub name: String,
    pub mean: f64,
    pub median: f64,
    pub std_dev: f64,
    pub unique: usize,
}

impl NumericSummary {
    fn from_values(name: &str, values: &[f64]) -> Self {
        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;
        let std_dev = if values.len() > 1 {
            (values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0)).sqrt()
        } else {
            0.0
        };
        let mut sorted = values.to_vec();
        sorted.sort_by(f64::total_cmp);
        let mut distinct = sorted.clone();
        distinct.dedup();
        Self {
            name: name.to_string(),
            mean,
            median: median_of_sorted(&sorted),
            std_dev,
            unique: distinct.len(),
        }
    }
}

/// Median of an ascending, non-empty slice.
pub(crate) fn median_of_sorted(sorted: &[f64]) -> f64 {
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CategoricalSummary {
    pub name: String,
    pub mode: String,
    pub mode_count: usize,
    pub unique: usize,
}

impl CategoricalSummary {
    fn from_flags(name: &str, flags: impl Iterator<Item = bool>) -> Self {
        let (mut yes, mut no) = (0usize, 0usize);
        for flag in flags {
            if flag {
                yes += 1;
            } else {
                no += 1;
            }
        }
        // Ties resolve to NON.
        let (mode, mode_count) = if yes > no { (true, yes) } else { (false, no) };
        Self {
            name: name.to_string(),
            mode: token_for(mode).to_string(),
            mode_count,
            unique: usize::from(yes > 0) + usize::from(no > 0),
        }
    }
}

/// Descriptive statistics of the stored cohort.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CohortSummary {
    pub patients: usize,
    pub variables: usize,
    pub events: usize,
    pub event_rate: f64,
    pub numeric: Vec<NumericSummary>,
    pub categorical: Vec<CategoricalSummary>,
    pub survival: SurvivalCurve,
}

impl CohortSummary {
    pub fn from_records(records: &[ClinicalRecord]) -> Result<Self, DataInsufficientError> {
        if records.is_empty() {
            return Err(DataInsufficientError::new(1, 0, "Cohort summary"));
        }
        let ages: Vec<f64> = records.iter().map(ClinicalRecord::age).collect();
        let follow_ups: Vec<f64> = records.iter().map(ClinicalRecord::follow_up).collect();
        let events = records.iter().filter(|record| record.event()).count();

        let mut categorical: Vec<CategoricalSummary> = findings()
            .iter()
            .enumerate()
            .map(|(idx, name)| {
                CategoricalSummary::from_flags(name, records.iter().map(|r| r.findings()[idx]))
            })
            .collect();
        categorical.push(CategoricalSummary::from_flags(
            EVENT,
            records.iter().map(ClinicalRecord::event),
        ));

        let cohort = TrainingCohort::from_records(records);
        Ok(Self {
            patients: records.len(),
            variables: NUM_COVARIATES + 2,
            events,
            event_rate: events as f64 / records.len() as f64,
            numeric: vec![
                NumericSummary::from_values(AGE, &ages),
                NumericSummary::from_values(FOLLOW_UP, &follow_ups),
            ],
            categorical,
            survival: kaplan_meier(cohort.time(), cohort.event(), None),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::NUM_FINDINGS;
    use approx::assert_relative_eq;

    fn record(age: f64, smoker: bool, follow_up: f64, event: bool) -> ClinicalRecord {
        let mut flags = [false; NUM_FINDINGS];
        flags[5] = smoker;
        ClinicalRecord::new(age, flags, follow_up, event).expect("record")
    }

    #[test]
    fn cohort_matrix_matches_records() {
        let records = vec![record(40.0, true, 5.0, true), record(60.0, false, 9.0, false)];
        let cohort = TrainingCohort::from_records(&records);
        assert_eq!(cohort.len(), 2);
        assert_eq!(cohort.features().shape(), &[2, NUM_COVARIATES]);
        assert_eq!(cohort.features()[[0, 6]], 1.0);
        assert_eq!(cohort.n_events(), 1);

        let reversed = cohort.subset(&[1, 0]);
        assert_eq!(reversed.time().to_vec(), vec![9.0, 5.0]);
        assert_eq!(reversed.event().to_vec(), vec![false, true]);
    }

    #[test]
    fn require_reports_shortfall() {
        let cohort = TrainingCohort::from_records(&[record(40.0, false, 1.0, false)]);
        let err = cohort.require(10, "Retraining").expect_err("too small");
        assert_eq!(err, DataInsufficientError::new(10, 1, "Retraining"));
    }

    #[test]
    fn summary_statistics() {
        let records = vec![
            record(40.0, true, 5.0, true),
            record(50.0, true, 10.0, false),
            record(60.0, false, 20.0, true),
            record(60.0, false, 30.0, false),
        ];
        let summary = CohortSummary::from_records(&records).expect("summary");
        assert_eq!(summary.patients, 4);
        assert_eq!(summary.variables, 14);
        assert_eq!(summary.events, 2);
        assert_relative_eq!(summary.event_rate, 0.5);

        let age = &summary.numeric[0];
        assert_relative_eq!(age.mean, 52.5);
        assert_relative_eq!(age.median, 55.0);
        assert_relative_eq!(age.std_dev, (275.0f64 / 3.0).sqrt(), epsilon = 1e-12);
        assert_eq!(age.unique, 3);

        let tabac = summary
            .categorical
            .iter()
            .find(|c| c.name == "Tabac")
            .expect("Tabac summary");
        assert_eq!(tabac.mode, "NON");
        assert_eq!(tabac.mode_count, 2);
        assert_eq!(tabac.unique, 2);

        let metastases = &summary.categorical[9];
        assert_eq!(metastases.mode, "NON");
        assert_eq!(metastases.mode_count, 4);
        assert_eq!(metastases.unique, 1);
        assert_eq!(summary.categorical.last().map(|c| c.name.as_str()), Some(EVENT));
    }

    #[test]
    fn empty_summary_is_insufficient() {
        assert!(CohortSummary::from_records(&[]).is_err());
    }
}
