//! Incremental retraining on the accumulated dataset.
//!
//! Appending a patient only records a [`RetrainRequest`]; the job below runs
//! separately. It continues training a copy of the persisted model, validates the
//! copy and derives its calibration, and only then replaces both artifacts. A
//! failed calibration write restores the previous model file.

use crate::artifact::{LoadError, PersistenceError, write_atomic};
use crate::calibrator::{CalibrationError, CalibrationSettings, CalibrationStrategy, calibrate};
use crate::cohort::{DataInsufficientError, TrainingCohort};
use crate::dataset::ClinicalRecord;
use crate::model::{EpochProgress, ModelHandle, TrainingError, TrainingReport, TrainingSchedule};
use crate::store::StorePaths;
use serde::{Deserialize, Serialize};
use std::fs;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrainSettings {
    /// Retraining is skipped below this many stored patients.
    pub min_rows: usize,
    #[serde(flatten)]
    pub schedule: TrainingSchedule,
}

impl Default for RetrainSettings {
    fn default() -> Self {
        Self {
            min_rows: 10,
            schedule: TrainingSchedule::default(),
        }
    }
}

/// Marker left by an append: the dataset has grown to `dataset_rows` patients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetrainRequest {
    pub dataset_rows: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RetrainOutcome {
    Skipped(DataInsufficientError),
    Completed {
        rows: usize,
        report: TrainingReport,
        calibration: Option<CalibrationStrategy>,
    },
}

#[derive(Debug, Error)]
pub enum RetrainError {
    #[error("Could not load the current model: {0}")]
    Load(#[from] LoadError),
    #[error("Training failed: {0}")]
    Training(#[from] TrainingError),
    #[error("Could not persist the retrained model: {0}")]
    Persistence(#[from] PersistenceError),
    #[error("Could not persist the refreshed calibration; the previous model was restored: {0}")]
    CalibrationPersistence(PersistenceError),
    #[error("Could not refresh the calibration: {0}")]
    Calibration(#[from] CalibrationError),
}

/// Continues training a copy of `handle` on every record and validates it. The
/// input handle is never modified.
pub fn retrain(
    handle: &ModelHandle,
    records: &[ClinicalRecord],
    schedule: &TrainingSchedule,
    observer: &mut dyn FnMut(&EpochProgress),
) -> Result<(ModelHandle, TrainingReport), TrainingError> {
    let cohort = TrainingCohort::from_records(records);
    let mut candidate = handle.clone();
    let report = candidate.continue_training(&cohort, schedule, observer)?;
    candidate.validate(&cohort)?;
    log::info!(
        "Retrained {} model on {} patients: loss {:.4} -> {:.4}",
        candidate.family(),
        cohort.len(),
        report.initial_loss,
        report.final_loss
    );
    Ok((candidate, report))
}

/// Retrains the persisted model on `records`, replaces the model artifact and
/// re-derives the calibration artifact from the new model.
///
/// A cohort below `settings.min_rows` patients, or one without any observed death,
/// is skipped with a warning and leaves both artifacts untouched.
pub fn run_retrain_job(
    paths: &StorePaths,
    records: &[ClinicalRecord],
    settings: &RetrainSettings,
    calibration: &CalibrationSettings,
    observer: &mut dyn FnMut(&EpochProgress),
) -> Result<RetrainOutcome, RetrainError> {
    if records.len() < settings.min_rows {
        let shortfall = DataInsufficientError::new(settings.min_rows, records.len(), "Retraining");
        log::warn!("Skipping retraining: {shortfall}");
        return Ok(RetrainOutcome::Skipped(shortfall));
    }
    let cohort = TrainingCohort::from_records(records);
    if cohort.n_events() == 0 {
        let shortfall =
            DataInsufficientError::new(1, 0, "Retraining (patients with an observed death)");
        log::warn!("Skipping retraining: {shortfall}");
        return Ok(RetrainOutcome::Skipped(shortfall));
    }

    let current = ModelHandle::load(&paths.model)?;
    let previous = fs::read(&paths.model).map_err(|e| PersistenceError::io(&paths.model, e))?;
    let (retrained, report) = retrain(&current, records, &settings.schedule, observer)?;
    let table = calibrate(&retrained, &cohort, calibration)?;
    table.validate()?;

    retrained.save(&paths.model)?;
    if let Err(err) = table.save(&paths.calibration) {
        if let Err(restore) = write_atomic(&paths.model, &previous) {
            log::error!(
                "Failed to restore the previous model at {}: {restore}",
                paths.model.display()
            );
        }
        return Err(RetrainError::CalibrationPersistence(err));
    }

    Ok(RetrainOutcome::Completed {
        rows: records.len(),
        report,
        calibration: table.strategy(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::NUM_FINDINGS;
    use crate::model::ModelParameters;
    use crate::model::cox::CoxModel;
    use ndarray::Array1;
    use std::fs;
    use tempfile::tempdir;

    fn records(n: usize) -> Vec<ClinicalRecord> {
        (0..n)
            .map(|i| {
                let mut flags = [false; NUM_FINDINGS];
                flags[9] = i % 2 == 0;
                let time = if flags[9] { 5.0 + i as f64 } else { 30.0 + i as f64 };
                ClinicalRecord::new(50.0, flags, time, i % 3 != 2).expect("record")
            })
            .collect()
    }

    fn zero_cox() -> ModelHandle {
        ModelHandle::new(ModelParameters::CoxPh(CoxModel {
            coefficients: Array1::zeros(12),
            means: Array1::zeros(12),
            ridge: 0.5,
        }))
    }

    #[test]
    fn retrain_leaves_the_input_handle_alone() {
        let original = zero_cox();
        let schedule = TrainingSchedule {
            epochs: 3,
            ..TrainingSchedule::default()
        };
        let (retrained, report) =
            retrain(&original, &records(12), &schedule, &mut |_| {}).expect("retrain");
        assert_eq!(report.epochs, 3);
        assert!(report.final_loss <= report.initial_loss);
        let ModelParameters::CoxPh(before) = original.parameters() else {
            panic!("family changed");
        };
        let ModelParameters::CoxPh(after) = retrained.parameters() else {
            panic!("family changed");
        };
        assert!(before.coefficients.iter().all(|&c| c == 0.0));
        assert!(after.coefficients[10] > 0.0);
    }

    #[test]
    fn too_few_rows_skip_without_touching_files() {
        let dir = tempdir().expect("tempdir");
        let paths = StorePaths::in_dir(dir.path());
        let outcome = run_retrain_job(
            &paths,
            &records(4),
            &RetrainSettings::default(),
            &CalibrationSettings::default(),
            &mut |_| {},
        )
        .expect("skip is not an error");
        assert_eq!(
            outcome,
            RetrainOutcome::Skipped(DataInsufficientError::new(10, 4, "Retraining"))
        );
        assert!(!paths.model.exists());
    }

    #[test]
    fn job_replaces_model_and_calibration() {
        let dir = tempdir().expect("tempdir");
        let paths = StorePaths::in_dir(dir.path());
        zero_cox().save(&paths.model).expect("seed model");
        let before = fs::read_to_string(&paths.model).expect("read");

        let outcome = run_retrain_job(
            &paths,
            &records(12),
            &RetrainSettings::default(),
            &CalibrationSettings::default(),
            &mut |_| {},
        )
        .expect("retrain");
        assert!(matches!(
            outcome,
            RetrainOutcome::Completed {
                rows: 12,
                calibration: Some(CalibrationStrategy::Baseline),
                ..
            }
        ));
        assert_ne!(fs::read_to_string(&paths.model).expect("read"), before);
        assert!(paths.calibration.exists());
    }

    #[test]
    fn cohort_without_deaths_is_skipped() {
        let dir = tempdir().expect("tempdir");
        let paths = StorePaths::in_dir(dir.path());
        zero_cox().save(&paths.model).expect("seed model");
        let before = fs::read(&paths.model).expect("read");
        let censored: Vec<ClinicalRecord> = records(12)
            .iter()
            .map(|r| {
                ClinicalRecord::new(r.age(), *r.findings(), r.follow_up(), false).expect("record")
            })
            .collect();

        let outcome = run_retrain_job(
            &paths,
            &censored,
            &RetrainSettings::default(),
            &CalibrationSettings::default(),
            &mut |_| panic!("no pass may run"),
        )
        .expect("skip is not an error");
        assert!(matches!(
            outcome,
            RetrainOutcome::Skipped(DataInsufficientError {
                required: 1,
                found: 0,
                ..
            })
        ));
        assert_eq!(fs::read(&paths.model).expect("read"), before);
        assert!(!paths.calibration.exists());
    }

    #[test]
    fn failed_calibration_write_restores_the_previous_model() {
        let dir = tempdir().expect("tempdir");
        let paths = StorePaths::in_dir(dir.path());
        zero_cox().save(&paths.model).expect("seed model");
        let before = fs::read(&paths.model).expect("read");
        // A directory in place of the calibration file makes its rename fail.
        fs::create_dir(&paths.calibration).expect("block calibration path");

        let err = run_retrain_job(
            &paths,
            &records(12),
            &RetrainSettings::default(),
            &CalibrationSettings::default(),
            &mut |_| {},
        )
        .expect_err("calibration cannot be written");
        assert!(matches!(err, RetrainError::CalibrationPersistence(_)));
        assert!(err.to_string().contains("calibration"));
        assert_eq!(fs::read(&paths.model).expect("read"), before);
    }
}
