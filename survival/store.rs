//! The patient store: injectable artifact paths plus cached views of the dataset,
//! the model and the calibration.
//!
//! Writes go through [`PatientStore::append_patient`], which serialises writers
//! with a lock file and replaces the dataset atomically. Every successful write
//! invalidates the caches so the next read sees the new files. Retraining is a
//! separate step ([`PatientStore::run_pending_retrain`]).

use crate::artifact::{FileLock, LoadError, PersistenceError};
use crate::calibrator::{Calibration, CalibrationError, CalibrationSettings, calibrate};
use crate::cohort::{CohortSummary, DataInsufficientError, TrainingCohort};
use crate::dataset::{ClinicalRecord, load_dataset, save_dataset};
use crate::encoder::{EncodingError, FeatureEncoder, RawInputs, TokenPolicy};
use crate::model::{EpochProgress, ModelHandle, PredictionError};
use crate::predictor::{Prediction, predict_survival_time};
use crate::retrain::{RetrainError, RetrainOutcome, RetrainRequest, RetrainSettings, run_retrain_job};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Locations of the three persisted files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorePaths {
    pub dataset: PathBuf,
    pub model: PathBuf,
    pub calibration: PathBuf,
}

impl Default for StorePaths {
    fn default() -> Self {
        Self {
            dataset: PathBuf::from("data/patients.csv"),
            model: PathBuf::from("models/model.toml"),
            calibration: PathBuf::from("models/calibration.toml"),
        }
    }
}

impl StorePaths {
    /// All three files side by side in `dir`.
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            dataset: dir.join("patients.csv"),
            model: dir.join("model.toml"),
            calibration: dir.join("calibration.toml"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoreSettings {
    pub token_policy: TokenPolicy,
    pub lock_timeout: Duration,
    pub calibration: CalibrationSettings,
    pub retrain: RetrainSettings,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            token_policy: TokenPolicy::default(),
            lock_timeout: Duration::from_millis(5_000),
            calibration: CalibrationSettings::default(),
            retrain: RetrainSettings::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error("Invalid patient answers: {0}")]
    Encoding(#[from] EncodingError),
    #[error("Prediction failed: {0}")]
    Prediction(#[from] PredictionError),
    #[error("Calibration failed: {0}")]
    Calibration(#[from] CalibrationError),
    #[error(transparent)]
    DataInsufficient(#[from] DataInsufficientError),
}

/// Result of a successful append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendOutcome {
    pub rows: usize,
    pub retrain: RetrainRequest,
}

#[derive(Debug)]
pub struct PatientStore {
    paths: StorePaths,
    settings: StoreSettings,
    encoder: FeatureEncoder,
    records: Option<Vec<ClinicalRecord>>,
    model: Option<ModelHandle>,
    // Outer `None` is "not read yet", inner `None` is "no calibration file".
    calibration: Option<Option<Calibration>>,
    pending: Option<RetrainRequest>,
}

impl PatientStore {
    pub fn new(paths: StorePaths, settings: StoreSettings) -> Self {
        let encoder = FeatureEncoder::new(settings.token_policy);
        Self {
            paths,
            settings,
            encoder,
            records: None,
            model: None,
            calibration: None,
            pending: None,
        }
    }

    pub fn paths(&self) -> &StorePaths {
        &self.paths
    }

    pub fn settings(&self) -> &StoreSettings {
        &self.settings
    }

    pub fn encoder(&self) -> FeatureEncoder {
        self.encoder
    }

    pub fn pending_retrain(&self) -> Option<RetrainRequest> {
        self.pending
    }

    /// Drops every cached view. The next accessor re-reads its file.
    pub fn invalidate(&mut self) {
        self.records = None;
        self.model = None;
        self.calibration = None;
    }

    /// Invalidates and eagerly re-reads the dataset and the calibration. The
    /// model is re-read on first use.
    pub fn reload(&mut self) -> Result<(), LoadError> {
        self.invalidate();
        self.records()?;
        self.calibration()?;
        Ok(())
    }

    pub fn records(&mut self) -> Result<&[ClinicalRecord], LoadError> {
        let records = match self.records.take() {
            Some(records) => records,
            None => read_records(&self.paths.dataset)?,
        };
        Ok(self.records.insert(records).as_slice())
    }

    pub fn model(&mut self) -> Result<&ModelHandle, LoadError> {
        let handle = match self.model.take() {
            Some(handle) => handle,
            None => ModelHandle::load(&self.paths.model)?,
        };
        Ok(self.model.insert(handle))
    }

    /// The persisted calibration, or `None` when no calibration file exists yet.
    pub fn calibration(&mut self) -> Result<Option<&Calibration>, LoadError> {
        if self.calibration.is_none() {
            let loaded = match Calibration::load(&self.paths.calibration) {
                Ok(calibration) => Some(calibration),
                Err(LoadError::Missing(path)) => {
                    log::warn!(
                        "No calibration at {}; predictions use the default median",
                        path.display()
                    );
                    None
                }
                Err(err) => return Err(err),
            };
            self.calibration = Some(loaded);
        }
        Ok(self.calibration.as_ref().and_then(Option::as_ref))
    }

    /// Encodes `inputs` with the store's token policy and predicts with the
    /// cached model and calibration.
    pub fn predict(&mut self, inputs: &RawInputs) -> Result<Prediction, StoreError> {
        let features = self.encoder.encode(inputs)?;
        self.model()?;
        self.calibration()?;
        let handle = self.model.as_ref().ok_or_else(|| {
            LoadError::Missing(self.paths.model.clone())
        })?;
        let calibration = self.calibration.as_ref().and_then(Option::as_ref);
        Ok(predict_survival_time(handle, &features, calibration)?)
    }

    /// Normalises answers into a record and appends it.
    pub fn append_answers(
        &mut self,
        inputs: &RawInputs,
        follow_up: f64,
        event: bool,
    ) -> Result<AppendOutcome, StoreError> {
        let record = self.encoder.to_record(inputs, follow_up, event)?;
        self.append_patient(record)
    }

    /// Appends one patient under the dataset lock and requests a retrain.
    pub fn append_patient(&mut self, record: ClinicalRecord) -> Result<AppendOutcome, StoreError> {
        let rows = {
            let lock = FileLock::acquire(&self.paths.dataset, self.settings.lock_timeout)?;
            // Another writer may have appended since our cached read.
            let mut records = read_records(&self.paths.dataset)?;
            records.push(record);
            save_dataset(&self.paths.dataset, &records)?;
            drop(lock);
            records.len()
        };
        self.invalidate();

        let request = RetrainRequest { dataset_rows: rows };
        self.pending = Some(request);
        log::info!(
            "Appended patient to {} ({rows} rows); retrain pending",
            self.paths.dataset.display()
        );
        Ok(AppendOutcome {
            rows,
            retrain: request,
        })
    }

    /// Runs the retraining job if an append requested one. Calling it again
    /// without a new append is a no-op.
    pub fn run_pending_retrain(
        &mut self,
        observer: &mut dyn FnMut(&EpochProgress),
    ) -> Result<Option<RetrainOutcome>, RetrainError> {
        let Some(request) = self.pending.take() else {
            log::debug!("No retrain pending");
            return Ok(None);
        };
        match self.retrain_now(observer) {
            Ok(outcome) => Ok(Some(outcome)),
            Err(err) => {
                self.pending = Some(request);
                Err(err)
            }
        }
    }

    /// Retrains on the full stored dataset regardless of pending requests.
    pub fn retrain_now(
        &mut self,
        observer: &mut dyn FnMut(&EpochProgress),
    ) -> Result<RetrainOutcome, RetrainError> {
        let records = read_records(&self.paths.dataset)?;
        let outcome = run_retrain_job(
            &self.paths,
            &records,
            &self.settings.retrain,
            &self.settings.calibration,
            observer,
        );
        self.invalidate();
        if outcome.is_ok() {
            self.pending = None;
        }
        outcome
    }

    /// Re-derives the calibration from the current model and dataset and
    /// replaces the calibration file.
    pub fn recalibrate(&mut self) -> Result<Calibration, StoreError> {
        let cohort = TrainingCohort::from_records(self.records()?);
        let settings = self.settings.calibration.clone();
        let calibration = calibrate(self.model()?, &cohort, &settings)?;
        calibration.save(&self.paths.calibration)?;
        self.calibration = Some(Some(calibration.clone()));
        Ok(calibration)
    }

    /// Saves a freshly fitted model and calibrates it on the stored dataset.
    pub fn install_model(&mut self, handle: ModelHandle) -> Result<Calibration, StoreError> {
        handle.save(&self.paths.model)?;
        self.model = Some(handle);
        self.calibration = None;
        self.recalibrate()
    }

    pub fn summary(&mut self) -> Result<CohortSummary, StoreError> {
        Ok(CohortSummary::from_records(self.records()?)?)
    }
}

fn read_records(path: &Path) -> Result<Vec<ClinicalRecord>, LoadError> {
    if !path.exists() {
        log::warn!("No dataset at {}; starting empty", path.display());
        return Ok(Vec::new());
    }
    Ok(load_dataset(path)?)
}
