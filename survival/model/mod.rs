//! Survival model adapter.
//!
//! Every model family exposes the same contract: a feature matrix in canonical
//! covariate order goes in, one log-risk score per row comes out (higher means
//! shorter expected survival). The family is fixed when an artifact is loaded or
//! fitted and dispatched through [`ModelParameters`]; callers never inspect the
//! underlying model.

pub mod boosted;
pub mod cox;
pub mod deepsurv;
pub mod loss;

use crate::artifact::{LoadError, PersistenceError, load_toml, save_toml};
use crate::cohort::TrainingCohort;
use crate::dataset::COVARIATES;
use crate::encoder::EncodedFeatures;
use boosted::BoostedEnsemble;
use cox::CoxModel;
use deepsurv::{Activation, DeepSurvNetwork};
use loss::{COX_LOSS, TrainingLoss};
use ndarray::{Array1, Array2, ArrayView2};
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelFamily {
    #[default]
    DeepSurv,
    CoxPh,
    GradientBoosted,
}

impl fmt::Display for ModelFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ModelFamily::DeepSurv => "deepsurv",
            ModelFamily::CoxPh => "coxph",
            ModelFamily::GradientBoosted => "gradientboosted",
        };
        f.write_str(name)
    }
}

impl FromStr for ModelFamily {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "deepsurv" => Ok(ModelFamily::DeepSurv),
            "coxph" | "cox" => Ok(ModelFamily::CoxPh),
            "gradientboosted" | "boosted" => Ok(ModelFamily::GradientBoosted),
            other => Err(format!(
                "unknown model family '{other}'; expected deepsurv, coxph or gradientboosted"
            )),
        }
    }
}

/// Raw model output before it is reduced to one risk per row.
#[derive(Debug, Clone, PartialEq)]
pub enum RawPrediction {
    /// One log-risk score per row.
    Scores(Array1<f64>),
    /// Network output, expected to be `rows × 1`.
    Column(Array2<f64>),
    /// `exp(log-risk)` per row.
    PartialHazard(Array1<f64>),
}

impl RawPrediction {
    pub fn into_risk(self, rows: usize) -> Result<Array1<f64>, PredictionError> {
        let risk = match self {
            RawPrediction::Scores(scores) => scores,
            RawPrediction::Column(column) => {
                if column.ncols() != 1 || column.nrows() != rows {
                    return Err(PredictionError::ShapeMismatch {
                        rows,
                        found: column.shape().to_vec(),
                    });
                }
                column.column(0).to_owned()
            }
            RawPrediction::PartialHazard(hazard) => hazard.mapv(f64::ln),
        };
        if risk.len() != rows {
            return Err(PredictionError::ShapeMismatch {
                rows,
                found: vec![risk.len()],
            });
        }
        if let Some(row) = risk.iter().position(|r| !r.is_finite()) {
            return Err(PredictionError::NonFiniteRisk { row });
        }
        Ok(risk)
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum PredictionError {
    #[error("Model output has shape {found:?}; expected {rows} risks as a vector or a {rows}x1 column.")]
    ShapeMismatch { rows: usize, found: Vec<usize> },
    #[error("Prediction data has {found} feature columns, but the model was trained on {expected}.")]
    FeatureCountMismatch { expected: usize, found: usize },
    #[error("The {0} artifact holds no fitted parameters and cannot predict.")]
    NoPredictionCapability(ModelFamily),
    #[error("The model produced a non-finite risk for row {row}.")]
    NonFiniteRisk { row: usize },
}

#[derive(Debug, Error)]
pub enum TrainingError {
    #[error("Cannot train on an empty cohort.")]
    EmptyCohort,
    #[error("The cohort has no observed event; the partial likelihood is flat.")]
    NoEvents,
    #[error("Training data has {found} feature columns, but the model expects {expected}.")]
    FeatureCountMismatch { expected: usize, found: usize },
    #[error("Invalid training schedule: {0}")]
    InvalidSchedule(String),
    #[error("Training left non-finite parameters in the {0} model.")]
    NonFiniteParameters(ModelFamily),
    #[error("Prediction failed during training: {0}")]
    Prediction(#[from] PredictionError),
}

/// How many passes to run and how to batch them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingSchedule {
    pub epochs: usize,
    pub batch_size: usize,
    pub seed: u64,
}

impl Default for TrainingSchedule {
    fn default() -> Self {
        Self {
            epochs: 10,
            batch_size: 32,
            seed: 42,
        }
    }
}

/// Hyperparameters for fitting a model from scratch. Only the fields of the chosen
/// family are read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSettings {
    pub family: ModelFamily,
    pub hidden_layers: Vec<usize>,
    pub activation: Activation,
    pub learning_rate: f64,
    pub l2: f64,
    pub ridge: f64,
    pub shrinkage: f64,
    pub max_depth: usize,
    pub min_samples_leaf: usize,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            family: ModelFamily::DeepSurv,
            hidden_layers: vec![32, 16],
            activation: Activation::Relu,
            learning_rate: 0.01,
            l2: 1e-4,
            ridge: 0.1,
            shrinkage: 0.1,
            max_depth: 3,
            min_samples_leaf: 5,
        }
    }
}

/// Progress report emitted after every training pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochProgress {
    pub epoch: usize,
    pub epochs: usize,
    pub loss: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrainingReport {
    pub epochs: usize,
    pub initial_loss: f64,
    pub final_loss: f64,
}

/// Everything a family needs for one pass over the cohort.
pub struct TrainingPass<'a> {
    pub cohort: &'a TrainingCohort,
    pub loss: TrainingLoss,
    pub schedule: &'a TrainingSchedule,
    pub rng: &'a mut StdRng,
}

/// The per-family capability set behind [`ModelHandle`].
pub trait SurvivalModel {
    fn n_features(&self) -> usize;
    fn is_fitted(&self) -> bool;
    fn parameters_finite(&self) -> bool;
    fn raw_predict(&self, features: ArrayView2<'_, f64>) -> RawPrediction;
    /// Resets optimiser state ahead of a training run.
    fn compile(&mut self) {}
    fn train_pass(&mut self, pass: &mut TrainingPass<'_>) -> Result<(), TrainingError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "family", rename_all = "lowercase")]
pub enum ModelParameters {
    DeepSurv(DeepSurvNetwork),
    CoxPh(CoxModel),
    GradientBoosted(BoostedEnsemble),
}

impl ModelParameters {
    pub fn family(&self) -> ModelFamily {
        match self {
            ModelParameters::DeepSurv(_) => ModelFamily::DeepSurv,
            ModelParameters::CoxPh(_) => ModelFamily::CoxPh,
            ModelParameters::GradientBoosted(_) => ModelFamily::GradientBoosted,
        }
    }

    fn as_model(&self) -> &dyn SurvivalModel {
        match self {
            ModelParameters::DeepSurv(network) => network,
            ModelParameters::CoxPh(cox) => cox,
            ModelParameters::GradientBoosted(ensemble) => ensemble,
        }
    }

    fn as_model_mut(&mut self) -> &mut dyn SurvivalModel {
        match self {
            ModelParameters::DeepSurv(network) => network,
            ModelParameters::CoxPh(cox) => cox,
            ModelParameters::GradientBoosted(ensemble) => ensemble,
        }
    }
}

/// On-disk form of a trained model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelArtifact {
    /// Registered name of the training loss, re-bound on load.
    pub loss: String,
    pub feature_names: Vec<String>,
    pub model: ModelParameters,
}

/// A loaded model with its training loss bound.
#[derive(Debug, Clone)]
pub struct ModelHandle {
    artifact: ModelArtifact,
    loss: TrainingLoss,
}

impl ModelHandle {
    pub fn new(model: ModelParameters) -> Self {
        Self {
            artifact: ModelArtifact {
                loss: COX_LOSS.to_string(),
                feature_names: COVARIATES.iter().map(|name| name.to_string()).collect(),
                model,
            },
            loss: TrainingLoss::Cox,
        }
    }

    /// Loads a `.toml` model artifact and re-binds its training loss by name.
    pub fn load(path: &Path) -> Result<Self, LoadError> {
        let artifact: ModelArtifact = load_toml(path)?;
        let loss = TrainingLoss::from_name(&artifact.loss).ok_or_else(|| LoadError::UnknownLoss {
            path: path.to_path_buf(),
            name: artifact.loss.clone(),
        })?;

        let invalid = |reason: String| LoadError::Invalid {
            path: path.to_path_buf(),
            reason,
        };
        if artifact.feature_names.iter().map(String::as_str).ne(COVARIATES) {
            return Err(invalid(format!(
                "feature names {:?} do not match the canonical covariate order",
                artifact.feature_names
            )));
        }
        let model = artifact.model.as_model();
        if model.is_fitted() && model.n_features() != artifact.feature_names.len() {
            return Err(invalid(format!(
                "model expects {} features but the artifact lists {}",
                model.n_features(),
                artifact.feature_names.len()
            )));
        }

        log::info!(
            "Loaded {} model from {} (loss '{}')",
            artifact.model.family(),
            path.display(),
            loss.name()
        );
        Ok(Self { artifact, loss })
    }

    /// Atomically replaces the artifact at `path`. Non-finite parameters are never
    /// written.
    pub fn save(&self, path: &Path) -> Result<(), PersistenceError> {
        if !self.model().parameters_finite() {
            return Err(PersistenceError::Rejected(format!(
                "the {} model has non-finite parameters",
                self.family()
            )));
        }
        save_toml(path, &self.artifact)?;
        log::info!("Saved {} model to {}", self.family(), path.display());
        Ok(())
    }

    pub fn family(&self) -> ModelFamily {
        self.artifact.model.family()
    }

    pub fn loss(&self) -> TrainingLoss {
        self.loss
    }

    pub fn parameters(&self) -> &ModelParameters {
        &self.artifact.model
    }

    pub fn n_features(&self) -> usize {
        self.model().n_features()
    }

    fn model(&self) -> &dyn SurvivalModel {
        self.artifact.model.as_model()
    }

    /// One log-risk score per row of `features`.
    pub fn risk(&self, features: ArrayView2<'_, f64>) -> Result<Array1<f64>, PredictionError> {
        let model = self.model();
        if !model.is_fitted() {
            return Err(PredictionError::NoPredictionCapability(self.family()));
        }
        if features.ncols() != model.n_features() {
            return Err(PredictionError::FeatureCountMismatch {
                expected: model.n_features(),
                found: features.ncols(),
            });
        }
        model.raw_predict(features).into_risk(features.nrows())
    }

    pub fn risk_one(&self, features: &EncodedFeatures) -> Result<f64, PredictionError> {
        let risk = self.risk(features.as_row().view())?;
        Ok(risk[0])
    }

    fn cohort_loss(&self, cohort: &TrainingCohort) -> Result<f64, PredictionError> {
        let risk = self.risk(cohort.features())?;
        Ok(self
            .loss
            .value(risk.view(), cohort.time(), cohort.event()))
    }

    /// Runs `schedule.epochs` passes over `cohort`, starting from the current
    /// parameters with a freshly compiled optimiser.
    pub fn continue_training(
        &mut self,
        cohort: &TrainingCohort,
        schedule: &TrainingSchedule,
        observer: &mut dyn FnMut(&EpochProgress),
    ) -> Result<TrainingReport, TrainingError> {
        if schedule.batch_size == 0 {
            return Err(TrainingError::InvalidSchedule(
                "batch_size must be at least 1".to_string(),
            ));
        }
        if cohort.is_empty() {
            return Err(TrainingError::EmptyCohort);
        }
        if cohort.n_events() == 0 {
            return Err(TrainingError::NoEvents);
        }
        let expected = self.n_features();
        if cohort.features().ncols() != expected {
            return Err(TrainingError::FeatureCountMismatch {
                expected,
                found: cohort.features().ncols(),
            });
        }

        let initial_loss = self.cohort_loss(cohort)?;
        let loss = self.loss;
        let family = self.family();
        let mut rng = StdRng::seed_from_u64(schedule.seed);
        self.artifact.model.as_model_mut().compile();
        log::info!(
            "Training {family} model for {} passes on {} patients ({} events)",
            schedule.epochs,
            cohort.len(),
            cohort.n_events()
        );

        let mut final_loss = initial_loss;
        for epoch in 1..=schedule.epochs {
            let mut pass = TrainingPass {
                cohort,
                loss,
                schedule,
                rng: &mut rng,
            };
            self.artifact.model.as_model_mut().train_pass(&mut pass)?;
            final_loss = self.cohort_loss(cohort)?;
            log::debug!("Pass {epoch}/{}: loss {final_loss:.6}", schedule.epochs);
            observer(&EpochProgress {
                epoch,
                epochs: schedule.epochs,
                loss: final_loss,
            });
        }

        Ok(TrainingReport {
            epochs: schedule.epochs,
            initial_loss,
            final_loss,
        })
    }

    /// Checks that the model can be persisted and used on `cohort`: finite
    /// parameters, matching feature count and a finite risk for every patient.
    pub fn validate(&self, cohort: &TrainingCohort) -> Result<(), TrainingError> {
        if !self.model().parameters_finite() {
            return Err(TrainingError::NonFiniteParameters(self.family()));
        }
        if cohort.features().ncols() != self.n_features() {
            return Err(TrainingError::FeatureCountMismatch {
                expected: self.n_features(),
                found: cohort.features().ncols(),
            });
        }
        self.risk(cohort.features())?;
        Ok(())
    }
}

pub fn load(path: &Path) -> Result<ModelHandle, LoadError> {
    ModelHandle::load(path)
}

pub fn risk(
    handle: &ModelHandle,
    features: ArrayView2<'_, f64>,
) -> Result<Array1<f64>, PredictionError> {
    handle.risk(features)
}

/// Initialises the requested family on `cohort` and trains it for `schedule.epochs`
/// passes.
pub fn fit_model(
    settings: &ModelSettings,
    cohort: &TrainingCohort,
    schedule: &TrainingSchedule,
    observer: &mut dyn FnMut(&EpochProgress),
) -> Result<ModelHandle, TrainingError> {
    if cohort.is_empty() {
        return Err(TrainingError::EmptyCohort);
    }
    let features = cohort.features();
    let parameters = match settings.family {
        ModelFamily::DeepSurv => {
            let mut rng = StdRng::seed_from_u64(schedule.seed);
            ModelParameters::DeepSurv(DeepSurvNetwork::new(
                features,
                &settings.hidden_layers,
                settings.activation,
                settings.learning_rate,
                settings.l2,
                &mut rng,
            ))
        }
        ModelFamily::CoxPh => ModelParameters::CoxPh(CoxModel::new(features, settings.ridge)),
        ModelFamily::GradientBoosted => ModelParameters::GradientBoosted(BoostedEnsemble::new(
            features.ncols(),
            settings.shrinkage,
            settings.max_depth,
            settings.min_samples_leaf,
        )),
    };
    let mut handle = ModelHandle::new(parameters);
    handle.continue_training(cohort, schedule, observer)?;
    handle.validate(cohort)?;
    Ok(handle)
}
