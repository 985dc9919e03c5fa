#![deny(dead_code)]
#![deny(unused_imports)]

//! Calibrated survival-time prediction for clinical cohorts.
//!
//! The crate turns a patient's clinical answers into a median survival estimate:
//! answers are encoded into a fixed-order feature row ([`encoder`]), scored by one
//! of several proportional-hazards model families ([`model`]), and mapped to months
//! through a calibration derived from the stored cohort ([`calibrator`],
//! [`predictor`]). The [`store`] owns the persisted dataset and artifacts and the
//! [`retrain`] job refits the model as the cohort grows.

pub mod artifact;
pub mod calibrator;
pub mod cohort;
pub mod config;
pub mod dataset;
pub mod encoder;
pub mod model;
pub mod predictor;
pub mod retrain;
pub mod store;

pub use calibrator::{Calibration, CalibrationSettings, CalibrationStrategy};
pub use cohort::{DataInsufficientError, TrainingCohort};
pub use dataset::ClinicalRecord;
pub use encoder::{EncodedFeatures, RawInputs, RawValue, encode};
pub use model::{ModelFamily, ModelHandle};
pub use predictor::{Prediction, clean, predict, predict_survival_time};
pub use store::{PatientStore, StorePaths};
