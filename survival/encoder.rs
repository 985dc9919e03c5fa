//! Raw clinical answers to fixed-order numeric feature rows.
//!
//! Inputs arrive as a name → value map (form fields, a TOML file, CLI flags). The
//! encoder looks up every canonical covariate by name and emits one `f64` per
//! covariate in [`COVARIATES`] order. Column order never depends on the input map.

use crate::dataset::{
    AGE, COVARIATES, ClinicalRecord, NUM_COVARIATES, NUM_FINDINGS, RecordError, Token,
    classify_token, findings, is_covariate,
};
use ndarray::{Array1, Array2, ArrayView1, Axis};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// A single answer as supplied by the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawValue {
    Flag(bool),
    Number(f64),
    Text(String),
}

impl From<&str> for RawValue {
    fn from(value: &str) -> Self {
        RawValue::Text(value.to_string())
    }
}

impl From<f64> for RawValue {
    fn from(value: f64) -> Self {
        RawValue::Number(value)
    }
}

impl From<bool> for RawValue {
    fn from(value: bool) -> Self {
        RawValue::Flag(value)
    }
}

pub type RawInputs = BTreeMap<String, RawValue>;

#[derive(Debug, Error, PartialEq)]
pub enum EncodingError {
    #[error("The required covariate '{0}' is missing from the inputs.")]
    MissingCovariate(String),
    #[error("Age must be a finite number, got '{0}'.")]
    InvalidAge(String),
    #[error("Covariate '{covariate}' has unrecognized value '{value}'; expected OUI or NON.")]
    UnrecognizedToken { covariate: String, value: String },
    #[error("Expected {expected} feature columns, found {found}.")]
    ColumnCountMismatch { expected: usize, found: usize },
    #[error("Invalid clinical record: {0}")]
    InvalidRecord(#[from] RecordError),
}

/// What to do with a categorical answer that is neither `OUI`/`NON` nor 0/1.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenPolicy {
    /// Encode as absent (0.0) and log a warning.
    #[default]
    Warn,
    Reject,
}

/// One patient's covariates in canonical order.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedFeatures {
    values: Array1<f64>,
}

impl EncodedFeatures {
    pub fn from_values(values: Array1<f64>) -> Result<Self, EncodingError> {
        if values.len() != NUM_COVARIATES {
            return Err(EncodingError::ColumnCountMismatch {
                expected: NUM_COVARIATES,
                found: values.len(),
            });
        }
        Ok(Self { values })
    }

    pub fn values(&self) -> ArrayView1<'_, f64> {
        self.values.view()
    }

    /// The features as a `1 × 12` matrix, the shape the model adapter consumes.
    pub fn as_row(&self) -> Array2<f64> {
        self.values.view().insert_axis(Axis(0)).to_owned()
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        COVARIATES
            .iter()
            .position(|candidate| *candidate == name)
            .map(|idx| self.values[idx])
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FeatureEncoder {
    policy: TokenPolicy,
}

impl FeatureEncoder {
    pub fn new(policy: TokenPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> TokenPolicy {
        self.policy
    }

    pub fn encode(&self, inputs: &RawInputs) -> Result<EncodedFeatures, EncodingError> {
        for key in inputs.keys().filter(|key| !is_covariate(key)) {
            log::debug!("Ignoring non-covariate input '{key}'");
        }

        let mut values = Array1::<f64>::zeros(NUM_COVARIATES);
        values[0] = encode_age(lookup(inputs, AGE)?)?;
        for (idx, name) in findings().iter().enumerate() {
            values[idx + 1] = self.encode_finding(name, lookup(inputs, name)?)?;
        }
        EncodedFeatures::from_values(values)
    }

    /// Encodes the answers and attaches an observed outcome, producing the row that
    /// gets appended to the dataset. Findings are normalised to `OUI` / `NON`.
    pub fn to_record(
        &self,
        inputs: &RawInputs,
        follow_up: f64,
        event: bool,
    ) -> Result<ClinicalRecord, EncodingError> {
        let features = self.encode(inputs)?;
        let mut flags = [false; NUM_FINDINGS];
        for (flag, value) in flags.iter_mut().zip(features.values().iter().skip(1)) {
            *flag = *value > 0.5;
        }
        Ok(ClinicalRecord::new(features.values[0], flags, follow_up, event)?)
    }

    fn encode_finding(&self, name: &str, value: &RawValue) -> Result<f64, EncodingError> {
        let token = match value {
            RawValue::Flag(flag) => {
                if *flag {
                    Token::Affirmative
                } else {
                    Token::Negative
                }
            }
            RawValue::Number(number) => numeric_token(*number),
            RawValue::Text(text) => match classify_token(text) {
                Token::Unrecognized => text
                    .trim()
                    .parse::<f64>()
                    .map(numeric_token)
                    .unwrap_or(Token::Unrecognized),
                token => token,
            },
        };
        match token {
            Token::Affirmative => Ok(1.0),
            Token::Negative => Ok(0.0),
            Token::Unrecognized => {
                let shown = describe(value);
                match self.policy {
                    TokenPolicy::Warn => {
                        log::warn!(
                            "Covariate '{name}' has unrecognized value '{shown}'; encoding it as {}",
                            crate::dataset::NEGATIVE
                        );
                        Ok(0.0)
                    }
                    TokenPolicy::Reject => Err(EncodingError::UnrecognizedToken {
                        covariate: name.to_string(),
                        value: shown,
                    }),
                }
            }
        }
    }
}

fn lookup<'a>(inputs: &'a RawInputs, name: &str) -> Result<&'a RawValue, EncodingError> {
    inputs
        .get(name)
        .ok_or_else(|| EncodingError::MissingCovariate(name.to_string()))
}

fn numeric_token(number: f64) -> Token {
    if number == 1.0 {
        Token::Affirmative
    } else if number == 0.0 {
        Token::Negative
    } else {
        Token::Unrecognized
    }
}

fn describe(value: &RawValue) -> String {
    match value {
        RawValue::Flag(flag) => flag.to_string(),
        RawValue::Number(number) => number.to_string(),
        RawValue::Text(text) => text.clone(),
    }
}

fn encode_age(value: &RawValue) -> Result<f64, EncodingError> {
    let age = match value {
        RawValue::Number(number) => Some(*number),
        RawValue::Text(text) => text.trim().parse::<f64>().ok(),
        RawValue::Flag(_) => None,
    };
    age.filter(|age| age.is_finite())
        .ok_or_else(|| EncodingError::InvalidAge(describe(value)))
}

/// Encodes with the default (warning) token policy.
pub fn encode(inputs: &RawInputs) -> Result<EncodedFeatures, EncodingError> {
    FeatureEncoder::default().encode(inputs)
}

/// Stored records are already canonical, so this never fails.
pub fn encode_record(record: &ClinicalRecord) -> EncodedFeatures {
    let mut values = Array1::<f64>::zeros(NUM_COVARIATES);
    values[0] = record.age();
    for (idx, flag) in record.findings().iter().enumerate() {
        values[idx + 1] = if *flag { 1.0 } else { 0.0 };
    }
    EncodedFeatures { values }
}

/// One row per record, canonical column order.
pub fn encode_cohort(records: &[ClinicalRecord]) -> Array2<f64> {
    let mut matrix = Array2::<f64>::zeros((records.len(), NUM_COVARIATES));
    for (mut row, record) in matrix.rows_mut().into_iter().zip(records) {
        row.assign(&encode_record(record).values);
    }
    matrix
}

/// The inverse of [`encode_record`]: canonical answers for a stored record.
pub fn record_inputs(record: &ClinicalRecord) -> RawInputs {
    let mut inputs = RawInputs::new();
    inputs.insert(AGE.to_string(), RawValue::Number(record.age()));
    for (name, flag) in findings().iter().zip(record.findings()) {
        inputs.insert(
            name.to_string(),
            RawValue::from(crate::dataset::token_for(*flag)),
        );
    }
    inputs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{load_dataset, save_dataset};
    use tempfile::tempdir;

    fn negative_profile(age: f64) -> RawInputs {
        let mut inputs = RawInputs::new();
        inputs.insert(AGE.to_string(), RawValue::Number(age));
        for name in findings() {
            inputs.insert(name.to_string(), RawValue::from("NON"));
        }
        inputs
    }

    #[test]
    fn encodes_in_canonical_order() {
        let mut inputs = negative_profile(63.0);
        inputs.insert("Metastases".to_string(), RawValue::from(" oui "));
        inputs.insert("Tabac".to_string(), RawValue::Flag(true));
        inputs.insert("Cardiopathie".to_string(), RawValue::Number(1.0));

        let features = encode(&inputs).expect("encode");
        let row = features.as_row();
        assert_eq!(row.shape(), &[1, NUM_COVARIATES]);
        assert_eq!(row[[0, 0]], 63.0);
        assert_eq!(features.get("Metastases"), Some(1.0));
        assert_eq!(features.get("Tabac"), Some(1.0));
        assert_eq!(features.get("Cardiopathie"), Some(1.0));
        assert_eq!(features.get("Adenopathie"), Some(0.0));
        assert_eq!(features.values().sum(), 63.0 + 3.0);
    }

    #[test]
    fn missing_covariate_is_an_error() {
        let mut inputs = negative_profile(50.0);
        inputs.remove("Stenosant");
        assert_eq!(
            encode(&inputs),
            Err(EncodingError::MissingCovariate("Stenosant".to_string()))
        );
    }

    #[test]
    fn extra_keys_are_ignored() {
        let mut inputs = negative_profile(50.0);
        inputs.insert("Nom".to_string(), RawValue::from("Dupont"));
        assert_eq!(encode(&inputs), encode(&negative_profile(50.0)));
    }

    #[test]
    fn age_accepts_numeric_text_and_rejects_garbage() {
        let mut inputs = negative_profile(0.0);
        inputs.insert(AGE.to_string(), RawValue::from(" 71.5"));
        assert_eq!(encode(&inputs).expect("encode").get(AGE), Some(71.5));

        inputs.insert(AGE.to_string(), RawValue::from("soixante"));
        assert!(matches!(encode(&inputs), Err(EncodingError::InvalidAge(_))));

        inputs.insert(AGE.to_string(), RawValue::Number(f64::NAN));
        assert!(matches!(encode(&inputs), Err(EncodingError::InvalidAge(_))));
    }

    #[test]
    fn unrecognized_token_follows_policy() {
        let mut inputs = negative_profile(50.0);
        inputs.insert("Mucineux".to_string(), RawValue::from("peut-etre"));

        let permissive = FeatureEncoder::new(TokenPolicy::Warn)
            .encode(&inputs)
            .expect("warn policy encodes");
        assert_eq!(permissive.get("Mucineux"), Some(0.0));

        let strict = FeatureEncoder::new(TokenPolicy::Reject).encode(&inputs);
        assert_eq!(
            strict,
            Err(EncodingError::UnrecognizedToken {
                covariate: "Mucineux".to_string(),
                value: "peut-etre".to_string(),
            })
        );
    }

    #[test]
    fn numeric_text_tokens_are_recognized() {
        let mut inputs = negative_profile(50.0);
        inputs.insert("Infiltrant".to_string(), RawValue::from("1"));
        let features = FeatureEncoder::new(TokenPolicy::Reject)
            .encode(&inputs)
            .expect("0/1 text is recognized");
        assert_eq!(features.get("Infiltrant"), Some(1.0));
    }

    #[test]
    fn feature_count_is_enforced() {
        let result = EncodedFeatures::from_values(Array1::zeros(11));
        assert_eq!(
            result,
            Err(EncodingError::ColumnCountMismatch {
                expected: NUM_COVARIATES,
                found: 11
            })
        );
    }

    #[test]
    fn encoding_survives_persist_and_reload() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("patients.csv");
        let mut inputs = negative_profile(58.0);
        inputs.insert("Adenopathie".to_string(), RawValue::from("Oui"));
        inputs.insert("Denitrution".to_string(), RawValue::Flag(true));

        let encoder = FeatureEncoder::default();
        let before = encoder.encode(&inputs).expect("encode");
        let record = encoder.to_record(&inputs, 14.0, true).expect("record");
        save_dataset(&path, std::slice::from_ref(&record)).expect("save");
        let reloaded = load_dataset(&path).expect("load");

        assert_eq!(encode_record(&reloaded[0]), before);
        assert_eq!(encoder.encode(&record_inputs(&reloaded[0])), Ok(before));
        assert_eq!(encode_cohort(&reloaded).row(0), encode_record(&record).values());
    }
}
