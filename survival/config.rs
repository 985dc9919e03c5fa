//! Runtime configuration read from a TOML file. Every section and field is
//! optional and falls back to its default.

use crate::calibrator::CalibrationSettings;
use crate::encoder::TokenPolicy;
use crate::model::ModelSettings;
use crate::retrain::RetrainSettings;
use crate::store::{StorePaths, StoreSettings};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Could not read config file '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Could not parse config file '{path}': {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error(transparent)]
    Serialize(#[from] toml::ser::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncodingConfig {
    pub token_policy: TokenPolicy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub lock_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShahidiConfig {
    pub paths: StorePaths,
    pub encoding: EncodingConfig,
    pub calibration: CalibrationSettings,
    pub model: ModelSettings,
    pub retrain: RetrainSettings,
    pub store: StoreConfig,
}

impl ShahidiConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        log::debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Reads `path` when given, otherwise uses the defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = |value: f64| value.is_finite() && value > 0.0;
        if self.calibration.groups == 0 {
            return Err(ConfigError::Invalid(
                "calibration.groups must be at least 1".to_string(),
            ));
        }
        match self.calibration.horizon_months {
            Some(horizon) if !positive(horizon) => {
                return Err(ConfigError::Invalid(format!(
                    "calibration.horizon_months must be positive, got {horizon}"
                )));
            }
            _ => {}
        }
        if self.retrain.schedule.batch_size == 0 {
            return Err(ConfigError::Invalid(
                "retrain.batch_size must be at least 1".to_string(),
            ));
        }
        if !positive(self.model.learning_rate) {
            return Err(ConfigError::Invalid(format!(
                "model.learning_rate must be positive, got {}",
                self.model.learning_rate
            )));
        }
        if !positive(self.model.shrinkage) {
            return Err(ConfigError::Invalid(format!(
                "model.shrinkage must be positive, got {}",
                self.model.shrinkage
            )));
        }
        if self.model.l2 < 0.0 || self.model.ridge < 0.0 {
            return Err(ConfigError::Invalid(
                "model.l2 and model.ridge must not be negative".to_string(),
            ));
        }
        Ok(())
    }

    pub fn store_settings(&self) -> StoreSettings {
        StoreSettings {
            token_policy: self.encoding.token_policy,
            lock_timeout: Duration::from_millis(self.store.lock_timeout_ms),
            calibration: self.calibration.clone(),
            retrain: self.retrain.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibrator::CalibrationStrategy;
    use crate::model::ModelFamily;
    use tempfile::tempdir;

    #[test]
    fn partial_file_fills_in_defaults() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("shahidi.toml");
        fs::write(
            &path,
            r#"
[paths]
dataset = "cohort.csv"

[calibration]
strategy = "risk_groups"
groups = 4

[model]
family = "coxph"

[retrain]
epochs = 25
"#,
        )
        .expect("write");

        let config = ShahidiConfig::load(&path).expect("load");
        assert_eq!(config.paths.dataset, PathBuf::from("cohort.csv"));
        assert_eq!(config.paths.model, StorePaths::default().model);
        assert_eq!(config.calibration.strategy, CalibrationStrategy::RiskGroups);
        assert_eq!(config.calibration.groups, 4);
        assert_eq!(config.model.family, ModelFamily::CoxPh);
        assert_eq!(config.retrain.schedule.epochs, 25);
        assert_eq!(config.retrain.schedule.batch_size, 32);
        assert_eq!(config.retrain.min_rows, 10);
        assert_eq!(config.encoding.token_policy, TokenPolicy::Warn);
    }

    #[test]
    fn round_trips_through_toml() {
        let mut config = ShahidiConfig::default();
        config.calibration.horizon_months = Some(36.0);
        config.encoding.token_policy = TokenPolicy::Reject;
        config.store.lock_timeout_ms = 250;
        let text = config.to_toml_string().expect("serialize");
        let parsed: ShahidiConfig = toml::from_str(&text).expect("parse");
        assert_eq!(parsed, config);
    }

    #[test]
    fn rejects_zero_groups() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("bad.toml");
        fs::write(&path, "[calibration]\ngroups = 0\n").expect("write");
        assert!(matches!(
            ShahidiConfig::load(&path),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn store_settings_carry_the_lock_timeout() {
        let mut config = ShahidiConfig::default();
        config.store.lock_timeout_ms = 1_500;
        let settings = config.store_settings();
        assert_eq!(settings.lock_timeout, Duration::from_millis(1_500));
        assert_eq!(settings.retrain, config.retrain);
    }
}
