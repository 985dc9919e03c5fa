//! Mapping from model risk scores to survival times.
//!
//! Two strategies are available. Risk-group calibration splits the cohort's risks
//! at empirical quantiles and records the median follow-up of each group. Baseline
//! calibration estimates the cohort survival curve with Kaplan–Meier and records the
//! cohort mean risk, so that an individual curve is `S0(t)^exp(risk - reference)`.

use crate::artifact::{LoadError, PersistenceError, load_toml, save_toml};
use crate::cohort::{DataInsufficientError, TrainingCohort, median_of_sorted};
use crate::model::{ModelHandle, PredictionError};
use ndarray::ArrayView1;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalibrationStrategy {
    /// Median follow-up per risk quantile group. Ignores censoring.
    RiskGroups,
    #[default]
    Baseline,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationSettings {
    pub strategy: CalibrationStrategy,
    /// Requested number of risk groups.
    pub groups: usize,
    /// Enforce non-increasing group medians with pool-adjacent-violators.
    pub monotone_medians: bool,
    /// Last time point of the baseline curve, in months. Defaults to the longest
    /// observed follow-up.
    pub horizon_months: Option<f64>,
}

impl Default for CalibrationSettings {
    fn default() -> Self {
        Self {
            strategy: CalibrationStrategy::Baseline,
            groups: 3,
            monotone_medians: true,
            horizon_months: None,
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum CalibrationError {
    #[error(transparent)]
    DataInsufficient(#[from] DataInsufficientError),
    #[error("Could not score the calibration cohort: {0}")]
    Prediction(#[from] PredictionError),
    #[error("At least one risk group is required, got {0}.")]
    InvalidGroupCount(usize),
    #[error("Calibration table is invalid: {0}")]
    Invalid(String),
}

/// Step-function survival curve on a time grid starting at `t = 0`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SurvivalCurve {
    pub times: Vec<f64>,
    pub survival: Vec<f64>,
}

impl SurvivalCurve {
    /// Survival at `t`, read from the last grid point at or before `t`.
    pub fn at(&self, t: f64) -> f64 {
        let idx = self.times.partition_point(|&grid| grid <= t);
        if idx == 0 {
            1.0
        } else {
            self.survival[idx - 1]
        }
    }

    /// Smallest grid time with survival at or below one half.
    pub fn median(&self) -> Option<f64> {
        self.times
            .iter()
            .zip(&self.survival)
            .find(|&(_, &s)| s <= 0.5)
            .map(|(&t, _)| t)
    }

    pub fn horizon(&self) -> f64 {
        self.times.last().copied().unwrap_or(0.0)
    }

    /// Raises every survival value to `exponent`.
    pub fn powered(&self, exponent: f64) -> Self {
        Self {
            times: self.times.clone(),
            survival: self
                .survival
                .iter()
                .map(|s| s.powf(exponent).clamp(0.0, 1.0))
                .collect(),
        }
    }

    /// Drops grid points after `horizon`, closing the curve at `horizon` itself.
    pub fn truncated(&self, horizon: f64) -> Self {
        let keep = self.times.partition_point(|&t| t <= horizon).max(1);
        let mut times = self.times[..keep].to_vec();
        let mut survival = self.survival[..keep].to_vec();
        if horizon > times[keep - 1] && horizon < self.horizon() {
            times.push(horizon);
            survival.push(survival[keep - 1]);
        }
        Self { times, survival }
    }

    fn validate(&self) -> Result<(), String> {
        if self.times.is_empty() || self.times.len() != self.survival.len() {
            return Err("curve needs matching, non-empty time and survival grids".to_string());
        }
        if self.times[0] != 0.0 || self.survival[0] != 1.0 {
            return Err("curve must start at (0, 1)".to_string());
        }
        if self.times.windows(2).any(|w| !(w[1] > w[0]) || !w[1].is_finite()) {
            return Err("curve times must be finite and strictly increasing".to_string());
        }
        if self.survival.iter().any(|s| !(0.0..=1.0).contains(s)) {
            return Err("survival probabilities must lie in [0, 1]".to_string());
        }
        if self.survival.windows(2).any(|w| w[1] > w[0]) {
            return Err("survival must be non-increasing".to_string());
        }
        Ok(())
    }
}

/// Kaplan–Meier estimate on the distinct event times up to `horizon`, prefixed with
/// `(0, 1)` and closed at the horizon (the longest follow-up when `None`).
///
/// The grid always starts at `(0, 1)`, so deaths at follow-up 0 are reported at the
/// first positive observed time.
pub fn kaplan_meier(
    time: ArrayView1<'_, f64>,
    event: ArrayView1<'_, bool>,
    horizon: Option<f64>,
) -> SurvivalCurve {
    let mut order: Vec<usize> = (0..time.len()).collect();
    order.sort_by(|&a, &b| time[a].total_cmp(&time[b]));
    let longest = order.last().map_or(0.0, |&i| time[i]);
    let horizon = horizon.unwrap_or(longest).max(0.0);

    let mut times = vec![0.0];
    let mut survival = vec![1.0];
    let mut current = 1.0;
    let mut at_risk = order.len();
    let mut drop_at_zero = false;
    let mut pos = 0;
    while pos < order.len() {
        let t = time[order[pos]];
        if t > horizon {
            break;
        }
        let mut end = pos;
        let mut deaths = 0usize;
        while end < order.len() && time[order[end]] == t {
            if event[order[end]] {
                deaths += 1;
            }
            end += 1;
        }
        if deaths > 0 {
            current *= 1.0 - deaths as f64 / at_risk as f64;
        }
        if t <= 0.0 {
            drop_at_zero |= deaths > 0;
        } else if deaths > 0 || drop_at_zero {
            times.push(t);
            survival.push(current);
            drop_at_zero = false;
        }
        at_risk -= end - pos;
        pos = end;
    }

    if horizon > times[times.len() - 1] {
        times.push(horizon);
        survival.push(current);
    }
    SurvivalCurve { times, survival }
}

/// Empirical risk groups: `thresholds[g - 1] < risk <= thresholds[g]` is group `g`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskGroupTable {
    pub thresholds: Vec<f64>,
    pub medians: Vec<f64>,
    pub group_sizes: Vec<usize>,
}

impl RiskGroupTable {
    /// Number of thresholds strictly below `risk`; ties go to the lower group.
    pub fn group_of(&self, risk: f64) -> usize {
        self.thresholds.iter().filter(|&&t| t < risk).count()
    }

    pub fn median_for(&self, risk: f64) -> f64 {
        self.medians[self.group_of(risk)]
    }

    pub fn n_groups(&self) -> usize {
        self.medians.len()
    }

    fn validate(&self) -> Result<(), String> {
        if self.medians.len() != self.thresholds.len() + 1 {
            return Err(format!(
                "{} thresholds need {} medians, found {}",
                self.thresholds.len(),
                self.thresholds.len() + 1,
                self.medians.len()
            ));
        }
        if self.group_sizes.len() != self.medians.len() {
            return Err("group sizes do not match the number of groups".to_string());
        }
        if self.thresholds.iter().any(|t| !t.is_finite())
            || self.thresholds.windows(2).any(|w| !(w[1] > w[0]))
        {
            return Err("thresholds must be finite and strictly increasing".to_string());
        }
        if self.medians.iter().any(|m| !m.is_finite() || *m < 0.0) {
            return Err("group medians must be finite and non-negative".to_string());
        }
        Ok(())
    }
}

/// Inverted-CDF quantile thresholds at `i / k`, deduplicated, without the maximum.
pub fn risk_thresholds(risks: &[f64], groups: usize) -> Vec<f64> {
    let mut sorted = risks.to_vec();
    sorted.sort_by(f64::total_cmp);
    let n = sorted.len();
    let Some(&max) = sorted.last() else {
        return Vec::new();
    };

    let mut thresholds: Vec<f64> = (1..groups)
        .map(|i| sorted[(i * n).div_ceil(groups).saturating_sub(1)])
        .collect();
    thresholds.dedup();
    thresholds.retain(|&t| t < max);
    thresholds
}

/// Size-weighted pool-adjacent-violators fit constrained to be non-increasing.
fn non_increasing_fit(values: &[f64], weights: &[usize]) -> Vec<f64> {
    // Each block: (weighted mean, total weight, members).
    let mut blocks: Vec<(f64, f64, usize)> = Vec::with_capacity(values.len());
    for (&value, &weight) in values.iter().zip(weights) {
        blocks.push((value, weight.max(1) as f64, 1));
        while blocks.len() > 1 {
            let last = blocks[blocks.len() - 1];
            let prev = blocks[blocks.len() - 2];
            if prev.0 >= last.0 {
                break;
            }
            let weight = prev.1 + last.1;
            let merged = ((prev.0 * prev.1 + last.0 * last.1) / weight, weight, prev.2 + last.2);
            blocks.truncate(blocks.len() - 2);
            blocks.push(merged);
        }
    }
    blocks
        .into_iter()
        .flat_map(|(mean, _, members)| std::iter::repeat_n(mean, members))
        .collect()
}

/// Groups the cohort by risk quantile and records each group's median follow-up.
pub fn risk_group_table(
    risks: &[f64],
    follow_up: &[f64],
    groups: usize,
    monotone_medians: bool,
) -> RiskGroupTable {
    let thresholds = risk_thresholds(risks, groups);
    let table_size = thresholds.len() + 1;
    let mut members: Vec<Vec<f64>> = vec![Vec::new(); table_size];
    for (&risk, &time) in risks.iter().zip(follow_up) {
        let group = thresholds.iter().filter(|&&t| t < risk).count();
        members[group].push(time);
    }

    let group_sizes: Vec<usize> = members.iter().map(Vec::len).collect();
    let mut medians: Vec<f64> = members
        .into_iter()
        .map(|mut times| {
            if times.is_empty() {
                return 0.0;
            }
            times.sort_by(f64::total_cmp);
            median_of_sorted(&times)
        })
        .collect();
    if monotone_medians {
        medians = non_increasing_fit(&medians, &group_sizes);
    }

    RiskGroupTable {
        thresholds,
        medians,
        group_sizes,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaselineCurve {
    /// Cohort mean risk; individual risks are centred on it.
    pub reference_risk: f64,
    pub curve: SurvivalCurve,
}

impl BaselineCurve {
    pub fn individual(&self, risk: f64) -> SurvivalCurve {
        self.curve.powered(relative_hazard(risk - self.reference_risk))
    }
}

/// `exp(x)` with the exponent clamped so the result stays finite and non-zero.
pub(crate) fn relative_hazard(log_ratio: f64) -> f64 {
    log_ratio.clamp(-700.0, 700.0).exp()
}

/// The persisted calibration table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum Calibration {
    RiskGroups(RiskGroupTable),
    Baseline(BaselineCurve),
    /// The cohort had no observed event; only the reference risk is known.
    Uninformative { reference_risk: f64 },
}

impl Calibration {
    pub fn validate(&self) -> Result<(), CalibrationError> {
        let result = match self {
            Calibration::RiskGroups(table) => table.validate(),
            Calibration::Baseline(baseline) => {
                if baseline.reference_risk.is_finite() {
                    baseline.curve.validate()
                } else {
                    Err("reference risk must be finite".to_string())
                }
            }
            Calibration::Uninformative { reference_risk } => {
                if reference_risk.is_finite() {
                    Ok(())
                } else {
                    Err("reference risk must be finite".to_string())
                }
            }
        };
        result.map_err(CalibrationError::Invalid)
    }

    pub fn save(&self, path: &Path) -> Result<(), PersistenceError> {
        self.validate()
            .map_err(|e| PersistenceError::Rejected(e.to_string()))?;
        save_toml(path, self)?;
        log::info!("Saved calibration to {}", path.display());
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, LoadError> {
        let calibration: Calibration = load_toml(path)?;
        calibration.validate().map_err(|e| LoadError::Invalid {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Ok(calibration)
    }

    pub fn strategy(&self) -> Option<CalibrationStrategy> {
        match self {
            Calibration::RiskGroups(_) => Some(CalibrationStrategy::RiskGroups),
            Calibration::Baseline(_) => Some(CalibrationStrategy::Baseline),
            Calibration::Uninformative { .. } => None,
        }
    }
}

/// Derives a calibration table for `handle` from the cohort's risks and outcomes.
pub fn calibrate(
    handle: &ModelHandle,
    cohort: &TrainingCohort,
    settings: &CalibrationSettings,
) -> Result<Calibration, CalibrationError> {
    cohort.require(1, "Calibration")?;
    let risks = handle.risk(cohort.features())?;
    let reference_risk = risks.mean().unwrap_or(0.0);

    let calibration = match settings.strategy {
        CalibrationStrategy::RiskGroups => {
            if settings.groups == 0 {
                return Err(CalibrationError::InvalidGroupCount(settings.groups));
            }
            let table = risk_group_table(
                &risks.to_vec(),
                &cohort.time().to_vec(),
                settings.groups,
                settings.monotone_medians,
            );
            log::info!(
                "Calibrated {} risk groups (requested {}) on {} patients",
                table.n_groups(),
                settings.groups,
                cohort.len()
            );
            Calibration::RiskGroups(table)
        }
        CalibrationStrategy::Baseline if cohort.n_events() == 0 => {
            log::warn!(
                "No observed event among {} patients; recording an uninformative calibration",
                cohort.len()
            );
            Calibration::Uninformative { reference_risk }
        }
        CalibrationStrategy::Baseline => {
            let curve = kaplan_meier(cohort.time(), cohort.event(), settings.horizon_months);
            log::info!(
                "Calibrated baseline survival on {} patients ({} events), horizon {:.1} months",
                cohort.len(),
                cohort.n_events(),
                curve.horizon()
            );
            Calibration::Baseline(BaselineCurve {
                reference_risk,
                curve,
            })
        }
    };
    Ok(calibration)
}
