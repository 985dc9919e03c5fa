use crate::calibrator::{Calibration, SurvivalCurve, relative_hazard};
use crate::encoder::EncodedFeatures;
use crate::model::{ModelHandle, PredictionError};
use serde::Serialize;
use std::fmt;

/// Median survival, in months, of a patient at zero log-risk when no informative
/// calibration is available.
pub const DEFAULT_MEDIAN_MONTHS: f64 = 60.0;

/// Shortest survival time ever reported.
pub const MINIMUM_MONTHS: f64 = 1.0;

/// Values that can be turned into a displayable survival estimate.
pub trait AsEstimate {
    /// A number when one can be read, `None` otherwise.
    fn as_estimate(&self) -> Option<f64>;
}

impl AsEstimate for f64 {
    fn as_estimate(&self) -> Option<f64> {
        Some(*self)
    }
}

impl AsEstimate for f32 {
    fn as_estimate(&self) -> Option<f64> {
        Some(f64::from(*self))
    }
}

impl AsEstimate for str {
    fn as_estimate(&self) -> Option<f64> {
        self.trim().parse().ok()
    }
}

impl AsEstimate for String {
    fn as_estimate(&self) -> Option<f64> {
        self.as_str().as_estimate()
    }
}

impl<T: AsEstimate + ?Sized> AsEstimate for &T {
    fn as_estimate(&self) -> Option<f64> {
        (**self).as_estimate()
    }
}

impl<T: AsEstimate> AsEstimate for Option<T> {
    fn as_estimate(&self) -> Option<f64> {
        self.as_ref().and_then(AsEstimate::as_estimate)
    }
}

impl<T: AsEstimate, E> AsEstimate for Result<T, E> {
    fn as_estimate(&self) -> Option<f64> {
        self.as_ref().ok().and_then(AsEstimate::as_estimate)
    }
}

/// Floors an estimate at one month. Anything unreadable or non-finite counts as 0.
pub fn clean<T: AsEstimate>(value: T) -> f64 {
    let months = value
        .as_estimate()
        .filter(|months| months.is_finite())
        .unwrap_or(0.0);
    months.max(MINIMUM_MONTHS)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RiskGroupLabel {
    /// Zero-based, lowest risk first.
    pub index: usize,
    pub count: usize,
}

impl fmt::Display for RiskGroupLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match (self.count, self.index) {
            (3, 0) => "low",
            (3, 1) => "intermediate",
            (3, 2) => "high",
            (2, 0) => "low",
            (2, 1) => "high",
            _ => return write!(f, "risk group {} of {}", self.index + 1, self.count),
        };
        write!(f, "{name} risk")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EstimateMethod {
    RiskGroupMedian,
    BaselineSurvival,
    DefaultMedian,
}

/// Survival estimate for one risk score before the one-month floor.
#[derive(Debug, Clone, PartialEq)]
pub struct Estimate {
    pub months: f64,
    pub method: EstimateMethod,
    pub risk_group: Option<RiskGroupLabel>,
    pub curve: Option<SurvivalCurve>,
}

fn default_median(log_ratio: f64) -> f64 {
    DEFAULT_MEDIAN_MONTHS / relative_hazard(log_ratio)
}

pub fn estimate_from_risk(risk: f64, calibration: Option<&Calibration>) -> Estimate {
    match calibration {
        Some(Calibration::RiskGroups(table)) => {
            let index = table.group_of(risk);
            Estimate {
                months: table.medians[index],
                method: EstimateMethod::RiskGroupMedian,
                risk_group: Some(RiskGroupLabel {
                    index,
                    count: table.n_groups(),
                }),
                curve: None,
            }
        }
        Some(Calibration::Baseline(baseline)) => {
            let curve = baseline.individual(risk);
            Estimate {
                months: curve.median().unwrap_or_else(|| curve.horizon()),
                method: EstimateMethod::BaselineSurvival,
                risk_group: None,
                curve: Some(curve),
            }
        }
        Some(Calibration::Uninformative { reference_risk }) => Estimate {
            months: default_median(risk - reference_risk),
            method: EstimateMethod::DefaultMedian,
            risk_group: None,
            curve: None,
        },
        None => Estimate {
            months: default_median(risk),
            method: EstimateMethod::DefaultMedian,
            risk_group: None,
            curve: None,
        },
    }
}

/// A patient's calibrated survival estimate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Prediction {
    pub risk: f64,
    /// Floored at one month.
    pub median_months: f64,
    pub method: EstimateMethod,
    pub risk_group: Option<RiskGroupLabel>,
    pub curve: Option<SurvivalCurve>,
}

pub fn predict_survival_time(
    handle: &ModelHandle,
    features: &EncodedFeatures,
    calibration: Option<&Calibration>,
) -> Result<Prediction, PredictionError> {
    let risk = handle.risk_one(features)?;
    let estimate = estimate_from_risk(risk, calibration);
    log::debug!(
        "Risk {risk:.4} -> {:.2} months ({:?})",
        estimate.months,
        estimate.method
    );
    Ok(Prediction {
        risk,
        median_months: clean(estimate.months),
        method: estimate.method,
        risk_group: estimate.risk_group,
        curve: estimate.curve,
    })
}

/// The unfloored survival time, for callers that apply [`clean`] themselves.
pub fn predict(
    handle: &ModelHandle,
    features: &EncodedFeatures,
    calibration: Option<&Calibration>,
) -> Result<f64, PredictionError> {
    let risk = handle.risk_one(features)?;
    Ok(estimate_from_risk(risk, calibration).months)
}

/// Individual survival curve under baseline calibration, cut at `horizon` when given.
/// Other calibrations carry no curve.
pub fn survival_curve(
    handle: &ModelHandle,
    features: &EncodedFeatures,
    calibration: Option<&Calibration>,
    horizon: Option<f64>,
) -> Result<Option<SurvivalCurve>, PredictionError> {
    let Some(Calibration::Baseline(baseline)) = calibration else {
        return Ok(None);
    };
    let curve = baseline.individual(handle.risk_one(features)?);
    Ok(Some(match horizon {
        Some(horizon) => curve.truncated(horizon),
        None => curve,
    }))
}
