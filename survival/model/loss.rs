//! Cox partial likelihood with Breslow handling of tied event times.
//!
//! All three model families train against the same objective: the mean negative
//! log partial likelihood per observed event. The terms are computed in one sort
//! and two sweeps, with risks shifted by their maximum before exponentiation.

use ndarray::{Array1, ArrayView1};
use serde::{Deserialize, Serialize};

/// Registered name of the partial-likelihood loss, as recorded in model artifacts.
pub const COX_LOSS: &str = "cox_loss";

/// Training losses that can be re-bound by name when an artifact is loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrainingLoss {
    Cox,
}

impl TrainingLoss {
    pub fn name(self) -> &'static str {
        match self {
            TrainingLoss::Cox => COX_LOSS,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            COX_LOSS => Some(TrainingLoss::Cox),
            _ => None,
        }
    }

    pub fn registered() -> &'static [&'static str] {
        &[COX_LOSS]
    }

    pub fn value(
        self,
        risk: ArrayView1<'_, f64>,
        time: ArrayView1<'_, f64>,
        event: ArrayView1<'_, bool>,
    ) -> f64 {
        match self {
            TrainingLoss::Cox => {
                let terms = CoxTerms::compute(risk, time, event);
                if terms.n_events == 0 {
                    0.0
                } else {
                    -terms.log_likelihood / terms.n_events as f64
                }
            }
        }
    }

    /// Derivative of [`TrainingLoss::value`] with respect to each risk.
    pub fn gradient(
        self,
        risk: ArrayView1<'_, f64>,
        time: ArrayView1<'_, f64>,
        event: ArrayView1<'_, bool>,
    ) -> Array1<f64> {
        match self {
            TrainingLoss::Cox => {
                let terms = CoxTerms::compute(risk, time, event);
                if terms.n_events == 0 {
                    return Array1::zeros(risk.len());
                }
                terms.residuals.mapv(|r| -r / terms.n_events as f64)
            }
        }
    }

    /// Martingale residuals `event_i - H0(t_i) exp(risk_i)`: the ascent direction of
    /// the partial log likelihood in risk space.
    pub fn residuals(
        self,
        risk: ArrayView1<'_, f64>,
        time: ArrayView1<'_, f64>,
        event: ArrayView1<'_, bool>,
    ) -> Array1<f64> {
        match self {
            TrainingLoss::Cox => CoxTerms::compute(risk, time, event).residuals,
        }
    }
}

struct CoxTerms {
    log_likelihood: f64,
    residuals: Array1<f64>,
    n_events: usize,
}

impl CoxTerms {
    fn compute(
        risk: ArrayView1<'_, f64>,
        time: ArrayView1<'_, f64>,
        event: ArrayView1<'_, bool>,
    ) -> Self {
        let n = risk.len();
        let n_events = event.iter().filter(|&&e| e).count();
        let mut residuals = Array1::<f64>::zeros(n);
        if n == 0 {
            return Self {
                log_likelihood: 0.0,
                residuals,
                n_events,
            };
        }

        let shift = risk.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let weight: Vec<f64> = risk.iter().map(|r| (r - shift).exp()).collect();

        let mut order: Vec<usize> = (0..n).collect();
        order.sort_by(|&a, &b| time[a].total_cmp(&time[b]));

        // Contiguous runs of equal follow-up time.
        let mut groups: Vec<(usize, usize)> = Vec::new();
        let mut start = 0;
        for pos in 1..=n {
            if pos == n || time[order[pos]] != time[order[start]] {
                groups.push((start, pos));
                start = pos;
            }
        }

        // Risk set at t holds everyone still followed at t.
        let mut risk_set = vec![0.0; groups.len()];
        let mut running = 0.0;
        for (g, &(lo, hi)) in groups.iter().enumerate().rev() {
            running += order[lo..hi].iter().map(|&i| weight[i]).sum::<f64>();
            risk_set[g] = running;
        }

        let mut log_likelihood = 0.0;
        let mut cumulative_hazard = 0.0;
        for (g, &(lo, hi)) in groups.iter().enumerate() {
            let members = &order[lo..hi];
            let deaths = members.iter().filter(|&&i| event[i]).count();
            if deaths > 0 {
                cumulative_hazard += deaths as f64 / risk_set[g];
                let log_denominator = risk_set[g].ln();
                for &i in members.iter().filter(|&&i| event[i]) {
                    log_likelihood += (risk[i] - shift) - log_denominator;
                }
            }
            for &i in members {
                let observed = if event[i] { 1.0 } else { 0.0 };
                residuals[i] = observed - cumulative_hazard * weight[i];
            }
        }

        Self {
            log_likelihood,
            residuals,
            n_events,
        }
    }
}
