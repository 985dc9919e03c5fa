use super::{RawPrediction, SurvivalModel, TrainingError, TrainingPass};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

const MAX_STEP_HALVINGS: usize = 20;
const FALLBACK_STEP: f64 = 0.01;
/// Largest log-hazard magnitude whose exponential and its logarithm stay finite.
const MAX_LOG_HAZARD: f64 = 700.0;

/// Ridge-penalised Cox proportional-hazards regression on centred covariates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoxModel {
    pub coefficients: Array1<f64>,
    /// Column means of the training cohort; covariates are centred on these.
    pub means: Array1<f64>,
    pub ridge: f64,
}

impl CoxModel {
    /// Zero coefficients centred on the cohort's column means.
    pub fn new(features: ArrayView2<'_, f64>, ridge: f64) -> Self {
        let means = features
            .mean_axis(Axis(0))
            .unwrap_or_else(|| Array1::zeros(features.ncols()));
        Self {
            coefficients: Array1::zeros(features.ncols()),
            means,
            ridge,
        }
    }

    pub fn linear_predictor(&self, features: ArrayView2<'_, f64>) -> Array1<f64> {
        (&features - &self.means).dot(&self.coefficients)
    }

    /// `exp` of the linear predictor, clamped to `±MAX_LOG_HAZARD` first so extreme
    /// patients saturate instead of overflowing to infinity or zero.
    pub fn partial_hazard(&self, features: ArrayView2<'_, f64>) -> Array1<f64> {
        self.linear_predictor(features)
            .mapv(|eta| eta.clamp(-MAX_LOG_HAZARD, MAX_LOG_HAZARD).exp())
    }

    fn penalised_objective(&self, beta: &Array1<f64>, pass: &TrainingPass<'_>) -> f64 {
        let eta = (&pass.cohort.features() - &self.means).dot(beta);
        let events = pass.cohort.n_events().max(1) as f64;
        let nll = pass
            .loss
            .value(eta.view(), pass.cohort.time(), pass.cohort.event())
            * events;
        nll + 0.5 * self.ridge * beta.dot(beta)
    }
}

/// Log partial likelihood gradient and observed information (Breslow ties) at `beta`.
fn likelihood_derivatives(
    centred: ArrayView2<'_, f64>,
    beta: &Array1<f64>,
    time: ArrayView1<'_, f64>,
    event: ArrayView1<'_, bool>,
) -> (Array1<f64>, Array2<f64>) {
    let (n, p) = centred.dim();
    let eta = centred.dot(beta);
    let shift = eta.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let weight = eta.mapv(|e| (e - shift).exp());

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| time[b].total_cmp(&time[a]));

    let mut gradient = Array1::<f64>::zeros(p);
    let mut information = Array2::<f64>::zeros((p, p));
    let mut s0 = 0.0;
    let mut s1 = Array1::<f64>::zeros(p);
    let mut s2 = Array2::<f64>::zeros((p, p));

    let mut start = 0;
    while start < n {
        let mut end = start;
        while end < n && time[order[end]] == time[order[start]] {
            let i = order[end];
            let x = centred.row(i);
            s0 += weight[i];
            s1.scaled_add(weight[i], &x);
            for j in 0..p {
                for k in 0..p {
                    s2[[j, k]] += weight[i] * x[j] * x[k];
                }
            }
            end += 1;
        }

        let deaths: Vec<usize> = order[start..end]
            .iter()
            .copied()
            .filter(|&i| event[i])
            .collect();
        if !deaths.is_empty() && s0 > 0.0 {
            let d = deaths.len() as f64;
            let mean = &s1 / s0;
            for &i in &deaths {
                gradient += &centred.row(i);
            }
            gradient.scaled_add(-d, &mean);
            for j in 0..p {
                for k in 0..p {
                    information[[j, k]] += d * (s2[[j, k]] / s0 - mean[j] * mean[k]);
                }
            }
        }
        start = end;
    }

    (gradient, information)
}

/// Solves `a x = b` by Gaussian elimination with partial pivoting.
fn solve_linear_system(a: &Array2<f64>, b: &Array1<f64>) -> Option<Array1<f64>> {
    let n = a.nrows();
    if n != a.ncols() || n != b.len() {
        return None;
    }
    let mut a = a.clone();
    let mut b = b.clone();

    for col in 0..n {
        let pivot = (col..n).max_by(|&r1, &r2| a[[r1, col]].abs().total_cmp(&a[[r2, col]].abs()))?;
        if a[[pivot, col]].abs() < 1e-12 {
            return None;
        }
        if pivot != col {
            for j in 0..n {
                a.swap([col, j], [pivot, j]);
            }
            b.swap(col, pivot);
        }
        for row in col + 1..n {
            let factor = a[[row, col]] / a[[col, col]];
            for j in col..n {
                a[[row, j]] -= factor * a[[col, j]];
            }
            b[row] -= factor * b[col];
        }
    }

    let mut x = Array1::<f64>::zeros(n);
    for i in (0..n).rev() {
        let tail: f64 = (i + 1..n).map(|j| a[[i, j]] * x[j]).sum();
        x[i] = (b[i] - tail) / a[[i, i]];
    }
    Some(x)
}

impl SurvivalModel for CoxModel {
    fn n_features(&self) -> usize {
        self.coefficients.len()
    }

    fn is_fitted(&self) -> bool {
        !self.coefficients.is_empty() && self.means.len() == self.coefficients.len()
    }

    fn parameters_finite(&self) -> bool {
        self.ridge.is_finite()
            && self.coefficients.iter().all(|c| c.is_finite())
            && self.means.iter().all(|m| m.is_finite())
    }

    fn raw_predict(&self, features: ArrayView2<'_, f64>) -> RawPrediction {
        RawPrediction::PartialHazard(self.partial_hazard(features))
    }

    /// One damped Newton–Raphson step on the penalised partial likelihood.
    fn train_pass(&mut self, pass: &mut TrainingPass<'_>) -> Result<(), TrainingError> {
        let centred = &pass.cohort.features() - &self.means;
        let (gradient, information) = likelihood_derivatives(
            centred.view(),
            &self.coefficients,
            pass.cohort.time(),
            pass.cohort.event(),
        );
        let penalised_gradient = &gradient - &(self.ridge * &self.coefficients);
        let mut penalised_information = information;
        for j in 0..self.coefficients.len() {
            penalised_information[[j, j]] += self.ridge;
        }

        let step = solve_linear_system(&penalised_information, &penalised_gradient)
            .unwrap_or_else(|| {
                log::debug!("Cox information matrix is singular; taking a gradient step");
                &penalised_gradient * FALLBACK_STEP
            });

        let current = self.penalised_objective(&self.coefficients, pass);
        let mut scale = 1.0;
        for _ in 0..MAX_STEP_HALVINGS {
            let candidate = &self.coefficients + &(&step * scale);
            let objective = self.penalised_objective(&candidate, pass);
            if objective.is_finite() && objective <= current {
                self.coefficients = candidate;
                return Ok(());
            }
            scale *= 0.5;
        }
        log::debug!("Cox step did not improve the objective; keeping coefficients");
        Ok(())
    }
}
