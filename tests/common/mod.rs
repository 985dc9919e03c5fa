use ndarray::Array1;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use shahidi::dataset::{AGE, COVARIATES, NUM_COVARIATES, NUM_FINDINGS, findings};
use shahidi::model::ModelParameters;
use shahidi::model::cox::CoxModel;
use shahidi::{ClinicalRecord, ModelHandle, RawInputs, RawValue};

/// Answers for every covariate: the listed findings are `OUI`, the rest `NON`.
pub fn answers(age: f64, positives: &[&str]) -> RawInputs {
    let mut inputs: RawInputs = findings()
        .iter()
        .map(|name| (name.to_string(), RawValue::from(positives.contains(name))))
        .collect();
    inputs.insert(AGE.to_string(), RawValue::from(age));
    inputs
}

pub fn record(age: f64, positives: &[&str], follow_up: f64, event: bool) -> ClinicalRecord {
    let mut flags = [false; NUM_FINDINGS];
    for (flag, name) in flags.iter_mut().zip(findings()) {
        *flag = positives.contains(name);
    }
    ClinicalRecord::new(age, flags, follow_up, event).expect("valid record")
}

/// Cox model with log-risk `age_coef * (age - 50) + metastases_coef * Metastases`.
pub fn cox_handle(age_coef: f64, metastases_coef: f64) -> ModelHandle {
    let mut coefficients = Array1::zeros(NUM_COVARIATES);
    let mut means = Array1::zeros(NUM_COVARIATES);
    coefficients[0] = age_coef;
    means[0] = 50.0;
    let metastases = COVARIATES
        .iter()
        .position(|name| *name == "Metastases")
        .expect("Metastases is a covariate");
    coefficients[metastases] = metastases_coef;
    ModelHandle::new(ModelParameters::CoxPh(CoxModel {
        coefficients,
        means,
        ridge: 0.1,
    }))
}

/// Deterministic cohort where metastases and age shorten survival.
pub fn synthetic_cohort(n: usize, seed: u64) -> Vec<ClinicalRecord> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n)
        .map(|_| {
            let age = rng.gen_range(35.0..85.0_f64).round();
            let metastases = rng.gen_bool(0.4);
            let smoker = rng.gen_bool(0.3);
            let hazard = 0.02 * (1.0 + (age - 60.0) / 40.0).max(0.2)
                * if metastases { 3.0 } else { 1.0 };
            let uniform: f64 = rng.gen_range(0.001..1.0);
            let death = -uniform.ln() / hazard;
            let censor = rng.gen_range(6.0..90.0);
            let positives: Vec<&str> = [("Metastases", metastases), ("Tabac", smoker)]
                .iter()
                .filter(|(_, on)| *on)
                .map(|(name, _)| *name)
                .collect();
            let follow_up = (death.min(censor) * 10.0).round() / 10.0;
            record(age, &positives, follow_up.max(0.1), death <= censor)
        })
        .collect()
}
