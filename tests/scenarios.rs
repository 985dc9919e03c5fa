mod common;

use approx::assert_relative_eq;
use common::{answers, cox_handle, record, synthetic_cohort};
use shahidi::calibrator::{CalibrationError, calibrate};
use shahidi::encoder::EncodingError;
use shahidi::model::{ModelSettings, TrainingSchedule, fit_model};
use shahidi::predictor::{DEFAULT_MEDIAN_MONTHS, EstimateMethod};
use shahidi::store::{StoreError, StoreSettings};
use shahidi::{
    Calibration, CalibrationSettings, CalibrationStrategy, DataInsufficientError, ModelFamily,
    PatientStore, StorePaths, TrainingCohort, clean, encode, predict_survival_time,
};
use tempfile::tempdir;

#[test]
fn cohort_without_deaths_predicts_the_default_median() {
    let records: Vec<_> = (0..10).map(|_| record(50.0, &[], 24.0, false)).collect();
    let cohort = TrainingCohort::from_records(&records);
    let handle = cox_handle(0.03, 0.8);

    let calibration = calibrate(&handle, &cohort, &CalibrationSettings::default())
        .expect("calibration must not fail without events");
    assert!(matches!(calibration, Calibration::Uninformative { .. }));

    let features = encode(&answers(50.0, &[])).expect("encode");
    let prediction =
        predict_survival_time(&handle, &features, Some(&calibration)).expect("predict");
    assert_eq!(prediction.method, EstimateMethod::DefaultMedian);
    assert_relative_eq!(prediction.median_months, DEFAULT_MEDIAN_MONTHS, epsilon = 1e-9);
}

#[test]
fn two_distinct_risks_collapse_to_two_groups() {
    let records: Vec<_> = (0..12)
        .map(|i| {
            if i % 2 == 0 {
                record(50.0, &["Metastases"], 6.0 + i as f64, true)
            } else {
                record(50.0, &[], 30.0 + i as f64, i % 3 == 0)
            }
        })
        .collect();
    let cohort = TrainingCohort::from_records(&records);
    let settings = CalibrationSettings {
        strategy: CalibrationStrategy::RiskGroups,
        groups: 3,
        ..CalibrationSettings::default()
    };

    let calibration = calibrate(&cox_handle(0.0, 1.0), &cohort, &settings).expect("calibrate");
    let Calibration::RiskGroups(table) = calibration else {
        panic!("expected a risk-group table");
    };
    assert!(table.n_groups() <= 2);
    assert_eq!(table.group_sizes.iter().sum::<usize>(), 12);
    assert!(table.medians.windows(2).all(|pair| pair[0] >= pair[1]));
}

#[test]
fn missing_covariate_is_an_encoding_error() {
    let mut inputs = answers(64.0, &["Tabac"]);
    inputs.remove("Adenopathie");
    assert_eq!(
        encode(&inputs),
        Err(EncodingError::MissingCovariate("Adenopathie".to_string()))
    );
}

#[test]
fn unreadable_estimate_cleans_to_one_month() {
    assert_eq!(clean("not-a-number"), 1.0);
    assert_eq!(clean(f64::NAN), 1.0);
    assert_eq!(clean(-3.0), 1.0);
    assert_eq!(clean("17.5"), 17.5);
}

#[test]
fn empty_dataset_fails_calibration_but_still_predicts() {
    let dir = tempdir().expect("tempdir");
    let paths = StorePaths::in_dir(dir.path());
    let handle = cox_handle(0.05, 1.2);
    handle.save(&paths.model).expect("save model");
    let mut store = PatientStore::new(paths, StoreSettings::default());

    match store.recalibrate() {
        Err(StoreError::Calibration(CalibrationError::DataInsufficient(err))) => {
            assert_eq!(err, DataInsufficientError::new(1, 0, "Calibration"));
        }
        other => panic!("expected DataInsufficient, got {other:?}"),
    }

    let inputs = answers(70.0, &["Metastases"]);
    let prediction = store.predict(&inputs).expect("fallback prediction");
    let risk = 0.05 * 20.0 + 1.2;
    assert_relative_eq!(prediction.risk, risk, epsilon = 1e-12);
    assert_relative_eq!(
        prediction.median_months,
        clean(DEFAULT_MEDIAN_MONTHS * (-risk).exp()),
        epsilon = 1e-9
    );
    assert_eq!(prediction.method, EstimateMethod::DefaultMedian);
}

#[test]
fn estimates_never_drop_below_one_month() {
    let handle = cox_handle(0.5, 40.0);
    let features = encode(&answers(99.0, &["Metastases"])).expect("encode");
    let prediction = predict_survival_time(&handle, &features, None).expect("predict");
    assert_eq!(prediction.median_months, 1.0);
}

fn fitted(family: ModelFamily) -> (shahidi::ModelHandle, TrainingCohort) {
    let cohort = TrainingCohort::from_records(&synthetic_cohort(120, 7));
    let settings = ModelSettings {
        family,
        hidden_layers: vec![8],
        ..ModelSettings::default()
    };
    let schedule = TrainingSchedule {
        epochs: 15,
        ..TrainingSchedule::default()
    };
    let handle = fit_model(&settings, &cohort, &schedule, &mut |_| {}).expect("fit");
    (handle, cohort)
}

#[test]
fn higher_risk_never_means_longer_survival() {
    for family in [ModelFamily::CoxPh, ModelFamily::DeepSurv, ModelFamily::GradientBoosted] {
        let (handle, cohort) = fitted(family);
        for strategy in [CalibrationStrategy::Baseline, CalibrationStrategy::RiskGroups] {
            let settings = CalibrationSettings {
                strategy,
                ..CalibrationSettings::default()
            };
            let calibration = calibrate(&handle, &cohort, &settings).expect("calibrate");

            let mut estimates: Vec<(f64, f64)> = [30.0, 45.0, 60.0, 75.0, 90.0]
                .iter()
                .flat_map(|&age| {
                    [answers(age, &[]), answers(age, &["Metastases", "Tabac"])]
                })
                .map(|inputs| {
                    let features = encode(&inputs).expect("encode");
                    let prediction = predict_survival_time(&handle, &features, Some(&calibration))
                        .expect("predict");
                    assert!(prediction.median_months >= 1.0);
                    (prediction.risk, prediction.median_months)
                })
                .collect();
            estimates.sort_by(|a, b| a.0.total_cmp(&b.0));
            for pair in estimates.windows(2) {
                assert!(
                    pair[1].1 <= pair[0].1 + 1e-9,
                    "{family} / {strategy:?}: risk {} -> {} months but risk {} -> {} months",
                    pair[0].0,
                    pair[0].1,
                    pair[1].0,
                    pair[1].1
                );
            }
        }
    }
}
