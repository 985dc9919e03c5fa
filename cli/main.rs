#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]

use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::error::Error;
use std::fs;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::process;

use shahidi::calibrator::{Calibration, CalibrationStrategy};
use shahidi::cohort::TrainingCohort;
use shahidi::config::ShahidiConfig;
use shahidi::dataset::{AGE, findings, is_covariate};
use shahidi::encoder::{RawInputs, RawValue};
use shahidi::model::{EpochProgress, ModelFamily, fit_model};
use shahidi::predictor::survival_curve;
use shahidi::retrain::RetrainOutcome;
use shahidi::store::PatientStore;

type CliResult = Result<(), Box<dyn Error>>;

#[derive(Clone, Copy, ValueEnum)]
enum FamilyCli {
    Deepsurv,
    Coxph,
    Boosted,
}

impl From<FamilyCli> for ModelFamily {
    fn from(family: FamilyCli) -> Self {
        match family {
            FamilyCli::Deepsurv => ModelFamily::DeepSurv,
            FamilyCli::Coxph => ModelFamily::CoxPh,
            FamilyCli::Boosted => ModelFamily::GradientBoosted,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum StrategyCli {
    RiskGroups,
    Baseline,
}

impl From<StrategyCli> for CalibrationStrategy {
    fn from(strategy: StrategyCli) -> Self {
        match strategy {
            StrategyCli::RiskGroups => CalibrationStrategy::RiskGroups,
            StrategyCli::Baseline => CalibrationStrategy::Baseline,
        }
    }
}

/// A patient's answers, from flags and optionally a TOML file of `name = value`.
#[derive(Args)]
struct PatientArgs {
    /// TOML file mapping covariate names to answers
    #[arg(long, value_name = "PATH")]
    inputs: Option<PathBuf>,

    /// Patient age in years
    #[arg(long)]
    age: Option<f64>,

    /// Finding answered OUI (repeatable); unlisted findings default to NON
    #[arg(long = "positive", value_name = "FINDING")]
    positive: Vec<String>,
}

impl PatientArgs {
    fn to_inputs(&self) -> Result<RawInputs, Box<dyn Error>> {
        let mut inputs: RawInputs = match &self.inputs {
            Some(path) => read_inputs(path)?,
            None => findings()
                .iter()
                .map(|name| (name.to_string(), RawValue::Flag(false)))
                .collect(),
        };
        for name in &self.positive {
            if !is_covariate(name) || name == AGE {
                return Err(format!("'{name}' is not a clinical finding").into());
            }
            inputs.insert(name.clone(), RawValue::Flag(true));
        }
        if let Some(age) = self.age {
            inputs.insert(AGE.to_string(), RawValue::Number(age));
        }
        Ok(inputs)
    }
}

fn read_inputs(path: &Path) -> Result<RawInputs, Box<dyn Error>> {
    let text = fs::read_to_string(path)
        .map_err(|e| format!("Could not read answers '{}': {e}", path.display()))?;
    Ok(toml::from_str(&text)?)
}

#[derive(Parser)]
#[command(
    name = "shahidi",
    version,
    about = "Calibrated survival-time prediction for clinical cohorts",
    long_about = "Predicts a patient's median survival in months from clinical answers, \
                 maintains the patient dataset and refits the survival model as it grows."
)]
struct Cli {
    /// Configuration file (TOML); defaults apply when omitted
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Estimate a patient's median survival time
    #[command(about = "Predict median survival in months")]
    Predict {
        #[command(flatten)]
        patient: PatientArgs,

        /// Also print the individual survival curve up to this many months
        #[arg(long, value_name = "MONTHS")]
        curve: Option<f64>,

        /// Store the patient in the dataset, censored at the predicted survival
        #[arg(long)]
        save: bool,
    },

    /// Append an observed patient to the dataset
    #[command(about = "Append a patient with an observed outcome")]
    Append {
        #[command(flatten)]
        patient: PatientArgs,

        /// Follow-up in months
        #[arg(long, value_name = "MONTHS")]
        follow_up: f64,

        /// The patient died during follow-up
        #[arg(long)]
        event: bool,

        /// Run the retraining job right after the append
        #[arg(long)]
        retrain: bool,
    },

    /// Re-derive the calibration table from the stored cohort
    #[command(about = "Recalibrate the current model (outputs: calibration artifact)")]
    Calibrate {
        #[arg(long, value_enum)]
        strategy: Option<StrategyCli>,

        /// Number of risk groups
        #[arg(long, value_name = "N")]
        groups: Option<usize>,
    },

    /// Continue training the current model on the whole dataset
    #[command(about = "Retrain the current model (outputs: model and calibration artifacts)")]
    Retrain {
        #[arg(long, value_name = "N")]
        epochs: Option<usize>,
    },

    /// Fit a new model from scratch and calibrate it
    #[command(about = "Train a new model (outputs: model and calibration artifacts)")]
    Train {
        #[arg(long, value_enum)]
        family: Option<FamilyCli>,

        #[arg(long, value_name = "N")]
        epochs: Option<usize>,
    },

    /// Describe the stored cohort
    #[command(about = "Summarise the stored dataset")]
    Summary {
        /// Print the full summary as TOML
        #[arg(long)]
        toml: bool,
    },
}

fn create_progress_bar(len: u64, message: &str) -> ProgressBar {
    let draw_target = if std::io::stderr().is_terminal() {
        ProgressDrawTarget::stderr_with_hz(20)
    } else {
        ProgressDrawTarget::hidden()
    };

    let pb = ProgressBar::with_draw_target(Some(len), draw_target);
    if let Ok(style) =
        ProgressStyle::with_template("> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
    {
        pb.set_style(style.progress_chars("█▉▊▋▌▍▎▏  "));
    }
    pb.set_message(message.to_string());
    pb
}

fn epoch_observer(pb: &ProgressBar) -> impl FnMut(&EpochProgress) + '_ {
    move |progress: &EpochProgress| {
        pb.set_position(progress.epoch as u64);
        pb.set_message(format!("loss {:.4}", progress.loss));
    }
}

fn open_store(config: &ShahidiConfig) -> PatientStore {
    PatientStore::new(config.paths.clone(), config.store_settings())
}

fn run_predict(
    config: &ShahidiConfig,
    patient: &PatientArgs,
    curve: Option<f64>,
    save: bool,
) -> CliResult {
    let inputs = patient.to_inputs()?;
    let mut store = open_store(config);
    let prediction = store.predict(&inputs)?;

    println!("Risk score: {:.4}", prediction.risk);
    println!(
        "Estimated median survival: {:.1} months",
        prediction.median_months
    );
    if let Some(group) = prediction.risk_group {
        println!("Risk group: {group}");
    }

    if let Some(horizon) = curve {
        let features = store.encoder().encode(&inputs)?;
        let calibration = store.calibration()?.cloned();
        let handle = store.model()?;
        match survival_curve(handle, &features, calibration.as_ref(), Some(horizon))? {
            Some(curve) => {
                println!("months\tsurvival");
                for (t, s) in curve.times.iter().zip(&curve.survival) {
                    println!("{t:.2}\t{s:.4}");
                }
            }
            None => println!("No survival curve: the calibration has no baseline curve."),
        }
    }

    if save {
        let outcome = store.append_answers(&inputs, prediction.median_months, false)?;
        println!(
            "Patient saved to {} ({} rows), censored at {:.1} months.",
            store.paths().dataset.display(),
            outcome.rows,
            prediction.median_months
        );
    }
    Ok(())
}

fn run_append(
    config: &ShahidiConfig,
    patient: &PatientArgs,
    follow_up: f64,
    event: bool,
    retrain: bool,
) -> CliResult {
    let inputs = patient.to_inputs()?;
    let mut store = open_store(config);
    let outcome = store.append_answers(&inputs, follow_up, event)?;
    println!(
        "Patient appended to {} ({} rows).",
        store.paths().dataset.display(),
        outcome.rows
    );
    if retrain {
        let pb = create_progress_bar(config.retrain.schedule.epochs as u64, "retraining");
        let result = store.run_pending_retrain(&mut epoch_observer(&pb));
        pb.finish_and_clear();
        if let Some(outcome) = result? {
            report_retrain(&outcome);
        }
    } else {
        println!("Retraining pending; run `shahidi retrain` to refit the model.");
    }
    Ok(())
}

fn run_calibrate(
    config: &ShahidiConfig,
    strategy: Option<StrategyCli>,
    groups: Option<usize>,
) -> CliResult {
    let mut config = config.clone();
    if let Some(strategy) = strategy {
        config.calibration.strategy = strategy.into();
    }
    if let Some(groups) = groups {
        config.calibration.groups = groups;
    }
    config.validate()?;

    let mut store = open_store(&config);
    let calibration = store.recalibrate()?;
    describe_calibration(&calibration);
    println!(
        "Calibration saved to: {}",
        store.paths().calibration.display()
    );
    Ok(())
}

fn run_retrain(config: &ShahidiConfig, epochs: Option<usize>) -> CliResult {
    let mut config = config.clone();
    if let Some(epochs) = epochs {
        config.retrain.schedule.epochs = epochs;
    }
    let mut store = open_store(&config);
    let pb = create_progress_bar(config.retrain.schedule.epochs as u64, "retraining");
    let result = store.retrain_now(&mut epoch_observer(&pb));
    pb.finish_and_clear();
    report_retrain(&result?);
    Ok(())
}

fn run_train(config: &ShahidiConfig, family: Option<FamilyCli>, epochs: Option<usize>) -> CliResult {
    let mut config = config.clone();
    if let Some(family) = family {
        config.model.family = family.into();
    }
    if let Some(epochs) = epochs {
        config.retrain.schedule.epochs = epochs;
    }

    let mut store = open_store(&config);
    let cohort = TrainingCohort::from_records(store.records()?);
    cohort.require(config.retrain.min_rows, "Training")?;
    println!(
        "Training {} model on {} patients ({} events)",
        config.model.family,
        cohort.len(),
        cohort.n_events()
    );

    let schedule = &config.retrain.schedule;
    let pb = create_progress_bar(schedule.epochs as u64, "training");
    let fitted = fit_model(&config.model, &cohort, schedule, &mut epoch_observer(&pb));
    pb.finish_and_clear();

    let calibration = store.install_model(fitted?)?;
    println!("Model saved to: {}", store.paths().model.display());
    describe_calibration(&calibration);
    Ok(())
}

fn run_summary(config: &ShahidiConfig, as_toml: bool) -> CliResult {
    let mut store = open_store(config);
    let summary = store.summary()?;
    if as_toml {
        print!("{}", toml::to_string_pretty(&summary)?);
        return Ok(());
    }

    println!(
        "{} patients, {} variables, {} deaths ({:.1}%)",
        summary.patients,
        summary.variables,
        summary.events,
        100.0 * summary.event_rate
    );
    for numeric in &summary.numeric {
        println!(
            "{:<22} mean {:>8.2}  median {:>8.2}  sd {:>8.2}  unique {}",
            numeric.name, numeric.mean, numeric.median, numeric.std_dev, numeric.unique
        );
    }
    for categorical in &summary.categorical {
        println!(
            "{:<22} mode {:<4} ({} patients)  unique {}",
            categorical.name, categorical.mode, categorical.mode_count, categorical.unique
        );
    }
    match summary.survival.median() {
        Some(median) => println!("Kaplan-Meier median survival: {median:.1} months"),
        None => println!(
            "Kaplan-Meier median survival not reached within {:.1} months",
            summary.survival.horizon()
        ),
    }
    Ok(())
}

fn report_retrain(outcome: &RetrainOutcome) {
    match outcome {
        RetrainOutcome::Skipped(reason) => println!("Retraining skipped: {reason}"),
        RetrainOutcome::Completed {
            rows,
            report,
            calibration,
        } => {
            println!(
                "Retrained on {rows} patients over {} passes: loss {:.4} -> {:.4}",
                report.epochs, report.initial_loss, report.final_loss
            );
            match calibration {
                Some(strategy) => println!("Calibration refreshed ({strategy:?})."),
                None => println!("No deaths observed; calibration is uninformative."),
            }
        }
    }
}

fn describe_calibration(calibration: &Calibration) {
    match calibration {
        Calibration::RiskGroups(table) => {
            println!("Calibrated {} risk groups", table.n_groups());
            for (idx, (median, size)) in table.medians.iter().zip(&table.group_sizes).enumerate() {
                println!("  group {}: median {median:.1} months ({size} patients)", idx + 1);
            }
        }
        Calibration::Baseline(baseline) => println!(
            "Calibrated baseline survival up to {:.1} months (reference risk {:.4})",
            baseline.curve.horizon(),
            baseline.reference_risk
        ),
        Calibration::Uninformative { .. } => {
            println!("No deaths observed; predictions fall back to the default median.")
        }
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();
    let Cli { config, command } = cli;

    let config = match ShahidiConfig::load_or_default(config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            process::exit(1);
        }
    };

    let result = match command {
        Some(Commands::Predict {
            patient,
            curve,
            save,
        }) => run_predict(&config, &patient, curve, save),
        Some(Commands::Append {
            patient,
            follow_up,
            event,
            retrain,
        }) => run_append(&config, &patient, follow_up, event, retrain),
        Some(Commands::Calibrate { strategy, groups }) => run_calibrate(&config, strategy, groups),
        Some(Commands::Retrain { epochs }) => run_retrain(&config, epochs),
        Some(Commands::Train { family, epochs }) => run_train(&config, family, epochs),
        Some(Commands::Summary { toml }) => run_summary(&config, toml),
        None => Cli::command()
            .print_help()
            .map(|_| println!())
            .map_err(|e| Box::new(e) as Box<dyn Error>),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}
