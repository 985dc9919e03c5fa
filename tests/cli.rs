mod common;

use common::synthetic_cohort;
use shahidi::StorePaths;
use shahidi::config::ShahidiConfig;
use shahidi::dataset::{load_dataset, save_dataset};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tempfile::{TempDir, tempdir};

struct Workspace {
    dir: TempDir,
    config: PathBuf,
}

impl Workspace {
    fn new() -> Self {
        let dir = tempdir().expect("tempdir");
        let mut config = ShahidiConfig::default();
        config.paths = StorePaths::in_dir(dir.path());
        config.retrain.schedule.epochs = 5;
        let config_path = dir.path().join("shahidi.toml");
        fs::write(&config_path, config.to_toml_string().expect("config")).expect("write config");
        Self {
            dir,
            config: config_path,
        }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    fn run(&self, args: &[&str]) -> Output {
        Command::new(env!("CARGO_BIN_EXE_shahidi"))
            .arg("--config")
            .arg(&self.config)
            .args(args)
            .env("RUST_LOG", "off")
            .output()
            .expect("run shahidi")
    }
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

fn seed_dataset(path: &Path, n: usize) {
    save_dataset(path, &synthetic_cohort(n, 17)).expect("seed dataset");
}

#[test]
fn train_then_predict() {
    let ws = Workspace::new();
    seed_dataset(&ws.path("patients.csv"), 60);

    let train = ws.run(&["train", "--family", "coxph"]);
    assert!(train.status.success(), "train failed: {}", stderr(&train));
    assert!(ws.path("model.toml").exists());
    assert!(ws.path("calibration.toml").exists());

    let predict = ws.run(&["predict", "--age", "72", "--positive", "Metastases"]);
    assert!(predict.status.success(), "predict failed: {}", stderr(&predict));
    let text = stdout(&predict);
    assert!(text.contains("Estimated median survival"), "{text}");
    assert!(text.contains("months"));
}

#[test]
fn predict_reads_answers_from_a_file() {
    let ws = Workspace::new();
    seed_dataset(&ws.path("patients.csv"), 40);
    assert!(ws.run(&["train", "--family", "coxph"]).status.success());

    let answers = ws.path("answers.toml");
    fs::write(
        &answers,
        "AGE = 55\nCardiopathie = \"NON\"\nUlceregastrique = \"non\"\nDouleurepigastrique = false\n\
         Ulcero-bourgeonnant = \"NON\"\nDenitrution = \"NON\"\nTabac = \"OUI\"\nMucineux = \"NON\"\n\
         Infiltrant = \"NON\"\nStenosant = \"NON\"\nMetastases = 1\nAdenopathie = \"NON\"\n",
    )
    .expect("write answers");
    let answers_arg = answers.to_string_lossy().into_owned();
    let output = ws.run(&["predict", "--inputs", &answers_arg, "--curve", "24"]);
    assert!(output.status.success(), "predict failed: {}", stderr(&output));
    assert!(stdout(&output).contains("months\tsurvival"));
}

#[test]
fn predict_can_save_the_patient_censored() {
    let ws = Workspace::new();
    seed_dataset(&ws.path("patients.csv"), 40);
    assert!(ws.run(&["train", "--family", "coxph"]).status.success());

    let output = ws.run(&["predict", "--age", "66", "--positive", "Metastases", "--save"]);
    assert!(output.status.success(), "predict failed: {}", stderr(&output));
    assert!(stdout(&output).contains("41 rows"));

    let stored = load_dataset(&ws.path("patients.csv")).expect("dataset");
    let saved = stored.last().expect("saved patient");
    assert_eq!(saved.age(), 66.0);
    assert!(!saved.event());
    assert!(saved.follow_up() >= 1.0);
}

#[test]
fn append_and_summarise() {
    let ws = Workspace::new();
    let output = ws.run(&[
        "append",
        "--age",
        "61",
        "--positive",
        "Tabac",
        "--follow-up",
        "18",
        "--event",
    ]);
    assert!(output.status.success(), "append failed: {}", stderr(&output));
    assert!(stdout(&output).contains("1 rows"));

    let csv = fs::read_to_string(ws.path("patients.csv")).expect("dataset");
    assert_eq!(csv.lines().count(), 2);

    let summary = ws.run(&["summary"]);
    assert!(summary.status.success(), "summary failed: {}", stderr(&summary));
    assert!(stdout(&summary).contains("1 patients"));
}

#[test]
fn errors_exit_with_status_one() {
    let ws = Workspace::new();

    let no_model = ws.run(&["predict", "--age", "60"]);
    assert_eq!(no_model.status.code(), Some(1));
    assert!(stderr(&no_model).starts_with("Error: "));

    let unknown = ws.run(&["predict", "--age", "60", "--positive", "Headache"]);
    assert_eq!(unknown.status.code(), Some(1));
    assert!(stderr(&unknown).contains("Headache"));

    let empty = ws.run(&["summary"]);
    assert_eq!(empty.status.code(), Some(1));
}
