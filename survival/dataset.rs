use crate::artifact::{PersistenceError, write_atomic};
use csv::StringRecord;
use std::path::Path;
use thiserror::Error;

/// Continuous covariate, in years.
pub const AGE: &str = "AGE";
/// Follow-up duration column, in months.
pub const FOLLOW_UP: &str = "Tempsdesuivi";
/// Event indicator column (death observed).
pub const EVENT: &str = "Deces";

pub const AFFIRMATIVE: &str = "OUI";
pub const NEGATIVE: &str = "NON";

pub const NUM_FINDINGS: usize = 11;
pub const NUM_COVARIATES: usize = NUM_FINDINGS + 1;

/// The canonical covariate order. Encoded feature rows, model artifacts and the
/// dataset file all follow this order.
pub const COVARIATES: [&str; NUM_COVARIATES] = [
    AGE,
    "Cardiopathie",
    "Ulceregastrique",
    "Douleurepigastrique",
    "Ulcero-bourgeonnant",
    "Denitrution",
    "Tabac",
    "Mucineux",
    "Infiltrant",
    "Stenosant",
    "Metastases",
    "Adenopathie",
];

/// Binary findings, in canonical order.
pub fn findings() -> &'static [&'static str] {
    &COVARIATES[1..]
}

pub fn is_covariate(name: &str) -> bool {
    COVARIATES.contains(&name)
}

/// Every column the dataset file must carry.
pub fn required_columns() -> impl Iterator<Item = &'static str> {
    COVARIATES.into_iter().chain([FOLLOW_UP, EVENT])
}

/// How a raw categorical answer relates to the canonical tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Token {
    Affirmative,
    Negative,
    Unrecognized,
}

/// Case-insensitive, whitespace-tolerant classification against `OUI` / `NON`.
pub fn classify_token(raw: &str) -> Token {
    let trimmed = raw.trim();
    if trimmed.eq_ignore_ascii_case(AFFIRMATIVE) {
        Token::Affirmative
    } else if trimmed.eq_ignore_ascii_case(NEGATIVE) {
        Token::Negative
    } else {
        Token::Unrecognized
    }
}

pub fn token_for(flag: bool) -> &'static str {
    if flag { AFFIRMATIVE } else { NEGATIVE }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum RecordError {
    #[error("age must be finite and non-negative, got {0}")]
    InvalidAge(f64),
    #[error("follow-up must be finite and non-negative, got {0}")]
    InvalidFollowUp(f64),
}

/// One patient: covariates in canonical order plus the observed outcome.
#[derive(Debug, Clone, PartialEq)]
pub struct ClinicalRecord {
    age: f64,
    findings: [bool; NUM_FINDINGS],
    follow_up: f64,
    event: bool,
}

impl ClinicalRecord {
    pub fn new(
        age: f64,
        findings: [bool; NUM_FINDINGS],
        follow_up: f64,
        event: bool,
    ) -> Result<Self, RecordError> {
        if !age.is_finite() || age < 0.0 {
            return Err(RecordError::InvalidAge(age));
        }
        if !follow_up.is_finite() || follow_up < 0.0 {
            return Err(RecordError::InvalidFollowUp(follow_up));
        }
        Ok(Self {
            age,
            findings,
            follow_up,
            event,
        })
    }

    pub fn age(&self) -> f64 {
        self.age
    }

    pub fn findings(&self) -> &[bool; NUM_FINDINGS] {
        &self.findings
    }

    pub fn finding(&self, name: &str) -> Option<bool> {
        findings()
            .iter()
            .position(|candidate| *candidate == name)
            .map(|idx| self.findings[idx])
    }

    pub fn follow_up(&self) -> f64 {
        self.follow_up
    }

    pub fn event(&self) -> bool {
        self.event
    }

    /// The row as stored on disk, in `required_columns()` order.
    fn to_row(&self) -> Vec<String> {
        let mut row = Vec::with_capacity(NUM_COVARIATES + 2);
        row.push(self.age.to_string());
        row.extend(self.findings.iter().map(|&flag| token_for(flag).to_string()));
        row.push(self.follow_up.to_string());
        row.push(token_for(self.event).to_string());
        row
    }
}

/// Errors surfaced while reading the persisted dataset.
#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("The required column '{0}' was not found in the dataset.")]
    ColumnNotFound(String),
    #[error("Row {row}: column '{column}' holds '{value}', expected OUI or NON.")]
    InvalidToken {
        row: usize,
        column: String,
        value: String,
    },
    #[error("Row {row}: column '{column}' holds '{value}', which is not a number.")]
    InvalidNumber {
        row: usize,
        column: String,
        value: String,
    },
    #[error("Row {row}: {source}")]
    InvalidRecord {
        row: usize,
        #[source]
        source: RecordError,
    },
}

struct ColumnMap {
    positions: Vec<usize>,
}

impl ColumnMap {
    fn from_headers(headers: &StringRecord) -> Result<Self, DatasetError> {
        let positions = required_columns()
            .map(|name| {
                headers
                    .iter()
                    .position(|header| header.trim() == name)
                    .ok_or_else(|| DatasetError::ColumnNotFound(name.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { positions })
    }

    fn field<'r>(&self, record: &'r StringRecord, column: usize) -> &'r str {
        record.get(self.positions[column]).unwrap_or("").trim()
    }
}

fn parse_number(raw: &str, row: usize, column: &str) -> Result<f64, DatasetError> {
    raw.parse::<f64>().map_err(|_| DatasetError::InvalidNumber {
        row,
        column: column.to_string(),
        value: raw.to_string(),
    })
}

fn parse_flag(raw: &str, row: usize, column: &str) -> Result<bool, DatasetError> {
    match classify_token(raw) {
        Token::Affirmative => Ok(true),
        Token::Negative => Ok(false),
        Token::Unrecognized => Err(DatasetError::InvalidToken {
            row,
            column: column.to_string(),
            value: raw.to_string(),
        }),
    }
}

fn parse_row(
    columns: &ColumnMap,
    record: &StringRecord,
    row: usize,
) -> Result<ClinicalRecord, DatasetError> {
    let age = parse_number(columns.field(record, 0), row, AGE)?;
    let mut flags = [false; NUM_FINDINGS];
    for (idx, name) in findings().iter().enumerate() {
        flags[idx] = parse_flag(columns.field(record, idx + 1), row, name)?;
    }
    let follow_up = parse_number(columns.field(record, NUM_COVARIATES), row, FOLLOW_UP)?;
    let event = parse_flag(columns.field(record, NUM_COVARIATES + 1), row, EVENT)?;
    ClinicalRecord::new(age, flags, follow_up, event)
        .map_err(|source| DatasetError::InvalidRecord { row, source })
}

/// Reads every record from a comma-separated dataset with a header row. Columns are
/// matched by name; extra columns are ignored.
pub fn load_dataset(path: &Path) -> Result<Vec<ClinicalRecord>, DatasetError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_path(path)?;
    let columns = ColumnMap::from_headers(reader.headers()?)?;
    let mut records = Vec::new();
    for (idx, row) in reader.records().enumerate() {
        let row = row?;
        // Data rows are 1-based, after the header.
        records.push(parse_row(&columns, &row, idx + 1)?);
    }
    log::debug!("Loaded {} records from {}", records.len(), path.display());
    Ok(records)
}

/// Rewrites the whole dataset atomically with canonical tokens.
pub fn save_dataset(path: &Path, records: &[ClinicalRecord]) -> Result<(), PersistenceError> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(required_columns())?;
    for record in records {
        writer.write_record(record.to_row())?;
    }
    writer.flush().map_err(|e| PersistenceError::io(path, e))?;
    let bytes = writer
        .into_inner()
        .map_err(|e| PersistenceError::io(path, std::io::Error::other(e.to_string())))?;
    write_atomic(path, &bytes)
}
