//! Durable file I/O shared by the dataset, the model artifact and the calibration
//! artifact: TOML (de)serialization, atomic replacement and advisory lock files.

use crate::dataset::DatasetError;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::NamedTempFile;
use thiserror::Error;

const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// A model, calibration or dataset file could not be read.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("The file '{0}' does not exist.")]
    Missing(PathBuf),
    #[error("Failed to read '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to parse TOML artifact '{path}': {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("Unsupported artifact format for '{0}'; expected a .toml file.")]
    UnsupportedFormat(PathBuf),
    #[error("Artifact '{path}' was trained with loss '{name}', which is not registered.")]
    UnknownLoss { path: PathBuf, name: String },
    #[error("Artifact '{path}' is invalid: {reason}")]
    Invalid { path: PathBuf, reason: String },
    #[error("Dataset error: {0}")]
    Dataset(#[from] DatasetError),
}

/// A write to the dataset or to an artifact did not complete. The previous file
/// content is still in place whenever this error is returned.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("Failed to write '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to serialize artifact to TOML: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("Failed to encode dataset rows: {0}")]
    Csv(#[from] csv::Error),
    #[error("Timed out after {waited_ms} ms waiting for lock '{path}'.")]
    LockTimeout { path: PathBuf, waited_ms: u128 },
    #[error("Refusing to persist: {0}")]
    Rejected(String),
}

impl PersistenceError {
    pub fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

/// Replaces `path` with `bytes` through a temporary file in the same directory and
/// an atomic rename. Readers observe either the old or the new content.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), PersistenceError> {
    let dir = parent_dir(path);
    fs::create_dir_all(&dir).map_err(|e| PersistenceError::io(&dir, e))?;
    let mut staged = NamedTempFile::new_in(&dir).map_err(|e| PersistenceError::io(&dir, e))?;
    staged
        .write_all(bytes)
        .and_then(|_| staged.flush())
        .and_then(|_| staged.as_file().sync_all())
        .map_err(|e| PersistenceError::io(path, e))?;
    staged
        .persist(path)
        .map_err(|e| PersistenceError::io(path, e.error))?;
    log::debug!("Atomically replaced {}", path.display());
    Ok(())
}

pub fn save_toml<T: Serialize>(path: &Path, value: &T) -> Result<(), PersistenceError> {
    let toml_string = toml::to_string_pretty(value)?;
    write_atomic(path, toml_string.as_bytes())
}

/// Reads a TOML artifact. Only `.toml` paths are accepted.
pub fn load_toml<T: DeserializeOwned>(path: &Path) -> Result<T, LoadError> {
    if !path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("toml")) {
        return Err(LoadError::UnsupportedFormat(path.to_path_buf()));
    }
    if !path.exists() {
        return Err(LoadError::Missing(path.to_path_buf()));
    }
    let toml_string = fs::read_to_string(path).map_err(|source| LoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&toml_string).map_err(|source| LoadError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Exclusive advisory lock held as `<target>.lock` for as long as the guard lives.
#[derive(Debug)]
pub struct FileLock {
    path: PathBuf,
}

impl FileLock {
    pub fn lock_path(target: &Path) -> PathBuf {
        let mut name = target.as_os_str().to_owned();
        name.push(".lock");
        PathBuf::from(name)
    }

    /// Creates the lock file, polling until `timeout` elapses if another writer holds it.
    pub fn acquire(target: &Path, timeout: Duration) -> Result<Self, PersistenceError> {
        let path = Self::lock_path(target);
        let dir = parent_dir(&path);
        fs::create_dir_all(&dir).map_err(|e| PersistenceError::io(&dir, e))?;
        let started = Instant::now();
        loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    // Owner pid, for diagnosing stale locks.
                    let pid = std::process::id();
                    if let Err(err) = writeln!(file, "{pid}") {
                        log::debug!("Could not record owner in {}: {err}", path.display());
                    }
                    return Ok(Self { path });
                }
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                    if started.elapsed() >= timeout {
                        return Err(PersistenceError::LockTimeout {
                            path,
                            waited_ms: started.elapsed().as_millis(),
                        });
                    }
                    thread::sleep(LOCK_POLL_INTERVAL);
                }
                Err(err) => return Err(PersistenceError::io(&path, err)),
            }
        }
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            log::warn!("Failed to release lock {}: {err}", self.path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::tempdir;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        name: String,
        values: Vec<f64>,
    }

    #[test]
    fn toml_artifact_round_trips() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("sample.toml");
        let sample = Sample {
            name: "cohort".to_string(),
            values: vec![1.0, 2.5],
        };
        save_toml(&path, &sample).expect("save");
        let loaded: Sample = load_toml(&path).expect("load");
        assert_eq!(loaded, sample);
    }

    #[test]
    fn non_toml_extension_is_rejected() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("model.keras");
        fs::write(&path, "binary").expect("write");
        let result: Result<Sample, LoadError> = load_toml(&path);
        assert!(matches!(result, Err(LoadError::UnsupportedFormat(_))));
    }

    #[test]
    fn missing_artifact_is_reported() {
        let dir = tempdir().expect("tempdir");
        let result: Result<Sample, LoadError> = load_toml(&dir.path().join("absent.toml"));
        assert!(matches!(result, Err(LoadError::Missing(_))));
    }

    #[test]
    fn corrupt_artifact_is_a_parse_error() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("broken.toml");
        fs::write(&path, "name = [unterminated").expect("write");
        let result: Result<Sample, LoadError> = load_toml(&path);
        assert!(matches!(result, Err(LoadError::Parse { .. })));
    }

    #[test]
    fn second_lock_times_out_until_first_is_dropped() {
        let dir = tempdir().expect("tempdir");
        let target = dir.path().join("data.csv");
        let first = FileLock::acquire(&target, Duration::from_millis(10)).expect("first lock");
        let second = FileLock::acquire(&target, Duration::from_millis(60));
        assert!(matches!(second, Err(PersistenceError::LockTimeout { .. })));
        drop(first);
        assert!(!FileLock::lock_path(&target).exists());
        FileLock::acquire(&target, Duration::from_millis(10)).expect("lock after release");
    }
}
