//! Sample stores used by workers
//!
//! A store holds samples in named partitions and hands out integer line
//! references. Lines start at 1 within each partition.

use simbatch_ipc::FieldMap;
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

use crate::error::StoreError;

/// Partition used until the coordinator selects one
pub const DEFAULT_PARTITION: &str = "training";

/// Persistent sample storage
pub trait SampleStore: Send {
    /// Adopt the location sent by the coordinator. `None` keeps the current one.
    fn open(&mut self, _location: Option<&Path>) -> Result<(), StoreError> {
        Ok(())
    }

    /// Store a new sample and return its line
    fn add(&mut self, sample: FieldMap) -> Result<i64, StoreError>;

    /// Overwrite an existing line
    fn update(&mut self, line: i64, sample: FieldMap) -> Result<(), StoreError>;

    fn get(&self, line: i64) -> Result<FieldMap, StoreError>;

    /// Switch to `partition`, creating it if needed
    fn synchronize(&mut self, partition: &str) -> Result<(), StoreError>;

    fn partition(&self) -> &str;
}

/// In-memory store. Clones share the same samples but select partitions
/// independently.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    partitions: Arc<Mutex<BTreeMap<String, Vec<FieldMap>>>>,
    partition: String,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            partitions: Arc::new(Mutex::new(BTreeMap::new())),
            partition: DEFAULT_PARTITION.to_string(),
        }
    }

    /// Number of samples in `partition`
    pub fn len(&self, partition: &str) -> Result<usize, StoreError> {
        let partitions = self.partitions.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(partitions.get(partition).map_or(0, Vec::len))
    }

    pub fn partition_names(&self) -> Result<Vec<String>, StoreError> {
        let partitions = self.partitions.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(partitions.keys().cloned().collect())
    }

    fn missing(&self, line: i64) -> StoreError {
        StoreError::MissingLine {
            partition: self.partition.clone(),
            line,
        }
    }

    fn index(&self, line: i64) -> Result<usize, StoreError> {
        usize::try_from(line)
            .ok()
            .and_then(|line| line.checked_sub(1))
            .ok_or_else(|| self.missing(line))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SampleStore for MemoryStore {
    fn add(&mut self, sample: FieldMap) -> Result<i64, StoreError> {
        let mut partitions = self.partitions.lock().map_err(|_| StoreError::Poisoned)?;
        let rows = partitions.entry(self.partition.clone()).or_default();
        rows.push(sample);
        Ok(rows.len() as i64)
    }

    fn update(&mut self, line: i64, sample: FieldMap) -> Result<(), StoreError> {
        let index = self.index(line)?;
        let mut partitions = self.partitions.lock().map_err(|_| StoreError::Poisoned)?;
        match partitions.get_mut(&self.partition).and_then(|rows| rows.get_mut(index)) {
            Some(row) => {
                *row = sample;
                Ok(())
            }
            None => Err(self.missing(line)),
        }
    }

    fn get(&self, line: i64) -> Result<FieldMap, StoreError> {
        let index = self.index(line)?;
        let partitions = self.partitions.lock().map_err(|_| StoreError::Poisoned)?;
        partitions
            .get(&self.partition)
            .and_then(|rows| rows.get(index))
            .cloned()
            .ok_or_else(|| self.missing(line))
    }

    fn synchronize(&mut self, partition: &str) -> Result<(), StoreError> {
        let mut partitions = self.partitions.lock().map_err(|_| StoreError::Poisoned)?;
        partitions.entry(partition.to_string()).or_default();
        self.partition = partition.to_string();
        Ok(())
    }

    fn partition(&self) -> &str {
        &self.partition
    }
}

/// Store keeping one JSON file per sample under `<root>/<partition>/`.
/// Several workers may share a root: new lines are claimed with exclusive
/// file creation.
#[derive(Debug, Clone)]
pub struct JsonDirStore {
    root: PathBuf,
    partition: String,
}

impl JsonDirStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            partition: DEFAULT_PARTITION.to_string(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn partition_dir(&self) -> PathBuf {
        self.root.join(&self.partition)
    }

    fn line_path(&self, line: i64) -> PathBuf {
        self.partition_dir().join(format!("{:08}.json", line))
    }

    fn missing(&self, line: i64) -> StoreError {
        StoreError::MissingLine {
            partition: self.partition.clone(),
            line,
        }
    }
}

/// Write a freshly claimed line. On failure the claim is released so the
/// line never holds a truncated sample.
fn fill_claimed(path: &Path, mut file: impl Write, payload: &[u8]) -> Result<(), StoreError> {
    let written = file.write_all(payload).and_then(|()| file.flush());
    drop(file);
    if let Err(e) = written {
        if let Err(remove_err) = fs::remove_file(path) {
            warn!("failed to release {}: {}", path.display(), remove_err);
        }
        return Err(e.into());
    }
    Ok(())
}

impl SampleStore for JsonDirStore {
    fn open(&mut self, location: Option<&Path>) -> Result<(), StoreError> {
        if let Some(location) = location {
            self.root = location.to_path_buf();
        }
        fs::create_dir_all(self.partition_dir())?;
        Ok(())
    }

    fn add(&mut self, sample: FieldMap) -> Result<i64, StoreError> {
        let dir = self.partition_dir();
        fs::create_dir_all(&dir)?;
        let payload = serde_json::to_vec(&sample)?;

        let mut line = fs::read_dir(&dir)?.count() as i64 + 1;
        loop {
            let path = self.line_path(line);
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => {
                    fill_claimed(&path, file, &payload)?;
                    debug!("stored sample {} in {}", line, dir.display());
                    return Ok(line);
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => line += 1,
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn update(&mut self, line: i64, sample: FieldMap) -> Result<(), StoreError> {
        let path = self.line_path(line);
        if line < 1 || !path.exists() {
            return Err(self.missing(line));
        }
        fs::write(path, serde_json::to_vec(&sample)?)?;
        Ok(())
    }

    fn get(&self, line: i64) -> Result<FieldMap, StoreError> {
        if line < 1 {
            return Err(self.missing(line));
        }
        match fs::read(self.line_path(line)) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(self.missing(line)),
            Err(e) => Err(e.into()),
        }
    }

    fn synchronize(&mut self, partition: &str) -> Result<(), StoreError> {
        self.partition = partition.to_string();
        fs::create_dir_all(self.partition_dir())?;
        Ok(())
    }

    fn partition(&self) -> &str {
        &self.partition
    }
}
