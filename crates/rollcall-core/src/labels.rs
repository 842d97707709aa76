//! Label mapping: dense classifier labels to student identities.
//!
//! A mapping is rebuilt on every training run and is only meaningful next to
//! the model it was trained with; it records that model's SHA-256 digest.

use crate::types::StudentId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;

pub const LABELS_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum LabelStoreError {
    #[error("label mapping not found at {0}")]
    NotFound(PathBuf),
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("malformed label mapping: {0}")]
    Parse(String),
    #[error("failed to serialize label mapping: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("invalid label mapping: {0}")]
    Invalid(String),
}

/// Result of resolving a classifier label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolved {
    Student(StudentId),
    /// The label is not part of this mapping.
    Unmapped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelMapping {
    version: u32,
    model_sha256: String,
    trained_at: DateTime<Utc>,
    labels: BTreeMap<u32, StudentId>,
}

impl LabelMapping {
    /// Assign labels `0..N` to `students` in iteration order. Repeated
    /// students keep their first label.
    pub fn assign(
        model_sha256: impl Into<String>,
        trained_at: DateTime<Utc>,
        students: impl IntoIterator<Item = StudentId>,
    ) -> Self {
        let mut labels = BTreeMap::new();
        for student in students {
            if !labels.values().any(|s| *s == student) {
                labels.insert(labels.len() as u32, student);
            }
        }
        Self {
            version: LABELS_VERSION,
            model_sha256: model_sha256.into(),
            trained_at,
            labels,
        }
    }

    pub fn resolve(&self, label: u32) -> Resolved {
        match self.labels.get(&label) {
            Some(&student) => Resolved::Student(student),
            None => Resolved::Unmapped,
        }
    }

    pub fn label_of(&self, student: StudentId) -> Option<u32> {
        self.labels
            .iter()
            .find_map(|(&label, &s)| (s == student).then_some(label))
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn model_sha256(&self) -> &str {
        &self.model_sha256
    }

    pub fn trained_at(&self) -> DateTime<Utc> {
        self.trained_at
    }

    /// Labels must be exactly `0..N` (N > 0) and name each student once.
    fn validate(&self) -> Result<(), LabelStoreError> {
        if self.version != LABELS_VERSION {
            return Err(LabelStoreError::Invalid(format!(
                "unsupported version {}",
                self.version
            )));
        }
        if self.is_empty() {
            return Err(LabelStoreError::Invalid("no labels".into()));
        }
        for (expected, &label) in self.labels.keys().enumerate() {
            if label != expected as u32 {
                return Err(LabelStoreError::Invalid(format!(
                    "labels are not dense: found {label} where {expected} was expected"
                )));
            }
        }
        let mut students: Vec<_> = self.labels.values().collect();
        students.sort();
        if let Some(pair) = students.windows(2).find(|w| w[0] == w[1]) {
            return Err(LabelStoreError::Invalid(format!(
                "student {} has more than one label",
                pair[0]
            )));
        }
        Ok(())
    }
}

/// File-backed persistence for one `LabelMapping`.
#[derive(Debug, Clone)]
pub struct LabelStore {
    path: PathBuf,
}

impl LabelStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<LabelMapping, LabelStoreError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(LabelStoreError::NotFound(self.path.clone()))
            }
            Err(source) => {
                return Err(LabelStoreError::Read {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        let mapping: LabelMapping =
            serde_json::from_slice(&bytes).map_err(|e| LabelStoreError::Parse(e.to_string()))?;
        mapping.validate()?;
        tracing::debug!(path = %self.path.display(), labels = mapping.len(), "label mapping loaded");
        Ok(mapping)
    }

    /// Replace the stored mapping. Readers see either the old or the new file.
    pub fn save(&self, mapping: &LabelMapping) -> Result<(), LabelStoreError> {
        let bytes = Self::encode(mapping)?;
        write_atomic(&self.path, &bytes).map_err(|source| LabelStoreError::Write {
            path: self.path.clone(),
            source,
        })
    }

    pub(crate) fn encode(mapping: &LabelMapping) -> Result<Vec<u8>, LabelStoreError> {
        serde_json::to_vec_pretty(mapping).map_err(LabelStoreError::Serialize)
    }
}

/// Directory a file lives in, `.` for bare file names.
pub(crate) fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    }
}

/// Write `bytes` to a uniquely named, synced temp file in `dir`.
pub(crate) fn stage(dir: &Path, bytes: &[u8]) -> io::Result<NamedTempFile> {
    let mut file = NamedTempFile::new_in(dir)?;
    file.write_all(bytes)?;
    file.as_file().sync_all()?;
    Ok(file)
}

/// Flush directory entries (renames) to disk.
pub(crate) fn sync_dir(dir: &Path) -> io::Result<()> {
    fs::File::open(dir)?.sync_all()
}

/// Stage `bytes` next to `path`, rename it over `path`, then sync the directory.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let dir = parent_dir(path);
    stage(dir, bytes)?.persist(path).map_err(|e| e.error)?;
    sync_dir(dir)
}
