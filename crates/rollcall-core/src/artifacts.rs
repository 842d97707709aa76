//! The persisted model/mapping pair.
//!
//! Both files are staged before either is promoted. The previous model is
//! copied to `model.json.prev`, then `model.json` and `labels.json` are
//! renamed into place in that order. A failed labels rename restores the
//! previous model. The mapping carries the SHA-256 of the model bytes, so a
//! pair torn by a crash between the two renames is detected on load, which
//! then falls back to the backup.

use crate::labels::{stage, sync_dir, LabelMapping, LabelStore, LabelStoreError, Resolved};
use crate::lbph::{LbphError, LbphModel};
use sha2::{Digest, Sha256};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;

pub const MODEL_FILE: &str = "model.json";
pub const LABELS_FILE: &str = "labels.json";
const MODEL_BACKUP_FILE: &str = "model.json.prev";

#[derive(Error, Debug)]
pub enum ArtifactError {
    #[error("no trained model at {0} (run `rollcall train` first)")]
    Missing(PathBuf),
    #[error("artifact I/O on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("model: {0}")]
    Model(#[from] LbphError),
    #[error("labels: {0}")]
    Labels(#[from] LabelStoreError),
    #[error("failed to serialize model: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error(
        "label mapping does not belong to this model\n  expected: {expected}\n  got:      {got}"
    )]
    DigestMismatch { expected: String, got: String },
    #[error("model label {0} has no student in the mapping")]
    UnmappedModelLabel(u32),
}

/// SHA-256 hex digest of a byte slice.
pub fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Directory holding one trained model and its label mapping.
#[derive(Debug, Clone)]
pub struct ModelArtifacts {
    dir: PathBuf,
}

impl ModelArtifacts {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn model_path(&self) -> PathBuf {
        self.dir.join(MODEL_FILE)
    }

    pub fn labels(&self) -> LabelStore {
        LabelStore::new(self.dir.join(LABELS_FILE))
    }

    /// Persist the pair. `mapping` must have been built for exactly this model.
    ///
    /// On error the previously saved pair is left loadable.
    pub fn save(&self, model: &LbphModel, mapping: &LabelMapping) -> Result<(), ArtifactError> {
        let bytes = model.to_json()?;
        let digest = sha256_hex(&bytes);
        if digest != mapping.model_sha256() {
            return Err(ArtifactError::DigestMismatch {
                expected: digest,
                got: mapping.model_sha256().to_string(),
            });
        }
        let label_bytes = LabelStore::encode(mapping)?;

        fs::create_dir_all(&self.dir).map_err(|source| self.io_error(&self.dir, source))?;
        let staged_model = stage(&self.dir, &bytes).map_err(|e| self.io_error(&self.dir, e))?;
        let staged_labels =
            stage(&self.dir, &label_bytes).map_err(|e| self.io_error(&self.dir, e))?;
        self.promote(staged_model, staged_labels, |staged, target| {
            staged.persist(target).map(drop).map_err(|e| e.error)
        })?;

        tracing::info!(
            dir = %self.dir.display(),
            samples = model.sample_count(),
            labels = mapping.len(),
            sha256 = %digest,
            "model artifacts saved"
        );
        Ok(())
    }

    /// Rename both staged files into place, model first. `persist_labels`
    /// performs the final rename.
    fn promote<F>(
        &self,
        model: NamedTempFile,
        labels: NamedTempFile,
        persist_labels: F,
    ) -> Result<(), ArtifactError>
    where
        F: FnOnce(NamedTempFile, &Path) -> io::Result<()>,
    {
        let model_path = self.model_path();
        let backup_path = self.backup_path();
        let had_prior = match fs::copy(&model_path, &backup_path) {
            Ok(_) => {
                fs::File::open(&backup_path)
                    .and_then(|f| f.sync_all())
                    .map_err(|e| self.io_error(&backup_path, e))?;
                true
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => false,
            Err(e) => return Err(self.io_error(&backup_path, e)),
        };

        model
            .persist(&model_path)
            .map_err(|e| self.io_error(&model_path, e.error))?;

        let labels_path = self.labels().path().to_path_buf();
        if let Err(source) = persist_labels(labels, &labels_path) {
            self.roll_back(had_prior);
            return Err(LabelStoreError::Write {
                path: labels_path,
                source,
            }
            .into());
        }

        sync_dir(&self.dir).map_err(|e| self.io_error(&self.dir, e))?;
        if had_prior {
            if let Err(e) = fs::remove_file(&backup_path) {
                tracing::warn!(path = %backup_path.display(), error = %e, "failed to remove model backup");
            }
        }
        Ok(())
    }

    /// Put the previous model back after a failed labels rename.
    fn roll_back(&self, had_prior: bool) {
        let model_path = self.model_path();
        let restored = if had_prior {
            fs::rename(self.backup_path(), &model_path)
        } else {
            fs::remove_file(&model_path)
        };
        match restored.and_then(|()| sync_dir(&self.dir)) {
            Ok(()) => tracing::warn!(dir = %self.dir.display(), "labels write failed, previous model restored"),
            Err(e) => tracing::error!(dir = %self.dir.display(), error = %e, "failed to restore previous model"),
        }
    }

    fn backup_path(&self) -> PathBuf {
        self.dir.join(MODEL_BACKUP_FILE)
    }

    fn io_error(&self, path: &Path, source: io::Error) -> ArtifactError {
        ArtifactError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    /// Load and cross-check the pair.
    pub fn load(&self) -> Result<(LbphModel, LabelMapping), ArtifactError> {
        let model_path = self.model_path();
        let bytes = match fs::read(&model_path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(ArtifactError::Missing(self.dir.clone()))
            }
            Err(source) => {
                return Err(ArtifactError::Io {
                    path: model_path,
                    source,
                })
            }
        };

        let mapping = match self.labels().load() {
            Ok(mapping) => mapping,
            Err(LabelStoreError::NotFound(_)) => return Err(ArtifactError::Missing(self.dir.clone())),
            Err(e) => return Err(e.into()),
        };

        let digest = sha256_hex(&bytes);
        let bytes = if digest == mapping.model_sha256() {
            bytes
        } else {
            match self.recover_backup(&mapping) {
                Some(backup) => backup,
                None => {
                    return Err(ArtifactError::DigestMismatch {
                        expected: digest,
                        got: mapping.model_sha256().to_string(),
                    })
                }
            }
        };

        let model = LbphModel::from_json(&bytes)?;
        if let Some(label) = model
            .labels()
            .into_iter()
            .find(|&l| mapping.resolve(l) == Resolved::Unmapped)
        {
            return Err(ArtifactError::UnmappedModelLabel(label));
        }

        tracing::info!(
            dir = %self.dir.display(),
            samples = model.sample_count(),
            labels = mapping.len(),
            trained_at = %mapping.trained_at(),
            "model artifacts loaded"
        );
        Ok((model, mapping))
    }

    /// A save interrupted between its two renames leaves the new model next
    /// to the old mapping, with the old model in the backup. Put it back.
    fn recover_backup(&self, mapping: &LabelMapping) -> Option<Vec<u8>> {
        let backup_path = self.backup_path();
        let backup = fs::read(&backup_path).ok()?;
        if sha256_hex(&backup) != mapping.model_sha256() {
            return None;
        }
        tracing::warn!(dir = %self.dir.display(), "interrupted save detected, restoring previous model");
        if let Err(e) = fs::rename(&backup_path, self.model_path()) {
            tracing::warn!(error = %e, "failed to restore previous model file");
        }
        Some(backup)
    }
}
