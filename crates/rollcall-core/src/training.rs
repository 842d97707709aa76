//! Training pipeline: labelled sample groups in, model/mapping pair out.

use crate::artifacts::{sha256_hex, ArtifactError, ModelArtifacts};
use crate::directory::{StoreError, StudentDirectory};
use crate::labels::LabelMapping;
use crate::lbph::{spatial_histogram, LbphError, LbphModel, LbphParams};
use crate::types::StudentId;
use chrono::Utc;
use image::GrayImage;
use rollcall_hw::is_image_file;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TrainingError {
    #[error("no usable training samples (enroll students first)")]
    NoTrainingData,
    #[error("failed to read sample {sample}: {reason}")]
    SampleRead { sample: String, reason: String },
    #[error("cannot scan training directory {path}: {source}")]
    Scan {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("student lookup failed: {0}")]
    Directory(#[from] StoreError),
    #[error("model: {0}")]
    Model(#[from] LbphError),
    #[error(transparent)]
    Artifacts(#[from] ArtifactError),
}

/// One training image: a file on disk or an already decoded region.
#[derive(Debug, Clone)]
pub enum Sample {
    File(PathBuf),
    Image(GrayImage),
}

impl Sample {
    fn decode(&self) -> Result<GrayImage, TrainingError> {
        match self {
            Sample::Image(image) => Ok(image.clone()),
            Sample::File(path) => image::open(path)
                .map(|img| img.to_luma8())
                .map_err(|e| TrainingError::SampleRead {
                    sample: path.display().to_string(),
                    reason: e.to_string(),
                }),
        }
    }

    fn describe(&self) -> String {
        match self {
            Sample::File(path) => path.display().to_string(),
            Sample::Image(image) => format!("<{}x{} image>", image.width(), image.height()),
        }
    }
}

/// Samples of one identity, as enrolled.
#[derive(Debug, Clone)]
pub struct SampleGroup {
    pub display_name: String,
    pub student: StudentId,
    pub samples: Vec<Sample>,
}

/// Parse `"<display name>.<student id>"`, splitting at the last dot.
pub fn parse_group_name(name: &str) -> Option<(String, StudentId)> {
    let (display, id) = name.rsplit_once('.')?;
    if display.is_empty() {
        return None;
    }
    let id = id.parse::<i64>().ok()?;
    Some((display.to_string(), StudentId(id)))
}

/// Enumerate sample groups under `root`, one per `<Name>.<id>` directory.
pub fn scan_sample_dir(root: &Path) -> Result<Vec<SampleGroup>, TrainingError> {
    let scan_err = |source| TrainingError::Scan {
        path: root.to_path_buf(),
        source,
    };

    let mut groups = Vec::new();
    for entry in fs::read_dir(root).map_err(scan_err)? {
        let path = entry.map_err(scan_err)?.path();
        if !path.is_dir() {
            continue;
        }
        let Some((display_name, student)) = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(parse_group_name)
        else {
            tracing::warn!(dir = %path.display(), "skipping directory not named <name>.<student id>");
            continue;
        };

        let mut files: Vec<PathBuf> = fs::read_dir(&path)
            .map_err(|source| TrainingError::Scan {
                path: path.clone(),
                source,
            })?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && is_image_file(p))
            .collect();
        files.sort();

        groups.push(SampleGroup {
            display_name,
            student,
            samples: files.into_iter().map(Sample::File).collect(),
        });
    }
    Ok(groups)
}

/// Counters of one training run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrainingReport {
    pub samples: usize,
    pub identities: usize,
    /// Groups whose student does not exist (or is inactive).
    pub skipped_groups: usize,
    pub unreadable_samples: usize,
}

#[derive(Debug)]
pub struct TrainingOutcome {
    pub model: LbphModel,
    pub mapping: LabelMapping,
    pub report: TrainingReport,
}

pub struct Trainer<'a> {
    directory: &'a dyn StudentDirectory,
    params: LbphParams,
}

impl<'a> Trainer<'a> {
    pub fn new(directory: &'a dyn StudentDirectory) -> Self {
        Self {
            directory,
            params: LbphParams::default(),
        }
    }

    /// Build a fresh model and label mapping from `groups`.
    ///
    /// Labels are dense and follow `(display_name, student)` order, so the
    /// result does not depend on the order groups are given in.
    pub fn train(&self, mut groups: Vec<SampleGroup>) -> Result<TrainingOutcome, TrainingError> {
        self.params.validate()?;
        groups.sort_by(|a, b| {
            (a.display_name.as_str(), a.student).cmp(&(b.display_name.as_str(), b.student))
        });

        let mut report = TrainingReport::default();
        let mut order: Vec<StudentId> = Vec::new();
        let mut labels: BTreeMap<StudentId, u32> = BTreeMap::new();
        let mut entries: Vec<(Vec<f32>, u32)> = Vec::new();

        for group in &groups {
            match self.directory.get_student(group.student)? {
                Some(record) if record.active => {}
                _ => {
                    tracing::warn!(
                        name = %group.display_name,
                        student = %group.student,
                        "no active student record, skipping sample group"
                    );
                    report.skipped_groups += 1;
                    continue;
                }
            }

            let mut histograms = Vec::with_capacity(group.samples.len());
            for sample in &group.samples {
                let histogram = sample.decode().and_then(|image| {
                    spatial_histogram(&self.params, &image).map_err(|e| TrainingError::SampleRead {
                        sample: sample.describe(),
                        reason: e.to_string(),
                    })
                });
                match histogram {
                    Ok(h) => histograms.push(h),
                    Err(e) => {
                        tracing::warn!(student = %group.student, error = %e, "skipping unreadable sample");
                        report.unreadable_samples += 1;
                    }
                }
            }
            if histograms.is_empty() {
                continue;
            }

            let label = *labels.entry(group.student).or_insert_with(|| {
                order.push(group.student);
                order.len() as u32 - 1
            });
            report.samples += histograms.len();
            entries.extend(histograms.into_iter().map(|h| (h, label)));
        }

        if entries.is_empty() {
            return Err(TrainingError::NoTrainingData);
        }
        report.identities = order.len();

        let model = LbphModel::from_histograms(self.params, entries)?;
        let digest = sha256_hex(&model.to_json().map_err(ArtifactError::from)?);
        let mapping = LabelMapping::assign(digest, Utc::now(), order);

        tracing::info!(
            samples = report.samples,
            identities = report.identities,
            skipped_groups = report.skipped_groups,
            unreadable = report.unreadable_samples,
            "training complete"
        );
        Ok(TrainingOutcome {
            model,
            mapping,
            report,
        })
    }

    /// Train, then replace the pair in `artifacts`. Nothing is written on
    /// failure.
    pub fn train_and_save(
        &self,
        groups: Vec<SampleGroup>,
        artifacts: &ModelArtifacts,
    ) -> Result<TrainingReport, TrainingError> {
        let outcome = self.train(groups)?;
        artifacts.save(&outcome.model, &outcome.mapping)?;
        Ok(outcome.report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::MemoryStore;
    use crate::labels::Resolved;
    use crate::test_support::{band_face, diagonal_face};
    use crate::types::StudentRecord;

    fn student(id: i64, name: &str) -> StudentRecord {
        StudentRecord {
            id: StudentId(id),
            code: format!("S-{id}"),
            name: name.into(),
            email: String::new(),
            department: "EE".into(),
            active: true,
        }
    }

    fn group(name: &str, id: i64, faces: Vec<GrayImage>) -> SampleGroup {
        SampleGroup {
            display_name: name.into(),
            student: StudentId(id),
            samples: faces.into_iter().map(Sample::Image).collect(),
        }
    }

    #[test]
    fn test_parse_group_name() {
        assert_eq!(
            parse_group_name("Alice.17"),
            Some(("Alice".to_string(), StudentId(17)))
        );
        assert_eq!(
            parse_group_name("J. R. Smith.4"),
            Some(("J. R. Smith".to_string(), StudentId(4)))
        );
        assert_eq!(parse_group_name("Alice"), None);
        assert_eq!(parse_group_name("Alice.x"), None);
        assert_eq!(parse_group_name(".5"), None);
    }

    #[test]
    fn test_labels_follow_sorted_groups() {
        let store = MemoryStore::with_students([student(17, "Zoe"), student(4, "Adam")]);
        let outcome = Trainer::new(&store)
            .train(vec![
                group("Zoe", 17, vec![diagonal_face(0)]),
                group("Adam", 4, vec![band_face(0), band_face(1)]),
            ])
            .unwrap();

        assert_eq!(outcome.mapping.resolve(0), Resolved::Student(StudentId(4)));
        assert_eq!(outcome.mapping.resolve(1), Resolved::Student(StudentId(17)));
        assert_eq!(outcome.report.samples, 3);
        assert_eq!(outcome.report.identities, 2);
        assert_eq!(
            outcome.mapping.model_sha256(),
            sha256_hex(&outcome.model.to_json().unwrap())
        );
    }

    #[test]
    fn test_unresolved_groups_are_dropped() {
        let store = MemoryStore::with_students([student(1, "Ann")]);
        let outcome = Trainer::new(&store)
            .train(vec![
                group("Ann", 1, vec![band_face(0)]),
                group("Ghost", 99, vec![diagonal_face(0)]),
            ])
            .unwrap();
        assert_eq!(outcome.report.skipped_groups, 1);
        assert_eq!(outcome.mapping.len(), 1);
        assert_eq!(outcome.mapping.label_of(StudentId(99)), None);
    }

    #[test]
    fn test_unreadable_samples_are_skipped() {
        let store = MemoryStore::with_students([student(1, "Ann"), student(2, "Ben")]);
        let outcome = Trainer::new(&store)
            .train(vec![
                group("Ann", 1, vec![band_face(0), GrayImage::new(3, 3)]),
                SampleGroup {
                    display_name: "Ben".into(),
                    student: StudentId(2),
                    samples: vec![Sample::File("/nonexistent/Ben.2.1.png".into())],
                },
            ])
            .unwrap();
        assert_eq!(outcome.report.unreadable_samples, 2);
        assert_eq!(outcome.report.samples, 1);
        // Ben contributed nothing readable, so he gets no label.
        assert_eq!(outcome.mapping.len(), 1);
        assert_eq!(outcome.mapping.label_of(StudentId(2)), None);
    }

    #[test]
    fn test_same_student_in_two_groups_shares_a_label() {
        let store = MemoryStore::with_students([student(3, "Cy")]);
        let outcome = Trainer::new(&store)
            .train(vec![
                group("Cy", 3, vec![band_face(0)]),
                group("Cyrus", 3, vec![band_face(1)]),
            ])
            .unwrap();
        assert_eq!(outcome.mapping.len(), 1);
        assert_eq!(outcome.model.labels(), vec![0]);
        assert_eq!(outcome.report.samples, 2);
    }

    #[test]
    fn test_no_training_data() {
        let store = MemoryStore::new();
        let err = Trainer::new(&store)
            .train(vec![group("Nobody", 5, vec![band_face(0)])])
            .unwrap_err();
        assert!(matches!(err, TrainingError::NoTrainingData));
        assert!(matches!(
            Trainer::new(&store).train(vec![]),
            Err(TrainingError::NoTrainingData)
        ));
    }

    #[test]
    fn test_scan_sample_dir() {
        let root = tempfile::tempdir().unwrap();
        let alice = root.path().join("Alice B.7");
        fs::create_dir(&alice).unwrap();
        band_face(1).save(alice.join("Alice B.7.2.png")).unwrap();
        band_face(0).save(alice.join("Alice B.7.1.png")).unwrap();
        fs::write(alice.join("notes.txt"), b"x").unwrap();
        fs::create_dir(root.path().join("misc")).unwrap();
        fs::write(root.path().join("stray.png"), b"x").unwrap();

        let groups = scan_sample_dir(root.path()).unwrap();
        assert_eq!(groups.len(), 1);
        let g = &groups[0];
        assert_eq!(g.display_name, "Alice B");
        assert_eq!(g.student, StudentId(7));
        let names: Vec<_> = g
            .samples
            .iter()
            .map(|s| match s {
                Sample::File(p) => p.file_name().unwrap().to_string_lossy().into_owned(),
                Sample::Image(_) => unreachable!(),
            })
            .collect();
        assert_eq!(names, vec!["Alice B.7.1.png", "Alice B.7.2.png"]);
    }

    #[test]
    fn test_failed_training_keeps_prior_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let artifacts = ModelArtifacts::new(dir.path());
        let store = MemoryStore::with_students([student(1, "Ann")]);
        let trainer = Trainer::new(&store);
        trainer
            .train_and_save(vec![group("Ann", 1, vec![band_face(0)])], &artifacts)
            .unwrap();
        let before = fs::read(artifacts.model_path()).unwrap();

        assert!(matches!(
            trainer.train_and_save(vec![], &artifacts),
            Err(TrainingError::NoTrainingData)
        ));
        assert_eq!(fs::read(artifacts.model_path()).unwrap(), before);
        assert!(artifacts.load().is_ok());
    }
}
