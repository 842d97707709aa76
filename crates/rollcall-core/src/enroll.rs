//! Enrollment capture: save face crops of one student as training samples.

use crate::detector::{DetectorError, FaceDetector};
use crate::types::StudentId;
use rollcall_hw::{is_image_file, CameraError, FrameSource};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EnrollError {
    #[error("invalid display name {0:?}")]
    InvalidName(String),
    #[error("camera: {0}")]
    Camera(#[from] CameraError),
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("failed to write {path}: {reason}")]
    Write { path: PathBuf, reason: String },
}

/// Limits of one capture run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapturePlan {
    /// Samples to save.
    pub count: usize,
    /// Give up after this many frames.
    pub max_frames: usize,
}

impl Default for CapturePlan {
    fn default() -> Self {
        Self {
            count: 30,
            max_frames: 300,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnrollReport {
    pub group_dir: PathBuf,
    pub saved: Vec<PathBuf>,
    pub frames_read: usize,
}

impl EnrollReport {
    pub fn is_complete(&self, plan: &CapturePlan) -> bool {
        self.saved.len() >= plan.count
    }
}

/// Name of the sample directory for a student.
pub fn group_dir_name(display_name: &str, student: StudentId) -> String {
    format!("{display_name}.{student}")
}

/// Capture face crops into `<training_root>/<Name>.<id>/<Name>.<id>.<k>.png`.
///
/// Uses the most confident face of each non-dark frame. Numbering continues
/// after samples already in the directory. Stops when `plan.count` samples
/// are saved, the source ends, or `plan.max_frames` frames were read.
pub fn capture_samples<S: FrameSource + ?Sized>(
    source: &mut S,
    detector: &mut dyn FaceDetector,
    training_root: &Path,
    display_name: &str,
    student: StudentId,
    plan: CapturePlan,
) -> Result<EnrollReport, EnrollError> {
    let name = display_name.trim();
    if name.is_empty() || name.contains(['/', '\\']) {
        return Err(EnrollError::InvalidName(display_name.to_string()));
    }

    let stem = group_dir_name(name, student);
    let group_dir = training_root.join(&stem);
    fs::create_dir_all(&group_dir).map_err(|e| EnrollError::Write {
        path: group_dir.clone(),
        reason: e.to_string(),
    })?;
    let mut next_index = highest_sample_index(&group_dir, &stem) + 1;

    let mut report = EnrollReport {
        group_dir: group_dir.clone(),
        saved: Vec::new(),
        frames_read: 0,
    };

    while report.saved.len() < plan.count && report.frames_read < plan.max_frames {
        let Some(frame) = source.next_frame()? else {
            tracing::warn!("capture source ended during enrollment");
            break;
        };
        report.frames_read += 1;
        if frame.is_dark {
            continue;
        }

        let faces = detector.detect(&frame.data, frame.width, frame.height)?;
        let Some(face) = faces.first() else {
            continue;
        };
        let Some(crop) = frame.crop(
            face.x.round() as i64,
            face.y.round() as i64,
            face.width.round() as i64,
            face.height.round() as i64,
        ) else {
            continue;
        };

        let path = group_dir.join(format!("{stem}.{next_index}.png"));
        crop.save(&path).map_err(|e| EnrollError::Write {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        tracing::debug!(path = %path.display(), confidence = face.confidence, "sample saved");
        next_index += 1;
        report.saved.push(path);
    }

    tracing::info!(
        %student,
        name = %name,
        saved = report.saved.len(),
        wanted = plan.count,
        frames = report.frames_read,
        "enrollment capture finished"
    );
    Ok(report)
}

/// Largest `k` among `<stem>.<k>.<ext>` images in `dir`, 0 when there are none.
fn highest_sample_index(dir: &Path, stem: &str) -> usize {
    let Ok(entries) = fs::read_dir(dir) else {
        return 0;
    };
    entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| is_image_file(p))
        .filter_map(|p| {
            let name = p.file_stem()?.to_str()?;
            let index = name.strip_prefix(stem)?.strip_prefix('.')?;
            index.parse::<usize>().ok()
        })
        .max()
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{
        band_face, dark_frame, diagonal_face, face_box, frame_with, FixedDetector, ScriptedSource,
    };
    use crate::training::scan_sample_dir;

    #[test]
    fn test_captures_requested_samples() {
        let root = tempfile::tempdir().unwrap();
        let mut source = ScriptedSource::new(vec![
            dark_frame(0),
            frame_with(&band_face(0), 1),
            frame_with(&band_face(1), 2),
            frame_with(&band_face(2), 3),
        ]);
        let mut detector = FixedDetector(vec![face_box()]);
        let plan = CapturePlan {
            count: 2,
            max_frames: 10,
        };

        let report = capture_samples(
            &mut source,
            &mut detector,
            root.path(),
            "Ann Lee",
            StudentId(12),
            plan,
        )
        .unwrap();
        assert!(report.is_complete(&plan));
        assert_eq!(report.frames_read, 3);
        assert_eq!(
            report.saved[1].file_name().unwrap().to_str().unwrap(),
            "Ann Lee.12.2.png"
        );
        let saved = image::open(&report.saved[0]).unwrap().to_luma8();
        assert_eq!(saved, band_face(0));

        let groups = scan_sample_dir(root.path()).unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].student, StudentId(12));
        assert_eq!(groups[0].samples.len(), 2);
    }

    #[test]
    fn test_numbering_continues_and_stops_at_end_of_stream() {
        let root = tempfile::tempdir().unwrap();
        let mut detector = FixedDetector(vec![face_box()]);
        let plan = CapturePlan {
            count: 5,
            max_frames: 10,
        };
        for _ in 0..2 {
            let mut source = ScriptedSource::new(vec![frame_with(&band_face(0), 0)]);
            let report =
                capture_samples(&mut source, &mut detector, root.path(), "Bo", StudentId(3), plan)
                    .unwrap();
            assert!(!report.is_complete(&plan));
        }
        assert!(root.path().join("Bo.3").join("Bo.3.2.png").exists());
    }

    #[test]
    fn test_numbering_skips_past_gaps() {
        let root = tempfile::tempdir().unwrap();
        let group = root.path().join("Bo.3");
        std::fs::create_dir_all(&group).unwrap();
        for k in [1, 3] {
            band_face(k).save(group.join(format!("Bo.3.{k}.png"))).unwrap();
        }
        let third = std::fs::read(group.join("Bo.3.3.png")).unwrap();

        let mut source = ScriptedSource::new(vec![frame_with(&diagonal_face(0), 0)]);
        let report = capture_samples(
            &mut source,
            &mut FixedDetector(vec![face_box()]),
            root.path(),
            "Bo",
            StudentId(3),
            CapturePlan {
                count: 1,
                max_frames: 1,
            },
        )
        .unwrap();

        assert_eq!(report.saved, vec![group.join("Bo.3.4.png")]);
        assert_eq!(std::fs::read(group.join("Bo.3.3.png")).unwrap(), third);
    }

    #[test]
    fn test_index_ignores_foreign_files() {
        let root = tempfile::tempdir().unwrap();
        for name in ["Bo.3.2.png", "Bo.3.9.txt", "Bob.3.7.png", "Bo.3.x.png"] {
            std::fs::write(root.path().join(name), b"").unwrap();
        }
        assert_eq!(highest_sample_index(root.path(), "Bo.3"), 2);
        assert_eq!(highest_sample_index(&root.path().join("absent"), "Bo.3"), 0);
    }

    #[test]
    fn test_no_faces_respects_frame_budget() {
        let root = tempfile::tempdir().unwrap();
        let frames = (0..20).map(|i| frame_with(&band_face(0), i)).collect();
        let mut source = ScriptedSource::new(frames);
        let mut detector = FixedDetector(vec![]);
        let report = capture_samples(
            &mut source,
            &mut detector,
            root.path(),
            "Cy",
            StudentId(4),
            CapturePlan {
                count: 1,
                max_frames: 5,
            },
        )
        .unwrap();
        assert!(report.saved.is_empty());
        assert_eq!(report.frames_read, 5);
    }

    #[test]
    fn test_rejects_path_like_names() {
        let root = tempfile::tempdir().unwrap();
        let mut source = ScriptedSource::new(vec![]);
        let mut detector = FixedDetector(vec![]);
        let err = capture_samples(
            &mut source,
            &mut detector,
            root.path(),
            "../etc",
            StudentId(1),
            CapturePlan::default(),
        )
        .unwrap_err();
        assert!(matches!(err, EnrollError::InvalidName(_)));
    }
}
