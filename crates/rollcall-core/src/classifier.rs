//! Frame classifier: face detection plus LBPH identification.

use crate::artifacts::{ArtifactError, ModelArtifacts};
use crate::detector::{DetectorError, FaceDetector};
use crate::labels::{LabelMapping, Resolved};
use crate::lbph::{LbphError, LbphModel};
use crate::types::{BoundingBox, Prediction, StudentId};
use image::GrayImage;
use rollcall_hw::Frame;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClassifierError {
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error(transparent)]
    Model(#[from] LbphError),
    #[error(transparent)]
    Artifacts(#[from] ArtifactError),
}

/// A detected face and its grayscale crop.
#[derive(Debug, Clone)]
pub struct FaceRegion {
    pub bbox: BoundingBox,
    pub image: GrayImage,
}

/// How a single face region was judged.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RegionOutcome {
    /// Mapped to a student with a score under the threshold.
    Matched { student: StudentId, score: f64 },
    /// The predicted label is not in the mapping.
    Unknown { label: u32, score: f64 },
    /// Mapped, but the score did not clear the threshold.
    LowConfidence { student: StudentId, score: f64 },
}

/// Judge a prediction. Accepts only when `distance < threshold`.
pub fn accept(prediction: Prediction, mapping: &LabelMapping, threshold: f64) -> RegionOutcome {
    let score = prediction.distance;
    match mapping.resolve(prediction.label) {
        Resolved::Unmapped => RegionOutcome::Unknown {
            label: prediction.label,
            score,
        },
        Resolved::Student(student) if score < threshold => RegionOutcome::Matched { student, score },
        Resolved::Student(student) => RegionOutcome::LowConfidence { student, score },
    }
}

pub struct FrameClassifier {
    detector: Box<dyn FaceDetector>,
    model: LbphModel,
}

impl FrameClassifier {
    pub fn new(detector: Box<dyn FaceDetector>, model: LbphModel) -> Self {
        Self { detector, model }
    }

    /// Load the trained pair and build a classifier around `detector`.
    pub fn load(
        detector: Box<dyn FaceDetector>,
        artifacts: &ModelArtifacts,
    ) -> Result<(Self, LabelMapping), ClassifierError> {
        let (model, mapping) = artifacts.load()?;
        Ok((Self::new(detector, model), mapping))
    }

    /// Detect faces and crop them out of `frame`.
    ///
    /// Boxes are clamped to the frame. A box that clamps to nothing, or to a
    /// crop too small for the LBPH grid, is dropped.
    pub fn detect_faces(&mut self, frame: &Frame) -> Result<Vec<FaceRegion>, ClassifierError> {
        let boxes = self.detector.detect(&frame.data, frame.width, frame.height)?;
        let (min_w, min_h) = self.model.params().min_region();

        let mut regions = Vec::with_capacity(boxes.len());
        for bbox in boxes {
            let crop = frame.crop(
                bbox.x.round() as i64,
                bbox.y.round() as i64,
                bbox.width.round() as i64,
                bbox.height.round() as i64,
            );
            match crop {
                Some(image) if image.width() >= min_w && image.height() >= min_h => {
                    regions.push(FaceRegion { bbox, image });
                }
                _ => tracing::debug!(?bbox, seq = frame.sequence, "dropping unusable face box"),
            }
        }
        Ok(regions)
    }

    pub fn predict(&self, region: &GrayImage) -> Result<Prediction, LbphError> {
        self.model.predict(region)
    }
}
