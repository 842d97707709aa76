//! Face detection.
//!
//! `FaceDetector` is the seam the recognition loop detects through. The
//! shipped implementation runs SCRFD via ONNX Runtime: letterboxed input,
//! 3-stride anchor decoding, NMS, then a minimum-size filter relative to the
//! frame (faces smaller than a tenth of the frame are ignored by default).

use crate::types::BoundingBox;
use image::imageops::{self, FilterType};
use image::GrayImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const SCRFD_INPUT_SIZE: u32 = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("frame buffer is {actual} bytes, expected {expected}")]
    BadFrame { expected: usize, actual: usize },
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Tunable detection parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectorConfig {
    /// Minimum detector score for a candidate face.
    pub score_threshold: f32,
    /// IoU above which overlapping candidates are suppressed.
    pub nms_threshold: f32,
    /// Minimum face width/height as a fraction of the frame width/height.
    pub min_face_fraction: f32,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            score_threshold: 0.5,
            nms_threshold: 0.4,
            min_face_fraction: 0.1,
        }
    }
}

/// Locates candidate face regions in a grayscale frame.
pub trait FaceDetector: Send {
    /// Detect faces, returning boxes sorted by descending confidence.
    fn detect(&mut self, gray: &[u8], width: u32, height: u32)
        -> Result<Vec<BoundingBox>, DetectorError>;
}

impl<D: FaceDetector + ?Sized> FaceDetector for Box<D> {
    fn detect(
        &mut self,
        gray: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Vec<BoundingBox>, DetectorError> {
        (**self).detect(gray, width, height)
    }
}

/// Letterbox placement of the frame inside the square network input.
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

impl Letterbox {
    fn fit(width: u32, height: u32, target: u32) -> Self {
        let scale = (target as f32 / width as f32).min(target as f32 / height as f32);
        let new_w = (width as f32 * scale).round();
        let new_h = (height as f32 * scale).round();
        Self {
            scale,
            pad_x: ((target as f32 - new_w) / 2.0).floor(),
            pad_y: ((target as f32 - new_h) / 2.0).floor(),
        }
    }

    /// Map a point from network input space back to frame space.
    fn unmap(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// SCRFD face detector (ONNX).
pub struct ScrfdDetector {
    session: Session,
    config: DetectorConfig,
    /// Per-stride (score, bbox) output indices, discovered at load time.
    stride_outputs: [(usize, usize); 3],
}

impl ScrfdDetector {
    pub fn load(model_path: &Path, config: DetectorConfig) -> Result<Self, DetectorError> {
        if !model_path.exists() {
            return Err(DetectorError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> =
            session.outputs().iter().map(|o| o.name().to_string()).collect();
        if output_names.len() < 6 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD model needs score and bbox outputs for 3 strides, got {} outputs",
                output_names.len()
            )));
        }
        let stride_outputs = discover_outputs(&output_names);

        tracing::info!(
            path = %model_path.display(),
            outputs = ?output_names,
            ?stride_outputs,
            "loaded SCRFD detector"
        );

        Ok(Self {
            session,
            config,
            stride_outputs,
        })
    }

    fn preprocess(&self, frame: GrayImage) -> (Array4<f32>, Letterbox) {
        let (width, height) = frame.dimensions();
        let letterbox = Letterbox::fit(width, height, SCRFD_INPUT_SIZE);
        let new_w = ((width as f32 * letterbox.scale).round() as u32).max(1);
        let new_h = ((height as f32 * letterbox.scale).round() as u32).max(1);
        let resized = imageops::resize(&frame, new_w, new_h, FilterType::Triangle);

        let size = SCRFD_INPUT_SIZE as usize;
        // Padding is filled with the mean so it normalises to zero.
        let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
        let (px, py) = (letterbox.pad_x as u32, letterbox.pad_y as u32);
        for (x, y, pixel) in resized.enumerate_pixels() {
            let (tx, ty) = ((x + px) as usize, (y + py) as usize);
            if tx >= size || ty >= size {
                continue;
            }
            let v = (pixel.0[0] as f32 - SCRFD_MEAN) / SCRFD_STD;
            for c in 0..3 {
                tensor[[0, c, ty, tx]] = v;
            }
        }

        (tensor, letterbox)
    }
}

impl FaceDetector for ScrfdDetector {
    fn detect(
        &mut self,
        gray: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Vec<BoundingBox>, DetectorError> {
        let expected = width as usize * height as usize;
        let frame = GrayImage::from_raw(width, height, gray.to_vec()).ok_or(
            DetectorError::BadFrame {
                expected,
                actual: gray.len(),
            },
        )?;
        let (input, letterbox) = self.preprocess(frame);

        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (pos, &stride) in SCRFD_STRIDES.iter().enumerate() {
            let (score_idx, bbox_idx) = self.stride_outputs[pos];
            let (_, scores) = outputs[score_idx].try_extract_tensor::<f32>().map_err(|e| {
                DetectorError::InferenceFailed(format!("scores stride {stride}: {e}"))
            })?;
            let (_, boxes) = outputs[bbox_idx].try_extract_tensor::<f32>().map_err(|e| {
                DetectorError::InferenceFailed(format!("bboxes stride {stride}: {e}"))
            })?;
            candidates.extend(decode_stride(
                scores,
                boxes,
                stride,
                &letterbox,
                self.config.score_threshold,
            ));
        }

        let kept = nms(candidates, self.config.nms_threshold);
        let faces = filter_small(kept, width, height, self.config.min_face_fraction);
        tracing::debug!(faces = faces.len(), "SCRFD detection");
        Ok(faces)
    }
}

/// Find score/bbox outputs by name ("score_8", "bbox_8", ...), falling back
/// to the standard positional layout [scores 8/16/32, bboxes 8/16/32, ...].
fn discover_outputs(names: &[String]) -> [(usize, usize); 3] {
    let find = |prefix: &str, stride: usize| {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| *n == target)
    };

    let named: Option<Vec<(usize, usize)>> = SCRFD_STRIDES
        .iter()
        .map(|&s| Some((find("score", s)?, find("bbox", s)?)))
        .collect();

    match named.as_deref() {
        Some(&[a, b, c]) => [a, b, c],
        _ => [(0, 3), (1, 4), (2, 5)],
    }
}

/// Decode the anchors of one stride that score above `threshold`.
fn decode_stride(
    scores: &[f32],
    boxes: &[f32],
    stride: usize,
    letterbox: &Letterbox,
    threshold: f32,
) -> Vec<BoundingBox> {
    let grid = SCRFD_INPUT_SIZE as usize / stride;
    let anchors = grid * grid * SCRFD_ANCHORS_PER_CELL;
    let step = stride as f32;

    (0..anchors)
        .filter_map(|idx| {
            let score = *scores.get(idx)?;
            if score <= threshold {
                return None;
            }
            let offsets = boxes.get(idx * 4..idx * 4 + 4)?;
            let cell = idx / SCRFD_ANCHORS_PER_CELL;
            let ax = (cell % grid) as f32 * step;
            let ay = (cell / grid) as f32 * step;

            let (x1, y1) = letterbox.unmap(ax - offsets[0] * step, ay - offsets[1] * step);
            let (x2, y2) = letterbox.unmap(ax + offsets[2] * step, ay + offsets[3] * step);
            Some(BoundingBox {
                x: x1,
                y: y1,
                width: x2 - x1,
                height: y2 - y1,
                confidence: score,
            })
        })
        .collect()
}

/// Greedy non-maximum suppression; output is sorted by descending confidence.
pub fn nms(mut boxes: Vec<BoundingBox>, iou_threshold: f32) -> Vec<BoundingBox> {
    boxes.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut kept: Vec<BoundingBox> = Vec::new();
    for candidate in boxes {
        if kept.iter().all(|k| iou(k, &candidate) <= iou_threshold) {
            kept.push(candidate);
        }
    }
    kept
}

/// Drop faces narrower or shorter than `fraction` of the frame.
fn filter_small(
    boxes: Vec<BoundingBox>,
    width: u32,
    height: u32,
    fraction: f32,
) -> Vec<BoundingBox> {
    let min_w = width as f32 * fraction;
    let min_h = height as f32 * fraction;
    boxes
        .into_iter()
        .filter(|b| b.width >= min_w && b.height >= min_h)
        .collect()
}

fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let inter_w = ((a.x + a.width).min(b.x + b.width) - a.x.max(b.x)).max(0.0);
    let inter_h = ((a.y + a.height).min(b.y + b.height) - a.y.max(b.y)).max(0.0);
    let inter = inter_w * inter_h;
    let union = a.width * a.height + b.width * b.height - inter;
    if union > 0.0 {
        inter / union
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bbox(x: f32, y: f32, w: f32, h: f32, confidence: f32) -> BoundingBox {
        BoundingBox {
            x,
            y,
            width: w,
            height: h,
            confidence,
        }
    }

    #[test]
    fn test_iou() {
        let a = bbox(0.0, 0.0, 10.0, 10.0, 1.0);
        assert!((iou(&a, &a) - 1.0).abs() < 1e-6);
        assert!(iou(&a, &bbox(20.0, 20.0, 10.0, 10.0, 1.0)).abs() < 1e-6);
        // 5x10 overlap over a 150 union
        let partial = iou(&a, &bbox(5.0, 0.0, 10.0, 10.0, 1.0));
        assert!((partial - 50.0 / 150.0).abs() < 1e-6);
    }

    #[test]
    fn test_nms_keeps_best_of_overlapping() {
        let kept = nms(
            vec![
                bbox(5.0, 5.0, 100.0, 100.0, 0.8),
                bbox(200.0, 200.0, 50.0, 50.0, 0.7),
                bbox(0.0, 0.0, 100.0, 100.0, 0.9),
            ],
            0.4,
        );
        assert_eq!(kept.len(), 2);
        assert!((kept[0].confidence - 0.9).abs() < 1e-6);
        assert!((kept[1].confidence - 0.7).abs() < 1e-6);
        assert!(nms(vec![], 0.4).is_empty());
    }

    #[test]
    fn test_filter_small_uses_frame_fraction() {
        let boxes = vec![
            bbox(0.0, 0.0, 64.0, 48.0, 0.9),
            bbox(0.0, 0.0, 63.0, 80.0, 0.9),
            bbox(0.0, 0.0, 100.0, 47.0, 0.9),
        ];
        let kept = filter_small(boxes, 640, 480, 0.1);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].width, 64.0);
    }

    #[test]
    fn test_letterbox_unmap_roundtrip() {
        let lb = Letterbox::fit(320, 240, SCRFD_INPUT_SIZE);
        assert!((lb.scale - 2.0).abs() < 1e-6);
        assert_eq!(lb.pad_x, 0.0);
        assert_eq!(lb.pad_y, 80.0);
        let (x, y) = lb.unmap(100.0 * lb.scale + lb.pad_x, 50.0 * lb.scale + lb.pad_y);
        assert!((x - 100.0).abs() < 1e-3 && (y - 50.0).abs() < 1e-3);
    }

    #[test]
    fn test_decode_stride_maps_back_to_frame() {
        let lb = Letterbox {
            scale: 1.0,
            pad_x: 0.0,
            pad_y: 0.0,
        };
        let grid = SCRFD_INPUT_SIZE as usize / 32;
        let anchors = grid * grid * SCRFD_ANCHORS_PER_CELL;
        let mut scores = vec![0.0f32; anchors];
        let mut boxes = vec![0.0f32; anchors * 4];
        // Anchor 2 is the first anchor of cell (1, 0): centre (32, 0).
        scores[2] = 0.9;
        boxes[8..12].copy_from_slice(&[0.5, 0.0, 1.0, 2.0]);

        let dets = decode_stride(&scores, &boxes, 32, &lb, 0.5);
        assert_eq!(dets.len(), 1);
        let d = &dets[0];
        assert!((d.x - 16.0).abs() < 1e-4);
        assert!((d.y - 0.0).abs() < 1e-4);
        assert!((d.width - 48.0).abs() < 1e-4);
        assert!((d.height - 64.0).abs() < 1e-4);
    }

    #[test]
    fn test_discover_outputs() {
        let named: Vec<String> = ["bbox_8", "score_8", "bbox_16", "score_16", "bbox_32", "score_32"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(discover_outputs(&named), [(1, 0), (3, 2), (5, 4)]);

        let numeric: Vec<String> = (0..9).map(|i: usize| i.to_string()).collect();
        assert_eq!(discover_outputs(&numeric), [(0, 3), (1, 4), (2, 5)]);
    }

    #[test]
    fn test_load_missing_model() {
        let err = ScrfdDetector::load(Path::new("/nonexistent/det.onnx"), DetectorConfig::default())
            .err()
            .unwrap();
        assert!(matches!(err, DetectorError::ModelNotFound(_)));
    }
}
