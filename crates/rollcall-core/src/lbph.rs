//! Local Binary Patterns Histograms (LBPH) face classifier.
//!
//! Each face region is encoded as circular LBP codes (bilinear-interpolated
//! neighbours), split into a grid of cells, and summarised as one normalised
//! histogram per cell. Prediction is nearest-neighbour over all training
//! histograms using the alternative chi-square distance, so the reported
//! score is a dissimilarity: 0 for an identical histogram, growing without
//! bound as regions differ.

use crate::types::Prediction;
use image::GrayImage;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use thiserror::Error;

/// Identifier written into serialized models.
pub const LBPH_FORMAT: &str = "lbph-v1";

const MAX_NEIGHBORS: u32 = 16;

/// Interpolated neighbours within this much of the centre count as equal,
/// absorbing float error in the bilinear weights.
const NEIGHBOR_TOLERANCE: f32 = 1e-3;

#[derive(Error, Debug)]
pub enum LbphError {
    #[error("invalid region: {0}")]
    InvalidRegion(String),
    #[error("cannot train on an empty sample set")]
    EmptyTrainingSet,
    #[error("model contains no samples")]
    Untrained,
    #[error("invalid LBPH parameters: {0}")]
    InvalidParams(String),
    #[error("unsupported model format {0:?}")]
    UnsupportedFormat(String),
    #[error("model is inconsistent: {0}")]
    Corrupt(String),
}

/// LBPH operator and grid parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LbphParams {
    /// Radius of the circular neighbourhood, in pixels.
    pub radius: u32,
    /// Sampling points on the circle; each cell histogram has 2^neighbors bins.
    pub neighbors: u32,
    pub grid_x: u32,
    pub grid_y: u32,
}

impl Default for LbphParams {
    fn default() -> Self {
        Self {
            radius: 1,
            neighbors: 8,
            grid_x: 8,
            grid_y: 8,
        }
    }
}

impl LbphParams {
    pub fn validate(&self) -> Result<(), LbphError> {
        if self.radius == 0 {
            return Err(LbphError::InvalidParams("radius must be at least 1".into()));
        }
        if self.neighbors == 0 || self.neighbors > MAX_NEIGHBORS {
            return Err(LbphError::InvalidParams(format!(
                "neighbors must be in 1..={MAX_NEIGHBORS}, got {}",
                self.neighbors
            )));
        }
        if self.grid_x == 0 || self.grid_y == 0 {
            return Err(LbphError::InvalidParams("grid must be at least 1x1".into()));
        }
        Ok(())
    }

    pub fn bins(&self) -> usize {
        1usize << self.neighbors
    }

    /// Length of one spatial histogram.
    pub fn histogram_len(&self) -> usize {
        self.bins() * (self.grid_x * self.grid_y) as usize
    }

    /// Smallest region (width, height) that fills every grid cell.
    pub fn min_region(&self) -> (u32, u32) {
        (2 * self.radius + self.grid_x, 2 * self.radius + self.grid_y)
    }
}

/// Trained LBPH state: one spatial histogram and label per training sample.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LbphModel {
    format: String,
    params: LbphParams,
    histograms: Vec<Vec<f32>>,
    labels: Vec<u32>,
}

impl LbphModel {
    /// Train from `(region, label)` pairs. Every region must be valid.
    pub fn train(params: LbphParams, samples: &[(GrayImage, u32)]) -> Result<Self, LbphError> {
        params.validate()?;
        let mut entries = Vec::with_capacity(samples.len());
        for (image, label) in samples {
            entries.push((spatial_histogram(&params, image)?, *label));
        }
        Self::from_histograms(params, entries)
    }

    /// Assemble a model from precomputed spatial histograms.
    pub fn from_histograms(
        params: LbphParams,
        entries: Vec<(Vec<f32>, u32)>,
    ) -> Result<Self, LbphError> {
        params.validate()?;
        if entries.is_empty() {
            return Err(LbphError::EmptyTrainingSet);
        }
        let expected = params.histogram_len();
        let (histograms, labels): (Vec<_>, Vec<_>) = entries.into_iter().unzip();
        if let Some(bad) = histograms.iter().find(|h| h.len() != expected) {
            return Err(LbphError::Corrupt(format!(
                "histogram length {} (expected {expected})",
                bad.len()
            )));
        }
        Ok(Self {
            format: LBPH_FORMAT.to_string(),
            params,
            histograms,
            labels,
        })
    }

    pub fn params(&self) -> &LbphParams {
        &self.params
    }

    pub fn sample_count(&self) -> usize {
        self.labels.len()
    }

    /// Distinct labels present in the model, ascending.
    pub fn labels(&self) -> Vec<u32> {
        let mut labels = self.labels.clone();
        labels.sort_unstable();
        labels.dedup();
        labels
    }

    /// Predict the label of a face region and its distance to the nearest
    /// training sample.
    pub fn predict(&self, region: &GrayImage) -> Result<Prediction, LbphError> {
        if self.histograms.is_empty() {
            return Err(LbphError::Untrained);
        }
        let query = spatial_histogram(&self.params, region)?;

        let mut best = Prediction {
            label: self.labels[0],
            distance: f64::INFINITY,
        };
        for (hist, &label) in self.histograms.iter().zip(&self.labels) {
            let distance = chi_square_alt(hist, &query);
            if distance < best.distance {
                best = Prediction { label, distance };
            }
        }
        Ok(best)
    }

    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, LbphError> {
        let model: LbphModel =
            serde_json::from_slice(bytes).map_err(|e| LbphError::Corrupt(e.to_string()))?;
        if model.format != LBPH_FORMAT {
            return Err(LbphError::UnsupportedFormat(model.format));
        }
        model.params.validate()?;
        if model.histograms.len() != model.labels.len() {
            return Err(LbphError::Corrupt(format!(
                "{} histograms for {} labels",
                model.histograms.len(),
                model.labels.len()
            )));
        }
        let expected = model.params.histogram_len();
        if model.histograms.iter().any(|h| h.len() != expected) {
            return Err(LbphError::Corrupt("histogram length mismatch".into()));
        }
        Ok(model)
    }
}

/// Compute the concatenated per-cell LBP histogram of a region.
pub fn spatial_histogram(params: &LbphParams, image: &GrayImage) -> Result<Vec<f32>, LbphError> {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return Err(LbphError::InvalidRegion("empty region".into()));
    }
    let (min_w, min_h) = params.min_region();
    if width < min_w || height < min_h {
        return Err(LbphError::InvalidRegion(format!(
            "{width}x{height} is smaller than the {min_w}x{min_h} minimum"
        )));
    }

    let codes = elbp(image, params.radius, params.neighbors);
    let cols = (width - 2 * params.radius) as usize;
    let rows = (height - 2 * params.radius) as usize;
    let cell_w = cols / params.grid_x as usize;
    let cell_h = rows / params.grid_y as usize;
    let bins = params.bins();
    let cell_pixels = (cell_w * cell_h) as f32;

    let mut histogram = vec![0f32; params.histogram_len()];
    for gy in 0..params.grid_y as usize {
        for gx in 0..params.grid_x as usize {
            let cell = &mut histogram[(gy * params.grid_x as usize + gx) * bins..][..bins];
            for y in gy * cell_h..(gy + 1) * cell_h {
                for &code in &codes[y * cols + gx * cell_w..y * cols + (gx + 1) * cell_w] {
                    cell[code as usize] += 1.0;
                }
            }
            for bin in cell.iter_mut() {
                *bin /= cell_pixels;
            }
        }
    }
    Ok(histogram)
}

/// Extended (circular) LBP codes for every pixel at least `radius` away from
/// the border. Output is `(height - 2r) x (width - 2r)`, row-major.
fn elbp(image: &GrayImage, radius: u32, neighbors: u32) -> Vec<u32> {
    let (width, height) = image.dimensions();
    let src = image.as_raw();
    let w = width as i64;
    let r = radius as i64;
    let cols = (width - 2 * radius) as usize;
    let rows = (height - 2 * radius) as usize;
    let mut codes = vec![0u32; cols * rows];

    let pixel = |y: i64, x: i64| src[(y * w + x) as usize] as f32;

    for n in 0..neighbors {
        let angle = 2.0 * PI * f64::from(n) / f64::from(neighbors);
        let x = r as f64 * angle.cos();
        let y = -(r as f64) * angle.sin();
        let (fx, fy) = (x.floor() as i64, y.floor() as i64);
        let (cx, cy) = (x.ceil() as i64, y.ceil() as i64);
        let tx = (x - fx as f64) as f32;
        let ty = (y - fy as f64) as f32;
        let w1 = (1.0 - tx) * (1.0 - ty);
        let w2 = tx * (1.0 - ty);
        let w3 = (1.0 - tx) * ty;
        let w4 = tx * ty;

        for i in r..height as i64 - r {
            for j in r..w - r {
                let t = w1 * pixel(i + fy, j + fx)
                    + w2 * pixel(i + fy, j + cx)
                    + w3 * pixel(i + cy, j + fx)
                    + w4 * pixel(i + cy, j + cx);
                let center = pixel(i, j);
                if t >= center - NEIGHBOR_TOLERANCE {
                    codes[(i - r) as usize * cols + (j - r) as usize] |= 1 << n;
                }
            }
        }
    }

    codes
}

/// Alternative chi-square distance: `2 * Σ (a - b)² / (a + b)`.
pub fn chi_square_alt(a: &[f32], b: &[f32]) -> f64 {
    let sum: f64 = a
        .iter()
        .zip(b)
        .map(|(&a, &b)| {
            let (a, b) = (f64::from(a), f64::from(b));
            let denom = a + b;
            if denom.abs() > f64::EPSILON {
                (a - b) * (a - b) / denom
            } else {
                0.0
            }
        })
        .sum();
    2.0 * sum
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{band_face, diagonal_face};
    use image::Luma;

    #[test]
    fn test_uniform_region_sets_every_bit() {
        let params = LbphParams::default();
        let image = GrayImage::from_pixel(20, 20, Luma([90]));
        let hist = spatial_histogram(&params, &image).unwrap();
        assert_eq!(hist.len(), params.histogram_len());
        // Every neighbour equals the centre, so every code is 0xFF.
        for cell in hist.chunks(params.bins()) {
            assert!((cell[255] - 1.0).abs() < 1e-6);
            assert!(cell[..255].iter().all(|&v| v == 0.0));
        }
    }

    #[test]
    fn test_cell_histograms_are_normalised() {
        let params = LbphParams::default();
        let hist = spatial_histogram(&params, &band_face(0)).unwrap();
        for cell in hist.chunks(params.bins()) {
            let total: f32 = cell.iter().sum();
            assert!((total - 1.0).abs() < 1e-4, "cell sums to {total}");
        }
    }

    #[test]
    fn test_region_too_small_is_invalid() {
        let params = LbphParams::default();
        let small = GrayImage::from_pixel(9, 30, Luma([10]));
        assert!(matches!(
            spatial_histogram(&params, &small),
            Err(LbphError::InvalidRegion(_))
        ));
        let empty = GrayImage::new(0, 0);
        assert!(matches!(
            spatial_histogram(&params, &empty),
            Err(LbphError::InvalidRegion(_))
        ));
        // Exactly the minimum is accepted.
        let (w, h) = params.min_region();
        assert!(spatial_histogram(&params, &GrayImage::new(w, h)).is_ok());
    }

    #[test]
    fn test_chi_square_properties() {
        let a = vec![0.5, 0.5, 0.0];
        let b = vec![0.0, 0.5, 0.5];
        assert_eq!(chi_square_alt(&a, &a), 0.0);
        assert!((chi_square_alt(&a, &b) - chi_square_alt(&b, &a)).abs() < 1e-12);
        // 2 * (0.25/0.5 + 0 + 0.25/0.5) = 2
        assert!((chi_square_alt(&a, &b) - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_predict_exact_sample_is_zero_distance() {
        let samples = vec![
            (band_face(0), 0),
            (band_face(1), 0),
            (diagonal_face(0), 1),
            (diagonal_face(1), 1),
        ];
        let model = LbphModel::train(LbphParams::default(), &samples).unwrap();
        assert_eq!(model.sample_count(), 4);
        assert_eq!(model.labels(), vec![0, 1]);

        let p = model.predict(&diagonal_face(1)).unwrap();
        assert_eq!(p.label, 1);
        assert!(p.distance.abs() < 1e-9);

        let p = model.predict(&band_face(0)).unwrap();
        assert_eq!(p.label, 0);
        assert!(p.distance.abs() < 1e-9);
    }

    #[test]
    fn test_predict_unseen_variant_prefers_same_texture() {
        let samples: Vec<_> = (0..4)
            .map(|i| (band_face(i), 0))
            .chain((0..4).map(|i| (diagonal_face(i), 1)))
            .collect();
        let model = LbphModel::train(LbphParams::default(), &samples).unwrap();
        assert_eq!(model.predict(&band_face(9)).unwrap().label, 0);
        assert_eq!(model.predict(&diagonal_face(9)).unwrap().label, 1);
    }

    #[test]
    fn test_predict_invalid_region() {
        let model = LbphModel::train(LbphParams::default(), &[(band_face(0), 0)]).unwrap();
        assert!(matches!(
            model.predict(&GrayImage::new(0, 0)),
            Err(LbphError::InvalidRegion(_))
        ));
    }

    #[test]
    fn test_empty_training_set() {
        assert!(matches!(
            LbphModel::train(LbphParams::default(), &[]),
            Err(LbphError::EmptyTrainingSet)
        ));
    }

    #[test]
    fn test_invalid_params() {
        let params = LbphParams {
            neighbors: 24,
            ..LbphParams::default()
        };
        assert!(matches!(params.validate(), Err(LbphError::InvalidParams(_))));
    }

    #[test]
    fn test_json_rejects_foreign_format() {
        let model = LbphModel::train(LbphParams::default(), &[(band_face(0), 3)]).unwrap();
        let mut value: serde_json::Value = serde_json::from_slice(&model.to_json().unwrap()).unwrap();
        value["format"] = serde_json::Value::String("opencv-yaml".into());
        let bytes = serde_json::to_vec(&value).unwrap();
        assert!(matches!(
            LbphModel::from_json(&bytes),
            Err(LbphError::UnsupportedFormat(_))
        ));
    }
}
