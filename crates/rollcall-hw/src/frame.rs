//! Frame type, the `FrameSource` capture contract, and pixel helpers.

use image::GrayImage;
use std::time::Instant;

/// Fraction of near-black pixels above which a frame counts as dark.
pub const DARK_FRAME_RATIO: f32 = 0.95;

/// A captured grayscale video frame.
#[derive(Clone)]
pub struct Frame {
    /// Grayscale pixel data (width * height bytes, row-major).
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub timestamp: Instant,
    pub sequence: u32,
    pub is_dark: bool,
}

impl Frame {
    /// Wrap a decoded grayscale image as a frame.
    pub fn from_gray(image: GrayImage, sequence: u32) -> Self {
        let (width, height) = image.dimensions();
        let data = image.into_raw();
        let is_dark = is_dark_frame(&data, DARK_FRAME_RATIO);
        Self {
            data,
            width,
            height,
            timestamp: Instant::now(),
            sequence,
            is_dark,
        }
    }

    /// Copy out the rectangle `(x, y, width, height)`, clamped to the frame.
    ///
    /// Returns `None` when the clamped rectangle is empty or the pixel buffer
    /// does not match the declared dimensions.
    pub fn crop(&self, x: i64, y: i64, width: i64, height: i64) -> Option<GrayImage> {
        if self.data.len() != (self.width as usize) * (self.height as usize) {
            return None;
        }
        let x0 = x.clamp(0, self.width as i64);
        let y0 = y.clamp(0, self.height as i64);
        let x1 = x.saturating_add(width).clamp(0, self.width as i64);
        let y1 = y.saturating_add(height).clamp(0, self.height as i64);
        if x1 <= x0 || y1 <= y0 {
            return None;
        }

        let (cw, ch) = ((x1 - x0) as u32, (y1 - y0) as u32);
        let stride = self.width as usize;
        let mut out = Vec::with_capacity((cw * ch) as usize);
        for row in y0 as usize..y1 as usize {
            let start = row * stride + x0 as usize;
            out.extend_from_slice(&self.data[start..start + cw as usize]);
        }
        GrayImage::from_raw(cw, ch, out)
    }
}

/// A producer of frames for a recognition run.
///
/// `Ok(None)` signals a clean end of stream. Dropping the source releases the
/// underlying device.
pub trait FrameSource: Send {
    fn next_frame(&mut self) -> Result<Option<Frame>, crate::CameraError>;
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn next_frame(&mut self) -> Result<Option<Frame>, crate::CameraError> {
        (**self).next_frame()
    }
}

/// Convert packed YUYV (4:2:2) to grayscale by keeping the Y samples.
///
/// YUYV packs two pixels per 4 bytes: [Y0, U, Y1, V].
pub fn yuyv_to_grayscale(yuyv: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let expected = (width * height * 2) as usize;
    if yuyv.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: yuyv.len(),
        });
    }
    Ok(yuyv[..expected].iter().step_by(2).copied().collect())
}

/// True if more than `threshold_pct` of the pixels fall below 32.
pub fn is_dark_frame(gray: &[u8], threshold_pct: f32) -> bool {
    if gray.is_empty() {
        return true;
    }
    let dark = gray.iter().filter(|&&p| p < 32).count();
    (dark as f32 / gray.len() as f32) > threshold_pct
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid YUYV length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient_frame(w: u32, h: u32) -> Frame {
        let img = GrayImage::from_fn(w, h, |x, y| image::Luma([(x + y * w) as u8]));
        Frame::from_gray(img, 0)
    }

    #[test]
    fn test_yuyv_to_grayscale() {
        let yuyv = vec![100, 128, 200, 128];
        let gray = yuyv_to_grayscale(&yuyv, 2, 1).unwrap();
        assert_eq!(gray, vec![100, 200]);
    }

    #[test]
    fn test_yuyv_invalid_length() {
        assert!(yuyv_to_grayscale(&[100, 128], 2, 1).is_err());
    }

    #[test]
    fn test_dark_frame_detection() {
        assert!(is_dark_frame(&[0u8; 1000], DARK_FRAME_RATIO));
        assert!(!is_dark_frame(&[128u8; 1000], DARK_FRAME_RATIO));
        assert!(is_dark_frame(&[], DARK_FRAME_RATIO));

        let mut mostly_dark = vec![10u8; 960];
        mostly_dark.extend(vec![128u8; 40]);
        assert!(is_dark_frame(&mostly_dark, DARK_FRAME_RATIO));
    }

    #[test]
    fn test_crop_inside() {
        let frame = gradient_frame(8, 8);
        let crop = frame.crop(2, 3, 4, 2).unwrap();
        assert_eq!(crop.dimensions(), (4, 2));
        assert_eq!(crop.get_pixel(0, 0).0[0], (2 + 3 * 8) as u8);
        assert_eq!(crop.get_pixel(3, 1).0[0], (5 + 4 * 8) as u8);
    }

    #[test]
    fn test_crop_clamps_to_frame() {
        let frame = gradient_frame(8, 8);
        let crop = frame.crop(-3, 6, 5, 10).unwrap();
        assert_eq!(crop.dimensions(), (2, 2));
    }

    #[test]
    fn test_crop_outside_is_none() {
        let frame = gradient_frame(8, 8);
        assert!(frame.crop(20, 20, 4, 4).is_none());
        assert!(frame.crop(2, 2, 0, 4).is_none());
    }
}
