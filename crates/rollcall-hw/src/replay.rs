//! Offline frame source that replays a directory of still images.

use crate::camera::CameraError;
use crate::frame::{Frame, FrameSource};
use std::path::{Path, PathBuf};

const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

/// Feeds the images of a directory, in file-name order, as frames.
pub struct ReplaySource {
    files: Vec<PathBuf>,
    cursor: usize,
}

impl ReplaySource {
    pub fn open(dir: &Path) -> Result<Self, CameraError> {
        let entries = std::fs::read_dir(dir)
            .map_err(|e| CameraError::Replay(format!("{}: {e}", dir.display())))?;

        let mut files: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.is_file() && is_image_file(path))
            .collect();
        files.sort();

        if files.is_empty() {
            return Err(CameraError::Replay(format!(
                "{}: no .jpg/.jpeg/.png files",
                dir.display()
            )));
        }

        tracing::info!(dir = %dir.display(), frames = files.len(), "replay source opened");
        Ok(Self { files, cursor: 0 })
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

impl FrameSource for ReplaySource {
    fn next_frame(&mut self) -> Result<Option<Frame>, CameraError> {
        let Some(path) = self.files.get(self.cursor) else {
            return Ok(None);
        };
        let image = image::open(path)
            .map_err(|e| CameraError::Replay(format!("{}: {e}", path.display())))?
            .to_luma8();
        let frame = Frame::from_gray(image, self.cursor as u32);
        self.cursor += 1;
        Ok(Some(frame))
    }
}

/// True for `.jpg`, `.jpeg` and `.png` paths (case-insensitive).
pub fn is_image_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma};

    #[test]
    fn test_replays_in_name_order_then_ends() {
        let dir = tempfile::tempdir().unwrap();
        GrayImage::from_pixel(4, 4, Luma([200])).save(dir.path().join("b.png")).unwrap();
        GrayImage::from_pixel(4, 4, Luma([100])).save(dir.path().join("a.png")).unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();

        let mut source = ReplaySource::open(dir.path()).unwrap();
        assert_eq!(source.len(), 2);

        let first = source.next_frame().unwrap().unwrap();
        assert_eq!(first.data[0], 100);
        let second = source.next_frame().unwrap().unwrap();
        assert_eq!(second.data[0], 200);
        assert_eq!(second.sequence, 1);
        assert!(source.next_frame().unwrap().is_none());
    }

    #[test]
    fn test_empty_dir_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            ReplaySource::open(dir.path()),
            Err(CameraError::Replay(_))
        ));
    }

    #[test]
    fn test_image_extension_filter() {
        assert!(is_image_file(Path::new("x/Alice.3.1.JPG")));
        assert!(is_image_file(Path::new("a.png")));
        assert!(!is_image_file(Path::new("a.gif")));
        assert!(!is_image_file(Path::new("README")));
    }
}
