//! Frame sources feeding the camera workers.

use crate::sync::unix_now;
use anyhow::{Context, Result};
use image::DynamicImage;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp", "pgm", "ppm"];

/// Per-camera supplier of decoded frames
pub trait FrameSource: Send {
    fn camera_id(&self) -> &str;

    fn start_stream(&mut self) -> Result<()>;

    /// Next frame with its capture timestamp (seconds); None when no frame
    /// is available right now
    fn get_frame(&mut self) -> Option<(DynamicImage, f64)>;

    fn stop_stream(&mut self);

    /// No frame will ever come again
    fn is_finished(&self) -> bool {
        false
    }
}

/// Plays back the images of a directory in file name order
pub struct DirectoryFrameSource {
    camera_id: String,
    dir: PathBuf,
    files: Vec<PathBuf>,
    cursor: usize,
    looping: bool,
    streaming: bool,
}

impl DirectoryFrameSource {
    pub fn new(camera_id: impl Into<String>, dir: impl Into<PathBuf>, looping: bool) -> Self {
        Self {
            camera_id: camera_id.into(),
            dir: dir.into(),
            files: Vec::new(),
            cursor: 0,
            looping,
            streaming: false,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn list_images(dir: &Path) -> Result<Vec<PathBuf>> {
        let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
            .with_context(|| format!("Failed to read frame directory {}", dir.display()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.extension()
                    .and_then(|ext| ext.to_str())
                    .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
            })
            .collect();
        files.sort();
        Ok(files)
    }
}

impl FrameSource for DirectoryFrameSource {
    fn camera_id(&self) -> &str {
        &self.camera_id
    }

    fn start_stream(&mut self) -> Result<()> {
        self.files = Self::list_images(&self.dir)?;
        self.cursor = 0;
        self.streaming = true;
        info!(
            camera_id = %self.camera_id,
            dir = %self.dir.display(),
            frames = self.files.len(),
            "directory stream started"
        );
        Ok(())
    }

    fn get_frame(&mut self) -> Option<(DynamicImage, f64)> {
        if !self.streaming || self.files.is_empty() {
            return None;
        }

        // Undecodable files are skipped, at most one full pass per call
        for _ in 0..self.files.len() {
            if self.cursor >= self.files.len() {
                if !self.looping {
                    return None;
                }
                self.cursor = 0;
            }
            let path = &self.files[self.cursor];
            self.cursor += 1;

            match image::open(path) {
                Ok(image) => {
                    debug!(camera_id = %self.camera_id, file = %path.display(), "frame read");
                    return Some((image, unix_now()));
                }
                Err(e) => {
                    warn!(camera_id = %self.camera_id, file = %path.display(), error = %e, "skipping unreadable frame");
                }
            }
        }
        None
    }

    fn stop_stream(&mut self) {
        if self.streaming {
            info!(camera_id = %self.camera_id, "directory stream stopped");
        }
        self.streaming = false;
    }

    fn is_finished(&self) -> bool {
        !self.looping && self.cursor >= self.files.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma};

    fn write_frames(dir: &Path, names: &[&str]) {
        for (i, name) in names.iter().enumerate() {
            let img = GrayImage::from_pixel(8, 4, Luma([i as u8 * 40]));
            img.save(dir.join(name)).unwrap();
        }
    }

    #[test]
    fn test_plays_in_name_order() {
        let dir = tempfile::tempdir().unwrap();
        write_frames(dir.path(), &["b.png", "a.png", "c.png"]);
        std::fs::write(dir.path().join("notes.txt"), "not a frame").unwrap();

        let mut source = DirectoryFrameSource::new("gate", dir.path(), false);
        assert!(source.get_frame().is_none());
        source.start_stream().unwrap();

        let values: Vec<u8> = std::iter::from_fn(|| source.get_frame())
            .map(|(img, _)| img.to_luma8().get_pixel(0, 0)[0])
            .collect();
        // a.png was written second, b.png first
        assert_eq!(values, vec![40, 0, 80]);
        assert!(source.is_finished());
    }

    #[test]
    fn test_looping_restarts() {
        let dir = tempfile::tempdir().unwrap();
        write_frames(dir.path(), &["a.png", "b.png"]);

        let mut source = DirectoryFrameSource::new("gate", dir.path(), true);
        source.start_stream().unwrap();
        for _ in 0..5 {
            assert!(source.get_frame().is_some());
        }
        assert!(!source.is_finished());

        source.stop_stream();
        assert!(source.get_frame().is_none());
    }

    #[test]
    fn test_corrupt_file_skipped() {
        let dir = tempfile::tempdir().unwrap();
        write_frames(dir.path(), &["b.png"]);
        std::fs::write(dir.path().join("a.png"), b"garbage").unwrap();

        let mut source = DirectoryFrameSource::new("gate", dir.path(), false);
        source.start_stream().unwrap();
        assert!(source.get_frame().is_some());
        assert!(source.get_frame().is_none());
    }

    #[test]
    fn test_missing_directory() {
        let mut source = DirectoryFrameSource::new("gate", "/nonexistent/frames", false);
        assert!(source.start_stream().is_err());
    }
}
