use image::DynamicImage;
use std::sync::Arc;

/// A decoded camera frame.
///
/// The pixel buffer is shared so a frame can sit in the synchronization
/// buffer while a worker recognizes it.
#[derive(Debug, Clone)]
pub struct Frame {
    pub camera_id: String,
    pub image: Arc<DynamicImage>,

    /// Capture time in seconds since the Unix epoch
    pub timestamp: f64,
}

impl Frame {
    pub fn new(camera_id: impl Into<String>, image: DynamicImage, timestamp: f64) -> Self {
        Self {
            camera_id: camera_id.into(),
            image: Arc::new(image),
            timestamp,
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn is_empty(&self) -> bool {
        self.image.width() == 0 || self.image.height() == 0
    }
}
