use std::{
    path::Path,
    sync::atomic::{AtomicU32, Ordering},
};

use async_trait::async_trait;
use iris_types::{frame::RawImage, Result};

use crate::{capture_error, FrameSource};

/// Generated moving gradient, used for demos and tests.
pub struct SyntheticSource {
    width: u32,
    height: u32,
    warmup: AtomicU32,
    fail_every: Option<u64>,
    grabs: u64,
}

impl SyntheticSource {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            warmup: AtomicU32::new(0),
            fail_every: None,
            grabs: 0,
        }
    }

    /// Report zero dimensions for the first `checks` readiness probes.
    pub fn with_warmup(self, checks: u32) -> Self {
        self.warmup.store(checks, Ordering::Relaxed);
        self
    }

    /// Fail every `n`th grab, simulating a tainted capture surface.
    pub fn with_failure_every(mut self, n: u64) -> Self {
        self.fail_every = Some(n.max(1));
        self
    }
}

#[async_trait]
impl FrameSource for SyntheticSource {
    fn dimensions(&self) -> (u32, u32) {
        let pending = self
            .warmup
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
        if pending.is_ok() {
            (0, 0)
        } else {
            (self.width, self.height)
        }
    }

    async fn grab(&mut self) -> Result<RawImage> {
        self.grabs += 1;
        if let Some(n) = self.fail_every {
            if self.grabs % n == 0 {
                return Err(capture_error(format!("synthetic grab {} failed", self.grabs)));
            }
        }
        let shift = (self.grabs * 4) as u32;
        let mut data = Vec::with_capacity((self.width * self.height * 4) as usize);
        for y in 0..self.height {
            for x in 0..self.width {
                data.extend_from_slice(&[
                    ((x + shift) % 256) as u8,
                    ((y + shift / 2) % 256) as u8,
                    ((x ^ y) % 256) as u8,
                    255,
                ]);
            }
        }
        Ok(RawImage::from_rgba(self.width, self.height, data))
    }
}

/// Serves the same still image on every grab.
pub struct ImageFileSource {
    image: RawImage,
}

impl ImageFileSource {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let decoded = image::open(path)
            .map_err(|err| capture_error(format!("failed to open {}: {err}", path.display())))?;
        let rgba = decoded.to_rgba8();
        let (width, height) = rgba.dimensions();
        Ok(Self {
            image: RawImage::from_rgba(width, height, rgba.into_raw()),
        })
    }
}

#[async_trait]
impl FrameSource for ImageFileSource {
    fn dimensions(&self) -> (u32, u32) {
        (self.image.width, self.image.height)
    }

    async fn grab(&mut self) -> Result<RawImage> {
        Ok(self.image.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn warmup_reports_zero_dimensions() {
        let source = SyntheticSource::new(10, 5).with_warmup(2);
        assert_eq!(source.dimensions(), (0, 0));
        assert_eq!(source.dimensions(), (0, 0));
        assert_eq!(source.dimensions(), (10, 5));
    }

    #[tokio::test]
    async fn gradient_has_rgba_layout() {
        let mut source = SyntheticSource::new(3, 2);
        let raw = source.grab().await.unwrap();
        assert_eq!(raw.data.len(), 3 * 2 * 4);
        assert!(raw.data.chunks(4).all(|px| px[3] == 255));
    }

    #[test]
    fn missing_image_file_is_a_capture_error() {
        let result = ImageFileSource::open("/nonexistent/iris/frame.png");
        assert!(result.is_err());
    }
}
