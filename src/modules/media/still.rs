//! Still image replay
//!
//! The image is decoded and JPEG-encoded once, then repeated as a silent
//! sequence of `still_frame_count` identical frames.

use std::path::Path;

use super::video::encode_jpeg;
use super::{sanitize_fps, MediaError, MediaOptions, VideoInfo};

/// Still-image strategy of the media reader
pub struct StillReader {
    info: VideoInfo,
    jpeg: Vec<u8>,
    emitted: u64,
}

impl StillReader {
    pub async fn open(path: &Path, options: &MediaOptions) -> Result<Self, MediaError> {
        let owned_path = path.to_path_buf();
        let quality = options.jpeg_quality;
        let (width, height, jpeg) = tokio::task::spawn_blocking(move || {
            let image = image::open(&owned_path)
                .map_err(|e| MediaError::open(&owned_path, e.to_string()))?
                .to_rgb8();
            let (width, height) = image.dimensions();
            let jpeg = encode_jpeg(image.as_raw(), width, height, quality)?;
            Ok::<_, MediaError>((width, height, jpeg))
        })
        .await
        .map_err(|e| MediaError::open(path, e.to_string()))??;

        let info = VideoInfo {
            width,
            height,
            fps: sanitize_fps(options.still_fps),
            total_frames: options.still_frame_count,
        };
        log::info!(
            "Opened still image {}: {}x{}, replaying {} frames",
            path.display(),
            width,
            height,
            info.total_frames
        );

        Ok(StillReader {
            info,
            jpeg,
            emitted: 0,
        })
    }

    pub fn info(&self) -> &VideoInfo {
        &self.info
    }

    pub fn next_frame(&mut self) -> Option<Vec<u8>> {
        if self.emitted >= self.info.total_frames {
            return None;
        }
        self.emitted += 1;
        Some(self.jpeg.clone())
    }

    pub fn close(&mut self) {
        self.emitted = self.info.total_frames;
    }
}
