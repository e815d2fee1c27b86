//! Media Source Reader
//!
//! Produces one encoded image per call plus, when audio is available, one PCM
//! chunk covering exactly that frame's duration. Two strategies share the
//! same interface:
//!
//! - `video.rs` - decodes a stored clip through an external ffmpeg pipe and
//!   extracts time-aligned audio (`audio.rs`)
//! - `still.rs` - replays a single image as a fixed-length silent sequence
//!
//! The strategy is picked from the file extension. Each session owns its own
//! reader; nothing here is shared or cached.

pub mod audio;
pub mod probe;
pub mod still;
#[cfg(all(test, unix))]
pub(crate) mod test_tools;
pub mod video;

use std::io;
use std::path::{Path, PathBuf};

use crate::modules::protocol::{StreamDescriptor, BYTES_PER_SAMPLE};
use crate::ErrorKind;

pub use audio::AudioExtractor;
pub use still::StillReader;
pub use video::VideoReader;

/// Substitute for a missing or implausible container frame rate
pub const FALLBACK_FPS: f64 = 30.0;
/// Anything above this is treated as a broken probe result
pub const MAX_PLAUSIBLE_FPS: f64 = 240.0;
pub const DEFAULT_SAMPLE_RATE: u32 = 44_100;
pub const DEFAULT_CHANNELS: u16 = 2;

/// Extensions replayed with the still-image strategy
pub const STILL_IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp", "gif", "webp"];

/// Media errors
#[derive(Debug, thiserror::Error)]
pub enum MediaError {
    /// File missing, not decodable or without a video stream
    #[error("Cannot open media {path}: {reason}")]
    Open { path: PathBuf, reason: String },

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Image encode error: {0}")]
    Encode(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl MediaError {
    pub fn open(path: &Path, reason: impl Into<String>) -> Self {
        MediaError::Open {
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Media
    }
}

/// Per-session media settings
#[derive(Debug, Clone)]
pub struct MediaOptions {
    /// Decoder and audio transcoder executable
    pub ffmpeg_path: PathBuf,
    pub ffprobe_path: PathBuf,
    /// JPEG quality for outgoing frames, 1..=100
    pub jpeg_quality: u8,
    /// Length of the synthetic sequence for still images
    pub still_frame_count: u64,
    pub still_fps: f64,
    pub timing_logs: bool,
}

impl Default for MediaOptions {
    fn default() -> Self {
        MediaOptions {
            ffmpeg_path: PathBuf::from("ffmpeg"),
            ffprobe_path: PathBuf::from("ffprobe"),
            jpeg_quality: 80,
            still_frame_count: 150,
            still_fps: FALLBACK_FPS,
            timing_logs: false,
        }
    }
}

/// Video stream properties
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VideoInfo {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    /// Frames the reader will yield at most; 0 when the container does not say
    pub total_frames: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl Default for AudioFormat {
    fn default() -> Self {
        AudioFormat {
            sample_rate: DEFAULT_SAMPLE_RATE,
            channels: DEFAULT_CHANNELS,
        }
    }
}

/// Result of probing the audio track. `available` is false when probing
/// failed and `format` holds the defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioProbe {
    pub format: AudioFormat,
    pub available: bool,
}

impl AudioProbe {
    pub fn unavailable() -> Self {
        AudioProbe {
            format: AudioFormat::default(),
            available: false,
        }
    }
}

/// One reader step
#[derive(Debug, Clone, PartialEq)]
pub struct MediaFrame {
    pub image: Vec<u8>,
    pub audio: Option<Vec<u8>>,
}

/// Replace a missing, non-finite or implausible fps with [`FALLBACK_FPS`]
pub fn sanitize_fps(fps: f64) -> f64 {
    if fps.is_finite() && fps > 0.0 && fps <= MAX_PLAUSIBLE_FPS {
        fps
    } else {
        FALLBACK_FPS
    }
}

/// Audio samples (per channel) covering one video frame
pub fn samples_per_frame(sample_rate: u32, fps: f64) -> u32 {
    (sample_rate as f64 / sanitize_fps(fps)).round() as u32
}

/// Bytes in one audio chunk of signed 16-bit interleaved PCM
pub fn chunk_bytes(samples_per_frame: u32, channels: u16) -> usize {
    samples_per_frame as usize * channels as usize * BYTES_PER_SAMPLE
}

/// True when the path should be replayed as a still image
pub fn is_still_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let ext = ext.to_ascii_lowercase();
            STILL_IMAGE_EXTENSIONS.contains(&ext.as_str())
        })
        .unwrap_or(false)
}

/// Reader interface over the two strategies
pub enum MediaReader {
    Video(VideoReader),
    Still(StillReader),
}

impl MediaReader {
    /// Open a media file with the strategy its extension selects
    pub async fn open(path: &Path, options: &MediaOptions) -> Result<Self, MediaError> {
        if is_still_image(path) {
            Ok(MediaReader::Still(StillReader::open(path, options).await?))
        } else {
            Ok(MediaReader::Video(VideoReader::open(path, options).await?))
        }
    }

    pub fn info(&self) -> &VideoInfo {
        match self {
            MediaReader::Video(reader) => reader.info(),
            MediaReader::Still(reader) => reader.info(),
        }
    }

    pub fn is_still(&self) -> bool {
        matches!(self, MediaReader::Still(_))
    }

    /// Probe the audio track and start the PCM pipe. Returns whether audio
    /// will be delivered; every failure degrades to video-only.
    pub async fn start_audio_extraction(&mut self) -> bool {
        match self {
            MediaReader::Video(reader) => reader.start_audio_extraction().await,
            MediaReader::Still(_) => false,
        }
    }

    pub fn has_audio(&self) -> bool {
        match self {
            MediaReader::Video(reader) => reader.has_audio(),
            MediaReader::Still(_) => false,
        }
    }

    /// Handshake descriptor for the current reader state
    pub fn descriptor(&self) -> StreamDescriptor {
        let info = self.info();
        let format = match self {
            MediaReader::Video(reader) => reader.audio_format(),
            MediaReader::Still(_) => AudioFormat::default(),
        };
        StreamDescriptor {
            width: info.width,
            height: info.height,
            fps: info.fps,
            total_frames: info.total_frames,
            audio_sample_rate: format.sample_rate,
            audio_channels: format.channels,
            samples_per_frame: samples_per_frame(format.sample_rate, info.fps),
            has_audio: self.has_audio(),
        }
    }

    /// Next encoded frame, `None` at end of media
    pub async fn next_frame(&mut self) -> Result<Option<Vec<u8>>, MediaError> {
        match self {
            MediaReader::Video(reader) => reader.next_frame().await,
            MediaReader::Still(reader) => Ok(reader.next_frame()),
        }
    }

    /// Best-effort audio chunk; `None` once audio is exhausted or disabled
    pub async fn next_audio_chunk(&mut self) -> Option<Vec<u8>> {
        match self {
            MediaReader::Video(reader) => reader.next_audio_chunk().await,
            MediaReader::Still(_) => None,
        }
    }

    /// One frame plus its audio chunk, `None` at end of media
    pub async fn next(&mut self) -> Result<Option<MediaFrame>, MediaError> {
        let image = match self.next_frame().await? {
            Some(image) => image,
            None => return Ok(None),
        };
        let audio = self.next_audio_chunk().await;
        Ok(Some(MediaFrame { image, audio }))
    }

    /// Release decoders and reap external processes
    pub async fn close(&mut self) {
        match self {
            MediaReader::Video(reader) => reader.close().await,
            MediaReader::Still(reader) => reader.close(),
        }
    }
}
