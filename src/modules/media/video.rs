//! Stored clip decoding
//!
//! ffmpeg decodes the clip to packed RGB24 on stdout; each fixed-size frame is
//! JPEG-encoded on the blocking pool before it is handed to the session.

use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Instant;

use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStdout, Command};

use super::audio::AudioExtractor;
use super::probe::{probe_audio, probe_video};
use super::{AudioFormat, MediaError, MediaOptions, VideoInfo};
use crate::log_timing;

const RGB_BYTES_PER_PIXEL: usize = 3;

/// Video strategy of the media reader
pub struct VideoReader {
    path: PathBuf,
    info: VideoInfo,
    options: MediaOptions,
    decoder: Option<Child>,
    frames: Option<ChildStdout>,
    frame_bytes: usize,
    frames_read: u64,
    ended: bool,
    audio_format: AudioFormat,
    audio: Option<AudioExtractor>,
}

impl VideoReader {
    /// Probe the clip and start the frame decoder
    pub async fn open(path: &Path, options: &MediaOptions) -> Result<Self, MediaError> {
        let start = Instant::now();
        let info = probe_video(&options.ffprobe_path, path).await?;

        // Frames must keep the coded geometry reported by the probe
        let mut decoder = Command::new(&options.ffmpeg_path)
            .args(["-v", "error", "-nostdin", "-noautorotate", "-i"])
            .arg(path)
            .args(["-an", "-sn", "-f", "rawvideo", "-pix_fmt", "rgb24", "pipe:1"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| MediaError::open(path, format!("ffmpeg spawn error: {}", e)))?;
        let frames = decoder
            .stdout
            .take()
            .ok_or_else(|| MediaError::open(path, "decoder stdout not piped"))?;

        log::info!(
            "Opened {}: {}x{} @ {:.3} fps, {} frames",
            path.display(),
            info.width,
            info.height,
            info.fps,
            info.total_frames
        );
        log_timing(options.timing_logs, "Time to open media", start.elapsed());

        Ok(VideoReader {
            path: path.to_path_buf(),
            info,
            options: options.clone(),
            decoder: Some(decoder),
            frames: Some(frames),
            frame_bytes: info.width as usize * info.height as usize * RGB_BYTES_PER_PIXEL,
            frames_read: 0,
            ended: false,
            audio_format: AudioFormat::default(),
            audio: None,
        })
    }

    pub fn info(&self) -> &VideoInfo {
        &self.info
    }

    pub fn audio_format(&self) -> AudioFormat {
        self.audio_format
    }

    pub fn has_audio(&self) -> bool {
        self.audio.is_some()
    }

    /// Probe audio and launch the PCM pipe; any failure leaves audio disabled
    pub async fn start_audio_extraction(&mut self) -> bool {
        if self.audio.is_some() {
            return true;
        }
        let probe = probe_audio(&self.options.ffprobe_path, &self.path).await;
        self.audio_format = probe.format;
        if !probe.available {
            return false;
        }
        match AudioExtractor::spawn(
            &self.options.ffmpeg_path,
            &self.path,
            probe.format,
            self.info.fps,
        ) {
            Ok(extractor) => {
                self.audio = Some(extractor);
                true
            }
            Err(e) => {
                log::warn!(
                    "Audio transcoder unavailable ({}), streaming {} without audio",
                    e,
                    self.path.display()
                );
                false
            }
        }
    }

    /// Next JPEG frame; `None` at end of stream or once `total_frames` is reached
    pub async fn next_frame(&mut self) -> Result<Option<Vec<u8>>, MediaError> {
        if self.ended {
            return Ok(None);
        }
        if self.info.total_frames > 0 && self.frames_read >= self.info.total_frames {
            self.ended = true;
            return Ok(None);
        }
        let frames = match self.frames.as_mut() {
            Some(frames) => frames,
            None => return Ok(None),
        };

        let mut raw = vec![0u8; self.frame_bytes];
        match frames.read_exact(&mut raw).await {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                log::debug!(
                    "Decoder reached end of {} after {} frames",
                    self.path.display(),
                    self.frames_read
                );
                self.ended = true;
                return Ok(None);
            }
            Err(e) => return Err(MediaError::Decode(e.to_string())),
        }

        let start = Instant::now();
        let (width, height, quality) = (self.info.width, self.info.height, self.options.jpeg_quality);
        let jpeg = tokio::task::spawn_blocking(move || encode_jpeg(&raw, width, height, quality))
            .await
            .map_err(|e| MediaError::Encode(e.to_string()))??;
        log_timing(self.options.timing_logs, "Time to encode frame", start.elapsed());

        self.frames_read += 1;
        Ok(Some(jpeg))
    }

    pub async fn next_audio_chunk(&mut self) -> Option<Vec<u8>> {
        match self.audio.as_mut() {
            Some(audio) => audio.read_chunk().await,
            None => None,
        }
    }

    pub fn frames_read(&self) -> u64 {
        self.frames_read
    }

    /// Kill and reap the decoder and the audio transcoder
    pub async fn close(&mut self) {
        self.frames = None;
        if let Some(mut decoder) = self.decoder.take() {
            if let Err(e) = decoder.kill().await {
                log::debug!("Decoder kill: {}", e);
            }
        }
        if let Some(audio) = self.audio.as_mut() {
            audio.close().await;
        }
        self.ended = true;
    }
}

/// Encode a packed RGB24 buffer as JPEG
pub fn encode_jpeg(rgb: &[u8], width: u32, height: u32, quality: u8) -> Result<Vec<u8>, MediaError> {
    let mut jpeg = Vec::with_capacity(rgb.len() / 8);
    JpegEncoder::new_with_quality(&mut jpeg, quality.clamp(1, 100))
        .encode(rgb, width, height, ExtendedColorType::Rgb8)
        .map_err(|e| MediaError::Encode(e.to_string()))?;
    Ok(jpeg)
}
