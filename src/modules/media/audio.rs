//! Raw PCM extraction through a long-running ffmpeg pipe
//!
//! The transcoder writes signed 16-bit little-endian interleaved samples to
//! stdout. Reads are done in exact per-frame chunks; the first short read
//! marks audio as exhausted for the rest of the session.

use std::io;
use std::path::Path;
use std::process::Stdio;

use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStdout, Command};

use super::{chunk_bytes, samples_per_frame, AudioFormat};

/// Running PCM transcoder for one session
pub struct AudioExtractor {
    child: Option<Child>,
    stdout: Option<ChildStdout>,
    format: AudioFormat,
    samples_per_frame: u32,
    chunk_bytes: usize,
    chunks_read: u64,
    exhausted: bool,
}

impl AudioExtractor {
    /// Launch the transcoder. Fails only if the process cannot be started.
    pub fn spawn(
        ffmpeg: &Path,
        path: &Path,
        format: AudioFormat,
        fps: f64,
    ) -> io::Result<Self> {
        let samples_per_frame = samples_per_frame(format.sample_rate, fps);
        let chunk_bytes = chunk_bytes(samples_per_frame, format.channels);

        let mut child = Command::new(ffmpeg)
            .args(["-v", "error", "-nostdin", "-i"])
            .arg(path)
            .args(["-vn", "-f", "s16le", "-acodec", "pcm_s16le", "-ar"])
            .arg(format.sample_rate.to_string())
            .arg("-ac")
            .arg(format.channels.to_string())
            .arg("pipe:1")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "transcoder stdout not piped"))?;

        log::debug!(
            "Audio pipe started: {} Hz, {} ch, {} samples/frame, {} bytes/chunk",
            format.sample_rate,
            format.channels,
            samples_per_frame,
            chunk_bytes
        );

        Ok(AudioExtractor {
            child: Some(child),
            stdout: Some(stdout),
            format,
            samples_per_frame,
            chunk_bytes,
            chunks_read: 0,
            exhausted: false,
        })
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }

    pub fn samples_per_frame(&self) -> u32 {
        self.samples_per_frame
    }

    pub fn chunk_bytes(&self) -> usize {
        self.chunk_bytes
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    pub fn chunks_read(&self) -> u64 {
        self.chunks_read
    }

    /// Read exactly one chunk, or `None` once the pipe is drained or broken
    pub async fn read_chunk(&mut self) -> Option<Vec<u8>> {
        if self.exhausted {
            return None;
        }
        let stdout = self.stdout.as_mut()?;
        let mut chunk = vec![0u8; self.chunk_bytes];
        match stdout.read_exact(&mut chunk).await {
            Ok(_) => {
                self.chunks_read += 1;
                Some(chunk)
            }
            Err(e) => {
                if e.kind() != io::ErrorKind::UnexpectedEof {
                    log::warn!("Audio pipe read failed: {}", e);
                }
                log::debug!("Audio exhausted after {} chunks", self.chunks_read);
                self.exhausted = true;
                None
            }
        }
    }

    /// Terminate the transcoder and reap it
    pub async fn close(&mut self) {
        self.stdout = None;
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.kill().await {
                log::debug!("Audio transcoder kill: {}", e);
            }
        }
        self.exhausted = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_transcoder_fails_to_spawn() {
        let result = AudioExtractor::spawn(
            Path::new("/nonexistent/bin/ffmpeg"),
            Path::new("clip.mp4"),
            AudioFormat::default(),
            30.0,
        );
        assert!(result.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_chunks_are_exact_and_short_tail_exhausts() {
        // `head -c` stands in for the transcoder: 2.5 chunks of zeroes, then EOF.
        let format = AudioFormat {
            sample_rate: 44_100,
            channels: 2,
        };
        let spf = samples_per_frame(format.sample_rate, 30.0);
        let bytes = chunk_bytes(spf, format.channels);

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(format!("head -c {} /dev/zero", bytes * 5 / 2))
            .stdout(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let stdout = child.stdout.take().unwrap();
        let mut extractor = AudioExtractor {
            child: Some(child),
            stdout: Some(stdout),
            format,
            samples_per_frame: spf,
            chunk_bytes: bytes,
            chunks_read: 0,
            exhausted: false,
        };

        assert_eq!(extractor.read_chunk().await.unwrap().len(), 5880);
        assert_eq!(extractor.read_chunk().await.unwrap().len(), 5880);
        assert!(extractor.read_chunk().await.is_none());
        assert!(extractor.is_exhausted());
        assert!(extractor.read_chunk().await.is_none());
        assert_eq!(extractor.chunks_read(), 2);
        extractor.close().await;
    }
}
