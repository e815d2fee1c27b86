//! Per-connection streaming session
//!
//! Drives one viewer connection through its whole lifecycle:
//!
//! `Accepted -> KeyExchanged -> HandshakeSent -> Streaming -> (Completed | Failed) -> Closed`
//!
//! The session owns its connection, its session key and its media reader
//! exclusively. `run` is the single catch point: whatever happens, the reader
//! is closed, the connection is shut down and the registry slot is released
//! before it returns.

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncWrite};

use super::channel::{ChannelError, SecureChannel};
use super::media::{MediaError, MediaOptions, MediaReader};
use super::protocol::{FramePacket, ProtocolError, StreamDescriptor};
use super::registry::SessionPermit;
use crate::{log_timing, ErrorKind};

/// Default number of frames between progress log lines
pub const DEFAULT_PROGRESS_INTERVAL: u64 = 30;

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Accepted,
    KeyExchanged,
    HandshakeSent,
    Streaming,
    Completed,
    Failed,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Accepted => "ACCEPTED",
            SessionState::KeyExchanged => "KEY_EXCHANGED",
            SessionState::HandshakeSent => "HANDSHAKE_SENT",
            SessionState::Streaming => "STREAMING",
            SessionState::Completed => "COMPLETED",
            SessionState::Failed => "FAILED",
            SessionState::Closed => "CLOSED",
        };
        write!(f, "{}", name)
    }
}

/// Session errors
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Media error: {0}")]
    Media(#[from] MediaError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::Channel(e) => e.kind(),
            SessionError::Media(e) => e.kind(),
            SessionError::Protocol(e) => e.kind(),
        }
    }
}

/// Everything a session needs besides its connection
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub media_path: PathBuf,
    pub media: MediaOptions,
    pub progress_interval: u64,
    pub timing_logs: bool,
}

impl SessionConfig {
    pub fn new(media_path: impl Into<PathBuf>, media: MediaOptions) -> Self {
        let timing_logs = media.timing_logs;
        SessionConfig {
            media_path: media_path.into(),
            media,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
            timing_logs,
        }
    }
}

/// Counters accumulated by the streaming loop
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionStats {
    pub frames_sent: u64,
    pub audio_chunks_sent: u64,
    pub bytes_sent: u64,
    pub elapsed: Duration,
}

impl SessionStats {
    pub fn effective_fps(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.frames_sent as f64 / secs
        } else {
            0.0
        }
    }
}

/// One viewer connection
pub struct StreamSession<S> {
    id: u64,
    peer: SocketAddr,
    state: SessionState,
    channel: SecureChannel<S>,
    config: Arc<SessionConfig>,
    permit: Option<SessionPermit>,
    stats: SessionStats,
    started: Instant,
}

impl<S> StreamSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(id: u64, peer: SocketAddr, stream: S, config: Arc<SessionConfig>) -> Self {
        log::info!("Session {} ({}): {}", id, peer, SessionState::Accepted);
        StreamSession {
            id,
            peer,
            state: SessionState::Accepted,
            channel: SecureChannel::new(stream),
            config,
            permit: None,
            stats: SessionStats::default(),
            started: Instant::now(),
        }
    }

    /// Session admitted through the registry; the slot is held until CLOSED
    pub fn with_permit(stream: S, permit: SessionPermit, config: Arc<SessionConfig>) -> Self {
        let mut session = Self::new(permit.id(), permit.peer(), stream, config);
        session.permit = Some(permit);
        session
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    fn transition(&mut self, next: SessionState) {
        log::info!(
            "Session {} ({}): {} -> {}",
            self.id,
            self.peer,
            self.state,
            next
        );
        self.state = next;
    }

    /// Run the session to CLOSED and report how it ended
    pub async fn run(mut self) -> Result<SessionStats, SessionError> {
        let mut reader: Option<MediaReader> = None;
        let result = self.drive(&mut reader).await;

        if let Some(reader) = reader.as_mut() {
            reader.close().await;
        }
        self.channel.shutdown().await;
        self.stats.elapsed = self.started.elapsed();

        match &result {
            Ok(()) => self.transition(SessionState::Completed),
            Err(e) => {
                match e.kind() {
                    ErrorKind::Transport => log::warn!(
                        "Session {} ({}) lost its peer in {}: {}",
                        self.id,
                        self.peer,
                        self.state,
                        e
                    ),
                    kind => log::error!(
                        "Session {} ({}) failed in {} ({} error): {}",
                        self.id,
                        self.peer,
                        self.state,
                        kind,
                        e
                    ),
                }
                self.transition(SessionState::Failed);
            }
        }

        self.transition(SessionState::Closed);
        drop(self.permit.take());
        log::info!(
            "Session {} summary: {} frames, {} audio chunks, {} bytes in {:.2?} ({:.1} fps)",
            self.id,
            self.stats.frames_sent,
            self.stats.audio_chunks_sent,
            self.stats.bytes_sent,
            self.stats.elapsed,
            self.stats.effective_fps()
        );

        result.map(|()| self.stats.clone())
    }

    async fn drive(&mut self, reader_slot: &mut Option<MediaReader>) -> Result<(), SessionError> {
        let start = Instant::now();
        self.channel.respond_key_exchange().await?;
        log_timing(self.config.timing_logs, "Time for key exchange", start.elapsed());
        self.transition(SessionState::KeyExchanged);

        let reader = reader_slot.insert(
            MediaReader::open(&self.config.media_path, &self.config.media).await?,
        );
        let has_audio = reader.start_audio_extraction().await;
        let descriptor = reader.descriptor();
        debug_assert_eq!(descriptor.has_audio, has_audio);

        self.send_handshake(&descriptor).await?;
        self.transition(SessionState::HandshakeSent);

        self.transition(SessionState::Streaming);
        self.stream_frames(reader, &descriptor).await
    }

    async fn send_handshake(&mut self, descriptor: &StreamDescriptor) -> Result<(), SessionError> {
        let body = descriptor.encode()?;
        let sent = self.channel.send(&body).await?;
        self.stats.bytes_sent += sent as u64;
        log::info!(
            "Session {}: descriptor {}x{} @ {:.3} fps, {} frames, audio {} ({} Hz, {} ch, {} samples/frame)",
            self.id,
            descriptor.width,
            descriptor.height,
            descriptor.fps,
            descriptor.total_frames,
            if descriptor.has_audio { "on" } else { "off" },
            descriptor.audio_sample_rate,
            descriptor.audio_channels,
            descriptor.samples_per_frame
        );
        Ok(())
    }

    /// Paced send loop. Late frames are sent late, never skipped.
    async fn stream_frames(
        &mut self,
        reader: &mut MediaReader,
        descriptor: &StreamDescriptor,
    ) -> Result<(), SessionError> {
        let frame_period = Duration::from_secs_f64(1.0 / descriptor.fps);
        let mut frame_number: u64 = 0;

        loop {
            let loop_start = Instant::now();

            let frame = match reader.next_frame().await? {
                Some(frame) => frame,
                None => {
                    log::info!(
                        "Session {}: end of media after {} frames",
                        self.id,
                        frame_number
                    );
                    return Ok(());
                }
            };
            let audio = reader.next_audio_chunk().await;
            let has_chunk = audio.is_some();

            let packet = FramePacket {
                frame,
                audio,
                frame_number,
            };
            let body = packet.encode()?;
            let sent = self.channel.send(&body).await?;

            self.stats.frames_sent += 1;
            self.stats.bytes_sent += sent as u64;
            if has_chunk {
                self.stats.audio_chunks_sent += 1;
            }
            frame_number += 1;

            if self.config.progress_interval > 0 && frame_number % self.config.progress_interval == 0 {
                log::info!(
                    "Session {}: sent frame {}/{} ({:.1} fps)",
                    self.id,
                    frame_number,
                    descriptor.total_frames,
                    frame_number as f64 / self.started.elapsed().as_secs_f64().max(f64::EPSILON)
                );
            }

            let remaining = frame_period.saturating_sub(loop_start.elapsed());
            if !remaining.is_zero() {
                tokio::time::sleep(remaining).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::media::MediaOptions;
    use crate::modules::registry::ConcurrencyRegistry;
    use image::{Rgb, RgbImage};
    use std::path::Path;
    use tokio::io::duplex;

    fn peer() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 40000))
    }

    fn still_config(dir: &Path, frames: u64, fps: f64) -> Arc<SessionConfig> {
        let path = dir.join("slide.png");
        RgbImage::from_pixel(16, 16, Rgb([10, 200, 30]))
            .save(&path)
            .unwrap();
        let media = MediaOptions {
            still_frame_count: frames,
            still_fps: fps,
            ..MediaOptions::default()
        };
        Arc::new(SessionConfig::new(path, media))
    }

    #[test]
    fn test_state_names() {
        assert_eq!(SessionState::KeyExchanged.to_string(), "KEY_EXCHANGED");
        assert_eq!(SessionState::HandshakeSent.to_string(), "HANDSHAKE_SENT");
    }

    #[test]
    fn test_effective_fps() {
        let stats = SessionStats {
            frames_sent: 60,
            elapsed: Duration::from_secs(2),
            ..SessionStats::default()
        };
        assert_eq!(stats.effective_fps(), 30.0);
        assert_eq!(SessionStats::default().effective_fps(), 0.0);
    }

    #[tokio::test]
    async fn test_session_streams_ordered_frames() {
        let dir = tempfile::tempdir().unwrap();
        let config = still_config(dir.path(), 6, 200.0);
        let (client_io, server_io) = duplex(1024 * 1024);

        let server = tokio::spawn(StreamSession::new(1, peer(), server_io, config).run());

        let mut client = SecureChannel::new(client_io);
        client.initiate_key_exchange().await.unwrap();
        let descriptor = StreamDescriptor::decode(&client.recv().await.unwrap()).unwrap();
        assert_eq!(descriptor.total_frames, 6);
        assert!(!descriptor.has_audio);

        let mut numbers = Vec::new();
        loop {
            match client.recv().await {
                Ok(body) => {
                    let packet = FramePacket::decode(&body).unwrap();
                    assert!(packet.audio.is_none());
                    numbers.push(packet.frame_number);
                }
                Err(e) => {
                    assert!(e.is_clean_close());
                    break;
                }
            }
        }
        assert_eq!(numbers, (0..6).collect::<Vec<u64>>());

        let stats = server.await.unwrap().unwrap();
        assert_eq!(stats.frames_sent, 6);
        assert_eq!(stats.audio_chunks_sent, 0);
    }

    #[tokio::test]
    async fn test_pacing_holds_target_rate() {
        let dir = tempfile::tempdir().unwrap();
        // 10 frames at 100 fps take at least nine frame periods
        let config = still_config(dir.path(), 10, 100.0);
        let (client_io, server_io) = duplex(1024 * 1024);
        let server = tokio::spawn(StreamSession::new(2, peer(), server_io, config).run());

        let mut client = SecureChannel::new(client_io);
        client.initiate_key_exchange().await.unwrap();
        client.recv().await.unwrap();
        let start = Instant::now();
        while client.recv().await.is_ok() {}
        assert!(start.elapsed() >= Duration::from_millis(80));
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_unopenable_media_closes_without_descriptor() {
        let config = Arc::new(SessionConfig::new(
            "/nonexistent/missing.png",
            MediaOptions::default(),
        ));
        let (client_io, server_io) = duplex(64 * 1024);
        let server = tokio::spawn(StreamSession::new(3, peer(), server_io, config).run());

        let mut client = SecureChannel::new(client_io);
        client.initiate_key_exchange().await.unwrap();
        let err = client.recv().await.unwrap_err();
        assert!(err.is_clean_close());

        let err = server.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Media);
    }

    #[tokio::test]
    async fn test_peer_disconnect_fails_session_and_releases_slot() {
        let dir = tempfile::tempdir().unwrap();
        let config = still_config(dir.path(), 10_000, 200.0);
        let registry = ConcurrencyRegistry::new(1);
        let permit = registry.try_acquire(peer()).unwrap();

        let (client_io, server_io) = duplex(64 * 1024);
        let server = tokio::spawn(StreamSession::with_permit(server_io, permit, config).run());

        let mut client = SecureChannel::new(client_io);
        client.initiate_key_exchange().await.unwrap();
        client.recv().await.unwrap();
        client.recv().await.unwrap();
        assert_eq!(registry.active_count(), 1);
        drop(client);

        let err = server.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport);
        assert_eq!(registry.active_count(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_peer_disconnect_mid_clip_reaps_decoder() {
        use crate::modules::media::test_tools::{process_exists, FakeTools};

        let dir = tempfile::tempdir().unwrap();
        let tools = FakeTools::install(dir.path(), 100_000, None, "cat /dev/zero");
        let config = Arc::new(SessionConfig::new(tools.clip.clone(), tools.options.clone()));
        let (client_io, server_io) = duplex(64 * 1024);
        let server = tokio::spawn(StreamSession::new(5, peer(), server_io, config).run());

        let mut client = SecureChannel::new(client_io);
        client.initiate_key_exchange().await.unwrap();
        let descriptor = StreamDescriptor::decode(&client.recv().await.unwrap()).unwrap();
        assert!(!descriptor.has_audio);
        assert_eq!(FramePacket::decode(&client.recv().await.unwrap()).unwrap().frame_number, 0);
        assert_eq!(FramePacket::decode(&client.recv().await.unwrap()).unwrap().frame_number, 1);
        let pid = tools.decoder_pid();
        drop(client);

        let err = server.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport);
        assert!(!process_exists(&pid));
    }

    #[tokio::test]
    async fn test_garbage_key_exchange_fails_session() {
        let dir = tempfile::tempdir().unwrap();
        let config = still_config(dir.path(), 3, 30.0);
        let (mut client_io, server_io) = duplex(64 * 1024);
        let server = tokio::spawn(StreamSession::new(4, peer(), server_io, config).run());

        tokio::io::AsyncWriteExt::write_all(&mut client_io, b"xxxxxxxxjunk")
            .await
            .unwrap();
        let err = server.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);
    }
}
