//! Viewer side of the stream
//!
//! Runs the initiator half of the key exchange, reads the stream descriptor
//! and then hands every frame to a [`FrameSink`] and every audio chunk to an
//! optional [`AudioSink`]. Sinks and the connection are torn down on every
//! exit path.

use std::io;
use std::time::Instant;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::watch;

use super::channel::{ChannelError, SecureChannel};
use super::protocol::{FramePacket, ProtocolError, StreamDescriptor};
use crate::ErrorKind;

/// Receives decoded frames for display or storage
pub trait FrameSink {
    fn render(&mut self, frame_number: u64, image: &[u8]) -> io::Result<()>;

    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Audio output. `open` is called once with the descriptor when the stream
/// carries audio; `close` may be called without a prior `open`.
pub trait AudioSink {
    fn open(&mut self, descriptor: &StreamDescriptor) -> io::Result<()>;

    fn write(&mut self, chunk: &[u8]) -> io::Result<()>;

    fn close(&mut self) -> io::Result<()>;
}

/// Client errors
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// Connection closed before the descriptor: capacity or media failure
    #[error("Server closed the connection before the stream started")]
    StreamUnavailable,

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("Sink error: {0}")]
    Sink(#[source] io::Error),
}

impl ClientError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ClientError::Connect { .. } | ClientError::StreamUnavailable => ErrorKind::Transport,
            ClientError::Channel(e) => e.kind(),
            ClientError::Protocol(e) => e.kind(),
            ClientError::Sink(_) => ErrorKind::Environment,
        }
    }
}

/// How a receive ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveOutcome {
    /// Server closed after the announced number of frames
    Completed,
    /// Server closed early, at a message boundary
    PeerClosed,
    /// Local cancel signal
    Cancelled,
}

/// Result of a finished receive
#[derive(Debug, Clone, PartialEq)]
pub struct ReceiveSummary {
    pub descriptor: StreamDescriptor,
    pub frames_received: u64,
    pub audio_chunks_received: u64,
    pub outcome: ReceiveOutcome,
}

/// Open a TCP connection to a stream server
pub async fn connect<A>(addr: A) -> Result<TcpStream, ClientError>
where
    A: ToSocketAddrs + std::fmt::Display,
{
    let label = addr.to_string();
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|source| ClientError::Connect { addr: label, source })?;
    if let Err(e) = stream.set_nodelay(true) {
        log::debug!("set_nodelay failed: {}", e);
    }
    Ok(stream)
}

/// Receive a whole stream. The cancel flag is checked once per message.
pub async fn receive_stream<S>(
    stream: S,
    frames: &mut (dyn FrameSink + Send),
    mut audio: Option<&mut (dyn AudioSink + Send)>,
    mut cancel: watch::Receiver<bool>,
) -> Result<ReceiveSummary, ClientError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut channel = SecureChannel::new(stream);
    let loop_audio = audio
        .as_mut()
        .map(|sink| &mut **sink as &mut (dyn AudioSink + Send));
    let result = receive_loop(&mut channel, &mut *frames, loop_audio, &mut cancel).await;

    if let Err(e) = frames.close() {
        log::warn!("Frame sink close failed: {}", e);
    }
    if let Some(audio) = audio {
        if let Err(e) = audio.close() {
            log::warn!("Audio sink close failed: {}", e);
        }
    }
    channel.shutdown().await;

    match &result {
        Ok(summary) => log::info!(
            "Receive finished ({:?}): {} frames, {} audio chunks",
            summary.outcome,
            summary.frames_received,
            summary.audio_chunks_received
        ),
        Err(e) => log::error!("Receive failed ({} error): {}", e.kind(), e),
    }
    result
}

async fn receive_loop<S>(
    channel: &mut SecureChannel<S>,
    frames: &mut (dyn FrameSink + Send),
    mut audio: Option<&mut (dyn AudioSink + Send)>,
    cancel: &mut watch::Receiver<bool>,
) -> Result<ReceiveSummary, ClientError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let start = Instant::now();
    channel.initiate_key_exchange().await.map_err(before_start)?;
    log::debug!("Key exchange completed in {:?}", start.elapsed());

    let body = channel.recv().await.map_err(before_start)?;
    let descriptor = StreamDescriptor::decode(&body)?;
    log::info!(
        "Stream: {}x{} @ {:.3} fps, {} frames, audio {}",
        descriptor.width,
        descriptor.height,
        descriptor.fps,
        descriptor.total_frames,
        if descriptor.has_audio { "on" } else { "off" }
    );

    if descriptor.has_audio {
        if let Some(sink) = audio.as_deref_mut() {
            sink.open(&descriptor).map_err(ClientError::Sink)?;
        }
    }
    let chunk_bytes = descriptor.audio_chunk_bytes();

    let mut summary = ReceiveSummary {
        descriptor,
        frames_received: 0,
        audio_chunks_received: 0,
        outcome: ReceiveOutcome::PeerClosed,
    };

    loop {
        if *cancel.borrow_and_update() {
            summary.outcome = ReceiveOutcome::Cancelled;
            return Ok(summary);
        }

        let body = tokio::select! {
            biased;
            _ = cancelled(cancel) => {
                summary.outcome = ReceiveOutcome::Cancelled;
                return Ok(summary);
            }
            body = channel.recv() => body,
        };
        let body = match body {
            Ok(body) => body,
            Err(e) if e.is_clean_close() => {
                let total = summary.descriptor.total_frames;
                if total == 0 || summary.frames_received >= total {
                    summary.outcome = ReceiveOutcome::Completed;
                }
                return Ok(summary);
            }
            Err(e) => return Err(e.into()),
        };

        let packet = FramePacket::decode(&body)?;
        if packet.frame_number != summary.frames_received {
            return Err(ProtocolError::OutOfOrder {
                expected: summary.frames_received,
                received: packet.frame_number,
            }
            .into());
        }
        frames
            .render(packet.frame_number, &packet.frame)
            .map_err(ClientError::Sink)?;

        if let Some(chunk) = packet.audio {
            if !summary.descriptor.has_audio {
                return Err(ProtocolError::UnexpectedAudio.into());
            }
            if chunk.len() != chunk_bytes {
                return Err(ProtocolError::AudioChunkSize {
                    expected: chunk_bytes,
                    received: chunk.len(),
                }
                .into());
            }
            if let Some(sink) = audio.as_deref_mut() {
                sink.write(&chunk).map_err(ClientError::Sink)?;
            }
            summary.audio_chunks_received += 1;
        }
        summary.frames_received += 1;
    }
}

/// Resolves once the cancel flag is set. A dropped sender never cancels.
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

fn before_start(e: ChannelError) -> ClientError {
    if e.is_clean_close() {
        ClientError::StreamUnavailable
    } else {
        ClientError::Channel(e)
    }
}
