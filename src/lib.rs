//! Encrypted frame streaming over raw TCP.
//!
//! A server process replays a stored media file (video with synchronized
//! PCM audio, or a still image) to remote viewers. Every connection runs the
//! same stack:
//!
//! - `framing` - fixed-width decimal length prefix around each message
//! - `crypto` / `channel` - ephemeral P-256 ECDH, HKDF-SHA256, AES-256-CBC
//! - `protocol` - stream descriptor and frame packet bodies (CBOR)
//! - `media` - frame decoding and per-frame PCM chunk extraction
//! - `session` - handshake and paced streaming loop
//! - `registry` / `server` - accept loop with a concurrency cap
//! - `client` - the viewer side of the same protocol

use std::fmt;

pub mod settings;

pub mod modules;

pub use modules::channel::SecureChannel;
pub use modules::client::{receive_stream, AudioSink, FrameSink, ReceiveOutcome, ReceiveSummary};
pub use modules::media::{MediaOptions, MediaReader};
pub use modules::protocol::{FramePacket, StreamDescriptor};
pub use modules::registry::ConcurrencyRegistry;
pub use modules::server::{launch, StreamMode, StreamServer};
pub use settings::ServerSettings;

/// Width of the decimal length header in front of every message
pub const HEADER_WIDTH: usize = 8;

/// Default listening port for the streaming endpoint
pub const DEFAULT_STREAM_PORT: u16 = 9000;

/// Default concurrency cap for the multi-viewer playback endpoint
pub const DEFAULT_MAX_SESSIONS: usize = 8;

/// Coarse classification used by the session catch point to decide how a
/// failure is reported. None of these ever stop the acceptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Reset, broken pipe, peer closed mid-message
    Transport,
    /// Bad header, undecodable body, decryption failure
    Protocol,
    /// Unopenable or undecodable media
    Media,
    /// Missing external tools or bad configuration
    Environment,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Transport => write!(f, "transport"),
            ErrorKind::Protocol => write!(f, "protocol"),
            ErrorKind::Media => write!(f, "media"),
            ErrorKind::Environment => write!(f, "environment"),
        }
    }
}

/// Logs a duration at info level when timing logs are enabled
pub fn log_timing(enabled: bool, message: &str, duration: std::time::Duration) {
    if enabled {
        log::info!("{}: {:?}", message, duration);
    }
}
