//! Encrypted framed channel over a byte stream
//!
//! A `SecureChannel` starts without a key. After one side runs
//! [`SecureChannel::initiate_key_exchange`] and the other runs
//! [`SecureChannel::respond_key_exchange`], every message in both directions
//! is encrypted with the derived session key.

use std::time::Instant;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use super::crypto::{self, CryptoError, EphemeralKeyPair, SessionKey};
use super::framing::{self, FramingError};
use crate::ErrorKind;

/// Uncompressed SEC1 P-256 point, the largest key message accepted
pub const MAX_PUBLIC_KEY_LEN: usize = 65;

/// Channel errors
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error(transparent)]
    Framing(#[from] FramingError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("No session key established")]
    NoSessionKey,

    #[error("Key exchange already completed")]
    AlreadyKeyed,
}

impl ChannelError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ChannelError::Framing(e) => e.kind(),
            ChannelError::Crypto(e) => e.kind(),
            ChannelError::NoSessionKey | ChannelError::AlreadyKeyed => ErrorKind::Protocol,
        }
    }

    /// Peer closed the stream cleanly between two messages
    pub fn is_clean_close(&self) -> bool {
        matches!(self, ChannelError::Framing(e) if e.is_clean_close())
    }
}

/// Byte stream plus the optional session key
pub struct SecureChannel<S> {
    stream: S,
    key: Option<SessionKey>,
}

impl<S> SecureChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        SecureChannel { stream, key: None }
    }

    pub fn is_keyed(&self) -> bool {
        self.key.is_some()
    }

    pub fn session_key(&self) -> Option<&SessionKey> {
        self.key.as_ref()
    }

    /// Viewer side: send our public key first, then read the server's
    pub async fn initiate_key_exchange(&mut self) -> Result<(), ChannelError> {
        if self.key.is_some() {
            return Err(ChannelError::AlreadyKeyed);
        }
        let start = Instant::now();
        let key_pair = EphemeralKeyPair::generate();
        framing::send(&mut self.stream, &key_pair.public_key_bytes()).await?;
        let peer_public_key =
            framing::recv_bounded(&mut self.stream, MAX_PUBLIC_KEY_LEN).await?;
        let key = key_pair.derive_session_key(&peer_public_key)?;
        log::debug!(
            "Key exchange (initiator) complete in {:?}, key {}",
            start.elapsed(),
            key.fingerprint()
        );
        self.key = Some(key);
        Ok(())
    }

    /// Server side: read the viewer's public key, then reply with ours
    pub async fn respond_key_exchange(&mut self) -> Result<(), ChannelError> {
        if self.key.is_some() {
            return Err(ChannelError::AlreadyKeyed);
        }
        let start = Instant::now();
        let peer_public_key =
            framing::recv_bounded(&mut self.stream, MAX_PUBLIC_KEY_LEN).await?;
        let key_pair = EphemeralKeyPair::generate();
        // Validate the peer key before revealing ours
        let key = key_pair.derive_session_key(&peer_public_key)?;
        framing::send(&mut self.stream, &key_pair.public_key_bytes()).await?;
        log::debug!(
            "Key exchange (responder) complete in {:?}, key {}",
            start.elapsed(),
            key.fingerprint()
        );
        self.key = Some(key);
        Ok(())
    }

    /// Encrypt and frame one message
    pub async fn send(&mut self, payload: &[u8]) -> Result<usize, ChannelError> {
        let key = self.key.as_ref().ok_or(ChannelError::NoSessionKey)?;
        let envelope = crypto::encrypt(key, payload)?;
        framing::send(&mut self.stream, &envelope).await?;
        Ok(envelope.len() + crate::HEADER_WIDTH)
    }

    /// Read and decrypt one message
    pub async fn recv(&mut self) -> Result<Vec<u8>, ChannelError> {
        let key = self.key.as_ref().ok_or(ChannelError::NoSessionKey)?;
        let envelope = framing::recv(&mut self.stream).await?;
        Ok(crypto::decrypt(key, &envelope)?)
    }

    /// Flush and close the write half. Errors are ignored; the peer may be gone.
    pub async fn shutdown(&mut self) {
        if let Err(e) = self.stream.shutdown().await {
            log::debug!("Channel shutdown: {}", e);
        }
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    pub fn into_inner(self) -> S {
        self.stream
    }
}
