//! Length-prefixed message framing
//!
//! Every message on the wire is an 8-digit zero-padded ASCII decimal length
//! followed by exactly that many payload bytes. The header counts the bytes
//! actually transported, so after the key exchange it covers the base64
//! ciphertext, not the plaintext.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{ErrorKind, HEADER_WIDTH};

/// Largest payload an 8-digit decimal header can describe
pub const MAX_PAYLOAD_LEN: usize = 99_999_999;

/// Framing errors
#[derive(Debug, thiserror::Error)]
pub enum FramingError {
    /// Stream ended before a complete header or payload was read
    #[error("Connection closed after {received} of {expected} bytes")]
    ConnectionClosed { expected: usize, received: usize },

    /// Header bytes were not a decimal length
    #[error("Invalid length header: {0:?}")]
    InvalidHeader(String),

    #[error("Payload of {0} bytes exceeds the framing limit")]
    PayloadTooLarge(usize),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl FramingError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FramingError::ConnectionClosed { .. } | FramingError::Io(_) => ErrorKind::Transport,
            FramingError::InvalidHeader(_) | FramingError::PayloadTooLarge(_) => {
                ErrorKind::Protocol
            }
        }
    }

    /// True when the peer closed the stream cleanly between two messages
    pub fn is_clean_close(&self) -> bool {
        matches!(
            self,
            FramingError::ConnectionClosed {
                expected: HEADER_WIDTH,
                received: 0
            }
        )
    }
}

/// Encode a payload length as a fixed-width decimal header
pub fn encode_header(len: usize) -> Result<[u8; HEADER_WIDTH], FramingError> {
    if len > MAX_PAYLOAD_LEN {
        return Err(FramingError::PayloadTooLarge(len));
    }
    let text = format!("{:0width$}", len, width = HEADER_WIDTH);
    let mut header = [0u8; HEADER_WIDTH];
    header.copy_from_slice(text.as_bytes());
    Ok(header)
}

/// Parse a fixed-width decimal header
pub fn decode_header(header: &[u8]) -> Result<usize, FramingError> {
    if header.len() != HEADER_WIDTH || !header.iter().all(u8::is_ascii_digit) {
        return Err(FramingError::InvalidHeader(
            String::from_utf8_lossy(header).into_owned(),
        ));
    }
    std::str::from_utf8(header)
        .ok()
        .and_then(|text| text.parse::<usize>().ok())
        .ok_or_else(|| FramingError::InvalidHeader(String::from_utf8_lossy(header).into_owned()))
}

/// Write one framed message
pub async fn send<W>(writer: &mut W, payload: &[u8]) -> Result<(), FramingError>
where
    W: AsyncWrite + Unpin,
{
    let header = encode_header(payload.len())?;
    writer.write_all(&header).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one framed message
///
/// Loops until the header and then the full payload have arrived. A stream
/// that ends first yields `ConnectionClosed` instead of a short message.
pub async fn recv<R>(reader: &mut R) -> Result<Vec<u8>, FramingError>
where
    R: AsyncRead + Unpin,
{
    recv_bounded(reader, MAX_PAYLOAD_LEN).await
}

/// Read one framed message of at most `max_len` bytes. A larger header is
/// rejected before any payload buffer is allocated.
pub async fn recv_bounded<R>(reader: &mut R, max_len: usize) -> Result<Vec<u8>, FramingError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_WIDTH];
    read_full(reader, &mut header).await?;
    let len = decode_header(&header)?;
    if len > max_len {
        return Err(FramingError::PayloadTooLarge(len));
    }

    let mut payload = vec![0u8; len];
    read_full(reader, &mut payload).await?;
    Ok(payload)
}

async fn read_full<R>(reader: &mut R, buf: &mut [u8]) -> Result<(), FramingError>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            return Err(FramingError::ConnectionClosed {
                expected: buf.len(),
                received: filled,
            });
        }
        filled += n;
    }
    Ok(())
}
