//! Handshake and frame packet bodies.
//!
//! Both messages are CBOR maps. They travel inside the encrypted envelope of
//! [`crate::modules::crypto`], which in turn travels inside one framed message.

use serde::{Deserialize, Serialize};

use crate::ErrorKind;

/// Bytes per PCM sample (signed 16-bit little endian)
pub const BYTES_PER_SAMPLE: usize = 2;

/// Capability descriptor sent exactly once per session, before any frame.
///
/// `total_frames` is an upper bound on the frames that follow. It is 0 when
/// the container reports neither a frame count nor a duration; the stream
/// length is then unknown and ends when the server closes the connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamDescriptor {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub total_frames: u64,
    pub audio_sample_rate: u32,
    pub audio_channels: u16,
    pub samples_per_frame: u32,
    pub has_audio: bool,
}

impl StreamDescriptor {
    /// Exact size of every audio chunk in this stream
    pub fn audio_chunk_bytes(&self) -> usize {
        self.samples_per_frame as usize * self.audio_channels as usize * BYTES_PER_SAMPLE
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode_cbor(self)
    }

    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        ciborium::de::from_reader(data).map_err(|e| ProtocolError::DecodeError(e.to_string()))
    }
}

/// One video frame plus the audio aligned to it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FramePacket {
    /// Encoded image (JPEG)
    #[serde(with = "serde_bytes")]
    pub frame: Vec<u8>,

    /// Raw PCM for this frame's duration, null once audio is exhausted
    #[serde(with = "option_bytes")]
    pub audio: Option<Vec<u8>>,

    pub frame_number: u64,
}

impl FramePacket {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode_cbor(self)
    }

    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        ciborium::de::from_reader(data).map_err(|e| ProtocolError::DecodeError(e.to_string()))
    }
}

fn encode_cbor<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    let mut bytes = Vec::new();
    ciborium::ser::into_writer(value, &mut bytes)
        .map_err(|e| ProtocolError::EncodeError(e.to_string()))?;
    Ok(bytes)
}

/// Message body errors
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Failed to encode message: {0}")]
    EncodeError(String),

    #[error("Failed to decode message: {0}")]
    DecodeError(String),

    #[error("Frame {received} arrived, expected frame {expected}")]
    OutOfOrder { expected: u64, received: u64 },

    #[error("Audio chunk of {received} bytes, descriptor promises {expected}")]
    AudioChunkSize { expected: usize, received: usize },

    #[error("Audio chunk received but descriptor announced no audio")]
    UnexpectedAudio,
}

impl ProtocolError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Protocol
    }
}

/// Helper module for optional bytes fields.
mod option_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(bytes) => serializer.serialize_bytes(bytes),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<serde_bytes::ByteBuf>::deserialize(deserializer)
            .map(|opt| opt.map(|bb| bb.into_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor() -> StreamDescriptor {
        StreamDescriptor {
            width: 640,
            height: 360,
            fps: 29.97,
            total_frames: 90,
            audio_sample_rate: 44100,
            audio_channels: 2,
            samples_per_frame: 1471,
            has_audio: true,
        }
    }

    #[test]
    fn test_descriptor_roundtrip() {
        let encoded = descriptor().encode().unwrap();
        assert_eq!(StreamDescriptor::decode(&encoded).unwrap(), descriptor());
    }

    #[test]
    fn test_descriptor_chunk_bytes() {
        let mut d = descriptor();
        d.samples_per_frame = 1470;
        assert_eq!(d.audio_chunk_bytes(), 5880);
        d.samples_per_frame = 1920;
        assert_eq!(d.audio_chunk_bytes(), 7680);
    }

    #[test]
    fn test_descriptor_uses_field_names() {
        let encoded = descriptor().encode().unwrap();
        let value: ciborium::value::Value = ciborium::de::from_reader(&encoded[..]).unwrap();
        let map = value.as_map().unwrap();
        let keys: Vec<&str> = map.iter().filter_map(|(k, _)| k.as_text()).collect();
        for field in [
            "width",
            "height",
            "fps",
            "total_frames",
            "audio_sample_rate",
            "audio_channels",
            "samples_per_frame",
            "has_audio",
        ] {
            assert!(keys.contains(&field), "missing {}", field);
        }
    }

    #[test]
    fn test_packet_with_and_without_audio() {
        let with_audio = FramePacket {
            frame: vec![0xFF, 0xD8, 0xFF, 0xD9],
            audio: Some(vec![0u8; 5880]),
            frame_number: 12,
        };
        let without_audio = FramePacket {
            frame: vec![0xFF, 0xD8, 0xFF, 0xD9],
            audio: None,
            frame_number: 13,
        };

        let a = FramePacket::decode(&with_audio.encode().unwrap()).unwrap();
        let b = FramePacket::decode(&without_audio.encode().unwrap()).unwrap();
        assert_eq!(a, with_audio);
        assert_eq!(b, without_audio);
    }

    #[test]
    fn test_packet_bytes_are_cbor_byte_strings() {
        let packet = FramePacket {
            frame: vec![1, 2, 3],
            audio: None,
            frame_number: 0,
        };
        let encoded = packet.encode().unwrap();
        let value: ciborium::value::Value = ciborium::de::from_reader(&encoded[..]).unwrap();
        let map = value.as_map().unwrap();
        let frame = map
            .iter()
            .find(|(k, _)| k.as_text() == Some("frame"))
            .map(|(_, v)| v)
            .unwrap();
        assert!(frame.is_bytes());
        let audio = map
            .iter()
            .find(|(k, _)| k.as_text() == Some("audio"))
            .map(|(_, v)| v)
            .unwrap();
        assert!(audio.is_null());
    }

    #[test]
    fn test_garbage_does_not_decode() {
        assert!(matches!(
            FramePacket::decode(b"\xff\x00garbage"),
            Err(ProtocolError::DecodeError(_))
        ));
        // A descriptor is not a frame packet
        let encoded = descriptor().encode().unwrap();
        assert!(FramePacket::decode(&encoded).is_err());
    }
}
