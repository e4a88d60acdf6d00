//! Audio types crossing the media boundary
//!
//! The bridge never decodes audio itself; frames and chunks are opaque
//! payloads handed between the transport and the provider streams. The
//! media boundary runs voice activity detection and stamps each inbound
//! frame with an `is_speech` flag.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Wire encoding of audio payloads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AudioEncoding {
    /// 16-bit little-endian PCM
    #[default]
    PcmS16Le,
    /// 32-bit float little-endian PCM
    PcmF32Le,
    /// Opus frames
    Opus,
}

/// Format negotiated with the STT provider when opening a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u8,
    pub encoding: AudioEncoding,
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            channels: 1,
            encoding: AudioEncoding::PcmS16Le,
        }
    }
}

/// One inbound audio frame from the caller
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// Encoded payload
    pub data: Bytes,
    /// Capture timestamp in milliseconds, transport clock
    pub timestamp_ms: u64,
    /// Voice activity flag from the media boundary
    pub is_speech: bool,
}

impl AudioFrame {
    pub fn new(data: impl Into<Bytes>, timestamp_ms: u64, is_speech: bool) -> Self {
        Self {
            data: data.into(),
            timestamp_ms,
            is_speech,
        }
    }

    /// A frame carrying speech
    pub fn speech(data: impl Into<Bytes>, timestamp_ms: u64) -> Self {
        Self::new(data, timestamp_ms, true)
    }

    /// A frame carrying silence or background noise
    pub fn silence(timestamp_ms: u64) -> Self {
        Self::new(Bytes::new(), timestamp_ms, false)
    }
}

/// One outbound audio chunk from TTS, forwarded to the media sink
#[derive(Debug, Clone)]
pub struct AudioChunk {
    pub data: Bytes,
}

impl AudioChunk {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self { data: data.into() }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_format() {
        let format = AudioFormat::default();
        assert_eq!(format.sample_rate, 16_000);
        assert_eq!(format.channels, 1);
        assert_eq!(format.encoding, AudioEncoding::PcmS16Le);
    }

    #[test]
    fn test_frame_flags() {
        let frame = AudioFrame::speech(vec![0u8; 320], 20);
        assert!(frame.is_speech);
        assert_eq!(frame.timestamp_ms, 20);

        let frame = AudioFrame::silence(40);
        assert!(!frame.is_speech);
        assert!(frame.data.is_empty());
    }
}
