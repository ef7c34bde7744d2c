//! Opus frame codec for microphone and mixed broadcast audio.
//!
//! Every frame is 60 ms of 48 kHz mono, 16-bit little-endian PCM. One
//! [`FrameCodec`] is owned per connection (or per mixer channel) because the
//! decoder keeps the state packet-loss concealment is synthesized from.

use thiserror::Error;

use crate::error::ErrorCode;
use crate::protocol_constants::{
    FRAME_DURATION_MS, FRAME_SAMPLES, MAX_OPUS_PACKET_BYTES, OPUS_BITRATE_BPS,
    OPUS_PACKET_LOSS_PERC, SAMPLE_RATE,
};

/// Errors produced by the frame codec.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The Opus encoder or decoder could not be created or configured.
    #[error("codec init failed: {0}")]
    Init(opus::Error),

    /// The encoder rejected the PCM frame.
    #[error("encode failed: {0}")]
    Encode(opus::Error),

    /// The compressed frame is malformed.
    #[error("decode failed: {0}")]
    Decode(opus::Error),
}

impl ErrorCode for CodecError {
    fn code(&self) -> &'static str {
        match self {
            Self::Init(_) => "codec_init_failed",
            Self::Encode(_) => "codec_encode_failed",
            Self::Decode(_) => "codec_decode_failed",
        }
    }
}

pub type CodecResult<T> = Result<T, CodecError>;

/// Stateful Opus encoder/decoder pair with fixed voice policy.
pub struct FrameCodec {
    encoder: opus::Encoder,
    decoder: opus::Decoder,
    sample_rate: u32,
    frame_size: usize,
}

impl FrameCodec {
    /// Creates a codec tuned for 60 ms mono voice frames at 48 kHz.
    ///
    /// Voice application, in-band FEC and a fixed bitrate are set here and
    /// cannot be changed per call.
    pub fn new() -> CodecResult<Self> {
        let mut encoder =
            opus::Encoder::new(SAMPLE_RATE, opus::Channels::Mono, opus::Application::Voip)
                .map_err(CodecError::Init)?;
        encoder
            .set_bitrate(opus::Bitrate::Bits(OPUS_BITRATE_BPS))
            .map_err(CodecError::Init)?;
        encoder.set_inband_fec(true).map_err(CodecError::Init)?;
        encoder
            .set_packet_loss_perc(OPUS_PACKET_LOSS_PERC)
            .map_err(CodecError::Init)?;

        let decoder =
            opus::Decoder::new(SAMPLE_RATE, opus::Channels::Mono).map_err(CodecError::Init)?;

        Ok(Self {
            encoder,
            decoder,
            sample_rate: SAMPLE_RATE,
            frame_size: FRAME_SAMPLES,
        })
    }

    /// Expected samples per frame (`sample_rate * 60 / 1000`).
    #[must_use]
    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// Encodes little-endian 16-bit PCM into one Opus packet.
    ///
    /// A sample count other than the expected frame size is logged and passed
    /// through; Opus decides whether that length is acceptable.
    pub fn encode(&mut self, pcm: &[u8]) -> CodecResult<Vec<u8>> {
        let samples = pcm_to_samples(pcm);
        if samples.len() != self.frame_size {
            log::warn!(
                "[Codec] Frame size mismatch: got {} samples, expected {} ({}ms @ {}Hz)",
                samples.len(),
                self.frame_size,
                FRAME_DURATION_MS,
                self.sample_rate
            );
        }

        let mut out = vec![0u8; MAX_OPUS_PACKET_BYTES];
        let len = self
            .encoder
            .encode(&samples, &mut out)
            .map_err(CodecError::Encode)?;
        out.truncate(len);
        Ok(out)
    }

    /// Decodes one Opus packet into little-endian 16-bit PCM.
    ///
    /// An empty packet means "no data arrived" and yields a concealment frame
    /// instead of an error.
    pub fn decode(&mut self, packet: &[u8], frame_size: Option<usize>) -> CodecResult<Vec<u8>> {
        if packet.is_empty() {
            return self.decode_lost_frame(frame_size);
        }
        let mut out = vec![0i16; frame_size.unwrap_or(self.frame_size)];
        let decoded = self
            .decoder
            .decode(packet, &mut out, false)
            .map_err(CodecError::Decode)?;
        Ok(samples_to_pcm(&out[..decoded]))
    }

    /// Reconstructs the frame *preceding* `next_packet` from its in-band FEC data.
    pub fn decode_with_fec(
        &mut self,
        next_packet: &[u8],
        frame_size: Option<usize>,
    ) -> CodecResult<Vec<u8>> {
        let mut out = vec![0i16; frame_size.unwrap_or(self.frame_size)];
        let decoded = self
            .decoder
            .decode(next_packet, &mut out, true)
            .map_err(CodecError::Decode)?;
        Ok(samples_to_pcm(&out[..decoded]))
    }

    /// Synthesizes a replacement frame from decoder state (packet-loss concealment).
    pub fn decode_lost_frame(&mut self, frame_size: Option<usize>) -> CodecResult<Vec<u8>> {
        let mut out = vec![0i16; frame_size.unwrap_or(self.frame_size)];
        let decoded = self
            .decoder
            .decode(&[], &mut out, false)
            .map_err(CodecError::Decode)?;
        Ok(samples_to_pcm(&out[..decoded]))
    }
}

/// Interprets bytes as little-endian i16 samples. A trailing odd byte is ignored.
#[must_use]
pub fn pcm_to_samples(pcm: &[u8]) -> Vec<i16> {
    pcm.chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]))
        .collect()
}

/// Serializes samples as little-endian bytes.
#[must_use]
pub fn samples_to_pcm(samples: &[i16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for s in samples {
        out.extend_from_slice(&s.to_le_bytes());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol_constants::FRAME_BYTES;

    /// One 60 ms frame of a 440 Hz tone at moderate amplitude.
    fn tone_frame() -> Vec<u8> {
        let samples: Vec<i16> = (0..FRAME_SAMPLES)
            .map(|i| {
                let t = i as f32 / SAMPLE_RATE as f32;
                ((t * 440.0 * std::f32::consts::TAU).sin() * 8000.0) as i16
            })
            .collect();
        samples_to_pcm(&samples)
    }

    #[test]
    fn frame_size_is_derived_from_duration() {
        let codec = FrameCodec::new().unwrap();
        assert_eq!(codec.frame_size(), 2880);
        assert_eq!(FRAME_BYTES, 5760);
    }

    #[test]
    fn round_trip_preserves_frame_length() {
        let mut codec = FrameCodec::new().unwrap();
        let encoded = codec.encode(&tone_frame()).unwrap();
        assert!(!encoded.is_empty());
        assert!(encoded.len() < FRAME_BYTES);

        let decoded = codec.decode(&encoded, None).unwrap();
        assert_eq!(decoded.len(), FRAME_BYTES);
    }

    #[test]
    fn lost_frame_has_expected_length_on_fresh_decoder() {
        let mut codec = FrameCodec::new().unwrap();
        let concealed = codec.decode_lost_frame(None).unwrap();
        assert_eq!(concealed.len(), FRAME_SAMPLES * 2);
    }

    #[test]
    fn lost_frame_respects_explicit_frame_size() {
        let mut codec = FrameCodec::new().unwrap();
        let concealed = codec.decode_lost_frame(Some(960)).unwrap();
        assert_eq!(concealed.len(), 960 * 2);
    }

    #[test]
    fn empty_packet_routes_to_concealment() {
        let mut codec = FrameCodec::new().unwrap();
        let out = codec.decode(&[], None).unwrap();
        assert_eq!(out.len(), FRAME_BYTES);
    }

    #[test]
    fn malformed_packet_is_a_decode_error() {
        let mut codec = FrameCodec::new().unwrap();
        // TOC byte for code 3 with a frame count of zero is invalid.
        let err = codec.decode(&[0x03, 0x00], None).unwrap_err();
        assert!(matches!(err, CodecError::Decode(_)));
        assert_eq!(err.code(), "codec_decode_failed");
    }

    #[test]
    fn fec_recovers_a_full_frame() {
        let mut codec = FrameCodec::new().unwrap();
        let first = codec.encode(&tone_frame()).unwrap();
        let second = codec.encode(&tone_frame()).unwrap();
        codec.decode(&first, None).unwrap();
        let recovered = codec.decode_with_fec(&second, None).unwrap();
        assert_eq!(recovered.len(), FRAME_BYTES);
    }

    #[test]
    fn pcm_helpers_are_little_endian() {
        assert_eq!(pcm_to_samples(&[0x01, 0x02, 0xff]), vec![0x0201]);
        assert_eq!(samples_to_pcm(&[-2]), vec![0xfe, 0xff]);
    }
}
