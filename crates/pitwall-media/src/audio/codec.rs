use std::collections::VecDeque;

use opus::{Application, Channels, Decoder as OpusDecoder, Encoder as OpusEncoder};
use pitwall_common::{Error, Result};
use pitwall_radio::AudioFrame;
use tracing::warn;

use super::{
    voice_frame_duration, MIXER_MAX_BUFFER_SAMPLES, OPUS_BITRATE_BPS, OPUS_MAX_FRAME_SAMPLES,
    OPUS_MAX_PACKET_BYTES, VOICE_CHANNELS, VOICE_FRAME_SAMPLES, VOICE_SAMPLE_RATE,
};

fn voice_channels() -> Channels {
    if VOICE_CHANNELS == 2 {
        Channels::Stereo
    } else {
        Channels::Mono
    }
}

/// Accumulates mono PCM and emits one Opus packet per 20ms frame.
pub struct VoiceEncoder {
    encoder: OpusEncoder,
    pcm: VecDeque<i16>,
}

impl VoiceEncoder {
    pub fn new() -> Result<Self> {
        let mut encoder = OpusEncoder::new(VOICE_SAMPLE_RATE, voice_channels(), Application::Voip)
            .map_err(|e| Error::media_acquisition(format!("opus encoder init failed: {e}")))?;
        encoder
            .set_bitrate(opus::Bitrate::Bits(OPUS_BITRATE_BPS))
            .map_err(|e| Error::media_acquisition(format!("opus bitrate set failed: {e}")))?;
        encoder.set_inband_fec(true).ok();
        encoder.set_dtx(false).ok();

        Ok(Self {
            encoder,
            pcm: VecDeque::with_capacity(MIXER_MAX_BUFFER_SAMPLES),
        })
    }

    pub fn push(&mut self, samples: &[i16]) -> Vec<AudioFrame> {
        self.pcm.extend(samples.iter().copied());
        if self.pcm.len() > MIXER_MAX_BUFFER_SAMPLES {
            let excess = self.pcm.len() - MIXER_MAX_BUFFER_SAMPLES;
            self.pcm.drain(..excess);
        }

        let frame_len = VOICE_FRAME_SAMPLES * VOICE_CHANNELS;
        let mut frames = Vec::new();
        while self.pcm.len() >= frame_len {
            let frame: Vec<i16> = self.pcm.drain(..frame_len).collect();
            let mut out = vec![0u8; OPUS_MAX_PACKET_BYTES];
            match self.encoder.encode(&frame, &mut out) {
                Ok(size) => {
                    out.truncate(size);
                    frames.push(AudioFrame::new(out, voice_frame_duration()));
                }
                Err(e) => {
                    warn!("opus encode error: {}", e);
                    break;
                }
            }
        }
        frames
    }

    pub fn buffered(&self) -> usize {
        self.pcm.len()
    }
}

/// Turns Opus packets back into mono f32 PCM.
pub struct VoiceDecoder {
    decoder: OpusDecoder,
    decode_buf: Vec<i16>,
}

impl VoiceDecoder {
    pub fn new() -> Result<Self> {
        let decoder = OpusDecoder::new(VOICE_SAMPLE_RATE, voice_channels())
            .map_err(|e| Error::internal(format!("opus decoder init failed: {e}")))?;
        Ok(Self {
            decoder,
            decode_buf: vec![0i16; OPUS_MAX_FRAME_SAMPLES * VOICE_CHANNELS],
        })
    }

    pub fn decode(&mut self, payload: &[u8]) -> Result<Vec<f32>> {
        let decoded = self
            .decoder
            .decode(payload, &mut self.decode_buf, false)
            .map_err(|e| Error::transport(format!("opus decode failed: {e}")))?;

        Ok(self
            .decode_buf
            .iter()
            .take(decoded * VOICE_CHANNELS)
            .map(|s| *s as f32 / i16::MAX as f32)
            .collect())
    }
}

pub(crate) fn f32_to_i16(value: f32) -> i16 {
    (value.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
}

pub(crate) fn u16_to_f32(value: u16) -> f32 {
    (value as f32 / u16::MAX as f32) * 2.0 - 1.0
}

pub(crate) fn f32_to_u16(value: f32) -> u16 {
    let scaled = value.clamp(-1.0, 1.0) * 0.5 + 0.5;
    (scaled * u16::MAX as f32) as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encoder_emits_whole_frames() {
        let mut encoder = VoiceEncoder::new().unwrap();
        assert!(encoder.push(&[0i16; 500]).is_empty());
        assert_eq!(encoder.buffered(), 500);

        let frames = encoder.push(&[0i16; 1500]);
        assert_eq!(frames.len(), 2);
        assert_eq!(encoder.buffered(), 2000 - 2 * VOICE_FRAME_SAMPLES);
        assert!(frames.iter().all(|f| f.duration == voice_frame_duration()));
    }

    #[test]
    fn test_decoder_yields_frame_of_samples() {
        let mut encoder = VoiceEncoder::new().unwrap();
        let tone: Vec<i16> = (0..VOICE_FRAME_SAMPLES)
            .map(|i| f32_to_i16((i as f32 * 0.05).sin() * 0.5))
            .collect();
        let frame = encoder.push(&tone).pop().unwrap();

        let mut decoder = VoiceDecoder::new().unwrap();
        let pcm = decoder.decode(&frame.data).unwrap();
        assert_eq!(pcm.len(), VOICE_FRAME_SAMPLES);
        assert!(pcm.iter().all(|s| (-1.0..=1.0).contains(s)));
    }

    #[test]
    fn test_sample_conversion_clamps() {
        assert_eq!(f32_to_i16(2.0), i16::MAX);
        assert_eq!(f32_to_i16(-2.0), -i16::MAX);
        assert_eq!(f32_to_u16(-1.0), 0);
        assert!((u16_to_f32(u16::MAX) - 1.0).abs() < 1e-6);
    }
}
