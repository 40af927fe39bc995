use std::time::Duration;

pub const VOICE_SAMPLE_RATE: u32 = 48_000;
pub const VOICE_CHANNELS: usize = 1;
pub const VOICE_FRAME_MS: u32 = 20;
pub const VOICE_FRAME_SAMPLES: usize =
    (VOICE_SAMPLE_RATE as usize / 1000) * (VOICE_FRAME_MS as usize);
pub(crate) const OPUS_MAX_FRAME_SAMPLES: usize = 5_760;
pub(crate) const OPUS_MAX_PACKET_BYTES: usize = 4_000;
pub(crate) const OPUS_BITRATE_BPS: i32 = 32_000;

/// Per-source jitter allowance in the output mixer.
pub(crate) const MIXER_MAX_BUFFER_FRAMES: usize = 10;
pub(crate) const MIXER_MAX_BUFFER_SAMPLES: usize = VOICE_FRAME_SAMPLES * MIXER_MAX_BUFFER_FRAMES;

pub fn voice_frame_duration() -> Duration {
    Duration::from_millis(VOICE_FRAME_MS as u64)
}

pub mod codec;
pub mod level;
