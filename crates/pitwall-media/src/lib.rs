//! Platform audio for Pitwall.
//!
//! Microphone capture publishing Opus frames to a [`pitwall_radio::LocalTrack`],
//! a speaker [`Mixer`] that remote voices and the radio cue feed into, and
//! the [`ToneCue`] played before each transmission.

#![forbid(unsafe_code)]

pub mod audio;
pub mod capture;
pub mod cue;
pub mod output;

pub use audio::codec::{VoiceDecoder, VoiceEncoder};
pub use audio::level::{mean_level, mean_level_i16};
pub use capture::MicrophoneCapture;
pub use cue::{Tone, ToneCue, RADIO_BEEP};
pub use output::{Mixer, MixerSource, SpeakerOutput};
