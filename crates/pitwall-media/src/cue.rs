//! Synthesized radio beep played before transmitting.

use std::f32::consts::TAU;
use std::time::Duration;

use async_trait::async_trait;
use pitwall_common::{Error, Result};
use pitwall_radio::CuePlayer;

use crate::audio::VOICE_SAMPLE_RATE;
use crate::output::Mixer;

/// Fade in/out length, avoids clicks at tone edges.
const RAMP: Duration = Duration::from_millis(5);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tone {
    pub frequency_hz: f32,
    pub duration: Duration,
    pub amplitude: f32,
}

/// Two short rising tones.
pub const RADIO_BEEP: [Tone; 2] = [
    Tone {
        frequency_hz: 1_200.0,
        duration: Duration::from_millis(70),
        amplitude: 0.35,
    },
    Tone {
        frequency_hz: 1_800.0,
        duration: Duration::from_millis(90),
        amplitude: 0.35,
    },
];

/// Mono samples for `tones` played back to back.
pub fn render_tones(tones: &[Tone], sample_rate: u32) -> Vec<f32> {
    let rate = sample_rate as f32;
    let ramp = (RAMP.as_secs_f32() * rate) as usize;
    let mut samples = Vec::new();

    for tone in tones {
        let len = (tone.duration.as_secs_f32() * rate).round() as usize;
        for i in 0..len {
            let edge = i.min(len - 1 - i);
            let envelope = if ramp == 0 || edge >= ramp {
                1.0
            } else {
                edge as f32 / ramp as f32
            };
            let phase = TAU * tone.frequency_hz * i as f32 / rate;
            samples.push(phase.sin() * tone.amplitude * envelope);
        }
    }
    samples
}

/// [`CuePlayer`] mixing [`RADIO_BEEP`] into the speaker output.
pub struct ToneCue {
    mixer: Option<Mixer>,
    tones: Vec<Tone>,
}

impl ToneCue {
    /// `None` means there is no output device; every play fails.
    pub fn new(mixer: Option<Mixer>) -> Self {
        Self {
            mixer,
            tones: RADIO_BEEP.to_vec(),
        }
    }

    pub fn with_tones(mut self, tones: Vec<Tone>) -> Self {
        self.tones = tones;
        self
    }

    pub fn duration(&self) -> Duration {
        self.tones.iter().map(|t| t.duration).sum()
    }
}

#[async_trait]
impl CuePlayer for ToneCue {
    async fn play(&self) -> Result<()> {
        let Some(mixer) = &self.mixer else {
            return Err(Error::cue("no audio output device"));
        };
        let source = mixer.add_source();
        source.push(&render_tones(&self.tones, VOICE_SAMPLE_RATE));
        tokio::time::sleep(self.duration()).await;
        // Give the output callback its last buffer before dropping the source.
        while source.queued() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        Ok(())
    }
}
