//! Speaker output: every remote voice and the cue are mixed into one
//! cpal stream.

use std::collections::{HashMap, VecDeque};
use std::sync::{mpsc as std_mpsc, Arc, Mutex, MutexGuard};
use std::thread;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize, SampleFormat, SampleRate, Stream, StreamConfig, SupportedBufferSize};
use pitwall_common::{Error, Result};
use tracing::{error, info, warn};

use crate::audio::codec::{f32_to_i16, f32_to_u16};
use crate::audio::{MIXER_MAX_BUFFER_SAMPLES, VOICE_FRAME_SAMPLES, VOICE_SAMPLE_RATE};

#[derive(Default)]
struct MixerState {
    next_id: u64,
    sources: HashMap<u64, VecDeque<f32>>,
}

/// Mono mixer shared between producers and the output callback.
#[derive(Clone, Default)]
pub struct Mixer {
    state: Arc<Mutex<MixerState>>,
}

impl Mixer {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MixerState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn add_source(&self) -> MixerSource {
        let mut state = self.lock();
        state.next_id += 1;
        let id = state.next_id;
        state.sources.insert(id, VecDeque::new());
        MixerSource {
            id,
            mixer: self.clone(),
        }
    }

    pub fn source_count(&self) -> usize {
        self.lock().sources.len()
    }

    /// Sum one sample from every source into each slot of `out`.
    pub fn fill(&self, out: &mut [f32]) {
        let mut state = self.lock();
        for slot in out.iter_mut() {
            let mut sum = 0.0;
            for queue in state.sources.values_mut() {
                sum += queue.pop_front().unwrap_or(0.0);
            }
            *slot = sum.clamp(-1.0, 1.0);
        }
    }
}

/// One producer feeding the mixer. Removed from the mix on drop.
pub struct MixerSource {
    id: u64,
    mixer: Mixer,
}

impl MixerSource {
    pub fn push(&self, samples: &[f32]) {
        let mut state = self.mixer.lock();
        if let Some(queue) = state.sources.get_mut(&self.id) {
            queue.extend(samples.iter().copied());
            while queue.len() > MIXER_MAX_BUFFER_SAMPLES {
                queue.pop_front();
            }
        }
    }

    pub fn queued(&self) -> usize {
        self.mixer
            .lock()
            .sources
            .get(&self.id)
            .map_or(0, VecDeque::len)
    }
}

impl Drop for MixerSource {
    fn drop(&mut self) {
        self.mixer.lock().sources.remove(&self.id);
    }
}

/// Default output device playing a [`Mixer`].
///
/// The cpal stream lives on its own thread; dropping this stops it.
pub struct SpeakerOutput {
    mixer: Mixer,
    _stop: std_mpsc::Sender<()>,
}

impl SpeakerOutput {
    pub fn start(mixer: Mixer) -> Result<Self> {
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<()>>();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
        let stream_mixer = mixer.clone();

        thread::Builder::new()
            .name("pitwall-speaker".into())
            .spawn(move || match open_output_stream(stream_mixer) {
                Ok(stream) => {
                    let _ = ready_tx.send(Ok(()));
                    // Blocks until the owner is dropped.
                    let _ = stop_rx.recv();
                    drop(stream);
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                }
            })
            .map_err(|e| Error::media_acquisition(format!("speaker thread: {e}")))?;

        ready_rx
            .recv()
            .map_err(|_| Error::media_acquisition("speaker thread exited"))??;

        Ok(Self {
            mixer,
            _stop: stop_tx,
        })
    }

    pub fn mixer(&self) -> &Mixer {
        &self.mixer
    }
}

fn open_output_stream(mixer: Mixer) -> Result<Stream> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| Error::media_acquisition("no audio output device available"))?;
    let (config, sample_format) = select_output_config(&device)?;
    let channels = config.channels as usize;
    info!(
        "speaker output: {} Hz, {} channel(s), {:?}",
        config.sample_rate.0, channels, sample_format
    );

    let err_fn = |err| {
        error!("speaker stream error: {}", err);
    };
    let stream = match sample_format {
        SampleFormat::F32 => device.build_output_stream(
            &config,
            mixing_callback(mixer, channels, |v| v),
            err_fn,
            None,
        ),
        SampleFormat::I16 => device.build_output_stream(
            &config,
            mixing_callback(mixer, channels, f32_to_i16),
            err_fn,
            None,
        ),
        SampleFormat::U16 => device.build_output_stream(
            &config,
            mixing_callback(mixer, channels, f32_to_u16),
            err_fn,
            None,
        ),
        other => {
            return Err(Error::media_acquisition(format!(
                "unsupported output sample format {other:?}"
            )))
        }
    }
    .map_err(|e| Error::media_acquisition(format!("speaker stream: {e}")))?;

    stream
        .play()
        .map_err(|e| Error::media_acquisition(format!("failed to start speaker stream: {e}")))?;
    Ok(stream)
}

/// Output callback that mixes mono and copies it to every channel.
fn mixing_callback<T: Copy>(
    mixer: Mixer,
    channels: usize,
    convert: impl Fn(f32) -> T + Send + 'static,
) -> impl FnMut(&mut [T], &cpal::OutputCallbackInfo) + Send + 'static {
    let channels = channels.max(1);
    let mut mono = Vec::new();
    move |data: &mut [T], _| {
        let frames = data.len() / channels;
        mono.resize(frames, 0.0);
        mixer.fill(&mut mono);
        for (frame, value) in data.chunks_mut(channels).zip(mono.iter()) {
            let sample = convert(*value);
            for slot in frame.iter_mut() {
                *slot = sample;
            }
        }
    }
}

fn select_output_config(device: &cpal::Device) -> Result<(StreamConfig, SampleFormat)> {
    let configs = device
        .supported_output_configs()
        .map_err(|e| Error::media_acquisition(format!("output config query failed: {e}")))?;

    for cfg in configs {
        let min = cfg.min_sample_rate().0;
        let max = cfg.max_sample_rate().0;
        if min <= VOICE_SAMPLE_RATE && max >= VOICE_SAMPLE_RATE {
            let mut config = cfg.with_sample_rate(SampleRate(VOICE_SAMPLE_RATE)).config();
            if let SupportedBufferSize::Range { min, max } = cfg.buffer_size() {
                let desired = VOICE_FRAME_SAMPLES as u32;
                config.buffer_size = BufferSize::Fixed(desired.clamp(*min, *max));
            }
            return Ok((config, cfg.sample_format()));
        }
    }

    let fallback = device
        .default_output_config()
        .map_err(|e| Error::media_acquisition(format!("default output config error: {e}")))?;
    warn!(
        "output device does not support {} Hz; playing at {} Hz",
        VOICE_SAMPLE_RATE,
        fallback.sample_rate().0
    );
    Ok((fallback.config(), fallback.sample_format()))
}
