//! Microphone capture into the local track.
//!
//! Capture runs for the whole session. Whether anyone hears it is decided
//! by which transports have the track attached.

use std::sync::mpsc as std_mpsc;
use std::thread;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize, SampleFormat, SampleRate, Stream, StreamConfig, SupportedBufferSize};
use pitwall_common::{Error, Result};
use pitwall_radio::LocalTrack;
use tracing::{info, warn};

use crate::audio::codec::{f32_to_i16, u16_to_f32, VoiceEncoder};
use crate::audio::{VOICE_FRAME_SAMPLES, VOICE_SAMPLE_RATE};

/// Open default input device feeding a [`LocalTrack`].
pub struct MicrophoneCapture {
    device_name: String,
    _stop: std_mpsc::Sender<()>,
}

impl MicrophoneCapture {
    /// Open the default microphone.
    ///
    /// Fails with [`Error::MediaAcquisition`] before returning if the device
    /// cannot be opened.
    pub fn start(track: LocalTrack) -> Result<Self> {
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<String>>();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

        thread::Builder::new()
            .name("pitwall-mic".into())
            .spawn(move || match open_input_stream(track) {
                Ok((stream, name)) => {
                    let _ = ready_tx.send(Ok(name));
                    let _ = stop_rx.recv();
                    drop(stream);
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                }
            })
            .map_err(|e| Error::media_acquisition(format!("microphone thread: {e}")))?;

        let device_name = ready_rx
            .recv()
            .map_err(|_| Error::media_acquisition("microphone thread exited"))??;

        Ok(Self {
            device_name,
            _stop: stop_tx,
        })
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }
}

fn open_input_stream(track: LocalTrack) -> Result<(Stream, String)> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| Error::media_acquisition("no microphone available"))?;
    let name = device.name().unwrap_or_else(|_| "default input".to_string());
    let (config, sample_format) = select_input_config(&device)?;
    let channels = config.channels as usize;
    if channels == 0 {
        return Err(Error::media_acquisition("invalid microphone channel count"));
    }
    info!(
        "microphone {:?}: {} Hz, {} channel(s), {:?}",
        name, config.sample_rate.0, channels, sample_format
    );

    let encoder = VoiceEncoder::new()?;
    let err_fn = |err| {
        warn!("microphone stream error: {}", err);
    };
    let stream = match sample_format {
        SampleFormat::F32 => device.build_input_stream(
            &config,
            capture_callback(encoder, track, channels, |v: f32| v),
            err_fn,
            None,
        ),
        SampleFormat::I16 => device.build_input_stream(
            &config,
            capture_callback(encoder, track, channels, |v: i16| v as f32 / i16::MAX as f32),
            err_fn,
            None,
        ),
        SampleFormat::U16 => device.build_input_stream(
            &config,
            capture_callback(encoder, track, channels, u16_to_f32),
            err_fn,
            None,
        ),
        other => {
            return Err(Error::media_acquisition(format!(
                "unsupported microphone sample format {other:?}"
            )))
        }
    }
    .map_err(|e| Error::media_acquisition(format!("microphone stream: {e}")))?;

    stream
        .play()
        .map_err(|e| Error::media_acquisition(format!("failed to start microphone: {e}")))?;
    Ok((stream, name))
}

/// Input callback: downmix to mono, encode, publish.
fn capture_callback<T: Copy>(
    mut encoder: VoiceEncoder,
    track: LocalTrack,
    channels: usize,
    to_f32: impl Fn(T) -> f32 + Send + 'static,
) -> impl FnMut(&[T], &cpal::InputCallbackInfo) + Send + 'static {
    let mut mono = Vec::new();
    move |data: &[T], _| {
        mono.clear();
        mono.extend(data.chunks(channels).map(|frame| {
            let sum: f32 = frame.iter().map(|s| to_f32(*s)).sum();
            f32_to_i16(sum / frame.len() as f32)
        }));
        for frame in encoder.push(&mono) {
            track.publish(frame);
        }
    }
}

fn select_input_config(device: &cpal::Device) -> Result<(StreamConfig, SampleFormat)> {
    let configs = device
        .supported_input_configs()
        .map_err(|e| Error::media_acquisition(format!("microphone config query failed: {e}")))?;

    let mut preferred: Option<(StreamConfig, SampleFormat)> = None;
    for cfg in configs {
        if cfg.channels() == 0 {
            continue;
        }
        let min = cfg.min_sample_rate().0;
        let max = cfg.max_sample_rate().0;
        if min <= VOICE_SAMPLE_RATE && max >= VOICE_SAMPLE_RATE {
            let mut config = cfg.with_sample_rate(SampleRate(VOICE_SAMPLE_RATE)).config();
            if let SupportedBufferSize::Range { min, max } = cfg.buffer_size() {
                let desired = VOICE_FRAME_SAMPLES as u32;
                config.buffer_size = BufferSize::Fixed(desired.clamp(*min, *max));
            }
            if cfg.channels() == 1 {
                return Ok((config, cfg.sample_format()));
            }
            preferred.get_or_insert((config, cfg.sample_format()));
        }
    }
    if let Some(found) = preferred {
        return Ok(found);
    }

    let fallback = device
        .default_input_config()
        .map_err(|e| Error::media_acquisition(format!("default microphone config error: {e}")))?;
    warn!(
        "microphone does not support {} Hz; capturing at {} Hz",
        VOICE_SAMPLE_RATE,
        fallback.sample_rate().0
    );
    Ok((fallback.config(), fallback.sample_format()))
}
