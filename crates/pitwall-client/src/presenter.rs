//! Speaker-backed [`Presenter`]: decodes accepted streams into the mixer and
//! meters them for the "on air" indicator.

use pitwall_media::{mean_level, Mixer, MixerSource, VoiceDecoder};
use pitwall_radio::{InboundStream, LevelReporter, Presenter};
use tracing::{debug, info, warn};

pub struct AudioPresenter {
    mixer: Mixer,
}

impl AudioPresenter {
    pub fn new(mixer: Mixer) -> Self {
        Self { mixer }
    }
}

impl Presenter for AudioPresenter {
    fn render(&self, key: &str, display_name: &str, stream: InboundStream, levels: LevelReporter) {
        let decoder = match VoiceDecoder::new() {
            Ok(decoder) => decoder,
            Err(e) => {
                warn!("cannot render {}: {}", key, e);
                return;
            }
        };
        let source = self.mixer.add_source();
        debug!("rendering {} ({}) from {}", key, display_name, stream.track_id());
        tokio::spawn(async move {
            play_stream(stream, decoder, source, |level| levels.report(level)).await;
            debug!("stream for {} ended", levels.key());
        });
    }

    fn session_started(&self, key: &str, display_name: &str) {
        info!("ON AIR  {} [{}]", display_name, key);
    }

    fn session_ended(&self, key: &str) {
        info!("off air {}", key);
    }
}

/// Decode until the stream ends or `report` says nobody is listening.
async fn play_stream(
    mut stream: InboundStream,
    mut decoder: VoiceDecoder,
    source: MixerSource,
    report: impl Fn(f32) -> bool,
) {
    while let Some(frame) = stream.next_frame().await {
        let pcm = match decoder.decode(&frame.data) {
            Ok(pcm) => pcm,
            Err(e) => {
                debug!("{}", e);
                continue;
            }
        };
        if !report(mean_level(&pcm)) {
            break;
        }
        source.push(&pcm);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use pitwall_media::VoiceEncoder;
    use pitwall_radio::AudioFrame;
    use tokio::sync::mpsc;

    use super::*;

    fn loud_frame(encoder: &mut VoiceEncoder) -> AudioFrame {
        let pcm: Vec<i16> = (0..960)
            .map(|i| if i % 2 == 0 { 12_000 } else { -12_000 })
            .collect();
        encoder.push(&pcm).pop().unwrap()
    }

    #[tokio::test]
    async fn test_stream_is_mixed_and_metered() {
        let mut encoder = VoiceEncoder::new().unwrap();
        let (tx, rx) = mpsc::channel(4);
        tx.send(loud_frame(&mut encoder)).await.unwrap();
        tx.send(AudioFrame::new(vec![0xffu8; 3], loud_frame(&mut encoder).duration))
            .await
            .unwrap();
        drop(tx);

        let mixer = Mixer::new();
        let source = mixer.add_source();
        let levels = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&levels);
        play_stream(
            InboundStream::new("remote", rx),
            VoiceDecoder::new().unwrap(),
            source,
            move |level| {
                seen.lock().unwrap().push(level);
                true
            },
        )
        .await;

        let levels = levels.lock().unwrap();
        assert!(!levels.is_empty());
        assert!(levels.iter().all(|l| (0.0..=255.0).contains(l)));
        // source dropped with the stream
        assert_eq!(mixer.source_count(), 0);
    }

    #[tokio::test]
    async fn test_stops_when_engine_gone() {
        let mut encoder = VoiceEncoder::new().unwrap();
        let (tx, rx) = mpsc::channel(4);
        tx.send(loud_frame(&mut encoder)).await.unwrap();
        tx.send(loud_frame(&mut encoder)).await.unwrap();

        let mixer = Mixer::new();
        let calls = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&calls);
        play_stream(
            InboundStream::new("remote", rx),
            VoiceDecoder::new().unwrap(),
            mixer.add_source(),
            move |_| {
                *counter.lock().unwrap() += 1;
                false
            },
        )
        .await;

        assert_eq!(*calls.lock().unwrap(), 1);
        drop(tx);
    }
}
