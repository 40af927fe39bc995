use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use pitwall_client::{
    Args, AudioPresenter, ClientConfig, Console, RtcTransportFactory, SignalingClient,
};
use pitwall_media::{MicrophoneCapture, Mixer, SpeakerOutput, ToneCue};
use pitwall_radio::{EngineDeps, LocalTrack, RadioEngine};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// How long to wait for transports to close on exit.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

fn main() -> Result<()> {
    let args = Args::parse();
    pitwall_common::init_tracing_with_default(&args.log_level);
    let config = ClientConfig::from_args(args)?;

    // The microphone is required; fail before touching the network.
    let track = LocalTrack::new("pitwall-mic");
    let mic = MicrophoneCapture::start(track.clone()).context("cannot start the radio")?;
    info!("capturing from {}", mic.device_name());

    let mixer = Mixer::new();
    let speaker = match SpeakerOutput::start(mixer.clone()) {
        Ok(speaker) => Some(speaker),
        Err(e) => {
            warn!("{}; incoming audio and the radio beep are muted", e);
            None
        }
    };

    let result = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(run(config, track, mixer, speaker.is_some()));

    drop(mic);
    drop(speaker);
    result
}

async fn run(
    config: ClientConfig,
    track: LocalTrack,
    mixer: Mixer,
    has_speaker: bool,
) -> Result<()> {
    let factory = RtcTransportFactory::new(&config.ice_servers)?;
    let cue = ToneCue::new(has_speaker.then(|| mixer.clone()));
    let (signal_tx, signal_rx) = mpsc::unbounded_channel();

    let (engine, handle) = RadioEngine::new(
        config.engine_config(),
        EngineDeps {
            factory: Arc::new(factory),
            cue: Arc::new(cue),
            presenter: Arc::new(AudioPresenter::new(mixer)),
            track,
            signal_tx,
        },
    );
    let engine_task = tokio::spawn(engine.run());

    let signaling = SignalingClient::new(config.signaling_url.clone())
        .with_reconnect_delay(config.reconnect_delay);
    let signaling_task = tokio::spawn(signaling.run(handle.clone(), signal_rx));

    let console = Console::new(handle.clone());
    tokio::select! {
        result = console.run() => {
            if let Err(e) = result {
                error!("console failed: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => info!("interrupted"),
    }

    info!("leaving the radio");
    let _ = handle.shutdown();
    match tokio::time::timeout(SHUTDOWN_GRACE, engine_task).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => error!("radio engine failed: {}", e),
        Ok(Err(e)) => error!("radio engine task failed: {}", e),
        Err(_) => warn!("radio engine did not stop in time"),
    }
    signaling_task.abort();
    Ok(())
}
