//! WebRTC peer transport built on `webrtc`.
//!
//! One `RTCPeerConnection` per registry entry, each with its own Opus
//! sample track. The track is added before negotiation so both directions
//! are in the SDP; whether anything is written to it is decided by
//! `attach_track` / `detach_track`.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use pitwall_common::{Error, IceCandidate, Result, SdpKind, SessionDescription};
use pitwall_radio::{
    AudioFrame, InboundStream, LinkState, LocalTrack, PeerTransport, TransportEvent,
    TransportEvents, TransportFactory,
};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use pitwall_media::audio::voice_frame_duration;

pub const DEFAULT_ICE_SERVER: &str = "stun:stun.l.google.com:19302";

/// Frames buffered between the RTP reader and the presenter.
const INBOUND_QUEUE: usize = 64;

/// Opens one [`RtcTransport`] per remote team address.
pub struct RtcTransportFactory {
    api: API,
    config: RTCConfiguration,
}

impl RtcTransportFactory {
    pub fn new(ice_servers: &[String]) -> Result<Self> {
        let mut media = MediaEngine::default();
        media
            .register_default_codecs()
            .map_err(|e| Error::internal(format!("webrtc codecs: {e}")))?;
        let registry = register_default_interceptors(Registry::new(), &mut media)
            .map_err(|e| Error::internal(format!("webrtc interceptors: {e}")))?;
        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();

        let urls = if ice_servers.is_empty() {
            vec![DEFAULT_ICE_SERVER.to_string()]
        } else {
            ice_servers.to_vec()
        };
        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls,
                ..Default::default()
            }],
            ..Default::default()
        };

        Ok(Self { api, config })
    }
}

#[async_trait]
impl TransportFactory for RtcTransportFactory {
    async fn open(
        &self,
        remote_id: &str,
        events: TransportEvents,
    ) -> Result<Box<dyn PeerTransport>> {
        let pc = Arc::new(
            self.api
                .new_peer_connection(self.config.clone())
                .await
                .map_err(|e| Error::transport(format!("peer connection: {e}")))?,
        );

        let audio = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                ..Default::default()
            },
            "audio".to_owned(),
            format!("pitwall-{}", events.epoch()),
        ));
        let sender = pc
            .add_track(Arc::clone(&audio) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| Error::transport(format!("add audio track: {e}")))?;

        // Interceptors only run if RTCP is read.
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while sender.read(&mut buf).await.is_ok() {}
        });

        install_callbacks(&pc, events);
        debug!("opened peer connection for {}", remote_id);

        Ok(Box::new(RtcTransport {
            remote_id: remote_id.to_string(),
            pc,
            audio,
            pump: Mutex::new(None),
        }))
    }
}

fn install_callbacks(pc: &RTCPeerConnection, events: TransportEvents) {
    let candidate_events = events.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let events = candidate_events.clone();
        Box::pin(async move {
            let Some(candidate) = candidate else {
                return;
            };
            match candidate.to_json() {
                Ok(init) => {
                    events.emit(TransportEvent::LocalCandidate(from_rtc_candidate(init)));
                }
                Err(e) => warn!("failed to serialize local candidate: {}", e),
            }
        })
    }));

    let state_events = events.clone();
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        let events = state_events.clone();
        Box::pin(async move {
            debug!("{} link state {}", events.remote_id(), state);
            events.emit(TransportEvent::LinkState(link_state(state)));
        })
    }));

    pc.on_track(Box::new(move |track: Arc<TrackRemote>, _, _| {
        let events = events.clone();
        Box::pin(async move {
            let (tx, rx) = mpsc::channel(INBOUND_QUEUE);
            info!("remote audio from {} ({})", events.remote_id(), track.id());
            events.emit(TransportEvent::RemoteStream(InboundStream::new(track.id(), rx)));
            tokio::spawn(read_remote(track, tx));
        })
    }));
}

async fn read_remote(track: Arc<TrackRemote>, tx: mpsc::Sender<AudioFrame>) {
    while let Ok((packet, _)) = track.read_rtp().await {
        if packet.payload.is_empty() {
            continue;
        }
        let frame = AudioFrame::new(packet.payload, voice_frame_duration());
        match tx.try_send(frame) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!("presenter behind, dropping frame on {}", track.id());
            }
            Err(mpsc::error::TrySendError::Closed(_)) => break,
        }
    }
    debug!("remote track {} ended", track.id());
}

pub struct RtcTransport {
    remote_id: String,
    pc: Arc<RTCPeerConnection>,
    audio: Arc<TrackLocalStaticSample>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl RtcTransport {
    fn take_pump(&self) -> Option<JoinHandle<()>> {
        match self.pump.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }

    fn set_pump(&self, handle: JoinHandle<()>) -> Option<JoinHandle<()>> {
        match self.pump.lock() {
            Ok(mut guard) => guard.replace(handle),
            Err(poisoned) => poisoned.into_inner().replace(handle),
        }
    }
}

#[async_trait]
impl PeerTransport for RtcTransport {
    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| Error::negotiation(&self.remote_id, e))?;
        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(|e| Error::negotiation(&self.remote_id, e))?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| Error::negotiation(&self.remote_id, e))?;
        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(|e| Error::negotiation(&self.remote_id, e))?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        let description = to_rtc_description(description)
            .map_err(|e| Error::negotiation(&self.remote_id, e))?;
        self.pc
            .set_remote_description(description)
            .await
            .map_err(|e| Error::negotiation(&self.remote_id, e))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.pc
            .add_ice_candidate(to_rtc_candidate(candidate))
            .await
            .map_err(|e| Error::transport(format!("candidate for {}: {e}", self.remote_id)))
    }

    async fn attach_track(&self, track: &LocalTrack) -> Result<()> {
        let mut frames = track.subscribe();
        let audio = Arc::clone(&self.audio);
        let remote_id = self.remote_id.clone();
        let pump = tokio::spawn(async move {
            loop {
                match frames.recv().await {
                    Ok(frame) => {
                        let sample = Sample {
                            data: frame.data,
                            duration: frame.duration,
                            ..Default::default()
                        };
                        if let Err(e) = audio.write_sample(&sample).await {
                            debug!("write to {} failed: {}", remote_id, e);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!("{} skipped {} frames", remote_id, skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        if let Some(previous) = self.set_pump(pump) {
            previous.abort();
        }
        Ok(())
    }

    async fn detach_track(&self) -> Result<()> {
        if let Some(pump) = self.take_pump() {
            pump.abort();
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if let Some(pump) = self.take_pump() {
            pump.abort();
        }
        self.pc
            .close()
            .await
            .map_err(|e| Error::transport(format!("close {}: {e}", self.remote_id)))
    }
}

fn link_state(state: RTCPeerConnectionState) -> LinkState {
    match state {
        RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => LinkState::New,
        RTCPeerConnectionState::Connecting => LinkState::Connecting,
        RTCPeerConnectionState::Connected => LinkState::Connected,
        RTCPeerConnectionState::Disconnected => LinkState::Disconnected,
        RTCPeerConnectionState::Failed => LinkState::Failed,
        RTCPeerConnectionState::Closed => LinkState::Closed,
    }
}

fn to_rtc_description(
    description: SessionDescription,
) -> std::result::Result<RTCSessionDescription, String> {
    let result = match description.kind {
        SdpKind::Offer => RTCSessionDescription::offer(description.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(description.sdp),
        SdpKind::Pranswer => RTCSessionDescription::pranswer(description.sdp),
        SdpKind::Rollback => return Err("rollback descriptions are not supported".to_string()),
    };
    result.map_err(|e| e.to_string())
}

fn to_rtc_candidate(candidate: IceCandidate) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: candidate.candidate,
        sdp_mid: candidate.sdp_mid,
        sdp_mline_index: candidate.sdp_mline_index,
        username_fragment: candidate.username_fragment,
    }
}

fn from_rtc_candidate(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    }
}
