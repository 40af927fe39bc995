//! Seams between the engine and whatever moves audio between peers.
//!
//! The engine only speaks [`PeerTransport`] and [`TransportFactory`]. The
//! WebRTC implementation lives in the client crate; tests use loopbacks.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use pitwall_common::{IceCandidate, Result, SessionDescription};
use tokio::sync::{broadcast, mpsc};
use tracing::trace;

use crate::engine::EngineEvent;

/// Capacity of the local track fan-out. Slow peers lag and skip frames.
const LOCAL_TRACK_CAPACITY: usize = 64;

/// One encoded audio packet (Opus in the shipped client).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    pub data: Bytes,
    pub duration: Duration,
}

impl AudioFrame {
    pub fn new(data: impl Into<Bytes>, duration: Duration) -> Self {
        Self {
            data: data.into(),
            duration,
        }
    }
}

/// The local microphone track.
///
/// Capture publishes frames continuously; a transport that has the track
/// attached subscribes and forwards them, a detached one simply stops
/// listening.
#[derive(Clone)]
pub struct LocalTrack {
    id: String,
    frames: broadcast::Sender<AudioFrame>,
}

impl LocalTrack {
    pub fn new(id: impl Into<String>) -> Self {
        let (frames, _) = broadcast::channel(LOCAL_TRACK_CAPACITY);
        Self {
            id: id.into(),
            frames,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Publish a captured frame. Safe to call from audio callbacks.
    pub fn publish(&self, frame: AudioFrame) {
        // No receivers means nobody is transmitting; that is not an error.
        if self.frames.send(frame).is_err() {
            trace!("local track {} has no listeners", self.id);
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AudioFrame> {
        self.frames.subscribe()
    }

    pub fn listener_count(&self) -> usize {
        self.frames.receiver_count()
    }
}

impl fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.id)
            .field("listeners", &self.frames.receiver_count())
            .finish()
    }
}

/// A remote audio stream that arrived on a peer connection.
pub struct InboundStream {
    track_id: String,
    frames: mpsc::Receiver<AudioFrame>,
}

impl InboundStream {
    pub fn new(track_id: impl Into<String>, frames: mpsc::Receiver<AudioFrame>) -> Self {
        Self {
            track_id: track_id.into(),
            frames,
        }
    }

    pub fn track_id(&self) -> &str {
        &self.track_id
    }

    /// Next frame, or `None` once the remote track ended.
    pub async fn next_frame(&mut self) -> Option<AudioFrame> {
        self.frames.recv().await
    }
}

impl fmt::Debug for InboundStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundStream")
            .field("track_id", &self.track_id)
            .finish()
    }
}

/// Connectivity as reported by the transport itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkState {
    #[default]
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Something a transport noticed on its own.
#[derive(Debug)]
pub enum TransportEvent {
    LocalCandidate(IceCandidate),
    RemoteStream(InboundStream),
    LinkState(LinkState),
}

/// Where a transport reports its events.
///
/// Bound to one registry entry and one transport epoch, so events from a
/// replaced transport can be told apart.
#[derive(Clone)]
pub struct TransportEvents {
    remote_id: String,
    epoch: u64,
    tx: mpsc::UnboundedSender<EngineEvent>,
}

impl TransportEvents {
    pub(crate) fn new(
        remote_id: String,
        epoch: u64,
        tx: mpsc::UnboundedSender<EngineEvent>,
    ) -> Self {
        Self { remote_id, epoch, tx }
    }

    pub fn remote_id(&self) -> &str {
        &self.remote_id
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Returns `false` once the engine is gone.
    pub fn emit(&self, event: TransportEvent) -> bool {
        self.tx
            .send(EngineEvent::Transport {
                remote_id: self.remote_id.clone(),
                epoch: self.epoch,
                event,
            })
            .is_ok()
    }
}

/// One negotiated connection to a remote team address.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Create an offer and apply it as the local description.
    async fn create_offer(&self) -> Result<SessionDescription>;

    /// Create an answer for the applied remote offer and apply it locally.
    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    /// Start forwarding `track`. Called at most once between detaches.
    async fn attach_track(&self, track: &LocalTrack) -> Result<()>;

    /// Stop forwarding the local track. No-op when nothing is attached.
    async fn detach_track(&self) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn open(
        &self,
        remote_id: &str,
        events: TransportEvents,
    ) -> Result<Box<dyn PeerTransport>>;
}
