//! Talk-key gating of the local microphone track.
//!
//! Key down plays the cue on a spawned task and reports back through the
//! engine queue. Only a completion for the current generation may start
//! transmitting, so a down/up/down sequence cannot attach early.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pitwall_common::{Error, Result};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::context::SessionContext;
use crate::engine::EngineEvent;
use crate::registry::{NegotiationState, PeerEntry, PeerRegistry};
use crate::routing::RoutingPolicy;
use crate::transport::LocalTrack;

pub const DEFAULT_CUE_TIMEOUT: Duration = Duration::from_secs(2);

/// Audible pre-transmission cue.
#[async_trait]
pub trait CuePlayer: Send + Sync {
    /// Resolves once the cue finished playing.
    async fn play(&self) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CueOutcome {
    Played,
    Failed(String),
    TimedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TalkKeyState {
    #[default]
    Idle,
    Cueing(u64),
    Transmitting(u64),
}

impl TalkKeyState {
    pub fn is_held(&self) -> bool {
        !matches!(self, TalkKeyState::Idle)
    }
}

pub struct TransmissionController {
    state: TalkKeyState,
    generation: u64,
    cue: Arc<dyn CuePlayer>,
    cue_timeout: Duration,
    track: LocalTrack,
    events_tx: mpsc::UnboundedSender<EngineEvent>,
}

impl TransmissionController {
    pub fn new(
        cue: Arc<dyn CuePlayer>,
        cue_timeout: Duration,
        track: LocalTrack,
        events_tx: mpsc::UnboundedSender<EngineEvent>,
    ) -> Self {
        Self {
            state: TalkKeyState::Idle,
            generation: 0,
            cue,
            cue_timeout,
            track,
            events_tx,
        }
    }

    pub fn state(&self) -> TalkKeyState {
        self.state
    }

    /// Returns `false` when the key was already held.
    pub fn key_down(&mut self) -> bool {
        if self.state.is_held() {
            return false;
        }
        self.generation += 1;
        let generation = self.generation;
        self.state = TalkKeyState::Cueing(generation);
        debug!("talk key down (generation {})", generation);

        let cue = self.cue.clone();
        let cue_timeout = self.cue_timeout;
        let events_tx = self.events_tx.clone();
        tokio::spawn(async move {
            let outcome = match tokio::time::timeout(cue_timeout, cue.play()).await {
                Ok(Ok(())) => CueOutcome::Played,
                Ok(Err(e)) => CueOutcome::Failed(e.to_string()),
                Err(_) => CueOutcome::TimedOut,
            };
            let _ = events_tx.send(EngineEvent::CueFinished {
                generation,
                outcome,
            });
        });
        true
    }

    /// Stop transmitting immediately, whatever the cue is doing.
    pub async fn key_up(&mut self, registry: &mut PeerRegistry) {
        if self.state.is_held() {
            debug!("talk key up");
        }
        self.state = TalkKeyState::Idle;
        self.detach_all(registry).await;
    }

    pub async fn cue_finished(
        &mut self,
        ctx: &SessionContext,
        policy: &dyn RoutingPolicy,
        registry: &mut PeerRegistry,
        generation: u64,
        outcome: CueOutcome,
    ) {
        if self.state != TalkKeyState::Cueing(generation) {
            debug!("ignoring cue completion for generation {}", generation);
            return;
        }
        match &outcome {
            CueOutcome::Played => {}
            CueOutcome::Failed(reason) => warn!("{}; transmitting anyway", Error::cue(reason)),
            CueOutcome::TimedOut => warn!("cue timed out; transmitting anyway"),
        }

        self.state = TalkKeyState::Transmitting(generation);
        info!("on air");
        self.reconcile(ctx, policy, registry).await;
    }

    /// Bring every entry's attachment in line with the outbound policy.
    ///
    /// Does nothing unless transmitting.
    pub async fn reconcile(
        &mut self,
        ctx: &SessionContext,
        policy: &dyn RoutingPolicy,
        registry: &mut PeerRegistry,
    ) {
        if !matches!(self.state, TalkKeyState::Transmitting(_)) {
            return;
        }
        for entry in registry.iter_mut() {
            let eligible = entry.state == NegotiationState::Connected
                && policy.outbound(ctx, &entry.remote_id);
            if eligible && !entry.is_attached() {
                self.attach(entry).await;
            } else if !eligible && entry.is_attached() {
                detach(entry).await;
            }
        }
    }

    pub async fn detach_all(&self, registry: &mut PeerRegistry) {
        for entry in registry.iter_mut().filter(|e| e.is_attached()) {
            detach(entry).await;
        }
    }

    async fn attach(&self, entry: &mut PeerEntry) {
        let Some(transport) = entry.transport.clone() else {
            return;
        };
        match transport.attach_track(&self.track).await {
            Ok(()) => {
                debug!("attached {} to {}", self.track.id(), entry.remote_id);
                entry.outbound = Some(self.track.id().to_string());
            }
            Err(e) => warn!("attach to {} failed: {}", entry.remote_id, e),
        }
    }
}

async fn detach(entry: &mut PeerEntry) {
    if let Some(transport) = entry.transport.clone() {
        if let Err(e) = transport.detach_track().await {
            warn!("detach from {} failed: {}", entry.remote_id, e);
        }
    }
    debug!("detached from {}", entry.remote_id);
    entry.outbound = None;
}
