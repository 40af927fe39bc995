//! The radio engine actor.
//!
//! Every input (signaling, talk key, transport callbacks, cue completion,
//! amplitude samples, timers) is an [`EngineEvent`] on one queue, handled
//! one at a time by [`RadioEngine::run`].

use std::sync::Arc;
use std::time::Duration;

use pitwall_common::{Error, Result, Role, SignalEnvelope};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::context::{Identity, ListenTarget, RoutingSelection, SessionContext, SpeakTarget};
use crate::negotiator::{Negotiator, SignalOutcome};
use crate::presentation::{PresentationTracker, Presenter};
use crate::registry::{NegotiationState, PeerRegistry};
use crate::routing::{policy_for, InboundDecision, RoutingPolicy};
use crate::transmit::{CueOutcome, CuePlayer, TalkKeyState, TransmissionController};
use crate::transport::{
    InboundStream, LinkState, LocalTrack, TransportEvent, TransportFactory,
};

/// How often unanswered and failed entries are offered again.
pub const DEFAULT_REDIAL_INTERVAL: Duration = Duration::from_secs(3);

#[derive(Debug)]
pub enum EngineEvent {
    Signal(SignalEnvelope),
    SignalingOpened,
    TalkKeyDown,
    TalkKeyUp,
    CueFinished {
        generation: u64,
        outcome: CueOutcome,
    },
    Transport {
        remote_id: String,
        epoch: u64,
        event: TransportEvent,
    },
    Level {
        key: String,
        level: f32,
    },
    PresentationExpired {
        key: String,
        generation: u64,
    },
    SetListen {
        target: ListenTarget,
        reply: oneshot::Sender<Result<()>>,
    },
    SetSpeak {
        target: SpeakTarget,
        reply: oneshot::Sender<Result<()>>,
    },
    Snapshot(oneshot::Sender<EngineSnapshot>),
    Shutdown,
}

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub identity: Identity,
    /// Teams a director offers to when signaling opens
    pub roster: Vec<String>,
    pub cue_timeout: Duration,
    /// Period of the redial pass once signaling has opened
    pub redial_interval: Duration,
    /// Random when not set
    pub session_id: Option<String>,
}

impl EngineConfig {
    pub fn new(identity: Identity) -> Self {
        Self {
            identity,
            roster: Vec::new(),
            cue_timeout: crate::transmit::DEFAULT_CUE_TIMEOUT,
            redial_interval: DEFAULT_REDIAL_INTERVAL,
            session_id: None,
        }
    }
}

/// Collaborators the engine drives.
pub struct EngineDeps {
    pub factory: Arc<dyn TransportFactory>,
    pub cue: Arc<dyn CuePlayer>,
    pub presenter: Arc<dyn Presenter>,
    pub track: LocalTrack,
    /// Outbound envelopes for the signaling channel
    pub signal_tx: mpsc::UnboundedSender<SignalEnvelope>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSnapshot {
    pub remote_id: String,
    pub remote_name: String,
    pub state: NegotiationState,
    pub link: LinkState,
    pub attached: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSnapshot {
    pub session_id: String,
    pub role: Role,
    pub team_id: String,
    pub selection: RoutingSelection,
    pub talk_key: TalkKeyState,
    pub peers: Vec<PeerSnapshot>,
    /// Keys with a live presentation session
    pub presenting: Vec<String>,
    /// Keys an inbound stream was ever accepted for
    pub accepted: Vec<String>,
}

impl EngineSnapshot {
    pub fn peer(&self, remote_id: &str) -> Option<&PeerSnapshot> {
        self.peers.iter().find(|p| p.remote_id == remote_id)
    }

    pub fn attached_count(&self) -> usize {
        self.peers.iter().filter(|p| p.attached).count()
    }
}

/// Cloneable way into a running engine.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::UnboundedSender<EngineEvent>,
}

impl EngineHandle {
    fn post(&self, event: EngineEvent) -> Result<()> {
        self.tx
            .send(event)
            .map_err(|_| Error::internal("radio engine stopped"))
    }

    pub fn signal(&self, envelope: SignalEnvelope) -> Result<()> {
        self.post(EngineEvent::Signal(envelope))
    }

    pub fn signaling_opened(&self) -> Result<()> {
        self.post(EngineEvent::SignalingOpened)
    }

    pub fn talk_key_down(&self) -> Result<()> {
        self.post(EngineEvent::TalkKeyDown)
    }

    pub fn talk_key_up(&self) -> Result<()> {
        self.post(EngineEvent::TalkKeyUp)
    }

    pub async fn set_listen(&self, target: ListenTarget) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.post(EngineEvent::SetListen { target, reply })?;
        rx.await
            .map_err(|_| Error::internal("radio engine stopped"))?
    }

    pub async fn set_speak(&self, target: SpeakTarget) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.post(EngineEvent::SetSpeak { target, reply })?;
        rx.await
            .map_err(|_| Error::internal("radio engine stopped"))?
    }

    pub async fn snapshot(&self) -> Result<EngineSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.post(EngineEvent::Snapshot(reply))?;
        rx.await.map_err(|_| Error::internal("radio engine stopped"))
    }

    pub fn shutdown(&self) -> Result<()> {
        self.post(EngineEvent::Shutdown)
    }
}

pub struct RadioEngine {
    ctx: SessionContext,
    policy: Box<dyn RoutingPolicy>,
    registry: PeerRegistry,
    negotiator: Negotiator,
    controller: TransmissionController,
    tracker: PresentationTracker,
    roster: Vec<String>,
    redial_interval: Duration,
    /// Set by the first signaling open
    signaling_seen: bool,
    rx: mpsc::UnboundedReceiver<EngineEvent>,
}

impl RadioEngine {
    pub fn new(config: EngineConfig, deps: EngineDeps) -> (Self, EngineHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let session_id = config
            .session_id
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let role = config.identity.role();

        let engine = Self {
            ctx: SessionContext::new(config.identity),
            policy: policy_for(role),
            registry: PeerRegistry::new(),
            negotiator: Negotiator::new(deps.factory, deps.signal_tx, tx.clone(), session_id),
            controller: TransmissionController::new(
                deps.cue,
                config.cue_timeout,
                deps.track,
                tx.clone(),
            ),
            tracker: PresentationTracker::new(deps.presenter, tx.clone()),
            roster: config.roster,
            redial_interval: config.redial_interval,
            signaling_seen: false,
            rx,
        };
        (engine, EngineHandle { tx })
    }

    pub fn session_id(&self) -> &str {
        self.negotiator.session_id()
    }

    /// Run until [`EngineHandle::shutdown`]. Closes every transport on exit.
    pub async fn run(mut self) -> Result<()> {
        let identity = self.ctx.identity();
        info!(
            "radio engine started: {} {:?} as {:?} (session {})",
            identity.role(),
            identity.team_id(),
            identity.display_name(),
            self.negotiator.session_id()
        );

        // A zero period would panic
        let period = self.redial_interval.max(Duration::from_millis(1));
        let mut redial = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        redial.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                event = self.rx.recv() => {
                    let Some(event) = event else { break };
                    if matches!(event, EngineEvent::Shutdown) {
                        break;
                    }
                    self.dispatch(event).await;
                }
                _ = redial.tick() => self.redial().await,
            }
        }

        self.shutdown().await;
        Ok(())
    }

    async fn dispatch(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::Signal(envelope) => self.on_signal(envelope).await,
            EngineEvent::SignalingOpened => self.on_signaling_opened().await,
            EngineEvent::TalkKeyDown => {
                self.controller.key_down();
            }
            EngineEvent::TalkKeyUp => self.controller.key_up(&mut self.registry).await,
            EngineEvent::CueFinished {
                generation,
                outcome,
            } => {
                self.controller
                    .cue_finished(
                        &self.ctx,
                        self.policy.as_ref(),
                        &mut self.registry,
                        generation,
                        outcome,
                    )
                    .await
            }
            EngineEvent::Transport {
                remote_id,
                epoch,
                event,
            } => self.on_transport(remote_id, epoch, event).await,
            EngineEvent::Level { key, level } => self.tracker.on_level(&key, level),
            EngineEvent::PresentationExpired { key, generation } => {
                self.tracker.expire(&key, generation)
            }
            EngineEvent::SetListen { target, reply } => {
                let result = self.ctx.set_listen(target);
                if result.is_ok() {
                    info!("listening to {}", self.ctx.selection().listen);
                }
                let _ = reply.send(result);
            }
            EngineEvent::SetSpeak { target, reply } => {
                let result = self.ctx.set_speak(target);
                if result.is_ok() {
                    info!("speaking to {}", self.ctx.selection().speak);
                    self.reconcile().await;
                }
                let _ = reply.send(result);
            }
            EngineEvent::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            EngineEvent::Shutdown => {}
        }
    }

    async fn on_signal(&mut self, envelope: SignalEnvelope) {
        if !self.negotiator.accepts(&self.ctx, &envelope) {
            trace!(
                "filtered {} from {} to {}",
                envelope.payload.kind(),
                envelope.from,
                envelope.to
            );
            return;
        }

        match self
            .negotiator
            .handle(&self.ctx, &mut self.registry, envelope)
            .await
        {
            Ok(SignalOutcome::Negotiated { remote_id }) => {
                debug!("{} negotiated", remote_id);
                self.reconcile().await;
            }
            Ok(outcome) => trace!("signal handled: {:?}", outcome),
            Err(e @ Error::UnknownPeer(_)) => debug!("{}", e),
            Err(e) if e.is_contained() => warn!("{}", e),
            Err(e) => error!("signal handling failed: {}", e),
        }
    }

    /// Addresses this side offers to on its own initiative.
    fn announce_targets(&self) -> Vec<String> {
        let identity = self.ctx.identity();
        match identity.role() {
            Role::Driver => vec![identity.team_id().to_string()],
            Role::Director => self.roster.clone(),
        }
    }

    async fn on_signaling_opened(&mut self) {
        self.signaling_seen = true;
        let targets = self.announce_targets();
        info!("signaling open; announcing to {:?}", targets);
        self.negotiator
            .announce(&self.ctx, &mut self.registry, &targets)
            .await;
    }

    /// Repeat unanswered offers and restart failed entries. A driver that
    /// came online before any director is picked up this way.
    async fn redial(&mut self) {
        if !self.signaling_seen {
            return;
        }
        let targets = self.announce_targets();
        if targets.is_empty() {
            return;
        }
        trace!("redial pass over {:?}", targets);
        self.negotiator
            .announce(&self.ctx, &mut self.registry, &targets)
            .await;
    }

    async fn on_transport(&mut self, remote_id: String, epoch: u64, event: TransportEvent) {
        let current = self.registry.get(&remote_id).map(|e| e.epoch);
        if current != Some(epoch) {
            trace!("dropping event from replaced transport for {}", remote_id);
            return;
        }

        match event {
            TransportEvent::LocalCandidate(candidate) => {
                self.negotiator
                    .on_local_candidate(&self.ctx, &self.registry, &remote_id, candidate)
            }
            TransportEvent::RemoteStream(stream) => self.on_remote_stream(&remote_id, stream),
            TransportEvent::LinkState(state) => {
                if self
                    .negotiator
                    .on_link_state(&mut self.registry, &remote_id, state)
                {
                    self.reconcile().await;
                }
            }
        }
    }

    fn on_remote_stream(&mut self, remote_id: &str, stream: InboundStream) {
        let remote_name = self
            .registry
            .get(remote_id)
            .map(|e| e.remote_name.clone())
            .unwrap_or_else(|| remote_id.to_string());

        match self.policy.inbound(&self.ctx, remote_id, &remote_name) {
            InboundDecision::Accept { presentation_key } => {
                debug!("accepting stream from {} as {}", remote_id, presentation_key);
                self.tracker.present(&presentation_key, &remote_name, stream);
            }
            InboundDecision::Ignore => {
                debug!("ignoring stream from {} ({})", remote_id, remote_name);
            }
        }
    }

    async fn reconcile(&mut self) {
        self.controller
            .reconcile(&self.ctx, self.policy.as_ref(), &mut self.registry)
            .await;
    }

    fn snapshot(&self) -> EngineSnapshot {
        let mut peers: Vec<PeerSnapshot> = self
            .registry
            .iter()
            .map(|e| PeerSnapshot {
                remote_id: e.remote_id.clone(),
                remote_name: e.remote_name.clone(),
                state: e.state,
                link: e.link,
                attached: e.is_attached(),
            })
            .collect();
        peers.sort_by(|a, b| a.remote_id.cmp(&b.remote_id));

        let identity = self.ctx.identity();
        EngineSnapshot {
            session_id: self.negotiator.session_id().to_string(),
            role: identity.role(),
            team_id: identity.team_id().to_string(),
            selection: self.ctx.selection().clone(),
            talk_key: self.controller.state(),
            peers,
            presenting: self.tracker.active_keys(),
            accepted: self.tracker.accepted_keys(),
        }
    }

    async fn shutdown(&mut self) {
        self.controller.key_up(&mut self.registry).await;
        self.tracker.clear();
        for entry in self.registry.drain() {
            if let Some(transport) = entry.transport {
                if let Err(e) = transport.close().await {
                    debug!("closing transport for {}: {}", entry.remote_id, e);
                }
            }
        }
        info!("radio engine stopped");
    }
}
