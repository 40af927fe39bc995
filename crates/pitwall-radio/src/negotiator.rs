//! Offer/answer/candidate exchange over the signaling channel.
//!
//! The negotiator is owned by the engine actor and only ever runs inside
//! it, so every description and candidate for one entry is applied in the
//! order the envelopes were queued.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use pitwall_common::{
    Error, IceCandidate, Result, Role, SessionDescription, SignalEnvelope, SignalPayload,
};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::context::SessionContext;
use crate::engine::EngineEvent;
use crate::registry::{
    NegotiationEvent, NegotiationState, PeerEntry, PeerRegistry, PendingCandidate,
};
use crate::transport::{LinkState, TransportEvents, TransportFactory};

/// Candidates parked per remote id while no entry can take them.
pub const MAX_PARKED_CANDIDATES: usize = 32;

/// What handling one envelope amounted to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalOutcome {
    /// Descriptions are exchanged on this entry.
    Negotiated { remote_id: String },
    /// A duplicate offer was answered from cache.
    Replayed,
    /// We won an offer collision and kept our own offer.
    CollisionKept,
    /// Answer for an entry that was not waiting for one.
    StaleAnswer,
    CandidateApplied,
    CandidateBuffered,
    CandidateDuplicate,
    /// Envelope from a process this entry is not negotiated with.
    Foreign,
}

pub struct Negotiator {
    factory: Arc<dyn TransportFactory>,
    signal_tx: mpsc::UnboundedSender<SignalEnvelope>,
    events_tx: mpsc::UnboundedSender<EngineEvent>,
    session_id: String,
    /// Candidates for unknown entries or for sessions an entry is not
    /// negotiated with yet, keyed by remote id
    parked: HashMap<String, VecDeque<PendingCandidate>>,
}

impl Negotiator {
    pub fn new(
        factory: Arc<dyn TransportFactory>,
        signal_tx: mpsc::UnboundedSender<SignalEnvelope>,
        events_tx: mpsc::UnboundedSender<EngineEvent>,
        session_id: String,
    ) -> Self {
        Self {
            factory,
            signal_tx,
            events_tx,
            session_id,
            parked: HashMap::new(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Number of parked candidates for `remote_id`.
    pub fn parked_count(&self, remote_id: &str) -> usize {
        self.parked.get(remote_id).map_or(0, VecDeque::len)
    }

    /// Signaling filter applied before any envelope is handled.
    pub fn accepts(&self, ctx: &SessionContext, envelope: &SignalEnvelope) -> bool {
        if !ctx.accepts_address(&envelope.to) {
            return false;
        }
        // Relay echo of our own envelope
        if envelope.session.as_deref() == Some(self.session_id.as_str()) {
            return false;
        }
        if let Some(target) = &envelope.to_session {
            if target != &self.session_id {
                return false;
            }
        }
        !(ctx.identity().is_director() && envelope.from_role == Some(Role::Director))
    }

    pub async fn handle(
        &mut self,
        ctx: &SessionContext,
        registry: &mut PeerRegistry,
        envelope: SignalEnvelope,
    ) -> Result<SignalOutcome> {
        trace!(
            "{} from {} to {} ({})",
            envelope.payload.kind(),
            envelope.from,
            envelope.to,
            envelope.speaker_name()
        );

        match envelope.payload.clone() {
            SignalPayload::Offer { offer } => self.on_offer(ctx, registry, &envelope, offer).await,
            SignalPayload::Answer { answer } => self.on_answer(registry, &envelope, answer).await,
            SignalPayload::IceCandidate { ice } => {
                self.on_remote_candidate(registry, &envelope, ice).await
            }
        }
    }

    /// Offer to each of `targets` that is not negotiated.
    ///
    /// Entries still waiting for an answer get their offer again, since the
    /// remote may have joined the relay after it went out. Failed entries
    /// are reset and offered afresh. Entries mid-exchange or connected are
    /// left alone.
    pub async fn announce(
        &mut self,
        ctx: &SessionContext,
        registry: &mut PeerRegistry,
        targets: &[String],
    ) {
        for remote_id in targets {
            let (entry, _) = registry.get_or_create(remote_id);
            match entry.state {
                NegotiationState::New => {}
                NegotiationState::HaveLocalOffer => {
                    if let Some(offer) = entry.last_local_offer.clone() {
                        debug!("repeating offer to {}", remote_id);
                        self.send(ctx, entry, SignalPayload::Offer { offer });
                        continue;
                    }
                }
                NegotiationState::Failed => {
                    info!("redialing {} after failure", remote_id);
                    self.reset_entry(entry).await;
                }
                NegotiationState::HaveRemoteOffer | NegotiationState::Connected => {
                    trace!("not re-offering {} in state {}", remote_id, entry.state);
                    continue;
                }
            }
            if let Err(e) = self.offer(ctx, entry).await {
                warn!("announce to {} failed: {}", remote_id, e);
            }
        }
    }

    async fn offer(&mut self, ctx: &SessionContext, entry: &mut PeerEntry) -> Result<()> {
        self.ensure_transport(entry).await?;
        let Some(transport) = entry.transport.clone() else {
            return Err(Error::internal("transport missing after open"));
        };

        let offer = match transport.create_offer().await {
            Ok(offer) => offer,
            Err(e) => {
                entry.advance(NegotiationEvent::LinkFailed);
                return Err(Error::negotiation(&entry.remote_id, e));
            }
        };
        entry.advance(NegotiationEvent::LocalOffer);
        entry.last_local_offer = Some(offer.clone());

        info!("offering to {}", entry.remote_id);
        self.send(ctx, entry, SignalPayload::Offer { offer });
        Ok(())
    }

    async fn on_offer(
        &mut self,
        ctx: &SessionContext,
        registry: &mut PeerRegistry,
        envelope: &SignalEnvelope,
        offer: SessionDescription,
    ) -> Result<SignalOutcome> {
        let remote_id = envelope.from.clone();
        let (entry, created) = registry.get_or_create(&remote_id);
        if created {
            debug!("new entry for {}", remote_id);
        }

        match entry.state {
            NegotiationState::New => {}
            NegotiationState::HaveLocalOffer => {
                if self.wins_collision(envelope.session.as_deref()) {
                    debug!("offer collision with {}: keeping ours", remote_id);
                    // The remote may never have seen our offer; point it at them.
                    entry.note_sender(envelope);
                    if let Some(local) = entry.last_local_offer.clone() {
                        self.send(ctx, entry, SignalPayload::Offer { offer: local });
                    }
                    return Ok(SignalOutcome::CollisionKept);
                }
                debug!("offer collision with {}: yielding", remote_id);
                self.reset_entry(entry).await;
            }
            _ => {
                let same_process = entry.remote_session == envelope.session;
                let same_offer = entry.last_remote_offer.as_deref() == Some(offer.sdp.as_str());
                if same_process && same_offer {
                    if let Some(answer) = entry.last_local_answer.clone() {
                        debug!("replaying answer to duplicate offer from {}", remote_id);
                        self.send(ctx, entry, SignalPayload::Answer { answer });
                        return Ok(SignalOutcome::Replayed);
                    }
                }
                info!(
                    "fresh offer from {} supersedes state {}",
                    remote_id, entry.state
                );
                self.reset_entry(entry).await;
            }
        }

        entry.note_sender(envelope);
        self.ensure_transport(entry).await?;
        let Some(transport) = entry.transport.clone() else {
            return Err(Error::internal("transport missing after open"));
        };

        if let Err(e) = transport.set_remote_description(offer.clone()).await {
            entry.advance(NegotiationEvent::LinkFailed);
            return Err(Error::negotiation(&remote_id, e));
        }
        entry.advance(NegotiationEvent::RemoteOffer);
        entry.remote_description_set = true;
        entry.last_remote_offer = Some(offer.sdp);

        let answer = match transport.create_answer().await {
            Ok(answer) => answer,
            Err(e) => {
                entry.advance(NegotiationEvent::LinkFailed);
                return Err(Error::negotiation(&remote_id, e));
            }
        };
        entry.advance(NegotiationEvent::LocalAnswer);
        entry.last_local_answer = Some(answer.clone());

        self.flush_candidates(entry).await;

        info!("answering {} ({})", remote_id, entry.remote_name);
        self.send(ctx, entry, SignalPayload::Answer { answer });
        Ok(SignalOutcome::Negotiated { remote_id })
    }

    async fn on_answer(
        &mut self,
        registry: &mut PeerRegistry,
        envelope: &SignalEnvelope,
        answer: SessionDescription,
    ) -> Result<SignalOutcome> {
        let remote_id = envelope.from.as_str();
        let Some(entry) = registry.get_mut(remote_id) else {
            return Err(Error::unknown_peer(remote_id));
        };

        if entry.state != NegotiationState::HaveLocalOffer {
            debug!("stale answer from {} in state {}", remote_id, entry.state);
            return Ok(SignalOutcome::StaleAnswer);
        }
        if entry.is_foreign(envelope) {
            debug!("answer from another process on {}", remote_id);
            return Ok(SignalOutcome::Foreign);
        }
        let Some(transport) = entry.transport.clone() else {
            return Err(Error::internal("offering entry without transport"));
        };

        if let Err(e) = transport.set_remote_description(answer).await {
            entry.advance(NegotiationEvent::LinkFailed);
            return Err(Error::negotiation(remote_id, e));
        }
        entry.advance(NegotiationEvent::RemoteAnswer);
        entry.remote_description_set = true;
        entry.note_sender(envelope);

        self.flush_candidates(entry).await;

        info!("negotiated with {} ({})", remote_id, entry.remote_name);
        Ok(SignalOutcome::Negotiated {
            remote_id: remote_id.to_string(),
        })
    }

    async fn on_remote_candidate(
        &mut self,
        registry: &mut PeerRegistry,
        envelope: &SignalEnvelope,
        candidate: IceCandidate,
    ) -> Result<SignalOutcome> {
        let remote_id = envelope.from.as_str();
        let pending = PendingCandidate::new(envelope.session.clone(), candidate.clone());
        let Some(entry) = registry.get_mut(remote_id) else {
            self.park(remote_id, pending);
            return Err(Error::unknown_peer(remote_id));
        };

        // Kept for the offer that will replace this entry's process
        if entry.is_foreign(envelope) {
            trace!("parking candidate from another process on {}", remote_id);
            self.park(remote_id, pending);
            return Ok(SignalOutcome::Foreign);
        }
        if !entry.remember_candidate(&candidate) {
            return Ok(SignalOutcome::CandidateDuplicate);
        }
        if !entry.remote_description_set {
            entry.pending_candidates.push(pending);
            return Ok(SignalOutcome::CandidateBuffered);
        }

        let Some(transport) = entry.transport.clone() else {
            entry.pending_candidates.push(pending);
            return Ok(SignalOutcome::CandidateBuffered);
        };
        transport
            .add_ice_candidate(candidate)
            .await
            .map_err(|e| Error::negotiation(remote_id, e))?;
        Ok(SignalOutcome::CandidateApplied)
    }

    /// Forward a locally gathered candidate to the entry's remote.
    pub fn on_local_candidate(
        &self,
        ctx: &SessionContext,
        registry: &PeerRegistry,
        remote_id: &str,
        candidate: IceCandidate,
    ) {
        let Some(entry) = registry.get(remote_id) else {
            return;
        };
        self.send(ctx, entry, SignalPayload::IceCandidate { ice: candidate });
    }

    /// Record a transport link state. Returns `true` when the link failed.
    pub fn on_link_state(
        &self,
        registry: &mut PeerRegistry,
        remote_id: &str,
        state: LinkState,
    ) -> bool {
        let Some(entry) = registry.get_mut(remote_id) else {
            return false;
        };
        if entry.link != state {
            debug!("link to {}: {:?} -> {:?}", remote_id, entry.link, state);
        }
        entry.link = state;

        if state == LinkState::Failed {
            warn!("link to {} failed", remote_id);
            entry.advance(NegotiationEvent::LinkFailed);
            return true;
        }
        false
    }

    fn wins_collision(&self, remote_session: Option<&str>) -> bool {
        match remote_session {
            Some(theirs) => self.session_id.as_str() > theirs,
            None => false,
        }
    }

    async fn ensure_transport(&self, entry: &mut PeerEntry) -> Result<()> {
        if entry.transport.is_some() {
            return Ok(());
        }
        let events = TransportEvents::new(
            entry.remote_id.clone(),
            entry.epoch,
            self.events_tx.clone(),
        );
        let transport = self
            .factory
            .open(&entry.remote_id, events)
            .await
            .map_err(|e| Error::negotiation(&entry.remote_id, e))?;
        entry.transport = Some(Arc::from(transport));
        Ok(())
    }

    /// Reset `entry` for a fresh offer. Buffered candidates are parked so
    /// the ones from the offering session survive into the new transport.
    async fn reset_entry(&mut self, entry: &mut PeerEntry) {
        for pending in std::mem::take(&mut entry.pending_candidates) {
            self.park(&entry.remote_id, pending);
        }
        // The replaced process will not be negotiated with again
        if let (Some(old), Some(parked)) = (
            entry.remote_session.as_deref(),
            self.parked.get_mut(&entry.remote_id),
        ) {
            parked.retain(|p| p.session.as_deref() != Some(old));
        }
        if let Some(old) = entry.reset() {
            if let Err(e) = old.close().await {
                debug!("closing replaced transport for {}: {}", entry.remote_id, e);
            }
        }
    }

    fn park(&mut self, remote_id: &str, pending: PendingCandidate) {
        let parked = self.parked.entry(remote_id.to_string()).or_default();
        if parked.contains(&pending) {
            return;
        }
        if parked.len() >= MAX_PARKED_CANDIDATES {
            parked.pop_front();
        }
        parked.push_back(pending);
    }

    /// Apply buffered and parked candidates once the remote description is
    /// set. Candidates from other sessions stay parked.
    async fn flush_candidates(&mut self, entry: &mut PeerEntry) {
        let mut queued = Vec::new();
        let mut waiting = VecDeque::new();
        let parked = self.parked.remove(&entry.remote_id).unwrap_or_default();
        for pending in std::mem::take(&mut entry.pending_candidates)
            .into_iter()
            .chain(parked)
        {
            if !entry.belongs(pending.session.as_deref()) {
                waiting.push_back(pending);
            } else if entry.remember_candidate(&pending.candidate) {
                queued.push(pending.candidate);
            }
        }
        if !waiting.is_empty() {
            self.parked.insert(entry.remote_id.clone(), waiting);
        }

        let Some(transport) = entry.transport.clone() else {
            return;
        };

        if !queued.is_empty() {
            debug!(
                "applying {} early candidates for {}",
                queued.len(),
                entry.remote_id
            );
        }
        for candidate in queued {
            if let Err(e) = transport.add_ice_candidate(candidate).await {
                warn!("early candidate for {} rejected: {}", entry.remote_id, e);
            }
        }
    }

    fn send(&self, ctx: &SessionContext, entry: &PeerEntry, payload: SignalPayload) {
        let identity = ctx.identity();
        let envelope = SignalEnvelope::new(
            payload,
            entry.remote_id.clone(),
            identity.signaling_address(&entry.remote_id),
        )
        .with_sender(identity.display_name(), identity.role(), &self.session_id)
        .with_to_session(entry.remote_session.clone());

        if self.signal_tx.send(envelope).is_err() {
            debug!("signaling sink closed; dropping envelope");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Identity;
    use crate::transport::PeerTransport;
    use crate::transport::LocalTrack;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Log {
        calls: Mutex<Vec<String>>,
    }

    impl Log {
        fn push(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    struct RecordingTransport {
        log: Arc<Log>,
        epoch: u64,
    }

    #[async_trait]
    impl PeerTransport for RecordingTransport {
        async fn create_offer(&self) -> Result<SessionDescription> {
            self.log.push(format!("offer@{}", self.epoch));
            Ok(SessionDescription::offer(format!("local-offer-{}", self.epoch)))
        }

        async fn create_answer(&self) -> Result<SessionDescription> {
            self.log.push(format!("answer@{}", self.epoch));
            Ok(SessionDescription::answer(format!("local-answer-{}", self.epoch)))
        }

        async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
            if description.sdp == "garbage" {
                return Err(Error::transport("unparseable sdp"));
            }
            self.log.push(format!("remote:{}@{}", description.sdp, self.epoch));
            Ok(())
        }

        async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
            self.log.push(format!("ice:{}@{}", candidate.candidate, self.epoch));
            Ok(())
        }

        async fn attach_track(&self, _track: &LocalTrack) -> Result<()> {
            Ok(())
        }

        async fn detach_track(&self) -> Result<()> {
            Ok(())
        }

        async fn close(&self) -> Result<()> {
            self.log.push(format!("close@{}", self.epoch));
            Ok(())
        }
    }

    struct RecordingFactory {
        log: Arc<Log>,
    }

    #[async_trait]
    impl TransportFactory for RecordingFactory {
        async fn open(
            &self,
            _remote_id: &str,
            events: TransportEvents,
        ) -> Result<Box<dyn PeerTransport>> {
            Ok(Box::new(RecordingTransport {
                log: self.log.clone(),
                epoch: events.epoch(),
            }))
        }
    }

    struct Harness {
        negotiator: Negotiator,
        registry: PeerRegistry,
        ctx: SessionContext,
        log: Arc<Log>,
        sent: mpsc::UnboundedReceiver<SignalEnvelope>,
        _events: mpsc::UnboundedReceiver<EngineEvent>,
    }

    fn harness(role: Role, team: &str, session: &str) -> Harness {
        let log = Arc::new(Log::default());
        let (signal_tx, sent) = mpsc::unbounded_channel();
        let (events_tx, events) = mpsc::unbounded_channel();
        let negotiator = Negotiator::new(
            Arc::new(RecordingFactory { log: log.clone() }),
            signal_tx,
            events_tx,
            session.to_string(),
        );
        let name = if role == Role::Director { "Race Control" } else { "Lando" };
        Harness {
            negotiator,
            registry: PeerRegistry::new(),
            ctx: SessionContext::new(Identity::new(role, team, name).unwrap()),
            log,
            sent,
            _events: events,
        }
    }

    impl Harness {
        async fn handle(&mut self, envelope: SignalEnvelope) -> Result<SignalOutcome> {
            self.negotiator
                .handle(&self.ctx, &mut self.registry, envelope)
                .await
        }

        fn drain_sent(&mut self) -> Vec<SignalEnvelope> {
            let mut out = Vec::new();
            while let Ok(env) = self.sent.try_recv() {
                out.push(env);
            }
            out
        }
    }

    fn offer(from: &str, sdp: &str, session: &str) -> SignalEnvelope {
        SignalEnvelope::new(
            SignalPayload::Offer {
                offer: SessionDescription::offer(sdp),
            },
            from,
            from,
        )
        .with_sender("Max", Role::Driver, session)
    }

    fn answer(from: &str, sdp: &str, session: &str) -> SignalEnvelope {
        SignalEnvelope::new(
            SignalPayload::Answer {
                answer: SessionDescription::answer(sdp),
            },
            from,
            from,
        )
        .with_sender("Max", Role::Driver, session)
    }

    fn candidate(from: &str, line: &str, session: &str) -> SignalEnvelope {
        SignalEnvelope::new(
            SignalPayload::IceCandidate {
                ice: IceCandidate::new(line),
            },
            from,
            from,
        )
        .with_sender("Max", Role::Driver, session)
    }

    #[tokio::test]
    async fn test_offer_is_answered() {
        let mut h = harness(Role::Director, "", "m");
        let outcome = h.handle(offer("redteam", "remote-offer", "r")).await.unwrap();
        assert_eq!(
            outcome,
            SignalOutcome::Negotiated {
                remote_id: "redteam".into()
            }
        );

        let entry = h.registry.get("redteam").unwrap();
        assert_eq!(entry.state, NegotiationState::Connected);
        assert_eq!(entry.remote_name, "Max");

        let sent = h.drain_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, "redteam");
        // A director speaks on the team's own channel
        assert_eq!(sent[0].from, "redteam");
        assert_eq!(sent[0].to_session.as_deref(), Some("r"));
        assert_eq!(sent[0].session.as_deref(), Some("m"));
        assert!(matches!(sent[0].payload, SignalPayload::Answer { .. }));
    }

    #[tokio::test]
    async fn test_answer_for_unknown_peer() {
        let mut h = harness(Role::Director, "", "m");
        let err = h.handle(answer("redteam", "x", "r")).await.unwrap_err();
        assert!(matches!(err, Error::UnknownPeer(ref id) if id == "redteam"));
        assert!(h.registry.is_empty());
    }

    #[tokio::test]
    async fn test_stale_answer_is_ignored() {
        let mut h = harness(Role::Director, "", "m");
        h.handle(offer("redteam", "remote-offer", "r")).await.unwrap();
        let outcome = h.handle(answer("redteam", "late", "r")).await.unwrap();
        assert_eq!(outcome, SignalOutcome::StaleAnswer);
        assert!(!h.log.calls().contains(&"remote:late@0".to_string()));
    }

    #[tokio::test]
    async fn test_early_candidates_applied_after_offer() {
        let mut h = harness(Role::Director, "", "m");
        let err = h.handle(candidate("redteam", "c1", "r")).await.unwrap_err();
        assert!(matches!(err, Error::UnknownPeer(_)));
        assert_eq!(h.negotiator.parked_count("redteam"), 1);

        h.handle(offer("redteam", "remote-offer", "r")).await.unwrap();
        assert_eq!(h.negotiator.parked_count("redteam"), 0);

        let calls = h.log.calls();
        let remote = calls.iter().position(|c| c == "remote:remote-offer@0").unwrap();
        let ice = calls.iter().position(|c| c == "ice:c1@0").unwrap();
        assert!(remote < ice);

        // Replayed candidates count as seen
        let outcome = h.handle(candidate("redteam", "c1", "r")).await.unwrap();
        assert_eq!(outcome, SignalOutcome::CandidateDuplicate);
    }

    #[tokio::test]
    async fn test_parked_candidates_are_bounded() {
        let mut h = harness(Role::Director, "", "m");
        for i in 0..(MAX_PARKED_CANDIDATES + 8) {
            let _ = h.handle(candidate("redteam", &format!("c{i}"), "r")).await;
        }
        assert_eq!(h.negotiator.parked_count("redteam"), MAX_PARKED_CANDIDATES);
        assert!(h.registry.is_empty());
    }

    #[tokio::test]
    async fn test_candidates_buffered_until_answer() {
        let mut h = harness(Role::Driver, "redteam", "m");
        h.negotiator
            .announce(&h.ctx, &mut h.registry, &["redteam".to_string()])
            .await;
        let sent = h.drain_sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].to_session.is_none());

        let outcome = h.handle(candidate("redteam", "c1", "d")).await.unwrap();
        assert_eq!(outcome, SignalOutcome::CandidateBuffered);

        let outcome = h.handle(answer("redteam", "remote-answer", "d")).await.unwrap();
        assert!(matches!(outcome, SignalOutcome::Negotiated { .. }));
        assert!(h.log.calls().contains(&"ice:c1@0".to_string()));

        let outcome = h.handle(candidate("redteam", "c2", "d")).await.unwrap();
        assert_eq!(outcome, SignalOutcome::CandidateApplied);

        // Same team address, different process
        let outcome = h.handle(candidate("redteam", "c3", "other")).await.unwrap();
        assert_eq!(outcome, SignalOutcome::Foreign);
    }

    #[tokio::test]
    async fn test_duplicate_offer_replays_answer() {
        let mut h = harness(Role::Director, "", "m");
        h.handle(offer("redteam", "remote-offer", "r")).await.unwrap();
        let first = h.drain_sent();

        let outcome = h.handle(offer("redteam", "remote-offer", "r")).await.unwrap();
        assert_eq!(outcome, SignalOutcome::Replayed);
        let second = h.drain_sent();
        assert_eq!(first[0].payload, second[0].payload);
        assert_eq!(h.registry.get("redteam").unwrap().epoch, 0);
        assert!(!h.log.calls().contains(&"close@0".to_string()));
    }

    #[tokio::test]
    async fn test_fresh_offer_resets_entry() {
        let mut h = harness(Role::Director, "", "m");
        h.handle(offer("redteam", "remote-offer", "r")).await.unwrap();
        h.handle(offer("redteam", "restart-offer", "r2")).await.unwrap();

        let entry = h.registry.get("redteam").unwrap();
        assert_eq!(h.registry.len(), 1);
        assert_eq!(entry.epoch, 1);
        assert_eq!(entry.state, NegotiationState::Connected);
        assert_eq!(entry.remote_session.as_deref(), Some("r2"));
        assert!(h.log.calls().contains(&"close@0".to_string()));
        assert!(h.log.calls().contains(&"remote:restart-offer@1".to_string()));
    }

    #[tokio::test]
    async fn test_restarted_peer_candidate_before_offer() {
        let mut h = harness(Role::Director, "", "m");
        h.handle(offer("redteam", "remote-offer", "r")).await.unwrap();

        // The restarted process trickles before its offer lands
        let outcome = h.handle(candidate("redteam", "c-new", "r2")).await.unwrap();
        assert_eq!(outcome, SignalOutcome::Foreign);
        assert_eq!(h.negotiator.parked_count("redteam"), 1);

        h.handle(offer("redteam", "restart-offer", "r2")).await.unwrap();
        let calls = h.log.calls();
        let remote = calls
            .iter()
            .position(|c| c == "remote:restart-offer@1")
            .unwrap();
        let ice = calls.iter().position(|c| c == "ice:c-new@1").unwrap();
        assert!(remote < ice);
        assert!(!calls.contains(&"ice:c-new@0".to_string()));
        assert_eq!(h.negotiator.parked_count("redteam"), 0);
    }

    #[tokio::test]
    async fn test_collision_yield_keeps_buffered_candidates() {
        let mut h = harness(Role::Driver, "redteam", "aaa");
        h.negotiator
            .announce(&h.ctx, &mut h.registry, &["redteam".to_string()])
            .await;
        h.drain_sent();

        let outcome = h.handle(candidate("redteam", "c-win", "zzz")).await.unwrap();
        assert_eq!(outcome, SignalOutcome::CandidateBuffered);

        let outcome = h.handle(offer("redteam", "their-offer", "zzz")).await.unwrap();
        assert!(matches!(outcome, SignalOutcome::Negotiated { .. }));
        assert_eq!(
            h.log.calls(),
            vec![
                "offer@0",
                "close@0",
                "remote:their-offer@1",
                "answer@1",
                "ice:c-win@1",
            ]
        );
    }

    #[tokio::test]
    async fn test_parked_candidates_wait_for_their_session() {
        let mut h = harness(Role::Director, "", "m");
        h.handle(offer("redteam", "remote-offer", "r")).await.unwrap();
        h.handle(candidate("redteam", "c-x", "x")).await.unwrap();
        h.handle(candidate("redteam", "c-y", "y")).await.unwrap();

        h.handle(offer("redteam", "x-offer", "x")).await.unwrap();
        let calls = h.log.calls();
        assert!(calls.contains(&"ice:c-x@1".to_string()));
        assert!(!calls.iter().any(|c| c.starts_with("ice:c-y")));
        assert_eq!(h.negotiator.parked_count("redteam"), 1);
    }

    #[tokio::test]
    async fn test_failed_description_marks_entry() {
        let mut h = harness(Role::Director, "", "m");
        let err = h.handle(offer("redteam", "garbage", "r")).await.unwrap_err();
        assert!(matches!(err, Error::Negotiation { .. }));
        assert_eq!(
            h.registry.get("redteam").unwrap().state,
            NegotiationState::Failed
        );
        assert!(h.drain_sent().is_empty());

        // A fresh offer re-initializes it
        h.handle(offer("redteam", "remote-offer", "r")).await.unwrap();
        assert_eq!(
            h.registry.get("redteam").unwrap().state,
            NegotiationState::Connected
        );
    }

    #[tokio::test]
    async fn test_offer_collision() {
        // Greater session id keeps its offer
        let mut h = harness(Role::Driver, "redteam", "zzz");
        h.negotiator
            .announce(&h.ctx, &mut h.registry, &["redteam".to_string()])
            .await;
        h.drain_sent();
        let outcome = h.handle(offer("redteam", "their-offer", "aaa")).await.unwrap();
        assert_eq!(outcome, SignalOutcome::CollisionKept);
        let resent = h.drain_sent();
        assert_eq!(resent.len(), 1);
        assert_eq!(resent[0].to_session.as_deref(), Some("aaa"));
        assert!(matches!(resent[0].payload, SignalPayload::Offer { .. }));

        // Smaller session id yields and answers
        let mut h = harness(Role::Driver, "redteam", "aaa");
        h.negotiator
            .announce(&h.ctx, &mut h.registry, &["redteam".to_string()])
            .await;
        h.drain_sent();
        let outcome = h.handle(offer("redteam", "their-offer", "zzz")).await.unwrap();
        assert!(matches!(outcome, SignalOutcome::Negotiated { .. }));
        assert_eq!(h.registry.get("redteam").unwrap().epoch, 1);
    }

    #[tokio::test]
    async fn test_announce_skips_used_entries() {
        let mut h = harness(Role::Director, "", "m");
        h.handle(offer("redteam", "remote-offer", "r")).await.unwrap();
        h.drain_sent();

        let targets = vec!["redteam".to_string(), "blueteam".to_string()];
        h.negotiator.announce(&h.ctx, &mut h.registry, &targets).await;
        let sent = h.drain_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, "blueteam");
        assert_eq!(sent[0].from, "blueteam");
        assert_eq!(
            h.registry.get("blueteam").unwrap().state,
            NegotiationState::HaveLocalOffer
        );
    }

    #[tokio::test]
    async fn test_announce_repeats_waiting_offer() {
        let mut h = harness(Role::Driver, "redteam", "m");
        let targets = vec!["redteam".to_string()];
        h.negotiator.announce(&h.ctx, &mut h.registry, &targets).await;
        let first = h.drain_sent();

        // Nobody answered; the same offer goes out again
        h.negotiator.announce(&h.ctx, &mut h.registry, &targets).await;
        let again = h.drain_sent();
        assert_eq!(again.len(), 1);
        assert_eq!(first[0].payload, again[0].payload);
        assert_eq!(h.log.calls(), vec!["offer@0"]);
        assert_eq!(h.registry.get("redteam").unwrap().epoch, 0);
    }

    #[tokio::test]
    async fn test_announce_redials_failed_entry() {
        let mut h = harness(Role::Driver, "redteam", "m");
        let targets = vec!["redteam".to_string()];
        h.negotiator.announce(&h.ctx, &mut h.registry, &targets).await;
        h.handle(answer("redteam", "remote-answer", "d")).await.unwrap();
        assert!(h
            .negotiator
            .on_link_state(&mut h.registry, "redteam", LinkState::Failed));
        h.drain_sent();

        h.negotiator.announce(&h.ctx, &mut h.registry, &targets).await;
        let entry = h.registry.get("redteam").unwrap();
        assert_eq!(entry.state, NegotiationState::HaveLocalOffer);
        assert_eq!(entry.epoch, 1);
        assert!(entry.remote_session.is_none());

        let sent = h.drain_sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].to_session.is_none());
        let calls = h.log.calls();
        assert!(calls.contains(&"close@0".to_string()));
        assert!(calls.contains(&"offer@1".to_string()));
    }

    #[test]
    fn test_filtering() {
        let h = harness(Role::Driver, "redteam", "m");
        let n = &h.negotiator;

        for env in [
            offer("blueteam", "x", "r"),
            answer("blueteam", "x", "r"),
            candidate("blueteam", "c", "r"),
        ] {
            assert!(!n.accepts(&h.ctx, &env));
        }
        assert!(n.accepts(&h.ctx, &offer("redteam", "x", "r")));

        // Echo of our own envelope
        assert!(!n.accepts(&h.ctx, &offer("redteam", "x", "m")));

        // Targeted at another process
        let targeted = offer("redteam", "x", "r").with_to_session(Some("other".into()));
        assert!(!n.accepts(&h.ctx, &targeted));
        let targeted = offer("redteam", "x", "r").with_to_session(Some("m".into()));
        assert!(n.accepts(&h.ctx, &targeted));

        let h = harness(Role::Director, "", "m");
        let from_director =
            offer("redteam", "x", "r").with_sender("Stewards", Role::Director, "r");
        assert!(!h.negotiator.accepts(&h.ctx, &from_director));
        assert!(h.negotiator.accepts(&h.ctx, &offer("blueteam", "x", "r")));
    }
}
