//! Connection registry and the per-entry negotiation state machine.
//!
//! Negotiation lifecycle:
//! - NEW: entry created, no description exchanged
//! - HAVE_LOCAL_OFFER: we offered and wait for an answer
//! - HAVE_REMOTE_OFFER: remote offer applied, answer pending
//! - CONNECTED: both descriptions applied
//! - FAILED: transport reported failure or a description was rejected
//!
//! Entries are never removed while the engine runs. A fresh offer resets
//! a used entry in place.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use pitwall_common::{IceCandidate, SessionDescription, SignalEnvelope};

use crate::transport::{LinkState, PeerTransport};

/// Negotiation state of one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NegotiationState {
    #[default]
    New,
    HaveLocalOffer,
    HaveRemoteOffer,
    Connected,
    Failed,
}

/// Named inputs to [`NegotiationState::on`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationEvent {
    LocalOffer,
    RemoteOffer,
    LocalAnswer,
    RemoteAnswer,
    LinkFailed,
    Reset,
}

impl NegotiationState {
    /// Next state, or `None` when `event` is not valid here.
    pub fn on(self, event: NegotiationEvent) -> Option<NegotiationState> {
        use NegotiationEvent as E;
        use NegotiationState as S;

        match (self, event) {
            (_, E::Reset) => Some(S::New),
            (_, E::LinkFailed) => Some(S::Failed),
            (S::New, E::LocalOffer) => Some(S::HaveLocalOffer),
            (S::New, E::RemoteOffer) => Some(S::HaveRemoteOffer),
            (S::HaveRemoteOffer, E::LocalAnswer) => Some(S::Connected),
            (S::HaveLocalOffer, E::RemoteAnswer) => Some(S::Connected),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NegotiationState::New => "new",
            NegotiationState::HaveLocalOffer => "have-local-offer",
            NegotiationState::HaveRemoteOffer => "have-remote-offer",
            NegotiationState::Connected => "connected",
            NegotiationState::Failed => "failed",
        }
    }
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// A remote candidate and the session that sent it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingCandidate {
    pub session: Option<String>,
    pub candidate: IceCandidate,
}

impl PendingCandidate {
    pub fn new(session: Option<String>, candidate: IceCandidate) -> Self {
        Self { session, candidate }
    }
}

/// Connection to one remote team address.
pub struct PeerEntry {
    /// Remote team identifier (registry key)
    pub remote_id: String,
    /// Last non-empty display name the remote sent
    pub remote_name: String,
    /// Session id of the remote process this entry talks to
    pub remote_session: Option<String>,
    pub state: NegotiationState,
    /// Last state reported by the transport
    pub link: LinkState,
    /// Bumped whenever the transport is replaced
    pub epoch: u64,
    pub transport: Option<Arc<dyn PeerTransport>>,
    /// Remote candidates waiting for the remote description
    pub pending_candidates: Vec<PendingCandidate>,
    seen_candidates: HashSet<String>,
    pub remote_description_set: bool,
    pub last_local_offer: Option<SessionDescription>,
    /// SDP of the last applied remote offer
    pub last_remote_offer: Option<String>,
    pub last_local_answer: Option<SessionDescription>,
    /// Id of the attached local track, if any
    pub outbound: Option<String>,
}

impl PeerEntry {
    pub fn new(remote_id: impl Into<String>) -> Self {
        let remote_id = remote_id.into();
        Self {
            remote_name: remote_id.clone(),
            remote_id,
            remote_session: None,
            state: NegotiationState::New,
            link: LinkState::New,
            epoch: 0,
            transport: None,
            pending_candidates: Vec::new(),
            seen_candidates: HashSet::new(),
            remote_description_set: false,
            last_local_offer: None,
            last_remote_offer: None,
            last_local_answer: None,
            outbound: None,
        }
    }

    /// Apply a negotiation event. Returns `false` and leaves the state
    /// untouched when the transition is invalid.
    pub fn advance(&mut self, event: NegotiationEvent) -> bool {
        match self.state.on(event) {
            Some(next) => {
                self.state = next;
                true
            }
            None => false,
        }
    }

    /// Record who sent `envelope`.
    pub fn note_sender(&mut self, envelope: &SignalEnvelope) {
        if !envelope.from_name.trim().is_empty() {
            self.remote_name = envelope.from_name.trim().to_string();
        }
        if envelope.session.is_some() {
            self.remote_session = envelope.session.clone();
        }
    }

    /// Whether `envelope` comes from a different process than the one this
    /// entry is negotiated with. Unknown sessions never conflict.
    pub fn is_foreign(&self, envelope: &SignalEnvelope) -> bool {
        !self.belongs(envelope.session.as_deref())
    }

    /// Whether traffic from `session` is meant for this entry.
    pub fn belongs(&self, session: Option<&str>) -> bool {
        match (self.remote_session.as_deref(), session) {
            (Some(ours), Some(theirs)) => ours == theirs,
            _ => true,
        }
    }

    /// Returns `false` if this candidate string was already seen.
    pub fn remember_candidate(&mut self, candidate: &IceCandidate) -> bool {
        self.seen_candidates.insert(candidate.candidate.clone())
    }

    pub fn is_attached(&self) -> bool {
        self.outbound.is_some()
    }

    /// Back to `New` under a fresh epoch. Buffered candidates are dropped;
    /// take them first to keep them.
    ///
    /// Returns the old transport; the caller closes it.
    pub fn reset(&mut self) -> Option<Arc<dyn PeerTransport>> {
        self.advance(NegotiationEvent::Reset);
        self.epoch += 1;
        self.link = LinkState::New;
        self.remote_session = None;
        self.pending_candidates.clear();
        self.seen_candidates.clear();
        self.remote_description_set = false;
        self.last_local_offer = None;
        self.last_remote_offer = None;
        self.last_local_answer = None;
        self.outbound = None;
        self.transport.take()
    }
}

impl fmt::Debug for PeerEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerEntry")
            .field("remote_id", &self.remote_id)
            .field("remote_name", &self.remote_name)
            .field("remote_session", &self.remote_session)
            .field("state", &self.state)
            .field("link", &self.link)
            .field("epoch", &self.epoch)
            .field("has_transport", &self.transport.is_some())
            .field("pending_candidates", &self.pending_candidates.len())
            .field("outbound", &self.outbound)
            .finish()
    }
}

/// All peer connection entries, keyed by remote team identifier.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    entries: HashMap<String, PeerEntry>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the entry for `remote_id`, creating it if absent.
    ///
    /// The flag is `true` when the entry was created by this call.
    pub fn get_or_create(&mut self, remote_id: &str) -> (&mut PeerEntry, bool) {
        let created = !self.entries.contains_key(remote_id);
        let entry = self
            .entries
            .entry(remote_id.to_string())
            .or_insert_with(|| PeerEntry::new(remote_id));
        (entry, created)
    }

    pub fn get(&self, remote_id: &str) -> Option<&PeerEntry> {
        self.entries.get(remote_id)
    }

    pub fn get_mut(&mut self, remote_id: &str) -> Option<&mut PeerEntry> {
        self.entries.get_mut(remote_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeerEntry> {
        self.entries.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut PeerEntry> {
        self.entries.values_mut()
    }

    /// Sorted remote identifiers.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.entries.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Remove every entry.
    pub fn drain(&mut self) -> Vec<PeerEntry> {
        self.entries.drain().map(|(_, entry)| entry).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of entries with a local track attached.
    pub fn attached_count(&self) -> usize {
        self.entries.values().filter(|e| e.is_attached()).count()
    }
}
