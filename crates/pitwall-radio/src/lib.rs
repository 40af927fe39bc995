//! Pitwall radio core.
//!
//! Peer connection registry, signaling negotiation, role-based routing,
//! talk-key gating and presentation lifecycle, driven by a single
//! [`RadioEngine`] actor. Media, signaling and rendering are reached
//! through the traits in [`transport`], [`transmit`] and [`presentation`].

#![forbid(unsafe_code)]

pub mod context;
pub mod engine;
pub mod negotiator;
pub mod presentation;
pub mod registry;
pub mod routing;
pub mod transmit;
pub mod transport;

pub use context::{Identity, ListenTarget, RoutingSelection, SessionContext, SpeakTarget};
pub use engine::{
    EngineConfig, EngineDeps, EngineEvent, EngineHandle, EngineSnapshot, PeerSnapshot,
    RadioEngine, DEFAULT_REDIAL_INTERVAL,
};
pub use negotiator::SignalOutcome;
pub use presentation::{LevelReporter, Presenter, SILENCE_HOLD, SILENCE_LEVEL};
pub use registry::{NegotiationState, PeerRegistry, PendingCandidate};
pub use routing::{policy_for, InboundDecision, RoutingPolicy};
pub use transmit::{CueOutcome, CuePlayer, TalkKeyState, DEFAULT_CUE_TIMEOUT};
pub use transport::{
    AudioFrame, InboundStream, LinkState, LocalTrack, PeerTransport, TransportEvent,
    TransportEvents, TransportFactory,
};
