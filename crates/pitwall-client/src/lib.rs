//! Pitwall radio client: the concrete collaborators around the routing
//! engine. WebSocket signaling, WebRTC transports, speaker presentation,
//! console talk key and configuration.

#![forbid(unsafe_code)]

pub mod config;
pub mod console;
pub mod presenter;
pub mod rtc;
pub mod signaling;

pub use config::{Args, ClientConfig};
pub use console::{Command, Console};
pub use presenter::AudioPresenter;
pub use rtc::RtcTransportFactory;
pub use signaling::{validate_signaling_url, SignalInbox, SignalingClient};
