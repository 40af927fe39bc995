use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::Error;

/// Address that every participant listens on.
pub const BROADCAST_TARGET: &str = "all";

/// Director speak selector value that disables transmission.
pub const NO_TARGET: &str = "none";

/// Participant role, fixed for the lifetime of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// One team's radio: hears and speaks only on its own team address.
    Driver,
    /// Race control: listens to one team or all, speaks by explicit selection.
    Director,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Driver => f.write_str("driver"),
            Role::Director => f.write_str("director"),
        }
    }
}

impl FromStr for Role {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "driver" => Ok(Role::Driver),
            "director" => Ok(Role::Director),
            other => Err(Error::config(format!(
                "unknown role {other:?}; expected driver or director"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

/// Session description in the browser JSON shape (`{type, sdp}`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate in the browser JSON shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }
}

/// Negotiation payload, tagged by the envelope's `type` field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SignalPayload {
    #[serde(rename = "offer")]
    Offer { offer: SessionDescription },
    #[serde(rename = "answer")]
    Answer { answer: SessionDescription },
    #[serde(rename = "ice-candidate", alias = "ice")]
    IceCandidate { ice: IceCandidate },
}

impl SignalPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            SignalPayload::Offer { .. } => "offer",
            SignalPayload::Answer { .. } => "answer",
            SignalPayload::IceCandidate { .. } => "ice-candidate",
        }
    }
}

/// Envelope relayed verbatim by the signaling server.
///
/// `to` and `from` are team addresses. The session fields are optional
/// extensions; peers that do not send them are still understood.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalEnvelope {
    #[serde(flatten)]
    pub payload: SignalPayload,
    pub to: String,
    pub from: String,
    #[serde(rename = "fromName", default)]
    pub from_name: String,
    #[serde(rename = "fromRole", default, skip_serializing_if = "Option::is_none")]
    pub from_role: Option<Role>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<String>,
    #[serde(rename = "toSession", default, skip_serializing_if = "Option::is_none")]
    pub to_session: Option<String>,
}

impl SignalEnvelope {
    pub fn new(payload: SignalPayload, to: impl Into<String>, from: impl Into<String>) -> Self {
        Self {
            payload,
            to: to.into(),
            from: from.into(),
            from_name: String::new(),
            from_role: None,
            session: None,
            to_session: None,
        }
    }

    pub fn with_sender(
        mut self,
        name: impl Into<String>,
        role: Role,
        session: impl Into<String>,
    ) -> Self {
        self.from_name = name.into();
        self.from_role = Some(role);
        self.session = Some(session.into());
        self
    }

    pub fn with_to_session(mut self, to_session: Option<String>) -> Self {
        self.to_session = to_session;
        self
    }

    /// Name to show for the sender: `fromName`, or the team address when empty.
    pub fn speaker_name(&self) -> &str {
        if self.from_name.trim().is_empty() {
            &self.from
        } else {
            &self.from_name
        }
    }

    pub fn encode(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(text: &str) -> crate::Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}
