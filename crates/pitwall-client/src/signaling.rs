//! WebSocket link to the signaling relay.
//!
//! The relay is an opaque broadcast: every text frame is one JSON envelope.
//! The link reconnects with a fixed delay and reports every successful open
//! so the engine can re-announce. Envelopes produced while disconnected are
//! dropped, never queued.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use pitwall_common::{Error, Result, SignalEnvelope};
use pitwall_radio::EngineHandle;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async, tungstenite::protocol::Message as WsMessage, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, info, warn};
use url::Url;

pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// Where decoded relay traffic goes.
pub trait SignalInbox: Send {
    /// The link came up. Returns `false` when the receiver is gone.
    fn opened(&self) -> bool;

    /// Returns `false` when the receiver is gone.
    fn deliver(&self, envelope: SignalEnvelope) -> bool;
}

impl SignalInbox for EngineHandle {
    fn opened(&self) -> bool {
        self.signaling_opened().is_ok()
    }

    fn deliver(&self, envelope: SignalEnvelope) -> bool {
        self.signal(envelope).is_ok()
    }
}

/// Parse and check a relay URL. Only `ws` and `wss` are accepted; `ws` is
/// refused when `require_secure` is set.
pub fn validate_signaling_url(raw: &str, require_secure: bool) -> Result<Url> {
    let url = Url::parse(raw.trim())
        .map_err(|e| Error::config(format!("invalid signaling URL {raw:?}: {e}")))?;
    match url.scheme() {
        "wss" => Ok(url),
        "ws" if require_secure => Err(Error::config(
            "refusing insecure ws:// signaling URL; use wss://",
        )),
        "ws" => Ok(url),
        other => Err(Error::config(format!(
            "unsupported signaling URL scheme {other:?}; expected ws or wss"
        ))),
    }
}

enum LinkEnd {
    /// Socket closed or failed; try again.
    Dropped,
    /// Engine side went away; stop for good.
    Finished,
}

pub struct SignalingClient {
    url: Url,
    reconnect_delay: Duration,
}

impl SignalingClient {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
        }
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Runs until `outbound` closes or the inbox stops accepting.
    pub async fn run<I: SignalInbox>(
        self,
        inbox: I,
        mut outbound: mpsc::UnboundedReceiver<SignalEnvelope>,
    ) -> Result<()> {
        loop {
            match connect_async(self.url.as_str()).await {
                Ok((ws, _)) => {
                    info!("connected to signaling relay {}", self.url);
                    if !inbox.opened() {
                        return Ok(());
                    }
                    match self.pump(ws, &inbox, &mut outbound).await {
                        LinkEnd::Finished => return Ok(()),
                        LinkEnd::Dropped => warn!("signaling relay connection lost"),
                    }
                }
                Err(e) => {
                    warn!("signaling connect to {} failed: {}", self.url, e);
                }
            }

            if !discard_for(&mut outbound, self.reconnect_delay).await {
                return Ok(());
            }
        }
    }

    async fn pump<I: SignalInbox>(
        &self,
        ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
        inbox: &I,
        outbound: &mut mpsc::UnboundedReceiver<SignalEnvelope>,
    ) -> LinkEnd {
        let (mut write, mut read) = ws.split();
        loop {
            tokio::select! {
                envelope = outbound.recv() => {
                    let Some(envelope) = envelope else {
                        let _ = write.close().await;
                        return LinkEnd::Finished;
                    };
                    let text = match envelope.encode() {
                        Ok(text) => text,
                        Err(e) => {
                            error!("failed to encode {} envelope: {}", envelope.payload.kind(), e);
                            continue;
                        }
                    };
                    if let Err(e) = write.send(WsMessage::Text(text)).await {
                        warn!("failed to send signaling message: {}", e);
                        return LinkEnd::Dropped;
                    }
                }
                message = read.next() => {
                    match message {
                        Some(Ok(WsMessage::Text(text))) => {
                            if !deliver_text(inbox, &text) {
                                return LinkEnd::Finished;
                            }
                        }
                        Some(Ok(WsMessage::Binary(bytes))) => match String::from_utf8(bytes) {
                            Ok(text) => {
                                if !deliver_text(inbox, &text) {
                                    return LinkEnd::Finished;
                                }
                            }
                            Err(_) => debug!("ignoring non-UTF-8 binary frame"),
                        },
                        Some(Ok(WsMessage::Close(_))) | None => return LinkEnd::Dropped,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!("signaling WebSocket error: {}", e);
                            return LinkEnd::Dropped;
                        }
                    }
                }
            }
        }
    }
}

/// Decode one relay frame. Malformed frames are logged and skipped.
fn deliver_text<I: SignalInbox>(inbox: &I, text: &str) -> bool {
    match SignalEnvelope::decode(text) {
        Ok(envelope) => inbox.deliver(envelope),
        Err(e) => {
            warn!("skipping malformed signaling message: {}", e);
            true
        }
    }
}

/// Drop outbound envelopes for `delay`. Returns `false` if the sender closed.
async fn discard_for(
    outbound: &mut mpsc::UnboundedReceiver<SignalEnvelope>,
    delay: Duration,
) -> bool {
    let deadline = tokio::time::sleep(delay);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => return true,
            envelope = outbound.recv() => match envelope {
                Some(envelope) => debug!(
                    "signaling down, dropping {} to {}",
                    envelope.payload.kind(),
                    envelope.to
                ),
                None => return false,
            },
        }
    }
}
