use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use pitwall_client::{validate_signaling_url, Command, Console, SignalInbox, SignalingClient};
use pitwall_common::{
    Error, IceCandidate, Result, Role, SessionDescription, SignalEnvelope, SignalPayload,
};
use pitwall_radio::{
    CuePlayer, EngineConfig, EngineDeps, EngineHandle, Identity, InboundStream, LevelReporter,
    ListenTarget, LocalTrack, PeerTransport, Presenter, RadioEngine, SpeakTarget, TalkKeyState,
    TransportEvents, TransportFactory,
};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;

const WAIT: Duration = Duration::from_secs(5);

struct ChannelInbox {
    opened: mpsc::UnboundedSender<()>,
    delivered: mpsc::UnboundedSender<SignalEnvelope>,
}

impl SignalInbox for ChannelInbox {
    fn opened(&self) -> bool {
        self.opened.send(()).is_ok()
    }

    fn deliver(&self, envelope: SignalEnvelope) -> bool {
        self.delivered.send(envelope).is_ok()
    }
}

fn offer(to: &str, from: &str) -> SignalEnvelope {
    SignalEnvelope::new(
        SignalPayload::Offer {
            offer: SessionDescription::offer("v=0"),
        },
        to,
        from,
    )
    .with_sender("Lando", Role::Driver, "session-a")
}

#[tokio::test]
async fn signaling_relays_envelopes_and_reconnects() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let url = validate_signaling_url(&format!("ws://{addr}"), false).unwrap();

    let (opened_tx, mut opened_rx) = mpsc::unbounded_channel();
    let (delivered_tx, mut delivered_rx) = mpsc::unbounded_channel();
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let client = tokio::spawn(
        SignalingClient::new(url)
            .with_reconnect_delay(Duration::from_millis(50))
            .run(
                ChannelInbox {
                    opened: opened_tx,
                    delivered: delivered_tx,
                },
                out_rx,
            ),
    );

    let (stream, _) = listener.accept().await.unwrap();
    let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
    timeout(WAIT, opened_rx.recv()).await.unwrap().unwrap();

    // Malformed frames are skipped, the next one still arrives.
    ws.send(Message::Text("{\"type\":\"bye\"".into())).await.unwrap();
    let inbound = offer("redteam", "redteam");
    ws.send(Message::Text(inbound.encode().unwrap())).await.unwrap();
    let received = timeout(WAIT, delivered_rx.recv()).await.unwrap().unwrap();
    assert_eq!(received, inbound);

    let outbound = SignalEnvelope::new(
        SignalPayload::IceCandidate {
            ice: IceCandidate::new("candidate:1 1 udp 1 10.0.0.1 5000 typ host"),
        },
        "redteam",
        "redteam",
    );
    out_tx.send(outbound.clone()).unwrap();
    let frame = timeout(WAIT, ws.next()).await.unwrap().unwrap().unwrap();
    match frame {
        Message::Text(text) => assert_eq!(SignalEnvelope::decode(&text).unwrap(), outbound),
        other => panic!("unexpected frame {other:?}"),
    }

    ws.close(None).await.unwrap();
    drop(ws);

    let (stream, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
    let _ws = tokio_tungstenite::accept_async(stream).await.unwrap();
    timeout(WAIT, opened_rx.recv()).await.unwrap().unwrap();

    drop(out_tx);
    timeout(WAIT, client).await.unwrap().unwrap().unwrap();
}

struct OfflineFactory;

#[async_trait]
impl TransportFactory for OfflineFactory {
    async fn open(&self, remote_id: &str, _: TransportEvents) -> Result<Box<dyn PeerTransport>> {
        Err(Error::transport(format!("offline: {remote_id}")))
    }
}

struct SilentCue;

#[async_trait]
impl CuePlayer for SilentCue {
    async fn play(&self) -> Result<()> {
        Ok(())
    }
}

struct NullPresenter;

impl Presenter for NullPresenter {
    fn render(&self, _: &str, _: &str, _: InboundStream, _: LevelReporter) {}
    fn session_started(&self, _: &str, _: &str) {}
    fn session_ended(&self, _: &str) {}
}

fn start_engine(role: Role, team: &str) -> EngineHandle {
    let identity = Identity::new(role, team, "Tester").unwrap();
    let (signal_tx, _signal_rx) = mpsc::unbounded_channel();
    let (engine, handle) = RadioEngine::new(
        EngineConfig::new(identity),
        EngineDeps {
            factory: Arc::new(OfflineFactory),
            cue: Arc::new(SilentCue),
            presenter: Arc::new(NullPresenter),
            track: LocalTrack::new("mic"),
            signal_tx,
        },
    );
    tokio::spawn(engine.run());
    handle
}

async fn talk_key(handle: &EngineHandle) -> TalkKeyState {
    handle.snapshot().await.unwrap().talk_key
}

#[tokio::test]
async fn console_drives_director_engine() {
    let handle = start_engine(Role::Director, "");
    let mut console = Console::new(handle.clone());

    let listen = Command::parse("listen blueteam").unwrap().unwrap();
    assert!(console.execute(listen).await.unwrap());
    let speak = Command::parse("speak all").unwrap().unwrap();
    assert!(console.execute(speak).await.unwrap());

    let snapshot = handle.snapshot().await.unwrap();
    assert_eq!(
        snapshot.selection.listen,
        ListenTarget::Team("blueteam".into())
    );
    assert_eq!(snapshot.selection.speak, SpeakTarget::All);

    console.execute(Command::Toggle).await.unwrap();
    let mut state = talk_key(&handle).await;
    for _ in 0..50 {
        if matches!(state, TalkKeyState::Transmitting(_)) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        state = talk_key(&handle).await;
    }
    assert!(matches!(state, TalkKeyState::Transmitting(_)));

    console.execute(Command::Toggle).await.unwrap();
    assert_eq!(talk_key(&handle).await, TalkKeyState::Idle);

    assert!(!console.execute(Command::Quit).await.unwrap());
    handle.shutdown().unwrap();
}

#[tokio::test]
async fn console_rejects_driver_selection() {
    let handle = start_engine(Role::Driver, "redteam");
    let mut console = Console::new(handle.clone());

    let err = console
        .execute(Command::Speak(SpeakTarget::All))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Config(_)));

    let snapshot = handle.snapshot().await.unwrap();
    assert_eq!(snapshot.team_id, "redteam");
    assert_eq!(snapshot.selection.speak, SpeakTarget::None);
    handle.shutdown().unwrap();
}
