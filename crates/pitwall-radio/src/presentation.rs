//! Presentation sessions for accepted inbound streams.
//!
//! A session exists while its key has had audio above [`SILENCE_LEVEL`]
//! within the last [`SILENCE_HOLD`]. Countdowns are spawned sleeps tagged
//! with a generation; cancelling one just means a newer generation exists.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::engine::EngineEvent;
use crate::transport::InboundStream;

pub const SILENCE_HOLD: Duration = Duration::from_millis(700);

/// Mean amplitude on a 0-255 scale below which a sample counts as silence.
pub const SILENCE_LEVEL: f32 = 2.0;

/// Renders accepted streams. Methods must not block.
pub trait Presenter: Send + Sync {
    /// Start playing `stream`. Level samples go back through `levels`.
    fn render(&self, key: &str, display_name: &str, stream: InboundStream, levels: LevelReporter);

    fn session_started(&self, key: &str, display_name: &str);

    fn session_ended(&self, key: &str);
}

/// Per-key handle for reporting amplitude samples into the engine.
#[derive(Clone)]
pub struct LevelReporter {
    key: String,
    tx: mpsc::UnboundedSender<EngineEvent>,
}

impl LevelReporter {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Returns `false` once the engine is gone.
    pub fn report(&self, level: f32) -> bool {
        self.tx
            .send(EngineEvent::Level {
                key: self.key.clone(),
                level,
            })
            .is_ok()
    }
}

#[derive(Debug)]
struct PresentationSession {
    display_name: String,
    last_active: Instant,
    countdown: Option<u64>,
}

pub struct PresentationTracker {
    presenter: Arc<dyn Presenter>,
    events_tx: mpsc::UnboundedSender<EngineEvent>,
    /// Display name per key ever accepted
    accepted: HashMap<String, String>,
    sessions: HashMap<String, PresentationSession>,
    generation: u64,
    hold: Duration,
    threshold: f32,
}

impl PresentationTracker {
    pub fn new(
        presenter: Arc<dyn Presenter>,
        events_tx: mpsc::UnboundedSender<EngineEvent>,
    ) -> Self {
        Self {
            presenter,
            events_tx,
            accepted: HashMap::new(),
            sessions: HashMap::new(),
            generation: 0,
            hold: SILENCE_HOLD,
            threshold: SILENCE_LEVEL,
        }
    }

    /// Hand an accepted stream to the presenter and start or refresh the
    /// session for `key`.
    pub fn present(&mut self, key: &str, display_name: &str, stream: InboundStream) {
        self.accepted
            .insert(key.to_string(), display_name.to_string());
        let levels = LevelReporter {
            key: key.to_string(),
            tx: self.events_tx.clone(),
        };
        self.presenter.render(key, display_name, stream, levels);

        let now = Instant::now();
        if let Some(session) = self.sessions.get_mut(key) {
            debug!("refreshing presentation {}", key);
            session.display_name = display_name.to_string();
            session.last_active = now;
        } else {
            self.start(key, display_name, now);
        }
        self.arm(key);
    }

    pub fn on_level(&mut self, key: &str, level: f32) {
        let Some(display_name) = self.accepted.get(key) else {
            return;
        };
        let now = Instant::now();

        if level >= self.threshold {
            match self.sessions.get_mut(key) {
                Some(session) => {
                    session.last_active = now;
                    session.countdown = None;
                }
                None => {
                    let display_name = display_name.clone();
                    self.start(key, &display_name, now);
                }
            }
        } else if self
            .sessions
            .get(key)
            .is_some_and(|session| session.countdown.is_none())
        {
            self.arm(key);
        }
    }

    /// Countdown for `key` fired.
    pub fn expire(&mut self, key: &str, generation: u64) {
        let current = self.sessions.get(key).and_then(|s| s.countdown);
        if current != Some(generation) {
            return;
        }
        if let Some(session) = self.sessions.remove(key) {
            info!("{} went quiet ({})", session.display_name, key);
        }
        self.presenter.session_ended(key);
    }

    /// End every session.
    pub fn clear(&mut self) {
        for key in self.active_keys() {
            self.sessions.remove(&key);
            self.presenter.session_ended(&key);
        }
    }

    pub fn is_active(&self, key: &str) -> bool {
        self.sessions.contains_key(key)
    }

    /// Keys with a live session, sorted.
    pub fn active_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.sessions.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Every key a stream was accepted for, sorted.
    pub fn accepted_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.accepted.keys().cloned().collect();
        keys.sort();
        keys
    }

    fn start(&mut self, key: &str, display_name: &str, now: Instant) {
        info!("{} on air ({})", display_name, key);
        self.sessions.insert(
            key.to_string(),
            PresentationSession {
                display_name: display_name.to_string(),
                last_active: now,
                countdown: None,
            },
        );
        self.presenter.session_started(key, display_name);
    }

    fn arm(&mut self, key: &str) {
        let Some(session) = self.sessions.get_mut(key) else {
            return;
        };
        self.generation += 1;
        let generation = self.generation;
        session.countdown = Some(generation);

        let deadline = session.last_active + self.hold;
        let key = key.to_string();
        let tx = self.events_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let _ = tx.send(EngineEvent::PresentationExpired { key, generation });
        });
    }
}
