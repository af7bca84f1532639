//! In-memory signaling plumbing for tests, exported for the integration
//! tests under `tests/`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use futures::SinkExt;
use futures::StreamExt;
use futures::channel::mpsc as fmpsc;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

use super::dialer::{Dialer, SignalingChannel};
use super::{EnvelopeSender, SignalingError};
use crate::protocol::Envelope;

/// What the next dial does. An exhausted script accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialOutcome {
    Accept,
    Refuse,
    /// Never resolves, as if the socket hangs during the handshake.
    Hang,
}

pub struct MockDialer {
    script: Mutex<VecDeque<DialOutcome>>,
    dials: AtomicUsize,
    accepted_tx: mpsc::UnboundedSender<MockServer>,
    accepted_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<MockServer>>,
}

impl Default for MockDialer {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDialer {
    pub fn new() -> Self {
        let (accepted_tx, accepted_rx) = mpsc::unbounded_channel();
        Self {
            script: Mutex::new(VecDeque::new()),
            dials: AtomicUsize::new(0),
            accepted_tx,
            accepted_rx: tokio::sync::Mutex::new(accepted_rx),
        }
    }

    pub fn script(&self, outcomes: impl IntoIterator<Item = DialOutcome>) {
        self.script.lock().extend(outcomes);
    }

    pub fn dials(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }

    /// Waits for the next accepted dial and returns its server side.
    pub async fn accept(&self) -> MockServer {
        self.accepted_rx
            .lock()
            .await
            .recv()
            .await
            .expect("mock dialer dropped")
    }
}

#[async_trait]
impl Dialer for MockDialer {
    async fn dial(&self, _url: &str) -> Result<SignalingChannel, SignalingError> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        let outcome = self
            .script
            .lock()
            .pop_front()
            .unwrap_or(DialOutcome::Accept);
        match outcome {
            DialOutcome::Accept => {
                let (to_server, received) = fmpsc::unbounded::<Message>();
                let (outbound, from_server) = fmpsc::unbounded::<Result<Message, WsError>>();
                let _ = self.accepted_tx.send(MockServer { received, outbound });
                Ok(SignalingChannel {
                    sink: Box::pin(to_server.sink_map_err(|_| WsError::ConnectionClosed)),
                    stream: Box::pin(from_server),
                })
            }
            DialOutcome::Refuse => Err(SignalingError::Setup("connection refused".into())),
            DialOutcome::Hang => futures::future::pending().await,
        }
    }
}

/// Server end of one accepted mock connection. Dropping it ends the client's
/// inbound stream without a close frame.
pub struct MockServer {
    received: fmpsc::UnboundedReceiver<Message>,
    outbound: fmpsc::UnboundedSender<Result<Message, WsError>>,
}

impl MockServer {
    pub async fn next_message(&mut self) -> Option<Message> {
        self.received.next().await
    }

    /// Next decoded envelope, skipping non-text frames.
    pub async fn next_envelope(&mut self) -> Option<Envelope> {
        while let Some(message) = self.received.next().await {
            if let Message::Text(text) = message {
                return serde_json::from_str(&text).ok();
            }
        }
        None
    }

    /// Returns a frame the client already sent, without waiting.
    pub fn try_next_envelope(&mut self) -> Option<Envelope> {
        match self.received.try_next() {
            Ok(Some(Message::Text(text))) => serde_json::from_str(&text).ok(),
            _ => None,
        }
    }

    pub fn push(&self, envelope: &Envelope) {
        if let Ok(text) = serde_json::to_string(envelope) {
            self.push_raw(Message::Text(text));
        }
    }

    pub fn push_raw(&self, message: Message) {
        let _ = self.outbound.unbounded_send(Ok(message));
    }

    pub fn close(&self, code: CloseCode) {
        self.push_raw(Message::Close(Some(CloseFrame {
            code,
            reason: "".into(),
        })));
    }

    /// Makes every further client write fail.
    pub fn refuse_frames(&mut self) {
        self.received.close();
    }

    pub fn hang_up(self) {}
}

/// Captures envelopes instead of transmitting them.
#[derive(Default)]
pub struct RecordingOutbox {
    sent: Mutex<Vec<Envelope>>,
}

impl RecordingOutbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<Envelope> {
        self.sent.lock().clone()
    }

    pub fn sent_of(&self, kind: &str) -> Vec<Envelope> {
        self.sent
            .lock()
            .iter()
            .filter(|envelope| envelope.kind == kind)
            .cloned()
            .collect()
    }

    pub fn take(&self) -> Vec<Envelope> {
        std::mem::take(&mut *self.sent.lock())
    }
}

impl EnvelopeSender for RecordingOutbox {
    fn send(&self, envelope: Envelope) {
        self.sent.lock().push(envelope);
    }
}
