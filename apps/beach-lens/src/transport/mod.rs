//! Resilient control channel to the signaling server.
//!
//! [`SignalingTransport`] owns at most one live socket at a time. Outbound
//! envelopes are queued while the socket is down and flushed in order on the
//! next successful open; inbound envelopes are decoded and broadcast to every
//! current subscriber. Unexpected closes schedule a reconnect with exponential
//! backoff until the policy's attempt ceiling is reached.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message, error::ProtocolError};

use crate::config::SignalingConfig;
use crate::protocol::Envelope;

pub mod backoff;
pub mod dialer;
#[doc(hidden)]
pub mod mock;

pub use backoff::ReconnectPolicy;
pub use dialer::{Dialer, SignalingChannel, WebSocketDialer};

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("signaling setup failed: {0}")]
    Setup(String),
    #[error("signaling socket did not open within {0:?}")]
    Timeout(Duration),
    #[error("signaling websocket error: {0}")]
    WebSocket(#[from] WsError),
    #[error("failed to encode envelope: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("signaling channel closed")]
    ChannelClosed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
}

/// Anything that can carry an outbound envelope toward the signaling server.
pub trait EnvelopeSender: Send + Sync {
    fn send(&self, envelope: Envelope);
}

enum Outgoing {
    Envelope(Envelope),
    Close,
}

struct Shared {
    state: ConnectionState,
    queue: VecDeque<Envelope>,
    writer: Option<mpsc::UnboundedSender<Outgoing>>,
    attempt: u32,
    // Bumped on every connect and close; link tasks from older epochs are ignored.
    epoch: u64,
    intentional: bool,
    retry: Option<JoinHandle<()>>,
    link: Option<JoinHandle<()>>,
}

struct Inner {
    url: String,
    policy: ReconnectPolicy,
    open_timeout: Duration,
    dialer: Arc<dyn Dialer>,
    shared: Mutex<Shared>,
    state_tx: watch::Sender<ConnectionState>,
    inbound: broadcast::Sender<Envelope>,
}

#[derive(Clone)]
pub struct SignalingTransport {
    inner: Arc<Inner>,
}

impl SignalingTransport {
    pub fn new(config: &SignalingConfig, dialer: Arc<dyn Dialer>) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (inbound, _) = broadcast::channel(config.inbound_capacity.max(1));
        Self {
            inner: Arc::new(Inner {
                url: config.url.clone(),
                policy: config.policy(),
                open_timeout: config.open_timeout(),
                dialer,
                shared: Mutex::new(Shared {
                    state: ConnectionState::Disconnected,
                    queue: VecDeque::new(),
                    writer: None,
                    attempt: 0,
                    epoch: 0,
                    intentional: false,
                    retry: None,
                    link: None,
                }),
                state_tx,
                inbound,
            }),
        }
    }

    /// Opens the channel unless one is already open or opening. Cancels any
    /// pending reconnect timer and re-arms automatic reconnects after a
    /// previous [`close`](Self::close).
    pub fn connect(&self) {
        self.inner.connect();
    }

    /// Transmits immediately when connected, otherwise queues. Never fails.
    pub fn send(&self, envelope: Envelope) {
        let mut shared = self.inner.shared.lock();
        tracing::trace!(
            target = "signaling",
            kind = %envelope.kind,
            id = %envelope.id,
            state = ?shared.state,
            "outbound envelope"
        );
        enqueue_or_forward(&mut shared, envelope);
    }

    /// Closes with the normal closure code. No reconnect is scheduled
    /// afterwards until [`connect`](Self::connect) is called again.
    pub fn close(&self) {
        let mut shared = self.inner.shared.lock();
        shared.intentional = true;
        shared.epoch += 1;
        if let Some(retry) = shared.retry.take() {
            retry.abort();
        }
        match shared.writer.take() {
            Some(writer) => {
                // The link task sends the close frame after anything already handed to it.
                let _ = writer.send(Outgoing::Close);
                shared.link.take();
            }
            None => {
                if let Some(link) = shared.link.take() {
                    link.abort();
                }
            }
        }
        tracing::info!(
            target = "signaling",
            queued = shared.queue.len(),
            "closing signaling channel"
        );
        self.inner.set_state(&mut shared, ConnectionState::Disconnected);
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Decoded inbound envelopes. Only envelopes dispatched after the call
    /// are delivered.
    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.inner.inbound.subscribe()
    }

    pub fn queued(&self) -> usize {
        self.inner.shared.lock().queue.len()
    }

    /// Drops every queued envelope and returns how many were dropped.
    pub fn clear_queue(&self) -> usize {
        let mut shared = self.inner.shared.lock();
        let dropped = shared.queue.len();
        shared.queue.clear();
        if dropped > 0 {
            tracing::info!(target = "signaling", dropped, "cleared outbound queue");
        }
        dropped
    }

    pub fn reconnect_attempt(&self) -> u32 {
        self.inner.shared.lock().attempt
    }
}

impl EnvelopeSender for SignalingTransport {
    fn send(&self, envelope: Envelope) {
        SignalingTransport::send(self, envelope);
    }
}

fn enqueue_or_forward(shared: &mut Shared, envelope: Envelope) {
    if shared.state == ConnectionState::Connected {
        if let Some(writer) = shared.writer.as_ref() {
            match writer.send(Outgoing::Envelope(envelope)) {
                Ok(()) => return,
                Err(mpsc::error::SendError(Outgoing::Envelope(envelope))) => {
                    shared.queue.push_back(envelope);
                    return;
                }
                Err(_) => return,
            }
        }
    }
    shared.queue.push_back(envelope);
}

impl Inner {
    fn connect(self: &Arc<Self>) {
        let mut shared = self.shared.lock();
        if matches!(
            shared.state,
            ConnectionState::Connecting | ConnectionState::Connected
        ) {
            tracing::debug!(target = "signaling", state = ?shared.state, "connect ignored");
            return;
        }
        if let Some(retry) = shared.retry.take() {
            retry.abort();
        }
        shared.intentional = false;
        shared.epoch += 1;
        let epoch = shared.epoch;
        self.set_state(&mut shared, ConnectionState::Connecting);
        tracing::debug!(
            target = "signaling",
            url = %self.url,
            attempt = shared.attempt,
            "opening signaling channel"
        );
        shared.link = Some(tokio::spawn(run_link(Arc::downgrade(self), epoch)));
    }

    fn set_state(&self, shared: &mut Shared, state: ConnectionState) {
        if shared.state != state {
            shared.state = state;
            self.state_tx.send_replace(state);
        }
    }

    /// Installs the writer for a freshly opened socket and flushes the queue
    /// through it. Returns false when the link has been superseded.
    fn on_open(&self, epoch: u64, writer: mpsc::UnboundedSender<Outgoing>) -> bool {
        let mut shared = self.shared.lock();
        if shared.epoch != epoch || shared.intentional {
            return false;
        }
        let flushed = shared.queue.len();
        while let Some(envelope) = shared.queue.pop_front() {
            if let Err(mpsc::error::SendError(Outgoing::Envelope(envelope))) =
                writer.send(Outgoing::Envelope(envelope))
            {
                shared.queue.push_front(envelope);
                return false;
            }
        }
        shared.writer = Some(writer);
        shared.attempt = 0;
        self.set_state(&mut shared, ConnectionState::Connected);
        tracing::info!(target = "signaling", flushed, "signaling channel connected");
        true
    }

    fn on_link_down(
        self: &Arc<Self>,
        epoch: u64,
        unsent: Vec<Envelope>,
        remote_normal_close: bool,
    ) {
        let mut shared = self.shared.lock();
        let current = shared.epoch == epoch;
        if current {
            shared.writer = None;
            shared.link = None;
            self.set_state(&mut shared, ConnectionState::Disconnected);
        }
        if !unsent.is_empty() {
            tracing::debug!(
                target = "signaling",
                count = unsent.len(),
                "requeueing envelopes that were not transmitted"
            );
        }
        for envelope in unsent {
            enqueue_or_forward(&mut shared, envelope);
        }
        if !current {
            return;
        }
        if remote_normal_close {
            shared.intentional = true;
            tracing::info!(
                target = "signaling",
                "server closed signaling channel normally; not reconnecting"
            );
            return;
        }
        if shared.intentional {
            return;
        }
        self.schedule_retry(&mut shared);
    }

    fn schedule_retry(self: &Arc<Self>, shared: &mut Shared) {
        let Some(delay) = self.policy.delay_for(shared.attempt) else {
            tracing::warn!(
                target = "signaling",
                attempts = shared.attempt,
                max = self.policy.max_attempts,
                "giving up on signaling reconnect"
            );
            return;
        };
        shared.attempt += 1;
        tracing::info!(
            target = "signaling",
            attempt = shared.attempt,
            delay_ms = delay.as_millis() as u64,
            "scheduling signaling reconnect"
        );
        let weak = Arc::downgrade(self);
        shared.retry = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                inner.shared.lock().retry.take();
                inner.connect();
            }
        }));
    }

    fn dispatch(&self, payload: &[u8]) {
        match serde_json::from_slice::<Envelope>(payload) {
            Ok(envelope) => {
                tracing::trace!(
                    target = "signaling",
                    kind = %envelope.kind,
                    id = %envelope.id,
                    "inbound envelope"
                );
                if self.inbound.send(envelope).is_err() {
                    tracing::trace!(target = "signaling", "no subscribers for inbound envelope");
                }
            }
            Err(err) => {
                tracing::warn!(
                    target = "signaling",
                    error = %err,
                    len = payload.len(),
                    "discarding undecodable signaling message"
                );
            }
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let shared = self.shared.get_mut();
        if let Some(retry) = shared.retry.take() {
            retry.abort();
        }
        if let Some(link) = shared.link.take() {
            link.abort();
        }
    }
}

async fn run_link(weak: Weak<Inner>, epoch: u64) {
    let Some((dialer, url, open_timeout)) = weak
        .upgrade()
        .map(|inner| (inner.dialer.clone(), inner.url.clone(), inner.open_timeout))
    else {
        return;
    };

    let dialed = match tokio::time::timeout(open_timeout, dialer.dial(&url)).await {
        Ok(result) => result,
        Err(_) => Err(SignalingError::Timeout(open_timeout)),
    };
    let SignalingChannel {
        mut sink,
        mut stream,
    } = match dialed {
        Ok(channel) => channel,
        Err(err) => {
            tracing::warn!(target = "signaling", error = %err, "signaling connect failed");
            if let Some(inner) = weak.upgrade() {
                inner.on_link_down(epoch, Vec::new(), false);
            }
            return;
        }
    };

    let (writer, mut outgoing) = mpsc::unbounded_channel::<Outgoing>();
    let installed = weak
        .upgrade()
        .is_some_and(|inner| inner.on_open(epoch, writer));
    if !installed {
        let _ = sink.close().await;
        return;
    }

    let mut unsent = Vec::new();
    let mut remote_normal_close = false;
    loop {
        tokio::select! {
            next = outgoing.recv() => match next {
                Some(Outgoing::Envelope(envelope)) => {
                    let text = match serde_json::to_string(&envelope) {
                        Ok(text) => text,
                        Err(err) => {
                            tracing::warn!(
                                target = "signaling",
                                error = %err,
                                kind = %envelope.kind,
                                "dropping unencodable envelope"
                            );
                            continue;
                        }
                    };
                    if let Err(err) = sink.send(Message::Text(text)).await {
                        tracing::warn!(target = "signaling", error = %err, "signaling send failed");
                        unsent.push(envelope);
                        break;
                    }
                }
                Some(Outgoing::Close) => {
                    let frame = CloseFrame {
                        code: CloseCode::Normal,
                        reason: "client closing".into(),
                    };
                    let _ = sink.send(Message::Close(Some(frame))).await;
                    let _ = sink.close().await;
                    return;
                }
                None => return,
            },
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    if let Some(inner) = weak.upgrade() {
                        inner.dispatch(text.as_bytes());
                    }
                }
                Some(Ok(Message::Binary(data))) => {
                    if let Some(inner) = weak.upgrade() {
                        inner.dispatch(&data);
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    remote_normal_close = frame
                        .as_ref()
                        .is_some_and(|frame| frame.code == CloseCode::Normal);
                    tracing::debug!(target = "signaling", ?frame, "signaling close frame received");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    match &err {
                        WsError::ConnectionClosed
                        | WsError::AlreadyClosed
                        | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                            tracing::debug!(target = "signaling", "signaling websocket closed: {err}");
                        }
                        _ => {
                            tracing::warn!(target = "signaling", "signaling websocket error: {err}");
                        }
                    }
                    break;
                }
                None => {
                    tracing::debug!(target = "signaling", "signaling stream ended");
                    break;
                }
            },
        }
    }

    // Anything handed to this link after the socket died goes back to the queue in order.
    outgoing.close();
    while let Ok(next) = outgoing.try_recv() {
        if let Outgoing::Envelope(envelope) = next {
            unsent.push(envelope);
        }
    }
    if let Some(inner) = weak.upgrade() {
        inner.on_link_down(epoch, unsent, remote_normal_close);
    }
}
