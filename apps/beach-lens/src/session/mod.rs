//! Per-endpoint peer sessions.
//!
//! Every session is driven by its own task which owns the peer link, the
//! attached sink and the buffer of remote candidates that arrived before the
//! answer. [`PeerSessionManager`] only routes commands to those tasks and
//! keeps the set of endpoints whose media is flowing.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::protocol::{CandidateError, EndpointId, EndpointPrefixes, IceCandidate};
use crate::transport::EnvelopeSender;

mod driver;
#[doc(hidden)]
pub mod mock;
pub mod peer;
pub mod sink;
pub mod webrtc;

pub use peer::{IceState, PeerConnector, PeerEvent, PeerLink};
pub use sink::{MediaSink, RemoteTrack, SinkProvider, TrackKind};

use driver::{SessionCommand, SessionDriver};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("webrtc error: {0}")]
    WebRtc(#[from] ::webrtc::Error),
    #[error("negotiation failed: {0}")]
    Negotiation(String),
    #[error("no session for endpoint {0}")]
    UnknownEndpoint(EndpointId),
    #[error(transparent)]
    InvalidCandidate(#[from] CandidateError),
    #[error("session closed")]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    New,
    LocalOfferSet,
    RemoteAnswerApplied,
    MediaAttached,
    Degraded,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub pending_candidates: usize,
    pub has_remote_description: bool,
    pub has_sink: bool,
}

pub(crate) struct SessionContext {
    pub(crate) connector: Arc<dyn PeerConnector>,
    pub(crate) sinks: Arc<dyn SinkProvider>,
    pub(crate) outbox: Arc<dyn EnvelopeSender>,
    pub(crate) prefixes: EndpointPrefixes,
}

struct SessionHandle {
    generation: u64,
    commands: mpsc::UnboundedSender<SessionCommand>,
    state: watch::Receiver<SessionState>,
    // Detached on drop; the task ends once its command channel closes.
    _task: JoinHandle<()>,
}

impl SessionHandle {
    /// Waits until the session task has released everything it owns.
    async fn shutdown(self) {
        let (reply, done) = oneshot::channel();
        if self.commands.send(SessionCommand::Shutdown(reply)).is_ok() {
            let _ = done.await;
        }
    }
}

pub(crate) struct Registry {
    sessions: Mutex<HashMap<EndpointId, SessionHandle>>,
    active: watch::Sender<BTreeSet<EndpointId>>,
    next_generation: AtomicU64,
}

impl Registry {
    pub(crate) fn is_current(&self, id: &EndpointId, generation: u64) -> bool {
        self.sessions
            .lock()
            .get(id)
            .is_some_and(|handle| handle.generation == generation)
    }

    /// Forgets the session if it is still the registered one for `id`.
    pub(crate) fn retire(&self, id: &EndpointId, generation: u64) {
        let mut sessions = self.sessions.lock();
        if sessions
            .get(id)
            .is_some_and(|handle| handle.generation == generation)
        {
            sessions.remove(id);
        }
    }

    pub(crate) fn activate(&self, id: &EndpointId, generation: u64) {
        if !self.is_current(id, generation) {
            return;
        }
        self.active.send_if_modified(|active| active.insert(id.clone()));
    }

    pub(crate) fn deactivate(&self, id: &EndpointId) {
        self.active.send_if_modified(|active| active.remove(id));
    }
}

/// Owns at most one peer session per endpoint and runs the
/// offer/answer/candidate exchange for each.
#[derive(Clone)]
pub struct PeerSessionManager {
    ctx: Arc<SessionContext>,
    registry: Arc<Registry>,
}

impl PeerSessionManager {
    pub fn new(
        connector: Arc<dyn PeerConnector>,
        sinks: Arc<dyn SinkProvider>,
        outbox: Arc<dyn EnvelopeSender>,
        prefixes: EndpointPrefixes,
    ) -> Self {
        let (active, _) = watch::channel(BTreeSet::new());
        Self {
            ctx: Arc::new(SessionContext {
                connector,
                sinks,
                outbox,
                prefixes,
            }),
            registry: Arc::new(Registry {
                sessions: Mutex::new(HashMap::new()),
                active,
                next_generation: AtomicU64::new(1),
            }),
        }
    }

    /// Starts a fresh session for `id` and returns once its offer has been
    /// handed to the signaling channel or negotiation was abandoned. A
    /// previous session for the same id is fully released before the new
    /// peer connection is created.
    pub async fn open(&self, id: EndpointId) {
        let generation = self.registry.next_generation.fetch_add(1, Ordering::Relaxed);
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SessionState::New);
        let (ready_tx, ready_rx) = oneshot::channel();

        {
            let mut sessions = self.registry.sessions.lock();
            let previous = sessions.remove(&id);
            if previous.is_some() {
                tracing::debug!(
                    target = "webrtc",
                    endpoint = %id,
                    "replacing existing session"
                );
            }
            let driver = SessionDriver::new(
                id.clone(),
                generation,
                self.ctx.clone(),
                Arc::downgrade(&self.registry),
                commands_rx,
                state_tx,
            );
            let task = tokio::spawn(driver.run(previous, ready_tx));
            sessions.insert(
                id,
                SessionHandle {
                    generation,
                    commands: commands_tx,
                    state: state_rx,
                    _task: task,
                },
            );
        }

        let _ = ready_rx.await;
    }

    /// Queues a remote answer for the session.
    pub fn apply_answer(&self, id: &EndpointId, sdp: String) -> Result<(), SessionError> {
        self.dispatch(id, SessionCommand::Answer(sdp))
    }

    /// Normalizes a relayed candidate and queues it for the session, which
    /// applies it now or after the answer. Empty candidates are rejected
    /// with [`CandidateError::Empty`].
    pub fn apply_candidate(&self, id: &EndpointId, candidate: &Value) -> Result<(), SessionError> {
        let candidate = IceCandidate::normalize(candidate)?;
        self.dispatch(id, SessionCommand::Candidate(candidate))
    }

    /// Releases the session for `id`. Unknown ids are a no-op.
    pub async fn close(&self, id: &EndpointId) {
        let handle = self.registry.sessions.lock().remove(id);
        match handle {
            Some(handle) => {
                tracing::debug!(target = "webrtc", endpoint = %id, "closing session");
                handle.shutdown().await;
            }
            None => {
                tracing::trace!(target = "webrtc", endpoint = %id, "close for unknown session");
            }
        }
    }

    pub async fn close_all(&self) {
        let handles: Vec<SessionHandle> = self
            .registry
            .sessions
            .lock()
            .drain()
            .map(|(_, handle)| handle)
            .collect();
        if handles.is_empty() {
            return;
        }
        tracing::debug!(target = "webrtc", count = handles.len(), "closing all sessions");
        futures::future::join_all(handles.into_iter().map(SessionHandle::shutdown)).await;
    }

    /// Endpoints whose media is currently attached and healthy.
    pub fn active(&self) -> BTreeSet<EndpointId> {
        self.registry.active.borrow().clone()
    }

    pub fn watch_active(&self) -> watch::Receiver<BTreeSet<EndpointId>> {
        self.registry.active.subscribe()
    }

    pub fn state(&self, id: &EndpointId) -> Option<SessionState> {
        self.registry
            .sessions
            .lock()
            .get(id)
            .map(|handle| *handle.state.borrow())
    }

    pub fn watch_state(&self, id: &EndpointId) -> Option<watch::Receiver<SessionState>> {
        self.registry
            .sessions
            .lock()
            .get(id)
            .map(|handle| handle.state.clone())
    }

    pub async fn snapshot(&self, id: &EndpointId) -> Option<SessionSnapshot> {
        let (reply, response) = oneshot::channel();
        self.dispatch(id, SessionCommand::Inspect(reply)).ok()?;
        response.await.ok()
    }

    pub fn ids(&self) -> Vec<EndpointId> {
        let mut ids: Vec<EndpointId> = self.registry.sessions.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn contains(&self, id: &EndpointId) -> bool {
        self.registry.sessions.lock().contains_key(id)
    }

    fn dispatch(&self, id: &EndpointId, command: SessionCommand) -> Result<(), SessionError> {
        let sessions = self.registry.sessions.lock();
        let handle = sessions
            .get(id)
            .ok_or_else(|| SessionError::UnknownEndpoint(id.clone()))?;
        handle
            .commands
            .send(command)
            .map_err(|_| SessionError::Closed)
    }
}
