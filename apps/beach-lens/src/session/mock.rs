//! Scriptable peer connections and sinks for tests, exported for the
//! integration tests under `tests/`.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{Semaphore, mpsc};

use super::SessionError;
use super::peer::{PeerConnector, PeerEvent, PeerLink};
use super::sink::{MediaSink, RemoteTrack, SinkProvider};
use crate::protocol::{EndpointId, IceCandidate};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkCall {
    CreateOffer,
    ApplyAnswer(String),
    AddCandidate(IceCandidate),
    Close,
}

#[derive(Default)]
pub struct MockConnector {
    links: Mutex<Vec<Arc<MockLink>>>,
    fail_connects: AtomicBool,
    offer_gate: Mutex<Option<Arc<Semaphore>>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_connects(&self, fail: bool) {
        self.fail_connects.store(fail, Ordering::SeqCst);
    }

    /// Holds every later offer until a permit is added to the returned
    /// semaphore.
    pub fn gate_offers(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.offer_gate.lock() = Some(gate.clone());
        gate
    }

    pub fn links(&self) -> Vec<Arc<MockLink>> {
        self.links.lock().clone()
    }

    pub fn links_for(&self, id: &EndpointId) -> Vec<Arc<MockLink>> {
        self.links
            .lock()
            .iter()
            .filter(|link| &link.id == id)
            .cloned()
            .collect()
    }

    pub fn last_link(&self, id: &EndpointId) -> Option<Arc<MockLink>> {
        self.links
            .lock()
            .iter()
            .rev()
            .find(|link| &link.id == id)
            .cloned()
    }
}

#[async_trait]
impl PeerConnector for MockConnector {
    async fn connect(
        &self,
        id: &EndpointId,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerLink>, SessionError> {
        if self.fail_connects.load(Ordering::SeqCst) {
            return Err(SessionError::Negotiation(format!(
                "mock connector refused {id}"
            )));
        }
        let link = Arc::new(MockLink {
            id: id.clone(),
            calls: Mutex::new(Vec::new()),
            events: Mutex::new(Some(events)),
            closed: AtomicBool::new(false),
            fail_next_answer: AtomicBool::new(false),
            offer_gate: self.offer_gate.lock().clone(),
        });
        self.links.lock().push(link.clone());
        Ok(link)
    }
}

pub struct MockLink {
    id: EndpointId,
    calls: Mutex<Vec<LinkCall>>,
    events: Mutex<Option<mpsc::UnboundedSender<PeerEvent>>>,
    closed: AtomicBool,
    fail_next_answer: AtomicBool,
    offer_gate: Option<Arc<Semaphore>>,
}

impl MockLink {
    pub fn id(&self) -> &EndpointId {
        &self.id
    }

    pub fn calls(&self) -> Vec<LinkCall> {
        self.calls.lock().clone()
    }

    /// Candidate lines applied so far, in order.
    pub fn candidates(&self) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                LinkCall::AddCandidate(candidate) => Some(candidate.candidate.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn close_calls(&self) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|call| matches!(call, LinkCall::Close))
            .count()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn fail_next_answer(&self) {
        self.fail_next_answer.store(true, Ordering::SeqCst);
    }

    /// Raises a peer callback. Returns false once the link is closed.
    pub fn emit(&self, event: PeerEvent) -> bool {
        match self.events.lock().as_ref() {
            Some(events) => events.send(event).is_ok(),
            None => false,
        }
    }

    fn record(&self, call: LinkCall) {
        self.calls.lock().push(call);
    }
}

#[async_trait]
impl PeerLink for MockLink {
    async fn create_offer(&self) -> Result<String, SessionError> {
        self.record(LinkCall::CreateOffer);
        if let Some(gate) = &self.offer_gate {
            gate.acquire().await.map_err(|_| SessionError::Closed)?.forget();
        }
        Ok(format!("v=0 offer-for-{}", self.id))
    }

    async fn apply_answer(&self, sdp: &str) -> Result<(), SessionError> {
        self.record(LinkCall::ApplyAnswer(sdp.to_string()));
        if self.fail_next_answer.swap(false, Ordering::SeqCst) {
            return Err(SessionError::Negotiation("answer rejected".into()));
        }
        Ok(())
    }

    async fn add_candidate(&self, candidate: &IceCandidate) -> Result<(), SessionError> {
        self.record(LinkCall::AddCandidate(candidate.clone()));
        Ok(())
    }

    async fn close(&self) -> Result<(), SessionError> {
        self.record(LinkCall::Close);
        self.closed.store(true, Ordering::SeqCst);
        self.events.lock().take();
        Ok(())
    }
}

#[derive(Default)]
pub struct MockSinkProvider {
    sinks: Mutex<HashMap<EndpointId, Vec<Arc<MockSink>>>>,
}

impl MockSinkProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resolves(&self, id: &EndpointId) -> usize {
        self.sinks.lock().get(id).map_or(0, Vec::len)
    }

    pub fn last(&self, id: &EndpointId) -> Option<Arc<MockSink>> {
        self.sinks.lock().get(id).and_then(|sinks| sinks.last().cloned())
    }
}

impl SinkProvider for MockSinkProvider {
    fn resolve_sink(&self, id: &EndpointId) -> Arc<dyn MediaSink> {
        let sink = Arc::new(MockSink::default());
        self.sinks
            .lock()
            .entry(id.clone())
            .or_default()
            .push(sink.clone());
        sink
    }
}

#[derive(Default)]
pub struct MockSink {
    attached: Mutex<Vec<String>>,
    detached: AtomicBool,
    detaches: AtomicUsize,
}

impl MockSink {
    pub fn attached(&self) -> Vec<String> {
        self.attached.lock().clone()
    }

    pub fn is_detached(&self) -> bool {
        self.detached.load(Ordering::SeqCst)
    }

    pub fn detaches(&self) -> usize {
        self.detaches.load(Ordering::SeqCst)
    }
}

impl MediaSink for MockSink {
    fn attach(&self, track: RemoteTrack) {
        self.detached.store(false, Ordering::SeqCst);
        self.attached.lock().push(track.id);
    }

    fn detach(&self) {
        self.detached.store(true, Ordering::SeqCst);
        self.detaches.fetch_add(1, Ordering::SeqCst);
    }
}
