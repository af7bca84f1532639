//! Composition root tying the signaling channel to the peer sessions.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{Notify, broadcast, watch};
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::protocol::{CandidateError, EndpointId, EndpointPrefixes, Envelope, Inbound, StreamKind};
use crate::session::{PeerConnector, PeerSessionManager, SessionError, SinkProvider};
use crate::transport::SignalingTransport;

/// Endpoint-level commands on top of [`SignalingTransport`] and
/// [`PeerSessionManager`], plus recording-status tracking.
#[derive(Clone)]
pub struct MediaOrchestrator {
    transport: SignalingTransport,
    sessions: PeerSessionManager,
    prefixes: EndpointPrefixes,
    settle_delay: Duration,
    recording: Arc<watch::Sender<BTreeMap<EndpointId, bool>>>,
    router: Arc<Mutex<Option<JoinHandle<()>>>>,
    // add_stream calls still inside their settle delay, keyed by endpoint.
    pending: Arc<Mutex<HashMap<EndpointId, PendingAdd>>>,
    next_add: Arc<AtomicU64>,
}

struct PendingAdd {
    generation: u64,
    cancel: Arc<Notify>,
}

impl MediaOrchestrator {
    pub fn new(
        config: &Config,
        transport: SignalingTransport,
        connector: Arc<dyn PeerConnector>,
        sinks: Arc<dyn SinkProvider>,
    ) -> Self {
        let sessions = PeerSessionManager::new(
            connector,
            sinks,
            Arc::new(transport.clone()),
            config.endpoints.clone(),
        );
        let (recording, _) = watch::channel(BTreeMap::new());
        Self {
            transport,
            sessions,
            prefixes: config.endpoints.clone(),
            settle_delay: config.session.settle_delay(),
            recording: Arc::new(recording),
            router: Arc::new(Mutex::new(None)),
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_add: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Subscribes to inbound traffic and connects the transport. Calling it
    /// again is a no-op while the router is running.
    pub fn start(&self) {
        let mut router = self.router.lock();
        if router.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }
        let inbound = self.transport.subscribe();
        *router = Some(tokio::spawn(route_inbound(
            inbound,
            self.prefixes.clone(),
            self.sessions.clone(),
            self.recording.clone(),
        )));
        drop(router);
        self.transport.connect();
    }

    /// Asks the device for `kind`, waits the settle delay, then negotiates.
    ///
    /// A `remove_stream`, `sync_online` or `shutdown` that covers `id` while
    /// the delay is running cancels the add; one that lands while the session
    /// is being opened closes it again. A later `add_stream` for the same id
    /// supersedes this one.
    pub async fn add_stream(&self, id: EndpointId, kind: StreamKind) {
        tracing::info!(target = "orchestrator", endpoint = %id, kind = %kind, "adding stream");
        let generation = self.next_add.fetch_add(1, Ordering::Relaxed);
        let cancel = Arc::new(Notify::new());
        let superseded = self.pending.lock().insert(
            id.clone(),
            PendingAdd {
                generation,
                cancel: cancel.clone(),
            },
        );
        if let Some(superseded) = superseded {
            superseded.cancel.notify_one();
        }

        self.transport
            .send(Envelope::change_stream(self.prefixes.outbound_id(&id), &kind));
        if !self.settle_delay.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(self.settle_delay) => {}
                _ = cancel.notified() => {
                    tracing::debug!(target = "orchestrator", endpoint = %id, "stream add cancelled while settling");
                    return;
                }
            }
        }
        if !self.is_pending(&id, generation) {
            tracing::debug!(target = "orchestrator", endpoint = %id, "stream add cancelled while settling");
            return;
        }

        self.sessions.open(id.clone()).await;

        let still_wanted = {
            let mut pending = self.pending.lock();
            match pending.get(&id) {
                Some(entry) if entry.generation == generation => {
                    pending.remove(&id);
                    true
                }
                // A newer add replaces this session when it opens.
                Some(_) => true,
                None => false,
            }
        };
        if !still_wanted {
            tracing::debug!(target = "orchestrator", endpoint = %id, "stream removed while opening");
            self.sessions.close(&id).await;
        }
    }

    pub async fn remove_stream(&self, id: &EndpointId) {
        tracing::info!(target = "orchestrator", endpoint = %id, "removing stream");
        if let Some(pending) = self.pending.lock().remove(id) {
            pending.cancel.notify_one();
        }
        self.sessions.close(id).await;
        self.recording
            .send_if_modified(|recording| recording.remove(id).is_some());
    }

    /// Flips the local recording flag and asks the device to follow. A later
    /// `recording/status` from the device overrides the local flag.
    pub fn toggle_recording(&self, id: &EndpointId) -> bool {
        let mut now_recording = false;
        self.recording.send_modify(|recording| {
            let entry = recording.entry(id.clone()).or_insert(false);
            *entry = !*entry;
            now_recording = *entry;
        });
        tracing::info!(
            target = "orchestrator",
            endpoint = %id,
            recording = now_recording,
            "toggling recording"
        );
        self.transport
            .send(Envelope::recording(self.prefixes.outbound_id(id), now_recording));
        now_recording
    }

    /// Removes every stream, pending add and recording flag whose endpoint is
    /// no longer online.
    pub async fn sync_online(&self, online: &BTreeSet<EndpointId>) {
        let mut known: BTreeSet<EndpointId> = self.sessions.ids().into_iter().collect();
        known.extend(self.pending.lock().keys().cloned());
        known.extend(self.recording.borrow().keys().cloned());
        let stale: Vec<EndpointId> = known
            .into_iter()
            .filter(|id| !online.contains(id))
            .collect();
        for id in stale {
            tracing::debug!(target = "orchestrator", endpoint = %id, "endpoint went offline");
            self.remove_stream(&id).await;
        }
    }

    pub fn recording(&self, id: &EndpointId) -> bool {
        self.recording.borrow().get(id).copied().unwrap_or(false)
    }

    pub fn watch_recording(&self) -> watch::Receiver<BTreeMap<EndpointId, bool>> {
        self.recording.subscribe()
    }

    pub fn transport(&self) -> &SignalingTransport {
        &self.transport
    }

    pub fn sessions(&self) -> &PeerSessionManager {
        &self.sessions
    }

    /// Closes the transport with the normal code and releases every session.
    pub async fn shutdown(&self) {
        tracing::info!(target = "orchestrator", "shutting down");
        for (_, pending) in self.pending.lock().drain() {
            pending.cancel.notify_one();
        }
        self.transport.close();
        if let Some(router) = self.router.lock().take() {
            router.abort();
        }
        self.sessions.close_all().await;
    }

    fn is_pending(&self, id: &EndpointId, generation: u64) -> bool {
        self.pending
            .lock()
            .get(id)
            .is_some_and(|entry| entry.generation == generation)
    }
}

async fn route_inbound(
    mut inbound: broadcast::Receiver<Envelope>,
    prefixes: EndpointPrefixes,
    sessions: PeerSessionManager,
    recording: Arc<watch::Sender<BTreeMap<EndpointId, bool>>>,
) {
    loop {
        let envelope = match inbound.recv().await {
            Ok(envelope) => envelope,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(target = "orchestrator", skipped, "inbound router lagged");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        match Inbound::parse(&envelope, &prefixes) {
            Some(Inbound::Answer { id, sdp }) => {
                if let Err(err) = sessions.apply_answer(&id, sdp) {
                    log_rejected(&id, "answer", &err);
                }
            }
            Some(Inbound::Candidate { id, candidate }) => {
                if let Err(err) = sessions.apply_candidate(&id, &candidate) {
                    log_rejected(&id, "candidate", &err);
                }
            }
            Some(Inbound::RecordingStatus { id, recording: is_recording }) => {
                tracing::debug!(
                    target = "orchestrator",
                    endpoint = %id,
                    recording = is_recording,
                    "recording status"
                );
                recording.send_modify(|map| {
                    map.insert(id, is_recording);
                });
            }
            None => {
                tracing::trace!(
                    target = "orchestrator",
                    kind = %envelope.kind,
                    id = %envelope.id,
                    "ignoring inbound envelope"
                );
            }
        }
    }
}

fn log_rejected(id: &EndpointId, what: &str, err: &SessionError) {
    match err {
        SessionError::UnknownEndpoint(_) | SessionError::InvalidCandidate(CandidateError::Empty) => {
            tracing::debug!(target = "orchestrator", endpoint = %id, error = %err, "dropping inbound {what}");
        }
        _ => {
            tracing::warn!(target = "orchestrator", endpoint = %id, error = %err, "dropping inbound {what}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SignalingConfig;
    use crate::protocol::kind;
    use crate::session::SessionState;
    use crate::session::mock::{MockConnector, MockSinkProvider};
    use crate::transport::ConnectionState;
    use crate::transport::mock::{MockDialer, MockServer};
    use serde_json::{Value, json};
    use test_timeout::tokio_timeout_test;

    struct Fixture {
        orchestrator: MediaOrchestrator,
        dialer: Arc<MockDialer>,
        connector: Arc<MockConnector>,
    }

    fn fixture() -> Fixture {
        let config = Config {
            signaling: SignalingConfig {
                url: "ws://signal.test/ws".into(),
                ..SignalingConfig::default()
            },
            ..Config::default()
        };
        let dialer = Arc::new(MockDialer::new());
        let connector = Arc::new(MockConnector::new());
        let transport = SignalingTransport::new(&config.signaling, dialer.clone());
        let orchestrator = MediaOrchestrator::new(
            &config,
            transport,
            connector.clone(),
            Arc::new(MockSinkProvider::new()),
        );
        Fixture {
            orchestrator,
            dialer,
            connector,
        }
    }

    async fn started(fx: &Fixture) -> MockServer {
        fx.orchestrator.start();
        let server = fx.dialer.accept().await;
        let mut state = fx.orchestrator.transport().watch_state();
        state
            .wait_for(|state| *state == ConnectionState::Connected)
            .await
            .unwrap();
        server
    }

    #[tokio_timeout_test(10, paused)]
    async fn toggle_recording_flips_and_sends_prefixed_command() {
        let fx = fixture();
        let mut server = started(&fx).await;
        let id = EndpointId::from("9");
        assert!(!fx.orchestrator.recording(&id));

        assert!(fx.orchestrator.toggle_recording(&id));
        assert!(fx.orchestrator.recording(&id));
        let sent = server.next_envelope().await.unwrap();
        assert_eq!(sent.kind, kind::START_RECORDING);
        assert_eq!(sent.id, "cus-9");
        assert_eq!(sent.value, Value::Null);

        assert!(!fx.orchestrator.toggle_recording(&id));
        assert_eq!(server.next_envelope().await.unwrap().kind, kind::STOP_RECORDING);
    }

    #[tokio_timeout_test(10, paused)]
    async fn recording_status_overwrites_local_flag() {
        let fx = fixture();
        let server = started(&fx).await;
        let id = EndpointId::from("9");
        let mut watch = fx.orchestrator.watch_recording();

        fx.orchestrator.toggle_recording(&id);
        watch.borrow_and_update();
        server.push(&Envelope::new(kind::RECORDING_STATUS, "dev-9", json!("idle")));
        watch.changed().await.unwrap();
        assert!(!fx.orchestrator.recording(&id));

        server.push(&Envelope::new(kind::RECORDING_STATUS, "dev-9", json!("recording")));
        watch.changed().await.unwrap();
        assert!(fx.orchestrator.recording(&id));
    }

    #[tokio_timeout_test(10, paused)]
    async fn add_stream_requests_kind_then_offers_after_settle_delay() {
        let fx = fixture();
        let mut server = started(&fx).await;
        let id = EndpointId::from("7");

        let orchestrator = fx.orchestrator.clone();
        let adding = tokio::spawn({
            let id = id.clone();
            async move { orchestrator.add_stream(id, StreamKind::Sub).await }
        });

        let change = server.next_envelope().await.unwrap();
        assert_eq!(change.kind, kind::CHANGE_STREAM);
        assert_eq!(change.id, "cus-7");
        assert_eq!(change.value, json!("sub"));
        assert!(!fx.orchestrator.sessions().contains(&id));

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(!fx.orchestrator.sessions().contains(&id));

        adding.await.unwrap();
        let offer = server.next_envelope().await.unwrap();
        assert_eq!(offer.kind, kind::OFFER);
        assert_eq!(offer.id, "cus-7");
        assert_eq!(
            fx.orchestrator.sessions().state(&id),
            Some(SessionState::LocalOfferSet)
        );
    }

    #[tokio_timeout_test(10, paused)]
    async fn inbound_answer_and_candidates_reach_the_session() {
        let fx = fixture();
        let server = started(&fx).await;
        let id = EndpointId::from("42");
        fx.orchestrator.add_stream(id.clone(), StreamKind::Main).await;

        let line = "candidate:1 1 udp 2122260223 10.0.0.2 50000 typ host";
        server.push(&Envelope::new(kind::CANDIDATE, "dev-42", json!(line)));
        server.push(&Envelope::new(
            kind::ANSWER,
            "dev-42",
            json!({ "type": "answer", "sdp": "v=0 answer" }),
        ));

        let sessions = fx.orchestrator.sessions().clone();
        let mut state = sessions.watch_state(&id).unwrap();
        state
            .wait_for(|state| *state == SessionState::RemoteAnswerApplied)
            .await
            .unwrap();
        let snapshot = sessions.snapshot(&id).await.unwrap();
        assert_eq!(snapshot.pending_candidates, 0);
        let link = fx.connector.last_link(&id).unwrap();
        assert_eq!(link.candidates(), vec![line.to_string()]);
    }

    #[tokio_timeout_test(10, paused)]
    async fn remove_stream_closes_session_and_forgets_recording() {
        let fx = fixture();
        let _server = started(&fx).await;
        let id = EndpointId::from("3");
        fx.orchestrator.add_stream(id.clone(), StreamKind::Main).await;
        fx.orchestrator.toggle_recording(&id);

        fx.orchestrator.remove_stream(&id).await;
        assert!(!fx.orchestrator.sessions().contains(&id));
        assert!(!fx.orchestrator.watch_recording().borrow().contains_key(&id));
        assert!(fx.connector.last_link(&id).unwrap().is_closed());
    }

    #[tokio_timeout_test(10, paused)]
    async fn sync_online_removes_offline_endpoints_only() {
        let fx = fixture();
        let _server = started(&fx).await;
        for raw in ["1", "2", "3"] {
            fx.orchestrator
                .add_stream(EndpointId::from(raw), StreamKind::Main)
                .await;
        }
        let online = BTreeSet::from([EndpointId::from("2"), EndpointId::from("4")]);
        fx.orchestrator.sync_online(&online).await;
        assert_eq!(fx.orchestrator.sessions().ids(), vec![EndpointId::from("2")]);
    }

    #[tokio_timeout_test(10, paused)]
    async fn shutdown_closes_transport_and_sessions_without_reconnect() {
        let fx = fixture();
        let _server = started(&fx).await;
        fx.orchestrator
            .add_stream(EndpointId::from("1"), StreamKind::Main)
            .await;

        fx.orchestrator.shutdown().await;
        assert_eq!(
            fx.orchestrator.transport().state(),
            ConnectionState::Disconnected
        );
        assert!(fx.orchestrator.sessions().ids().is_empty());
        assert!(fx.connector.links().iter().all(|link| link.is_closed()));

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(fx.dialer.dials(), 1);
    }

    #[tokio_timeout_test(10, paused)]
    async fn commands_issued_while_disconnected_are_delivered_after_start() {
        let fx = fixture();
        let id = EndpointId::from("5");
        fx.orchestrator.toggle_recording(&id);
        assert_eq!(fx.orchestrator.transport().queued(), 1);

        let mut server = started(&fx).await;
        let sent = server.next_envelope().await.unwrap();
        assert_eq!(sent.kind, kind::START_RECORDING);
        assert_eq!(fx.orchestrator.transport().queued(), 0);
    }

    #[tokio_timeout_test(10, paused)]
    async fn remove_during_settle_cancels_the_add() {
        let fx = fixture();
        let mut server = started(&fx).await;
        let id = EndpointId::from("7");

        let orchestrator = fx.orchestrator.clone();
        let adding = tokio::spawn({
            let id = id.clone();
            async move { orchestrator.add_stream(id, StreamKind::Main).await }
        });
        assert_eq!(server.next_envelope().await.unwrap().kind, kind::CHANGE_STREAM);
        tokio::time::sleep(Duration::from_millis(100)).await;

        fx.orchestrator.remove_stream(&id).await;
        adding.await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert!(!fx.orchestrator.sessions().contains(&id));
        assert!(fx.connector.links_for(&id).is_empty());
        assert!(server.try_next_envelope().is_none());
    }

    #[tokio_timeout_test(10, paused)]
    async fn remove_while_opening_closes_the_new_session() {
        let fx = fixture();
        let _server = started(&fx).await;
        let id = EndpointId::from("8");
        let gate = fx.connector.gate_offers();

        let orchestrator = fx.orchestrator.clone();
        let adding = tokio::spawn({
            let id = id.clone();
            async move { orchestrator.add_stream(id, StreamKind::Main).await }
        });
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(fx.orchestrator.sessions().contains(&id));

        let orchestrator = fx.orchestrator.clone();
        let removing = tokio::spawn({
            let id = id.clone();
            async move { orchestrator.remove_stream(&id).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        gate.add_permits(1);
        adding.await.unwrap();
        removing.await.unwrap();

        assert!(!fx.orchestrator.sessions().contains(&id));
        assert!(fx.connector.last_link(&id).unwrap().is_closed());
    }

    #[tokio_timeout_test(10, paused)]
    async fn later_add_supersedes_a_settling_one() {
        let fx = fixture();
        let _server = started(&fx).await;
        let id = EndpointId::from("4");

        let orchestrator = fx.orchestrator.clone();
        let first = tokio::spawn({
            let id = id.clone();
            async move { orchestrator.add_stream(id, StreamKind::Main).await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        fx.orchestrator.add_stream(id.clone(), StreamKind::Sub).await;
        first.await.unwrap();

        assert_eq!(fx.connector.links_for(&id).len(), 1);
        assert_eq!(
            fx.orchestrator.sessions().state(&id),
            Some(SessionState::LocalOfferSet)
        );
    }

    #[tokio_timeout_test(10, paused)]
    async fn shutdown_during_settle_leaves_no_session() {
        let fx = fixture();
        let _server = started(&fx).await;
        let id = EndpointId::from("2");

        let orchestrator = fx.orchestrator.clone();
        let adding = tokio::spawn({
            let id = id.clone();
            async move { orchestrator.add_stream(id, StreamKind::Main).await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;

        fx.orchestrator.shutdown().await;
        adding.await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert!(fx.orchestrator.sessions().ids().is_empty());
        assert!(fx.connector.links().is_empty());
    }

    #[tokio_timeout_test(10, paused)]
    async fn sync_online_cancels_settling_adds_and_forgets_offline_recording() {
        let fx = fixture();
        let _server = started(&fx).await;
        let settling = EndpointId::from("6");
        let recorded = EndpointId::from("9");
        fx.orchestrator.toggle_recording(&recorded);

        let orchestrator = fx.orchestrator.clone();
        let adding = tokio::spawn({
            let id = settling.clone();
            async move { orchestrator.add_stream(id, StreamKind::Main).await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;

        fx.orchestrator.sync_online(&BTreeSet::new()).await;
        adding.await.unwrap();

        assert!(!fx.orchestrator.sessions().contains(&settling));
        assert!(fx.connector.links_for(&settling).is_empty());
        assert!(fx.orchestrator.watch_recording().borrow().is_empty());
    }
}
