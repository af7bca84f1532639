use std::ops::ControlFlow;
use std::sync::{Arc, Weak};

use tokio::sync::{mpsc, oneshot, watch};

use super::peer::{PeerEvent, PeerLink};
use super::sink::MediaSink;
use super::{Registry, SessionContext, SessionHandle, SessionSnapshot, SessionState};
use crate::protocol::{EndpointId, Envelope, IceCandidate};

pub(super) enum SessionCommand {
    Answer(String),
    Candidate(IceCandidate),
    Inspect(oneshot::Sender<SessionSnapshot>),
    Shutdown(oneshot::Sender<()>),
}

/// Task-side state of one peer session. Commands and peer events are
/// handled strictly one at a time.
pub(super) struct SessionDriver {
    id: EndpointId,
    wire_id: String,
    generation: u64,
    ctx: Arc<SessionContext>,
    registry: Weak<Registry>,
    commands: mpsc::UnboundedReceiver<SessionCommand>,
    state: watch::Sender<SessionState>,
    link: Option<Arc<dyn PeerLink>>,
    sink: Option<Arc<dyn MediaSink>>,
    pending: Vec<IceCandidate>,
    remote_applied: bool,
    media_seen: bool,
}

impl SessionDriver {
    pub(super) fn new(
        id: EndpointId,
        generation: u64,
        ctx: Arc<SessionContext>,
        registry: Weak<Registry>,
        commands: mpsc::UnboundedReceiver<SessionCommand>,
        state: watch::Sender<SessionState>,
    ) -> Self {
        let wire_id = ctx.prefixes.outbound_id(&id);
        Self {
            id,
            wire_id,
            generation,
            ctx,
            registry,
            commands,
            state,
            link: None,
            sink: None,
            pending: Vec::new(),
            remote_applied: false,
            media_seen: false,
        }
    }

    pub(super) async fn run(mut self, previous: Option<SessionHandle>, ready: oneshot::Sender<()>) {
        if let Some(previous) = previous {
            previous.shutdown().await;
        }

        let Some(mut events) = self.negotiate().await else {
            self.release().await;
            self.retire();
            let _ = ready.send(());
            self.drain_commands();
            return;
        };
        let _ = ready.send(());

        loop {
            tokio::select! {
                biased;
                command = self.commands.recv() => match command {
                    Some(command) => {
                        if self.handle_command(command).await.is_break() {
                            break;
                        }
                    }
                    None => {
                        self.release().await;
                        break;
                    }
                },
                Some(event) = events.recv() => self.handle_event(event),
            }
        }
        self.drain_commands();
    }

    /// Creates the peer connection and sends the offer. Returns the event
    /// stream of the new connection, or `None` when the session was
    /// superseded or negotiation failed.
    async fn negotiate(&mut self) -> Option<mpsc::UnboundedReceiver<PeerEvent>> {
        if !self.is_current() {
            return None;
        }

        let (events_tx, events) = mpsc::unbounded_channel();
        match self.ctx.connector.connect(&self.id, events_tx).await {
            Ok(link) => self.link = Some(link),
            Err(err) => {
                tracing::warn!(
                    target = "webrtc",
                    endpoint = %self.id,
                    error = %err,
                    "failed to create peer connection"
                );
                return None;
            }
        }
        if !self.is_current() {
            return None;
        }

        let link = self.link.clone()?;
        let sdp = match link.create_offer().await {
            Ok(sdp) => sdp,
            Err(err) => {
                tracing::warn!(
                    target = "webrtc",
                    endpoint = %self.id,
                    error = %err,
                    "failed to create offer"
                );
                return None;
            }
        };
        if !self.is_current() {
            tracing::debug!(target = "webrtc", endpoint = %self.id, "session superseded during negotiation");
            return None;
        }

        self.ctx.outbox.send(Envelope::offer(self.wire_id.clone(), sdp));
        self.set_state(SessionState::LocalOfferSet);
        tracing::debug!(target = "webrtc", endpoint = %self.id, "offer sent");
        Some(events)
    }

    async fn handle_command(&mut self, command: SessionCommand) -> ControlFlow<()> {
        match command {
            SessionCommand::Answer(sdp) => self.apply_answer(&sdp).await,
            SessionCommand::Candidate(candidate) => {
                if self.remote_applied {
                    self.add_candidate(&candidate).await;
                } else {
                    tracing::debug!(
                        target = "webrtc",
                        endpoint = %self.id,
                        buffered = self.pending.len() + 1,
                        "buffering candidate until answer is applied"
                    );
                    self.pending.push(candidate);
                }
            }
            SessionCommand::Inspect(reply) => {
                let _ = reply.send(self.snapshot());
            }
            SessionCommand::Shutdown(reply) => {
                self.release().await;
                let _ = reply.send(());
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    async fn apply_answer(&mut self, sdp: &str) {
        let Some(link) = self.link.clone() else {
            return;
        };
        if self.remote_applied {
            tracing::debug!(
                target = "webrtc",
                endpoint = %self.id,
                "ignoring answer for session that already has a remote description"
            );
            return;
        }
        if let Err(err) = link.apply_answer(sdp).await {
            tracing::warn!(
                target = "webrtc",
                endpoint = %self.id,
                error = %err,
                "failed to apply answer"
            );
            return;
        }
        self.remote_applied = true;
        if *self.state.borrow() == SessionState::LocalOfferSet {
            self.set_state(SessionState::RemoteAnswerApplied);
        }

        let pending = std::mem::take(&mut self.pending);
        if !pending.is_empty() {
            tracing::debug!(
                target = "webrtc",
                endpoint = %self.id,
                count = pending.len(),
                "applying buffered candidates"
            );
        }
        for candidate in &pending {
            self.add_candidate(candidate).await;
        }
    }

    async fn add_candidate(&self, candidate: &IceCandidate) {
        let Some(link) = self.link.as_ref() else {
            return;
        };
        if let Err(err) = link.add_candidate(candidate).await {
            tracing::warn!(
                target = "webrtc",
                endpoint = %self.id,
                error = %err,
                candidate = %candidate.candidate,
                "failed to add remote candidate"
            );
        }
    }

    fn handle_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::LocalCandidate(candidate) => {
                self.ctx
                    .outbox
                    .send(Envelope::candidate(self.wire_id.clone(), &candidate));
            }
            PeerEvent::Track(track) => {
                let ctx = self.ctx.clone();
                let id = self.id.clone();
                let sink = self
                    .sink
                    .get_or_insert_with(|| ctx.sinks.resolve_sink(&id))
                    .clone();
                tracing::info!(
                    target = "webrtc",
                    endpoint = %self.id,
                    track = %track.id,
                    kind = ?track.kind,
                    "remote track attached"
                );
                sink.attach(track);
                self.media_seen = true;
                if *self.state.borrow() != SessionState::Degraded {
                    self.set_state(SessionState::MediaAttached);
                    self.activate();
                }
            }
            PeerEvent::IceState(ice) => {
                let current = *self.state.borrow();
                if ice.is_degraded() && current != SessionState::Degraded {
                    tracing::warn!(
                        target = "webrtc",
                        endpoint = %self.id,
                        ice = ?ice,
                        "peer connection degraded"
                    );
                    self.set_state(SessionState::Degraded);
                    self.deactivate();
                } else if ice.is_established()
                    && current == SessionState::Degraded
                    && self.media_seen
                {
                    tracing::info!(target = "webrtc", endpoint = %self.id, "peer connection recovered");
                    self.set_state(SessionState::MediaAttached);
                    self.activate();
                }
            }
        }
    }

    /// Closes the link, detaches the sink and drops buffered candidates, in
    /// that order. Safe to call more than once.
    async fn release(&mut self) {
        if let Some(link) = self.link.take() {
            if let Err(err) = link.close().await {
                tracing::warn!(
                    target = "webrtc",
                    endpoint = %self.id,
                    error = %err,
                    "failed to close peer connection"
                );
            }
        }
        if let Some(sink) = self.sink.take() {
            sink.detach();
        }
        if !self.pending.is_empty() {
            tracing::debug!(
                target = "webrtc",
                endpoint = %self.id,
                dropped = self.pending.len(),
                "discarding buffered candidates"
            );
            self.pending.clear();
        }
        self.remote_applied = false;
        if *self.state.borrow() != SessionState::Closed {
            self.set_state(SessionState::Closed);
            self.deactivate();
            tracing::debug!(target = "webrtc", endpoint = %self.id, "session released");
        }
    }

    // Answers whatever is still queued once the session is gone.
    fn drain_commands(&mut self) {
        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            match command {
                SessionCommand::Shutdown(reply) => {
                    let _ = reply.send(());
                }
                SessionCommand::Inspect(reply) => {
                    let _ = reply.send(self.snapshot());
                }
                SessionCommand::Answer(_) | SessionCommand::Candidate(_) => {}
            }
        }
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            state: *self.state.borrow(),
            pending_candidates: self.pending.len(),
            has_remote_description: self.remote_applied,
            has_sink: self.sink.is_some(),
        }
    }

    fn set_state(&self, state: SessionState) {
        self.state.send_replace(state);
    }

    fn is_current(&self) -> bool {
        self.registry
            .upgrade()
            .is_some_and(|registry| registry.is_current(&self.id, self.generation))
    }

    fn retire(&self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.retire(&self.id, self.generation);
        }
    }

    fn activate(&self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.activate(&self.id, self.generation);
        }
    }

    fn deactivate(&self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.deactivate(&self.id);
        }
    }
}
