use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::SessionError;
use super::sink::RemoteTrack;
use crate::protocol::{EndpointId, IceCandidate};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

impl IceState {
    pub fn is_degraded(self) -> bool {
        matches!(self, IceState::Disconnected | IceState::Failed)
    }

    pub fn is_established(self) -> bool {
        matches!(self, IceState::Connected | IceState::Completed)
    }
}

/// Callback traffic from a peer connection, forwarded into its session task.
#[derive(Debug)]
pub enum PeerEvent {
    LocalCandidate(IceCandidate),
    Track(RemoteTrack),
    IceState(IceState),
}

/// Creates peer connections for endpoints.
///
/// Implementations forward every callback of the new connection into
/// `events`; the sender is dropped when the link is closed.
#[async_trait]
pub trait PeerConnector: Send + Sync + 'static {
    async fn connect(
        &self,
        id: &EndpointId,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerLink>, SessionError>;
}

/// One receive-only peer connection.
#[async_trait]
pub trait PeerLink: Send + Sync {
    /// Creates the local offer, installs it as the local description and
    /// returns its SDP.
    async fn create_offer(&self) -> Result<String, SessionError>;
    async fn apply_answer(&self, sdp: &str) -> Result<(), SessionError>;
    async fn add_candidate(&self, candidate: &IceCandidate) -> Result<(), SessionError>;
    /// Releases the connection. Closing twice is not an error.
    async fn close(&self) -> Result<(), SessionError>;
}
