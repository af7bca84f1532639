use std::fmt;
use std::sync::Arc;

use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_remote::TrackRemote;

use crate::protocol::EndpointId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
    Unknown,
}

impl From<RTPCodecType> for TrackKind {
    fn from(kind: RTPCodecType) -> Self {
        match kind {
            RTPCodecType::Audio => TrackKind::Audio,
            RTPCodecType::Video => TrackKind::Video,
            _ => TrackKind::Unknown,
        }
    }
}

/// Incoming media track handed to a sink.
#[derive(Clone)]
pub struct RemoteTrack {
    pub id: String,
    pub stream_id: String,
    pub kind: TrackKind,
    /// Underlying RTP reader; absent for tracks synthesized in tests.
    pub rtp: Option<Arc<TrackRemote>>,
}

impl RemoteTrack {
    pub fn from_webrtc(track: Arc<TrackRemote>) -> Self {
        Self {
            id: track.id(),
            stream_id: track.stream_id(),
            kind: TrackKind::from(track.kind()),
            rtp: Some(track),
        }
    }

    pub fn detached(id: impl Into<String>, stream_id: impl Into<String>, kind: TrackKind) -> Self {
        Self {
            id: id.into(),
            stream_id: stream_id.into(),
            kind,
            rtp: None,
        }
    }
}

impl fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteTrack")
            .field("id", &self.id)
            .field("stream_id", &self.stream_id)
            .field("kind", &self.kind)
            .field("rtp", &self.rtp.is_some())
            .finish()
    }
}

/// Rendering target a session attaches its remote tracks to.
pub trait MediaSink: Send + Sync {
    fn attach(&self, track: RemoteTrack);
    fn detach(&self);
}

/// Looks up the rendering target for an endpoint.
pub trait SinkProvider: Send + Sync + 'static {
    fn resolve_sink(&self, id: &EndpointId) -> Arc<dyn MediaSink>;
}
