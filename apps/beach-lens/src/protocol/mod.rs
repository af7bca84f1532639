//! Wire format spoken with the signaling server.
//!
//! Every frame is a JSON envelope `{ "type": ..., "id": ..., "value": ... }`.
//! Outbound ids carry the client-side direction prefix and inbound ids carry
//! the device-side one; [`EndpointPrefixes`] maps both onto a bare
//! [`EndpointId`].

use std::borrow::Borrow;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod candidate;

pub use candidate::{CandidateError, IceCandidate};

pub mod kind {
    pub const OFFER: &str = "webrtc/offer";
    pub const ANSWER: &str = "webrtc/answer";
    pub const CANDIDATE: &str = "webrtc/candidate";
    pub const CHANGE_STREAM: &str = "changeStream";
    pub const START_RECORDING: &str = "startRecording";
    pub const STOP_RECORDING: &str = "stopRecording";
    pub const RECORDING_STATUS: &str = "recording/status";
}

/// Value carried by `recording/status` while a device is recording.
pub const RECORDING_ACTIVE: &str = "recording";

/// Stable identifier of a remote media source, without direction prefix.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EndpointId(String);

impl EndpointId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EndpointId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for EndpointId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl Borrow<str> for EndpointId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EndpointPrefixes {
    /// Prepended to ids of messages this client sends.
    pub outbound: String,
    /// Carried by ids of messages the server relays from devices.
    pub inbound: String,
}

impl Default for EndpointPrefixes {
    fn default() -> Self {
        Self {
            outbound: "cus-".to_string(),
            inbound: "dev-".to_string(),
        }
    }
}

impl EndpointPrefixes {
    pub fn new(outbound: impl Into<String>, inbound: impl Into<String>) -> Self {
        Self {
            outbound: outbound.into(),
            inbound: inbound.into(),
        }
    }

    pub fn outbound_id(&self, id: &EndpointId) -> String {
        format!("{}{}", self.outbound, id)
    }

    /// Strips whichever direction prefix the wire id carries.
    pub fn strip(&self, wire_id: &str) -> EndpointId {
        let bare = [self.inbound.as_str(), self.outbound.as_str()]
            .into_iter()
            .filter(|prefix| !prefix.is_empty())
            .find_map(|prefix| wire_id.strip_prefix(prefix))
            .unwrap_or(wire_id);
        EndpointId::new(bare)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub value: Value,
}

impl Envelope {
    pub fn new(kind: &str, id: impl Into<String>, value: Value) -> Self {
        Self {
            kind: kind.to_string(),
            id: id.into(),
            value,
        }
    }

    pub fn offer(wire_id: impl Into<String>, sdp: impl Into<String>) -> Self {
        Self::new(kind::OFFER, wire_id, Value::String(sdp.into()))
    }

    pub fn candidate(wire_id: impl Into<String>, candidate: &IceCandidate) -> Self {
        Self::new(kind::CANDIDATE, wire_id, candidate.to_value())
    }

    pub fn change_stream(wire_id: impl Into<String>, stream: &StreamKind) -> Self {
        Self::new(
            kind::CHANGE_STREAM,
            wire_id,
            Value::String(stream.as_str().to_string()),
        )
    }

    pub fn recording(wire_id: impl Into<String>, start: bool) -> Self {
        let kind = if start {
            kind::START_RECORDING
        } else {
            kind::STOP_RECORDING
        };
        Self::new(kind, wire_id, Value::Null)
    }
}

/// Stream variant a device is asked to publish before negotiation starts.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Main,
    Sub,
    Other(String),
}

impl StreamKind {
    pub fn as_str(&self) -> &str {
        match self {
            StreamKind::Main => "main",
            StreamKind::Sub => "sub",
            StreamKind::Other(name) => name,
        }
    }
}

impl From<&str> for StreamKind {
    fn from(value: &str) -> Self {
        match value {
            "main" => StreamKind::Main,
            "sub" => StreamKind::Sub,
            other => StreamKind::Other(other.to_string()),
        }
    }
}

impl From<String> for StreamKind {
    fn from(value: String) -> Self {
        StreamKind::from(value.as_str())
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inbound envelopes the orchestrator acts on.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Answer { id: EndpointId, sdp: String },
    Candidate { id: EndpointId, candidate: Value },
    RecordingStatus { id: EndpointId, recording: bool },
}

impl Inbound {
    /// Returns `None` for message types this client does not consume or for
    /// answers without a usable SDP body.
    pub fn parse(envelope: &Envelope, prefixes: &EndpointPrefixes) -> Option<Self> {
        let id = prefixes.strip(&envelope.id);
        match envelope.kind.as_str() {
            kind::ANSWER => answer_sdp(&envelope.value).map(|sdp| Inbound::Answer { id, sdp }),
            kind::CANDIDATE => Some(Inbound::Candidate {
                id,
                candidate: envelope.value.clone(),
            }),
            kind::RECORDING_STATUS => Some(Inbound::RecordingStatus {
                id,
                recording: envelope.value.as_str() == Some(RECORDING_ACTIVE),
            }),
            _ => None,
        }
    }
}

// Devices send either the bare SDP or a `{ "type": "answer", "sdp": ... }` description.
fn answer_sdp(value: &Value) -> Option<String> {
    match value {
        Value::String(sdp) if !sdp.trim().is_empty() => Some(sdp.clone()),
        Value::Object(map) => map
            .get("sdp")
            .and_then(Value::as_str)
            .filter(|sdp| !sdp.trim().is_empty())
            .map(str::to_string),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_uses_type_id_value_fields() {
        let envelope = Envelope::offer("cus-7", "v=0");
        let encoded = serde_json::to_value(&envelope).unwrap();
        assert_eq!(
            encoded,
            json!({ "type": "webrtc/offer", "id": "cus-7", "value": "v=0" })
        );
    }

    #[test]
    fn envelope_tolerates_missing_value() {
        let envelope: Envelope =
            serde_json::from_str(r#"{"type":"recording/status","id":"dev-1"}"#).unwrap();
        assert_eq!(envelope.value, Value::Null);
    }

    #[test]
    fn recording_commands_carry_null_value() {
        let start = Envelope::recording("cus-9", true);
        assert_eq!(start.kind, kind::START_RECORDING);
        assert_eq!(start.value, Value::Null);
        assert_eq!(Envelope::recording("cus-9", false).kind, kind::STOP_RECORDING);
    }

    #[test]
    fn strip_removes_either_direction_prefix() {
        let prefixes = EndpointPrefixes::default();
        assert_eq!(prefixes.strip("dev-42").as_str(), "42");
        assert_eq!(prefixes.strip("cus-42").as_str(), "42");
        assert_eq!(prefixes.strip("42").as_str(), "42");
        assert_eq!(prefixes.outbound_id(&EndpointId::from("42")), "cus-42");
    }

    #[test]
    fn strip_ignores_empty_prefixes() {
        let prefixes = EndpointPrefixes::new("", "");
        assert_eq!(prefixes.strip("dev-3").as_str(), "dev-3");
    }

    #[test]
    fn parse_answer_accepts_string_and_description_object() {
        let prefixes = EndpointPrefixes::default();
        let plain = Envelope::new(kind::ANSWER, "dev-5", json!("v=0 answer"));
        assert_eq!(
            Inbound::parse(&plain, &prefixes),
            Some(Inbound::Answer {
                id: EndpointId::from("5"),
                sdp: "v=0 answer".into()
            })
        );

        let described = Envelope::new(
            kind::ANSWER,
            "dev-5",
            json!({ "type": "answer", "sdp": "v=0 described" }),
        );
        assert!(matches!(
            Inbound::parse(&described, &prefixes),
            Some(Inbound::Answer { sdp, .. }) if sdp == "v=0 described"
        ));

        let empty = Envelope::new(kind::ANSWER, "dev-5", json!(""));
        assert_eq!(Inbound::parse(&empty, &prefixes), None);
    }

    #[test]
    fn parse_recording_status_only_recording_means_true() {
        let prefixes = EndpointPrefixes::default();
        let on = Envelope::new(kind::RECORDING_STATUS, "dev-9", json!("recording"));
        let off = Envelope::new(kind::RECORDING_STATUS, "dev-9", json!("idle"));
        assert_eq!(
            Inbound::parse(&on, &prefixes),
            Some(Inbound::RecordingStatus {
                id: EndpointId::from("9"),
                recording: true
            })
        );
        assert!(matches!(
            Inbound::parse(&off, &prefixes),
            Some(Inbound::RecordingStatus { recording: false, .. })
        ));
    }

    #[test]
    fn parse_ignores_outbound_only_types() {
        let prefixes = EndpointPrefixes::default();
        let offer = Envelope::offer("cus-1", "v=0");
        assert_eq!(Inbound::parse(&offer, &prefixes), None);
    }

    #[test]
    fn stream_kind_round_trips_known_names() {
        assert_eq!(StreamKind::from("main"), StreamKind::Main);
        assert_eq!(StreamKind::from("sub").as_str(), "sub");
        assert_eq!(StreamKind::from("thermal").to_string(), "thermal");
    }
}
