use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

const DEFAULT_SDP_MID: &str = "0";

/// Remote or local ICE candidate in the browser's JSON shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        default,
        rename = "sdpMLineIndex",
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CandidateError {
    #[error("empty candidate string")]
    Empty,
    #[error("malformed candidate payload: {0}")]
    Malformed(String),
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: Some(DEFAULT_SDP_MID.to_string()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }

    /// Builds a candidate from whatever the device relayed: a bare candidate
    /// line, a full `RTCIceCandidateInit`-style object, or an object wrapping
    /// one under `candidate`. When neither `sdpMid` nor `sdpMLineIndex` is
    /// present the candidate is pinned to the first media section.
    pub fn normalize(value: &Value) -> Result<Self, CandidateError> {
        let mut normalized = match value {
            Value::String(line) => Self::new(clean_line(line)),
            Value::Object(map) => match map.get("candidate") {
                Some(Value::Object(inner)) => from_object(inner)?,
                _ => from_object(map)?,
            },
            Value::Null => return Err(CandidateError::Empty),
            other => {
                return Err(CandidateError::Malformed(format!(
                    "unexpected candidate value {other}"
                )));
            }
        };

        if normalized.candidate.is_empty() {
            return Err(CandidateError::Empty);
        }
        if normalized.sdp_mid.is_none() && normalized.sdp_mline_index.is_none() {
            normalized.sdp_mid = Some(DEFAULT_SDP_MID.to_string());
            normalized.sdp_mline_index = Some(0);
        }
        Ok(normalized)
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| Value::String(self.candidate.clone()))
    }
}

fn clean_line(line: &str) -> String {
    let trimmed = line.trim();
    trimmed.strip_prefix("a=").unwrap_or(trimmed).to_string()
}

fn from_object(map: &Map<String, Value>) -> Result<IceCandidate, CandidateError> {
    let candidate = match map.get("candidate") {
        Some(Value::String(line)) => clean_line(line),
        None | Some(Value::Null) => String::new(),
        Some(other) => {
            return Err(CandidateError::Malformed(format!(
                "candidate field is not a string: {other}"
            )));
        }
    };

    let sdp_mid = map
        .get("sdpMid")
        .and_then(Value::as_str)
        .map(str::to_string);

    let sdp_mline_index = match map.get("sdpMLineIndex") {
        Some(Value::Number(number)) => number.as_u64().and_then(|n| u16::try_from(n).ok()),
        Some(Value::String(text)) => text.trim().parse().ok(),
        _ => None,
    };

    let username_fragment = map
        .get("usernameFragment")
        .and_then(Value::as_str)
        .filter(|ufrag| !ufrag.is_empty())
        .map(str::to_string);

    Ok(IceCandidate {
        candidate,
        sdp_mid,
        sdp_mline_index,
        username_fragment,
    })
}
