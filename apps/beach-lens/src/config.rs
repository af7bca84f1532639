use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use url::Url;

use crate::protocol::{EndpointPrefixes, StreamKind};
use crate::transport::ReconnectPolicy;

const DEFAULT_STUN_URL: &str = "stun:stun.l.google.com:19302";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub signaling: SignalingConfig,
    pub endpoints: EndpointPrefixes,
    pub session: SessionConfig,
    pub ice: IceConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SignalingConfig {
    pub url: String,
    pub base_delay_ms: u64,
    pub max_reconnect: u32,
    pub open_timeout_ms: u64,
    pub inbound_capacity: usize,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8080/ws".to_string(),
            base_delay_ms: 1_000,
            max_reconnect: 5,
            open_timeout_ms: 10_000,
            inbound_capacity: 256,
        }
    }
}

impl SignalingConfig {
    pub fn policy(&self) -> ReconnectPolicy {
        ReconnectPolicy::new(Duration::from_millis(self.base_delay_ms), self.max_reconnect)
    }

    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Pause between asking a device for a stream and sending the offer.
    pub settle_delay_ms: u64,
    pub stream_kind: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            settle_delay_ms: 500,
            stream_kind: "main".to_string(),
        }
    }
}

impl SessionConfig {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn stream_kind(&self) -> StreamKind {
        StreamKind::from(self.stream_kind.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct IceConfig {
    pub servers: Vec<IceServerConfig>,
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            servers: vec![IceServerConfig {
                urls: vec![DEFAULT_STUN_URL.to_string()],
                username: None,
                credential: None,
            }],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(default)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

impl Config {
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    /// Defaults, then the optional file, then the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => {
                let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })?;
                Self::from_toml_str(&raw)?
            }
            None => Self::default(),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    pub fn apply_env(&mut self) {
        self.apply_env_with(|key| env::var(key).ok());
    }

    /// Overlays `BEACH_LENS_*` variables read through `lookup`. Values that
    /// fail to parse leave the current setting in place.
    pub fn apply_env_with(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("BEACH_LENS_SIGNALING_URL") {
            self.signaling.url = url;
        }
        if let Some(delay) = lookup("BEACH_LENS_BASE_DELAY_MS").and_then(|v| v.parse().ok()) {
            self.signaling.base_delay_ms = delay;
        }
        if let Some(max) = lookup("BEACH_LENS_MAX_RECONNECT").and_then(|v| v.parse().ok()) {
            self.signaling.max_reconnect = max;
        }
        if let Some(timeout) = lookup("BEACH_LENS_OPEN_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            self.signaling.open_timeout_ms = timeout;
        }
        if let Some(prefix) = lookup("BEACH_LENS_OUTBOUND_PREFIX") {
            self.endpoints.outbound = prefix;
        }
        if let Some(prefix) = lookup("BEACH_LENS_INBOUND_PREFIX") {
            self.endpoints.inbound = prefix;
        }
        if let Some(settle) = lookup("BEACH_LENS_SETTLE_DELAY_MS").and_then(|v| v.parse().ok()) {
            self.session.settle_delay_ms = settle;
        }
        if let Some(kind) = lookup("BEACH_LENS_STREAM_KIND") {
            self.session.stream_kind = kind;
        }
        if let Some(urls) = lookup("BEACH_LENS_ICE_URLS") {
            let urls: Vec<String> = urls
                .split(',')
                .map(str::trim)
                .filter(|url| !url.is_empty())
                .map(str::to_string)
                .collect();
            if !urls.is_empty() {
                self.ice.servers = vec![IceServerConfig {
                    urls,
                    username: lookup("BEACH_LENS_ICE_USERNAME"),
                    credential: lookup("BEACH_LENS_ICE_CREDENTIAL"),
                }];
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = Url::parse(&self.signaling.url).map_err(|err| {
            ConfigError::Invalid(format!(
                "signaling url {:?} does not parse: {err}",
                self.signaling.url
            ))
        })?;
        if !matches!(url.scheme(), "ws" | "wss" | "http" | "https") {
            return Err(ConfigError::Invalid(format!(
                "signaling url scheme {} is not a websocket scheme",
                url.scheme()
            )));
        }
        if self.signaling.open_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "signaling.open_timeout_ms must be positive".into(),
            ));
        }
        if self.endpoints.outbound.is_empty() && !self.endpoints.inbound.is_empty() {
            tracing::warn!(
                target = "orchestrator",
                "outbound prefix is empty; device ids will be sent unprefixed"
            );
        }
        if self.ice.servers.iter().any(|server| server.urls.is_empty()) {
            return Err(ConfigError::Invalid("ice server without urls".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.signaling.policy(), ReconnectPolicy::default());
        assert_eq!(config.signaling.open_timeout(), Duration::from_secs(10));
        assert_eq!(config.session.settle_delay(), Duration::from_millis(500));
        assert_eq!(config.session.stream_kind(), StreamKind::Main);
        assert_eq!(config.endpoints, EndpointPrefixes::default());
        assert_eq!(config.ice.servers.len(), 1);
        config.validate().unwrap();
    }

    #[test]
    fn partial_toml_keeps_other_defaults() {
        let config = Config::from_toml_str(
            r#"
            [signaling]
            url = "wss://signal.example.com/ws"
            max_reconnect = 8

            [endpoints]
            outbound = "app-"

            [[ice.servers]]
            urls = ["turn:turn.example.com:3478"]
            username = "lens"
            credential = "secret"
            "#,
        )
        .unwrap();
        assert_eq!(config.signaling.url, "wss://signal.example.com/ws");
        assert_eq!(config.signaling.max_reconnect, 8);
        assert_eq!(config.signaling.base_delay_ms, 1_000);
        assert_eq!(config.endpoints.outbound, "app-");
        assert_eq!(config.endpoints.inbound, "dev-");
        assert_eq!(config.ice.servers[0].username.as_deref(), Some("lens"));
        config.validate().unwrap();
    }

    #[test]
    fn env_overrides_file_values() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("BEACH_LENS_SIGNALING_URL", "https://other.example.com/ws"),
            ("BEACH_LENS_MAX_RECONNECT", "2"),
            ("BEACH_LENS_BASE_DELAY_MS", "not-a-number"),
            ("BEACH_LENS_ICE_URLS", "stun:a.example.com, stun:b.example.com"),
        ]);
        let mut config = Config::default();
        config.apply_env_with(|key| vars.get(key).map(|v| v.to_string()));
        assert_eq!(config.signaling.url, "https://other.example.com/ws");
        assert_eq!(config.signaling.max_reconnect, 2);
        assert_eq!(config.signaling.base_delay_ms, 1_000);
        assert_eq!(
            config.ice.servers[0].urls,
            vec!["stun:a.example.com", "stun:b.example.com"]
        );
    }

    #[test]
    fn validate_rejects_bad_urls() {
        let mut config = Config::default();
        config.signaling.url = "ftp://example.com".into();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
        config.signaling.url = "::".into();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn unparsable_toml_is_a_parse_error() {
        assert!(matches!(
            Config::from_toml_str("[signaling\nurl = 1"),
            Err(ConfigError::Parse(_))
        ));
    }
}
