use std::pin::Pin;

use async_trait::async_trait;
use futures_util::{Sink, Stream, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use url::Url;

use super::SignalingError;

pub type FrameSink = Pin<Box<dyn Sink<Message, Error = WsError> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Message, WsError>> + Send>>;

/// Both halves of an opened control channel.
pub struct SignalingChannel {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

/// Opens control channels for [`super::SignalingTransport`].
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    async fn dial(&self, url: &str) -> Result<SignalingChannel, SignalingError>;
}

#[derive(Debug, Default, Clone)]
pub struct WebSocketDialer;

#[async_trait]
impl Dialer for WebSocketDialer {
    async fn dial(&self, url: &str) -> Result<SignalingChannel, SignalingError> {
        let websocket_url = websocket_url(url)?;
        let (ws_stream, _) = connect_async(websocket_url.as_str()).await?;
        tracing::debug!(
            target = "signaling",
            url = %websocket_url,
            "signaling websocket connected"
        );
        let (sink, stream) = ws_stream.split();
        Ok(SignalingChannel {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        })
    }
}

/// Accepts `ws`/`wss` as-is and maps `http`/`https` onto them.
pub fn websocket_url(raw: &str) -> Result<Url, SignalingError> {
    let mut url = Url::parse(raw)
        .map_err(|err| SignalingError::Setup(format!("invalid signaling url {raw}: {err}")))?;
    let scheme = match url.scheme() {
        "ws" | "http" => "ws",
        "wss" | "https" => "wss",
        other => {
            return Err(SignalingError::Setup(format!(
                "unsupported signaling scheme {other}"
            )));
        }
    };
    if url.scheme() != scheme {
        url.set_scheme(scheme)
            .map_err(|_| SignalingError::Setup("invalid websocket scheme".into()))?;
    }
    url.set_fragment(None);
    Ok(url)
}
