use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::Context;
use beach_lens::config::Config;
use beach_lens::orchestrator::MediaOrchestrator;
use beach_lens::protocol::{EndpointId, StreamKind};
use beach_lens::session::webrtc::WebRtcConnector;
use beach_lens::session::{MediaSink, RemoteTrack, SinkProvider};
use beach_lens::telemetry::logging::{self, LogConfig, LogLevel};
use beach_lens::transport::{SignalingTransport, WebSocketDialer};
use clap::Parser;
use parking_lot::Mutex;
use tokio::task::JoinHandle;

#[derive(Parser, Debug)]
#[command(name = "beach-lens", about = "Pull live camera streams over WebRTC")]
struct Cli {
    /// TOML configuration file.
    #[arg(long, env = "BEACH_LENS_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long)]
    signaling_url: Option<String>,

    #[arg(long, value_enum, default_value_t = LogLevel::Warn, env = "BEACH_LENS_LOG_LEVEL")]
    log_level: LogLevel,

    #[arg(long, env = "BEACH_LENS_LOG_FILE")]
    log_file: Option<PathBuf>,

    /// Stream variant requested from every endpoint (defaults to the config).
    #[arg(long)]
    kind: Option<String>,

    /// Endpoint to stream from; repeatable.
    #[arg(short = 's', long = "stream")]
    streams: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    logging::init(&LogConfig {
        level: cli.log_level,
        file: cli.log_file.clone(),
    })?;

    let mut config = Config::load(cli.config.as_deref()).context("loading configuration")?;
    if let Some(url) = cli.signaling_url {
        config.signaling.url = url;
        config.validate()?;
    }
    let kind = cli
        .kind
        .map(StreamKind::from)
        .unwrap_or_else(|| config.session.stream_kind());

    let transport = SignalingTransport::new(&config.signaling, Arc::new(WebSocketDialer));
    let connector = Arc::new(WebRtcConnector::new(&config.ice).context("building webrtc api")?);
    let sinks = Arc::new(PacketCounters::default());
    let orchestrator = MediaOrchestrator::new(&config, transport, connector, sinks.clone());

    orchestrator.start();
    for stream in &cli.streams {
        orchestrator
            .add_stream(EndpointId::from(stream.as_str()), kind.clone())
            .await;
    }

    let mut state = orchestrator.transport().watch_state();
    let mut active = orchestrator.sessions().watch_active();
    let mut ticker = tokio::time::interval(Duration::from_secs(5));
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            result = &mut ctrl_c => {
                if let Err(err) = result {
                    tracing::warn!(target = "orchestrator", error = %err, "ctrl-c handler failed");
                }
                break;
            }
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *state.borrow_and_update();
                tracing::info!(
                    target = "signaling",
                    state = ?current,
                    attempt = orchestrator.transport().reconnect_attempt(),
                    "signaling state changed"
                );
            }
            changed = active.changed() => {
                if changed.is_err() {
                    break;
                }
                let ids: Vec<String> = active.borrow_and_update().iter().map(ToString::to_string).collect();
                tracing::info!(target = "orchestrator", active = ?ids, "active streams changed");
            }
            _ = ticker.tick() => sinks.report(),
        }
    }

    orchestrator.shutdown().await;
    Ok(())
}

/// Sink provider that counts RTP packets per endpoint instead of rendering.
#[derive(Default)]
struct PacketCounters {
    counts: Mutex<BTreeMap<EndpointId, Arc<AtomicU64>>>,
}

impl PacketCounters {
    fn report(&self) {
        for (id, count) in self.counts.lock().iter() {
            tracing::info!(
                target = "orchestrator",
                endpoint = %id,
                packets = count.load(Ordering::Relaxed),
                "rtp stats"
            );
        }
    }
}

impl SinkProvider for PacketCounters {
    fn resolve_sink(&self, id: &EndpointId) -> Arc<dyn MediaSink> {
        let packets = self
            .counts
            .lock()
            .entry(id.clone())
            .or_default()
            .clone();
        Arc::new(CountingSink {
            id: id.clone(),
            packets,
            readers: Mutex::new(Vec::new()),
        })
    }
}

struct CountingSink {
    id: EndpointId,
    packets: Arc<AtomicU64>,
    readers: Mutex<Vec<JoinHandle<()>>>,
}

impl MediaSink for CountingSink {
    fn attach(&self, track: RemoteTrack) {
        let Some(rtp) = track.rtp else {
            return;
        };
        let packets = self.packets.clone();
        let id = self.id.clone();
        let track_id = track.id;
        self.readers.lock().push(tokio::spawn(async move {
            loop {
                match rtp.read_rtp().await {
                    Ok(_) => {
                        packets.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(err) => {
                        tracing::debug!(
                            target = "webrtc",
                            endpoint = %id,
                            track = %track_id,
                            error = %err,
                            "track reader stopped"
                        );
                        break;
                    }
                }
            }
        }));
    }

    fn detach(&self) {
        for reader in self.readers.lock().drain(..) {
            reader.abort();
        }
    }
}
