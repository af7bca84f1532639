use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::OnceLock;

use clap::ValueEnum;
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

/// Full `EnvFilter` directive string; replaces the level-derived default.
pub const FILTER_ENV: &str = "BEACH_LENS_LOG_FILTER";
/// Lets webrtc, ice and websocket internals log below info.
pub const TRACE_DEPS_ENV: &str = "BEACH_LENS_TRACE_DEPS";

// Crates that flood the output at debug and trace.
const NOISY_TARGETS: &[&str] = &[
    "webrtc",
    "webrtc_ice",
    "webrtc_dtls",
    "webrtc_sctp",
    "webrtc_srtp",
    "webrtc_mdns",
    "interceptor",
    "tokio_tungstenite",
    "tungstenite",
    "mio",
];

#[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error,
    #[default]
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Trace => LevelFilter::TRACE,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct LogConfig {
    pub level: LogLevel,
    /// Appends to this file instead of writing to stderr.
    pub file: Option<PathBuf>,
}

#[derive(thiserror::Error, Debug)]
pub enum InitError {
    #[error("failed to open log file {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to install subscriber: {0}")]
    Configure(String),
}

static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Installs the global subscriber. Later calls are no-ops.
pub fn init(config: &LogConfig) -> Result<(), InitError> {
    if GUARD.get().is_some() {
        return Ok(());
    }

    let directives = Directives::resolve(
        config.level,
        std::env::var(FILTER_ENV).ok(),
        super::env_truthy(TRACE_DEPS_ENV).unwrap_or(false),
    );

    let (writer, guard) = match &config.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|source| InitError::Io {
                    path: path.clone(),
                    source,
                })?;
            tracing_appender::non_blocking(file)
        }
        None => tracing_appender::non_blocking(std::io::stderr()),
    };

    let verbose = config.level >= LogLevel::Debug;
    let layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(config.file.is_none())
        .with_target(verbose)
        .with_thread_ids(config.level == LogLevel::Trace);

    tracing_subscriber::registry()
        .with(EnvFilter::new(&directives.filter))
        .with(layer)
        .try_init()
        .map_err(|err| InitError::Configure(err.to_string()))?;

    // A concurrent init lost the race; its guard is already stored.
    let _ = GUARD.set(guard);

    if directives.quieted_deps {
        tracing::info!(
            "dependency logs capped at info; set {TRACE_DEPS_ENV}=1 or {FILTER_ENV} to change"
        );
    }
    Ok(())
}

#[derive(Debug, PartialEq, Eq)]
struct Directives {
    filter: String,
    quieted_deps: bool,
}

impl Directives {
    fn resolve(level: LogLevel, explicit: Option<String>, trace_deps: bool) -> Self {
        if let Some(filter) = explicit.filter(|filter| !filter.trim().is_empty()) {
            return Self {
                filter,
                quieted_deps: false,
            };
        }

        let level = LevelFilter::from(level);
        let mut filter = if level >= LevelFilter::DEBUG {
            format!("info,beach_lens={level}")
        } else {
            level.to_string()
        };
        let quieted_deps = level >= LevelFilter::DEBUG && !trace_deps;
        if quieted_deps {
            for target in NOISY_TARGETS {
                filter.push_str(&format!(",{target}=info"));
            }
        }
        Self {
            filter: filter.to_lowercase(),
            quieted_deps,
        }
    }
}
