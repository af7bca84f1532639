pub mod config;
pub mod orchestrator;
pub mod protocol;
pub mod session;
pub mod telemetry;
pub mod transport;

pub use config::{Config, ConfigError};
pub use orchestrator::MediaOrchestrator;
pub use protocol::{EndpointId, Envelope, StreamKind};
pub use session::{PeerSessionManager, SessionError, SessionState};
pub use transport::{ConnectionState, SignalingError, SignalingTransport};
