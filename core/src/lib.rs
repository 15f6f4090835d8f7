// e-Navigation network session core
// Connection lifecycle, service multiplexing and discovery for maritime participants

pub mod area;
pub mod config;
pub mod connection;
pub mod delivery;
pub mod discovery;
pub mod envelope;
pub mod future;
pub mod model;
pub mod multiplexer;
pub mod telemetry;
pub mod transport;

// Export core types
pub use area::{Area, BoundingBox, Circle, Polygon};
pub use config::ConnectionConfig;
pub use connection::{ConnectionBuilder, ConnectionState, MaritimeConnection};
pub use delivery::{DeliveryChannel, InformationListener, InformationSubscription};
pub use discovery::{
    CapabilityRegistry, DiscoveryIndex, MemorySpatialStore, SpatialStore, VersionedCapabilities,
};
pub use envelope::{Envelope, FaultCode, RemoteFault};
pub use future::{CorrelationId, NetworkFuture, Outcome};
pub use model::{MessageKind, ParticipantId, Position, PositionTime, ServiceDescriptor, ServiceMessage};
pub use multiplexer::{service_fn, ServiceCallback, ServiceMultiplexer, ServiceRegistration};
pub use telemetry::{init_tracing, ConnectionStats};
pub use transport::{InboundHandle, MemoryNetwork, MemoryTransport, Transport, TransportError};

use std::time::Duration;

// Error types
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum NetworkError {
    #[error("Connection is closing")]
    ConnectionClosing,

    #[error("Connection is closed")]
    ConnectionClosed,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Service already registered: {0}")]
    DuplicateRegistration(ServiceDescriptor),

    #[error("No service registered for {0}")]
    ServiceUnknown(ServiceDescriptor),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Remote service failed: {0}")]
    Remote(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Wait elapsed after {0:?} before completion")]
    Elapsed(Duration),

    #[error("Interrupted while waiting")]
    Interrupted,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for NetworkError {
    fn from(err: serde_json::Error) -> Self {
        NetworkError::Serialization(err.to_string())
    }
}

impl From<TransportError> for NetworkError {
    fn from(err: TransportError) -> Self {
        NetworkError::Transport(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, NetworkError>;
