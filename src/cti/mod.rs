//! Call-control provider boundary
//!
//! The monitor talks to the telephony system through these traits. A
//! production deployment uses the [`gateway`] client; tests use an in-memory
//! fake. Provider, terminal, address, call and connection objects mirror the
//! resources exposed by the call-control server; events arrive on an mpsc
//! channel owned by the event router.

pub mod gateway;
#[cfg(test)]
pub mod testing;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Call-control errors
#[derive(Error, Debug)]
pub enum CtiError {
    #[error("resource unavailable: {0}")]
    ResourceUnavailable(String),

    #[error("invalid party: {0}")]
    InvalidParty(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("command failed: {0}")]
    CommandFailed(String),

    #[error("not connected to provider")]
    NotConnected,

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// State of a single call leg
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Offered to the address, not yet accepted
    Offered,
    /// Ringing at the party
    Alerting,
    /// Party has joined the call
    Connected,
    /// Leg has left the call
    Disconnected,
    /// State not reported by the provider
    Unknown,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Offered => write!(f, "offered"),
            ConnectionState::Alerting => write!(f, "alerting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Unknown => write!(f, "unknown"),
        }
    }
}

/// The provider: inventory queries and call creation.
#[async_trait]
pub trait CallControlProvider: Send + Sync {
    /// All terminals known to the provider.
    async fn terminals(&self) -> Result<Vec<Arc<dyn CtiTerminal>>, CtiError>;

    /// All addresses known to the provider.
    async fn addresses(&self) -> Result<Vec<Arc<dyn CtiAddress>>, CtiError>;

    /// Look up a terminal by name.
    async fn terminal(&self, name: &str) -> Result<Arc<dyn CtiTerminal>, CtiError>;

    /// Look up an address by DN.
    async fn address(&self, dn: &str) -> Result<Arc<dyn CtiAddress>, CtiError>;

    /// Create a new, empty call.
    async fn create_call(&self) -> Result<Arc<dyn CtiCall>, CtiError>;
}

/// A physical or virtual endpoint.
#[async_trait]
pub trait CtiTerminal: Send + Sync {
    fn name(&self) -> &str;

    /// Route point terminals require media-less registration before call
    /// observation.
    fn is_route_point(&self) -> bool;

    /// Register the terminal without media capabilities.
    async fn register_media_less(&self) -> Result<(), CtiError>;

    /// Subscribe to call events on this terminal for the life of the session.
    async fn observe_calls(&self) -> Result<(), CtiError>;
}

/// A dialable line.
#[async_trait]
pub trait CtiAddress: Send + Sync {
    /// The directory number.
    fn name(&self) -> &str;

    /// Subscribe to call events on this address for the life of the session.
    async fn observe_calls(&self) -> Result<(), CtiError>;

    /// Current call legs involving this address.
    async fn connections(&self) -> Result<Vec<Arc<dyn CtiConnection>>, CtiError>;
}

/// A call under provider control.
#[async_trait]
pub trait CtiCall: Send + Sync {
    fn id(&self) -> &str;

    /// Current legs of this call.
    async fn connections(&self) -> Result<Vec<Arc<dyn CtiConnection>>, CtiError>;

    /// Allow more than two parties on the call.
    async fn set_conference_enabled(&self, enabled: bool) -> Result<(), CtiError>;

    /// Place a terminal/address pair into the call, dialing `dialed`.
    async fn connect(&self, terminal: &str, address: &str, dialed: &str) -> Result<(), CtiError>;

    /// Merge another call's legs into this call.
    async fn conference(&self, other: &dyn CtiCall) -> Result<(), CtiError>;
}

/// One leg of a call. State is a snapshot taken when the handle was obtained;
/// re-query the owning call or address for fresh legs.
#[async_trait]
pub trait CtiConnection: Send + Sync {
    fn id(&self) -> &str;

    /// DN of the address this leg belongs to.
    fn address_name(&self) -> &str;

    fn state(&self) -> ConnectionState;

    /// Drop this leg from its call.
    async fn disconnect(&self) -> Result<(), CtiError>;

    /// The call this leg belongs to.
    async fn call(&self) -> Result<Arc<dyn CtiCall>, CtiError>;
}

/// Provider notifications, delivered on the event channel in the order the
/// provider reports them.
#[derive(Clone)]
pub enum CtiEvent {
    ProviderInService,
    ProviderOutOfService,
    TerminalInService {
        terminal: String,
    },
    AddressInService {
        address: String,
    },
    /// An inbound leg was offered to an address.
    ConnectionOffered {
        call: Arc<dyn CtiCall>,
        connection: Arc<dyn CtiConnection>,
    },
    ConnectionConnected {
        call_id: String,
        address: String,
    },
    ConnectionDisconnected {
        call_id: String,
        address: String,
    },
    CallEnded {
        call_id: String,
    },
}

impl fmt::Display for CtiEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CtiEvent::ProviderInService => write!(f, "provider in service"),
            CtiEvent::ProviderOutOfService => write!(f, "provider out of service"),
            CtiEvent::TerminalInService { terminal } => {
                write!(f, "terminal {terminal} in service")
            }
            CtiEvent::AddressInService { address } => write!(f, "address {address} in service"),
            CtiEvent::ConnectionOffered { connection, .. } => {
                write!(f, "connection offered on {}", connection.address_name())
            }
            CtiEvent::ConnectionConnected { call_id, address } => {
                write!(f, "connection {address} connected in call {call_id}")
            }
            CtiEvent::ConnectionDisconnected { call_id, address } => {
                write!(f, "connection {address} disconnected in call {call_id}")
            }
            CtiEvent::CallEnded { call_id } => write!(f, "call {call_id} ended"),
        }
    }
}
