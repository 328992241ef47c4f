//! Network module - Runs the LoRaHop protocol over a radio modem
//!
//! Provides:
//! - Modem transport with command verification
//! - Inbound frame dispatch (forwarding, route discovery, sessions)
//! - Engine exposing the originating operations to applications

mod dispatch;
mod engine;
mod modem;

pub use dispatch::*;
pub use engine::*;
pub use modem::*;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::protocol::{Address, DEFAULT_TTL};
use crate::routing::{CacheWindows, RoutingError};

/// Engine errors
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("no node is connected")]
    NotConnected,

    #[error("no route to {0}")]
    NoRoute(Address),

    #[error("peer '{0}' is not registered")]
    PeerNotRegistered(String),

    #[error("source peer '{0}' is not registered on this node")]
    PeerNotLocal(String),

    #[error("invalid peer id '{0}'")]
    InvalidPeerId(String),

    #[error("Routing error: {0}")]
    Routing(#[from] RoutingError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

pub type EngineResult<T> = Result<T, EngineError>;

/// Configuration for one protocol engine
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Address of the local radio module
    pub address: Address,
    /// Every address that may exist in the network
    pub known_nodes: Arc<BTreeSet<Address>>,
    /// TTL of locally originated headers
    pub default_ttl: u8,
    /// Transmissions per message, route request or registration
    pub max_attempts: u32,
    /// Wait for an acknowledgment after each message transmission
    pub ack_timeout: Duration,
    /// Wait for a route after each route request
    pub route_discovery_timeout: Duration,
    /// Wait for our own registration to be relayed back
    pub registration_timeout: Duration,
    pub cache_windows: CacheWindows,
    /// Upper bound of the random delay before each transmission
    pub max_jitter: Duration,
    /// Capacity of the application event queue
    pub event_queue: usize,
}

impl EngineConfig {
    pub fn new(address: Address, known_nodes: impl IntoIterator<Item = Address>) -> Self {
        Self {
            address,
            known_nodes: Arc::new(known_nodes.into_iter().collect()),
            default_ttl: DEFAULT_TTL,
            max_attempts: 3,
            ack_timeout: Duration::from_secs(5),
            route_discovery_timeout: Duration::from_secs(5),
            registration_timeout: Duration::from_millis(2500),
            cache_windows: CacheWindows::default(),
            max_jitter: Duration::from_secs(1),
            event_queue: 256,
        }
    }

    pub fn without_jitter(mut self) -> Self {
        self.max_jitter = Duration::ZERO;
        self
    }
}
