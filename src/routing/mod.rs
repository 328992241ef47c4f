//! Routing module - Route store, peer directory and duplicate suppression
//!
//! Provides:
//! - Route entries with shortest-path selection
//! - Directory of application peers and the node hosting them
//! - Time-windowed caches that suppress reprocessing of flooded frames

mod dedup;
mod table;

pub use dedup::*;
pub use table::*;

use std::time::Duration;
use thiserror::Error;

use crate::protocol::Address;

/// Routing errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RoutingError {
    #[error("destination address '{0}' does not exist")]
    UnknownDestination(Address),
}

pub type RoutingResult<T> = Result<T, RoutingError>;

/// Windows of the deduplication caches kept by the routing table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheWindows {
    /// Processed route requests, keyed by sought node
    pub route_request: Duration,
    /// Processed registrations, keyed by source node
    pub registration: Duration,
    /// Connect and disconnect requests, keyed by peer pair
    pub session: Duration,
    /// Delivered messages, keyed by source and message id
    pub message: Duration,
}

impl Default for CacheWindows {
    fn default() -> Self {
        Self {
            route_request: Duration::from_secs(8),
            registration: Duration::from_secs(8),
            session: Duration::from_secs(45),
            message: Duration::from_secs(300),
        }
    }
}
