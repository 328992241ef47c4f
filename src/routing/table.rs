//! Routing table
//!
//! Routes are kept in insertion order so that equal-cost routes resolve to
//! the one learned first.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

use super::{CacheWindows, DedupCache, RoutingError, RoutingResult};
use crate::protocol::Address;

/// A known way to reach `destination`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RouteEntry {
    pub destination: Address,
    pub next_node: Address,
    pub hops: u16,
}

impl fmt::Display for RouteEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} via {} ({} hops)",
            self.destination, self.next_node, self.hops
        )
    }
}

/// An application peer hosted by the node at `address`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerRegistration {
    pub peer_id: String,
    pub address: Address,
}

/// Routes, peers and dedup caches of one node
#[derive(Debug)]
pub struct RoutingTable {
    /// Closed set of addresses that may exist in the network
    known_nodes: Arc<BTreeSet<Address>>,
    routes: Vec<RouteEntry>,
    peers: Vec<PeerRegistration>,
    unsupported_devices: Vec<Address>,
    route_requests: DedupCache<Address>,
    registrations: DedupCache<Address>,
    connect_requests: DedupCache<(String, String)>,
    disconnect_requests: DedupCache<(String, String)>,
    messages: DedupCache<(Address, u32)>,
}

impl RoutingTable {
    pub fn new(known_nodes: Arc<BTreeSet<Address>>, windows: CacheWindows) -> Self {
        Self {
            known_nodes,
            routes: Vec::new(),
            peers: Vec::new(),
            unsupported_devices: Vec::new(),
            route_requests: DedupCache::new(windows.route_request),
            registrations: DedupCache::new(windows.registration),
            connect_requests: DedupCache::new(windows.session),
            disconnect_requests: DedupCache::new(windows.session),
            messages: DedupCache::new(windows.message),
        }
    }

    /// Insert a route unless the exact same entry is already present
    pub fn add_route(&mut self, destination: Address, next_node: Address, hops: u16) {
        let entry = RouteEntry {
            destination,
            next_node,
            hops,
        };
        if self.routes.contains(&entry) {
            debug!(route = %entry, "Route already known");
            return;
        }

        debug!(route = %entry, "New route");
        self.routes.push(entry);
        self.unsupported_devices.retain(|addr| *addr != destination);
    }

    /// Shortest known route to `destination`.
    ///
    /// Fails for addresses outside the configured address space and returns
    /// `None` when the address is valid but no route is known yet.
    pub fn best_route(&self, destination: Address) -> RoutingResult<Option<RouteEntry>> {
        if !self.known_nodes.contains(&destination) {
            return Err(RoutingError::UnknownDestination(destination));
        }

        // min_by_key keeps the last minimum, so fold for first-seen order
        Ok(self
            .routes
            .iter()
            .filter(|entry| entry.destination == destination)
            .fold(None, |best: Option<&RouteEntry>, entry| match best {
                Some(b) if b.hops <= entry.hops => Some(b),
                _ => Some(entry),
            })
            .copied())
    }

    /// Check whether any route to `destination` exists
    pub fn has_route(&self, destination: Address) -> bool {
        self.routes.iter().any(|entry| entry.destination == destination)
    }

    /// Drop every route whose destination is `destination`
    pub fn remove_routes_for(&mut self, destination: Address) {
        let before = self.routes.len();
        self.routes.retain(|entry| entry.destination != destination);
        let removed = before - self.routes.len();
        if removed > 0 {
            info!(%destination, removed, "Removed routes");
        }
    }

    /// Record the immediate transmitter of a frame as a one-hop neighbor
    pub fn note_neighbor(&mut self, received_from: Address) {
        self.add_route(received_from, received_from, 1);
    }

    /// Best route for every known destination, in first-seen order
    pub fn best_routes(&self) -> Vec<RouteEntry> {
        let mut best: Vec<RouteEntry> = Vec::new();
        for entry in &self.routes {
            match best.iter_mut().find(|b| b.destination == entry.destination) {
                Some(b) if entry.hops < b.hops => *b = *entry,
                Some(_) => {}
                None => best.push(*entry),
            }
        }
        best
    }

    /// Snapshot of every route entry
    pub fn routes(&self) -> Vec<RouteEntry> {
        self.routes.clone()
    }

    /// Flag a node whose frames could not be parsed
    pub fn mark_unsupported(&mut self, address: Address) {
        if !self.unsupported_devices.contains(&address) {
            info!(%address, "Node is transmitting frames of an unsupported protocol");
            self.unsupported_devices.push(address);
        }
    }

    pub fn unsupported_devices(&self) -> Vec<Address> {
        self.unsupported_devices.clone()
    }

    pub fn add_peer(&mut self, peer_id: &str, address: Address) {
        let peer = PeerRegistration {
            peer_id: peer_id.to_string(),
            address,
        };
        if self.peers.contains(&peer) {
            debug!(peer_id, %address, "Peer already registered");
            return;
        }
        info!(peer_id, %address, "Peer registered");
        self.peers.push(peer);
    }

    pub fn remove_peer(&mut self, peer_id: &str, address: Address) {
        let before = self.peers.len();
        self.peers
            .retain(|peer| !(peer.peer_id == peer_id && peer.address == address));
        if self.peers.len() != before {
            info!(peer_id, %address, "Peer unregistered");
        }
    }

    /// Snapshot of the peer directory
    pub fn peers(&self) -> Vec<PeerRegistration> {
        self.peers.clone()
    }

    /// Node hosting `peer_id`, if the peer is registered
    pub fn peer_address(&self, peer_id: &str) -> Option<Address> {
        self.peers
            .iter()
            .find(|peer| peer.peer_id == peer_id)
            .map(|peer| peer.address)
    }

    pub fn is_registered(&self, peer_id: &str) -> bool {
        self.peer_address(peer_id).is_some()
    }

    pub fn seen_route_request(&mut self, end_node: Address) -> bool {
        self.route_requests.contains(&end_node)
    }

    pub fn mark_route_request(&mut self, end_node: Address) {
        self.route_requests.insert(end_node);
    }

    pub fn seen_registration(&mut self, source: Address) -> bool {
        self.registrations.contains(&source)
    }

    pub fn mark_registration(&mut self, source: Address) {
        self.registrations.insert(source);
    }

    pub fn seen_connect_request(&mut self, source_peer_id: &str, target_peer_id: &str) -> bool {
        self.connect_requests
            .contains(&peer_pair(source_peer_id, target_peer_id))
    }

    pub fn mark_connect_request(&mut self, source_peer_id: &str, target_peer_id: &str) {
        self.connect_requests
            .insert(peer_pair(source_peer_id, target_peer_id));
    }

    pub fn seen_disconnect_request(&mut self, source_peer_id: &str, target_peer_id: &str) -> bool {
        self.disconnect_requests
            .contains(&peer_pair(source_peer_id, target_peer_id))
    }

    pub fn mark_disconnect_request(&mut self, source_peer_id: &str, target_peer_id: &str) {
        self.disconnect_requests
            .insert(peer_pair(source_peer_id, target_peer_id));
    }

    pub fn seen_message(&mut self, source: Address, message_id: u32) -> bool {
        self.messages.contains(&(source, message_id))
    }

    pub fn mark_message_seen(&mut self, source: Address, message_id: u32) {
        self.messages.insert((source, message_id));
    }
}

fn peer_pair(source_peer_id: &str, target_peer_id: &str) -> (String, String) {
    (source_peer_id.to_string(), target_peer_id.to_string())
}
