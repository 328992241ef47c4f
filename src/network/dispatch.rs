//! Inbound frame dispatch
//!
//! [`NodeState`] holds everything a node knows and turns each received
//! header into the headers to transmit and the events to hand to the
//! application. It performs no I/O itself.

use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, trace, warn};

use crate::protocol::{decode_frame, Address, Header, HeaderBody};
use crate::routing::RoutingTable;

use super::{EngineError, EngineResult};

/// Events delivered to the application
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppEvent {
    /// Payload of a message addressed to this node
    Delivered {
        source: Address,
        message_id: u32,
        payload: Bytes,
    },
    /// A remote peer asks to open a session with a local peer
    ConnectRequest {
        source: Address,
        source_peer_id: String,
        target_peer_id: String,
        timeout: u32,
    },
    /// A remote peer closes its session with a local peer
    DisconnectRequest {
        source: Address,
        source_peer_id: String,
        target_peer_id: String,
    },
}

/// Outcome of processing one frame
#[derive(Debug, Default)]
pub struct Actions {
    /// Headers to transmit, in order
    pub outbound: Vec<Header>,
    pub events: Vec<AppEvent>,
}

impl Actions {
    fn send(&mut self, header: Header) {
        self.outbound.push(header);
    }

    fn emit(&mut self, event: AppEvent) {
        self.events.push(event);
    }
}

/// Protocol state of one node
#[derive(Debug)]
pub struct NodeState {
    address: Address,
    default_ttl: u8,
    pub table: RoutingTable,
    ack_wait: HashSet<u32>,
    connected_node: Option<Address>,
    message_counter: u32,
    /// Registrations we broadcast, keyed by (subscribe, peer_id), and
    /// whether a neighbor has relayed them back yet
    own_registrations: HashMap<(bool, String), bool>,
}

impl NodeState {
    pub fn new(address: Address, default_ttl: u8, table: RoutingTable) -> Self {
        Self {
            address,
            default_ttl,
            table,
            ack_wait: HashSet::new(),
            connected_node: None,
            message_counter: 0,
            own_registrations: HashMap::new(),
        }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn default_ttl(&self) -> u8 {
        self.default_ttl
    }

    pub fn connected_node(&self) -> Option<Address> {
        self.connected_node
    }

    pub fn set_connected_node(&mut self, node: Option<Address>) {
        self.connected_node = node;
    }

    /// Allocate the id of the next originated message
    pub fn next_message_id(&mut self) -> u32 {
        self.message_counter = self.message_counter.wrapping_add(1);
        self.message_counter
    }

    pub fn await_ack(&mut self, message_id: u32) {
        self.ack_wait.insert(message_id);
    }

    pub fn is_awaiting_ack(&self, message_id: u32) -> bool {
        self.ack_wait.contains(&message_id)
    }

    /// Stop waiting for `message_id`; returns whether it was pending
    pub fn clear_ack(&mut self, message_id: u32) -> bool {
        self.ack_wait.remove(&message_id)
    }

    /// Start listening for the loopback of our own registration
    pub fn expect_registration(&mut self, subscribe: bool, peer_id: &str) {
        self.own_registrations
            .insert((subscribe, peer_id.to_string()), false);
    }

    pub fn registration_echoed(&self, subscribe: bool, peer_id: &str) -> bool {
        self.own_registrations
            .get(&(subscribe, peer_id.to_string()))
            .copied()
            .unwrap_or(false)
    }

    pub fn finish_registration(&mut self, subscribe: bool, peer_id: &str) {
        self.own_registrations
            .remove(&(subscribe, peer_id.to_string()));
    }

    /// Check a connect or disconnect request before sending it.
    ///
    /// Returns the address of the node hosting the target peer.
    pub fn check_peers(&self, source_peer_id: &str, target_peer_id: &str) -> EngineResult<Address> {
        let source_node = self
            .table
            .peer_address(source_peer_id)
            .ok_or_else(|| EngineError::PeerNotRegistered(source_peer_id.to_string()))?;
        let target_node = self
            .table
            .peer_address(target_peer_id)
            .ok_or_else(|| EngineError::PeerNotRegistered(target_peer_id.to_string()))?;

        if source_node != self.address {
            return Err(EngineError::PeerNotLocal(source_peer_id.to_string()));
        }
        Ok(target_node)
    }

    /// Decode and process a raw modem line.
    ///
    /// Lines that fail to parse flag their transmitter as unsupported.
    pub fn process_line(&mut self, raw: &str) -> Actions {
        match decode_frame(raw) {
            Ok(header) => self.process(header),
            Err(e) => {
                warn!(line = raw.trim_end(), "Dropping unparsable frame: {}", e);
                if let Some(sender) = e.received_from {
                    self.table.mark_unsupported(sender);
                }
                Actions::default()
            }
        }
    }

    /// Process a received header
    pub fn process(&mut self, header: Header) -> Actions {
        let mut actions = Actions::default();

        let Some(received_from) = header.received_from else {
            warn!(?header, "Ignoring header without transmitter");
            return actions;
        };

        if header.ttl <= 1 {
            debug!(source = %header.source, ttl = header.ttl, "TTL exhausted, dropping");
            return actions;
        }

        self.table.note_neighbor(received_from);
        trace!(
            source = %header.source,
            from = %received_from,
            kind = ?header.header_type(),
            ttl = header.ttl,
            "Processing header"
        );

        match header.body.clone() {
            HeaderBody::RouteRequest { hops, end_node } => {
                self.on_route_request(header, received_from, hops, end_node, &mut actions)
            }
            HeaderBody::RouteReply {
                hops,
                end_node,
                next_node,
            } => self.on_route_reply(header, received_from, hops, end_node, next_node, &mut actions),
            HeaderBody::RouteError { broken_node } => {
                if self.table.has_route(broken_node) {
                    info!(%broken_node, "Route error received, removing routes");
                    self.table.remove_routes_for(broken_node);
                }
                actions.send(relayed(header));
            }
            HeaderBody::MessageAck {
                destination,
                ack_id,
            } => {
                if destination == self.address {
                    match ack_id.parse::<u32>() {
                        Ok(id) => {
                            if self.clear_ack(id) {
                                debug!(message_id = id, "Message acknowledged");
                            } else {
                                debug!(message_id = id, "Acknowledgment for unknown message");
                            }
                        }
                        Err(_) => debug!(%ack_id, "Ignoring acknowledgment with non-numeric id"),
                    }
                } else {
                    debug!(%destination, "Forwarding acknowledgment");
                    actions.send(relayed(header));
                }
            }
            HeaderBody::Message {
                destination,
                next_node,
                message_id,
                payload,
            } => self.on_message(header, destination, next_node, message_id, payload, &mut actions),
            HeaderBody::Registration { subscribe, peer_id } => {
                if header.source == self.address {
                    match self.own_registrations.get_mut(&(subscribe, peer_id)) {
                        Some(echoed) => {
                            debug!(subscribe, "Own registration relayed back");
                            *echoed = true;
                        }
                        None => debug!(subscribe, "Ignoring loopback of a finished registration"),
                    }
                } else {
                    self.table.mark_registration(header.source);
                    if subscribe {
                        self.table.add_peer(&peer_id, header.source);
                    } else {
                        self.table.remove_peer(&peer_id, header.source);
                    }
                    actions.send(relayed(header));
                }
            }
            HeaderBody::ConnectRequest {
                end_node,
                next_node,
                source_peer_id,
                target_peer_id,
                timeout,
            } => {
                if received_from == self.address {
                    return actions;
                }
                if end_node == self.address {
                    info!(source = %header.source, %source_peer_id, %target_peer_id, "Connect request");
                    self.connected_node = Some(header.source);
                    actions.emit(AppEvent::ConnectRequest {
                        source: header.source,
                        source_peer_id,
                        target_peer_id,
                        timeout,
                    });
                } else if next_node == self.address {
                    self.forward_session(header, end_node, &mut actions);
                }
            }
            HeaderBody::DisconnectRequest {
                end_node,
                next_node,
                source_peer_id,
                target_peer_id,
            } => {
                if received_from == self.address {
                    return actions;
                }
                if end_node == self.address {
                    info!(source = %header.source, %source_peer_id, %target_peer_id, "Disconnect request");
                    self.connected_node = Some(header.source);
                    actions.emit(AppEvent::DisconnectRequest {
                        source: header.source,
                        source_peer_id,
                        target_peer_id,
                    });
                } else if next_node == self.address {
                    self.forward_session(header, end_node, &mut actions);
                }
            }
        }

        actions
    }

    fn on_route_request(
        &mut self,
        mut header: Header,
        received_from: Address,
        hops: u16,
        end_node: Address,
        actions: &mut Actions,
    ) {
        let source = header.source;
        if source == self.address {
            return;
        }

        if end_node == self.address {
            self.table.add_route(source, received_from, hops.saturating_add(1));
            info!(%source, via = %received_from, "Answering route request");
            actions.send(Header::route_reply(
                self.address,
                self.default_ttl,
                0,
                source,
                received_from,
            ));
            return;
        }

        match self.table.best_route(source) {
            Ok(None) => self.table.add_route(source, received_from, hops),
            Ok(Some(_)) => {}
            Err(e) => {
                warn!("Dropping route request: {}", e);
                return;
            }
        }

        if self.table.seen_route_request(end_node) {
            debug!(%end_node, "Route request already processed");
            return;
        }
        self.table.mark_route_request(end_node);

        header.body = HeaderBody::RouteRequest {
            hops: hops.saturating_add(1),
            end_node,
        };
        debug!(%source, %end_node, "Forwarding route request");
        actions.send(relayed(header));
    }

    fn on_route_reply(
        &mut self,
        mut header: Header,
        received_from: Address,
        hops: u16,
        end_node: Address,
        next_node: Address,
        actions: &mut Actions,
    ) {
        let source = header.source;
        if source == self.address {
            return;
        }

        if end_node == self.address {
            info!(%source, via = %received_from, hops = hops.saturating_add(1), "Route discovered");
            self.table.add_route(source, received_from, hops.saturating_add(1));
            return;
        }
        if next_node != self.address {
            return;
        }

        match self.table.best_route(source) {
            Ok(Some(_)) => {}
            Ok(None) => {
                info!(%source, "Cannot forward route reply, no route to its source");
                return;
            }
            Err(e) => {
                warn!("Dropping route reply: {}", e);
                return;
            }
        }
        self.table.add_route(source, received_from, hops.saturating_add(1));

        match self.table.best_route(end_node) {
            Ok(Some(route)) => {
                header.body = HeaderBody::RouteReply {
                    hops: hops.saturating_add(1),
                    end_node,
                    next_node: route.next_node,
                };
                debug!(%source, %end_node, next = %route.next_node, "Forwarding route reply");
                actions.send(relayed(header));
            }
            Ok(None) => info!(%end_node, "Cannot forward route reply, no route to requester"),
            Err(e) => warn!("Dropping route reply: {}", e),
        }
    }

    fn on_message(
        &mut self,
        mut header: Header,
        destination: Address,
        next_node: Address,
        message_id: u32,
        payload: Bytes,
        actions: &mut Actions,
    ) {
        let source = header.source;

        if destination == self.address && Some(source) == self.connected_node {
            if self.table.seen_message(source, message_id) {
                debug!(%source, message_id, "Duplicate message, acknowledging again");
            } else {
                self.table.mark_message_seen(source, message_id);
                info!(%source, message_id, len = payload.len(), "Message received");
                actions.emit(AppEvent::Delivered {
                    source,
                    message_id,
                    payload,
                });
            }
            actions.send(Header::ack(
                self.address,
                self.default_ttl,
                source,
                message_id.to_string(),
            ));
        } else if next_node == self.address && destination != self.address {
            match self.table.best_route(destination) {
                Ok(Some(route)) => {
                    header.body = HeaderBody::Message {
                        destination,
                        next_node: route.next_node,
                        message_id,
                        payload,
                    };
                    info!(%source, %destination, next = %route.next_node, "Forwarding message");
                    actions.send(relayed(header));
                }
                Ok(None) => info!(%destination, "No route to forward message"),
                Err(e) => warn!("Dropping message: {}", e),
            }
        } else {
            debug!(%source, %destination, "Ignoring message");
        }
    }

    fn forward_session(&mut self, mut header: Header, end_node: Address, actions: &mut Actions) {
        let route = match self.table.best_route(end_node) {
            Ok(Some(route)) => route,
            Ok(None) => {
                debug!(%end_node, "No route to forward session request");
                return;
            }
            Err(e) => {
                warn!("Dropping session request: {}", e);
                return;
            }
        };

        if let HeaderBody::ConnectRequest { next_node, .. }
        | HeaderBody::DisconnectRequest { next_node, .. } = &mut header.body
        {
            *next_node = route.next_node;
        }
        debug!(%end_node, next = %route.next_node, "Forwarding session request");
        actions.send(relayed(header));
    }
}

/// Prepare a received header for retransmission by this node
fn relayed(mut header: Header) -> Header {
    header.received_from = None;
    header.ttl -= 1;
    header
}
