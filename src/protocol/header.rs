//! Protocol header definitions
//!
//! Defines the node address type and all header types exchanged between
//! LoRaHop nodes.

use bytes::Bytes;
use std::fmt;
use std::str::FromStr;

use super::{ADDRESS_LEN, HEADER_DELIMITER, MODEM_DELIMITER};

/// A four character node address as assigned to the radio module
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address([u8; ADDRESS_LEN]);

/// Raised when a string is not a valid node address
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid address '{0}': expected 4 ASCII characters")]
pub struct InvalidAddress(pub String);

impl Address {
    pub fn as_str(&self) -> &str {
        // Only constructed from validated ASCII
        std::str::from_utf8(&self.0).unwrap_or_default()
    }
}

impl FromStr for Address {
    type Err = InvalidAddress;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = s.as_bytes();
        let valid = bytes.len() == ADDRESS_LEN
            && bytes.iter().all(|b| b.is_ascii_graphic())
            && !s.contains(HEADER_DELIMITER)
            && !s.contains(MODEM_DELIMITER);
        if !valid {
            return Err(InvalidAddress(s.to_string()));
        }
        let mut addr = [0u8; ADDRESS_LEN];
        addr.copy_from_slice(bytes);
        Ok(Self(addr))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self.as_str())
    }
}

/// Header type identifiers as carried in the second header field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum HeaderType {
    Message = 1,
    MessageAck = 2,
    RouteRequest = 3,
    RouteReply = 4,
    RouteError = 5,
    Registration = 6,
    ConnectRequest = 7,
    DisconnectRequest = 8,
}

impl HeaderType {
    /// Number of `|`-separated fields a header of this type carries,
    /// including source, type and ttl
    pub fn field_count(&self) -> usize {
        match self {
            HeaderType::Message => 7,
            HeaderType::MessageAck => 5,
            HeaderType::RouteRequest => 5,
            HeaderType::RouteReply => 6,
            HeaderType::RouteError => 4,
            HeaderType::Registration => 5,
            HeaderType::ConnectRequest => 8,
            HeaderType::DisconnectRequest => 7,
        }
    }
}

impl TryFrom<u8> for HeaderType {
    type Error = u8;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            1 => Ok(HeaderType::Message),
            2 => Ok(HeaderType::MessageAck),
            3 => Ok(HeaderType::RouteRequest),
            4 => Ok(HeaderType::RouteReply),
            5 => Ok(HeaderType::RouteError),
            6 => Ok(HeaderType::Registration),
            7 => Ok(HeaderType::ConnectRequest),
            8 => Ok(HeaderType::DisconnectRequest),
            other => Err(other),
        }
    }
}

/// Type-specific part of a header
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderBody {
    /// Application payload travelling hop by hop towards `destination`
    Message {
        destination: Address,
        next_node: Address,
        message_id: u32,
        payload: Bytes,
    },

    /// Confirms delivery of the message identified by `ack_id`
    MessageAck {
        destination: Address,
        ack_id: String,
    },

    /// Flooded search for a route to `end_node`
    RouteRequest {
        hops: u16,
        end_node: Address,
    },

    /// Unicast answer travelling back to the requester `end_node`
    RouteReply {
        hops: u16,
        end_node: Address,
        next_node: Address,
    },

    /// Network-wide notice that `broken_node` is unreachable
    RouteError {
        broken_node: Address,
    },

    /// Announces (or withdraws) an application peer hosted by the source node
    Registration {
        subscribe: bool,
        peer_id: String,
    },

    /// Asks the node hosting `target_peer_id` to open a session
    ConnectRequest {
        end_node: Address,
        next_node: Address,
        source_peer_id: String,
        target_peer_id: String,
        timeout: u32,
    },

    /// Asks the node hosting `target_peer_id` to close a session
    DisconnectRequest {
        end_node: Address,
        next_node: Address,
        source_peer_id: String,
        target_peer_id: String,
    },
}

/// A decoded or locally built protocol header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    /// Immediate transmitter; `None` for locally originated headers
    pub received_from: Option<Address>,
    /// Originating node
    pub source: Address,
    /// Remaining hop budget
    pub ttl: u8,
    pub body: HeaderBody,
}

impl Header {
    pub fn new(source: Address, ttl: u8, body: HeaderBody) -> Self {
        Self {
            received_from: None,
            source,
            ttl,
            body,
        }
    }

    pub fn message(
        source: Address,
        ttl: u8,
        destination: Address,
        next_node: Address,
        message_id: u32,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self::new(
            source,
            ttl,
            HeaderBody::Message {
                destination,
                next_node,
                message_id,
                payload: payload.into(),
            },
        )
    }

    pub fn ack(source: Address, ttl: u8, destination: Address, ack_id: impl Into<String>) -> Self {
        Self::new(
            source,
            ttl,
            HeaderBody::MessageAck {
                destination,
                ack_id: ack_id.into(),
            },
        )
    }

    pub fn route_request(source: Address, ttl: u8, hops: u16, end_node: Address) -> Self {
        Self::new(source, ttl, HeaderBody::RouteRequest { hops, end_node })
    }

    pub fn route_reply(
        source: Address,
        ttl: u8,
        hops: u16,
        end_node: Address,
        next_node: Address,
    ) -> Self {
        Self::new(
            source,
            ttl,
            HeaderBody::RouteReply {
                hops,
                end_node,
                next_node,
            },
        )
    }

    pub fn route_error(source: Address, ttl: u8, broken_node: Address) -> Self {
        Self::new(source, ttl, HeaderBody::RouteError { broken_node })
    }

    pub fn registration(source: Address, ttl: u8, subscribe: bool, peer_id: impl Into<String>) -> Self {
        Self::new(
            source,
            ttl,
            HeaderBody::Registration {
                subscribe,
                peer_id: peer_id.into(),
            },
        )
    }

    /// Get the header type identifier
    pub fn header_type(&self) -> HeaderType {
        match self.body {
            HeaderBody::Message { .. } => HeaderType::Message,
            HeaderBody::MessageAck { .. } => HeaderType::MessageAck,
            HeaderBody::RouteRequest { .. } => HeaderType::RouteRequest,
            HeaderBody::RouteReply { .. } => HeaderType::RouteReply,
            HeaderBody::RouteError { .. } => HeaderType::RouteError,
            HeaderBody::Registration { .. } => HeaderType::Registration,
            HeaderBody::ConnectRequest { .. } => HeaderType::ConnectRequest,
            HeaderBody::DisconnectRequest { .. } => HeaderType::DisconnectRequest,
        }
    }
}
