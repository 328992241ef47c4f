//! Protocol module - Defines the radio wire format for LoRaHop
//!
//! Every header travels as a single text line inside the modem's receive
//! notification:
//! - `LR,<received_from>,<signal metadata>,` prefix added by the modem
//! - `|source|type|ttl|...|` header fields, delimited by `|`
//! - type-specific fields in a fixed order per header type

mod codec;
mod header;

pub use codec::*;
pub use header::*;

/// Length of every node address on the wire
pub const ADDRESS_LEN: usize = 4;

/// Hop budget given to every locally originated header
pub const DEFAULT_TTL: u8 = 5;

/// Delimiter between header fields
pub const HEADER_DELIMITER: char = '|';

/// Delimiter between the fields of a modem notification line
pub const MODEM_DELIMITER: char = ',';

/// Prefix the modem puts in front of every received frame
pub const FRAME_PREFIX: &str = "LR";

/// Width used when zero-padding message ids on the wire
pub const MESSAGE_ID_WIDTH: usize = 6;
