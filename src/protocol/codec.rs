//! Protocol codec for encoding/decoding headers
//!
//! Handles the text line format shared with the radio modem. Encoding is
//! total; decoding validates field counts, address lengths and integers.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use std::fmt;
use thiserror::Error;

use super::{
    Address, Header, HeaderBody, HeaderType, FRAME_PREFIX, HEADER_DELIMITER, MESSAGE_ID_WIDTH,
    MODEM_DELIMITER,
};

/// Reasons a received line cannot be decoded into a header
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseErrorKind {
    #[error("line starts with '{0}', expected 'LR'")]
    NotAFrame(String),

    #[error("frame is missing the modem fields")]
    MissingModemFields,

    #[error("header is not enclosed in '|' delimiters")]
    MissingDelimiters,

    #[error("header field '{field}' has an unexpected format: '{value}'")]
    InvalidAddress { field: &'static str, value: String },

    #[error("header field '{field}' is not an integer: '{value}'")]
    InvalidInteger { field: &'static str, value: String },

    #[error("header field '{field}' is not a boolean: '{value}'")]
    InvalidBool { field: &'static str, value: String },

    #[error("header field '{0}' is empty")]
    EmptyField(&'static str),

    #[error("'{0}' is not a valid header type")]
    UnknownType(u8),

    #[error("header has {found} fields, expected at least 3")]
    Truncated { found: usize },

    #[error("{header_type:?} header has an unexpected length: {found} fields, expected {expected}")]
    FieldCount {
        header_type: HeaderType,
        expected: usize,
        found: usize,
    },

    #[error("message payload is empty")]
    EmptyPayload,

    #[error("message payload is not valid base64")]
    InvalidPayload,
}

/// Decoding failure, carrying the transmitter address when it could be read
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind}")]
pub struct ParseError {
    /// Transmitter of the rejected frame, if its address field was valid
    pub received_from: Option<Address>,
    pub kind: ParseErrorKind,
}

pub type ParseResult<T> = Result<T, ParseError>;

impl Header {
    /// Encode the header as `|field|field|...|`
    pub fn encode(&self) -> String {
        let mut fields: Vec<String> = vec![
            self.source.to_string(),
            (self.header_type() as u8).to_string(),
            self.ttl.to_string(),
        ];

        match &self.body {
            HeaderBody::Message {
                destination,
                next_node,
                message_id,
                payload,
            } => {
                fields.push(destination.to_string());
                fields.push(next_node.to_string());
                fields.push(format!("{:0width$}", message_id, width = MESSAGE_ID_WIDTH));
                fields.push(BASE64.encode(payload));
            }
            HeaderBody::MessageAck {
                destination,
                ack_id,
            } => {
                fields.push(destination.to_string());
                fields.push(ack_id.clone());
            }
            HeaderBody::RouteRequest { hops, end_node } => {
                fields.push(hops.to_string());
                fields.push(end_node.to_string());
            }
            HeaderBody::RouteReply {
                hops,
                end_node,
                next_node,
            } => {
                fields.push(hops.to_string());
                fields.push(end_node.to_string());
                fields.push(next_node.to_string());
            }
            HeaderBody::RouteError { broken_node } => {
                fields.push(broken_node.to_string());
            }
            HeaderBody::Registration { subscribe, peer_id } => {
                fields.push(subscribe.to_string());
                fields.push(peer_id.clone());
            }
            HeaderBody::ConnectRequest {
                end_node,
                next_node,
                source_peer_id,
                target_peer_id,
                timeout,
            } => {
                fields.push(end_node.to_string());
                fields.push(next_node.to_string());
                fields.push(source_peer_id.clone());
                fields.push(target_peer_id.clone());
                fields.push(timeout.to_string());
            }
            HeaderBody::DisconnectRequest {
                end_node,
                next_node,
                source_peer_id,
                target_peer_id,
            } => {
                fields.push(end_node.to_string());
                fields.push(next_node.to_string());
                fields.push(source_peer_id.clone());
                fields.push(target_peer_id.clone());
            }
        }

        let mut encoded = String::from(HEADER_DELIMITER);
        for field in fields {
            encoded.push_str(&field);
            encoded.push(HEADER_DELIMITER);
        }
        encoded
    }
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

/// Decode a modem receive line (`LR,<from>,<meta>,<header>`) into a header.
///
/// The header part is everything after the third comma, so payloads may
/// contain commas.
pub fn decode_frame(raw: &str) -> ParseResult<Header> {
    let raw = raw.trim_end_matches(['\r', '\n']);
    let mut parts = raw.splitn(4, MODEM_DELIMITER);
    let prefix = parts.next().unwrap_or_default();
    if prefix != FRAME_PREFIX {
        return Err(ParseError {
            received_from: None,
            kind: ParseErrorKind::NotAFrame(prefix.to_string()),
        });
    }

    let received_from = parts
        .next()
        .ok_or(ParseErrorKind::MissingModemFields)
        .and_then(|value| parse_address("received_from", value))
        .map_err(|kind| ParseError {
            received_from: None,
            kind,
        })?;

    let with_sender = |kind| ParseError {
        received_from: Some(received_from),
        kind,
    };

    let _signal = parts
        .next()
        .ok_or_else(|| with_sender(ParseErrorKind::MissingModemFields))?;
    let header_str = parts
        .next()
        .ok_or_else(|| with_sender(ParseErrorKind::MissingModemFields))?;

    let mut header = decode_header(header_str).map_err(with_sender)?;
    header.received_from = Some(received_from);
    Ok(header)
}

/// Decode the `|...|` part of a frame into a locally owned header
pub fn decode_header(header_str: &str) -> Result<Header, ParseErrorKind> {
    let inner = header_str
        .strip_prefix(HEADER_DELIMITER)
        .and_then(|s| s.strip_suffix(HEADER_DELIMITER))
        .ok_or(ParseErrorKind::MissingDelimiters)?;
    let fields: Vec<&str> = inner.split(HEADER_DELIMITER).collect();

    if fields.len() < 3 {
        return Err(ParseErrorKind::Truncated {
            found: fields.len(),
        });
    }

    let source = parse_address("source", fields[0])?;
    let code: u8 = parse_int("type", fields[1])?;
    let header_type = HeaderType::try_from(code).map_err(ParseErrorKind::UnknownType)?;
    let ttl: u8 = parse_int("ttl", fields[2])?;

    if fields.len() != header_type.field_count() {
        return Err(ParseErrorKind::FieldCount {
            header_type,
            expected: header_type.field_count(),
            found: fields.len(),
        });
    }

    let f = &fields[3..];
    let body = match header_type {
        HeaderType::Message => HeaderBody::Message {
            destination: parse_address("destination", f[0])?,
            next_node: parse_address("next_node", f[1])?,
            message_id: parse_int("message_id", f[2])?,
            payload: parse_payload(f[3])?,
        },
        HeaderType::MessageAck => HeaderBody::MessageAck {
            destination: parse_address("destination", f[0])?,
            ack_id: parse_text("ack_id", f[1])?,
        },
        HeaderType::RouteRequest => HeaderBody::RouteRequest {
            hops: parse_int("hops", f[0])?,
            end_node: parse_address("end_node", f[1])?,
        },
        HeaderType::RouteReply => HeaderBody::RouteReply {
            hops: parse_int("hops", f[0])?,
            end_node: parse_address("end_node", f[1])?,
            next_node: parse_address("next_node", f[2])?,
        },
        HeaderType::RouteError => HeaderBody::RouteError {
            broken_node: parse_address("broken_node", f[0])?,
        },
        HeaderType::Registration => HeaderBody::Registration {
            subscribe: parse_bool("subscribe", f[0])?,
            peer_id: parse_text("peer_id", f[1])?,
        },
        HeaderType::ConnectRequest => HeaderBody::ConnectRequest {
            end_node: parse_address("end_node", f[0])?,
            next_node: parse_address("next_node", f[1])?,
            source_peer_id: parse_text("source_peer_id", f[2])?,
            target_peer_id: parse_text("target_peer_id", f[3])?,
            timeout: parse_int("timeout", f[4])?,
        },
        HeaderType::DisconnectRequest => HeaderBody::DisconnectRequest {
            end_node: parse_address("end_node", f[0])?,
            next_node: parse_address("next_node", f[1])?,
            source_peer_id: parse_text("source_peer_id", f[2])?,
            target_peer_id: parse_text("target_peer_id", f[3])?,
        },
    };

    Ok(Header::new(source, ttl, body))
}

fn parse_address(field: &'static str, value: &str) -> Result<Address, ParseErrorKind> {
    value.parse().map_err(|_| ParseErrorKind::InvalidAddress {
        field,
        value: value.to_string(),
    })
}

fn parse_int<T: std::str::FromStr>(field: &'static str, value: &str) -> Result<T, ParseErrorKind> {
    value.parse().map_err(|_| ParseErrorKind::InvalidInteger {
        field,
        value: value.to_string(),
    })
}

fn parse_bool(field: &'static str, value: &str) -> Result<bool, ParseErrorKind> {
    match value {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(ParseErrorKind::InvalidBool {
            field,
            value: value.to_string(),
        }),
    }
}

fn parse_text(field: &'static str, value: &str) -> Result<String, ParseErrorKind> {
    if value.is_empty() {
        return Err(ParseErrorKind::EmptyField(field));
    }
    Ok(value.to_string())
}

fn parse_payload(value: &str) -> Result<Bytes, ParseErrorKind> {
    if value.is_empty() {
        return Err(ParseErrorKind::EmptyPayload);
    }
    BASE64
        .decode(value)
        .map(Bytes::from)
        .map_err(|_| ParseErrorKind::InvalidPayload)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> Address {
        s.parse().unwrap()
    }

    #[test]
    fn test_decode_route_request() {
        let header = decode_frame("LR,0136,10,|0137|3|8|4|0138|").unwrap();
        assert_eq!(header.received_from, Some(addr("0136")));
        assert_eq!(header.source, addr("0137"));
        assert_eq!(header.ttl, 8);
        assert_eq!(
            header.body,
            HeaderBody::RouteRequest {
                hops: 4,
                end_node: addr("0138")
            }
        );
    }

    #[test]
    fn test_decode_route_reply() {
        let header = decode_frame("LR,0136,10,|0137|4|8|3|0139|0140|").unwrap();
        assert_eq!(header.header_type(), HeaderType::RouteReply);
        assert_eq!(
            header.body,
            HeaderBody::RouteReply {
                hops: 3,
                end_node: addr("0139"),
                next_node: addr("0140")
            }
        );
    }

    #[test]
    fn test_decode_legacy_hash_ack() {
        let header = decode_frame("LR,0137,16,|0137|2|5|0138|8774d3|").unwrap();
        match header.body {
            HeaderBody::MessageAck { destination, ack_id } => {
                assert_eq!(destination, addr("0138"));
                assert_eq!(ack_id, "8774d3");
            }
            other => panic!("Wrong header type: {:?}", other),
        }
    }

    #[test]
    fn test_decode_message_with_comma_in_payload() {
        let payload = BASE64.encode("hello, good morning");
        let line = format!("LR,0136,10,|0135|1|3|0138|0137|000001|{}|", payload);
        let header = decode_frame(&line).unwrap();
        match header.body {
            HeaderBody::Message {
                destination,
                next_node,
                message_id,
                payload,
            } => {
                assert_eq!(destination, addr("0138"));
                assert_eq!(next_node, addr("0137"));
                assert_eq!(message_id, 1);
                assert_eq!(&payload[..], b"hello, good morning");
            }
            other => panic!("Wrong header type: {:?}", other),
        }
    }

    #[test]
    fn test_decode_registration_and_connect() {
        let header = decode_frame("LR,0131,10,|0131|6|4|true|test|").unwrap();
        assert_eq!(
            header.body,
            HeaderBody::Registration {
                subscribe: true,
                peer_id: "test".to_string()
            }
        );

        let header = decode_frame("LR,0131,10,|0131|7|4|0132|0132|alice|bob|60|").unwrap();
        assert_eq!(header.header_type(), HeaderType::ConnectRequest);
    }

    #[test]
    fn test_decode_strips_line_ending() {
        let header = decode_frame("LR,0131,10,|0131|5|4|0132|\r\n").unwrap();
        assert_eq!(
            header.body,
            HeaderBody::RouteError {
                broken_node: addr("0132")
            }
        );
    }

    #[test]
    fn test_short_received_from_is_rejected() {
        let err = decode_frame("LR,013,10,|0137|3|8|4|0138|").unwrap_err();
        assert_eq!(err.received_from, None);
        assert!(matches!(
            err.kind,
            ParseErrorKind::InvalidAddress {
                field: "received_from",
                ..
            }
        ));
    }

    #[test]
    fn test_bad_address_fields_are_rejected() {
        for line in [
            "LR,0136,10,|013|3|8|4|0138|",
            "LR,0136,10,|0137|3|8|4|01380|",
            "LR,0136,10,|0137|4|8|3|0139|014|",
            "LR,0136,10,|0137|5|8|01|",
            "LR,0136,10,|0137|7|4|0132|013|alice|bob|60|",
        ] {
            let err = decode_frame(line).unwrap_err();
            assert!(
                matches!(err.kind, ParseErrorKind::InvalidAddress { .. }),
                "{}: {:?}",
                line,
                err
            );
        }
    }

    #[test]
    fn test_field_count_is_exact() {
        // hops missing
        let err = decode_frame("LR,0136,10,|0137|3|8|0138|").unwrap_err();
        assert!(matches!(err.kind, ParseErrorKind::FieldCount { .. }));
        // one field too many
        let err = decode_frame("LR,0136,10,|0137|3|8|4|0138|0|").unwrap_err();
        assert!(matches!(err.kind, ParseErrorKind::FieldCount { .. }));
    }

    #[test]
    fn test_parse_error_keeps_sender() {
        let err = decode_frame("LR,0200,10,invalid message").unwrap_err();
        assert_eq!(err.received_from, Some(addr("0200")));
        assert_eq!(err.kind, ParseErrorKind::MissingDelimiters);

        let err = decode_frame("invalid message").unwrap_err();
        assert_eq!(err.received_from, None);
    }

    #[test]
    fn test_other_prefix_is_not_a_frame() {
        let err = decode_frame("XX,0130,10,|0137|3|8|4|0138|").unwrap_err();
        assert_eq!(err.received_from, None);
        assert_eq!(err.kind, ParseErrorKind::NotAFrame("XX".to_string()));

        let err = decode_frame("AT,OK").unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::NotAFrame("AT".to_string()));
    }

    #[test]
    fn test_unknown_type_and_bad_integers() {
        let err = decode_frame("LR,0136,10,|0137|9|8|3|0139|0140|").unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::UnknownType(9));

        let err = decode_frame("LR,0136,10,|0137|x|8|3|0139|").unwrap_err();
        assert!(matches!(err.kind, ParseErrorKind::InvalidInteger { field: "type", .. }));

        let err = decode_frame("LR,0136,10,|0137|3|-1|3|0139|").unwrap_err();
        assert!(matches!(err.kind, ParseErrorKind::InvalidInteger { field: "ttl", .. }));

        let err = decode_frame("LR,0136,10,|0131|6|4|yes|test|").unwrap_err();
        assert!(matches!(err.kind, ParseErrorKind::InvalidBool { .. }));
    }

    #[test]
    fn test_empty_payload_is_rejected() {
        let err = decode_frame("LR,0136,10,|0135|1|1|0138|0137|000001||").unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::EmptyPayload);

        let err = decode_frame("LR,0136,10,|0135|1|1|0138|0137|000001|!!!|").unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::InvalidPayload);
    }

    #[test]
    fn test_encode_matches_wire_format() {
        let (a, b, c) = (addr("0130"), addr("0132"), addr("0133"));
        assert_eq!(Header::route_request(a, 9, 1, c).encode(), "|0130|3|9|1|0133|");
        assert_eq!(Header::route_reply(a, 9, 1, b, c).encode(), "|0130|4|9|1|0132|0133|");
        assert_eq!(Header::route_error(a, 5, b).encode(), "|0130|5|5|0132|");
        assert_eq!(Header::ack(addr("0134"), 5, a, "1").encode(), "|0134|2|5|0130|1|");
        assert_eq!(
            Header::registration(addr("0131"), 4, true, "testPeer").encode(),
            "|0131|6|4|true|testPeer|"
        );
        assert_eq!(
            Header::message(a, 5, c, b, 1, &b"hello"[..]).encode(),
            "|0130|1|5|0133|0132|000001|aGVsbG8=|"
        );
    }

    #[test]
    fn test_every_header_type_survives_the_air() {
        let (a, b, c) = (addr("0201"), addr("0202"), addr("0203"));
        let headers = vec![
            Header::message(a, 5, b, c, 42, &b"payload|with,delims"[..]),
            Header::ack(a, 5, b, "42"),
            Header::route_request(a, 5, 0, b),
            Header::route_reply(a, 4, 2, b, c),
            Header::route_error(a, 3, b),
            Header::registration(a, 5, false, "alice"),
            Header::new(
                a,
                5,
                HeaderBody::ConnectRequest {
                    end_node: b,
                    next_node: c,
                    source_peer_id: "alice".into(),
                    target_peer_id: "bob".into(),
                    timeout: 60,
                },
            ),
            Header::new(
                a,
                5,
                HeaderBody::DisconnectRequest {
                    end_node: b,
                    next_node: c,
                    source_peer_id: "alice".into(),
                    target_peer_id: "bob".into(),
                },
            ),
        ];

        for header in headers {
            let line = format!("LR,{},-42,{}", c, header);
            let mut decoded = decode_frame(&line).unwrap();
            assert_eq!(decoded.received_from, Some(c));
            decoded.received_from = None;
            assert_eq!(decoded, header);
        }
    }
}
