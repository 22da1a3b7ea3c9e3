//! Typed commands for both directions of the line protocol.
//!
//! Client-to-broker lines are self-describing. Broker-to-client payload
//! lines (`<ts>:<type>:<data>` versus `<reqId>:<ts>:<type>:<data>`) are only
//! unambiguous given the kind of the addressed channel, so
//! [`ServerMessage::decode`] takes the kind as context.

use super::codec::{format_frame, parse_id};
use crate::error::BusError;
use crate::types::{ChannelId, ChannelKind, EventMessage, RequestId};

/// A command sent from a client to the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    OpenPublisher,
    OpenSubscriber { queue: String },
    OpenRequestSender,
    OpenRequestHandler { queue: String },
    Close,
    Send { queue: String, message_type: String, data: String },
    Request { queue: String, message_type: String, data: String },
    Reply { request_id: RequestId, data: String },
    NoReply { request_id: RequestId },
}

/// A command sent from the broker to a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    Ack,
    Error,
    Close,
    Reply { request_id: RequestId, data: String },
    NoReply { request_id: RequestId },
    /// Delivery on a subscriber channel
    Event(EventMessage),
    /// Request to serve on a handler channel
    Request { request_id: RequestId, event: EventMessage },
}

fn split_keyword(rest: &str) -> (&str, Option<&str>) {
    match rest.split_once(' ') {
        Some((keyword, arg)) => (keyword, Some(arg)),
        None => (rest, None),
    }
}

fn split_triple(text: &str) -> Result<(&str, &str, &str), BusError> {
    let mut parts = text.splitn(3, ':');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(a), Some(b), Some(c)) => Ok((a, b, c)),
        _ => Err(BusError::protocol(format!("expected three ':'-separated fields in {text:?}"))),
    }
}

fn decode_request_id(text: &str) -> Result<RequestId, BusError> {
    parse_id(text).ok_or_else(|| BusError::protocol(format!("bad request id {text:?}")))
}

fn decode_reply(arg: &str) -> Result<(RequestId, String), BusError> {
    let (id, data) = arg
        .split_once(':')
        .ok_or_else(|| BusError::protocol(format!("malformed reply {arg:?}")))?;
    Ok((decode_request_id(id)?, data.to_string()))
}

fn decode_event(text: &str) -> Result<EventMessage, BusError> {
    let (timestamp, message_type, data) = split_triple(text)?;
    let timestamp = parse_id(timestamp)
        .ok_or_else(|| BusError::protocol(format!("bad timestamp {timestamp:?}")))?;
    Ok(EventMessage::new(timestamp, message_type, data))
}

impl ClientMessage {
    /// Decodes the part of a line after the channel id.
    pub fn decode(rest: &str) -> Result<Self, BusError> {
        let (keyword, arg) = split_keyword(rest);
        let message = match (keyword, arg) {
            ("PUB", None) => ClientMessage::OpenPublisher,
            ("SUB", Some(queue)) => ClientMessage::OpenSubscriber { queue: queue.to_string() },
            ("REQ", None) => ClientMessage::OpenRequestSender,
            ("HND", Some(queue)) => ClientMessage::OpenRequestHandler { queue: queue.to_string() },
            ("CLOSE", None) => ClientMessage::Close,
            ("SEND", Some(payload)) => {
                let (queue, message_type, data) = split_triple(payload)?;
                ClientMessage::Send {
                    queue: queue.to_string(),
                    message_type: message_type.to_string(),
                    data: data.to_string(),
                }
            }
            ("REQ", Some(payload)) => {
                let (queue, message_type, data) = split_triple(payload)?;
                ClientMessage::Request {
                    queue: queue.to_string(),
                    message_type: message_type.to_string(),
                    data: data.to_string(),
                }
            }
            ("REP", Some(arg)) => {
                let (request_id, data) = decode_reply(arg)?;
                ClientMessage::Reply { request_id, data }
            }
            ("NREP", Some(arg)) => ClientMessage::NoReply { request_id: decode_request_id(arg)? },
            _ => return Err(BusError::protocol(format!("unknown client command {rest:?}"))),
        };
        Ok(message)
    }

    /// The channel kind this command opens, if it is an open command.
    pub fn opens(&self) -> Option<ChannelKind> {
        match self {
            ClientMessage::OpenPublisher => Some(ChannelKind::Publisher),
            ClientMessage::OpenSubscriber { .. } => Some(ChannelKind::Subscriber),
            ClientMessage::OpenRequestSender => Some(ChannelKind::RequestSender),
            ClientMessage::OpenRequestHandler { .. } => Some(ChannelKind::RequestHandler),
            _ => None,
        }
    }

    /// Encodes a complete line for `channel_id`, newline included.
    pub fn encode(&self, channel_id: ChannelId) -> String {
        let rest = match self {
            ClientMessage::OpenPublisher => "PUB".to_string(),
            ClientMessage::OpenSubscriber { queue } => format!("SUB {queue}"),
            ClientMessage::OpenRequestSender => "REQ".to_string(),
            ClientMessage::OpenRequestHandler { queue } => format!("HND {queue}"),
            ClientMessage::Close => "CLOSE".to_string(),
            ClientMessage::Send { queue, message_type, data } => {
                format!("SEND {queue}:{message_type}:{data}")
            }
            ClientMessage::Request { queue, message_type, data } => {
                format!("REQ {queue}:{message_type}:{data}")
            }
            ClientMessage::Reply { request_id, data } => format!("REP {request_id}:{data}"),
            ClientMessage::NoReply { request_id } => format!("NREP {request_id}"),
        };
        format_frame(channel_id, &rest)
    }
}

impl ServerMessage {
    /// Decodes the part of a line after the channel id, for a channel of
    /// the given kind.
    pub fn decode(kind: ChannelKind, rest: &str) -> Result<Self, BusError> {
        let (keyword, arg) = split_keyword(rest);
        match (keyword, arg) {
            ("ACK", None) => return Ok(ServerMessage::Ack),
            ("ERR", None) => return Ok(ServerMessage::Error),
            ("CLOSE", None) => return Ok(ServerMessage::Close),
            ("REP", Some(arg)) => {
                let (request_id, data) = decode_reply(arg)?;
                return Ok(ServerMessage::Reply { request_id, data });
            }
            ("NREP", Some(arg)) => {
                return Ok(ServerMessage::NoReply { request_id: decode_request_id(arg)? })
            }
            _ => {}
        }
        match kind {
            ChannelKind::Subscriber => Ok(ServerMessage::Event(decode_event(rest)?)),
            ChannelKind::RequestHandler => {
                let (request_id, event) = rest
                    .split_once(':')
                    .ok_or_else(|| BusError::protocol(format!("malformed request {rest:?}")))?;
                Ok(ServerMessage::Request {
                    request_id: decode_request_id(request_id)?,
                    event: decode_event(event)?,
                })
            }
            ChannelKind::Publisher | ChannelKind::RequestSender => Err(BusError::protocol(
                format!("unexpected line {rest:?} on {kind} channel"),
            )),
        }
    }

    /// Encodes a complete line for `channel_id`, newline included.
    pub fn encode(&self, channel_id: ChannelId) -> String {
        let rest = match self {
            ServerMessage::Ack => "ACK".to_string(),
            ServerMessage::Error => "ERR".to_string(),
            ServerMessage::Close => "CLOSE".to_string(),
            ServerMessage::Reply { request_id, data } => format!("REP {request_id}:{data}"),
            ServerMessage::NoReply { request_id } => format!("NREP {request_id}"),
            ServerMessage::Event(event) => {
                format!("{}:{}:{}", event.timestamp, event.message_type, event.data)
            }
            ServerMessage::Request { request_id, event } => format!(
                "{request_id}:{}:{}:{}",
                event.timestamp, event.message_type, event.data
            ),
        };
        format_frame(channel_id, &rest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_client_commands() {
        assert_eq!(ClientMessage::decode("PUB").unwrap(), ClientMessage::OpenPublisher);
        assert_eq!(ClientMessage::decode("REQ").unwrap(), ClientMessage::OpenRequestSender);
        assert_eq!(
            ClientMessage::decode("SUB tappables").unwrap(),
            ClientMessage::OpenSubscriber { queue: "tappables".to_string() }
        );
        assert_eq!(
            ClientMessage::decode("SEND q:spawn:{\"a\":\"b:c\"}").unwrap(),
            ClientMessage::Send {
                queue: "q".to_string(),
                message_type: "spawn".to_string(),
                data: "{\"a\":\"b:c\"}".to_string(),
            }
        );
        assert_eq!(
            ClientMessage::decode("REQ q:t:").unwrap(),
            ClientMessage::Request {
                queue: "q".to_string(),
                message_type: "t".to_string(),
                data: String::new(),
            }
        );
        assert_eq!(
            ClientMessage::decode("REP 4:x y").unwrap(),
            ClientMessage::Reply { request_id: 4, data: "x y".to_string() }
        );
        assert_eq!(ClientMessage::decode("NREP 9").unwrap(), ClientMessage::NoReply { request_id: 9 });
    }

    #[test]
    fn test_decode_client_rejects_malformed() {
        for line in ["", "PUB extra", "SUB", "CLOSE now", "SEND q:t", "REP x:1", "NREP", "HELLO"] {
            assert!(ClientMessage::decode(line).is_err(), "{line:?} should not decode");
        }
    }

    #[test]
    fn test_opens() {
        assert_eq!(ClientMessage::OpenPublisher.opens(), Some(ChannelKind::Publisher));
        assert_eq!(
            ClientMessage::OpenRequestHandler { queue: "q".to_string() }.opens(),
            Some(ChannelKind::RequestHandler)
        );
        assert_eq!(ClientMessage::Close.opens(), None);
    }

    #[test]
    fn test_server_lines_depend_on_channel_kind() {
        let rest = "17:6:t:d";
        assert_eq!(
            ServerMessage::decode(ChannelKind::Subscriber, rest).unwrap(),
            ServerMessage::Event(EventMessage::new(17, "6", "t:d"))
        );
        assert_eq!(
            ServerMessage::decode(ChannelKind::RequestHandler, rest).unwrap(),
            ServerMessage::Request { request_id: 17, event: EventMessage::new(6, "t", "d") }
        );
        assert!(ServerMessage::decode(ChannelKind::Publisher, rest).is_err());
        assert!(ServerMessage::decode(ChannelKind::Subscriber, "abc:t:d").is_err());
    }

    #[test]
    fn test_server_keywords() {
        for kind in [ChannelKind::Publisher, ChannelKind::Subscriber] {
            assert_eq!(ServerMessage::decode(kind, "ACK").unwrap(), ServerMessage::Ack);
            assert_eq!(ServerMessage::decode(kind, "ERR").unwrap(), ServerMessage::Error);
        }
        assert_eq!(
            ServerMessage::decode(ChannelKind::RequestSender, "REP 1:").unwrap(),
            ServerMessage::Reply { request_id: 1, data: String::new() }
        );
        assert_eq!(
            ServerMessage::decode(ChannelKind::RequestSender, "NREP 2").unwrap(),
            ServerMessage::NoReply { request_id: 2 }
        );
    }

    #[test]
    fn test_encode_lines() {
        assert_eq!(ClientMessage::OpenPublisher.encode(1), "1 PUB\n");
        assert_eq!(
            ClientMessage::Send {
                queue: "q".to_string(),
                message_type: "t".to_string(),
                data: "d".to_string(),
            }
            .encode(2),
            "2 SEND q:t:d\n"
        );
        assert_eq!(ServerMessage::NoReply { request_id: 3 }.encode(4), "4 NREP 3\n");
        assert_eq!(
            ServerMessage::Request { request_id: 5, event: EventMessage::new(100, "t", "a:b") }.encode(6),
            "6 5:100:t:a:b\n"
        );
    }
}
