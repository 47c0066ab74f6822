//! Control channel.
//!
//! The control plane speaks Socket.IO v4 over an Engine.IO v4 WebSocket
//! transport. Only the parts the node needs are implemented: the default
//! namespace, text frames, events with acknowledgements and heartbeats.
//!
//! ## Framing
//!
//! Every WebSocket text frame carries one Engine.IO packet, prefixed by
//! its type digit. Socket.IO packets travel inside Engine.IO `message`
//! packets:
//!
//! ```text
//! 0{"sid":"..","pingInterval":25000,"pingTimeout":20000}   open
//! 2 / 3                                                    ping / pong
//! 40{"token":".."}                                         connect
//! 42["enable",{..}] / 4212["enable",{..}]                  event (with ack id 12)
//! 4312[null,true]                                          ack for id 12
//! ```

pub mod client;

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use displaydoc::Display;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::{NodeError, NodeResult};

pub use client::WebSocketConnector;

/// A codec error.
#[derive(Debug, Display, PartialEq, Eq)]
pub enum Error {
    /// Empty packet.
    Empty,

    /// Unknown packet type {0:?}.
    UnknownType(char),

    /// Malformed packet: {0}
    Malformed(String),
}

impl std::error::Error for Error {}

/// An Engine.IO packet.
#[derive(Debug, Clone, PartialEq)]
pub enum EnginePacket {
    Open(OpenData),
    Close,
    Ping(String),
    Pong(String),
    Message(String),
    Upgrade,
    Noop,
}

/// The handshake of an Engine.IO session.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenData {
    pub sid: String,

    /// Interval of server pings in milliseconds.
    pub ping_interval: u64,

    /// How long the server waits for a pong, in milliseconds.
    pub ping_timeout: u64,
}

/// A Socket.IO packet on the default namespace.
#[derive(Debug, Clone, PartialEq)]
pub enum SocketPacket {
    Connect(Option<Value>),
    Disconnect,
    Event {
        id: Option<u64>,
        name: String,
        args: Vec<Value>,
    },
    Ack {
        id: u64,
        args: Vec<Value>,
    },
    ConnectError(Value),
}

/// Something the control plane pushed to the node.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// A server-initiated event.
    Event { name: String, args: Vec<Value> },

    /// The channel closed.
    Disconnected { reason: String },
}

/// An established control channel.
#[async_trait]
pub trait ControlChannel: Send + Sync + Debug {
    /// Emits an event and waits for its acknowledgement.
    ///
    /// Returns the value of an `[null, value]` acknowledgement. An
    /// acknowledgement carrying an error fails with
    /// [`NodeError::ControlPlaneError`].
    async fn emit(&self, event: &str, payload: Option<Value>, timeout: Duration)
        -> NodeResult<Value>;

    /// Closes the channel.
    async fn close(&self);
}

/// A freshly opened channel together with its server events.
#[derive(Debug)]
pub struct Connection {
    pub channel: Arc<dyn ControlChannel>,
    pub events: mpsc::UnboundedReceiver<ChannelEvent>,
}

/// Opens control channels.
#[async_trait]
pub trait Connector: Send + Sync + Debug {
    async fn connect(&self, token: &str) -> NodeResult<Connection>;
}

impl EnginePacket {
    pub fn parse(frame: &str) -> Result<Self, Error> {
        let mut chars = frame.chars();
        let kind = chars.next().ok_or(Error::Empty)?;
        let data = chars.as_str();

        match kind {
            '0' => serde_json::from_str(data)
                .map(Self::Open)
                .map_err(|e| Error::Malformed(e.to_string())),
            '1' => Ok(Self::Close),
            '2' => Ok(Self::Ping(data.to_string())),
            '3' => Ok(Self::Pong(data.to_string())),
            '4' => Ok(Self::Message(data.to_string())),
            '5' => Ok(Self::Upgrade),
            '6' => Ok(Self::Noop),
            c => Err(Error::UnknownType(c)),
        }
    }

    pub fn encode(&self) -> String {
        match self {
            // Only servers send the handshake
            Self::Open(data) => format!(
                "0{}",
                serde_json::json!({
                    "sid": data.sid,
                    "pingInterval": data.ping_interval,
                    "pingTimeout": data.ping_timeout,
                })
            ),
            Self::Close => "1".to_string(),
            Self::Ping(data) => format!("2{}", data),
            Self::Pong(data) => format!("3{}", data),
            Self::Message(data) => format!("4{}", data),
            Self::Upgrade => "5".to_string(),
            Self::Noop => "6".to_string(),
        }
    }
}

impl SocketPacket {
    pub fn parse(data: &str) -> Result<Self, Error> {
        let mut chars = data.chars();
        let kind = chars.next().ok_or(Error::Empty)?;
        let rest = chars.as_str();

        // Packets on other namespaces start with `/nsp,`
        if rest.starts_with('/') {
            return Err(Error::Malformed(format!(
                "unsupported namespace in {:?}",
                data
            )));
        }

        let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
        let (id, body) = rest.split_at(digits);
        let id = if id.is_empty() {
            None
        } else {
            Some(
                id.parse::<u64>()
                    .map_err(|e| Error::Malformed(e.to_string()))?,
            )
        };

        let json = |body: &str| -> Result<Value, Error> {
            serde_json::from_str(body).map_err(|e| Error::Malformed(e.to_string()))
        };

        match kind {
            '0' => {
                if body.is_empty() {
                    Ok(Self::Connect(None))
                } else {
                    Ok(Self::Connect(Some(json(body)?)))
                }
            }
            '1' => Ok(Self::Disconnect),
            '2' => {
                let mut args = match json(body)? {
                    Value::Array(args) => args,
                    _ => return Err(Error::Malformed("event is not an array".to_string())),
                };

                if args.is_empty() {
                    return Err(Error::Malformed("event has no name".to_string()));
                }

                let name = match args.remove(0) {
                    Value::String(name) => name,
                    _ => return Err(Error::Malformed("event name is not a string".to_string())),
                };

                Ok(Self::Event { id, name, args })
            }
            '3' => {
                let id = id.ok_or_else(|| Error::Malformed("ack without id".to_string()))?;
                let args = match json(body)? {
                    Value::Array(args) => args,
                    _ => return Err(Error::Malformed("ack is not an array".to_string())),
                };

                Ok(Self::Ack { id, args })
            }
            '4' => Ok(Self::ConnectError(json(body)?)),
            c => Err(Error::UnknownType(c)),
        }
    }

    pub fn encode(&self) -> String {
        match self {
            Self::Connect(None) => "0".to_string(),
            Self::Connect(Some(data)) => format!("0{}", data),
            Self::Disconnect => "1".to_string(),
            Self::Event { id, name, args } => {
                let mut array = Vec::with_capacity(args.len() + 1);
                array.push(Value::String(name.clone()));
                array.extend(args.iter().cloned());

                match id {
                    Some(id) => format!("2{}{}", id, Value::Array(array)),
                    None => format!("2{}", Value::Array(array)),
                }
            }
            Self::Ack { id, args } => format!("3{}{}", id, Value::Array(args.clone())),
            Self::ConnectError(data) => format!("4{}", data),
        }
    }

    /// Wraps the packet into an Engine.IO message.
    pub fn to_engine(&self) -> EnginePacket {
        EnginePacket::Message(self.encode())
    }
}

/// Splits acknowledgement arguments into `(error, value)`.
///
/// The control plane acknowledges with a single `[err, value]` array
/// argument. Acknowledgements with the two values as separate arguments
/// are accepted as well.
pub fn split_ack(mut args: Vec<Value>) -> (Value, Value) {
    if args.len() == 1 {
        if let Value::Array(inner) = &mut args[0] {
            let mut inner = std::mem::take(inner).into_iter();
            let err = inner.next().unwrap_or(Value::Null);
            let value = inner.next().unwrap_or(Value::Null);
            return (err, value);
        }
    }

    let mut args = args.into_iter();
    let err = args.next().unwrap_or(Value::Null);
    let value = args.next().unwrap_or(Value::Null);
    (err, value)
}

/// Turns an acknowledgement into a result.
pub fn ack_result(event: &str, args: Vec<Value>) -> NodeResult<Value> {
    match split_ack(args) {
        (Value::Null, value) => Ok(value),
        (err, _) => Err(NodeError::ControlPlaneError {
            event: event.to_string(),
            error: describe_error(&err),
        }),
    }
}

/// Renders an error value sent by the control plane.
pub fn describe_error(err: &Value) -> String {
    match err {
        Value::String(s) => s.clone(),
        Value::Object(map) => map
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| err.to_string()),
        _ => err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    #[test]
    fn test_engine_packets() {
        let open = EnginePacket::parse(
            r#"0{"sid":"abc","upgrades":[],"pingInterval":25000,"pingTimeout":20000,"maxPayload":1000000}"#,
        )
        .unwrap();
        assert_eq!(
            EnginePacket::Open(OpenData {
                sid: "abc".to_string(),
                ping_interval: 25000,
                ping_timeout: 20000,
            }),
            open
        );

        assert_eq!(EnginePacket::Ping(String::new()), EnginePacket::parse("2").unwrap());
        assert_eq!("3", EnginePacket::Pong(String::new()).encode());
        assert_eq!(
            EnginePacket::Message("40".to_string()),
            EnginePacket::parse("440").unwrap()
        );

        assert_eq!(Err(Error::Empty), EnginePacket::parse(""));
        assert_eq!(Err(Error::UnknownType('9')), EnginePacket::parse("9"));
        assert!(matches!(
            EnginePacket::parse("0{"),
            Err(Error::Malformed(_))
        ));
    }

    #[test]
    fn test_socket_packets() {
        assert_eq!(
            SocketPacket::Connect(Some(json!({ "sid": "x" }))),
            SocketPacket::parse(r#"0{"sid":"x"}"#).unwrap()
        );

        assert_eq!(
            SocketPacket::Event {
                id: Some(12),
                name: "enable".to_string(),
                args: vec![json!({ "port": 4000 })],
            },
            SocketPacket::parse(r#"212["enable",{"port":4000}]"#).unwrap()
        );

        assert_eq!(
            SocketPacket::Event {
                id: None,
                name: "message".to_string(),
                args: vec![json!("hello")],
            },
            SocketPacket::parse(r#"2["message","hello"]"#).unwrap()
        );

        assert_eq!(
            SocketPacket::Ack {
                id: 3,
                args: vec![json!([null, true])],
            },
            SocketPacket::parse("33[[null,true]]").unwrap()
        );

        assert!(SocketPacket::parse("3[null]").is_err());
        assert!(SocketPacket::parse("2[]").is_err());
        assert!(SocketPacket::parse("2[1]").is_err());
        assert!(SocketPacket::parse(r#"2/admin,["x"]"#).is_err());
    }

    #[test]
    fn test_encode_event() {
        let packet = SocketPacket::Event {
            id: Some(7),
            name: "keep-alive".to_string(),
            args: vec![json!({ "hits": 1 })],
        };
        assert_eq!(r#"427["keep-alive",{"hits":1}]"#, packet.to_engine().encode());

        let packet = SocketPacket::Event {
            id: Some(0),
            name: "disable".to_string(),
            args: vec![],
        };
        assert_eq!(r#"420["disable"]"#, packet.to_engine().encode());

        let packet = SocketPacket::Connect(Some(json!({ "token": "t" })));
        assert_eq!(r#"40{"token":"t"}"#, packet.to_engine().encode());
    }

    #[test]
    fn test_split_ack() {
        assert_eq!(
            (Value::Null, json!(true)),
            split_ack(vec![json!([null, true])])
        );
        assert_eq!(
            (json!("nope"), Value::Null),
            split_ack(vec![json!("nope")])
        );
        assert_eq!(
            (Value::Null, json!("2024-01-01T00:00:00Z")),
            split_ack(vec![Value::Null, json!("2024-01-01T00:00:00Z")])
        );
        assert_eq!((Value::Null, Value::Null), split_ack(vec![]));
    }

    #[test]
    fn test_ack_result() {
        assert_eq!(json!(true), ack_result("enable", vec![json!([null, true])]).unwrap());

        match ack_result("enable", vec![json!([{ "message": "port unreachable" }])]) {
            Err(NodeError::ControlPlaneError { event, error }) => {
                assert_eq!("enable", event);
                assert_eq!("port unreachable", error);
            }
            other => panic!("unexpected result {:?}", other),
        }
    }
}
