//! Wire records and messages for the bus.
//!
//! # Wire format
//!
//! All integers are big-endian regardless of host order.
//!
//! ```text
//! Handshake (8 bytes)        Header (20 bytes)
//! ┌────────┬─────────┐       ┌──────┬─────┬─────┬────────────┬───────────┐
//! │ magic  │ version │       │ type │ src │ dst │ attributes │ body size │
//! │  u32   │   u32   │       │ u32  │ u32 │ u32 │    u32     │    u32    │
//! └────────┴─────────┘       └──────┴─────┴─────┴────────────┴───────────┘
//! ```
//!
//! A header is followed by `body size` bytes: a JSON object holding the
//! message properties. An empty property set is sent as a zero-length body.

use std::fmt;

use serde_json::{Map, Value};

use crate::{
    constants::{HANDSHAKE_SIZE, HEADER_SIZE},
    error::{NetError, Result},
};

/// Message body: named properties.
pub type Properties = Map<String, Value>;

/// Connect-response status code; `0` is success.
pub const PROPERTY_STATUS: &str = "status";
/// Encoded password in a connect request.
pub const PROPERTY_PASSWORD: &str = "password";
/// Whether the server requires a password (server info).
pub const PROPERTY_HAS_PASSWORD: &str = "has_password";
/// Server capacity (server info).
pub const PROPERTY_MAX_CLIENTS: &str = "max_clients";
/// Currently connected clients (server info).
pub const PROPERTY_NUM_CLIENTS: &str = "num_clients";

/// Participant address on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId(pub u32);

impl EntityId {
    /// Unassigned.
    pub const INVALID: Self = Self(0);
    /// The server.
    pub const SERVER: Self = Self(1);
    /// Broadcast. Only valid as a destination.
    pub const EVERYONE: Self = Self(2);
    /// First ID handed to a client.
    pub const FIRST_CLIENT: Self = Self(3);

    /// Whether this ID can belong to a client.
    pub fn is_client(self) -> bool {
        self >= Self::FIRST_CLIENT
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::INVALID => write!(f, "invalid"),
            Self::SERVER => write!(f, "server"),
            Self::EVERYONE => write!(f, "everyone"),
            Self(id) => write!(f, "{id}"),
        }
    }
}

/// Message type tag. Values from [`MessageType::FIRST_USER`] belong to
/// applications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageType(pub u32);

impl MessageType {
    /// Never sent.
    pub const INVALID: Self = Self(0);
    /// Server → client, right after the handshake.
    pub const SERVER_INFO: Self = Self(1);
    /// Client → server, asks to join.
    pub const CONNECT_REQUEST: Self = Self(2);
    /// Server → client, carries `status` and the assigned ID as `dst`.
    pub const CONNECT_RESPONSE: Self = Self(3);
    /// Either direction, the sender is leaving.
    pub const DISCONNECTED: Self = Self(4);
    /// First application-defined type.
    pub const FIRST_USER: Self = Self(1000);
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::INVALID => write!(f, "Invalid"),
            Self::SERVER_INFO => write!(f, "ServerInfo"),
            Self::CONNECT_REQUEST => write!(f, "ConnectRequest"),
            Self::CONNECT_RESPONSE => write!(f, "ConnectResponse"),
            Self::DISCONNECTED => write!(f, "Disconnected"),
            Self(id) => write!(f, "User({id})"),
        }
    }
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[at..at + 4]);
    u32::from_be_bytes(raw)
}

/// Protocol identity exchanged before any message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handshake {
    /// Protocol identifier.
    pub magic: u32,
    /// Protocol version.
    pub version: u32,
}

impl Handshake {
    /// Wire form.
    pub fn encode(&self) -> [u8; HANDSHAKE_SIZE] {
        let mut out = [0u8; HANDSHAKE_SIZE];
        out[..4].copy_from_slice(&self.magic.to_be_bytes());
        out[4..].copy_from_slice(&self.version.to_be_bytes());
        out
    }

    /// Parse the wire form. `Malformed` unless exactly 8 bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != HANDSHAKE_SIZE {
            return Err(NetError::Malformed);
        }
        Ok(Self {
            magic: read_u32(bytes, 0),
            version: read_u32(bytes, 4),
        })
    }
}

/// Fixed-size message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    /// Message type.
    pub msg_type: MessageType,
    /// Sender.
    pub src: EntityId,
    /// Recipient, [`EntityId::EVERYONE`] or [`EntityId::SERVER`].
    pub dst: EntityId,
    /// Reserved flags.
    pub attributes: u32,
    /// Length of the body that follows.
    pub body_size: u32,
}

impl MessageHeader {
    /// Wire form.
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let fields = [
            self.msg_type.0,
            self.src.0,
            self.dst.0,
            self.attributes,
            self.body_size,
        ];
        let mut out = [0u8; HEADER_SIZE];
        for (slot, field) in out.chunks_exact_mut(4).zip(fields) {
            slot.copy_from_slice(&field.to_be_bytes());
        }
        out
    }

    /// Parse the wire form. `Malformed` unless exactly 20 bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != HEADER_SIZE {
            return Err(NetError::Malformed);
        }
        Ok(Self {
            msg_type: MessageType(read_u32(bytes, 0)),
            src: EntityId(read_u32(bytes, 4)),
            dst: EntityId(read_u32(bytes, 8)),
            attributes: read_u32(bytes, 12),
            body_size: read_u32(bytes, 16),
        })
    }
}

/// A message: addressing plus a property body.
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkMessage {
    msg_type: MessageType,
    src: EntityId,
    dst: EntityId,
    attributes: u32,
    properties: Properties,
}

impl NetworkMessage {
    /// Create an empty message.
    pub fn new(msg_type: MessageType, src: EntityId, dst: EntityId) -> Self {
        Self {
            msg_type,
            src,
            dst,
            attributes: 0,
            properties: Properties::new(),
        }
    }

    /// Rebuild a message from a decoded header and its body bytes.
    pub fn from_parts(header: &MessageHeader, body: &[u8]) -> Result<Self> {
        let properties = if body.is_empty() {
            Properties::new()
        } else {
            match serde_json::from_slice::<Value>(body) {
                Ok(Value::Object(map)) => map,
                Ok(_) | Err(_) => return Err(NetError::Malformed),
            }
        };
        Ok(Self {
            msg_type: header.msg_type,
            src: header.src,
            dst: header.dst,
            attributes: header.attributes,
            properties,
        })
    }

    /// Header followed by body, ready to write.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let body = if self.properties.is_empty() {
            Vec::new()
        } else {
            serde_json::to_vec(&self.properties).map_err(|_| NetError::Internal)?
        };
        let body_size = u32::try_from(body.len()).map_err(|_| NetError::Malformed)?;
        let header = MessageHeader {
            msg_type: self.msg_type,
            src: self.src,
            dst: self.dst,
            attributes: self.attributes,
            body_size,
        };
        let mut out = Vec::with_capacity(HEADER_SIZE + body.len());
        out.extend_from_slice(&header.encode());
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Message type.
    pub fn msg_type(&self) -> MessageType {
        self.msg_type
    }

    /// Sender.
    pub fn src(&self) -> EntityId {
        self.src
    }

    /// Recipient.
    pub fn dst(&self) -> EntityId {
        self.dst
    }

    /// Readdress the message.
    pub fn set_dst(&mut self, dst: EntityId) {
        self.dst = dst;
    }

    /// Reserved flags.
    pub fn attributes(&self) -> u32 {
        self.attributes
    }

    /// Replace the reserved flags.
    pub fn set_attributes(&mut self, attributes: u32) {
        self.attributes = attributes;
    }

    /// Body properties.
    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    /// Mutable body properties.
    pub fn properties_mut(&mut self) -> &mut Properties {
        &mut self.properties
    }

    /// Set one property.
    pub fn set_value(&mut self, key: &str, value: impl Into<Value>) {
        self.properties.insert(key.to_string(), value.into());
    }

    /// Look up one property.
    pub fn value(&self, key: &str) -> Option<&Value> {
        self.properties.get(key)
    }

    /// Integer property, if present and in range.
    pub fn value_i32(&self, key: &str) -> Option<i32> {
        self.value(key)?.as_i64().and_then(|v| i32::try_from(v).ok())
    }

    /// String property.
    pub fn value_str(&self, key: &str) -> Option<&str> {
        self.value(key)?.as_str()
    }

    /// Boolean property.
    pub fn value_bool(&self, key: &str) -> Option<bool> {
        self.value(key)?.as_bool()
    }
}

impl fmt::Display for NetworkMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} -> {} attrs={:#x} {}",
            self.msg_type,
            self.src,
            self.dst,
            self.attributes,
            Value::Object(self.properties.clone())
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_is_big_endian() {
        let handshake = Handshake {
            magic: 0x0102_0304,
            version: 7,
        };
        assert_eq!(handshake.encode(), [1, 2, 3, 4, 0, 0, 0, 7]);

        // Decoding ignores host byte order.
        let decoded = Handshake::decode(&[1, 2, 3, 4, 0, 0, 0, 7]).unwrap();
        assert_eq!(decoded, handshake);
    }

    #[test]
    fn test_short_records_are_malformed() {
        assert_eq!(Handshake::decode(&[0; 7]), Err(NetError::Malformed));
        assert_eq!(MessageHeader::decode(&[0; 19]), Err(NetError::Malformed));
    }

    #[test]
    fn test_header_layout() {
        let header = MessageHeader {
            msg_type: MessageType(0x10),
            src: EntityId(3),
            dst: EntityId::EVERYONE,
            attributes: 0xA0B0_C0D0,
            body_size: 258,
        };
        let bytes = header.encode();
        assert_eq!(&bytes[..4], &[0, 0, 0, 0x10]);
        assert_eq!(&bytes[12..16], &[0xA0, 0xB0, 0xC0, 0xD0]);
        assert_eq!(&bytes[16..], &[0, 0, 1, 2]);
        assert_eq!(MessageHeader::decode(&bytes), Ok(header));
    }

    #[test]
    fn test_empty_body_has_zero_size() {
        let message = NetworkMessage::new(MessageType::DISCONNECTED, EntityId(4), EntityId::SERVER);
        let bytes = message.encode().unwrap();
        assert_eq!(bytes.len(), HEADER_SIZE);
        assert_eq!(&bytes[16..20], &[0, 0, 0, 0]);
    }

    #[test]
    fn test_message_with_properties() {
        let mut message = NetworkMessage::new(MessageType::FIRST_USER, EntityId(5), EntityId(6));
        message.set_value(PROPERTY_STATUS, 4);
        message.set_value("text", "hi");

        let bytes = message.encode().unwrap();
        let header = MessageHeader::decode(&bytes[..HEADER_SIZE]).unwrap();
        assert_eq!(header.body_size as usize, bytes.len() - HEADER_SIZE);

        let decoded = NetworkMessage::from_parts(&header, &bytes[HEADER_SIZE..]).unwrap();
        assert_eq!(decoded, message);
        assert_eq!(decoded.value_i32(PROPERTY_STATUS), Some(4));
        assert_eq!(decoded.value_str("text"), Some("hi"));
        assert_eq!(decoded.value_bool("text"), None);
    }

    #[test]
    fn test_non_object_body_is_malformed() {
        let header = MessageHeader {
            msg_type: MessageType::FIRST_USER,
            src: EntityId(3),
            dst: EntityId(4),
            attributes: 0,
            body_size: 5,
        };
        assert_eq!(
            NetworkMessage::from_parts(&header, b"[1,2]"),
            Err(NetError::Malformed)
        );
        assert_eq!(
            NetworkMessage::from_parts(&header, b"{oops"),
            Err(NetError::Malformed)
        );
    }

    #[test]
    fn test_display_names_reserved_ids() {
        let message = NetworkMessage::new(MessageType::CONNECT_REQUEST, EntityId::INVALID, EntityId::SERVER);
        assert_eq!(message.to_string(), "ConnectRequest invalid -> server attrs=0x0 {}");
        assert!(EntityId(3).is_client());
        assert!(!EntityId::EVERYONE.is_client());
    }
}
