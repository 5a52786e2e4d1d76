//! VICI packet and message encoding.
//!
//! A packet on the wire is a big-endian `u32` length followed by a one byte
//! packet type, an optional length-prefixed name and a message. A message is
//! a flat stream of elements (section start/end, key/value, list start, list
//! item, list end) that nest into sections.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::ViciError;

/// Largest packet charon accepts or sends.
pub const MAX_PACKET_LEN: usize = 512 * 1024;

const SECTION_START: u8 = 1;
const SECTION_END: u8 = 2;
const KEY_VALUE: u8 = 3;
const LIST_START: u8 = 4;
const LIST_ITEM: u8 = 5;
const LIST_END: u8 = 6;

const CMD_REQUEST: u8 = 0;
const CMD_RESPONSE: u8 = 1;
const CMD_UNKNOWN: u8 = 2;
const EVENT_REGISTER: u8 = 3;
const EVENT_UNREGISTER: u8 = 4;
const EVENT_CONFIRM: u8 = 5;
const EVENT_UNKNOWN: u8 = 6;
const EVENT: u8 = 7;

/// A value held under a message key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Element {
    /// A single value.
    Value(String),
    /// An ordered list of values.
    List(Vec<String>),
    /// A nested section.
    Section(Message),
}

/// An ordered VICI message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    items: Vec<(String, Element)>,
}

impl Message {
    /// Creates an empty message.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a key/value pair.
    #[must_use]
    pub fn with_value(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.items.push((key.into(), Element::Value(value.into())));
        self
    }

    /// Adds a list.
    #[must_use]
    pub fn with_list<I, S>(mut self, key: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let values = values.into_iter().map(Into::into).collect();
        self.items.push((key.into(), Element::List(values)));
        self
    }

    /// Adds a nested section.
    #[must_use]
    pub fn with_section(mut self, key: impl Into<String>, section: Message) -> Self {
        self.items.push((key.into(), Element::Section(section)));
        self
    }

    /// Looks up an element by key.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Element> {
        self.items.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Looks up a single value by key.
    #[must_use]
    pub fn value(&self, key: &str) -> Option<&str> {
        match self.get(key) {
            Some(Element::Value(v)) => Some(v.as_str()),
            _ => None,
        }
    }

    /// Looks up a list by key.
    #[must_use]
    pub fn list(&self, key: &str) -> Option<&[String]> {
        match self.get(key) {
            Some(Element::List(v)) => Some(v.as_slice()),
            _ => None,
        }
    }

    /// Looks up a nested section by key.
    #[must_use]
    pub fn section(&self, key: &str) -> Option<&Message> {
        match self.get(key) {
            Some(Element::Section(m)) => Some(m),
            _ => None,
        }
    }

    /// Iterates over top-level keys in order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.items.iter().map(|(k, _)| k.as_str())
    }

    /// Whether the message has no elements.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Appends the encoded elements to `buf`.
    ///
    /// # Errors
    ///
    /// Returns an error if a name exceeds 255 bytes or a value 65535 bytes.
    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), ViciError> {
        for (key, element) in &self.items {
            match element {
                Element::Value(value) => {
                    buf.put_u8(KEY_VALUE);
                    put_name(buf, key)?;
                    put_value(buf, key, value)?;
                }
                Element::List(values) => {
                    buf.put_u8(LIST_START);
                    put_name(buf, key)?;
                    for value in values {
                        buf.put_u8(LIST_ITEM);
                        put_value(buf, key, value)?;
                    }
                    buf.put_u8(LIST_END);
                }
                Element::Section(section) => {
                    buf.put_u8(SECTION_START);
                    put_name(buf, key)?;
                    section.encode(buf)?;
                    buf.put_u8(SECTION_END);
                }
            }
        }
        Ok(())
    }

    /// Decodes a complete message.
    ///
    /// # Errors
    ///
    /// Returns an error on unknown element types, truncated input, or
    /// unbalanced sections and lists.
    pub fn decode(mut buf: &[u8]) -> Result<Self, ViciError> {
        let mut parents: Vec<(String, Message)> = Vec::new();
        let mut current = Message::new();
        let mut list: Option<(String, Vec<String>)> = None;

        while buf.has_remaining() {
            let kind = buf.get_u8();
            if list.is_some() && kind != LIST_ITEM && kind != LIST_END {
                return Err(ViciError::Malformed(format!(
                    "element type {kind} inside a list"
                )));
            }
            match kind {
                SECTION_START => {
                    let name = take_name(&mut buf)?;
                    parents.push((name, std::mem::take(&mut current)));
                }
                SECTION_END => {
                    let (name, mut parent) = parents
                        .pop()
                        .ok_or_else(|| ViciError::Malformed("unbalanced section end".into()))?;
                    parent.items.push((name, Element::Section(current)));
                    current = parent;
                }
                KEY_VALUE => {
                    let name = take_name(&mut buf)?;
                    let value = take_value(&mut buf)?;
                    current.items.push((name, Element::Value(value)));
                }
                LIST_START => {
                    let name = take_name(&mut buf)?;
                    list = Some((name, Vec::new()));
                }
                LIST_ITEM => {
                    let value = take_value(&mut buf)?;
                    match list.as_mut() {
                        Some((_, values)) => values.push(value),
                        None => return Err(ViciError::Malformed("list item outside a list".into())),
                    }
                }
                LIST_END => {
                    let (name, values) = list
                        .take()
                        .ok_or_else(|| ViciError::Malformed("unbalanced list end".into()))?;
                    current.items.push((name, Element::List(values)));
                }
                other => {
                    return Err(ViciError::Malformed(format!("unknown element type {other}")));
                }
            }
        }

        if !parents.is_empty() || list.is_some() {
            return Err(ViciError::Malformed("unterminated section or list".into()));
        }
        Ok(current)
    }
}

/// A framed VICI packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// Named command request.
    CmdRequest {
        /// Command name.
        name: String,
        /// Arguments.
        message: Message,
    },
    /// Response to the last command.
    CmdResponse(Message),
    /// The last command is not supported.
    CmdUnknown,
    /// Subscribe to a named event.
    EventRegister(String),
    /// Unsubscribe from a named event.
    EventUnregister(String),
    /// Subscription change acknowledged.
    EventConfirm,
    /// The event name is not supported.
    EventUnknown,
    /// A streamed event.
    Event {
        /// Event name.
        name: String,
        /// Event payload.
        message: Message,
    },
}

impl Packet {
    /// Short name of the packet type for diagnostics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CmdRequest { .. } => "CMD_REQUEST",
            Self::CmdResponse(_) => "CMD_RESPONSE",
            Self::CmdUnknown => "CMD_UNKNOWN",
            Self::EventRegister(_) => "EVENT_REGISTER",
            Self::EventUnregister(_) => "EVENT_UNREGISTER",
            Self::EventConfirm => "EVENT_CONFIRM",
            Self::EventUnknown => "EVENT_UNKNOWN",
            Self::Event { .. } => "EVENT",
        }
    }

    /// Encodes the packet including its length prefix.
    ///
    /// # Errors
    ///
    /// Returns an error if an element is too long or the packet exceeds
    /// [`MAX_PACKET_LEN`].
    pub fn encode(&self) -> Result<Bytes, ViciError> {
        let mut body = BytesMut::new();
        match self {
            Self::CmdRequest { name, message } => {
                body.put_u8(CMD_REQUEST);
                put_name(&mut body, name)?;
                message.encode(&mut body)?;
            }
            Self::CmdResponse(message) => {
                body.put_u8(CMD_RESPONSE);
                message.encode(&mut body)?;
            }
            Self::CmdUnknown => body.put_u8(CMD_UNKNOWN),
            Self::EventRegister(name) => {
                body.put_u8(EVENT_REGISTER);
                put_name(&mut body, name)?;
            }
            Self::EventUnregister(name) => {
                body.put_u8(EVENT_UNREGISTER);
                put_name(&mut body, name)?;
            }
            Self::EventConfirm => body.put_u8(EVENT_CONFIRM),
            Self::EventUnknown => body.put_u8(EVENT_UNKNOWN),
            Self::Event { name, message } => {
                body.put_u8(EVENT);
                put_name(&mut body, name)?;
                message.encode(&mut body)?;
            }
        }

        if body.len() > MAX_PACKET_LEN {
            return Err(ViciError::PacketTooLarge(body.len()));
        }

        let mut framed = BytesMut::with_capacity(4 + body.len());
        framed.put_u32(body.len() as u32);
        framed.extend_from_slice(&body);
        Ok(framed.freeze())
    }

    /// Decodes a packet body (without the length prefix).
    ///
    /// # Errors
    ///
    /// Returns an error if the body is empty, has an unknown type or carries
    /// a malformed message.
    pub fn decode(mut body: &[u8]) -> Result<Self, ViciError> {
        if !body.has_remaining() {
            return Err(ViciError::Malformed("empty packet".into()));
        }
        let packet = match body.get_u8() {
            CMD_REQUEST => {
                let name = take_name(&mut body)?;
                Self::CmdRequest {
                    name,
                    message: Message::decode(body)?,
                }
            }
            CMD_RESPONSE => Self::CmdResponse(Message::decode(body)?),
            CMD_UNKNOWN => Self::CmdUnknown,
            EVENT_REGISTER => Self::EventRegister(take_name(&mut body)?),
            EVENT_UNREGISTER => Self::EventUnregister(take_name(&mut body)?),
            EVENT_CONFIRM => Self::EventConfirm,
            EVENT_UNKNOWN => Self::EventUnknown,
            EVENT => {
                let name = take_name(&mut body)?;
                Self::Event {
                    name,
                    message: Message::decode(body)?,
                }
            }
            other => return Err(ViciError::Malformed(format!("unknown packet type {other}"))),
        };
        Ok(packet)
    }
}

fn put_name(buf: &mut BytesMut, name: &str) -> Result<(), ViciError> {
    let len = u8::try_from(name.len()).map_err(|_| ViciError::ElementTooLong {
        name: name.to_string(),
        len: name.len(),
    })?;
    buf.put_u8(len);
    buf.put_slice(name.as_bytes());
    Ok(())
}

fn put_value(buf: &mut BytesMut, name: &str, value: &str) -> Result<(), ViciError> {
    let len = u16::try_from(value.len()).map_err(|_| ViciError::ElementTooLong {
        name: name.to_string(),
        len: value.len(),
    })?;
    buf.put_u16(len);
    buf.put_slice(value.as_bytes());
    Ok(())
}

fn take_name(buf: &mut &[u8]) -> Result<String, ViciError> {
    if !buf.has_remaining() {
        return Err(ViciError::Malformed("missing name length".into()));
    }
    let len = usize::from(buf.get_u8());
    take_bytes(buf, len)
}

fn take_value(buf: &mut &[u8]) -> Result<String, ViciError> {
    if buf.remaining() < 2 {
        return Err(ViciError::Malformed("missing value length".into()));
    }
    let len = usize::from(buf.get_u16());
    take_bytes(buf, len)
}

fn take_bytes(buf: &mut &[u8], len: usize) -> Result<String, ViciError> {
    if buf.remaining() < len {
        return Err(ViciError::Malformed(format!(
            "truncated element: need {len} bytes, have {}",
            buf.remaining()
        )));
    }
    let (head, rest) = buf.split_at(len);
    *buf = rest;
    Ok(String::from_utf8_lossy(head).into_owned())
}
