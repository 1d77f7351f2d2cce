//! Turbine Binary Codec
//!
//! Compact binary encoding for router control messages. Every message starts
//! with a one-byte type code followed by fixed-order fields:
//! - strings and names: u16 length + UTF-8 bytes
//! - lists: u16 count + items
//! - payloads: u32 length + raw bytes
//! - integers big-endian, costs as f64

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::cost::Cost;
use crate::identity::{ServerIdentity, ServerName};
use crate::message::*;
use crate::path::Path;
use crate::shortcut::{Activity, Shortcut};
use crate::{Error, Result};

/// Message type codes
pub mod msg {
    pub const HELLO: u8 = 0x01;
    pub const WELCOME: u8 = 0x02;
    pub const ROUTE: u8 = 0x10;
    pub const REVERSE_ROUTE: u8 = 0x11;
    pub const REPLY: u8 = 0x12;
    pub const PEER_UPDATE: u8 = 0x20;
    pub const DESCENDANTS: u8 = 0x21;
    pub const PING: u8 = 0x41;
    pub const PONG: u8 = 0x42;
}

/// Reply kind codes
pub mod reply {
    pub const DELIVERED: u8 = 0x00;
    pub const ACCEPTED: u8 = 0x01;
    pub const UNREACHABLE: u8 = 0x02;
    pub const REFUSED: u8 = 0x03;
    pub const TIMED_OUT: u8 = 0x04;
    pub const INTERRUPTED: u8 = 0x05;
}

mod role {
    pub const CHILD: u8 = 0;
    pub const PARENT: u8 = 1;
    pub const PEER: u8 = 2;
}

// ============================================================================
// PUBLIC API
// ============================================================================

/// Encode a message to binary format
pub fn encode(message: &Message) -> Result<Bytes> {
    let mut buf = BytesMut::with_capacity(estimate_message_size(message));
    encode_message_to_buf(&mut buf, message)?;
    Ok(buf.freeze())
}

/// Decode a message from binary format
pub fn decode(bytes: &[u8]) -> Result<Message> {
    if bytes.is_empty() {
        return Err(Error::BufferTooSmall { needed: 1, have: 0 });
    }

    let mut buf = bytes;
    let msg_type = buf.get_u8();

    let message = match msg_type {
        msg::HELLO => decode_hello(&mut buf)?,
        msg::WELCOME => decode_welcome(&mut buf)?,
        msg::ROUTE => decode_route(&mut buf)?,
        msg::REVERSE_ROUTE => decode_reverse_route(&mut buf)?,
        msg::REPLY => decode_reply(&mut buf)?,
        msg::PEER_UPDATE => decode_peer_update(&mut buf)?,
        msg::DESCENDANTS => Message::Descendants(Descendants {
            server: decode_name(&mut buf)?,
            descendants: decode_names(&mut buf)?,
        }),
        msg::PING => Message::Ping {
            id: decode_u64(&mut buf)?,
        },
        msg::PONG => Message::Pong {
            id: decode_u64(&mut buf)?,
        },
        _ => return Err(Error::UnknownMessageType(msg_type)),
    };

    if buf.has_remaining() {
        return Err(Error::DecodeError(format!(
            "{} trailing bytes after {}",
            buf.remaining(),
            message.type_name()
        )));
    }

    Ok(message)
}

fn estimate_message_size(message: &Message) -> usize {
    match message {
        Message::Route { message, .. } => 64 + message.payload.len(),
        Message::Reply {
            reply: Reply::Delivered(payload),
            ..
        } => 16 + payload.len(),
        Message::Ping { .. } | Message::Pong { .. } => 9,
        _ => 128,
    }
}

// ============================================================================
// ENCODING
// ============================================================================

fn encode_message_to_buf(buf: &mut BytesMut, message: &Message) -> Result<()> {
    match message {
        Message::Hello(hello) => {
            buf.put_u8(msg::HELLO);
            encode_identity(buf, &hello.identity)?;
            buf.put_u8(role_code(hello.role));
            buf.put_u8(hello.reverse as u8);
            encode_names(buf, &hello.descendants)?;
        }
        Message::Welcome(welcome) => {
            buf.put_u8(msg::WELCOME);
            encode_identity(buf, &welcome.identity)?;
            encode_names(buf, &welcome.descendants)?;
        }
        Message::Route { id, message } => {
            buf.put_u8(msg::ROUTE);
            buf.put_u64(*id);
            encode_routed(buf, message)?;
        }
        Message::ReverseRoute { id, request } => {
            buf.put_u8(msg::REVERSE_ROUTE);
            buf.put_u64(*id);
            encode_identity(buf, &request.requester)?;
            buf.put_u8(role_code(request.role));
            encode_names(buf, &request.descendants)?;
            match &request.shortcut {
                Some(shortcut) => {
                    buf.put_u8(1);
                    encode_shortcut(buf, shortcut)?;
                }
                None => buf.put_u8(0),
            }
        }
        Message::Reply { id, reply } => {
            buf.put_u8(msg::REPLY);
            buf.put_u64(*id);
            encode_reply(buf, reply)?;
        }
        Message::PeerUpdate(update) => {
            buf.put_u8(msg::PEER_UPDATE);
            encode_identity(buf, &update.peer)?;
            buf.put_u64(update.counter);
            encode_count(buf, update.shortcuts.len())?;
            for shortcut in &update.shortcuts {
                encode_shortcut(buf, shortcut)?;
            }
            encode_names(buf, &update.descendants)?;
        }
        Message::Descendants(update) => {
            buf.put_u8(msg::DESCENDANTS);
            encode_name(buf, &update.server)?;
            encode_names(buf, &update.descendants)?;
        }
        Message::Ping { id } => {
            buf.put_u8(msg::PING);
            buf.put_u64(*id);
        }
        Message::Pong { id } => {
            buf.put_u8(msg::PONG);
            buf.put_u64(*id);
        }
    }
    Ok(())
}

fn encode_routed(buf: &mut BytesMut, message: &RoutedMessage) -> Result<()> {
    encode_name(buf, &message.source)?;
    encode_name(buf, &message.destination)?;
    match &message.path {
        Some(path) => {
            buf.put_u8(1);
            encode_names(buf, path.hops())?;
        }
        None => buf.put_u8(0),
    }
    buf.put_u32(message.at_index);
    encode_payload(buf, &message.payload)
}

fn encode_reply(buf: &mut BytesMut, value: &Reply) -> Result<()> {
    match value {
        Reply::Delivered(payload) => {
            buf.put_u8(reply::DELIVERED);
            encode_payload(buf, payload)?;
        }
        Reply::Accepted => buf.put_u8(reply::ACCEPTED),
        Reply::Unreachable {
            destination,
            last_hop,
        } => {
            buf.put_u8(reply::UNREACHABLE);
            encode_name(buf, destination)?;
            encode_name(buf, last_hop)?;
        }
        Reply::Refused(reason) => {
            buf.put_u8(reply::REFUSED);
            encode_string(buf, reason)?;
        }
        Reply::TimedOut => buf.put_u8(reply::TIMED_OUT),
        Reply::Interrupted => buf.put_u8(reply::INTERRUPTED),
    }
    Ok(())
}

fn encode_shortcut(buf: &mut BytesMut, shortcut: &Shortcut) -> Result<()> {
    encode_name(buf, &shortcut.destination)?;
    encode_string(buf, &shortcut.address)?;
    buf.put_f64(shortcut.cost.value());
    buf.put_u8(match shortcut.activity {
        Activity::Active => 1,
        Activity::Passive => 0,
    });
    Ok(())
}

fn encode_identity(buf: &mut BytesMut, identity: &ServerIdentity) -> Result<()> {
    encode_name(buf, &identity.name)?;
    encode_string(buf, &identity.address)
}

fn encode_names(buf: &mut BytesMut, names: &[ServerName]) -> Result<()> {
    encode_count(buf, names.len())?;
    for name in names {
        encode_name(buf, name)?;
    }
    Ok(())
}

#[inline(always)]
fn encode_name(buf: &mut BytesMut, name: &ServerName) -> Result<()> {
    encode_string(buf, name.as_str())
}

#[inline(always)]
fn encode_count(buf: &mut BytesMut, count: usize) -> Result<()> {
    if count > u16::MAX as usize {
        return Err(Error::EncodeError(format!("too many items: {}", count)));
    }
    buf.put_u16(count as u16);
    Ok(())
}

#[inline(always)]
fn encode_string(buf: &mut BytesMut, s: &str) -> Result<()> {
    let bytes = s.as_bytes();
    if bytes.len() > u16::MAX as usize {
        return Err(Error::PayloadTooLarge(bytes.len()));
    }
    buf.put_u16(bytes.len() as u16);
    buf.extend_from_slice(bytes);
    Ok(())
}

#[inline(always)]
fn encode_payload(buf: &mut BytesMut, payload: &Bytes) -> Result<()> {
    if payload.len() > u32::MAX as usize {
        return Err(Error::PayloadTooLarge(payload.len()));
    }
    buf.put_u32(payload.len() as u32);
    buf.extend_from_slice(payload);
    Ok(())
}

fn role_code(value: Role) -> u8 {
    match value {
        Role::Child => role::CHILD,
        Role::Parent => role::PARENT,
        Role::Peer => role::PEER,
    }
}

// ============================================================================
// DECODING
// ============================================================================

fn decode_hello(buf: &mut &[u8]) -> Result<Message> {
    let identity = decode_identity(buf)?;
    let role = decode_role(buf)?;
    let reverse = decode_u8(buf)? != 0;
    let descendants = decode_names(buf)?;

    Ok(Message::Hello(Hello {
        identity,
        role,
        reverse,
        descendants,
    }))
}

fn decode_welcome(buf: &mut &[u8]) -> Result<Message> {
    let identity = decode_identity(buf)?;
    let descendants = decode_names(buf)?;
    Ok(Message::Welcome(Welcome {
        identity,
        descendants,
    }))
}

fn decode_route(buf: &mut &[u8]) -> Result<Message> {
    let id = decode_u64(buf)?;
    let source = decode_name(buf)?;
    let destination = decode_name(buf)?;
    let path = match decode_u8(buf)? {
        0 => None,
        _ => Some(Path::new(decode_names(buf)?)?),
    };
    let at_index = decode_u32(buf)?;
    let payload = decode_payload(buf)?;

    Ok(Message::Route {
        id,
        message: RoutedMessage {
            source,
            destination,
            path,
            at_index,
            payload,
        },
    })
}

fn decode_reverse_route(buf: &mut &[u8]) -> Result<Message> {
    let id = decode_u64(buf)?;
    let requester = decode_identity(buf)?;
    let role = decode_role(buf)?;
    let descendants = decode_names(buf)?;
    let shortcut = match decode_u8(buf)? {
        0 => None,
        _ => Some(decode_shortcut(buf)?),
    };

    Ok(Message::ReverseRoute {
        id,
        request: ReverseRouteRequest {
            requester,
            role,
            descendants,
            shortcut,
        },
    })
}

fn decode_reply(buf: &mut &[u8]) -> Result<Message> {
    let id = decode_u64(buf)?;
    let kind = decode_u8(buf)?;
    let value = match kind {
        reply::DELIVERED => Reply::Delivered(decode_payload(buf)?),
        reply::ACCEPTED => Reply::Accepted,
        reply::UNREACHABLE => Reply::Unreachable {
            destination: decode_name(buf)?,
            last_hop: decode_name(buf)?,
        },
        reply::REFUSED => Reply::Refused(decode_string(buf)?),
        reply::TIMED_OUT => Reply::TimedOut,
        reply::INTERRUPTED => Reply::Interrupted,
        other => {
            return Err(Error::DecodeError(format!("unknown reply kind: {}", other)));
        }
    };
    Ok(Message::Reply { id, reply: value })
}

fn decode_peer_update(buf: &mut &[u8]) -> Result<Message> {
    let peer = decode_identity(buf)?;
    let counter = decode_u64(buf)?;
    let count = decode_u16(buf)? as usize;
    let mut shortcuts = Vec::with_capacity(count);
    for _ in 0..count {
        shortcuts.push(decode_shortcut(buf)?);
    }
    let descendants = decode_names(buf)?;

    Ok(Message::PeerUpdate(PeerUpdate {
        peer,
        counter,
        shortcuts,
        descendants,
    }))
}

fn decode_shortcut(buf: &mut &[u8]) -> Result<Shortcut> {
    let destination = decode_name(buf)?;
    let address = decode_string(buf)?;
    ensure(buf, 9)?;
    let cost = Cost::new(buf.get_f64());
    let activity = match buf.get_u8() {
        0 => Activity::Passive,
        _ => Activity::Active,
    };
    let shortcut = Shortcut {
        destination,
        address,
        cost,
        activity,
    };
    shortcut.validate()?;
    Ok(shortcut)
}

fn decode_identity(buf: &mut &[u8]) -> Result<ServerIdentity> {
    let name = decode_name(buf)?;
    let address = decode_string(buf)?;
    ServerIdentity::new(name, address)
}

fn decode_names(buf: &mut &[u8]) -> Result<Vec<ServerName>> {
    let count = decode_u16(buf)? as usize;
    let mut names = Vec::with_capacity(count);
    for _ in 0..count {
        names.push(decode_name(buf)?);
    }
    Ok(names)
}

fn decode_name(buf: &mut &[u8]) -> Result<ServerName> {
    let raw = decode_string(buf)?;
    ServerName::parse(&raw).map_err(|e| Error::DecodeError(e.to_string()))
}

fn decode_role(buf: &mut &[u8]) -> Result<Role> {
    match decode_u8(buf)? {
        role::CHILD => Ok(Role::Child),
        role::PARENT => Ok(Role::Parent),
        role::PEER => Ok(Role::Peer),
        other => Err(Error::DecodeError(format!("unknown role: {}", other))),
    }
}

#[inline(always)]
fn ensure(buf: &&[u8], needed: usize) -> Result<()> {
    if buf.remaining() < needed {
        return Err(Error::BufferTooSmall {
            needed,
            have: buf.remaining(),
        });
    }
    Ok(())
}

#[inline(always)]
fn decode_u8(buf: &mut &[u8]) -> Result<u8> {
    ensure(buf, 1)?;
    Ok(buf.get_u8())
}

#[inline(always)]
fn decode_u16(buf: &mut &[u8]) -> Result<u16> {
    ensure(buf, 2)?;
    Ok(buf.get_u16())
}

#[inline(always)]
fn decode_u32(buf: &mut &[u8]) -> Result<u32> {
    ensure(buf, 4)?;
    Ok(buf.get_u32())
}

#[inline(always)]
fn decode_u64(buf: &mut &[u8]) -> Result<u64> {
    ensure(buf, 8)?;
    Ok(buf.get_u64())
}

#[inline(always)]
fn decode_string(buf: &mut &[u8]) -> Result<String> {
    let len = decode_u16(buf)? as usize;
    ensure(buf, len)?;
    let bytes = &buf[..len];
    buf.advance(len);
    String::from_utf8(bytes.to_vec()).map_err(|e| Error::DecodeError(e.to_string()))
}

#[inline(always)]
fn decode_payload(buf: &mut &[u8]) -> Result<Bytes> {
    let len = decode_u32(buf)? as usize;
    ensure(buf, len)?;
    let payload = Bytes::copy_from_slice(&buf[..len]);
    buf.advance(len);
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(s: &str) -> ServerName {
        ServerName::parse(s).unwrap()
    }

    #[test]
    fn test_ping_roundtrip() {
        let encoded = encode(&Message::Ping { id: 7 }).unwrap();
        assert_eq!(encoded.len(), 9);
        assert_eq!(decode(&encoded).unwrap(), Message::Ping { id: 7 });
    }

    #[test]
    fn test_route_roundtrip() {
        let message = RoutedMessage {
            source: name("/a"),
            destination: name("/a/b"),
            path: Some(Path::new(vec![name("/a"), name("/a/b")]).unwrap()),
            at_index: 0,
            payload: Bytes::from_static(b"frame"),
        };
        let original = Message::Route { id: 42, message };
        let decoded = decode(&encode(&original).unwrap()).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_truncated_buffer() {
        let encoded = encode(&Message::Pong { id: 1 }).unwrap();
        assert!(matches!(
            decode(&encoded[..5]),
            Err(Error::BufferTooSmall { needed: 8, have: 4 })
        ));
    }

    #[test]
    fn test_unknown_type() {
        assert_eq!(decode(&[0xEE]), Err(Error::UnknownMessageType(0xEE)));
    }
}
