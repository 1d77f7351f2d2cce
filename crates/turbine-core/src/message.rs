//! Control messages exchanged between routers

use bytes::Bytes;

use crate::identity::{ServerIdentity, ServerName};
use crate::path::Path;
use crate::shortcut::Shortcut;

/// The relationship the sending server takes towards the receiver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Child,
    Parent,
    Peer,
}

impl Role {
    /// The role the other side of the relationship plays
    pub fn opposite(self) -> Role {
        match self {
            Role::Child => Role::Parent,
            Role::Parent => Role::Child,
            Role::Peer => Role::Peer,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Child => "child",
            Role::Parent => "parent",
            Role::Peer => "peer",
        }
    }
}

/// First message on every new connection
#[derive(Debug, Clone, PartialEq)]
pub struct Hello {
    pub identity: ServerIdentity,
    pub role: Role,
    /// Set when the connection answers a reverse-route request
    pub reverse: bool,
    /// Servers below the sender, advertised by children
    pub descendants: Vec<ServerName>,
}

/// Handshake answer
#[derive(Debug, Clone, PartialEq)]
pub struct Welcome {
    pub identity: ServerIdentity,
    pub descendants: Vec<ServerName>,
}

/// Ask the receiver to open a connection back to the requester
#[derive(Debug, Clone, PartialEq)]
pub struct ReverseRouteRequest {
    pub requester: ServerIdentity,
    /// The role the requester plays towards the receiver
    pub role: Role,
    pub descendants: Vec<ServerName>,
    /// Passive return shortcut for the receiver to install
    pub shortcut: Option<Shortcut>,
}

/// A server's shortcut table, versioned by a per-server counter
#[derive(Debug, Clone, PartialEq)]
pub struct PeerUpdate {
    pub peer: ServerIdentity,
    pub counter: u64,
    pub shortcuts: Vec<Shortcut>,
    pub descendants: Vec<ServerName>,
}

/// A child's current subtree, sent up to its parent whenever it changes
#[derive(Debug, Clone, PartialEq)]
pub struct Descendants {
    pub server: ServerName,
    pub descendants: Vec<ServerName>,
}

/// An application message travelling through the fabric
#[derive(Debug, Clone, PartialEq)]
pub struct RoutedMessage {
    pub source: ServerName,
    pub destination: ServerName,
    /// Stamped by the originating server
    pub path: Option<Path>,
    /// Position of the current holder on `path`
    pub at_index: u32,
    pub payload: Bytes,
}

impl RoutedMessage {
    pub fn new(source: ServerName, destination: ServerName, payload: impl Into<Bytes>) -> Self {
        Self {
            source,
            destination,
            path: None,
            at_index: 0,
            payload: payload.into(),
        }
    }
}

/// Outcome of a request sent over a link
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// The destination handled the message and answered with this payload
    Delivered(Bytes),
    /// A reverse-route request was honoured
    Accepted,
    /// No route from `last_hop` onwards
    Unreachable {
        destination: ServerName,
        last_hop: ServerName,
    },
    /// The receiver declined the request
    Refused(String),
    /// A hop further on gave up waiting for its reply
    TimedOut,
    /// A hop further on was stopped while the message was in flight
    Interrupted,
}

/// Every message a router sends or receives on a link
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Hello(Hello),
    Welcome(Welcome),
    Route { id: u64, message: RoutedMessage },
    ReverseRoute { id: u64, request: ReverseRouteRequest },
    Reply { id: u64, reply: Reply },
    PeerUpdate(PeerUpdate),
    Descendants(Descendants),
    Ping { id: u64 },
    Pong { id: u64 },
}

impl Message {
    /// Human-readable message kind, for logs
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::Hello(_) => "HELLO",
            Message::Welcome(_) => "WELCOME",
            Message::Route { .. } => "ROUTE",
            Message::ReverseRoute { .. } => "REVERSE_ROUTE",
            Message::Reply { .. } => "REPLY",
            Message::PeerUpdate(_) => "PEER_UPDATE",
            Message::Descendants(_) => "DESCENDANTS",
            Message::Ping { .. } => "PING",
            Message::Pong { .. } => "PONG",
        }
    }

    /// Request id, for messages that expect or carry an answer
    pub fn request_id(&self) -> Option<u64> {
        match self {
            Message::Route { id, .. }
            | Message::ReverseRoute { id, .. }
            | Message::Reply { id, .. }
            | Message::Ping { id }
            | Message::Pong { id } => Some(*id),
            _ => None,
        }
    }
}
