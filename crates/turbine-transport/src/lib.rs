//! Turbine Transport Layer
//!
//! This crate provides the links routers talk over:
//! - TCP (length-prefixed frames, for real deployments)
//! - Memory (in-process channels, for tests and embedded fabrics)
//!
//! Both sides of a link speak [`TransportEvent`]s; routers only see the
//! [`TransportSender`], [`TransportReceiver`], [`Connector`] and
//! [`TransportServer`] traits.

pub mod dialer;
pub mod error;
pub mod traits;

#[cfg(feature = "memory")]
pub mod memory;

#[cfg(feature = "tcp")]
pub mod tcp;

pub use dialer::Dialer;
pub use error::{Result, TransportError};
pub use traits::{
    within, Connection, Connector, TransportEvent, TransportReceiver, TransportSender,
    TransportServer,
};

#[cfg(feature = "memory")]
pub use memory::{MemoryConnector, MemoryNetwork, MemoryReceiver, MemorySender, MemoryServer};

#[cfg(feature = "tcp")]
pub use tcp::{TcpConfig, TcpReceiver, TcpSender, TcpServer, TcpTransport};
