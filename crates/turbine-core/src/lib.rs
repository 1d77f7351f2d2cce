//! Turbine Core
//!
//! Core types and control-message encoding for the Turbine routing fabric.
//!
//! This crate provides:
//! - Hierarchical server names and identities ([`ServerName`], [`ServerIdentity`])
//! - Routes and their costs ([`Path`], [`LocalPath`], [`Cost`])
//! - Lateral links between servers ([`Shortcut`])
//! - Router control messages and their binary codec ([`Message`], [`codec`])
//! - Bounded waits ([`Wait`])

pub mod codec;
pub mod cost;
pub mod error;
pub mod identity;
pub mod message;
pub mod path;
pub mod shortcut;
pub mod wait;

pub use codec::{decode, encode};
pub use cost::{Cost, PASSIVE_COST, TREE_EDGE_COST};
pub use error::{Error, Result};
pub use identity::{validate_address, ServerIdentity, ServerName, MEMORY_SCHEME};
pub use message::*;
pub use path::{LocalPath, Path};
pub use shortcut::{Activity, Shortcut, REVERSE_PREFIX};
pub use wait::{Wait, LONG_WAIT, NORMAL_WAIT, PING_INTERVAL, PING_WAIT, RECONNECT_INTERVAL};

/// Default TCP port a router listens on
pub const DEFAULT_PORT: u16 = 3333;
