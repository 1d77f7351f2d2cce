//! Error types for Turbine core

use thiserror::Error;

/// Result type alias for Turbine core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Turbine core error types
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// Malformed transport address (host:port or mem:<name>)
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// Malformed hierarchical server name
    #[error("invalid server name: {0}")]
    InvalidName(String),

    /// Shortcut cost outside the allowed range
    #[error("invalid cost: {0}")]
    InvalidCost(f64),

    /// A path needs at least the local server
    #[error("path has no hops")]
    EmptyPath,

    /// Extending a path would revisit a server
    #[error("route cycle: {0} is already on the path")]
    RouteCycle(String),

    /// Frame payload too large
    #[error("payload too large: {0} bytes")]
    PayloadTooLarge(usize),

    /// Frame buffer too small
    #[error("buffer too small: need {needed} bytes, have {have}")]
    BufferTooSmall { needed: usize, have: usize },

    /// Encoding error
    #[error("encode error: {0}")]
    EncodeError(String),

    /// Decoding error
    #[error("decode error: {0}")]
    DecodeError(String),

    /// Invalid message type code
    #[error("unknown message type: 0x{0:02x}")]
    UnknownMessageType(u8),
}

impl Error {
    /// Whether this error stems from a malformed address or name, which is
    /// reported at configuration time and never retried
    pub fn is_address_error(&self) -> bool {
        matches!(self, Error::InvalidAddress(_) | Error::InvalidName(_))
    }
}
