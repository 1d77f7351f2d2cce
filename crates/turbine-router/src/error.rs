//! Router error types

use thiserror::Error;
use turbine_core::ServerName;

pub type Result<T> = std::result::Result<T, RouterError>;

#[derive(Error, Debug)]
pub enum RouterError {
    /// Malformed name or address, reported before anything is started
    #[error("address error: {0}")]
    Address(String),

    #[error("{destination} is unreachable from {last_hop}")]
    Unreachable {
        destination: ServerName,
        last_hop: ServerName,
    },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("timed out")]
    Timeout,

    #[error("interrupted")]
    Interrupted,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("transport error: {0}")]
    Transport(#[from] turbine_transport::TransportError),

    #[error("core protocol error: {0}")]
    Core(#[from] turbine_core::Error),
}

impl RouterError {
    /// Map core errors about names and addresses onto [`RouterError::Address`]
    pub fn from_core(e: turbine_core::Error) -> Self {
        if e.is_address_error() {
            RouterError::Address(e.to_string())
        } else {
            RouterError::Core(e)
        }
    }
}
