//! Transport errors

use thiserror::Error;

pub type Result<T> = std::result::Result<T, TransportError>;

#[derive(Error, Debug)]
pub enum TransportError {
    /// Dialling the remote router failed
    #[error("connection to {0} failed")]
    ConnectionFailed(String),

    #[error("link is not connected")]
    NotConnected,

    /// The link's writer is gone
    #[error("send failed: {0}")]
    SendFailed(String),

    /// A frame exceeds the negotiated limit
    #[error("frame of {size} bytes exceeds the {max} byte limit")]
    FrameTooLarge { size: usize, max: usize },

    #[error("cannot listen on {0}")]
    BindFailed(String),

    #[error("accept failed: {0}")]
    AcceptFailed(String),

    /// Neither `host:port` nor `mem:<name>`
    #[error("invalid transport address: {0}")]
    InvalidAddress(String),

    #[error("{0} is already bound")]
    AddressInUse(String),

    #[error("timed out")]
    Timeout,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
