//! The seams between routers and the links they talk over

use async_trait::async_trait;
use bytes::Bytes;
use std::future::Future;
use std::sync::Arc;
use turbine_core::Wait;

use crate::error::{Result, TransportError};

/// What a link's receiving half reports
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// One whole frame
    Data(Bytes),
    /// The link is gone; `None` when it was closed locally
    Disconnected { reason: Option<String> },
    /// The link failed; no further events follow
    Error(String),
}

/// Sending half of a link, shared by every task that writes to it
#[async_trait]
pub trait TransportSender: Send + Sync {
    /// Queue one frame
    async fn send(&self, data: Bytes) -> Result<()>;

    fn is_connected(&self) -> bool;

    /// Tear the link down; the receivers on both ends observe a disconnect
    async fn close(&self) -> Result<()>;
}

/// Receiving half of a link, owned by the task reading it
#[async_trait]
pub trait TransportReceiver: Send {
    /// `None` once the link is finished
    async fn recv(&mut self) -> Option<TransportEvent>;

    async fn recv_within(&mut self, wait: Wait) -> Result<Option<TransportEvent>> {
        within(wait, self.recv()).await
    }
}

#[async_trait]
impl<T: TransportSender + ?Sized> TransportSender for Arc<T> {
    async fn send(&self, data: Bytes) -> Result<()> {
        T::send(self, data).await
    }

    fn is_connected(&self) -> bool {
        T::is_connected(self)
    }

    async fn close(&self) -> Result<()> {
        T::close(self).await
    }
}

#[async_trait]
impl<T: TransportReceiver + ?Sized> TransportReceiver for Box<T> {
    async fn recv(&mut self) -> Option<TransportEvent> {
        T::recv(self).await
    }
}

/// A freshly dialled link
pub type Connection = (Arc<dyn TransportSender>, Box<dyn TransportReceiver>);

/// Dials a router by its transport address
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, addr: &str) -> Result<Connection>;
}

/// Hands out links opened by other routers
#[async_trait]
pub trait TransportServer: Send + Sync {
    type Sender: TransportSender + 'static;
    type Receiver: TransportReceiver + 'static;

    /// Wait for the next inbound link; the string names the remote side
    async fn accept(&mut self) -> Result<(Self::Sender, Self::Receiver, String)>;

    /// Where peers should dial this server
    fn local_addr(&self) -> Result<String>;

    async fn close(&self) -> Result<()>;
}

/// Bound `fut` by `wait`, failing with [`TransportError::Timeout`]
pub async fn within<F: Future>(wait: Wait, fut: F) -> Result<F::Output> {
    let Some(limit) = wait.as_duration() else {
        return Ok(fut.await);
    };
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| TransportError::Timeout)
}
