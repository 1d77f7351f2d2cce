//! In-process transport
//!
//! Servers bind a `mem:<name>` address on a shared [`MemoryNetwork`]; clients
//! dial the same address through a [`MemoryConnector`]. Each connection is a
//! pair of bounded channels carrying [`TransportEvent`]s, so a whole fabric of
//! routers can run inside one test process.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};
use turbine_core::MEMORY_SCHEME;

use crate::error::{Result, TransportError};
use crate::traits::{
    Connection, Connector, TransportEvent, TransportReceiver, TransportSender, TransportServer,
};

/// Default channel buffer size for in-process connections
const DEFAULT_CHANNEL_BUFFER_SIZE: usize = 1000;

/// Server half of a freshly dialled connection
struct PendingConnection {
    sender: MemorySender,
    receiver: MemoryReceiver,
    remote: String,
}

/// Registry of bound in-process servers
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    listeners: Arc<DashMap<String, Listener>>,
    next_client: Arc<AtomicU64>,
    next_server: Arc<AtomicU64>,
}

struct Listener {
    server_id: u64,
    tx: mpsc::Sender<PendingConnection>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a server on `addr` (`mem:<name>`)
    pub fn bind(&self, addr: &str) -> Result<MemoryServer> {
        MemoryServer::bind(self, addr)
    }

    /// A connector dialling servers on this network
    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector {
            network: self.clone(),
        }
    }

    /// Whether a live server is bound on `addr`
    pub fn is_bound(&self, addr: &str) -> bool {
        self.listeners
            .get(addr)
            .map(|listener| !listener.tx.is_closed())
            .unwrap_or(false)
    }

    /// Connect to the server bound on `addr`
    pub async fn connect(&self, addr: &str) -> Result<(MemorySender, MemoryReceiver)> {
        check_address(addr)?;

        let listener = self
            .listeners
            .get(addr)
            .map(|entry| entry.tx.clone())
            .ok_or_else(|| TransportError::ConnectionFailed(format!("nothing bound on {}", addr)))?;

        let client_id = self.next_client.fetch_add(1, Ordering::Relaxed);
        let (client, server) = pair();

        listener
            .send(PendingConnection {
                sender: server.0,
                receiver: server.1,
                remote: format!("{}#{}", addr, client_id),
            })
            .await
            .map_err(|_| TransportError::ConnectionFailed(format!("{} is not accepting", addr)))?;

        debug!("Memory connection to {} established", addr);
        Ok(client)
    }

    /// Remove `addr` if it is still bound to the server `server_id`
    fn unbind(&self, addr: &str, server_id: u64) {
        self.listeners
            .remove_if(addr, |_, listener| listener.server_id == server_id);
    }
}

fn check_address(addr: &str) -> Result<()> {
    match addr.strip_prefix(MEMORY_SCHEME) {
        Some(name) if !name.is_empty() => Ok(()),
        _ => Err(TransportError::InvalidAddress(addr.to_string())),
    }
}

/// Build both ends of an in-process connection
fn pair() -> ((MemorySender, MemoryReceiver), (MemorySender, MemoryReceiver)) {
    let connected = Arc::new(AtomicBool::new(true));
    let (a_tx, a_rx) = mpsc::channel(DEFAULT_CHANNEL_BUFFER_SIZE);
    let (b_tx, b_rx) = mpsc::channel(DEFAULT_CHANNEL_BUFFER_SIZE);

    let a = (
        MemorySender {
            peer: b_tx.clone(),
            own: a_tx.downgrade(),
            connected: connected.clone(),
        },
        MemoryReceiver { rx: a_rx },
    );
    let b = (
        MemorySender {
            own: b_tx.downgrade(),
            peer: a_tx,
            connected,
        },
        MemoryReceiver { rx: b_rx },
    );
    (a, b)
}

/// Sending half of an in-process connection
pub struct MemorySender {
    peer: mpsc::Sender<TransportEvent>,
    /// Weak so a dropped peer still ends our receiver
    own: mpsc::WeakSender<TransportEvent>,
    connected: Arc<AtomicBool>,
}

#[async_trait]
impl TransportSender for MemorySender {
    async fn send(&self, data: Bytes) -> Result<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }

        self.peer
            .send(TransportEvent::Data(data))
            .await
            .map_err(|_| TransportError::SendFailed("Channel closed".into()))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && !self.peer.is_closed()
    }

    async fn close(&self) -> Result<()> {
        if self.connected.swap(false, Ordering::SeqCst) {
            let _ = self
                .peer
                .send(TransportEvent::Disconnected {
                    reason: Some("closed by peer".into()),
                })
                .await;
            if let Some(own) = self.own.upgrade() {
                let _ = own.send(TransportEvent::Disconnected { reason: None }).await;
            }
        }
        Ok(())
    }
}

/// Receiving half of an in-process connection
pub struct MemoryReceiver {
    rx: mpsc::Receiver<TransportEvent>,
}

#[async_trait]
impl TransportReceiver for MemoryReceiver {
    async fn recv(&mut self) -> Option<TransportEvent> {
        self.rx.recv().await
    }
}

/// In-process server bound on a `mem:` address
pub struct MemoryServer {
    network: MemoryNetwork,
    addr: String,
    id: u64,
    incoming: mpsc::Receiver<PendingConnection>,
}

impl MemoryServer {
    /// Bind to an address on `network`
    pub fn bind(network: &MemoryNetwork, addr: &str) -> Result<Self> {
        check_address(addr)?;

        if network.is_bound(addr) {
            return Err(TransportError::AddressInUse(addr.to_string()));
        }

        let id = network.next_server.fetch_add(1, Ordering::Relaxed);
        let (tx, incoming) = mpsc::channel(DEFAULT_CHANNEL_BUFFER_SIZE);
        network
            .listeners
            .insert(addr.to_string(), Listener { server_id: id, tx });
        info!("Memory server listening on {}", addr);

        Ok(Self {
            network: network.clone(),
            addr: addr.to_string(),
            id,
            incoming,
        })
    }
}

#[async_trait]
impl TransportServer for MemoryServer {
    type Sender = MemorySender;
    type Receiver = MemoryReceiver;

    async fn accept(&mut self) -> Result<(Self::Sender, Self::Receiver, String)> {
        let pending = self
            .incoming
            .recv()
            .await
            .ok_or_else(|| TransportError::AcceptFailed(format!("{} unbound", self.addr)))?;

        debug!("Memory connection accepted from {}", pending.remote);
        Ok((pending.sender, pending.receiver, pending.remote))
    }

    fn local_addr(&self) -> Result<String> {
        Ok(self.addr.clone())
    }

    async fn close(&self) -> Result<()> {
        self.network.unbind(&self.addr, self.id);
        Ok(())
    }
}

impl Drop for MemoryServer {
    fn drop(&mut self) {
        self.network.unbind(&self.addr, self.id);
    }
}

/// Dials servers on a [`MemoryNetwork`]
#[derive(Clone)]
pub struct MemoryConnector {
    network: MemoryNetwork,
}

impl MemoryConnector {
    pub fn new(network: MemoryNetwork) -> Self {
        Self { network }
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, addr: &str) -> Result<Connection> {
        let (sender, receiver) = self.network.connect(addr).await?;
        Ok((Arc::new(sender), Box::new(receiver)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bind_twice_fails() {
        let network = MemoryNetwork::new();
        let _server = network.bind("mem:a").unwrap();
        assert!(matches!(
            network.bind("mem:a"),
            Err(TransportError::AddressInUse(_))
        ));
    }

    #[tokio::test]
    async fn test_drop_unbinds() {
        let network = MemoryNetwork::new();
        {
            let _server = network.bind("mem:a").unwrap();
            assert!(network.is_bound("mem:a"));
        }
        assert!(!network.is_bound("mem:a"));
        assert!(network.connect("mem:a").await.is_err());
    }

    #[tokio::test]
    async fn test_old_server_does_not_unbind_new_one() {
        let network = MemoryNetwork::new();
        let old = network.bind("mem:a").unwrap();
        old.close().await.unwrap();

        let _new = network.bind("mem:a").unwrap();
        drop(old);
        assert!(network.is_bound("mem:a"));
    }

    #[tokio::test]
    async fn test_invalid_address() {
        let network = MemoryNetwork::new();
        assert!(matches!(
            network.bind("127.0.0.1:1"),
            Err(TransportError::InvalidAddress(_))
        ));
    }
}
