//! Address-based connector selection

use async_trait::async_trait;
use turbine_core::MEMORY_SCHEME;

use crate::error::{Result, TransportError};
use crate::traits::{Connection, Connector};

#[cfg(feature = "memory")]
use crate::memory::MemoryNetwork;
#[cfg(feature = "tcp")]
use crate::tcp::TcpTransport;

/// Picks the transport from the address: `mem:` names go to the in-process
/// network, everything else to TCP
#[derive(Clone, Default)]
pub struct Dialer {
    #[cfg(feature = "memory")]
    memory: Option<MemoryNetwork>,
    #[cfg(feature = "tcp")]
    tcp: TcpTransport,
}

impl Dialer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Also dial `mem:` addresses on `network`
    #[cfg(feature = "memory")]
    pub fn with_memory(mut self, network: MemoryNetwork) -> Self {
        self.memory = Some(network);
        self
    }

    #[cfg(feature = "tcp")]
    pub fn with_tcp(mut self, tcp: TcpTransport) -> Self {
        self.tcp = tcp;
        self
    }
}

#[async_trait]
impl Connector for Dialer {
    async fn connect(&self, addr: &str) -> Result<Connection> {
        if addr.starts_with(MEMORY_SCHEME) {
            #[cfg(feature = "memory")]
            if let Some(network) = &self.memory {
                return network.connector().connect(addr).await;
            }
            return Err(TransportError::InvalidAddress(format!(
                "no in-process network for {}",
                addr
            )));
        }

        #[cfg(feature = "tcp")]
        {
            Connector::connect(&self.tcp, addr).await
        }

        #[cfg(not(feature = "tcp"))]
        Err(TransportError::InvalidAddress(format!(
            "no transport for {}",
            addr
        )))
    }
}
