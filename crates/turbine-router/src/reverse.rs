//! Reverse-route negotiation
//!
//! A link we dialled only lets us send. Before the remote can route back to
//! us it has to dial us in turn; [`ReverseRouteNegotiator`] asks it to and
//! waits until that inbound connection has registered with the topology.

use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use turbine_core::{Message, Reply, ReverseRouteRequest, Wait};

use crate::error::{Result, RouterError};
use crate::link::{bounded, Link};
use crate::topology::TopologyManager;

/// Requests reverse routes over outbound links
#[derive(Clone)]
pub struct ReverseRouteNegotiator {
    topology: Arc<TopologyManager>,
}

impl ReverseRouteNegotiator {
    pub fn new(topology: Arc<TopologyManager>) -> Self {
        Self { topology }
    }

    /// Make sure the server at the far end of `link` can route back to us.
    ///
    /// Returns `Ok(true)` once the far end can route back, whether the reverse
    /// route was already in place or has just registered. Callers that care
    /// which should check [`TopologyManager::has_reverse_route`] first.
    pub async fn ensure_reverse_route(
        &self,
        link: Arc<Link>,
        request: ReverseRouteRequest,
        wait: Wait,
    ) -> Result<bool> {
        let peer = link.remote_name().ok_or_else(|| {
            RouterError::Protocol(format!("{} has not completed its handshake", link.describe()))
        })?;

        if self.topology.has_reverse_route(&peer) {
            debug!("Reverse route from {} already in place", peer);
            return Ok(true);
        }

        let negotiation = async {
            let reply = link
                .request(
                    |id| Message::ReverseRoute { id, request },
                    0,
                    Wait::Forever,
                )
                .await?;

            match reply {
                Reply::Accepted => {
                    self.topology
                        .wait_until(|t| t.has_reverse_route(&peer), Wait::Forever)
                        .await
                }
                Reply::Refused(reason) => Err(RouterError::Protocol(format!(
                    "{} refused the reverse route: {}",
                    peer, reason
                ))),
                other => Err(RouterError::Protocol(format!(
                    "unexpected answer to reverse route request: {:?}",
                    other
                ))),
            }
        };

        tokio::select! {
            biased;
            _ = self.topology.stopped() => Err(RouterError::Interrupted),
            result = bounded(wait, negotiation) => {
                result??;
                info!("Reverse route from {} established", peer);
                Ok(true)
            }
        }
    }

    /// Run [`ReverseRouteNegotiator::ensure_reverse_route`] on its own task
    pub fn spawn(
        &self,
        link: Arc<Link>,
        request: ReverseRouteRequest,
        wait: Wait,
    ) -> JoinHandle<Result<bool>> {
        let negotiator = self.clone();
        tokio::spawn(async move { negotiator.ensure_reverse_route(link, request, wait).await })
    }
}
