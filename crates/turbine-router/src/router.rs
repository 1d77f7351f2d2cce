//! Main router implementation
//!
//! A [`Router`] is one server of the fabric. It accepts connections from any
//! transport implementing [`TransportServer`], dials other servers through a
//! [`Connector`], and forwards [`RoutedMessage`]s along the cheapest path its
//! [`TopologyManager`] knows about.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use turbine_router::{NullHandler, Router, RouterConfig};
//! use turbine_transport::{TcpServer, TcpTransport};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = RouterConfig::new("/plant", "127.0.0.1:3333");
//!     let router = Router::new(config, Arc::new(TcpTransport::new()), Arc::new(NullHandler))?;
//!
//!     let server = TcpServer::bind("127.0.0.1:3333").await?;
//!     router.run_ticker(router.config().tick_interval());
//!     router.serve_on(server).await?;
//!     Ok(())
//! }
//! ```

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use turbine_core::{
    codec, Descendants, Hello, Message, Path, PeerUpdate, Reply, ReverseRouteRequest, Role,
    RoutedMessage, ServerIdentity, ServerName, Shortcut, Welcome,
};
use turbine_transport::{
    Connector, TransportEvent, TransportReceiver, TransportSender, TransportServer,
};

use crate::config::RouterConfig;
use crate::endpoint::{EndpointKind, RouteEndpoint};
use crate::error::{Result, RouterError};
use crate::link::{bounded, Direction, Link, LinkId};
use crate::reverse::ReverseRouteNegotiator;
use crate::topology::TopologyManager;

/// Pause after a failed accept before trying again
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Handles messages addressed to this server
#[async_trait]
pub trait LocalHandler: Send + Sync {
    /// Handle `message`; the returned bytes travel back to the sender
    async fn handle(&self, message: RoutedMessage) -> Result<Bytes>;
}

/// Accepts every message and answers with an empty payload
pub struct NullHandler;

#[async_trait]
impl LocalHandler for NullHandler {
    async fn handle(&self, _message: RoutedMessage) -> Result<Bytes> {
        Ok(Bytes::new())
    }
}

struct RouterInner {
    config: RouterConfig,
    identity: ServerIdentity,
    topology: Arc<TopologyManager>,
    negotiator: ReverseRouteNegotiator,
    connector: Arc<dyn Connector>,
    handler: Arc<dyn LocalHandler>,
    /// Every open link, both directions
    links: DashMap<LinkId, Arc<Link>>,
    /// Where our parent was last reached
    parent_address: RwLock<Option<String>>,
    last_parent_attempt: Mutex<Option<Instant>>,
    joining_parent: AtomicBool,
}

/// Turbine router
#[derive(Clone)]
pub struct Router {
    inner: Arc<RouterInner>,
}

impl Router {
    /// Build a router; fails fast on malformed names or addresses
    pub fn new(
        config: RouterConfig,
        connector: Arc<dyn Connector>,
        handler: Arc<dyn LocalHandler>,
    ) -> Result<Self> {
        config.validate()?;
        let identity = config.identity()?;
        let topology = Arc::new(TopologyManager::new(identity.clone()));

        Ok(Self {
            inner: Arc::new(RouterInner {
                parent_address: RwLock::new(config.parent.clone()),
                config,
                identity,
                negotiator: ReverseRouteNegotiator::new(topology.clone()),
                topology,
                connector,
                handler,
                links: DashMap::new(),
                last_parent_attempt: Mutex::new(None),
                joining_parent: AtomicBool::new(false),
            }),
        })
    }

    pub fn config(&self) -> &RouterConfig {
        &self.inner.config
    }

    pub fn identity(&self) -> &ServerIdentity {
        &self.inner.identity
    }

    pub fn name(&self) -> &ServerName {
        &self.inner.identity.name
    }

    pub fn topology(&self) -> &Arc<TopologyManager> {
        &self.inner.topology
    }

    pub fn link_count(&self) -> usize {
        self.inner.links.len()
    }

    /// Join the configured parent and start the configured shortcuts.
    ///
    /// Failures are logged; the scheduler tick keeps retrying the parent.
    pub async fn start(&self) -> Result<()> {
        if let Some(parent) = self.inner.config.parent.clone() {
            if let Err(e) = self.join_parent(&parent).await {
                warn!(
                    "{} could not join its parent at {}: {}",
                    self.name(),
                    parent,
                    e
                );
            }
        }

        for shortcut in &self.inner.config.shortcuts {
            let shortcut = shortcut.to_shortcut()?;
            let destination = shortcut.destination.clone();
            if let Err(e) = self.start_shortcut(shortcut).await {
                warn!("Shortcut to {} did not start: {}", destination, e);
            }
        }

        Ok(())
    }

    // =========================================================================
    // Routing
    // =========================================================================

    /// Deliver `message` locally or forward it one hop closer to its
    /// destination, returning the destination's answer
    pub async fn route(&self, mut message: RoutedMessage) -> Result<Bytes> {
        if message.destination == *self.name() {
            debug!("Delivering message from {} locally", message.source);
            return self.inner.handler.handle(message).await;
        }

        let destination = message.destination.clone();
        let next = self.next_hop(&mut message)?;
        let link = self
            .inner
            .topology
            .link_for(&next)
            .ok_or_else(|| self.unreachable(&destination))?;

        debug!("Forwarding message for {} to {}", destination, next);
        let payload_bytes = message.payload.len();
        let reply = link
            .request(
                |id| Message::Route { id, message },
                payload_bytes,
                self.inner.config.route_wait(),
            )
            .await?;

        match reply {
            Reply::Delivered(payload) => Ok(payload),
            Reply::Unreachable {
                destination,
                last_hop,
            } => Err(RouterError::Unreachable {
                destination,
                last_hop,
            }),
            Reply::Refused(reason) => Err(RouterError::Protocol(reason)),
            Reply::TimedOut => Err(RouterError::Timeout),
            Reply::Interrupted => Err(RouterError::Interrupted),
            Reply::Accepted => Err(RouterError::Protocol(format!(
                "{} answered a routed message with Accepted",
                next
            ))),
        }
    }

    /// Follow the stamped path while its next hop is usable, otherwise
    /// stamp a fresh one from here
    fn next_hop(&self, message: &mut RoutedMessage) -> Result<ServerName> {
        let local = self.name();
        let topology = &self.inner.topology;

        if let Some(path) = &message.path {
            let position = match path.hops().get(message.at_index as usize) {
                Some(hop) if hop == local => Some(message.at_index as usize),
                _ => path.position(local),
            };
            if let Some(position) = position {
                if let Some(next) = path.hop_after(position) {
                    if topology.is_usable(next) {
                        let next = next.clone();
                        message.at_index = (position + 1) as u32;
                        return Ok(next);
                    }
                }
            }
        }

        let best = topology
            .route_for(&message.destination)
            .ok_or_else(|| self.unreachable(&message.destination))?;
        let (path, position) = restamp(message.path.as_ref(), local, best.into_path());
        let next = path
            .hop_after(position)
            .cloned()
            .ok_or_else(|| self.unreachable(&message.destination))?;

        message.path = Some(path);
        message.at_index = (position + 1) as u32;
        Ok(next)
    }

    fn unreachable(&self, destination: &ServerName) -> RouterError {
        RouterError::Unreachable {
            destination: destination.clone(),
            last_hop: self.name().clone(),
        }
    }

    // =========================================================================
    // Peer updates
    // =========================================================================

    /// Merge a peer's advertisement; newer ones are passed on to our other
    /// peers. `from` is the server that handed it to us.
    pub async fn update_peer(&self, update: PeerUpdate, from: Option<ServerName>) -> bool {
        if let Some(bad) = update.shortcuts.iter().find(|s| s.validate().is_err()) {
            warn!(
                "Dropping update from {} with invalid shortcut {}",
                update.peer.name, bad
            );
            return false;
        }

        let merged = self.inner.topology.with_registry(|r| r.update_peer(&update));
        if merged {
            debug!(
                "Merged update {} from {}",
                update.counter, update.peer.name
            );
            let mut exclude = vec![update.peer.name.clone()];
            exclude.extend(from);
            self.broadcast_to_peers(&Message::PeerUpdate(update), &exclude)
                .await;
        }
        merged
    }

    /// Our own shortcut table as advertised to peers
    pub fn advertisement(&self) -> PeerUpdate {
        let topology = &self.inner.topology;
        topology
            .registry()
            .advertisement(self.identity(), topology.descendants())
    }

    /// Bump our counter and advertise the current table to every peer
    async fn refresh_advertisement(&self) {
        self.inner.topology.with_registry(|r| r.bump_counter());
        let update = self.advertisement();
        self.broadcast_to_peers(&Message::PeerUpdate(update), &[])
            .await;
    }

    async fn broadcast_to_peers(&self, message: &Message, exclude: &[ServerName]) {
        let targets: Vec<Arc<Link>> = self
            .inner
            .topology
            .endpoints()
            .into_iter()
            .filter(|e| matches!(e.kind(), EndpointKind::Peer) && e.is_usable())
            .filter(|e| !exclude.contains(e.name()))
            .filter_map(|e| e.link().cloned())
            .collect();

        let sends = targets.iter().map(|link| async move {
            if let Err(e) = link.send_message(message).await {
                warn!("Failed to send {} to {}: {}", message.type_name(), link.describe(), e);
            }
        });
        join_all(sends).await;
    }

    /// Tell our parent about the subtree below us
    async fn propagate_descendants(&self) {
        let topology = &self.inner.topology;
        if let Some(link) = topology.parent().and_then(|p| p.link().cloned()) {
            let message = Message::Descendants(Descendants {
                server: self.name().clone(),
                descendants: topology.descendants(),
            });
            if let Err(e) = link.send_message(&message).await {
                warn!("Failed to update parent {}: {}", link.describe(), e);
            }
        }
        self.refresh_advertisement().await;
    }

    // =========================================================================
    // Tree membership
    // =========================================================================

    /// Register with our parent and have it open a route back to us
    pub async fn join_parent(&self, address: &str) -> Result<()> {
        let parent_name = self.name().parent().ok_or_else(|| {
            RouterError::Config(format!("{} is a root server", self.name()))
        })?;
        *self.inner.parent_address.write() = Some(address.to_string());

        let hello = self.hello(Role::Child, false);
        let (link, welcome) = self.connect_to(address, hello).await?;

        if welcome.identity.name != parent_name {
            link.close().await;
            return Err(RouterError::Protocol(format!(
                "{} answered as {}, expected parent {}",
                address, welcome.identity.name, parent_name
            )));
        }

        let endpoint = RouteEndpoint::parent(welcome.identity.clone()).with_link(link.clone());
        if self.inner.topology.try_establish(endpoint).is_err() {
            link.close().await;
            return Err(RouterError::Protocol(format!(
                "{} is already connected to its parent",
                self.name()
            )));
        }
        info!("{} joined parent {}", self.name(), parent_name);

        let request = ReverseRouteRequest {
            requester: self.identity().clone(),
            role: Role::Child,
            descendants: self.inner.topology.descendants(),
            shortcut: None,
        };
        self.negotiate(link, request).await?;
        Ok(())
    }

    // =========================================================================
    // Shortcuts
    // =========================================================================

    /// Add a shortcut and, for an active one, connect to its destination
    pub async fn start_shortcut(&self, shortcut: Shortcut) -> Result<()> {
        shortcut.validate().map_err(RouterError::from_core)?;
        let topology = &self.inner.topology;
        let destination = shortcut.destination.clone();

        if !shortcut.is_active() || topology.has_endpoint(&destination) {
            info!("Starting {}", shortcut);
            topology.with_registry(|r| r.add(shortcut));
            self.refresh_advertisement().await;
            return Ok(());
        }

        let hello = self.hello(Role::Peer, false);
        let (link, welcome) = self.connect_to(&shortcut.address, hello).await?;
        if welcome.identity.name != destination {
            link.close().await;
            return Err(RouterError::Protocol(format!(
                "{} answered as {}, expected {}",
                shortcut.address, welcome.identity.name, destination
            )));
        }

        info!("Starting {}", shortcut);
        topology.with_registry(|r| r.add(shortcut));
        let endpoint = RouteEndpoint::peer(welcome.identity.clone()).with_link(link.clone());
        let link = match topology.try_establish(endpoint) {
            Ok(()) => link,
            Err(_) => {
                debug!("{} already has an endpoint; keeping it", destination);
                link.close().await;
                let existing = topology
                    .endpoint(&destination)
                    .and_then(|e| e.link().cloned());
                match existing {
                    Some(existing) => existing,
                    None => {
                        self.refresh_advertisement().await;
                        return Ok(());
                    }
                }
            }
        };

        let request = ReverseRouteRequest {
            requester: self.identity().clone(),
            role: Role::Peer,
            descendants: topology.descendants(),
            shortcut: Some(
                Shortcut::passive(self.name().clone(), self.identity().address.clone())
                    .map_err(RouterError::from_core)?,
            ),
        };
        let negotiated = self.negotiate(link, request).await;

        self.refresh_advertisement().await;
        negotiated.map(|_| ())
    }

    /// Drop the shortcut to `destination` and disconnect its peer endpoint
    pub async fn stop_shortcut(&self, destination: &ServerName) -> Result<()> {
        let topology = &self.inner.topology;
        let removed = topology.with_registry(|r| r.remove(destination));
        let Some(shortcut) = removed else {
            return Err(RouterError::Config(format!(
                "no shortcut to {}",
                destination
            )));
        };
        info!("Stopping {}", shortcut);

        let peer = topology
            .endpoint(destination)
            .filter(|e| matches!(e.kind(), EndpointKind::Peer));
        if let Some(endpoint) = peer {
            topology.remove_endpoint(destination);
            if let Some(link) = endpoint.link() {
                link.close().await;
            }
        }

        self.refresh_advertisement().await;
        Ok(())
    }

    // =========================================================================
    // Reverse routes
    // =========================================================================

    /// Ask the far end of `link` to dial us, on a task of its own
    async fn negotiate(&self, link: Arc<Link>, request: ReverseRouteRequest) -> Result<bool> {
        if let Some(peer) = link.remote_name() {
            self.prune_reverse_route(&peer);
        }
        self.inner
            .negotiator
            .spawn(link, request, self.inner.config.reverse_route_wait())
            .await
            .map_err(|e| RouterError::Protocol(format!("reverse route task failed: {}", e)))?
    }

    /// Forget a reverse route whose link has already gone down
    fn prune_reverse_route(&self, peer: &ServerName) {
        let topology = &self.inner.topology;
        if let Some(id) = topology.reverse_route_link(peer) {
            let live = self
                .inner
                .links
                .get(&id)
                .map_or(false, |link| link.is_connected());
            if !live {
                debug!("Dropping stale reverse route from {}", peer);
                topology.forget_reverse_route(peer, &id);
            }
        }
    }

    /// Answer a reverse-route request that arrived on `link`
    async fn accept_reverse_route(&self, link: &Link, request: ReverseRouteRequest) -> Reply {
        let requester = request.requester.clone();
        if link.remote_name().as_ref() != Some(&requester.name) {
            return Reply::Refused(format!(
                "{} asked for a reverse route on behalf of {}",
                link.describe(),
                requester.name
            ));
        }

        match request.role {
            Role::Parent => {
                return Reply::Refused("parents do not request reverse routes".into());
            }
            Role::Child if requester.name.parent().as_ref() != Some(self.name()) => {
                return Reply::Refused(format!(
                    "{} is not a child of {}",
                    requester.name,
                    self.name()
                ));
            }
            _ => {}
        }

        let topology = &self.inner.topology;

        if request.role == Role::Peer {
            if let Some(shortcut) = &request.shortcut {
                if let Err(e) = shortcut.validate() {
                    return Reply::Refused(format!("invalid return shortcut: {}", e));
                }
                let installed = topology.with_registry(|r| {
                    if r.find(&shortcut.destination).map_or(false, |s| s.is_active()) {
                        false
                    } else {
                        r.add(shortcut.clone());
                        true
                    }
                });
                if installed {
                    info!(
                        "Installed {} as {}",
                        shortcut,
                        shortcut.reverse_label(self.name())
                    );
                }
            }
        }

        if topology.has_endpoint(&requester.name) {
            if request.role == Role::Child
                && topology.update_child_descendants(&requester.name, request.descendants)
            {
                self.propagate_descendants().await;
            }
            return Reply::Accepted;
        }

        let hello = self.hello(request.role.opposite(), true);
        let (out, welcome) = match self.connect_to(&requester.address, hello).await {
            Ok(connected) => connected,
            Err(e) => return Reply::Refused(format!("cannot reach {}: {}", requester.address, e)),
        };
        if welcome.identity.name != requester.name {
            out.close().await;
            return Reply::Refused(format!(
                "{} answered as {}",
                requester.address, welcome.identity.name
            ));
        }

        let endpoint = match request.role {
            Role::Child => RouteEndpoint::child(welcome.identity.clone(), request.descendants),
            _ => RouteEndpoint::peer(welcome.identity.clone()),
        }
        .with_link(out.clone());

        if topology.try_establish(endpoint).is_err() {
            out.close().await;
            return Reply::Accepted;
        }

        if request.role == Role::Child {
            self.propagate_descendants().await;
        } else {
            self.refresh_advertisement().await;
        }
        Reply::Accepted
    }

    // =========================================================================
    // Scheduler
    // =========================================================================

    /// Periodic housekeeping: ping idle links and rejoin a lost parent
    pub async fn on_tick(&self) {
        if self.inner.topology.is_stopped() {
            return;
        }

        let ping_interval = self.inner.config.ping_interval();
        let idle: Vec<Arc<Link>> = self
            .inner
            .links
            .iter()
            .filter(|entry| entry.value().last_activity().elapsed() >= ping_interval)
            .map(|entry| entry.value().clone())
            .collect();

        for link in idle {
            let wait = self.inner.config.ping_wait();
            tokio::spawn(async move {
                if let Err(e) = link.ping(wait).await {
                    warn!("{} did not answer ping: {}", link.describe(), e);
                    link.close().await;
                }
            });
        }

        self.maybe_rejoin_parent();
    }

    fn maybe_rejoin_parent(&self) {
        let Some(address) = self.inner.parent_address.read().clone() else {
            return;
        };
        if self.inner.topology.parent().is_some() {
            return;
        }

        {
            let mut last = self.inner.last_parent_attempt.lock();
            if let Some(at) = *last {
                if at.elapsed() < self.inner.config.reconnect_interval() {
                    return;
                }
            }
            if self.inner.joining_parent.swap(true, Ordering::SeqCst) {
                return;
            }
            *last = Some(Instant::now());
        }

        let router = self.clone();
        tokio::spawn(async move {
            info!("{} trying to rejoin its parent at {}", router.name(), address);
            if let Err(e) = router.join_parent(&address).await {
                warn!("{} could not rejoin its parent: {}", router.name(), e);
            }
            router.inner.joining_parent.store(false, Ordering::SeqCst);
        });
    }

    /// Call [`Router::on_tick`] every `interval` until the router stops
    pub fn run_ticker(&self, interval: Duration) -> JoinHandle<()> {
        let router = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = router.inner.topology.stopped() => break,
                    _ = tokio::time::sleep(interval) => router.on_tick().await,
                }
            }
        })
    }

    /// Stop the router: interrupt every wait and close every link
    pub async fn stop(&self) {
        info!("Stopping router {}", self.name());
        self.inner.topology.stop();

        let links: Vec<Arc<Link>> = self
            .inner
            .links
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for link in links {
            link.close().await;
        }
    }

    // =========================================================================
    // Connections
    // =========================================================================

    /// Serve using any TransportServer implementation until the router stops
    pub async fn serve_on<S>(&self, mut server: S) -> Result<()>
    where
        S: TransportServer + 'static,
    {
        match server.local_addr() {
            Ok(addr) => info!("{} accepting connections on {}", self.name(), addr),
            Err(_) => info!("{} accepting connections", self.name()),
        }

        loop {
            tokio::select! {
                _ = self.inner.topology.stopped() => break,
                accepted = server.accept() => match accepted {
                    Ok((sender, receiver, addr)) => {
                        debug!("New connection from {}", addr);
                        self.handle_connection(Arc::new(sender), Box::new(receiver), Direction::Inbound);
                    }
                    Err(e) => {
                        error!("Accept error: {}", e);
                        tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                    }
                },
            }
        }

        server.close().await?;
        Ok(())
    }

    /// Dial `address`, say `hello` and wait for the Welcome
    async fn connect_to(&self, address: &str, hello: Hello) -> Result<(Arc<Link>, Welcome)> {
        let (sender, receiver) = self.inner.connector.connect(address).await?;
        let link = self.handle_connection(sender, receiver, Direction::Outbound);
        let welcome = link.expect_welcome();

        let handshake = async {
            link.send_message(&Message::Hello(hello)).await?;
            bounded(self.inner.config.ping_wait(), welcome)
                .await?
                .map_err(|_| {
                    RouterError::Protocol(format!("{} closed during the handshake", address))
                })
        };

        match handshake.await {
            Ok(welcome) => {
                link.set_remote(welcome.identity.clone());
                Ok((link, welcome))
            }
            Err(e) => {
                link.close().await;
                Err(e)
            }
        }
    }

    fn hello(&self, role: Role, reverse: bool) -> Hello {
        Hello {
            identity: self.identity().clone(),
            role,
            reverse,
            descendants: self.inner.topology.descendants(),
        }
    }

    /// Register a link and spawn its reader
    fn handle_connection(
        &self,
        sender: Arc<dyn TransportSender>,
        mut receiver: Box<dyn TransportReceiver>,
        direction: Direction,
    ) -> Arc<Link> {
        let link = Arc::new(Link::new(sender, direction));
        self.inner.links.insert(link.id.clone(), link.clone());

        let router = self.clone();
        let reader = link.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = reader.closed() => break,
                    event = receiver.recv() => event,
                };

                match event {
                    Some(TransportEvent::Data(data)) => {
                        reader.touch();
                        match codec::decode(&data) {
                            Ok(message) => router.dispatch(&reader, message).await,
                            Err(e) => warn!("Decode error from {}: {}", reader.describe(), e),
                        }
                    }
                    Some(TransportEvent::Disconnected { reason }) => {
                        debug!("{} disconnected: {:?}", reader.describe(), reason);
                        break;
                    }
                    Some(TransportEvent::Error(e)) => {
                        error!("Transport error on {}: {}", reader.describe(), e);
                        break;
                    }
                    None => break,
                }
            }

            router.connection_closed(&reader).await;
        });

        link
    }

    async fn connection_closed(&self, link: &Arc<Link>) {
        link.mark_closed();
        self.inner.links.remove(&link.id);

        let Some(name) = link.remote_name() else {
            link.fail_all();
            return;
        };
        let topology = &self.inner.topology;
        if topology.forget_reverse_route(&name, &link.id) {
            // Another inbound link from the same server can carry the route
            let other = self.inner.links.iter().find_map(|entry| {
                let other = entry.value();
                let same_server = other.remote_name().as_ref() == Some(&name);
                (other.direction == Direction::Inbound && same_server && other.is_connected())
                    .then(|| other.id.clone())
            });
            if let Some(id) = other {
                topology.record_reverse_route(name.clone(), id);
            }
        }

        let kind = topology.endpoint(&name).map(|e| e.kind().clone());
        let lost = topology.on_connection_lost(&name, Some(link.id.as_str()));
        // Requests on a link that backed no endpoint are not dead bytes
        link.fail_all();
        if lost {
            if let Some(EndpointKind::Child { .. }) = kind {
                self.propagate_descendants().await;
            }
        }
    }

    async fn dispatch(&self, link: &Arc<Link>, message: Message) {
        match message {
            Message::Hello(hello) => {
                let name = hello.identity.name.clone();
                info!(
                    "{} says hello as {}{}",
                    name,
                    hello.role.as_str(),
                    if hello.reverse { " (reverse route)" } else { "" }
                );
                link.set_remote(hello.identity);

                let welcome = Message::Welcome(Welcome {
                    identity: self.identity().clone(),
                    descendants: self.inner.topology.descendants(),
                });
                if let Err(e) = link.send_message(&welcome).await {
                    warn!("Failed to welcome {}: {}", name, e);
                    return;
                }
                self.inner.topology.record_reverse_route(name, link.id.clone());
            }

            Message::Welcome(welcome) => {
                if !link.complete_welcome(welcome) {
                    debug!("Unexpected welcome on {}", link.describe());
                }
            }

            Message::Route { id, message } => {
                let router = self.clone();
                let link = link.clone();
                tokio::spawn(async move {
                    let reply = match router.route(message).await {
                        Ok(payload) => Reply::Delivered(payload),
                        Err(RouterError::Unreachable {
                            destination,
                            last_hop,
                        }) => Reply::Unreachable {
                            destination,
                            last_hop,
                        },
                        Err(RouterError::Timeout) => Reply::TimedOut,
                        Err(RouterError::Interrupted) => Reply::Interrupted,
                        Err(e) => Reply::Refused(e.to_string()),
                    };
                    router.reply(&link, id, reply).await;
                });
            }

            Message::ReverseRoute { id, request } => {
                let router = self.clone();
                let link = link.clone();
                tokio::spawn(async move {
                    let reply = router.accept_reverse_route(&link, request).await;
                    router.reply(&link, id, reply).await;
                });
            }

            Message::Reply { id, reply } => {
                link.complete(id, reply);
            }

            Message::PeerUpdate(update) => {
                let router = self.clone();
                let from = link.remote_name();
                tokio::spawn(async move {
                    router.update_peer(update, from).await;
                });
            }

            Message::Descendants(update) => {
                if link.remote_name().as_ref() != Some(&update.server) {
                    warn!(
                        "{} sent the subtree of {}; ignoring",
                        link.describe(),
                        update.server
                    );
                    return;
                }
                let changed = self
                    .inner
                    .topology
                    .update_child_descendants(&update.server, update.descendants);
                if changed {
                    let router = self.clone();
                    tokio::spawn(async move { router.propagate_descendants().await });
                }
            }

            Message::Ping { id } => {
                if let Err(e) = link.send_message(&Message::Pong { id }).await {
                    debug!("Failed to answer ping on {}: {}", link.describe(), e);
                }
            }

            Message::Pong { id } => {
                link.complete_ping(id);
            }
        }
    }

    async fn reply(&self, link: &Link, id: u64, reply: Reply) {
        if let Err(e) = link.send_message(&Message::Reply { id, reply }).await {
            warn!("Failed to reply on {}: {}", link.describe(), e);
        }
    }
}

/// Splice a fresh path from `local` onto the part of `previous` that led
/// here, falling back to the fresh path alone when that would loop
fn restamp(previous: Option<&Path>, local: &ServerName, fresh: Path) -> (Path, usize) {
    if let Some(previous) = previous {
        if let Some(position) = previous.position(local) {
            let mut hops = previous.hops()[..position].to_vec();
            hops.extend(fresh.hops().iter().cloned());
            if let Ok(path) = Path::new(hops) {
                return (path, position);
            }
        }
    }
    (fresh, 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use turbine_transport::MemoryNetwork;

    fn name(s: &str) -> ServerName {
        ServerName::parse(s).unwrap()
    }

    fn path(hops: &[&str]) -> Path {
        Path::new(hops.iter().map(|h| name(h)).collect()).unwrap()
    }

    fn router(local: &str) -> Router {
        let network = MemoryNetwork::new();
        let config = RouterConfig::new(local, format!("mem:{}", &local[1..]));
        Router::new(config, Arc::new(network.connector()), Arc::new(NullHandler)).unwrap()
    }

    #[test]
    fn test_restamp_keeps_the_way_here() {
        let previous = path(&["/a", "/b", "/c", "/d"]);
        let fresh = path(&["/c", "/x", "/d"]);

        let (stamped, position) = restamp(Some(&previous), &name("/c"), fresh);
        assert_eq!(position, 2);
        assert_eq!(stamped, path(&["/a", "/b", "/c", "/x", "/d"]));
    }

    #[test]
    fn test_restamp_avoids_loops() {
        let previous = path(&["/a", "/b", "/c"]);
        let fresh = path(&["/b", "/a", "/z"]);

        let (stamped, position) = restamp(Some(&previous), &name("/b"), fresh.clone());
        assert_eq!(position, 0);
        assert_eq!(stamped, fresh);
    }

    #[test]
    fn test_new_rejects_bad_config() {
        let network = MemoryNetwork::new();
        let config = RouterConfig::new("/r", "nowhere");
        let result = Router::new(config, Arc::new(network.connector()), Arc::new(NullHandler));
        assert!(matches!(result, Err(RouterError::Address(_))));
    }

    #[tokio::test]
    async fn test_local_delivery() {
        let router = router("/r");
        let reply = router
            .route(RoutedMessage::new(name("/r"), name("/r"), "hi"))
            .await
            .unwrap();
        assert!(reply.is_empty());
    }

    #[tokio::test]
    async fn test_no_path_is_unreachable_here() {
        let router = router("/r");
        let result = router
            .route(RoutedMessage::new(name("/r"), name("/r/a"), "hi"))
            .await;

        match result {
            Err(RouterError::Unreachable {
                destination,
                last_hop,
            }) => {
                assert_eq!(destination, name("/r/a"));
                assert_eq!(last_hop, name("/r"));
            }
            other => panic!("expected Unreachable, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stop_shortcut_without_shortcut_fails() {
        let router = router("/a");
        assert!(router.stop_shortcut(&name("/b")).await.is_err());
    }

    #[tokio::test]
    async fn test_passive_shortcut_only_enters_registry() {
        let router = router("/a");
        let shortcut = Shortcut::passive(name("/b"), "mem:b").unwrap();
        router.start_shortcut(shortcut).await.unwrap();

        assert!(router.topology().registry().find(&name("/b")).is_some());
        assert!(!router.topology().has_endpoint(&name("/b")));
        assert_eq!(router.advertisement().counter, 1);
    }
}
