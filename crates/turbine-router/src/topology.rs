//! Topology manager
//!
//! Owns every [`RouteEndpoint`] of a server together with its
//! [`ShortcutRegistry`]. All structural changes go through one mutation lock;
//! route lookups copy what they need out of it and search without holding it.
//! Waiters park on a [`Notify`] that fires on every change and re-check their
//! condition after each wake.
//!
//! When an endpoint's connection is lost the endpoint is stopped: it leaves
//! the routing table together with everything only reachable through it, and
//! whatever was still in flight on its link is counted as dead bytes.

use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use turbine_core::{LocalPath, ServerIdentity, ServerName, Wait};

use crate::endpoint::{EndpointKind, RouteEndpoint, RouteState};
use crate::error::{Result, RouterError};
use crate::link::{Link, LinkId};
use crate::shortcuts::ShortcutRegistry;

struct TopologyInner {
    /// Live endpoints by remote server
    endpoints: BTreeMap<ServerName, RouteEndpoint>,
    /// Servers routed around administratively
    disabled: BTreeSet<ServerName>,
    registry: ShortcutRegistry,
    /// Servers that opened a link back to us, and over which link
    reverse_routes: BTreeMap<ServerName, LinkId>,
}

/// Copy of the routing state taken under the lock
struct Snapshot {
    endpoints: Vec<RouteEndpoint>,
    registry: ShortcutRegistry,
}

/// Per-server owner of endpoints and shortcuts
pub struct TopologyManager {
    identity: ServerIdentity,
    inner: Mutex<TopologyInner>,
    changed: Notify,
    dead_bytes: AtomicU64,
    stopped: AtomicBool,
}

impl TopologyManager {
    pub fn new(identity: ServerIdentity) -> Self {
        let registry = ShortcutRegistry::new(identity.name.clone());
        Self {
            identity,
            inner: Mutex::new(TopologyInner {
                endpoints: BTreeMap::new(),
                disabled: BTreeSet::new(),
                registry,
                reverse_routes: BTreeMap::new(),
            }),
            changed: Notify::new(),
            dead_bytes: AtomicU64::new(0),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn identity(&self) -> &ServerIdentity {
        &self.identity
    }

    pub fn local(&self) -> &ServerName {
        &self.identity.name
    }

    // =========================================================================
    // Route lookup
    // =========================================================================

    /// Cheapest usable path to `destination`, if any
    pub fn route_for(&self, destination: &ServerName) -> Option<LocalPath> {
        if destination == self.local() {
            return Some(LocalPath::origin(self.local().clone()));
        }

        let snapshot = self.snapshot();
        let origin = self.local();

        snapshot
            .endpoints
            .iter()
            .filter_map(|endpoint| endpoint.find_path(origin, destination, &snapshot.registry))
            .min_by(|a, b| a.compare(b, true))
    }

    fn snapshot(&self) -> Snapshot {
        let inner = self.inner.lock();
        Snapshot {
            endpoints: inner
                .endpoints
                .values()
                .filter(|endpoint| endpoint.is_usable())
                .cloned()
                .collect(),
            registry: inner.registry.clone(),
        }
    }

    // =========================================================================
    // Endpoints
    // =========================================================================

    /// Register a newly connected endpoint.
    ///
    /// # Panics
    ///
    /// Panics if a live endpoint for the same server already exists.
    pub fn on_connection_established(&self, endpoint: RouteEndpoint) {
        if let Err(endpoint) = self.try_establish(endpoint) {
            panic!(
                "a live endpoint for {} is already registered",
                endpoint.name()
            );
        }
    }

    /// Register a newly connected endpoint unless a live one exists for the
    /// same server, in which case the rejected endpoint is handed back
    pub fn try_establish(
        &self,
        mut endpoint: RouteEndpoint,
    ) -> std::result::Result<(), RouteEndpoint> {
        {
            let mut inner = self.inner.lock();
            let name = endpoint.name().clone();

            if inner.endpoints.get(&name).map_or(false, |e| e.is_live()) {
                return Err(endpoint);
            }

            endpoint.mark_connected();
            if inner.disabled.contains(&name) {
                endpoint.set_route_state(RouteState::Off);
            }

            info!(
                "{} connected to {} server {}",
                self.local(),
                endpoint.kind().as_str(),
                name
            );
            inner.endpoints.insert(name, endpoint);
        }

        self.changed.notify_waiters();
        Ok(())
    }

    /// Handle the loss of the connection behind an endpoint.
    ///
    /// Only acts on the first call for a given link; later calls, and calls
    /// for a link that no longer backs the endpoint, return false.
    pub fn on_connection_lost(&self, name: &ServerName, link_id: Option<&str>) -> bool {
        let lost = {
            let mut inner = self.inner.lock();

            let matches = match inner.endpoints.get(name) {
                Some(endpoint) => match (link_id, endpoint.link()) {
                    (Some(id), Some(link)) => link.id == id,
                    (Some(_), None) => false,
                    (None, _) => true,
                },
                None => false,
            };
            if !matches {
                return false;
            }

            let Some(mut endpoint) = inner.endpoints.remove(name) else {
                return false;
            };
            if !endpoint.mark_disconnected() {
                return false;
            }

            // Reverse links that came in from the lost subtree go with it
            let mut gone: BTreeSet<ServerName> = BTreeSet::new();
            gone.insert(name.clone());
            if let Some(descendants) = endpoint.descendants() {
                gone.extend(descendants.iter().cloned());
            }
            inner
                .reverse_routes
                .retain(|server, _| !gone.contains(server));

            endpoint
        };

        if let Some(link) = lost.link() {
            let dead = link.fail_all();
            if dead > 0 {
                self.dead_bytes.fetch_add(dead, Ordering::SeqCst);
            }
        }

        match lost.kind() {
            EndpointKind::Child { descendants } => warn!(
                "Lost all connections to child server {}; stopping it and {} servers below it",
                lost.name(),
                descendants.len()
            ),
            kind => warn!(
                "Lost connection to {} server {}; stopping it",
                kind.as_str(),
                lost.name()
            ),
        }

        self.changed.notify_waiters();
        true
    }

    /// Remove an endpoint without counting it as a failure
    pub fn remove_endpoint(&self, name: &ServerName) -> Option<RouteEndpoint> {
        let removed = self.inner.lock().endpoints.remove(name).map(|mut endpoint| {
            endpoint.mark_disconnected();
            endpoint
        });
        if removed.is_some() {
            self.changed.notify_waiters();
        }
        removed
    }

    pub fn endpoint(&self, name: &ServerName) -> Option<RouteEndpoint> {
        self.inner.lock().endpoints.get(name).cloned()
    }

    pub fn endpoints(&self) -> Vec<RouteEndpoint> {
        self.inner.lock().endpoints.values().cloned().collect()
    }

    pub fn has_endpoint(&self, name: &ServerName) -> bool {
        self.inner.lock().endpoints.contains_key(name)
    }

    pub fn is_usable(&self, name: &ServerName) -> bool {
        self.inner
            .lock()
            .endpoints
            .get(name)
            .map_or(false, |e| e.is_usable())
    }

    /// The outbound link of a usable endpoint
    pub fn link_for(&self, name: &ServerName) -> Option<Arc<Link>> {
        let inner = self.inner.lock();
        let endpoint = inner.endpoints.get(name)?;
        if !endpoint.is_usable() {
            return None;
        }
        endpoint.link().cloned()
    }

    /// The endpoint for our parent, if we have one
    pub fn parent(&self) -> Option<RouteEndpoint> {
        self.inner
            .lock()
            .endpoints
            .values()
            .find(|e| matches!(e.kind(), EndpointKind::Parent))
            .cloned()
    }

    /// Switch routing through `name` on or off; the choice outlives the
    /// current endpoint
    pub fn set_route_state(&self, name: &ServerName, state: RouteState) -> bool {
        let changed = {
            let mut inner = self.inner.lock();
            match state {
                RouteState::Off => inner.disabled.insert(name.clone()),
                RouteState::On => inner.disabled.remove(name),
            };
            match inner.endpoints.get_mut(name) {
                Some(endpoint) if endpoint.route_state() != state => {
                    endpoint.set_route_state(state);
                    true
                }
                _ => false,
            }
        };

        if changed {
            info!("Routing through {} turned {:?}", name, state);
            self.changed.notify_waiters();
        }
        changed
    }

    /// Replace the subtree a child advertised
    pub fn update_child_descendants(
        &self,
        child: &ServerName,
        descendants: impl IntoIterator<Item = ServerName>,
    ) -> bool {
        let changed = self
            .inner
            .lock()
            .endpoints
            .get_mut(child)
            .map_or(false, |endpoint| endpoint.set_descendants(descendants));
        if changed {
            debug!("Subtree below {} changed", child);
            self.changed.notify_waiters();
        }
        changed
    }

    /// Every server below us that we can route to
    pub fn descendants(&self) -> Vec<ServerName> {
        let inner = self.inner.lock();
        let mut all = BTreeSet::new();
        for endpoint in inner.endpoints.values() {
            if let EndpointKind::Child { descendants } = endpoint.kind() {
                all.insert(endpoint.name().clone());
                all.extend(descendants.iter().cloned());
            }
        }
        all.into_iter().collect()
    }

    // =========================================================================
    // Reverse routes
    // =========================================================================

    /// A server opened a link back to us in answer to a reverse-route request
    pub fn record_reverse_route(&self, name: ServerName, link_id: LinkId) {
        debug!("Reverse route from {} registered", name);
        self.inner.lock().reverse_routes.insert(name, link_id);
        self.changed.notify_waiters();
    }

    /// The link a reverse route from `name` arrived on
    pub fn reverse_route_link(&self, name: &ServerName) -> Option<LinkId> {
        self.inner.lock().reverse_routes.get(name).cloned()
    }

    pub fn has_reverse_route(&self, name: &ServerName) -> bool {
        self.inner.lock().reverse_routes.contains_key(name)
    }

    /// Forget the reverse route carried by `link_id`
    pub fn forget_reverse_route(&self, name: &ServerName, link_id: &str) -> bool {
        let mut inner = self.inner.lock();
        if inner.reverse_routes.get(name).map(|id| id.as_str()) == Some(link_id) {
            inner.reverse_routes.remove(name);
            drop(inner);
            self.changed.notify_waiters();
            true
        } else {
            false
        }
    }

    // =========================================================================
    // Shortcuts
    // =========================================================================

    /// Run `f` against the shortcut registry under the mutation lock
    pub fn with_registry<R>(&self, f: impl FnOnce(&mut ShortcutRegistry) -> R) -> R {
        let result = f(&mut self.inner.lock().registry);
        self.changed.notify_waiters();
        result
    }

    /// Copy of the shortcut registry
    pub fn registry(&self) -> ShortcutRegistry {
        self.inner.lock().registry.clone()
    }

    // =========================================================================
    // Waiting
    // =========================================================================

    /// Block until `predicate` holds, the wait elapses or the manager stops
    pub async fn wait_until<F>(&self, predicate: F, wait: Wait) -> Result<()>
    where
        F: Fn(&TopologyManager) -> bool,
    {
        let deadline = wait.as_duration().map(|d| Instant::now() + d);

        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_stopped() {
                return Err(RouterError::Interrupted);
            }
            if predicate(self) {
                return Ok(());
            }

            match deadline {
                None => notified.await,
                Some(deadline) => {
                    if Instant::now() >= deadline {
                        return Err(RouterError::Timeout);
                    }
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return Err(RouterError::Timeout);
                    }
                }
            }
        }
    }

    /// Resolves once [`TopologyManager::stop`] has been called
    pub async fn stopped(&self) {
        let _ = self.wait_until(|_| false, Wait::Forever).await;
    }

    /// Interrupt every current and future wait
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.changed.notify_waiters();
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    // =========================================================================
    // Metrics
    // =========================================================================

    /// Bytes that were in flight on links lost so far
    pub fn dead_bytes(&self) -> u64 {
        self.dead_bytes.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use turbine_core::{Cost, Shortcut};

    fn name(s: &str) -> ServerName {
        ServerName::parse(s).unwrap()
    }

    fn identity(s: &str) -> ServerIdentity {
        ServerIdentity::parse(s, &format!("mem:{}", s.replace('/', "_"))).unwrap()
    }

    fn manager(local: &str) -> TopologyManager {
        TopologyManager::new(identity(local))
    }

    #[test]
    fn test_route_to_self() {
        let topology = manager("/r");
        let path = topology.route_for(&name("/r")).unwrap();
        assert_eq!(path.cost(), Cost::ZERO);
        assert_eq!(path.path().len(), 1);
    }

    #[test]
    fn test_tree_route_through_child() {
        let topology = manager("/r");
        topology.on_connection_established(RouteEndpoint::child(
            identity("/r/a"),
            vec![name("/r/a/b")],
        ));

        let path = topology.route_for(&name("/r/a/b")).unwrap();
        assert_eq!(path.path().hops(), &[name("/r"), name("/r/a"), name("/r/a/b")]);
        assert_eq!(path.cost(), Cost::new(2.0));
    }

    #[test]
    fn test_cheaper_shortcut_beats_tree() {
        let topology = manager("/r");

        // Ten tree edges down to /r/c1/.../c10
        let mut deep = Vec::new();
        let mut at = name("/r/c1");
        for level in 2..=10 {
            at = at.child(&format!("c{}", level)).unwrap();
            deep.push(at.clone());
        }
        let target = at.clone();
        topology.on_connection_established(RouteEndpoint::child(identity("/r/c1"), deep));

        let tree = topology.route_for(&target).unwrap();
        assert_eq!(tree.cost(), Cost::new(10.0));

        topology.with_registry(|r| {
            r.add(Shortcut::active(target.clone(), "mem:target", 5.0).unwrap())
        });
        topology.on_connection_established(RouteEndpoint::peer(ServerIdentity::new(
            target.clone(),
            "mem:target",
        )
        .unwrap()));

        let best = topology.route_for(&target).unwrap();
        assert_eq!(best.cost(), Cost::new(5.0));
        assert_eq!(best.path().hops(), &[name("/r"), target]);
    }

    #[test]
    fn test_lost_child_stops_subtree() {
        let topology = manager("/r");
        topology.on_connection_established(RouteEndpoint::child(
            identity("/r/a"),
            vec![name("/r/a/b")],
        ));
        topology.record_reverse_route(name("/r/a"), "link-a".into());
        topology.record_reverse_route(name("/r/a/b"), "link-b".into());

        assert!(topology.on_connection_lost(&name("/r/a"), None));
        assert!(!topology.on_connection_lost(&name("/r/a"), None));

        assert!(topology.route_for(&name("/r/a")).is_none());
        assert!(topology.route_for(&name("/r/a/b")).is_none());
        assert!(!topology.has_reverse_route(&name("/r/a")));
        assert!(!topology.has_reverse_route(&name("/r/a/b")));
        assert!(topology.descendants().is_empty());
    }

    #[test]
    fn test_lost_for_stale_link_is_ignored() {
        let topology = manager("/r");
        topology.on_connection_established(RouteEndpoint::child(identity("/r/a"), vec![]));

        assert!(!topology.on_connection_lost(&name("/r/a"), Some("some-other-link")));
        assert!(topology.route_for(&name("/r/a")).is_some());
    }

    #[test]
    #[should_panic(expected = "already registered")]
    fn test_duplicate_live_endpoint_panics() {
        let topology = manager("/r");
        topology.on_connection_established(RouteEndpoint::child(identity("/r/a"), vec![]));
        topology.on_connection_established(RouteEndpoint::child(identity("/r/a"), vec![]));
    }

    #[test]
    fn test_reconnect_after_loss_is_allowed() {
        let topology = manager("/r");
        topology.on_connection_established(RouteEndpoint::child(identity("/r/a"), vec![]));
        topology.on_connection_lost(&name("/r/a"), None);
        assert!(topology
            .try_establish(RouteEndpoint::child(identity("/r/a"), vec![]))
            .is_ok());
        assert!(topology.is_usable(&name("/r/a")));
    }

    #[test]
    fn test_route_state_survives_reconnect() {
        let topology = manager("/r");
        topology.on_connection_established(RouteEndpoint::child(identity("/r/a"), vec![]));

        assert!(topology.set_route_state(&name("/r/a"), RouteState::Off));
        assert!(topology.route_for(&name("/r/a")).is_none());

        topology.on_connection_lost(&name("/r/a"), None);
        topology.on_connection_established(RouteEndpoint::child(identity("/r/a"), vec![]));
        assert!(topology.route_for(&name("/r/a")).is_none());

        topology.set_route_state(&name("/r/a"), RouteState::On);
        assert!(topology.route_for(&name("/r/a")).is_some());
    }

    #[test]
    fn test_update_child_descendants() {
        let topology = manager("/r");
        topology.on_connection_established(RouteEndpoint::child(identity("/r/a"), vec![]));
        assert!(topology.route_for(&name("/r/a/b")).is_none());

        assert!(topology.update_child_descendants(&name("/r/a"), vec![name("/r/a/b")]));
        assert!(!topology.update_child_descendants(&name("/r/a"), vec![name("/r/a/b")]));
        assert!(topology.route_for(&name("/r/a/b")).is_some());
        assert_eq!(topology.descendants(), vec![name("/r/a"), name("/r/a/b")]);
    }

    #[tokio::test]
    async fn test_wait_until_wakes_on_change() {
        let topology = Arc::new(manager("/r"));
        let waiter = {
            let topology = topology.clone();
            tokio::spawn(async move {
                topology
                    .wait_until(
                        |t| t.has_reverse_route(&name("/r/a")),
                        Wait::For(Duration::from_secs(5)),
                    )
                    .await
            })
        };

        tokio::task::yield_now().await;
        topology.record_reverse_route(name("/r/a"), "link".into());
        assert!(waiter.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_wait_until_times_out() {
        let topology = manager("/r");
        let result = topology
            .wait_until(|_| false, Wait::For(Duration::from_millis(20)))
            .await;
        assert!(matches!(result, Err(RouterError::Timeout)));

        let result = topology.wait_until(|_| false, Wait::Immediate).await;
        assert!(matches!(result, Err(RouterError::Timeout)));
    }

    #[tokio::test]
    async fn test_stop_interrupts_waiters() {
        let topology = Arc::new(manager("/r"));
        let waiter = {
            let topology = topology.clone();
            tokio::spawn(async move { topology.wait_until(|_| false, Wait::Forever).await })
        };

        tokio::task::yield_now().await;
        topology.stop();
        assert!(matches!(
            waiter.await.unwrap(),
            Err(RouterError::Interrupted)
        ));
    }
}
