//! Route endpoints
//!
//! One endpoint per relationship this server has to another one: a child
//! below it, a parent above it, or a peer reached over a shortcut. Every
//! endpoint forwards over an outbound [`Link`].

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use turbine_core::{LocalPath, ServerIdentity, ServerName, TREE_EDGE_COST};

use crate::link::Link;
use crate::shortcuts::ShortcutRegistry;

/// What the remote server is to us
#[derive(Debug, Clone, PartialEq)]
pub enum EndpointKind {
    /// A child, with the subtree it advertised
    Child { descendants: BTreeSet<ServerName> },
    /// A server reached over a shortcut
    Peer,
    /// Our parent in the tree
    Parent,
}

impl EndpointKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndpointKind::Child { .. } => "child",
            EndpointKind::Peer => "peer",
            EndpointKind::Parent => "parent",
        }
    }
}

/// Connection lifecycle; `Disconnected` is terminal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    Connecting,
    Connected,
    Disconnected,
}

/// Administrative routing switch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteState {
    On,
    Off,
}

/// A relationship to one remote server
#[derive(Clone)]
pub struct RouteEndpoint {
    remote: ServerIdentity,
    kind: EndpointKind,
    state: EndpointState,
    route_state: RouteState,
    link: Option<Arc<Link>>,
}

impl RouteEndpoint {
    pub fn new(remote: ServerIdentity, kind: EndpointKind) -> Self {
        Self {
            remote,
            kind,
            state: EndpointState::Connecting,
            route_state: RouteState::On,
            link: None,
        }
    }

    pub fn child(remote: ServerIdentity, descendants: impl IntoIterator<Item = ServerName>) -> Self {
        Self::new(
            remote,
            EndpointKind::Child {
                descendants: descendants.into_iter().collect(),
            },
        )
    }

    pub fn parent(remote: ServerIdentity) -> Self {
        Self::new(remote, EndpointKind::Parent)
    }

    pub fn peer(remote: ServerIdentity) -> Self {
        Self::new(remote, EndpointKind::Peer)
    }

    /// Attach the outbound link this endpoint forwards over
    pub fn with_link(mut self, link: Arc<Link>) -> Self {
        self.link = Some(link);
        self
    }

    pub fn name(&self) -> &ServerName {
        &self.remote.name
    }

    pub fn remote(&self) -> &ServerIdentity {
        &self.remote
    }

    pub fn kind(&self) -> &EndpointKind {
        &self.kind
    }

    pub fn state(&self) -> EndpointState {
        self.state
    }

    pub fn route_state(&self) -> RouteState {
        self.route_state
    }

    pub fn link(&self) -> Option<&Arc<Link>> {
        self.link.as_ref()
    }

    pub fn is_live(&self) -> bool {
        self.state != EndpointState::Disconnected
    }

    /// Connected and administratively on
    pub fn is_usable(&self) -> bool {
        self.state == EndpointState::Connected && self.route_state == RouteState::On
    }

    pub fn set_route_state(&mut self, route_state: RouteState) {
        self.route_state = route_state;
    }

    /// Servers below a child endpoint
    pub fn descendants(&self) -> Option<&BTreeSet<ServerName>> {
        match &self.kind {
            EndpointKind::Child { descendants } => Some(descendants),
            _ => None,
        }
    }

    /// Replace a child's advertised subtree; false for other kinds or no change
    pub fn set_descendants(&mut self, names: impl IntoIterator<Item = ServerName>) -> bool {
        match &mut self.kind {
            EndpointKind::Child { descendants } => {
                let updated: BTreeSet<ServerName> = names.into_iter().collect();
                if *descendants == updated {
                    return false;
                }
                *descendants = updated;
                true
            }
            _ => false,
        }
    }

    /// Move from `Connecting` to `Connected`.
    ///
    /// # Panics
    ///
    /// Panics on a disconnected endpoint; reconnecting needs a new endpoint.
    pub fn mark_connected(&mut self) {
        assert!(
            self.state != EndpointState::Disconnected,
            "endpoint for {} cannot be resurrected after disconnecting",
            self.remote.name
        );
        self.state = EndpointState::Connected;
    }

    /// Returns true only on the transition into `Disconnected`
    pub fn mark_disconnected(&mut self) -> bool {
        if self.state == EndpointState::Disconnected {
            return false;
        }
        self.state = EndpointState::Disconnected;
        true
    }

    /// Cheapest path from `origin` to `destination` through this endpoint
    pub fn find_path(
        &self,
        origin: &ServerName,
        destination: &ServerName,
        registry: &ShortcutRegistry,
    ) -> Option<LocalPath> {
        if !self.is_usable() || origin == destination {
            return None;
        }

        let start = LocalPath::origin(origin.clone());
        let remote = self.name();

        match &self.kind {
            EndpointKind::Child { descendants } => {
                if destination == remote {
                    return start.step(remote.clone(), TREE_EDGE_COST).ok();
                }
                if !descendants.contains(destination) || !remote.is_ancestor_of(destination) {
                    return None;
                }
                let mut path = start.step(remote.clone(), TREE_EDGE_COST).ok()?;
                for hop in remote.lineage_to(destination) {
                    path = path.step(hop, TREE_EDGE_COST).ok()?;
                }
                Some(path)
            }

            EndpointKind::Parent => {
                if origin.is_ancestor_of(destination) || !origin.shares_root_with(destination) {
                    return None;
                }
                let mut path = start.step(remote.clone(), TREE_EDGE_COST).ok()?;
                let mut at = remote.clone();
                while at != *destination && !at.is_ancestor_of(destination) {
                    at = at.parent()?;
                    path = path.step(at.clone(), TREE_EDGE_COST).ok()?;
                }
                for hop in at.lineage_to(destination) {
                    path = path.step(hop, TREE_EDGE_COST).ok()?;
                }
                Some(path)
            }

            EndpointKind::Peer => {
                let shortcut = registry.find(remote)?;
                let first = start.extend(shortcut).ok()?;
                registry.best_path_from(&first, destination, &[])
            }
        }
    }
}

impl fmt::Debug for RouteEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouteEndpoint")
            .field("remote", &self.remote)
            .field("kind", &self.kind)
            .field("state", &self.state)
            .field("route_state", &self.route_state)
            .field("link", &self.link.as_ref().map(|l| l.id.clone()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use turbine_core::{Cost, Shortcut};

    fn name(s: &str) -> ServerName {
        ServerName::parse(s).unwrap()
    }

    fn identity(s: &str) -> ServerIdentity {
        ServerIdentity::parse(s, "mem:x").unwrap()
    }

    fn connected(mut endpoint: RouteEndpoint) -> RouteEndpoint {
        endpoint.mark_connected();
        endpoint
    }

    #[test]
    fn test_child_paths() {
        let registry = ShortcutRegistry::new(name("/r"));
        let child = connected(RouteEndpoint::child(
            identity("/r/a"),
            vec![name("/r/a/b"), name("/r/a/b/c")],
        ));

        let direct = child.find_path(&name("/r"), &name("/r/a"), &registry).unwrap();
        assert_eq!(direct.cost(), Cost::new(1.0));

        let deep = child.find_path(&name("/r"), &name("/r/a/b/c"), &registry).unwrap();
        assert_eq!(deep.cost(), Cost::new(3.0));
        assert_eq!(
            deep.path().hops(),
            &[name("/r"), name("/r/a"), name("/r/a/b"), name("/r/a/b/c")]
        );

        assert!(child.find_path(&name("/r"), &name("/r/a/z"), &registry).is_none());
        assert!(child.find_path(&name("/r"), &name("/r/q"), &registry).is_none());
    }

    #[test]
    fn test_parent_walks_up_and_down() {
        let registry = ShortcutRegistry::new(name("/r/a/b"));
        let parent = connected(RouteEndpoint::parent(identity("/r/a")));

        let up = parent.find_path(&name("/r/a/b"), &name("/r"), &registry).unwrap();
        assert_eq!(up.path().hops(), &[name("/r/a/b"), name("/r/a"), name("/r")]);
        assert_eq!(up.cost(), Cost::new(2.0));

        let across = parent
            .find_path(&name("/r/a/b"), &name("/r/q/z"), &registry)
            .unwrap();
        assert_eq!(
            across.path().hops(),
            &[name("/r/a/b"), name("/r/a"), name("/r"), name("/r/q"), name("/r/q/z")]
        );
        assert_eq!(across.cost(), Cost::new(4.0));

        // Own subtree and foreign trees are not reached through the parent
        assert!(parent.find_path(&name("/r/a/b"), &name("/r/a/b/c"), &registry).is_none());
        assert!(parent.find_path(&name("/r/a/b"), &name("/other"), &registry).is_none());
    }

    #[test]
    fn test_peer_delegates_to_registry() {
        let mut registry = ShortcutRegistry::new(name("/a"));
        registry.add(Shortcut::active(name("/b"), "mem:b", 7.0).unwrap());
        let peer = connected(RouteEndpoint::peer(identity("/b")));

        let path = peer.find_path(&name("/a"), &name("/b"), &registry).unwrap();
        assert_eq!(path.cost(), Cost::new(7.0));

        registry.remove(&name("/b"));
        assert!(peer.find_path(&name("/a"), &name("/b"), &registry).is_none());
    }

    #[test]
    fn test_unusable_endpoint_finds_nothing() {
        let registry = ShortcutRegistry::new(name("/r"));
        let mut child = RouteEndpoint::child(identity("/r/a"), vec![]);
        assert!(child.find_path(&name("/r"), &name("/r/a"), &registry).is_none());

        child.mark_connected();
        child.set_route_state(RouteState::Off);
        assert!(child.find_path(&name("/r"), &name("/r/a"), &registry).is_none());

        child.set_route_state(RouteState::On);
        assert!(child.find_path(&name("/r"), &name("/r/a"), &registry).is_some());
    }

    #[test]
    fn test_mark_disconnected_is_idempotent() {
        let mut child = connected(RouteEndpoint::child(identity("/r/a"), vec![]));
        assert!(child.mark_disconnected());
        assert!(!child.mark_disconnected());
        assert_eq!(child.state(), EndpointState::Disconnected);
    }

    #[test]
    #[should_panic(expected = "cannot be resurrected")]
    fn test_disconnected_is_terminal() {
        let mut child = connected(RouteEndpoint::child(identity("/r/a"), vec![]));
        child.mark_disconnected();
        child.mark_connected();
    }
}
