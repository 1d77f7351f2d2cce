//! Shortcut registry
//!
//! Holds the shortcuts this server owns plus the shortcut tables its peers
//! have advertised, and searches them for the cheapest lateral route.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap};
use tracing::debug;
use turbine_core::{
    LocalPath, PeerUpdate, ServerIdentity, ServerName, Shortcut, TREE_EDGE_COST,
};

/// What a peer last told us about itself
#[derive(Debug, Clone, PartialEq)]
pub struct PeerRecord {
    pub identity: ServerIdentity,
    pub counter: u64,
    pub shortcuts: Vec<Shortcut>,
    pub descendants: BTreeSet<ServerName>,
}

/// Per-server shortcut table plus the tables learned from peers
#[derive(Debug, Clone)]
pub struct ShortcutRegistry {
    local: ServerName,
    own: BTreeMap<ServerName, Shortcut>,
    peers: BTreeMap<ServerName, PeerRecord>,
    counter: u64,
}

impl ShortcutRegistry {
    pub fn new(local: ServerName) -> Self {
        Self {
            local,
            own: BTreeMap::new(),
            peers: BTreeMap::new(),
            counter: 0,
        }
    }

    pub fn local(&self) -> &ServerName {
        &self.local
    }

    /// Add or replace the shortcut to `shortcut.destination`
    pub fn add(&mut self, shortcut: Shortcut) -> Option<Shortcut> {
        self.own.insert(shortcut.destination.clone(), shortcut)
    }

    pub fn remove(&mut self, destination: &ServerName) -> Option<Shortcut> {
        self.own.remove(destination)
    }

    pub fn find(&self, destination: &ServerName) -> Option<&Shortcut> {
        self.own.get(destination)
    }

    pub fn shortcuts(&self) -> impl Iterator<Item = &Shortcut> {
        self.own.values()
    }

    pub fn len(&self) -> usize {
        self.own.len()
    }

    pub fn is_empty(&self) -> bool {
        self.own.is_empty()
    }

    /// Version of our own table as advertised to peers
    pub fn counter(&self) -> u64 {
        self.counter
    }

    /// Mark our own table as changed
    pub fn bump_counter(&mut self) -> u64 {
        self.counter += 1;
        self.counter
    }

    /// Merge a peer's advertisement if it is newer than what we hold
    pub fn update_peer(&mut self, update: &PeerUpdate) -> bool {
        let name = &update.peer.name;
        if *name == self.local {
            return false;
        }

        if let Some(existing) = self.peers.get(name) {
            if existing.counter >= update.counter {
                debug!(
                    "Ignoring stale update from {} ({} <= {})",
                    name, update.counter, existing.counter
                );
                return false;
            }
        }

        self.peers.insert(
            name.clone(),
            PeerRecord {
                identity: update.peer.clone(),
                counter: update.counter,
                shortcuts: update.shortcuts.clone(),
                descendants: update.descendants.iter().cloned().collect(),
            },
        );
        true
    }

    pub fn remove_peer(&mut self, name: &ServerName) -> Option<PeerRecord> {
        self.peers.remove(name)
    }

    pub fn peer(&self, name: &ServerName) -> Option<&PeerRecord> {
        self.peers.get(name)
    }

    pub fn peers(&self) -> impl Iterator<Item = &PeerRecord> {
        self.peers.values()
    }

    /// Our own table, as sent to peers
    pub fn advertisement(
        &self,
        identity: &ServerIdentity,
        descendants: Vec<ServerName>,
    ) -> PeerUpdate {
        PeerUpdate {
            peer: identity.clone(),
            counter: self.counter,
            shortcuts: self.own.values().cloned().collect(),
            descendants,
        }
    }

    /// Cheapest route from the local server to `destination` over shortcuts,
    /// never passing through `already_visited`
    pub fn best_path_via(
        &self,
        destination: &ServerName,
        already_visited: &[ServerName],
    ) -> Option<LocalPath> {
        let start = LocalPath::origin(self.local.clone());
        self.best_path_from(&start, destination, already_visited)
    }

    /// Cheapest continuation of `start` to `destination`.
    ///
    /// Dijkstra over our own shortcuts, the peers' advertised shortcuts and
    /// their advertised descendants. Candidates are ordered cost first, so a
    /// passive hop is only taken when nothing finite gets there.
    pub fn best_path_from(
        &self,
        start: &LocalPath,
        destination: &ServerName,
        already_visited: &[ServerName],
    ) -> Option<LocalPath> {
        let mut settled: BTreeSet<ServerName> = already_visited.iter().cloned().collect();
        let hops = start.path().hops();
        settled.extend(hops[..hops.len() - 1].iter().cloned());

        let mut frontier = BinaryHeap::new();
        frontier.push(Candidate(start.clone()));

        while let Some(Candidate(path)) = frontier.pop() {
            let at = path.destination().clone();
            if !settled.insert(at.clone()) {
                continue;
            }
            if at == *destination {
                return Some(path);
            }

            for next in self.edges_from(&path) {
                if !settled.contains(next.destination()) {
                    frontier.push(Candidate(next));
                }
            }
        }

        None
    }

    /// Every one-edge extension of `path` the tables know about
    fn edges_from(&self, path: &LocalPath) -> Vec<LocalPath> {
        let at = path.destination();
        let mut next = Vec::new();

        if *at == self.local {
            next.extend(self.own.values().filter_map(|s| path.extend(s).ok()));
        }

        if let Some(record) = self.peers.get(at) {
            next.extend(record.shortcuts.iter().filter_map(|s| path.extend(s).ok()));

            for descendant in &record.descendants {
                let mut walked = Some(path.clone());
                for hop in at.lineage_to(descendant) {
                    walked = walked.and_then(|p| p.step(hop, TREE_EDGE_COST).ok());
                }
                if let Some(walked) = walked {
                    if walked.destination() == descendant {
                        next.push(walked);
                    }
                }
            }
        }

        next
    }
}

/// Min-heap entry ordered cost first
struct Candidate(LocalPath);

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        other.0.compare(&self.0, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use turbine_core::{Cost, PASSIVE_COST};

    fn name(s: &str) -> ServerName {
        ServerName::parse(s).unwrap()
    }

    fn active(dest: &str, cost: f64) -> Shortcut {
        Shortcut::active(name(dest), format!("mem:{}", &dest[1..]), cost).unwrap()
    }

    fn update(peer: &str, counter: u64, shortcuts: Vec<Shortcut>) -> PeerUpdate {
        PeerUpdate {
            peer: ServerIdentity::parse(peer, &format!("mem:{}", &peer[1..])).unwrap(),
            counter,
            shortcuts,
            descendants: vec![],
        }
    }

    #[test]
    fn test_add_find_remove() {
        let mut registry = ShortcutRegistry::new(name("/a"));
        assert!(registry.add(active("/b", 2.0)).is_none());
        assert!(registry.add(active("/b", 3.0)).is_some());
        assert_eq!(registry.find(&name("/b")).unwrap().cost, Cost::new(3.0));
        assert!(registry.remove(&name("/b")).is_some());
        assert!(registry.find(&name("/b")).is_none());
    }

    #[test]
    fn test_direct_shortcut() {
        let mut registry = ShortcutRegistry::new(name("/a"));
        registry.add(active("/b", 4.0));

        let path = registry.best_path_via(&name("/b"), &[]).unwrap();
        assert_eq!(path.cost(), Cost::new(4.0));
        assert_eq!(path.path().hops(), &[name("/a"), name("/b")]);
    }

    #[test]
    fn test_chain_through_peer_sums_costs() {
        let mut registry = ShortcutRegistry::new(name("/a"));
        registry.add(active("/b", 2.0));
        registry.update_peer(&update("/b", 1, vec![active("/c", 3.5)]));

        let path = registry.best_path_via(&name("/c"), &[]).unwrap();
        assert_eq!(path.cost(), Cost::new(5.5));
        assert_eq!(path.path().hops(), &[name("/a"), name("/b"), name("/c")]);
    }

    #[test]
    fn test_passive_loses_to_active_chain() {
        let mut registry = ShortcutRegistry::new(name("/a"));
        registry.add(Shortcut::passive(name("/c"), "mem:c").unwrap());
        registry.add(active("/b", 40.0));
        registry.update_peer(&update("/b", 1, vec![active("/c", 60.0)]));

        let path = registry.best_path_via(&name("/c"), &[]).unwrap();
        assert_eq!(path.cost(), Cost::new(100.0));

        // Without the chain the passive shortcut is still found
        registry.remove(&name("/b"));
        let path = registry.best_path_via(&name("/c"), &[]).unwrap();
        assert_eq!(path.cost(), PASSIVE_COST);
    }

    #[test]
    fn test_visited_hops_are_skipped() {
        let mut registry = ShortcutRegistry::new(name("/a"));
        registry.add(active("/b", 1.0));
        registry.update_peer(&update("/b", 1, vec![active("/c", 1.0)]));

        assert!(registry.best_path_via(&name("/c"), &[name("/b")]).is_none());
    }

    #[test]
    fn test_cycles_terminate() {
        let mut registry = ShortcutRegistry::new(name("/a"));
        registry.add(active("/b", 1.0));
        registry.update_peer(&update("/b", 1, vec![active("/a", 1.0), active("/c", 1.0)]));
        registry.update_peer(&update("/c", 1, vec![active("/b", 1.0), active("/a", 1.0)]));

        assert!(registry.best_path_via(&name("/z"), &[]).is_none());
        let path = registry.best_path_via(&name("/c"), &[]).unwrap();
        assert_eq!(path.cost(), Cost::new(2.0));
    }

    #[test]
    fn test_update_peer_is_counter_gated() {
        let mut registry = ShortcutRegistry::new(name("/a"));
        assert!(registry.update_peer(&update("/b", 2, vec![active("/c", 1.0)])));
        assert!(!registry.update_peer(&update("/b", 2, vec![])));
        assert!(!registry.update_peer(&update("/b", 1, vec![])));
        assert_eq!(registry.peer(&name("/b")).unwrap().shortcuts.len(), 1);

        assert!(registry.update_peer(&update("/b", 3, vec![])));
        assert!(registry.peer(&name("/b")).unwrap().shortcuts.is_empty());

        // Our own advertisement echoed back is ignored
        assert!(!registry.update_peer(&update("/a", 99, vec![])));
    }

    #[test]
    fn test_peer_descendants_are_reachable() {
        let mut registry = ShortcutRegistry::new(name("/a"));
        registry.add(active("/b", 2.0));
        let mut advertised = update("/b", 1, vec![]);
        advertised.descendants = vec![name("/b/x"), name("/b/x/y")];
        registry.update_peer(&advertised);

        let path = registry.best_path_via(&name("/b/x/y"), &[]).unwrap();
        assert_eq!(path.cost(), Cost::new(4.0));
        assert_eq!(
            path.path().hops(),
            &[name("/a"), name("/b"), name("/b/x"), name("/b/x/y")]
        );
    }

    #[test]
    fn test_advertisement_carries_counter() {
        let mut registry = ShortcutRegistry::new(name("/a"));
        registry.add(active("/b", 2.0));
        registry.bump_counter();
        let identity = ServerIdentity::parse("/a", "mem:a").unwrap();

        let advert = registry.advertisement(&identity, vec![]);
        assert_eq!(advert.counter, 1);
        assert_eq!(advert.shortcuts.len(), 1);
    }
}
