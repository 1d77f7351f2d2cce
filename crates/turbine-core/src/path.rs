//! Routes through the fabric
//!
//! A [`Path`] is an ordered sequence of server names, starting at the server
//! that computed it and ending at the destination. A [`LocalPath`] is a path
//! computed locally, tagged with its accumulated [`Cost`].
//!
//! Paths sort primarily by destination: hops are compared from the last one
//! backwards, and a longer path sorts after a shorter one sharing the same
//! tail.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

use crate::cost::Cost;
use crate::identity::ServerName;
use crate::shortcut::Shortcut;
use crate::{Error, Result};

/// An ordered, non-empty list of hops
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "Vec<ServerName>", into = "Vec<ServerName>")]
pub struct Path {
    hops: Vec<ServerName>,
}

impl Path {
    /// Build a path from its hops
    pub fn new(hops: Vec<ServerName>) -> Result<Self> {
        if hops.is_empty() {
            return Err(Error::EmptyPath);
        }
        for (idx, hop) in hops.iter().enumerate() {
            if hops[..idx].contains(hop) {
                return Err(Error::RouteCycle(hop.to_string()));
            }
        }
        Ok(Self { hops })
    }

    /// A path that starts and ends at `origin`
    pub fn single(origin: ServerName) -> Self {
        Self { hops: vec![origin] }
    }

    pub fn hops(&self) -> &[ServerName] {
        &self.hops
    }

    pub fn len(&self) -> usize {
        self.hops.len()
    }

    /// Paths always have at least one hop
    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn origin(&self) -> &ServerName {
        &self.hops[0]
    }

    pub fn destination(&self) -> &ServerName {
        &self.hops[self.hops.len() - 1]
    }

    /// The hop after `origin`, if the path leaves the origin at all
    pub fn next_hop(&self) -> Option<&ServerName> {
        self.hops.get(1)
    }

    /// The hop following position `at_index`
    pub fn hop_after(&self, at_index: usize) -> Option<&ServerName> {
        self.hops.get(at_index + 1)
    }

    pub fn contains(&self, name: &ServerName) -> bool {
        self.hops.contains(name)
    }

    /// Position of `name` on the path
    pub fn position(&self, name: &ServerName) -> Option<usize> {
        self.hops.iter().position(|hop| hop == name)
    }

    /// Two paths describe the same route when their hops match
    pub fn equal_route(&self, other: &Path) -> bool {
        self.hops == other.hops
    }

    /// Compare hop sequences from the destination end backwards
    pub fn compare_hops(&self, other: &Path) -> Ordering {
        for (mine, theirs) in self.hops.iter().rev().zip(other.hops.iter().rev()) {
            match mine.as_str().cmp(theirs.as_str()) {
                Ordering::Equal => continue,
                unequal => return unequal,
            }
        }
        self.hops.len().cmp(&other.hops.len())
    }

    fn push(&mut self, hop: ServerName) -> Result<()> {
        if self.hops.contains(&hop) {
            return Err(Error::RouteCycle(hop.to_string()));
        }
        self.hops.push(hop);
        Ok(())
    }
}

impl TryFrom<Vec<ServerName>> for Path {
    type Error = Error;

    fn try_from(hops: Vec<ServerName>) -> Result<Self> {
        Path::new(hops)
    }
}

impl From<Path> for Vec<ServerName> {
    fn from(path: Path) -> Self {
        path.hops
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, hop) in self.hops.iter().enumerate() {
            if idx > 0 {
                write!(f, " -> ")?;
            }
            write!(f, "{}", hop)?;
        }
        Ok(())
    }
}

/// A path computed by this server, with its accumulated cost
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalPath {
    path: Path,
    cost: Cost,
}

impl LocalPath {
    /// The zero-cost path that only contains the local server
    pub fn origin(local: ServerName) -> Self {
        Self {
            path: Path::single(local),
            cost: Cost::ZERO,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn cost(&self) -> Cost {
        self.cost
    }

    pub fn destination(&self) -> &ServerName {
        self.path.destination()
    }

    pub fn next_hop(&self) -> Option<&ServerName> {
        self.path.next_hop()
    }

    pub fn contains(&self, name: &ServerName) -> bool {
        self.path.contains(name)
    }

    /// Append one hop reached at `cost`
    pub fn step(&self, next: ServerName, cost: Cost) -> Result<LocalPath> {
        let mut extended = self.clone();
        extended.path.push(next)?;
        extended.cost = extended.cost + cost;
        Ok(extended)
    }

    /// Append the shortcut's destination at the shortcut's cost
    pub fn extend(&self, shortcut: &Shortcut) -> Result<LocalPath> {
        self.step(shortcut.destination.clone(), shortcut.cost)
    }

    /// Order two computed paths.
    ///
    /// With `cost_primary` the cheaper path wins and hop order breaks ties;
    /// otherwise hop order decides and cost only separates equal hop lists.
    pub fn compare(&self, other: &LocalPath, cost_primary: bool) -> Ordering {
        let by_cost = self.cost.cmp(&other.cost);
        if cost_primary && by_cost != Ordering::Equal {
            return by_cost;
        }
        match self.path.compare_hops(&other.path) {
            Ordering::Equal => by_cost,
            unequal => unequal,
        }
    }

    pub fn into_path(self) -> Path {
        self.path
    }
}

impl fmt::Display for LocalPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (cost {})", self.path, self.cost)
    }
}

/// Free-function form of [`Path::equal_route`]
pub fn equal_route(a: &Path, b: &Path) -> bool {
    a.equal_route(b)
}

/// Free-function form of [`LocalPath::compare`]
pub fn compare(a: &LocalPath, b: &LocalPath, cost_primary: bool) -> Ordering {
    a.compare(b, cost_primary)
}

/// Free-function form of [`LocalPath::extend`]
pub fn extend(path: &LocalPath, shortcut: &Shortcut) -> Result<LocalPath> {
    path.extend(shortcut)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cost::TREE_EDGE_COST;

    fn name(s: &str) -> ServerName {
        ServerName::parse(s).unwrap()
    }

    #[test]
    fn test_new_rejects_empty_and_cycles() {
        assert_eq!(Path::new(vec![]), Err(Error::EmptyPath));
        assert!(matches!(
            Path::new(vec![name("/a"), name("/b"), name("/a")]),
            Err(Error::RouteCycle(_))
        ));
    }

    #[test]
    fn test_step_accumulates_cost() {
        let p = LocalPath::origin(name("/a"))
            .step(name("/a/b"), TREE_EDGE_COST)
            .unwrap()
            .step(name("/a/b/c"), TREE_EDGE_COST)
            .unwrap();
        assert_eq!(p.cost(), Cost::new(2.0));
        assert_eq!(p.next_hop(), Some(&name("/a/b")));
        assert_eq!(p.destination(), &name("/a/b/c"));
    }

    #[test]
    fn test_compare_hops_from_end() {
        let a = Path::new(vec![name("/z"), name("/m")]).unwrap();
        let b = Path::new(vec![name("/a"), name("/n")]).unwrap();
        // Destination dominates the ordering
        assert_eq!(a.compare_hops(&b), Ordering::Less);

        let short = Path::new(vec![name("/m")]).unwrap();
        assert_eq!(a.compare_hops(&short), Ordering::Greater);
    }
}
