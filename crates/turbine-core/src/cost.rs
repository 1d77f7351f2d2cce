//! Route costs
//!
//! Costs are additive along a path. Every tree edge (parent or child) costs
//! [`TREE_EDGE_COST`]; shortcuts carry the cost they were configured with.
//! Passive shortcuts use [`PASSIVE_COST`] so they can still be enumerated but
//! lose against any realistic active alternative.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::ops::Add;

/// Cost of one parent or child edge
pub const TREE_EDGE_COST: Cost = Cost(1.0);

/// Cost assigned to passive shortcuts
pub const PASSIVE_COST: Cost = Cost(f64::MAX / 1_000_000.0);

/// Additive route cost with a total order
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cost(f64);

impl Cost {
    /// The cost of the empty route
    pub const ZERO: Cost = Cost(0.0);

    pub const fn new(value: f64) -> Self {
        Self(value)
    }

    pub fn value(self) -> f64 {
        self.0
    }

    /// Whether this cost marks (or contains) a passive hop
    pub fn is_passive(self) -> bool {
        self.0 >= PASSIVE_COST.0
    }
}

impl Add for Cost {
    type Output = Cost;

    fn add(self, rhs: Cost) -> Cost {
        Cost(self.0 + rhs.0)
    }
}

impl PartialEq for Cost {
    fn eq(&self, other: &Self) -> bool {
        self.0.total_cmp(&other.0) == Ordering::Equal
    }
}

impl Eq for Cost {}

impl PartialOrd for Cost {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Cost {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

impl From<f64> for Cost {
    fn from(value: f64) -> Self {
        Self(value)
    }
}

impl fmt::Display for Cost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_passive() {
            write!(f, "passive")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_addition() {
        assert_eq!(TREE_EDGE_COST + TREE_EDGE_COST, Cost::new(2.0));
        assert_eq!(Cost::ZERO + Cost::new(5.0), Cost::new(5.0));
    }

    #[test]
    fn test_passive_dominates() {
        assert!(PASSIVE_COST > Cost::new(1.0e12));
        assert!((PASSIVE_COST + Cost::new(3.0)).is_passive());
        assert!(!Cost::new(1.0e12).is_passive());
        // Two passive hops must not overflow to infinity
        assert!((PASSIVE_COST + PASSIVE_COST).value().is_finite());
    }
}
