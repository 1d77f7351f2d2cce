//! Lateral links between servers outside the parent/child tree

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::cost::{Cost, PASSIVE_COST};
use crate::identity::{validate_address, ServerName};
use crate::{Error, Result};

/// Prefix given to the passive return shortcut a peer installs when an
/// active shortcut reaches it
pub const REVERSE_PREFIX: &str = "_R.";

/// Whether a shortcut opens its own connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activity {
    /// Connects to the destination and forwards traffic over it
    Active,
    /// Known for route enumeration only, costed at [`PASSIVE_COST`]
    Passive,
}

/// A shortcut from the owning server to `destination`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Shortcut {
    pub destination: ServerName,
    pub address: String,
    pub cost: Cost,
    pub activity: Activity,
}

impl Shortcut {
    /// An active shortcut; `cost` must be finite and at least 1
    pub fn active(destination: ServerName, address: impl Into<String>, cost: f64) -> Result<Self> {
        if !cost.is_finite() || cost < 1.0 || Cost::new(cost) >= PASSIVE_COST {
            return Err(Error::InvalidCost(cost));
        }
        let address = address.into();
        validate_address(&address)?;
        Ok(Self {
            destination,
            address,
            cost: Cost::new(cost),
            activity: Activity::Active,
        })
    }

    /// A passive shortcut at [`PASSIVE_COST`]
    pub fn passive(destination: ServerName, address: impl Into<String>) -> Result<Self> {
        let address = address.into();
        validate_address(&address)?;
        Ok(Self {
            destination,
            address,
            cost: PASSIVE_COST,
            activity: Activity::Passive,
        })
    }

    pub fn is_active(&self) -> bool {
        self.activity == Activity::Active
    }

    /// Re-check the invariants of a shortcut that arrived from the network
    pub fn validate(&self) -> Result<()> {
        validate_address(&self.address)?;
        match self.activity {
            Activity::Active => {
                let value = self.cost.value();
                if !value.is_finite() || value < 1.0 || self.cost >= PASSIVE_COST {
                    return Err(Error::InvalidCost(value));
                }
            }
            Activity::Passive => {
                if self.cost != PASSIVE_COST {
                    return Err(Error::InvalidCost(self.cost.value()));
                }
            }
        }
        Ok(())
    }

    /// Label used for the passive return shortcut of this one
    pub fn reverse_label(&self, owner: &ServerName) -> String {
        format!("{}{}", REVERSE_PREFIX, owner.leaf())
    }
}

impl fmt::Display for Shortcut {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.activity {
            Activity::Active => "active",
            Activity::Passive => "passive",
        };
        write!(
            f,
            "{} shortcut to {} @ {} (cost {})",
            kind, self.destination, self.address, self.cost
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(s: &str) -> ServerName {
        ServerName::parse(s).unwrap()
    }

    #[test]
    fn test_active_cost_range() {
        assert!(Shortcut::active(name("/b"), "mem:b", 1.0).is_ok());
        assert!(Shortcut::active(name("/b"), "mem:b", 250.0).is_ok());
        assert_eq!(
            Shortcut::active(name("/b"), "mem:b", 0.5),
            Err(Error::InvalidCost(0.5))
        );
        assert!(Shortcut::active(name("/b"), "mem:b", f64::NAN).is_err());
        assert!(Shortcut::active(name("/b"), "mem:b", f64::MAX).is_err());
    }

    #[test]
    fn test_passive() {
        let s = Shortcut::passive(name("/b"), "127.0.0.1:3333").unwrap();
        assert!(!s.is_active());
        assert_eq!(s.cost, PASSIVE_COST);
        assert!(s.validate().is_ok());
    }

    #[test]
    fn test_bad_address() {
        assert!(matches!(
            Shortcut::active(name("/b"), "nowhere", 2.0),
            Err(Error::InvalidAddress(_))
        ));
    }

    #[test]
    fn test_serde_form() {
        let s = Shortcut::active(name("/b"), "mem:b", 3.0).unwrap();
        let json = serde_json::to_string(&s).unwrap();
        assert!(json.contains("\"activity\":\"active\""));
        let back: Shortcut = serde_json::from_str(&json).unwrap();
        assert_eq!(back, s);
    }
}
