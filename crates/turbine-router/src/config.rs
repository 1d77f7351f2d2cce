//! Router configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;
use turbine_core::{
    validate_address, ServerIdentity, ServerName, Shortcut, Wait, LONG_WAIT, NORMAL_WAIT,
    PING_INTERVAL, PING_WAIT, RECONNECT_INTERVAL,
};

use crate::error::{Result, RouterError};

/// A shortcut to start when the router starts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShortcutConfig {
    /// Name of the server at the far end
    pub destination: String,
    /// Address that server accepts connections on
    pub address: String,
    /// Routing cost; ignored for passive shortcuts
    #[serde(default = "default_shortcut_cost")]
    pub cost: f64,
    /// Passive shortcuts are known for routing but never dialled
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_shortcut_cost() -> f64 {
    1.0
}

fn default_active() -> bool {
    true
}

impl ShortcutConfig {
    pub fn to_shortcut(&self) -> Result<Shortcut> {
        let destination = ServerName::parse(&self.destination).map_err(RouterError::from_core)?;
        let shortcut = if self.active {
            Shortcut::active(destination, self.address.clone(), self.cost)
        } else {
            Shortcut::passive(destination, self.address.clone())
        };
        shortcut.map_err(RouterError::from_core)
    }
}

/// Router configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Hierarchical server name, e.g. `/plant/line1`
    pub name: String,
    /// Address other servers dial to reach this one
    pub address: String,
    /// Address of the parent server; roots have none
    pub parent: Option<String>,
    /// Shortcuts started with the router
    pub shortcuts: Vec<ShortcutConfig>,
    /// How long a forwarded message may wait for its reply
    pub route_wait_ms: u64,
    /// How long reverse-route negotiation may take
    pub reverse_route_wait_ms: u64,
    /// How long a ping or handshake may wait for its answer
    pub ping_wait_ms: u64,
    /// Idle time after which a link is pinged
    pub ping_interval_ms: u64,
    /// Minimum time between attempts to rejoin a lost parent
    pub reconnect_interval_ms: u64,
    /// Scheduler tick used by [`crate::Router::run_ticker`]
    pub tick_interval_ms: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            name: "/turbine".to_string(),
            address: format!("127.0.0.1:{}", turbine_core::DEFAULT_PORT),
            parent: None,
            shortcuts: Vec::new(),
            route_wait_ms: LONG_WAIT.as_millis() as u64,
            reverse_route_wait_ms: LONG_WAIT.as_millis() as u64,
            ping_wait_ms: PING_WAIT.as_millis() as u64,
            ping_interval_ms: PING_INTERVAL.as_millis() as u64,
            reconnect_interval_ms: RECONNECT_INTERVAL.as_millis() as u64,
            tick_interval_ms: NORMAL_WAIT.as_millis() as u64,
        }
    }
}

impl RouterConfig {
    /// Configuration for a server called `name` reachable on `address`
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            ..Default::default()
        }
    }

    pub fn with_parent(mut self, address: impl Into<String>) -> Self {
        self.parent = Some(address.into());
        self
    }

    pub fn with_shortcut(mut self, shortcut: ShortcutConfig) -> Self {
        self.shortcuts.push(shortcut);
        self
    }

    /// Check every name and address before anything is started
    pub fn validate(&self) -> Result<()> {
        let identity = self.identity()?;

        if let Some(parent) = &self.parent {
            validate_address(parent).map_err(RouterError::from_core)?;
            if identity.name.parent().is_none() {
                return Err(RouterError::Config(format!(
                    "{} is a root server and cannot have a parent",
                    identity.name
                )));
            }
        }

        for shortcut in &self.shortcuts {
            let shortcut = shortcut.to_shortcut()?;
            if shortcut.destination == identity.name {
                return Err(RouterError::Config(format!(
                    "{} has a shortcut to itself",
                    identity.name
                )));
            }
        }

        if self.tick_interval_ms == 0 {
            return Err(RouterError::Config("tick interval must be positive".into()));
        }

        Ok(())
    }

    pub fn identity(&self) -> Result<ServerIdentity> {
        ServerIdentity::parse(&self.name, &self.address).map_err(RouterError::from_core)
    }

    pub fn route_wait(&self) -> Wait {
        Wait::from_millis(self.route_wait_ms)
    }

    pub fn reverse_route_wait(&self) -> Wait {
        Wait::from_millis(self.reverse_route_wait_ms)
    }

    pub fn ping_wait(&self) -> Wait {
        Wait::from_millis(self.ping_wait_ms)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}
