//! Server names and identities
//!
//! Server names are hierarchical and encode the tree they live in:
//! ```text
//! /plant
//! /plant/line1
//! /plant/line1/cell4
//! ```
//!
//! The parent of `/plant/line1/cell4` is `/plant/line1`. Addresses are either
//! `host:port` for TCP links or `mem:<name>` for the in-process transport.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{Error, Result};

/// Prefix of in-process transport addresses
pub const MEMORY_SCHEME: &str = "mem:";

/// A parsed hierarchical server name
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ServerName {
    raw: String,
}

impl ServerName {
    /// Parse a server name
    pub fn parse(s: &str) -> Result<Self> {
        if s.is_empty() {
            return Err(Error::InvalidName("empty name".to_string()));
        }

        if !s.starts_with('/') {
            return Err(Error::InvalidName(format!(
                "name must start with '/': {}",
                s
            )));
        }

        if s.len() == 1 {
            return Err(Error::InvalidName("name has no segments".to_string()));
        }

        for segment in s[1..].split('/') {
            if segment.is_empty() {
                return Err(Error::InvalidName(format!("empty segment in name: {}", s)));
            }
            if segment.chars().any(|c| c.is_whitespace()) {
                return Err(Error::InvalidName(format!(
                    "whitespace in segment '{}' of {}",
                    segment, s
                )));
            }
        }

        Ok(Self { raw: s.to_string() })
    }

    /// Get the raw name string
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Iterate over the name segments
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.raw[1..].split('/')
    }

    /// Number of segments; a root server has depth 1
    pub fn depth(&self) -> usize {
        self.segments().count()
    }

    /// The last segment
    pub fn leaf(&self) -> &str {
        match self.raw.rfind('/') {
            Some(idx) => &self.raw[idx + 1..],
            None => &self.raw,
        }
    }

    /// The enclosing server, if this is not a root
    pub fn parent(&self) -> Option<ServerName> {
        let idx = self.raw.rfind('/')?;
        if idx == 0 {
            return None;
        }
        Some(Self {
            raw: self.raw[..idx].to_string(),
        })
    }

    /// Name of a direct child of this server
    pub fn child(&self, segment: &str) -> Result<ServerName> {
        ServerName::parse(&format!("{}/{}", self.raw, segment))
    }

    /// Whether `other` lives strictly below this server
    pub fn is_ancestor_of(&self, other: &ServerName) -> bool {
        other.raw.len() > self.raw.len()
            && other.raw.starts_with(&self.raw)
            && other.raw.as_bytes()[self.raw.len()] == b'/'
    }

    /// Whether the two names belong to the same tree
    pub fn shares_root_with(&self, other: &ServerName) -> bool {
        self.segments().next() == other.segments().next()
    }

    /// The deepest server that is this one or an ancestor of both names
    pub fn common_ancestor(&self, other: &ServerName) -> Option<ServerName> {
        let mut raw = String::new();
        for (mine, theirs) in self.segments().zip(other.segments()) {
            if mine != theirs {
                break;
            }
            raw.push('/');
            raw.push_str(mine);
        }
        if raw.is_empty() {
            None
        } else {
            Some(Self { raw })
        }
    }

    /// Names walked through going down from this server to `descendant`,
    /// excluding self and including `descendant`. Empty if `descendant` is
    /// not below this server.
    pub fn lineage_to(&self, descendant: &ServerName) -> Vec<ServerName> {
        if !self.is_ancestor_of(descendant) {
            return Vec::new();
        }
        let mut lineage = Vec::new();
        let mut current = self.raw.clone();
        for segment in descendant.raw[self.raw.len() + 1..].split('/') {
            current.push('/');
            current.push_str(segment);
            lineage.push(Self {
                raw: current.clone(),
            });
        }
        lineage
    }
}

impl fmt::Display for ServerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.raw)
    }
}

impl TryFrom<&str> for ServerName {
    type Error = Error;

    fn try_from(s: &str) -> Result<Self> {
        ServerName::parse(s)
    }
}

impl TryFrom<String> for ServerName {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        ServerName::parse(&s)
    }
}

impl From<ServerName> for String {
    fn from(name: ServerName) -> Self {
        name.raw
    }
}

impl std::str::FromStr for ServerName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        ServerName::parse(s)
    }
}

/// Validate a transport address without resolving it
pub fn validate_address(address: &str) -> Result<()> {
    if let Some(name) = address.strip_prefix(MEMORY_SCHEME) {
        if name.is_empty() {
            return Err(Error::InvalidAddress(format!(
                "memory address has no name: {}",
                address
            )));
        }
        return Ok(());
    }

    let (host, port) = address
        .rsplit_once(':')
        .ok_or_else(|| Error::InvalidAddress(format!("missing port: {}", address)))?;

    if host.is_empty() {
        return Err(Error::InvalidAddress(format!("missing host: {}", address)));
    }

    port.parse::<u16>()
        .map_err(|_| Error::InvalidAddress(format!("bad port '{}' in {}", port, address)))?;

    Ok(())
}

/// A server's name plus the address it accepts connections on
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServerIdentity {
    pub name: ServerName,
    pub address: String,
}

impl ServerIdentity {
    /// Build an identity, validating the address
    pub fn new(name: ServerName, address: impl Into<String>) -> Result<Self> {
        let address = address.into();
        validate_address(&address)?;
        Ok(Self { name, address })
    }

    /// Parse both the name and the address
    pub fn parse(name: &str, address: &str) -> Result<Self> {
        Self::new(ServerName::parse(name)?, address)
    }
}

impl fmt::Display for ServerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} @ {}", self.name, self.address)
    }
}
