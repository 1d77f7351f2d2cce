//! Turbine Router
//!
//! One server of the Turbine routing fabric:
//! - Keeps a [`RouteEndpoint`] per child, parent and shortcut peer
//! - Finds the cheapest path to any server it knows about
//! - Forwards [`turbine_core::RoutedMessage`]s hop by hop and carries the
//!   answer back
//! - Negotiates reverse routes so one-way links become duplex
//! - Exchanges shortcut tables with its peers
//!
//! The router is transport-agnostic: it accepts connections from any
//! [`turbine_transport::TransportServer`] and dials through any
//! [`turbine_transport::Connector`].
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use turbine_router::{NullHandler, Router, RouterConfig};
//! use turbine_transport::MemoryNetwork;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let network = MemoryNetwork::new();
//!     let root = Router::new(
//!         RouterConfig::new("/plant", "mem:plant"),
//!         Arc::new(network.connector()),
//!         Arc::new(NullHandler),
//!     )?;
//!
//!     let server = network.bind("mem:plant")?;
//!     root.serve_on(server).await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod endpoint;
pub mod error;
pub mod link;
pub mod reverse;
pub mod router;
pub mod shortcuts;
pub mod topology;

pub use config::{RouterConfig, ShortcutConfig};
pub use endpoint::{EndpointKind, EndpointState, RouteEndpoint, RouteState};
pub use error::{Result, RouterError};
pub use link::{Direction, Link, LinkId};
pub use reverse::ReverseRouteNegotiator;
pub use router::{LocalHandler, NullHandler, Router};
pub use shortcuts::{PeerRecord, ShortcutRegistry};
pub use topology::TopologyManager;
