//! Socket plumbing between basalt processes: endpoint resolution, framed
//! connections and the per-process connection registry.

mod connection;
mod error;
mod host;
mod registry;

pub use connection::{Connection, Role};
pub use error::NetError;
pub use host::{Endpoint, HostResolver, UNRESOLVABLE};
pub use registry::ConnectionRegistry;
