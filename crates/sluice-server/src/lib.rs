//! # Sluice DNS Server
//!
//! Request-dispatch core of a DNS server: zone routing, plugin chain
//! composition, panic-safe dispatch and graceful listener lifecycle.
//!
//! ## Architecture
//!
//! One [`Server`] exists per bound address. It is built from a list of
//! zone [`Config`]s and serves queries arriving on a stream listener, a
//! datagram socket, or both:
//!
//! - **Compiler**: each zone's plugin constructors are composed back to
//!   front into a single handler chain
//! - **Failure guard**: malformed queries, foreign classes and unsupported
//!   EDNS versions are answered before routing, and panics inside a chain
//!   become SERVFAIL responses
//! - **Multiplexer**: the query name is matched against the configured
//!   zones by longest suffix, with DS queries deferred to the parent zone
//! - **Lifecycle**: listeners live in two fixed slots and are drained with
//!   a bounded grace period on stop
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use sluice_server::{Config, Server, ServerOptions};
//!
//! # async fn run(zones: Vec<Config>) -> sluice_server::Result<()> {
//! let server = Arc::new(Server::new("dns://127.0.0.1:1053", zones, &ServerOptions::default())?);
//! let listener = server.listen_packet().await?;
//! server.on_startup_complete();
//! server.serve_packet(listener).await
//! # }
//! ```

use std::fmt;
use thiserror::Error;

mod chain;
pub mod config;
pub mod drain;
pub mod edns;
mod guard;
pub mod handler;
pub mod listener;
mod mux;
pub mod plugin;
pub mod request;
pub mod server;
pub mod tcp;
pub mod udp;
pub mod writer;

#[cfg(test)]
pub(crate) mod testing;

pub use config::{Config, ServerOptions};
pub use drain::{DrainCredit, DrainGroup};
pub use handler::QueryHandler;
pub use plugin::{
    client_write, next_or_failure, FilterFn, Handler, MetadataCollector, Plugin, PluginError,
    Trace, Tracer, TracerHandle,
};
pub use request::{Request, RequestContext};
pub use server::Server;
pub use tcp::TcpServer;
pub use udp::UdpServer;
pub use writer::{ResponseWriter, ScrubWriter};

/// Server error types.
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid zone {zone:?}: {message}")]
    InvalidZone { zone: String, message: String },

    #[error("Invalid listen address: {0}")]
    InvalidAddress(String),

    #[error("Configuration error: {0}")]
    Config(#[from] serde_yaml::Error),

    #[error("{0} server is not running")]
    NotRunning(Protocol),
}

/// Result type for server operations.
pub type Result<T> = std::result::Result<T, ServerError>;

/// DNS transport protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// Plain UDP.
    Udp,
    /// Plain TCP.
    Tcp,
}

impl Protocol {
    /// Returns the largest response the transport can carry without the
    /// client's cooperation.
    pub const fn max_message_size(&self) -> usize {
        match self {
            Protocol::Udp => 512,
            Protocol::Tcp => u16::MAX as usize,
        }
    }

    /// Returns the protocol name.
    pub const fn name(&self) -> &'static str {
        match self {
            Protocol::Udp => "UDP",
            Protocol::Tcp => "TCP",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}
