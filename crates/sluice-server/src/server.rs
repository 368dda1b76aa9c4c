//! Server construction and listener lifecycle.

use async_trait::async_trait;
use hickory_proto::op::Message;
use parking_lot::Mutex;
use sluice_metrics::{GlobalReporter, Reporter};
use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::chain::{compile, Bookmarks};
use crate::config::{normalize_zone, Config, ServerOptions};
use crate::drain::DrainGroup;
use crate::handler::QueryHandler;
use crate::listener::{bind_packet, bind_stream, ListenerSlot, TransportConfig, PACKET, STREAM};
use crate::plugin::{Handler, TracerHandle};
use crate::request::RequestContext;
use crate::tcp::TcpServer;
use crate::udp::UdpServer;
use crate::writer::ResponseWriter;
use crate::{Protocol, Result, ServerError};

/// DNS server for one listen address.
///
/// The server owns the compiled zone configs served on its address and the
/// two listener slots (stream and datagram) that feed it queries.
pub struct Server {
    pub(crate) addr: String,
    pub(crate) zones: HashMap<String, Vec<Arc<Config>>>,
    listeners: Mutex<[Option<ListenerSlot>; 2]>,
    drain: DrainGroup,

    grace_timeout: Duration,
    read_timeout: Duration,
    write_timeout: Duration,
    idle_timeout: Duration,

    trace: Option<Arc<dyn Handler>>,
    pub(crate) debug: bool,
    pub(crate) stacktrace: bool,
    pub(crate) class_chaos: bool,
    quiet: bool,
    tsig_secrets: Arc<HashMap<String, String>>,
    pub(crate) reporter: Arc<dyn Reporter>,
}

impl Server {
    /// Creates a server for `addr` serving the given zone configs.
    ///
    /// Every config's plugins are compiled into its handler chain. Configs
    /// for the same zone are consulted in the order given.
    pub fn new(addr: impl Into<String>, group: Vec<Config>, options: &ServerOptions) -> Result<Self> {
        let addr = addr.into();
        let mut zones: HashMap<String, Vec<Arc<Config>>> = HashMap::new();
        let mut bookmarks = Bookmarks::default();

        let mut read_timeout = None;
        let mut write_timeout = None;
        let mut idle_timeout = None;
        let mut debug = false;
        let mut stacktrace = false;
        let mut tsig_secrets = HashMap::new();

        for mut site in group {
            let zone = normalize_zone(&site.zone)?;
            site.zone.clone_from(&zone);

            debug |= site.debug;
            stacktrace = site.stacktrace;
            read_timeout = longest(read_timeout, site.read_timeout);
            write_timeout = longest(write_timeout, site.write_timeout);
            idle_timeout = longest(idle_timeout, site.idle_timeout);
            tsig_secrets.extend(
                site.tsig_secrets
                    .iter()
                    .map(|(name, secret)| (name.clone(), secret.clone())),
            );

            compile(&mut site, &options.chaos_plugins, &mut bookmarks);
            zones.entry(zone).or_default().push(Arc::new(site));
        }

        debug!(
            server = %addr,
            zones = zones.len(),
            class_chaos = bookmarks.class_chaos,
            "Compiled server"
        );

        Ok(Self {
            addr,
            zones,
            listeners: Mutex::new([None, None]),
            drain: DrainGroup::new(),
            grace_timeout: options.grace_timeout(),
            read_timeout: read_timeout.unwrap_or_else(|| options.read_timeout()),
            write_timeout: write_timeout.unwrap_or_else(|| options.write_timeout()),
            idle_timeout: idle_timeout.unwrap_or_else(|| options.idle_timeout()),
            trace: bookmarks.trace,
            debug,
            stacktrace,
            class_chaos: bookmarks.class_chaos,
            quiet: options.quiet,
            tsig_secrets: Arc::new(tsig_secrets),
            reporter: Arc::new(GlobalReporter),
        })
    }

    /// Replaces the metrics reporter.
    pub fn with_reporter(mut self, reporter: Arc<dyn Reporter>) -> Self {
        self.reporter = reporter;
        self
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Returns the listen address the server was created for.
    pub fn address(&self) -> &str {
        &self.addr
    }

    /// Returns the tracer of the tracing plugin, if one is configured and
    /// initialized.
    pub fn tracer(&self) -> Option<TracerHandle> {
        self.trace
            .as_deref()
            .and_then(|link| link.trace())
            .and_then(|trace| trace.tracer())
    }

    /// Returns the configs registered for `zone`, in registration order.
    pub fn configs(&self, zone: &str) -> Option<&[Arc<Config>]> {
        self.zones.get(zone).map(Vec::as_slice)
    }

    /// Returns the merged TSIG secrets of all zones.
    pub fn tsig_secrets(&self) -> &HashMap<String, String> {
        &self.tsig_secrets
    }

    /// Returns the effective read timeout.
    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    /// Returns the effective write timeout.
    pub fn write_timeout(&self) -> Duration {
        self.write_timeout
    }

    /// Returns the effective idle timeout.
    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    /// Returns the grace timeout applied by [`stop`](Self::stop).
    pub fn grace_timeout(&self) -> Duration {
        self.grace_timeout
    }

    /// Returns true if panic recovery is disabled.
    pub fn debug(&self) -> bool {
        self.debug
    }

    /// Returns true if recovered panics are logged with a backtrace.
    pub fn stacktrace(&self) -> bool {
        self.stacktrace
    }

    /// Returns true if query classes other than IN are admitted.
    pub fn class_chaos(&self) -> bool {
        self.class_chaos
    }

    /// Returns the number of outstanding drain credits.
    pub fn in_flight(&self) -> usize {
        self.drain.in_flight()
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Binds a stream listener for the server's address.
    pub async fn listen(&self) -> Result<TcpListener> {
        bind_stream(self.socket_addr()?)
    }

    /// Binds a datagram socket for the server's address.
    pub async fn listen_packet(&self) -> Result<UdpSocket> {
        bind_packet(self.socket_addr()?)
    }

    /// Serves queries arriving on `listener` until the server is stopped.
    pub async fn serve_stream(self: &Arc<Self>, listener: TcpListener) -> Result<()> {
        self.stream_server(listener)?.run().await
    }

    /// Serves queries arriving on `socket` until the server is stopped.
    pub async fn serve_packet(self: &Arc<Self>, socket: UdpSocket) -> Result<()> {
        self.packet_server(socket)?.run().await
    }

    /// Stops the server.
    ///
    /// Waits for in-flight requests to finish, at most for the grace
    /// timeout, then shuts down both listeners. Returns the last error
    /// raised while shutting them down.
    pub async fn stop(&self) -> Result<()> {
        self.drain_in_flight().await;

        let slots = self.listeners.lock();
        let mut result = Ok(());
        for slot in slots.iter().flatten() {
            if let Err(e) = slot.shutdown() {
                debug!(
                    server = %self.addr,
                    protocol = %slot.protocol(),
                    addr = %slot.local_addr(),
                    error = %e,
                    "Listener shutdown failed"
                );
                result = Err(e);
            }
        }

        info!(server = %self.addr, "Server stopped");
        result
    }

    #[cfg(not(windows))]
    async fn drain_in_flight(&self) {
        if !self.drain.release_barrier() {
            return;
        }
        if tokio::time::timeout(self.grace_timeout, self.drain.wait())
            .await
            .is_err()
        {
            warn!(
                server = %self.addr,
                in_flight = self.drain.in_flight(),
                grace_timeout = ?self.grace_timeout,
                "Grace timeout expired with requests in flight"
            );
        }
    }

    #[cfg(windows)]
    async fn drain_in_flight(&self) {}

    /// Prints the startup summary unless the server is quiet.
    pub fn on_startup_complete(&self) {
        if self.quiet {
            return;
        }
        print!("{}", self.startup_summary());
    }

    /// Lists the served zones, one per line, sorted.
    ///
    /// Lines read `zone:port`, or `zone:port on ip` when the address names
    /// a host.
    pub fn startup_summary(&self) -> String {
        let mut zones: Vec<&str> = self.zones.keys().map(String::as_str).collect();
        zones.sort_unstable();

        let mut out = String::new();
        for zone in zones {
            match split_host_port(&self.addr) {
                Some((host, port)) if host.is_empty() => {
                    out.push_str(&format!("{zone}:{port}\n"));
                }
                Some((host, port)) => {
                    out.push_str(&format!("{zone}:{port} on {host}\n"));
                }
                None => {
                    out.push_str(&format!("{zone}:{}\n", self.addr));
                }
            }
        }
        out
    }

    fn stream_server(self: &Arc<Self>, listener: TcpListener) -> Result<TcpServer> {
        let local = listener.local_addr()?;
        let shutdown = self.install(STREAM, Protocol::Tcp, local);
        TcpServer::new(
            listener,
            self.query_handler(),
            self.transport_config(),
            self.drain.clone(),
            shutdown,
        )
    }

    fn packet_server(self: &Arc<Self>, socket: UdpSocket) -> Result<UdpServer> {
        let local = socket.local_addr()?;
        let shutdown = self.install(PACKET, Protocol::Udp, local);
        UdpServer::new(
            socket,
            self.query_handler(),
            self.transport_config(),
            self.drain.clone(),
            shutdown,
        )
    }

    fn install(&self, index: usize, protocol: Protocol, local: SocketAddr) -> watch::Receiver<bool> {
        let (slot, shutdown) = ListenerSlot::new(protocol, local);
        let mut slots = self.listeners.lock();
        if let Some(previous) = slots[index].replace(slot) {
            if let Err(e) = previous.shutdown() {
                debug!(
                    server = %self.addr,
                    protocol = %previous.protocol(),
                    addr = %previous.local_addr(),
                    error = %e,
                    "Replaced listener was already shut down"
                );
            }
        }
        shutdown
    }

    fn query_handler(self: &Arc<Self>) -> Arc<dyn QueryHandler> {
        Arc::new(ServerHandler {
            server: self.clone(),
        })
    }

    fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            read_timeout: self.read_timeout,
            write_timeout: self.write_timeout,
            idle_timeout: self.idle_timeout,
            tsig_secrets: self.tsig_secrets.clone(),
        }
    }

    fn socket_addr(&self) -> Result<SocketAddr> {
        let invalid = || ServerError::InvalidAddress(self.addr.clone());
        let (host, port) = split_host_port(&self.addr).ok_or_else(invalid)?;
        let port: u16 = port.parse().map_err(|_| invalid())?;
        let ip: IpAddr = if host.is_empty() {
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        } else {
            host.parse().map_err(|_| invalid())?
        };
        Ok(SocketAddr::new(ip, port))
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut zones: Vec<&String> = self.zones.keys().collect();
        zones.sort_unstable();
        f.debug_struct("Server")
            .field("addr", &self.addr)
            .field("zones", &zones)
            .field("debug", &self.debug)
            .field("class_chaos", &self.class_chaos)
            .finish_non_exhaustive()
    }
}

/// Adapts the server to the transports.
struct ServerHandler {
    server: Arc<Server>,
}

#[async_trait]
impl QueryHandler for ServerHandler {
    async fn handle(&self, writer: &mut dyn ResponseWriter, query: Message) {
        let ctx = RequestContext::new(self.server.clone());
        self.server.serve_dns(ctx, writer, &query).await;
    }
}

fn longest(current: Option<Duration>, candidate: Option<Duration>) -> Option<Duration> {
    match (current, candidate) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    }
}

/// Splits `dns://host:port`, `host:port`, `[v6]:port` or `:port` into host
/// and port.
fn split_host_port(addr: &str) -> Option<(&str, &str)> {
    let hostport = addr.split_once("://").map_or(addr, |(_, rest)| rest);
    let (host, port) = hostport.rsplit_once(':')?;
    if port.is_empty() {
        return None;
    }
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    Some((host, port))
}
