//! Listener slots and socket setup.

use socket2::{Domain, Socket, Type};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::watch;

use crate::{Protocol, Result, ServerError};

/// Slot index of the stream listener.
pub const STREAM: usize = 0;

/// Slot index of the datagram listener.
pub const PACKET: usize = 1;

/// Settings handed to a transport when it is installed.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Timeout for the first message on a connection.
    pub read_timeout: Duration,

    /// Timeout for writing a response.
    pub write_timeout: Duration,

    /// Timeout between messages on a connection.
    pub idle_timeout: Duration,

    /// TSIG key names mapped to their secrets.
    pub tsig_secrets: Arc<HashMap<String, String>>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(3),
            write_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(10),
            tsig_secrets: Arc::default(),
        }
    }
}

/// A running listener installed in one of the server's slots.
#[derive(Debug)]
pub struct ListenerSlot {
    protocol: Protocol,
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
}

impl ListenerSlot {
    /// Creates a slot and the receiver its transport watches for shutdown.
    pub fn new(protocol: Protocol, local_addr: SocketAddr) -> (Self, watch::Receiver<bool>) {
        let (shutdown, rx) = watch::channel(false);
        (
            Self {
                protocol,
                local_addr,
                shutdown,
            },
            rx,
        )
    }

    /// Returns the protocol.
    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Returns the address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Returns true once the listener has been shut down.
    pub fn is_shut_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Tells the transport to stop accepting work.
    pub fn shutdown(&self) -> Result<()> {
        if self.shutdown.send_replace(true) {
            return Err(ServerError::NotRunning(self.protocol));
        }
        Ok(())
    }
}

/// Binds a stream listener with address and port reuse.
pub fn bind_stream(addr: SocketAddr) -> Result<TcpListener> {
    let socket = Socket::new(domain_for(addr), Type::STREAM, None)?;

    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;

    socket.bind(&addr.into())?;
    socket.listen(1024)?;

    let std_listener: std::net::TcpListener = socket.into();
    Ok(TcpListener::from_std(std_listener)?)
}

/// Binds a datagram socket with address and port reuse.
pub fn bind_packet(addr: SocketAddr) -> Result<UdpSocket> {
    let socket = Socket::new(domain_for(addr), Type::DGRAM, None)?;

    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;

    socket.bind(&addr.into())?;

    let std_socket: std::net::UdpSocket = socket.into();
    Ok(UdpSocket::from_std(std_socket)?)
}

fn domain_for(addr: SocketAddr) -> Domain {
    if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    }
}
