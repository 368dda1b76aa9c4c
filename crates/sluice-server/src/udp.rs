//! UDP server implementation.

use async_trait::async_trait;
use bytes::Bytes;
use hickory_proto::op::Message;
use sluice_metrics::QueryTimer;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, error, info, trace};

use crate::drain::{DrainCredit, DrainGroup};
use crate::handler::QueryHandler;
use crate::listener::TransportConfig;
use crate::writer::ResponseWriter;
use crate::{Protocol, Result};

/// UDP DNS server.
pub struct UdpServer {
    socket: Arc<UdpSocket>,
    handler: Arc<dyn QueryHandler>,
    local_addr: SocketAddr,
    config: TransportConfig,
    drain: DrainGroup,
    shutdown: watch::Receiver<bool>,
}

impl UdpServer {
    /// Creates a server on an already bound socket.
    pub fn new(
        socket: UdpSocket,
        handler: Arc<dyn QueryHandler>,
        config: TransportConfig,
        drain: DrainGroup,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self> {
        let local_addr = socket.local_addr()?;
        Ok(Self {
            socket: Arc::new(socket),
            handler,
            local_addr,
            config,
            drain,
            shutdown,
        })
    }

    /// Returns the local address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Returns the transport settings.
    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Runs the UDP server until it is shut down.
    pub async fn run(mut self) -> Result<()> {
        info!(addr = %self.local_addr, "UDP server listening");
        let mut buf = vec![0u8; Protocol::Tcp.max_message_size()];

        loop {
            tokio::select! {
                _ = self.shutdown.wait_for(|stopped| *stopped) => break,
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok((len, src)) => {
                        let data = Bytes::copy_from_slice(&buf[..len]);
                        let credit = self.drain.acquire();
                        let socket = self.socket.clone();
                        let handler = self.handler.clone();
                        let local = self.local_addr;

                        tokio::spawn(async move {
                            process_query(socket, handler, data, local, src, credit).await;
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "Error receiving UDP packet");
                    }
                },
            }
        }

        info!(addr = %self.local_addr, "UDP server stopped");
        Ok(())
    }
}

async fn process_query(
    socket: Arc<UdpSocket>,
    handler: Arc<dyn QueryHandler>,
    data: Bytes,
    local: SocketAddr,
    src: SocketAddr,
    _credit: DrainCredit,
) {
    let query = match Message::from_vec(&data) {
        Ok(msg) => msg,
        Err(e) => {
            trace!(error = %e, client = %src, "Failed to parse DNS query");
            return;
        }
    };

    let timer = QueryTimer::start(Protocol::Udp.name());
    let mut writer = UdpResponseWriter {
        socket,
        local,
        peer: src,
    };
    handler.handle(&mut writer, query).await;
    timer.finish();
}

/// Writes responses back to the datagram's sender.
pub struct UdpResponseWriter {
    socket: Arc<UdpSocket>,
    local: SocketAddr,
    peer: SocketAddr,
}

#[async_trait]
impl ResponseWriter for UdpResponseWriter {
    async fn write_msg(&mut self, msg: &Message) -> io::Result<()> {
        let wire = msg.to_vec().map_err(io::Error::other)?;
        if let Err(e) = self.socket.send_to(&wire, self.peer).await {
            debug!(error = %e, client = %self.peer, "Error sending UDP response");
            return Err(e);
        }
        Ok(())
    }

    fn local_addr(&self) -> SocketAddr {
        self.local
    }

    fn remote_addr(&self) -> SocketAddr {
        self.peer
    }

    fn protocol(&self) -> Protocol {
        Protocol::Udp
    }
}
