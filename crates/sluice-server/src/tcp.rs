//! TCP server implementation.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use hickory_proto::op::Message;
use sluice_metrics::QueryTimer;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, error, info, trace};

use crate::drain::{DrainCredit, DrainGroup};
use crate::handler::QueryHandler;
use crate::listener::TransportConfig;
use crate::writer::ResponseWriter;
use crate::{Protocol, Result};

/// Connection ID counter.
static CONNECTION_ID: AtomicU64 = AtomicU64::new(0);

/// TCP DNS server.
pub struct TcpServer {
    listener: TcpListener,
    handler: Arc<dyn QueryHandler>,
    local_addr: SocketAddr,
    config: TransportConfig,
    drain: DrainGroup,
    shutdown: watch::Receiver<bool>,
}

impl TcpServer {
    /// Creates a server on an already bound listener.
    pub fn new(
        listener: TcpListener,
        handler: Arc<dyn QueryHandler>,
        config: TransportConfig,
        drain: DrainGroup,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self> {
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
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

    /// Runs the TCP server until it is shut down.
    pub async fn run(mut self) -> Result<()> {
        info!(addr = %self.local_addr, "TCP server listening");

        // Connections watch their own receiver; `self.shutdown` stays borrowed by the select.
        let conn_shutdown = self.shutdown.clone();
        loop {
            tokio::select! {
                _ = self.shutdown.wait_for(|stopped| *stopped) => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let conn = Connection {
                            stream,
                            local: self.local_addr,
                            peer,
                            id: CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
                            handler: self.handler.clone(),
                            config: self.config.clone(),
                            shutdown: conn_shutdown.clone(),
                            _credit: self.drain.acquire(),
                        };
                        tokio::spawn(conn.serve());
                    }
                    Err(e) => {
                        error!(error = %e, "Error accepting TCP connection");
                    }
                },
            }
        }

        info!(addr = %self.local_addr, "TCP server stopped");
        Ok(())
    }
}

struct Connection {
    stream: TcpStream,
    local: SocketAddr,
    peer: SocketAddr,
    id: u64,
    handler: Arc<dyn QueryHandler>,
    config: TransportConfig,
    shutdown: watch::Receiver<bool>,
    _credit: DrainCredit,
}

impl Connection {
    async fn serve(mut self) {
        trace!(client = %self.peer, conn_id = self.id, "New TCP connection");

        let mut buf = BytesMut::with_capacity(4096);
        let mut wait = self.config.read_timeout;

        loop {
            if *self.shutdown.borrow() {
                trace!(client = %self.peer, conn_id = self.id, "Closing TCP connection on shutdown");
                break;
            }

            let read = tokio::select! {
                _ = self.shutdown.wait_for(|stopped| *stopped) => break,
                read = timeout(wait, read_message(&mut self.stream, &mut buf)) => read,
            };

            match read {
                Ok(Ok(data)) => {
                    wait = self.config.idle_timeout;

                    let query = match Message::from_vec(&data) {
                        Ok(msg) => msg,
                        Err(e) => {
                            trace!(error = %e, client = %self.peer, "Failed to parse TCP query");
                            continue;
                        }
                    };

                    let timer = QueryTimer::start(Protocol::Tcp.name());
                    let mut writer = TcpResponseWriter {
                        stream: &mut self.stream,
                        local: self.local,
                        peer: self.peer,
                        write_timeout: self.config.write_timeout,
                    };
                    self.handler.handle(&mut writer, query).await;
                    timer.finish();
                }
                Ok(Err(e)) => {
                    if e.kind() == io::ErrorKind::UnexpectedEof {
                        trace!(client = %self.peer, conn_id = self.id, "TCP connection closed by client");
                    } else {
                        debug!(error = %e, client = %self.peer, "TCP read error");
                    }
                    break;
                }
                Err(_) => {
                    trace!(client = %self.peer, conn_id = self.id, "TCP connection idle timeout");
                    break;
                }
            }
        }
    }
}

/// Writes length-prefixed responses to a TCP connection.
pub struct TcpResponseWriter<'a> {
    stream: &'a mut TcpStream,
    local: SocketAddr,
    peer: SocketAddr,
    write_timeout: Duration,
}

#[async_trait]
impl ResponseWriter for TcpResponseWriter<'_> {
    async fn write_msg(&mut self, msg: &Message) -> io::Result<()> {
        let wire = msg.to_vec().map_err(io::Error::other)?;
        match timeout(self.write_timeout, write_message(self.stream, &wire)).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "TCP write timed out")),
        }
    }

    fn local_addr(&self) -> SocketAddr {
        self.local
    }

    fn remote_addr(&self) -> SocketAddr {
        self.peer
    }

    fn protocol(&self) -> Protocol {
        Protocol::Tcp
    }
}

/// Reads a DNS message from a TCP stream.
async fn read_message(stream: &mut TcpStream, buf: &mut BytesMut) -> io::Result<Bytes> {
    let mut len_buf = [0u8; 2];
    stream.read_exact(&mut len_buf).await?;
    let len = u16::from_be_bytes(len_buf) as usize;

    if len == 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "Invalid TCP message length",
        ));
    }

    buf.clear();
    buf.resize(len, 0);
    stream.read_exact(buf).await?;

    Ok(buf.split().freeze())
}

/// Writes a DNS message to a TCP stream.
async fn write_message(stream: &mut TcpStream, data: &[u8]) -> io::Result<()> {
    let len = u16::try_from(data.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "DNS message too large"))?;
    stream.write_all(&len.to_be_bytes()).await?;
    stream.write_all(data).await?;
    stream.flush().await
}
