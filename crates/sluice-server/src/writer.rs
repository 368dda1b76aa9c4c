//! Response writers.

use async_trait::async_trait;
use hickory_proto::op::Message;
use std::io;
use std::net::SocketAddr;

use crate::request::Request;
use crate::Protocol;

/// Destination for the response to one query.
///
/// Transports hand a writer to the server for every query they receive.
#[async_trait]
pub trait ResponseWriter: Send {
    /// Sends a response message to the client.
    async fn write_msg(&mut self, msg: &Message) -> io::Result<()>;

    /// Returns the local address the query was received on.
    fn local_addr(&self) -> SocketAddr;

    /// Returns the client address.
    fn remote_addr(&self) -> SocketAddr;

    /// Returns the transport protocol.
    fn protocol(&self) -> Protocol;
}

/// Writer that makes every response fit the client's limit.
///
/// Oversized responses lose their additional records first; if that is not
/// enough, all records are removed and the TC bit is set so the client
/// retries over TCP.
pub struct ScrubWriter<'a> {
    inner: &'a mut dyn ResponseWriter,
    max_size: usize,
}

impl<'a> ScrubWriter<'a> {
    /// Wraps `inner`, sizing responses for the query `req`.
    pub fn new(req: &Message, inner: &'a mut dyn ResponseWriter) -> Self {
        let max_size = Request::new(req, &*inner).size();
        Self { inner, max_size }
    }

    /// Returns the size limit applied to responses.
    pub fn max_size(&self) -> usize {
        self.max_size
    }
}

#[async_trait]
impl ResponseWriter for ScrubWriter<'_> {
    async fn write_msg(&mut self, msg: &Message) -> io::Result<()> {
        if encoded_len(msg)? <= self.max_size {
            return self.inner.write_msg(msg).await;
        }

        let scrubbed = truncate_to(msg, self.max_size)?;
        self.inner.write_msg(&scrubbed).await
    }

    fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr()
    }

    fn remote_addr(&self) -> SocketAddr {
        self.inner.remote_addr()
    }

    fn protocol(&self) -> Protocol {
        self.inner.protocol()
    }
}

/// Shrinks `msg` to at most `max_size` octets on the wire.
pub fn truncate_to(msg: &Message, max_size: usize) -> io::Result<Message> {
    let mut reply = msg.clone();
    reply.take_additionals();
    if encoded_len(&reply)? <= max_size {
        return Ok(reply);
    }

    let mut reply = Message::new();
    reply.set_header(*msg.header());
    reply.add_queries(msg.queries().iter().cloned());
    if let Some(edns) = msg.extensions().clone() {
        reply.set_edns(edns);
    }
    reply.set_truncated(true);
    Ok(reply)
}

fn encoded_len(msg: &Message) -> io::Result<usize> {
    msg.to_vec().map(|wire| wire.len()).map_err(io::Error::other)
}
