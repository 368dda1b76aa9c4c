//! Test fixtures shared by the unit tests.

use async_trait::async_trait;
use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::{Name, RecordType};
use parking_lot::Mutex;
use sluice_metrics::Reporter;
use std::io;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::config::ServerOptions;
use crate::plugin::{next_or_failure, Handler, MetadataCollector, PluginError, Trace, Tracer, TracerHandle};
use crate::request::{reply_with_rcode, Request, RequestContext};
use crate::server::Server;
use crate::writer::ResponseWriter;
use crate::Protocol;

/// Builds a recursive query for `name`.
pub fn query(name: &str, qtype: RecordType) -> Message {
    let mut msg = Message::new();
    msg.set_id(4711)
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true);
    msg.add_query(Query::query(Name::from_str(name).unwrap(), qtype));
    msg
}

/// Returns a context for a server without zones.
pub fn test_context() -> RequestContext {
    let server = Server::new("dns://127.0.0.1:1053", vec![], &ServerOptions::default()).unwrap();
    RequestContext::new(Arc::new(server))
}

/// Writer that keeps every message written to it.
pub struct RecordingWriter {
    protocol: Protocol,
    messages: Vec<Message>,
}

impl RecordingWriter {
    pub fn udp() -> Self {
        Self {
            protocol: Protocol::Udp,
            messages: Vec::new(),
        }
    }

    pub fn tcp() -> Self {
        Self {
            protocol: Protocol::Tcp,
            messages: Vec::new(),
        }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }
}

#[async_trait]
impl ResponseWriter for RecordingWriter {
    async fn write_msg(&mut self, msg: &Message) -> io::Result<()> {
        self.messages.push(msg.clone());
        Ok(())
    }

    fn local_addr(&self) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 53))
    }

    fn remote_addr(&self) -> SocketAddr {
        SocketAddr::from(([192, 0, 2, 1], 40000))
    }

    fn protocol(&self) -> Protocol {
        self.protocol
    }
}

/// Reporter that remembers what it was told.
#[derive(Default)]
pub struct CountingReporter {
    dropped: Mutex<Vec<(String, String)>>,
    panics: AtomicUsize,
}

impl CountingReporter {
    /// Returns the `(qtype, rcode)` of every dropped transaction.
    pub fn dropped(&self) -> Vec<(String, String)> {
        self.dropped.lock().clone()
    }

    pub fn panics(&self) -> usize {
        self.panics.load(Ordering::SeqCst)
    }
}

impl Reporter for CountingReporter {
    fn report_dropped(&self, _server: &str, qtype: &str, rcode: &str, _size: usize) {
        self.dropped.lock().push((qtype.to_string(), rcode.to_string()));
    }

    fn report_panic(&self, _server: &str) {
        self.panics.fetch_add(1, Ordering::SeqCst);
    }
}

/// Plugin answering every query with NOERROR.
pub struct AnswerPlugin {
    name: String,
    hits: Arc<AtomicUsize>,
}

impl AnswerPlugin {
    pub fn counter() -> Arc<AtomicUsize> {
        Arc::new(AtomicUsize::new(0))
    }

    pub fn constructor(name: &str) -> impl Fn(Option<Arc<dyn Handler>>) -> Arc<dyn Handler> + Send + Sync {
        Self::counted(name, Self::counter())
    }

    pub fn counted(
        name: &str,
        hits: Arc<AtomicUsize>,
    ) -> impl Fn(Option<Arc<dyn Handler>>) -> Arc<dyn Handler> + Send + Sync {
        let name = name.to_string();
        move |_next: Option<Arc<dyn Handler>>| -> Arc<dyn Handler> {
            Arc::new(AnswerPlugin {
                name: name.clone(),
                hits: hits.clone(),
            })
        }
    }
}

#[async_trait]
impl Handler for AnswerPlugin {
    async fn serve(
        &self,
        _ctx: &mut RequestContext,
        w: &mut dyn ResponseWriter,
        req: &Message,
    ) -> Result<ResponseCode, PluginError> {
        self.hits.fetch_add(1, Ordering::SeqCst);
        let reply = reply_with_rcode(req, ResponseCode::NoError);
        w.write_msg(&reply)
            .await
            .map_err(|e| PluginError::new(&self.name, ResponseCode::ServFail, e))?;
        Ok(ResponseCode::NoError)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Plugin collecting one fixed metadata value and passing the query on.
pub struct MetadataPlugin {
    name: String,
    key: String,
    value: String,
    next: Option<Arc<dyn Handler>>,
}

impl MetadataPlugin {
    pub fn constructor(
        name: &str,
        key: &str,
        value: &str,
    ) -> impl Fn(Option<Arc<dyn Handler>>) -> Arc<dyn Handler> + Send + Sync {
        let (name, key, value) = (name.to_string(), key.to_string(), value.to_string());
        move |next: Option<Arc<dyn Handler>>| -> Arc<dyn Handler> {
            Arc::new(MetadataPlugin {
                name: name.clone(),
                key: key.clone(),
                value: value.clone(),
                next,
            })
        }
    }
}

#[async_trait]
impl Handler for MetadataPlugin {
    async fn serve(
        &self,
        ctx: &mut RequestContext,
        w: &mut dyn ResponseWriter,
        req: &Message,
    ) -> Result<ResponseCode, PluginError> {
        next_or_failure(&self.name, self.next.as_ref(), ctx, w, req).await
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn metadata_collector(&self) -> Option<&dyn MetadataCollector> {
        Some(self)
    }
}

impl MetadataCollector for MetadataPlugin {
    fn collect(&self, ctx: &mut RequestContext, _req: &Request<'_>) {
        ctx.set_metadata(self.key.clone(), self.value.clone());
    }
}

/// Plugin owning a tracer.
pub struct TracePlugin {
    name: String,
    next: Option<Arc<dyn Handler>>,
}

impl TracePlugin {
    pub fn constructor(name: &str) -> impl Fn(Option<Arc<dyn Handler>>) -> Arc<dyn Handler> + Send + Sync {
        let name = name.to_string();
        move |next: Option<Arc<dyn Handler>>| -> Arc<dyn Handler> {
            Arc::new(TracePlugin {
                name: name.clone(),
                next,
            })
        }
    }
}

#[async_trait]
impl Handler for TracePlugin {
    async fn serve(
        &self,
        ctx: &mut RequestContext,
        w: &mut dyn ResponseWriter,
        req: &Message,
    ) -> Result<ResponseCode, PluginError> {
        next_or_failure(&self.name, self.next.as_ref(), ctx, w, req).await
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn trace(&self) -> Option<&dyn Trace> {
        Some(self)
    }
}

impl Trace for TracePlugin {
    fn tracer(&self) -> Option<TracerHandle> {
        Some(Arc::new(TestTracer))
    }
}

struct TestTracer;

impl Tracer for TestTracer {
    fn service_name(&self) -> &str {
        "sluice"
    }
}

/// Plugin that panics on every query.
pub struct PanicPlugin;

#[async_trait]
impl Handler for PanicPlugin {
    async fn serve(
        &self,
        _ctx: &mut RequestContext,
        _w: &mut dyn ResponseWriter,
        _req: &Message,
    ) -> Result<ResponseCode, PluginError> {
        detonate()
    }

    fn name(&self) -> &str {
        "panic"
    }
}

/// Panic site kept as its own frame so backtraces can be checked for it.
#[inline(never)]
fn detonate() -> ! {
    panic!("plugin exploded");
}
