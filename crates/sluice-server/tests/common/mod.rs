//! Shared helpers for the integration tests.

#![allow(dead_code)]

use std::io;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::rdata::TXT;
use hickory_proto::rr::{Name, RData, Record, RecordType};
use parking_lot::Mutex;
use tokio::sync::Notify;

use sluice_metrics::tracing_setup::{init_tracing, LogConfig};
use sluice_metrics::Reporter;
use sluice_server::request::reply_with_rcode;
use sluice_server::{
    next_or_failure, Config, Handler, MetadataCollector, PluginError, Protocol, Request,
    RequestContext, ResponseWriter, Server, ServerOptions,
};

// ============================================================================
// Setup
// ============================================================================

pub fn init() {
    let _ = init_tracing(&LogConfig::default());
}

pub fn query(name: &str, qtype: RecordType) -> Message {
    let mut msg = Message::new();
    msg.set_id(0xbeef)
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true);
    msg.add_query(Query::query(Name::from_str(name).unwrap(), qtype));
    msg
}

pub fn quiet_options() -> ServerOptions {
    ServerOptions {
        quiet: true,
        ..ServerOptions::default()
    }
}

pub fn build(configs: Vec<Config>) -> (Arc<Server>, Arc<CountingReporter>) {
    let reporter = Arc::new(CountingReporter::default());
    let server = Server::new("dns://127.0.0.1:0", configs, &quiet_options())
        .unwrap()
        .with_reporter(reporter.clone());
    (Arc::new(server), reporter)
}

/// Serves `req` through the guarded entry point and returns what was
/// written.
pub async fn ask(server: &Arc<Server>, req: &Message) -> Vec<Message> {
    let mut w = RecordingWriter::default();
    server
        .serve_dns(RequestContext::new(server.clone()), &mut w, req)
        .await;
    w.messages
}

/// Returns the text of the first TXT answer.
pub fn answer_text(msg: &Message) -> Option<String> {
    msg.answers().iter().find_map(|record| match record.data() {
        Some(RData::TXT(txt)) => Some(
            txt.txt_data()
                .iter()
                .map(|part| String::from_utf8_lossy(part).into_owned())
                .collect::<Vec<_>>()
                .join(""),
        ),
        _ => None,
    })
}

// ============================================================================
// Writer and reporter
// ============================================================================

#[derive(Default)]
pub struct RecordingWriter {
    pub messages: Vec<Message>,
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
        SocketAddr::from(([198, 51, 100, 7], 53000))
    }

    fn protocol(&self) -> Protocol {
        Protocol::Udp
    }
}

#[derive(Default)]
pub struct CountingReporter {
    dropped: Mutex<Vec<(String, String)>>,
    panics: AtomicUsize,
}

impl CountingReporter {
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

// ============================================================================
// Plugins
// ============================================================================

/// Answers with a TXT record naming the chain, and records the view and
/// metadata it saw.
pub struct Echo {
    label: String,
    hits: Arc<AtomicUsize>,
    seen: Arc<Mutex<Vec<(Option<String>, Option<String>)>>>,
}

#[derive(Clone, Default)]
pub struct EchoProbe {
    pub hits: Arc<AtomicUsize>,
    pub seen: Arc<Mutex<Vec<(Option<String>, Option<String>)>>>,
}

impl EchoProbe {
    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    /// Returns `(view, metadata "source")` pairs seen per query.
    pub fn seen(&self) -> Vec<(Option<String>, Option<String>)> {
        self.seen.lock().clone()
    }
}

pub fn echo(label: &str) -> (impl Fn(Option<Arc<dyn Handler>>) -> Arc<dyn Handler> + Send + Sync, EchoProbe) {
    let probe = EchoProbe::default();
    let label = label.to_string();
    let shared = probe.clone();
    let constructor = move |_next: Option<Arc<dyn Handler>>| -> Arc<dyn Handler> {
        Arc::new(Echo {
            label: label.clone(),
            hits: shared.hits.clone(),
            seen: shared.seen.clone(),
        })
    };
    (constructor, probe)
}

#[async_trait]
impl Handler for Echo {
    async fn serve(
        &self,
        ctx: &mut RequestContext,
        w: &mut dyn ResponseWriter,
        req: &Message,
    ) -> Result<ResponseCode, PluginError> {
        self.hits.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().push((
            ctx.view().map(String::from),
            ctx.metadata("source").map(String::from),
        ));

        let mut reply = reply_with_rcode(req, ResponseCode::NoError);
        reply.set_authoritative(true);
        if let Some(q) = req.queries().first() {
            reply.add_answer(Record::from_rdata(
                q.name().clone(),
                60,
                RData::TXT(TXT::new(vec![self.label.clone()])),
            ));
        }
        w.write_msg(&reply)
            .await
            .map_err(|e| PluginError::new("echo", ResponseCode::ServFail, e))?;
        Ok(ResponseCode::NoError)
    }

    fn name(&self) -> &str {
        "echo"
    }
}

/// Returns a fixed code without writing anything.
pub fn silent(name: &'static str, rcode: ResponseCode) -> impl Fn(Option<Arc<dyn Handler>>) -> Arc<dyn Handler> + Send + Sync {
    move |_next: Option<Arc<dyn Handler>>| -> Arc<dyn Handler> { Arc::new(Silent { name, rcode }) }
}

pub struct Silent {
    name: &'static str,
    rcode: ResponseCode,
}

#[async_trait]
impl Handler for Silent {
    async fn serve(
        &self,
        _ctx: &mut RequestContext,
        _w: &mut dyn ResponseWriter,
        _req: &Message,
    ) -> Result<ResponseCode, PluginError> {
        Ok(self.rcode)
    }

    fn name(&self) -> &str {
        self.name
    }
}

/// Fails with a plugin error carrying `rcode`.
pub fn failing(rcode: ResponseCode) -> impl Fn(Option<Arc<dyn Handler>>) -> Arc<dyn Handler> + Send + Sync {
    move |_next: Option<Arc<dyn Handler>>| -> Arc<dyn Handler> { Arc::new(Failing { rcode }) }
}

pub struct Failing {
    rcode: ResponseCode,
}

#[async_trait]
impl Handler for Failing {
    async fn serve(
        &self,
        _ctx: &mut RequestContext,
        _w: &mut dyn ResponseWriter,
        _req: &Message,
    ) -> Result<ResponseCode, PluginError> {
        Err(PluginError::new("failing", self.rcode, "backend unavailable"))
    }

    fn name(&self) -> &str {
        "failing"
    }
}

/// Panics on every query.
pub fn exploding() -> impl Fn(Option<Arc<dyn Handler>>) -> Arc<dyn Handler> + Send + Sync {
    |_next: Option<Arc<dyn Handler>>| -> Arc<dyn Handler> { Arc::new(Exploding) }
}

pub struct Exploding;

#[async_trait]
impl Handler for Exploding {
    async fn serve(
        &self,
        _ctx: &mut RequestContext,
        _w: &mut dyn ResponseWriter,
        _req: &Message,
    ) -> Result<ResponseCode, PluginError> {
        panic!("exploding plugin");
    }

    fn name(&self) -> &str {
        "exploding"
    }
}

/// Collects metadata and passes the query on.
pub fn tagging(value: &str) -> impl Fn(Option<Arc<dyn Handler>>) -> Arc<dyn Handler> + Send + Sync {
    let value = value.to_string();
    move |next: Option<Arc<dyn Handler>>| -> Arc<dyn Handler> {
        Arc::new(Tagging {
            value: value.clone(),
            next,
        })
    }
}

pub struct Tagging {
    value: String,
    next: Option<Arc<dyn Handler>>,
}

#[async_trait]
impl Handler for Tagging {
    async fn serve(
        &self,
        ctx: &mut RequestContext,
        w: &mut dyn ResponseWriter,
        req: &Message,
    ) -> Result<ResponseCode, PluginError> {
        next_or_failure("tagging", self.next.as_ref(), ctx, w, req).await
    }

    fn name(&self) -> &str {
        "tagging"
    }

    fn metadata_collector(&self) -> Option<&dyn MetadataCollector> {
        Some(self)
    }
}

impl MetadataCollector for Tagging {
    fn collect(&self, ctx: &mut RequestContext, _req: &Request<'_>) {
        ctx.set_metadata("source", self.value.clone());
    }
}

/// Signals when a query arrives, then holds it for `delay`.
pub fn slow(entered: Arc<Notify>, delay: Duration) -> impl Fn(Option<Arc<dyn Handler>>) -> Arc<dyn Handler> + Send + Sync {
    move |_next: Option<Arc<dyn Handler>>| -> Arc<dyn Handler> {
        Arc::new(Slow {
            entered: entered.clone(),
            delay,
        })
    }
}

pub struct Slow {
    entered: Arc<Notify>,
    delay: Duration,
}

#[async_trait]
impl Handler for Slow {
    async fn serve(
        &self,
        _ctx: &mut RequestContext,
        w: &mut dyn ResponseWriter,
        req: &Message,
    ) -> Result<ResponseCode, PluginError> {
        self.entered.notify_one();
        tokio::time::sleep(self.delay).await;
        let _ = w.write_msg(&reply_with_rcode(req, ResponseCode::NoError)).await;
        Ok(ResponseCode::NoError)
    }

    fn name(&self) -> &str {
        "slow"
    }
}
