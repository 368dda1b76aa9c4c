//! Per-request state.

use hickory_proto::op::{Edns, Message, MessageType, Query, ResponseCode};
use hickory_proto::rr::{DNSClass, RecordType};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::server::Server;
use crate::writer::ResponseWriter;
use crate::Protocol;

/// Request-scoped values threaded through the whole dispatch path.
///
/// Every request gets a fresh context carrying the server that accepted it,
/// the loop-detection counter, the view selected by the matching zone config
/// and whatever metadata collectors attached.
#[derive(Clone)]
pub struct RequestContext {
    server: Arc<Server>,
    loop_count: u32,
    view: Option<String>,
    metadata: HashMap<String, String>,
}

impl RequestContext {
    /// Creates the context for a request accepted by `server`.
    pub fn new(server: Arc<Server>) -> Self {
        Self {
            server,
            loop_count: 0,
            view: None,
            metadata: HashMap::new(),
        }
    }

    /// Returns the server handling the request.
    pub fn server(&self) -> &Arc<Server> {
        &self.server
    }

    /// Returns how many times this request looped back into the server.
    pub fn loop_count(&self) -> u32 {
        self.loop_count
    }

    /// Increments the loop counter and returns the new value.
    pub fn increment_loop(&mut self) -> u32 {
        self.loop_count += 1;
        self.loop_count
    }

    /// Returns the view name set by the matching zone config.
    pub fn view(&self) -> Option<&str> {
        self.view.as_deref()
    }

    /// Sets the view name.
    pub fn set_view(&mut self, view: impl Into<String>) {
        self.view = Some(view.into());
    }

    /// Returns a metadata value.
    pub fn metadata(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    /// Sets a metadata value, replacing any previous one.
    pub fn set_metadata(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.metadata.insert(key.into(), value.into());
    }
}

/// A query together with the transport it arrived on.
#[derive(Debug, Clone, Copy)]
pub struct Request<'a> {
    msg: &'a Message,
    local: SocketAddr,
    remote: SocketAddr,
    protocol: Protocol,
}

impl<'a> Request<'a> {
    /// Creates a request view of `msg` as received through `w`.
    pub fn new(msg: &'a Message, w: &dyn ResponseWriter) -> Self {
        Self {
            msg,
            local: w.local_addr(),
            remote: w.remote_addr(),
            protocol: w.protocol(),
        }
    }

    /// Returns the query message.
    pub fn message(&self) -> &'a Message {
        self.msg
    }

    /// Returns the first question.
    pub fn query(&self) -> Option<&'a Query> {
        self.msg.queries().first()
    }

    /// Returns the lower-cased query name, or an empty string without a
    /// question.
    pub fn name(&self) -> String {
        self.query()
            .map(|q| q.name().to_ascii().to_ascii_lowercase())
            .unwrap_or_default()
    }

    /// Returns the query type.
    pub fn qtype(&self) -> Option<RecordType> {
        self.query().map(Query::query_type)
    }

    /// Returns the query class.
    pub fn qclass(&self) -> Option<DNSClass> {
        self.query().map(Query::query_class)
    }

    /// Returns the server address the query was received on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Returns the client address.
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    /// Returns the transport protocol.
    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Returns the largest response the client accepts.
    pub fn size(&self) -> usize {
        match self.protocol {
            Protocol::Udp => self.msg.max_payload() as usize,
            Protocol::Tcp => Protocol::Tcp.max_message_size(),
        }
    }

    /// Returns true if the client set the DNSSEC OK bit.
    pub fn do_bit(&self) -> bool {
        self.msg
            .extensions()
            .as_ref()
            .map_or(false, Edns::dnssec_ok)
    }

    /// Adds an OPT record mirroring the query's to `reply`.
    ///
    /// Returns false if the query had no OPT record, in which case the reply
    /// is left alone.
    pub fn size_and_do(&self, reply: &mut Message) -> bool {
        let Some(edns) = self.msg.extensions().as_ref() else {
            return false;
        };

        let mut opt = Edns::new();
        opt.set_version(0);
        opt.set_max_payload(edns.max_payload().max(Protocol::Udp.max_message_size() as u16));
        opt.set_dnssec_ok(edns.dnssec_ok());
        reply.set_edns(opt);
        true
    }
}

/// Builds a reply to `req` carrying `rcode` and the first question.
pub fn reply_with_rcode(req: &Message, rcode: ResponseCode) -> Message {
    let mut reply = Message::new();
    reply
        .set_id(req.id())
        .set_message_type(MessageType::Response)
        .set_op_code(req.op_code())
        .set_recursion_desired(req.recursion_desired())
        .set_checking_disabled(req.checking_disabled())
        .set_response_code(rcode);

    if let Some(query) = req.queries().first() {
        reply.add_query(query.clone());
    }
    reply
}

/// Returns the conventional mnemonic of a response code.
pub fn rcode_to_string(rcode: ResponseCode) -> String {
    let name = match rcode {
        ResponseCode::NoError => "NOERROR",
        ResponseCode::FormErr => "FORMERR",
        ResponseCode::ServFail => "SERVFAIL",
        ResponseCode::NXDomain => "NXDOMAIN",
        ResponseCode::NotImp => "NOTIMP",
        ResponseCode::Refused => "REFUSED",
        ResponseCode::YXDomain => "YXDOMAIN",
        ResponseCode::YXRRSet => "YXRRSET",
        ResponseCode::NXRRSet => "NXRRSET",
        ResponseCode::NotAuth => "NOTAUTH",
        ResponseCode::NotZone => "NOTZONE",
        ResponseCode::BADVERS => "BADVERS",
        other => return format!("RCODE{}", u16::from(other)),
    };
    name.to_string()
}
