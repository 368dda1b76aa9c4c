//! Request admission and panic recovery.
//!
//! Every query passes through [`Server::serve_dns`] before it is routed.
//! Queries without a question, of a foreign class or with an unsupported
//! EDNS version are answered here. A panic in a handler chain is caught
//! and turned into a SERVFAIL response unless the server runs in debug
//! mode.

use futures::FutureExt;
use hickory_proto::op::{Message, ResponseCode};
use hickory_proto::rr::DNSClass;
use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::RefCell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Once;
use tracing::{debug, error};

use crate::edns::negotiate_version;
use crate::request::{rcode_to_string, reply_with_rcode, Request, RequestContext};
use crate::server::Server;
use crate::writer::{ResponseWriter, ScrubWriter};

impl Server {
    /// Serves one query received through `w`.
    ///
    /// This is the entry point for transports: the client always gets a
    /// response, even when the handler chain panics.
    pub async fn serve_dns(&self, ctx: RequestContext, w: &mut dyn ResponseWriter, req: &Message) {
        if req.queries().is_empty() {
            self.error_and_report(w, req, ResponseCode::ServFail).await;
            return;
        }

        if self.debug {
            self.admit(ctx, w, req).await;
            return;
        }

        if self.stacktrace {
            install_backtrace_hook();
            take_panic_backtrace();
        }

        let outcome = AssertUnwindSafe(self.admit(ctx, &mut *w, req))
            .catch_unwind()
            .await;

        if let Err(payload) = outcome {
            let message = panic_message(payload.as_ref());
            let backtrace = self.stacktrace.then(take_panic_backtrace).flatten();
            if let Some(backtrace) = backtrace {
                error!(
                    server = %self.addr,
                    client = %w.remote_addr(),
                    panic = %message,
                    backtrace = %backtrace,
                    "Recovered from panic in server"
                );
            } else {
                error!(
                    server = %self.addr,
                    client = %w.remote_addr(),
                    panic = %message,
                    "Recovered from panic in server"
                );
            }
            self.reporter.report_panic(&self.addr);
            self.error_and_report(w, req, ResponseCode::ServFail).await;
        }
    }

    async fn admit(&self, ctx: RequestContext, w: &mut dyn ResponseWriter, req: &Message) {
        let class = req.queries().first().map(|q| q.query_class());
        if class != Some(DNSClass::IN) && !self.class_chaos {
            self.error_and_report(w, req, ResponseCode::Refused).await;
            return;
        }

        if let Some(reply) = negotiate_version(req) {
            if let Err(e) = w.write_msg(&reply).await {
                debug!(server = %self.addr, client = %w.remote_addr(), error = %e, "Failed to write BADVERS response");
            }
            return;
        }

        let mut scrub = ScrubWriter::new(req, w);
        self.route(ctx, &mut scrub, req).await;
    }

    /// Answers `req` with `rcode` without reporting it.
    pub(crate) async fn write_error(&self, w: &mut dyn ResponseWriter, req: &Message, rcode: ResponseCode) {
        self.send_error(w, req, rcode).await;
    }

    /// Answers `req` with `rcode` and reports the transaction as dropped.
    pub(crate) async fn error_and_report(
        &self,
        w: &mut dyn ResponseWriter,
        req: &Message,
        rcode: ResponseCode,
    ) {
        let size = self.send_error(w, req, rcode).await;
        let qtype = Request::new(req, &*w)
            .qtype()
            .map(|qtype| qtype.to_string())
            .unwrap_or_default();
        self.reporter
            .report_dropped(&self.addr, &qtype, &rcode_to_string(rcode), size);
    }

    async fn send_error(&self, w: &mut dyn ResponseWriter, req: &Message, rcode: ResponseCode) -> usize {
        let mut reply = reply_with_rcode(req, rcode);
        Request::new(req, &*w).size_and_do(&mut reply);

        let size = reply.to_vec().map(|wire| wire.len()).unwrap_or_default();
        if let Err(e) = w.write_msg(&reply).await {
            debug!(server = %self.addr, client = %w.remote_addr(), error = %e, "Failed to write error response");
        }
        size
    }
}

// ============================================================================
// Panic backtraces
// ============================================================================

thread_local! {
    /// Backtrace of the last panic on this thread, taken at the panic site.
    static PANIC_BACKTRACE: RefCell<Option<Backtrace>> = const { RefCell::new(None) };
}

static BACKTRACE_HOOK: Once = Once::new();

/// Chains a panic hook that records the backtrace before unwinding starts.
///
/// The chain is polled on the thread that panics, so the recovery path
/// reads the slot on the same thread.
fn install_backtrace_hook() {
    BACKTRACE_HOOK.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            let _ = PANIC_BACKTRACE.try_with(|slot| slot.replace(Some(Backtrace::force_capture())));
            previous(info);
        }));
    });
}

fn take_panic_backtrace() -> Option<Backtrace> {
    PANIC_BACKTRACE.with(|slot| slot.borrow_mut().take())
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
