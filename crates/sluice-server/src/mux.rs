//! Zone resolution.
//!
//! The query name is matched against the configured zones by walking its
//! suffixes from the full name down to the root, so the longest matching
//! zone is found first. DS queries are the exception: the DS record lives
//! in the parent zone, so the walk keeps going and the match closest to the
//! root wins.

use hickory_proto::op::{Message, ResponseCode};
use hickory_proto::rr::RecordType;
use std::sync::Arc;
use tracing::{debug, trace};

use crate::config::Config;
use crate::plugin::{client_write, Handler};
use crate::request::{Request, RequestContext};
use crate::server::Server;
use crate::writer::ResponseWriter;

impl Server {
    pub(crate) async fn route(&self, mut ctx: RequestContext, w: &mut dyn ResponseWriter, req: &Message) {
        let request = Request::new(req, &*w);
        let mut qname = request.name();
        if !qname.ends_with('.') {
            qname.push('.');
        }
        let ds = request.qtype() == Some(RecordType::DS);

        let mut candidate: Option<&Arc<Config>> = None;
        for suffix in Suffixes::new(&qname) {
            let Some(sites) = self.zones.get(suffix) else {
                continue;
            };

            for site in sites {
                let Some(chain) = site.handler_chain() else {
                    trace!(server = %self.addr, zone = suffix, "Zone has no plugins");
                    self.error_and_report(w, req, ResponseCode::Refused).await;
                    return;
                };

                if let Some(collector) = site.metadata_collector() {
                    collector.collect(&mut ctx, &request);
                }

                if !site.passes_filters(&ctx, &request) {
                    continue;
                }

                if !ds {
                    if let Some(view) = &site.view_name {
                        ctx.set_view(view.clone());
                    }
                    self.dispatch(chain, &mut ctx, w, req).await;
                    return;
                }
                candidate = Some(site);
            }
        }

        if let Some(site) = candidate {
            if let Some(chain) = site.handler_chain() {
                if let Some(view) = &site.view_name {
                    ctx.set_view(view.clone());
                }
                self.dispatch(chain, &mut ctx, w, req).await;
                return;
            }
        }

        trace!(server = %self.addr, name = %qname, "No zone matched");
        self.error_and_report(w, req, ResponseCode::Refused).await;
    }

    async fn dispatch(
        &self,
        chain: &Arc<dyn Handler>,
        ctx: &mut RequestContext,
        w: &mut dyn ResponseWriter,
        req: &Message,
    ) {
        let rcode = match chain.serve(ctx, &mut *w, req).await {
            Ok(rcode) => rcode,
            Err(e) => {
                debug!(server = %self.addr, plugin = e.plugin(), error = %e, "Plugin error");
                e.rcode()
            }
        };

        if !client_write(rcode) {
            self.write_error(w, req, rcode).await;
        }
    }
}

/// Iterator over the suffixes of a fully qualified name, longest first,
/// ending with the root.
struct Suffixes<'a> {
    name: &'a str,
    offset: Option<usize>,
}

impl<'a> Suffixes<'a> {
    fn new(name: &'a str) -> Self {
        Self {
            name,
            offset: Some(0),
        }
    }
}

impl<'a> Iterator for Suffixes<'a> {
    type Item = &'a str;

    fn next(&mut self) -> Option<&'a str> {
        let offset = self.offset?;
        let suffix = &self.name[offset..];

        self.offset = if suffix == "." || suffix.is_empty() {
            None
        } else {
            Some(next_label(self.name, offset).unwrap_or(self.name.len() - 1))
        };
        Some(suffix)
    }
}

/// Returns the start of the label following the one at `start`.
///
/// Escaped dots do not end a label.
fn next_label(name: &str, start: usize) -> Option<usize> {
    let bytes = name.as_bytes();
    let mut i = start;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b'.' => return (i + 1 < bytes.len()).then_some(i + 1),
            _ => i += 1,
        }
    }
    None
}
