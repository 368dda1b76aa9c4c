//! Plugin contract.
//!
//! A zone's plugins are composed into a chain of [`Handler`]s. Each link
//! receives the rest of the chain when it is constructed and decides for
//! itself whether to call it. Besides serving queries a link may expose
//! optional capabilities, which the compiler probes once at construction
//! time:
//!
//! - [`MetadataCollector`]: enriches the request context before the zone's
//!   filters run
//! - [`Trace`]: provides the server-wide tracer

use async_trait::async_trait;
use hickory_proto::op::{Message, ResponseCode};
use std::error::Error as StdError;
use std::sync::Arc;
use thiserror::Error;

use crate::request::{Request, RequestContext};
use crate::writer::ResponseWriter;

/// A link in a zone's handler chain.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Serves a query.
    ///
    /// The returned code tells the server whether the handler already wrote
    /// a response; see [`client_write`]. On error the code carried by the
    /// [`PluginError`] is used the same way.
    async fn serve(
        &self,
        ctx: &mut RequestContext,
        w: &mut dyn ResponseWriter,
        req: &Message,
    ) -> Result<ResponseCode, PluginError>;

    /// Returns the plugin name.
    fn name(&self) -> &str;

    /// Returns the metadata capability of this link, if it has one.
    fn metadata_collector(&self) -> Option<&dyn MetadataCollector> {
        None
    }

    /// Returns the tracing capability of this link, if it has one.
    fn trace(&self) -> Option<&dyn Trace> {
        None
    }
}

/// Collects request metadata before a zone's filters are evaluated.
pub trait MetadataCollector: Send + Sync {
    /// Adds metadata for `req` to `ctx`.
    fn collect(&self, ctx: &mut RequestContext, req: &Request<'_>);
}

/// A plugin that owns the server's tracer.
///
/// The plugin is bookmarked at compile time; the tracer itself is only
/// asked for later, because it is usually set up at startup.
pub trait Trace: Send + Sync {
    /// Returns the tracer once it has been initialized.
    fn tracer(&self) -> Option<TracerHandle>;
}

/// Tracing backend handed to observability collaborators.
pub trait Tracer: Send + Sync {
    /// Returns the service name spans are reported under.
    fn service_name(&self) -> &str;
}

/// Shared handle to a [`Tracer`].
pub type TracerHandle = Arc<dyn Tracer>;

/// Plugin constructor: wraps the rest of the chain (if any) into a new link.
pub type Plugin = Box<dyn Fn(Option<Arc<dyn Handler>>) -> Arc<dyn Handler> + Send + Sync>;

/// Predicate deciding whether a zone config may serve a request.
pub type FilterFn = Arc<dyn Fn(&RequestContext, &Request<'_>) -> bool + Send + Sync>;

/// Error returned by a plugin, together with the response code it maps to.
#[derive(Error, Debug)]
#[error("{plugin}: {source}")]
pub struct PluginError {
    plugin: String,
    rcode: ResponseCode,
    source: Box<dyn StdError + Send + Sync>,
}

impl PluginError {
    /// Creates a new plugin error.
    pub fn new(
        plugin: impl Into<String>,
        rcode: ResponseCode,
        source: impl Into<Box<dyn StdError + Send + Sync>>,
    ) -> Self {
        Self {
            plugin: plugin.into(),
            rcode,
            source: source.into(),
        }
    }

    /// Returns the name of the failing plugin.
    pub fn plugin(&self) -> &str {
        &self.plugin
    }

    /// Returns the response code the failure maps to.
    pub fn rcode(&self) -> ResponseCode {
        self.rcode
    }
}

/// Returns true if a handler returning `rcode` has written a response to the
/// client itself.
///
/// SERVFAIL, REFUSED, FORMERR and NOTIMP mean nothing was written yet and the
/// server must answer on the chain's behalf.
pub fn client_write(rcode: ResponseCode) -> bool {
    !matches!(
        rcode,
        ResponseCode::ServFail | ResponseCode::Refused | ResponseCode::FormErr | ResponseCode::NotImp
    )
}

/// Calls the next handler in the chain, or fails with SERVFAIL if `name` is
/// the last link.
pub async fn next_or_failure(
    name: &str,
    next: Option<&Arc<dyn Handler>>,
    ctx: &mut RequestContext,
    w: &mut dyn ResponseWriter,
    req: &Message,
) -> Result<ResponseCode, PluginError> {
    match next {
        Some(next) => next.serve(ctx, w, req).await,
        None => Err(PluginError::new(
            name,
            ResponseCode::ServFail,
            "no next plugin found",
        )),
    }
}
