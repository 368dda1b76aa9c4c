//! Zone and server configuration.
//!
//! A [`Config`] describes one zone block: the zone name, the plugin
//! constructors making up its handler chain, the filters guarding it and
//! the per-zone server settings. Configs are produced by a directive parser
//! outside this crate and handed to [`Server::new`](crate::Server::new),
//! which compiles them.
//!
//! [`ServerOptions`] carries the process-wide settings that are not tied to
//! a zone.

use hickory_proto::rr::Name;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::plugin::{FilterFn, Handler, MetadataCollector, Plugin};
use crate::request::{Request, RequestContext};
use crate::{Result, ServerError};

// =============================================================================
// Zone config
// =============================================================================

/// Configuration of one zone served on an address.
pub struct Config {
    /// Zone name, e.g. `example.org.`.
    pub zone: String,

    /// Plugin constructors in configuration order. The first one becomes
    /// the outermost link of the chain.
    pub plugins: Vec<Plugin>,

    /// Filters a request must pass before this config may serve it.
    pub filters: Vec<FilterFn>,

    /// View name attached to requests served by this config.
    pub view_name: Option<String>,

    /// Disables panic recovery.
    pub debug: bool,

    /// Logs a backtrace with recovered panics.
    pub stacktrace: bool,

    /// Timeout for the first message on a stream connection.
    pub read_timeout: Option<Duration>,

    /// Timeout for writing a response on a stream connection.
    pub write_timeout: Option<Duration>,

    /// Timeout between messages on a stream connection.
    pub idle_timeout: Option<Duration>,

    /// TSIG key names mapped to their secrets.
    pub tsig_secrets: HashMap<String, String>,

    pub(crate) handler_chain: Option<Arc<dyn Handler>>,
    pub(crate) metadata_collector: Option<Arc<dyn Handler>>,
    registry: HashMap<String, Arc<dyn Handler>>,
}

impl Config {
    /// Creates an empty config for `zone`.
    pub fn new(zone: impl Into<String>) -> Self {
        Self {
            zone: zone.into(),
            plugins: Vec::new(),
            filters: Vec::new(),
            view_name: None,
            debug: false,
            stacktrace: false,
            read_timeout: None,
            write_timeout: None,
            idle_timeout: None,
            tsig_secrets: HashMap::new(),
            handler_chain: None,
            metadata_collector: None,
            registry: HashMap::new(),
        }
    }

    /// Appends a plugin constructor.
    pub fn with_plugin<F>(mut self, plugin: F) -> Self
    where
        F: Fn(Option<Arc<dyn Handler>>) -> Arc<dyn Handler> + Send + Sync + 'static,
    {
        self.plugins.push(Box::new(plugin));
        self
    }

    /// Appends a filter.
    pub fn with_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&RequestContext, &Request<'_>) -> bool + Send + Sync + 'static,
    {
        self.filters.push(Arc::new(filter));
        self
    }

    /// Sets the view name.
    pub fn with_view(mut self, view: impl Into<String>) -> Self {
        self.view_name = Some(view.into());
        self
    }

    /// Returns the compiled handler chain.
    ///
    /// `None` means the config has no plugins and refuses every query.
    pub fn handler_chain(&self) -> Option<&Arc<dyn Handler>> {
        self.handler_chain.as_ref()
    }

    /// Returns the metadata collector bookmarked at compile time.
    pub fn metadata_collector(&self) -> Option<&dyn MetadataCollector> {
        self.metadata_collector
            .as_deref()
            .and_then(|link| link.metadata_collector())
    }

    /// Returns the compiled link registered under `name`.
    pub fn handler(&self, name: &str) -> Option<&Arc<dyn Handler>> {
        self.registry.get(name)
    }

    /// Returns every compiled link.
    pub fn handlers(&self) -> impl Iterator<Item = &Arc<dyn Handler>> {
        self.registry.values()
    }

    pub(crate) fn register_handler(&mut self, link: Arc<dyn Handler>) {
        self.registry.insert(link.name().to_string(), link);
    }

    /// Returns true if every filter accepts the request.
    pub fn passes_filters(&self, ctx: &RequestContext, req: &Request<'_>) -> bool {
        self.filters.iter().all(|filter| filter(ctx, req))
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("zone", &self.zone)
            .field("plugins", &self.plugins.len())
            .field("filters", &self.filters.len())
            .field("view_name", &self.view_name)
            .field("debug", &self.debug)
            .field("stacktrace", &self.stacktrace)
            .field("compiled", &self.handler_chain.is_some())
            .finish_non_exhaustive()
    }
}

/// Normalizes a zone name to lower case with a trailing dot.
///
/// An empty name is the root zone.
pub fn normalize_zone(zone: &str) -> Result<String> {
    let mut name = zone.trim().to_ascii_lowercase();
    if name.is_empty() {
        name.push('.');
    }
    if !name.ends_with('.') {
        name.push('.');
    }

    Name::from_ascii(&name).map_err(|e| ServerError::InvalidZone {
        zone: zone.to_string(),
        message: e.to_string(),
    })?;

    Ok(name)
}

// =============================================================================
// Server options
// =============================================================================

/// Process-wide server options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerOptions {
    /// Suppresses the startup summary.
    pub quiet: bool,

    /// Plugins whose presence enables non-IN query classes.
    pub chaos_plugins: HashSet<String>,

    /// Upper bound on draining in-flight work at stop (milliseconds).
    pub grace_timeout_ms: u64,

    /// Default read timeout (milliseconds).
    pub read_timeout_ms: u64,

    /// Default write timeout (milliseconds).
    pub write_timeout_ms: u64,

    /// Default idle timeout (milliseconds).
    pub idle_timeout_ms: u64,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            quiet: false,
            chaos_plugins: ["chaos", "forward", "proxy"]
                .into_iter()
                .map(String::from)
                .collect(),
            grace_timeout_ms: 5_000,
            read_timeout_ms: 3_000,
            write_timeout_ms: 5_000,
            idle_timeout_ms: 10_000,
        }
    }
}

impl ServerOptions {
    /// Loads options from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Sets the grace timeout.
    pub fn with_grace_timeout(mut self, timeout: Duration) -> Self {
        self.grace_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Returns the grace timeout.
    pub fn grace_timeout(&self) -> Duration {
        Duration::from_millis(self.grace_timeout_ms)
    }

    /// Returns the default read timeout.
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// Returns the default write timeout.
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    /// Returns the default idle timeout.
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}
