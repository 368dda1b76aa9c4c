//! Handler chain compilation.

use std::collections::HashSet;
use std::mem;
use std::sync::Arc;
use tracing::trace;

use crate::config::Config;
use crate::plugin::Handler;

/// Links the compiler remembers across all zones of an address.
#[derive(Default)]
pub(crate) struct Bookmarks {
    /// First link found with the tracing capability.
    pub trace: Option<Arc<dyn Handler>>,

    /// Whether a chaos-enabling plugin is present.
    pub class_chaos: bool,
}

/// Composes the plugins of `site` into its handler chain.
///
/// Constructors run back to front, each wrapping the chain built so far.
pub(crate) fn compile(site: &mut Config, chaos_plugins: &HashSet<String>, bookmarks: &mut Bookmarks) {
    let plugins = mem::take(&mut site.plugins);

    let mut chain: Option<Arc<dyn Handler>> = None;
    for plugin in plugins.iter().rev() {
        let link = plugin(chain.take());
        site.register_handler(link.clone());

        if site.metadata_collector.is_none() && link.metadata_collector().is_some() {
            site.metadata_collector = Some(link.clone());
        }
        if bookmarks.trace.is_none() && link.trace().is_some() {
            bookmarks.trace = Some(link.clone());
        }
        if chaos_plugins.contains(link.name()) {
            bookmarks.class_chaos = true;
        }

        trace!(zone = %site.zone, plugin = link.name(), "Linked plugin");
        chain = Some(link);
    }

    site.plugins = plugins;
    site.handler_chain = chain;
}
