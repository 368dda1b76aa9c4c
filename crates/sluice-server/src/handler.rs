//! Transport-facing query handler interface.

use async_trait::async_trait;
use hickory_proto::op::Message;

use crate::writer::ResponseWriter;

/// Entry point the transports hand parsed queries to.
///
/// The handler owns the whole response: it writes zero or more messages
/// through `writer` before returning.
#[async_trait]
pub trait QueryHandler: Send + Sync {
    /// Handles one query.
    async fn handle(&self, writer: &mut dyn ResponseWriter, query: Message);
}
