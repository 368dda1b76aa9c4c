//! EDNS version negotiation.

use hickory_proto::op::{Edns, Message, ResponseCode};

use crate::request::reply_with_rcode;

/// Highest EDNS version the server speaks.
pub const SUPPORTED_VERSION: u8 = 0;

/// Builds the BADVERS response for a query using an unsupported EDNS
/// version.
///
/// Returns `None` when the query has no OPT record or uses a supported
/// version. The response carries no question and an OPT record advertising
/// the version the server supports.
pub fn negotiate_version(req: &Message) -> Option<Message> {
    let edns = req.extensions().as_ref()?;
    if edns.version() <= SUPPORTED_VERSION {
        return None;
    }

    let mut reply = reply_with_rcode(req, ResponseCode::BADVERS);
    reply.take_queries();

    let mut opt = Edns::new();
    opt.set_version(SUPPORTED_VERSION);
    opt.set_max_payload(edns.max_payload());
    opt.set_dnssec_ok(edns.dnssec_ok());
    opt.set_rcode_high(ResponseCode::BADVERS.high());
    reply.set_edns(opt);

    Some(reply)
}
