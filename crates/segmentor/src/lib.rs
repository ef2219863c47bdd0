//! Fragmentation and reassembly of control packets too large for one
//! segment, with the request/retransmit state machine that goes with it.
//!
//! There is one [`OutboundSegmentor`] and one [`InboundSegmentor`] per
//! channel master; both track a bounded set of active request entries
//! keyed by (peer, requestId) and are driven by a once-a-second tick.

pub mod inbound;
pub mod outbound;

use std::net::SocketAddr;

/// Maximum payload bytes carried by one segment.
pub const MAX_SEGMENT_LEN: usize = 492;
/// Maximum number of segments a single logical control packet may split into.
pub const MAX_SEGMENTS: usize = 40;
/// Maximum reassembled payload a request may carry.
pub const MAX_PAYLOAD_LEN: usize = MAX_SEGMENT_LEN * MAX_SEGMENTS;

/// How often the sending side resends segment 0 while it still "has the
/// ball" and the peer has not yet responded.
pub const TIMEOUT_RETRANS_MS: u64 = 900;
/// Quiet time since the last segment activity before an entry is discarded.
pub const QUIET_TIMEOUT_MS: u64 = 10_000;
/// Hard cap on an entry's lifetime regardless of activity.
pub const BUSY_CAP_MS: u64 = 30_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    TooManySegments,
    PayloadTooLarge,
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Identifies one segmentation request uniquely within a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestKey {
    pub peer: SocketAddr,
    pub request_id: u16,
}

pub use inbound::{InboundOutcome, InboundSegmentor};
pub use outbound::{OutboundSegmentor, Segment};
