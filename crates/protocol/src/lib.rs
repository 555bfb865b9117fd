//! Wire-level reconstruction of the sniffed request/response protocol: the
//! incremental frame parser, per-flow stream tracker, and flow hashing used
//! to bucket packets by TCP 4-tuple.

mod flow;
mod frame;
mod stream;

pub use flow::flow_hash;
pub use frame::{Frame, FrameOutcome, FrameParser, Magic, Opcode, HEADER_LEN, MAX_BODY_LEN};
pub use stream::{LatencyInfo, Stream};
