use std::collections::HashMap;

use crate::frame::{Frame, FrameOutcome, FrameParser, Magic};

/// One matched request/response pair, ready to be turned into a latency
/// sample by the caller.
#[derive(Debug, Clone)]
pub struct LatencyInfo {
    pub opaque: u32,
    pub latency_us: i64,
    pub key: Vec<u8>,
}

/// Tracks one direction-agnostic TCP flow: feeds raw payload bytes through
/// a `FrameParser`, holds unmatched requests keyed by opaque ID, and emits
/// a `LatencyInfo` as soon as a response completes against one.
///
/// Only requests wait: a response is always resolved against
/// `pending_requests` the instant it completes and is then dropped,
/// matched or not, so there is no persistent pending-responses table to
/// hold.
///
/// A flow carries at most one in-flight request per opaque ID at a time;
/// if a second request with the same opaque arrives before its response,
/// it replaces the first (the client is assumed not to reuse an opaque
/// until its prior response has been seen, per the wire protocol's
/// contract — if that contract is violated the older request is lost
/// rather than paired against the wrong response).
pub struct Stream {
    parser: FrameParser,
    pending_requests: HashMap<u32, Frame>,
    ready: Vec<LatencyInfo>,
}

impl Default for Stream {
    fn default() -> Self {
        Stream {
            parser: FrameParser::new(),
            pending_requests: HashMap::new(),
            ready: Vec::new(),
        }
    }
}

impl Stream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one TCP segment's payload through the frame parser, pairing
    /// and stashing any frames it completes. A segment may contain more
    /// than one frame, or the tail of one started in an earlier segment.
    pub fn on_payload(&mut self, mut payload: &[u8], capture_time_ns: i64) {
        while !payload.is_empty() {
            let (consumed, outcome) = self.parser.feed(payload, capture_time_ns);
            payload = &payload[consumed..];

            match outcome {
                None => break,
                Some(FrameOutcome::Desync) => {
                    self.pending_requests.clear();
                }
                Some(FrameOutcome::Frame(frame)) => self.handle_frame(frame),
            }

            if consumed == 0 {
                // Parser made no progress on a non-empty buffer; avoid spinning.
                break;
            }
        }
    }

    fn handle_frame(&mut self, frame: Frame) {
        match frame.magic {
            Magic::Request => {
                // Ignored requests are still stored: a later response with
                // the same opaque must find it to drop silently rather
                // than pairing against an unrelated earlier request.
                self.pending_requests.insert(frame.opaque, frame);
            }
            Magic::Response => {
                if frame.is_ignored() {
                    return; // drop response only; any pending request stays pending
                }
                let request = match self.pending_requests.remove(&frame.opaque) {
                    Some(r) => r,
                    None => return, // no matching request: drop response only
                };
                if request.is_ignored() {
                    return; // drop both without emitting
                }
                self.emit(&request, &frame);
            }
        }
    }

    fn emit(&mut self, request: &Frame, response: &Frame) {
        let latency_us = (response.capture_time_ns - request.capture_time_ns) / 1_000;
        self.ready.push(LatencyInfo {
            opaque: request.opaque,
            latency_us,
            key: request.key.clone(),
        });
    }

    /// Drain every latency sample completed since the last call.
    pub fn pair_and_collect(&mut self) -> Vec<LatencyInfo> {
        std::mem::take(&mut self.ready)
    }

    /// Number of requests still awaiting a response. Exposed for flow
    /// reaping: a flow idle with a large backlog is likely abandoned.
    pub fn pending_request_count(&self) -> usize {
        self.pending_requests.len()
    }
}
