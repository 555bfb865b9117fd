use byteorder::{BigEndian, ByteOrder};

/// Fixed header size of one protocol message.
pub const HEADER_LEN: usize = 24;

/// Sanity bound on a single frame's announced body. Anything past this
/// means the stream has desynchronized and the flow is no longer worth
/// tracking.
pub const MAX_BODY_LEN: u32 = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Magic {
    Request,
    Response,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Get,
    Set,
    Ignored,
}

/// One fully decoded request or response.
#[derive(Debug, Clone)]
pub struct Frame {
    pub magic: Magic,
    pub opcode: Opcode,
    pub opaque: u32,
    pub key: Vec<u8>,
    pub capture_time_ns: i64,
}

impl Frame {
    pub fn is_ignored(&self) -> bool {
        self.opcode == Opcode::Ignored
    }
}

/// Result of feeding bytes into the parser.
pub enum FrameOutcome {
    /// A frame finished parsing.
    Frame(Frame),
    /// The header announced a body larger than `MAX_BODY_LEN`; the stream
    /// has desynchronized and the owning flow should be dropped.
    Desync,
}

#[derive(Debug, Clone, Copy)]
struct Header {
    magic: Magic,
    opcode: Opcode,
    opaque: u32,
}

enum Phase {
    /// Not yet parsed; holds header bytes accumulated so far (< HEADER_LEN).
    Header { header_buf: Vec<u8> },
    Extras { header: Header, remaining: u32, key_len: u16, value_len: u32 },
    Key { header: Header, remaining: u16, key: Vec<u8>, value_len: u32 },
    Value { header: Header, remaining: u32, key: Vec<u8> },
}

/// Incremental decoder for one protocol message at a time. Call `feed`
/// repeatedly with the bytes of a stream, in order; it reports how much of
/// the given slice it consumed and whatever it produced. Fragmentation at
/// any byte boundary yields the same parsed result.
pub struct FrameParser {
    phase: Phase,
    capture_time_ns: i64,
    fresh: bool,
}

impl Default for FrameParser {
    fn default() -> Self {
        FrameParser {
            phase: Phase::Header { header_buf: Vec::with_capacity(HEADER_LEN) },
            capture_time_ns: 0,
            fresh: true,
        }
    }
}

impl FrameParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// `capture_time_ns` stamps the frame at its *first* byte only; it is
    /// ignored on calls that continue an already-started frame.
    ///
    /// Returns `(consumed, outcome)`. `consumed` may be less than
    /// `input.len()` when a frame completes mid-buffer — feed the
    /// remainder to the next frame.
    pub fn feed(&mut self, input: &[u8], capture_time_ns: i64) -> (usize, Option<FrameOutcome>) {
        if self.fresh {
            self.capture_time_ns = capture_time_ns;
            self.fresh = false;
        }

        let mut consumed = 0usize;

        loop {
            let phase = std::mem::replace(&mut self.phase, Phase::Header { header_buf: Vec::new() });

            match phase {
                Phase::Header { mut header_buf } => {
                    let need = HEADER_LEN - header_buf.len();
                    let take = need.min(input.len() - consumed);
                    header_buf.extend_from_slice(&input[consumed..consumed + take]);
                    consumed += take;

                    if header_buf.len() < HEADER_LEN {
                        self.phase = Phase::Header { header_buf };
                        return (consumed, None);
                    }

                    match parse_header(&header_buf) {
                        HeaderResult::Body { header, extras_len, key_len, value_len } => {
                            self.phase = next_body_phase(header, extras_len, key_len, value_len);
                        }
                        HeaderResult::Ignored { header } => {
                            return (consumed, Some(self.finish(header, Vec::new())));
                        }
                        HeaderResult::Desync => {
                            self.fresh = true;
                            return (consumed, Some(FrameOutcome::Desync));
                        }
                    }
                }
                Phase::Extras { header, mut remaining, key_len, value_len } => {
                    let available = input.len() - consumed;
                    let take = (remaining as usize).min(available);
                    consumed += take;
                    remaining -= take as u32;

                    if remaining > 0 {
                        self.phase = Phase::Extras { header, remaining, key_len, value_len };
                        return (consumed, None);
                    }
                    self.phase = next_body_phase_after_extras(header, key_len, value_len);
                }
                Phase::Key { header, mut remaining, mut key, value_len } => {
                    let available = input.len() - consumed;
                    let take = (remaining as usize).min(available);
                    key.extend_from_slice(&input[consumed..consumed + take]);
                    consumed += take;
                    remaining -= take as u16;

                    if remaining > 0 {
                        self.phase = Phase::Key { header, remaining, key, value_len };
                        return (consumed, None);
                    }
                    self.phase = next_body_phase_after_key(header, key, value_len);
                }
                Phase::Value { header, mut remaining, key } => {
                    let available = input.len() - consumed;
                    let take = (remaining as usize).min(available);
                    consumed += take;
                    remaining -= take as u32;

                    if remaining > 0 {
                        self.phase = Phase::Value { header, remaining, key };
                        return (consumed, None);
                    }
                    return (consumed, Some(self.finish(header, key)));
                }
            }
        }
    }

    fn finish(&mut self, header: Header, key: Vec<u8>) -> FrameOutcome {
        let frame = Frame {
            magic: header.magic,
            opcode: header.opcode,
            opaque: header.opaque,
            key,
            capture_time_ns: self.capture_time_ns,
        };
        self.phase = Phase::Header { header_buf: Vec::with_capacity(HEADER_LEN) };
        self.fresh = true;
        FrameOutcome::Frame(frame)
    }
}

enum HeaderResult {
    Body { header: Header, extras_len: u8, key_len: u16, value_len: u32 },
    Ignored { header: Header },
    Desync,
}

fn parse_header(buf: &[u8]) -> HeaderResult {
    debug_assert_eq!(buf.len(), HEADER_LEN);

    let magic_byte = buf[0];
    let magic = match magic_byte {
        0x80 => Magic::Request,
        0x81 => Magic::Response,
        _ => Magic::Response, // unknown direction; disposition is via Opcode::Ignored
    };
    let unknown_magic = !matches!(magic_byte, 0x80 | 0x81);

    let opcode_byte = buf[1];
    let opcode = match opcode_byte {
        0x00 => Opcode::Get,
        0x01 => Opcode::Set,
        _ => Opcode::Ignored,
    };
    let opcode = if unknown_magic { Opcode::Ignored } else { opcode };

    let key_len = BigEndian::read_u16(&buf[2..4]);
    let extras_len = buf[4];
    // buf[5] datatype, buf[6..8] vbucket/status: reserved, skipped.
    let total_body_len = BigEndian::read_u32(&buf[8..12]);
    let opaque = BigEndian::read_u32(&buf[12..16]);
    // buf[16..24] cas: consumed in full, value unused.

    let header = Header { magic, opcode, opaque };

    if total_body_len > MAX_BODY_LEN {
        return HeaderResult::Desync;
    }

    match total_body_len
        .checked_sub(key_len as u32)
        .and_then(|v| v.checked_sub(extras_len as u32))
    {
        None => HeaderResult::Ignored { header: Header { opcode: Opcode::Ignored, ..header } },
        Some(value_len) => HeaderResult::Body { header, extras_len, key_len, value_len },
    }
}

fn next_body_phase(header: Header, extras_len: u8, key_len: u16, value_len: u32) -> Phase {
    if extras_len > 0 {
        Phase::Extras { header, remaining: extras_len as u32, key_len, value_len }
    } else {
        next_body_phase_after_extras(header, key_len, value_len)
    }
}

fn next_body_phase_after_extras(header: Header, key_len: u16, value_len: u32) -> Phase {
    if key_len > 0 {
        Phase::Key { header, remaining: key_len, key: Vec::with_capacity(key_len as usize), value_len }
    } else {
        next_body_phase_after_key(header, Vec::new(), value_len)
    }
}

fn next_body_phase_after_key(header: Header, key: Vec<u8>, value_len: u32) -> Phase {
    // Falls straight through to completion on the next loop turn when
    // `value_len` is zero, since `Value`'s remaining-check handles that.
    Phase::Value { header, remaining: value_len, key }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header_bytes(
        magic: u8,
        opcode: u8,
        key_len: u16,
        extras_len: u8,
        total_body_len: u32,
        opaque: u32,
    ) -> Vec<u8> {
        let mut buf = vec![0u8; HEADER_LEN];
        buf[0] = magic;
        buf[1] = opcode;
        BigEndian::write_u16(&mut buf[2..4], key_len);
        buf[4] = extras_len;
        BigEndian::write_u32(&mut buf[8..12], total_body_len);
        BigEndian::write_u32(&mut buf[12..16], opaque);
        buf
    }

    fn full_frame(magic: u8, opcode: u8, key: &[u8], extras: &[u8], value: &[u8]) -> Vec<u8> {
        let total_body_len = (key.len() + extras.len() + value.len()) as u32;
        let mut buf =
            header_bytes(magic, opcode, key.len() as u16, extras.len() as u8, total_body_len, 42);
        buf.extend_from_slice(extras);
        buf.extend_from_slice(key);
        buf.extend_from_slice(value);
        buf
    }

    fn parse_all_at_once(bytes: &[u8]) -> Frame {
        let mut parser = FrameParser::new();
        let (consumed, outcome) = parser.feed(bytes, 1);
        assert_eq!(consumed, bytes.len());
        match outcome {
            Some(FrameOutcome::Frame(f)) => f,
            _ => panic!("expected a complete frame"),
        }
    }

    fn parse_byte_at_a_time(bytes: &[u8]) -> Frame {
        let mut parser = FrameParser::new();
        for (i, b) in bytes.iter().enumerate() {
            let (consumed, outcome) = parser.feed(std::slice::from_ref(b), (i + 1) as i64);
            assert_eq!(consumed, 1);
            if i == bytes.len() - 1 {
                match outcome {
                    Some(FrameOutcome::Frame(f)) => return f,
                    _ => panic!("expected completion on last byte"),
                }
            } else {
                assert!(outcome.is_none(), "completed early at byte {i}");
            }
        }
        unreachable!()
    }

    #[test]
    fn basic_request_all_at_once() {
        let bytes = full_frame(0x80, 0x00, b"foo", &[], &[]);
        let frame = parse_all_at_once(&bytes);
        assert_eq!(frame.magic, Magic::Request);
        assert_eq!(frame.opcode, Opcode::Get);
        assert_eq!(frame.opaque, 42);
        assert_eq!(frame.key, b"foo");
    }

    #[test]
    fn fragmentation_is_split_point_independent() {
        let bytes = full_frame(0x81, 0x01, b"a-longer-key", b"ex", b"value-bytes");

        let whole = parse_all_at_once(&bytes);
        let one_at_a_time = parse_byte_at_a_time(&bytes);
        assert_eq!(whole.key, one_at_a_time.key);
        assert_eq!(whole.opaque, one_at_a_time.opaque);

        for split in 1..bytes.len() {
            let (a, b) = bytes.split_at(split);
            let mut parser = FrameParser::new();
            let (consumed_a, outcome_a) = parser.feed(a, 1);
            assert_eq!(consumed_a, a.len());
            let frame = match outcome_a {
                Some(FrameOutcome::Frame(f)) => f,
                None => {
                    let (consumed_b, outcome_b) = parser.feed(b, 2);
                    assert_eq!(consumed_b, b.len());
                    match outcome_b {
                        Some(FrameOutcome::Frame(f)) => f,
                        _ => panic!("split at {split}: expected completion"),
                    }
                }
                Some(FrameOutcome::Desync) => panic!("split at {split}: unexpected desync"),
            };
            assert_eq!(frame.key, whole.key, "split at {split}");
            assert_eq!(frame.opaque, whole.opaque, "split at {split}");
        }
    }

    #[test]
    fn header_split_across_two_packets() {
        let bytes = full_frame(0x80, 0x00, b"k", &[], &[]);
        let (first, second) = bytes.split_at(10);

        let mut parser = FrameParser::new();
        let (consumed, outcome) = parser.feed(first, 100);
        assert_eq!(consumed, first.len());
        assert!(outcome.is_none());

        let (consumed, outcome) = parser.feed(second, 200);
        assert_eq!(consumed, second.len());
        match outcome {
            Some(FrameOutcome::Frame(f)) => {
                assert_eq!(f.key, b"k");
                assert_eq!(f.capture_time_ns, 100);
            }
            _ => panic!("expected completion"),
        }
    }

    #[test]
    fn empty_body_completes_after_header() {
        let bytes = full_frame(0x81, 0x00, &[], &[], &[]);
        let frame = parse_all_at_once(&bytes);
        assert_eq!(frame.key, Vec::<u8>::new());
        assert_eq!(frame.opcode, Opcode::Get);
    }

    #[test]
    fn extras_without_key() {
        let bytes = full_frame(0x80, 0x01, &[], b"extra-bytes", &[]);
        let frame = parse_all_at_once(&bytes);
        assert_eq!(frame.opcode, Opcode::Set);
        assert!(frame.key.is_empty());
    }

    #[test]
    fn underflowing_body_length_is_ignored_not_desync() {
        let mut buf = header_bytes(0x80, 0x00, 10, 0, 2, 42); // total_body_len < key_len
        buf.extend_from_slice(b"xx");
        let mut parser = FrameParser::new();
        let (consumed, outcome) = parser.feed(&buf, 1);
        assert_eq!(consumed, HEADER_LEN);
        match outcome {
            Some(FrameOutcome::Frame(f)) => assert!(f.is_ignored()),
            _ => panic!("expected an ignored frame, not desync"),
        }
    }

    #[test]
    fn unknown_magic_is_ignored_but_still_consumed() {
        let bytes = full_frame(0x00, 0x00, b"k", &[], &[]);
        let mut parser = FrameParser::new();
        let (consumed, outcome) = parser.feed(&bytes, 1);
        assert_eq!(consumed, bytes.len());
        match outcome {
            Some(FrameOutcome::Frame(f)) => assert!(f.is_ignored()),
            _ => panic!("expected an ignored frame"),
        }
    }

    #[test]
    fn oversized_body_is_desync() {
        let buf = header_bytes(0x80, 0x00, 0, 0, MAX_BODY_LEN + 1, 42);
        let mut parser = FrameParser::new();
        let (consumed, outcome) = parser.feed(&buf, 1);
        assert_eq!(consumed, HEADER_LEN);
        assert!(matches!(outcome, Some(FrameOutcome::Desync)));
    }

    #[test]
    fn residual_bytes_start_next_frame() {
        let mut bytes = full_frame(0x80, 0x00, b"foo", &[], &[]);
        let second = full_frame(0x81, 0x00, b"", &[], &[]);
        bytes.extend_from_slice(&second);

        let mut parser = FrameParser::new();
        let (consumed, outcome) = parser.feed(&bytes, 1);
        assert!(consumed < bytes.len());
        assert!(matches!(outcome, Some(FrameOutcome::Frame(_))));

        let remainder = &bytes[consumed..];
        let mut parser2 = FrameParser::new();
        let (consumed2, outcome2) = parser2.feed(remainder, 2);
        assert_eq!(consumed2, remainder.len());
        assert!(matches!(outcome2, Some(FrameOutcome::Frame(_))));
    }
}
