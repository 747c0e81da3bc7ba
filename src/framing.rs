//! ThinkGear frame reassembly.
//!
//! The headset streams frames of the form
//!
//! ```text
//! [0xAA][0xAA][LENGTH][PAYLOAD ... LENGTH bytes][CHECKSUM]
//! ```
//!
//! where `CHECKSUM` is the inverted low byte of the payload sum. Bytes arrive in
//! arbitrary chunks (Bluetooth buffering makes bursts and split frames common),
//! so [`FrameParser`] accumulates them and yields every complete, verified
//! payload.
//!
//! # Recovery
//!
//! Nothing in here is fatal. Garbage before a preamble is skipped, an oversized
//! length or a bad checksum drops only the candidate preamble and scanning
//! resumes right after it. Every such event is counted in [`FramingStats`].

use log::{debug, trace};
use serde::Serialize;

use crate::errors::{DriverError, FramingError, Result};

/// Preamble byte; a frame starts with two of them.
pub const SYNC: u8 = 0xAA;

/// Largest payload the protocol allows (0xAA in the length slot is a sync byte).
pub const MAX_PAYLOAD_LEN: usize = 169;

/// Default bound on buffered, unconsumed bytes.
pub const DEFAULT_BUFFER_CAPACITY: usize = 4096;

const HEADER_LEN: usize = 3;
const MAX_FRAME_LEN: usize = HEADER_LEN + MAX_PAYLOAD_LEN + 1;

/// Checksum of a payload: low byte of the sum, bitwise inverted.
pub fn checksum(payload: &[u8]) -> u8 {
    !payload.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))
}

/// Build a complete frame (preamble, length, payload, checksum) around `payload`.
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>> {
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(DriverError::Protocol(format!(
            "payload of {} bytes exceeds maximum {}",
            payload.len(),
            MAX_PAYLOAD_LEN
        )));
    }

    let mut frame = Vec::with_capacity(payload.len() + HEADER_LEN + 1);
    frame.extend_from_slice(&[SYNC, SYNC, payload.len() as u8]);
    frame.extend_from_slice(payload);
    frame.push(checksum(payload));
    Ok(frame)
}

/// A checksum-verified payload, borrowed from the parser buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Packet<'a> {
    payload: &'a [u8],
}

impl<'a> Packet<'a> {
    /// Only the parser builds packets, after the checksum matched. Unverified
    /// bytes go through [`decode_payload`](crate::decode_payload).
    pub(crate) fn new(payload: &'a [u8]) -> Self {
        Self { payload }
    }

    pub fn payload(&self) -> &'a [u8] {
        self.payload
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Counters for everything the parser accepted or threw away.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FramingStats {
    /// Frames that passed the checksum.
    pub packets: u64,
    /// Candidate frames dropped for a checksum mismatch.
    pub checksum_errors: u64,
    /// Candidate frames dropped for a length above [`MAX_PAYLOAD_LEN`].
    pub oversized_lengths: u64,
    /// Bytes skipped while looking for a preamble.
    pub discarded_bytes: u64,
    /// Bytes dropped because the buffer bound was reached.
    pub overflow_bytes: u64,
}

/// Outcome of one frame-parse attempt at the current cursor.
#[derive(Debug)]
enum Step {
    Packet { start: usize, len: usize },
    Resync(FramingError),
    NeedMoreData,
}

/// Incremental frame reassembler.
///
/// ```ignore
/// let mut parser = FrameParser::new();
/// parser.feed(&chunk);
/// while let Some(packet) = parser.next_packet() {
///     let records = decode(&table, &packet)?;
/// }
/// ```
///
/// [`next_packet`](Self::next_packet) lends the payload straight out of the
/// internal buffer; the borrow has to end before the next packet is parsed.
/// Consumed bytes are compacted away on the next [`feed`](Self::feed), so the
/// same allocation is reused for the whole session.
#[derive(Debug)]
pub struct FrameParser {
    buf: Vec<u8>,
    pos: usize,
    capacity: usize,
    stats: FramingStats,
}

impl Default for FrameParser {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameParser {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUFFER_CAPACITY)
    }

    /// Create a parser holding at most `capacity` unconsumed bytes.
    ///
    /// The bound is raised to one maximum-size frame if smaller.
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(MAX_FRAME_LEN);
        Self {
            buf: Vec::with_capacity(capacity),
            pos: 0,
            capacity,
            stats: FramingStats::default(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of buffered bytes not yet consumed.
    pub fn buffered(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn stats(&self) -> FramingStats {
        self.stats
    }

    /// Drop all buffered data. Counters are kept.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.pos = 0;
    }

    /// Append raw bytes from the link.
    ///
    /// If the unconsumed data would exceed the capacity, the oldest bytes are
    /// discarded and scanning resynchronises on whatever remains.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.compact();

        let total = self.buf.len() + bytes.len();
        if total <= self.capacity {
            self.buf.extend_from_slice(bytes);
            return;
        }

        let overflow = total - self.capacity;
        if overflow >= self.buf.len() {
            let skip = overflow - self.buf.len();
            self.buf.clear();
            self.buf.extend_from_slice(&bytes[skip..]);
        } else {
            self.buf.drain(..overflow);
            self.buf.extend_from_slice(bytes);
        }
        self.stats.overflow_bytes += overflow as u64;
        debug!(
            "frame buffer full, dropped {} oldest bytes (capacity={})",
            overflow, self.capacity
        );
    }

    /// Return the next verified packet in the buffered data, if any.
    pub fn next_packet(&mut self) -> Option<Packet<'_>> {
        loop {
            match self.step() {
                Step::Packet { start, len } => {
                    self.stats.packets += 1;
                    return Some(Packet::new(&self.buf[start..start + len]));
                }
                Step::Resync(err) => {
                    match err {
                        FramingError::Checksum { .. } => self.stats.checksum_errors += 1,
                        FramingError::OversizedLength(_) => self.stats.oversized_lengths += 1,
                    }
                    debug!("dropping frame candidate: {}", err);
                }
                Step::NeedMoreData => return None,
            }
        }
    }

    fn step(&mut self) -> Step {
        loop {
            let pending = &self.buf[self.pos..];
            let Some(offset) = pending.windows(2).position(|w| w == [SYNC, SYNC]) else {
                // A lone trailing sync byte may be the first half of a preamble.
                let keep = usize::from(pending.last() == Some(&SYNC));
                let skipped = pending.len() - keep;
                self.discard(skipped);
                return Step::NeedMoreData;
            };
            self.discard(offset);

            let pending = &self.buf[self.pos..];
            if pending.len() < HEADER_LEN {
                return Step::NeedMoreData;
            }

            let declared = pending[2];
            if declared == SYNC {
                // Three sync bytes in a row: the preamble starts one later.
                self.discard(1);
                continue;
            }

            let len = declared as usize;
            if len > MAX_PAYLOAD_LEN {
                self.pos += 2;
                return Step::Resync(FramingError::OversizedLength(declared));
            }

            let frame_len = HEADER_LEN + len + 1;
            if pending.len() < frame_len {
                trace!(
                    "partial frame: have {} of {} bytes",
                    pending.len(),
                    frame_len
                );
                return Step::NeedMoreData;
            }

            let start = self.pos + HEADER_LEN;
            let received = self.buf[start + len];
            let expected = checksum(&self.buf[start..start + len]);
            if expected != received {
                self.pos += 2;
                return Step::Resync(FramingError::Checksum { expected, received });
            }

            self.pos += frame_len;
            return Step::Packet { start, len };
        }
    }

    fn discard(&mut self, n: usize) {
        if n > 0 {
            trace!("skipping {} bytes before preamble", n);
            self.pos += n;
            self.stats.discarded_bytes += n as u64;
        }
    }

    fn compact(&mut self) {
        if self.pos > 0 {
            self.buf.drain(..self.pos);
            self.pos = 0;
        }
    }
}
