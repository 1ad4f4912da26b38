//! Wire framing - fixed binary fragment format
//!
//! Every logical message travels as one or more fragments. Each fragment is a
//! 36-byte little-endian header followed by up to `MAX_FRAGMENT_PAYLOAD` bytes.
//!
//! ## Wire Format
//!
//! ```text
//! ┌────────┬──────────────────────────────────────────────────┐
//! │ offset │ field                                            │
//! ├────────┼──────────────────────────────────────────────────┤
//! │  0     │ magic "DPoP" (4 bytes)                           │
//! │  4     │ mailbox id (u32)                                 │
//! │  8     │ protocol id (u32)                                │
//! │ 12     │ message id (u32)                                 │
//! │ 16     │ reply-to id (u32, 0 = not a reply)               │
//! │ 20     │ flags (u16): bit0 = BEGIN, bit1 = END            │
//! │ 22     │ payload length (u16)                             │
//! │ 24     │ send timestamp (i64, 100ns ticks, profiling)     │
//! │ 32     │ checksum (u32, CRC32C)                           │
//! │ 36     │ payload                                          │
//! └────────┴──────────────────────────────────────────────────┘
//! ```
//!
//! The checksum covers the header with its own four bytes zeroed, followed by
//! the payload. A message that fits in one fragment sets both BEGIN and END;
//! an empty message is still sent as a single (empty) fragment.

use crate::postoffice::mailbox::{MailboxId, MailboxMessage};
use std::time::{SystemTime, UNIX_EPOCH};

/// Magic capture pattern that opens every fragment.
pub const CAPTURE_PATTERN: [u8; 4] = *b"DPoP";

/// Size of the fixed fragment header.
pub const HEADER_LEN: usize = 36;

/// Largest payload a single fragment may carry.
pub const MAX_FRAGMENT_PAYLOAD: usize = u16::MAX as usize - HEADER_LEN;

/// Fragment opens a message.
pub const FLAG_BEGIN: u16 = 0x1;

/// Fragment closes a message.
pub const FLAG_END: u16 = 0x2;

pub(crate) const OFFSET_MAILBOX: usize = 4;
pub(crate) const OFFSET_PROTOCOL: usize = 8;
pub(crate) const OFFSET_MESSAGE_ID: usize = 12;
pub(crate) const OFFSET_REPLY_TO: usize = 16;
pub(crate) const OFFSET_FLAGS: usize = 20;
pub(crate) const OFFSET_PAYLOAD_LEN: usize = 22;
pub(crate) const OFFSET_TIMESTAMP: usize = 24;
pub(crate) const OFFSET_CHECKSUM: usize = 32;

/// Errors decoding a single fragment from a complete byte slice
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("Fragment truncated: have {have} bytes, need {need}")]
    Truncated { have: usize, need: usize },

    #[error("Bad capture pattern")]
    BadMagic,

    #[error("Payload length {0} exceeds fragment maximum")]
    PayloadTooLarge(usize),

    #[error("Checksum mismatch: header says {expected:#010x}, computed {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },
}

/// One validated fragment as it appeared on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireFrame {
    pub mailbox_id: MailboxId,
    pub protocol_id: u32,
    pub message_id: u32,
    pub reply_to_id: u32,
    pub flags: u16,
    pub send_timestamp: i64,
    pub payload: Vec<u8>,
}

impl WireFrame {
    pub fn is_begin(&self) -> bool {
        self.flags & FLAG_BEGIN != 0
    }

    pub fn is_end(&self) -> bool {
        self.flags & FLAG_END != 0
    }

    /// BEGIN and END on the same fragment.
    pub fn is_single(&self) -> bool {
        self.is_begin() && self.is_end()
    }
}

/// Current send timestamp in 100ns ticks since the Unix epoch.
pub fn timestamp_ticks() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| (d.as_nanos() / 100) as i64)
        .unwrap_or(0)
}

/// CRC32C over a full header (checksum field treated as zero) and payload.
pub fn fragment_checksum(header: &[u8], payload: &[u8]) -> u32 {
    let mut crc = crc32c::crc32c(&header[..OFFSET_CHECKSUM]);
    crc = crc32c::crc32c_append(crc, &[0u8; 4]);
    crc32c::crc32c_append(crc, payload)
}

/// Append one encoded fragment to `out`.
pub fn encode_fragment(
    out: &mut Vec<u8>,
    mailbox_id: MailboxId,
    protocol_id: u32,
    message_id: u32,
    reply_to_id: u32,
    flags: u16,
    payload: &[u8],
) {
    debug_assert!(payload.len() <= MAX_FRAGMENT_PAYLOAD);
    let mut header = [0u8; HEADER_LEN];
    header[..4].copy_from_slice(&CAPTURE_PATTERN);
    header[OFFSET_MAILBOX..OFFSET_MAILBOX + 4].copy_from_slice(&mailbox_id.0.to_le_bytes());
    header[OFFSET_PROTOCOL..OFFSET_PROTOCOL + 4].copy_from_slice(&protocol_id.to_le_bytes());
    header[OFFSET_MESSAGE_ID..OFFSET_MESSAGE_ID + 4].copy_from_slice(&message_id.to_le_bytes());
    header[OFFSET_REPLY_TO..OFFSET_REPLY_TO + 4].copy_from_slice(&reply_to_id.to_le_bytes());
    header[OFFSET_FLAGS..OFFSET_FLAGS + 2].copy_from_slice(&flags.to_le_bytes());
    header[OFFSET_PAYLOAD_LEN..OFFSET_PAYLOAD_LEN + 2]
        .copy_from_slice(&(payload.len() as u16).to_le_bytes());
    header[OFFSET_TIMESTAMP..OFFSET_TIMESTAMP + 8].copy_from_slice(&timestamp_ticks().to_le_bytes());

    let checksum = fragment_checksum(&header, payload);
    header[OFFSET_CHECKSUM..OFFSET_CHECKSUM + 4].copy_from_slice(&checksum.to_le_bytes());

    out.reserve(HEADER_LEN + payload.len());
    out.extend_from_slice(&header);
    out.extend_from_slice(payload);
}

/// Split a message payload into `(flags, chunk)` fragments.
///
/// Always yields at least one fragment, so empty messages still reach the peer.
pub fn fragments(payload: &[u8]) -> impl Iterator<Item = (u16, &[u8])> {
    let count = if payload.is_empty() {
        1
    } else {
        (payload.len() + MAX_FRAGMENT_PAYLOAD - 1) / MAX_FRAGMENT_PAYLOAD
    };
    (0..count).map(move |idx| {
        let start = idx * MAX_FRAGMENT_PAYLOAD;
        let end = (start + MAX_FRAGMENT_PAYLOAD).min(payload.len());
        let mut flags = 0;
        if idx == 0 {
            flags |= FLAG_BEGIN;
        }
        if idx + 1 == count {
            flags |= FLAG_END;
        }
        (flags, &payload[start..end])
    })
}

/// Encode every fragment of a message into one contiguous buffer.
pub fn encode_message(message: &MailboxMessage) -> Vec<u8> {
    let mut out = Vec::with_capacity(message.payload.len() + HEADER_LEN);
    for (flags, chunk) in fragments(&message.payload) {
        encode_fragment(
            &mut out,
            message.mailbox_id,
            message.protocol_id,
            message.message_id,
            message.reply_to_id,
            flags,
            chunk,
        );
    }
    out
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([bytes[offset], bytes[offset + 1], bytes[offset + 2], bytes[offset + 3]])
}

pub(crate) fn header_payload_len(header: &[u8]) -> usize {
    u16::from_le_bytes([header[OFFSET_PAYLOAD_LEN], header[OFFSET_PAYLOAD_LEN + 1]]) as usize
}

pub(crate) fn header_checksum(header: &[u8]) -> u32 {
    read_u32(header, OFFSET_CHECKSUM)
}

/// Build a frame from a slice known to hold one complete fragment.
pub(crate) fn frame_from_bytes(bytes: &[u8]) -> WireFrame {
    let payload_len = header_payload_len(bytes);
    let mut ts = [0u8; 8];
    ts.copy_from_slice(&bytes[OFFSET_TIMESTAMP..OFFSET_TIMESTAMP + 8]);
    WireFrame {
        mailbox_id: MailboxId(read_u32(bytes, OFFSET_MAILBOX)),
        protocol_id: read_u32(bytes, OFFSET_PROTOCOL),
        message_id: read_u32(bytes, OFFSET_MESSAGE_ID),
        reply_to_id: read_u32(bytes, OFFSET_REPLY_TO),
        flags: u16::from_le_bytes([bytes[OFFSET_FLAGS], bytes[OFFSET_FLAGS + 1]]),
        send_timestamp: i64::from_le_bytes(ts),
        payload: bytes[HEADER_LEN..HEADER_LEN + payload_len].to_vec(),
    }
}

/// Decode and validate one fragment that starts at the beginning of `bytes`.
pub fn decode_fragment(bytes: &[u8]) -> Result<WireFrame, WireError> {
    if bytes.len() < HEADER_LEN {
        return Err(WireError::Truncated { have: bytes.len(), need: HEADER_LEN });
    }
    if bytes[..4] != CAPTURE_PATTERN {
        return Err(WireError::BadMagic);
    }
    let payload_len = header_payload_len(bytes);
    if payload_len > MAX_FRAGMENT_PAYLOAD {
        return Err(WireError::PayloadTooLarge(payload_len));
    }
    let need = HEADER_LEN + payload_len;
    if bytes.len() < need {
        return Err(WireError::Truncated { have: bytes.len(), need });
    }
    let expected = header_checksum(bytes);
    let actual = fragment_checksum(&bytes[..HEADER_LEN], &bytes[HEADER_LEN..need]);
    if expected != actual {
        return Err(WireError::ChecksumMismatch { expected, actual });
    }
    Ok(frame_from_bytes(&bytes[..need]))
}

// =============================================================================
// CAPTURE PATTERN MATCHER
// =============================================================================

/// Streaming matcher for a fixed byte pattern.
///
/// Bytes are fed one at a time and `feed` returns true on the byte that
/// completes a match, so a pattern split across reads is still found.
/// Overlapping occurrences are all reported.
#[derive(Debug, Clone)]
pub struct CapturePatternMatcher {
    pattern: Vec<u8>,
    /// Longest proper prefix that is also a suffix, per prefix length.
    fallback: Vec<usize>,
    matched: usize,
}

impl CapturePatternMatcher {
    pub fn new(pattern: &[u8]) -> Self {
        assert!(!pattern.is_empty(), "capture pattern must not be empty");
        let mut fallback = vec![0usize; pattern.len()];
        let mut k = 0;
        for i in 1..pattern.len() {
            while k > 0 && pattern[i] != pattern[k] {
                k = fallback[k - 1];
            }
            if pattern[i] == pattern[k] {
                k += 1;
            }
            fallback[i] = k;
        }
        Self { pattern: pattern.to_vec(), fallback, matched: 0 }
    }

    pub fn feed(&mut self, byte: u8) -> bool {
        while self.matched > 0 && self.pattern[self.matched] != byte {
            self.matched = self.fallback[self.matched - 1];
        }
        if self.pattern[self.matched] == byte {
            self.matched += 1;
        }
        if self.matched == self.pattern.len() {
            self.matched = self.fallback[self.matched - 1];
            return true;
        }
        false
    }

    pub fn reset(&mut self) {
        self.matched = 0;
    }

    pub fn pattern_len(&self) -> usize {
        self.pattern.len()
    }
}

impl Default for CapturePatternMatcher {
    fn default() -> Self {
        Self::new(&CAPTURE_PATTERN)
    }
}

// =============================================================================
// TESTS
// =============================================================================
