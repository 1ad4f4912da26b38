//! Resilient frame scanner
//!
//! Recovers valid fragments from a byte stream that may contain noise,
//! truncated fragments, or resplices. Every occurrence of the capture pattern
//! opens a hypothesis: "a fragment starts here". Each hypothesis keeps its own
//! running CRC32C and is fed bytes as they arrive. Once the header is in, the
//! declared payload length tells the hypothesis where it ends; a finished
//! hypothesis either validates (and its bytes, along with any junk before it,
//! are spliced out of the buffer) or is discarded as noise.
//!
//! ```text
//!   buffer:  .. junk .. DPoP[hdr][payload] .. DPoP[hdr][pay|
//!                       ^ hypothesis A       ^ hypothesis B (still open)
//! ```
//!
//! A false capture match inside a payload is expected and harmless: its CRC
//! never validates, and it is dropped once the real fragment is consumed.

use crate::postoffice::wire::{
    frame_from_bytes, header_checksum, header_payload_len, CapturePatternMatcher, WireFrame,
    CAPTURE_PATTERN, HEADER_LEN, MAX_FRAGMENT_PAYLOAD, OFFSET_CHECKSUM,
};

/// Counters exposed for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanStats {
    pub frames: u64,
    pub checksum_failures: u64,
    pub oversize_headers: u64,
    pub junk_bytes: u64,
}

#[derive(Debug, Clone)]
struct Hypothesis {
    start: usize,
    crc: u32,
    /// Bytes fed into `crc`, counted from `start`.
    fed: usize,
    /// Header + payload, known once the header is in.
    total: Option<usize>,
}

impl Hypothesis {
    fn open(start: usize) -> Self {
        Self { start, crc: crc32c::crc32c(&CAPTURE_PATTERN), fed: CAPTURE_PATTERN.len(), total: None }
    }

    fn is_finished(&self) -> bool {
        self.total == Some(self.fed)
    }

    /// Feed buffer bytes up to relative offset `upto`, zeroing the checksum field.
    fn feed_to(&mut self, buffer: &[u8], upto: usize) {
        while self.fed < upto {
            let (end, zeroed) = if self.fed < OFFSET_CHECKSUM {
                (upto.min(OFFSET_CHECKSUM), false)
            } else if self.fed < HEADER_LEN {
                (upto.min(HEADER_LEN), true)
            } else {
                (upto, false)
            };
            if zeroed {
                const ZEROS: [u8; 4] = [0; 4];
                self.crc = crc32c::crc32c_append(self.crc, &ZEROS[..end - self.fed]);
            } else {
                let abs = self.start + self.fed..self.start + end;
                self.crc = crc32c::crc32c_append(self.crc, &buffer[abs]);
            }
            self.fed = end;
        }
    }
}

enum Advance {
    Open,
    Finished,
    Rejected,
}

/// Incremental scanner; push raw reads in, get validated fragments out.
#[derive(Debug, Default)]
pub struct FrameScanner {
    buffer: Vec<u8>,
    matcher: CapturePatternMatcher,
    hypotheses: Vec<Hypothesis>,
    stats: ScanStats,
}

impl FrameScanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> ScanStats {
        self.stats
    }

    /// Bytes currently retained while waiting for more input.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Number of candidate fragment starts still open.
    pub fn open_hypotheses(&self) -> usize {
        self.hypotheses.len()
    }

    /// Append freshly read bytes and return every fragment they complete.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<WireFrame> {
        let scan_from = self.buffer.len();
        self.buffer.extend_from_slice(bytes);

        for idx in scan_from..self.buffer.len() {
            if self.matcher.feed(self.buffer[idx]) {
                let start = idx + 1 - CAPTURE_PATTERN.len();
                self.hypotheses.push(Hypothesis::open(start));
            }
        }

        let mut frames = Vec::new();
        loop {
            let mut consumed = None;
            let mut idx = 0;
            while idx < self.hypotheses.len() {
                match self.advance(idx) {
                    Advance::Open => idx += 1,
                    Advance::Rejected => {
                        self.hypotheses.remove(idx);
                    }
                    Advance::Finished => {
                        let hyp = self.hypotheses.remove(idx);
                        let Some(total) = hyp.total else { continue };
                        let bytes = &self.buffer[hyp.start..hyp.start + total];
                        if header_checksum(bytes) == hyp.crc {
                            frames.push(frame_from_bytes(bytes));
                            self.stats.frames += 1;
                            self.stats.junk_bytes += hyp.start as u64;
                            consumed = Some(hyp.start + total);
                            break;
                        }
                        self.stats.checksum_failures += 1;
                        tracing::trace!(
                            "[FrameScanner.push] Discarding hypothesis at {} ({} bytes): checksum mismatch",
                            hyp.start,
                            total
                        );
                    }
                }
            }

            match consumed {
                Some(end) => self.splice(end),
                None => break,
            }
        }

        self.compact();
        frames
    }

    fn advance(&mut self, idx: usize) -> Advance {
        let available = self.buffer.len();
        let hyp = &mut self.hypotheses[idx];
        let have = available - hyp.start;

        if hyp.total.is_none() {
            hyp.feed_to(&self.buffer, have.min(HEADER_LEN));
            if hyp.fed < HEADER_LEN {
                return Advance::Open;
            }
            let payload_len = header_payload_len(&self.buffer[hyp.start..hyp.start + HEADER_LEN]);
            if payload_len > MAX_FRAGMENT_PAYLOAD {
                self.stats.oversize_headers += 1;
                return Advance::Rejected;
            }
            hyp.total = Some(HEADER_LEN + payload_len);
        }

        let total = hyp.total.unwrap_or(HEADER_LEN);
        hyp.feed_to(&self.buffer, have.min(total));
        if hyp.is_finished() {
            Advance::Finished
        } else {
            Advance::Open
        }
    }

    /// Drop `[0, end)` and shift surviving hypotheses; ones that started inside go.
    fn splice(&mut self, end: usize) {
        self.buffer.drain(..end);
        self.hypotheses.retain_mut(|hyp| {
            if hyp.start < end {
                return false;
            }
            hyp.start -= end;
            true
        });
        self.resync_matcher();
    }

    fn compact(&mut self) {
        match self.hypotheses.iter().map(|h| h.start).min() {
            Some(first) if first > 0 => {
                self.stats.junk_bytes += first as u64;
                self.buffer.drain(..first);
                for hyp in &mut self.hypotheses {
                    hyp.start -= first;
                }
                self.resync_matcher();
            }
            Some(_) => {}
            None if self.buffer.len() > MAX_FRAGMENT_PAYLOAD => {
                let keep = CAPTURE_PATTERN.len();
                let drop = self.buffer.len() - keep;
                self.stats.junk_bytes += drop as u64;
                self.buffer.drain(..drop);
                self.resync_matcher();
            }
            None => {}
        }
    }

    /// Rebuild the partial-match state from the tail of the buffer.
    ///
    /// Fewer bytes than the pattern length can never complete a match, so this
    /// never opens a duplicate hypothesis.
    fn resync_matcher(&mut self) {
        self.matcher.reset();
        let tail = self.buffer.len().saturating_sub(self.matcher.pattern_len() - 1);
        for idx in tail..self.buffer.len() {
            self.matcher.feed(self.buffer[idx]);
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::postoffice::mailbox::{MailboxId, MailboxMessage};
    use crate::postoffice::wire::{encode_message, FLAG_BEGIN, FLAG_END};

    fn encoded(mailbox: u32, message_id: u32, payload: &[u8]) -> Vec<u8> {
        encode_message(&MailboxMessage {
            mailbox_id: MailboxId(mailbox),
            protocol_id: 1,
            message_id,
            reply_to_id: 0,
            payload: payload.to_vec(),
        })
    }

    // TEST030: One clean fragment in one push
    #[test]
    fn test_single_frame() {
        let mut scanner = FrameScanner::new();
        let frames = scanner.push(&encoded(3, 1, b"hello"));
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload, b"hello");
        assert_eq!(frames[0].mailbox_id, MailboxId(3));
        assert_eq!(frames[0].flags, FLAG_BEGIN | FLAG_END);
        assert_eq!(scanner.buffered(), 0);
        assert_eq!(scanner.open_hypotheses(), 0);
    }

    // TEST031: A fragment delivered one byte per read still comes out exactly once
    #[test]
    fn test_byte_at_a_time() {
        let mut scanner = FrameScanner::new();
        let bytes = encoded(3, 1, b"dribble");
        let mut frames = Vec::new();
        for b in &bytes {
            frames.extend(scanner.push(std::slice::from_ref(b)));
        }
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload, b"dribble");
    }

    // TEST032: Noise containing the capture pattern before, between and after frames
    #[test]
    fn test_noise_with_capture_pattern() {
        let mut stream = Vec::new();
        stream.extend_from_slice(b"garbage DPoP more garbage DPo");
        stream.extend_from_slice(&encoded(1, 1, b"first"));
        stream.extend_from_slice(b"DPoPDPoP\x00\x01\x02");
        stream.extend_from_slice(&encoded(2, 2, b"second"));
        stream.extend_from_slice(b"DP");

        let mut scanner = FrameScanner::new();
        let frames = scanner.push(&stream);
        let payloads: Vec<&[u8]> = frames.iter().map(|f| f.payload.as_slice()).collect();
        assert_eq!(payloads, vec![b"first".as_slice(), b"second".as_slice()]);
    }

    // TEST033: A corrupted frame is never delivered and the next valid one is
    #[test]
    fn test_corrupted_frame_skipped() {
        let mut bad = encoded(1, 1, b"corrupt me");
        let last = bad.len() - 1;
        bad[last] ^= 0xFF;
        let good = encoded(1, 2, b"intact");

        let mut scanner = FrameScanner::new();
        let mut frames = scanner.push(&bad);
        frames.extend(scanner.push(&good));
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload, b"intact");
        assert!(scanner.stats().checksum_failures >= 1);
    }

    // TEST034: A truncated frame spliced in front of a valid one does not swallow it
    #[test]
    fn test_truncated_prefix() {
        let truncated = encoded(1, 1, &[7u8; 500]);
        let good = encoded(1, 2, b"survivor");
        let mut stream = truncated[..200].to_vec();
        stream.extend_from_slice(&good);

        let mut scanner = FrameScanner::new();
        let frames = scanner.push(&stream);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload, b"survivor");
    }

    // TEST035: A payload that embeds a full encoded frame yields only the outer frame
    #[test]
    fn test_frame_inside_payload() {
        let inner = encoded(9, 9, b"inner");
        let outer = encoded(1, 1, &inner);
        let mut scanner = FrameScanner::new();
        let frames = scanner.push(&outer);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].mailbox_id, MailboxId(1));
        assert_eq!(frames[0].payload, inner);
        assert_eq!(scanner.open_hypotheses(), 0);
    }

    // TEST036: Pure noise is compacted down to a small tail
    #[test]
    fn test_noise_compaction() {
        let mut scanner = FrameScanner::new();
        let noise: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        assert!(scanner.push(&noise).is_empty());
        assert!(scanner.buffered() <= MAX_FRAGMENT_PAYLOAD);
        assert!(scanner.stats().junk_bytes > 0);

        let frames = scanner.push(&encoded(1, 1, b"after noise"));
        assert_eq!(frames.len(), 1);
    }

    // TEST037: A bogus header declaring an oversized payload is dropped immediately
    #[test]
    fn test_oversize_header_rejected() {
        let mut bogus = encoded(1, 1, b"x");
        bogus[22..24].copy_from_slice(&u16::MAX.to_le_bytes());
        let mut scanner = FrameScanner::new();
        assert!(scanner.push(&bogus).is_empty());
        assert_eq!(scanner.open_hypotheses(), 0);
        assert_eq!(scanner.stats().oversize_headers, 1);
    }

    // TEST038: Many frames in one read come out in stream order
    #[test]
    fn test_many_frames_in_order() {
        let mut stream = Vec::new();
        for i in 0..50u32 {
            stream.extend_from_slice(&encoded(1, i + 1, format!("msg-{i}").as_bytes()));
        }
        let mut scanner = FrameScanner::new();
        let frames = scanner.push(&stream);
        assert_eq!(frames.len(), 50);
        for (i, frame) in frames.iter().enumerate() {
            assert_eq!(frame.message_id, i as u32 + 1);
        }
    }
}
