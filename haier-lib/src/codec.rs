//! Incremental frame codec.
//!
//! The decoder works over a growing `BytesMut`: each call either splits one
//! frame off the front of the buffer, asks for more bytes, or discards bytes
//! to get back in step with the frame boundaries. It never blocks and never
//! fails; desyncs are reported as [`DecodeOutcome::Resync`].

use crate::checksum::{CrcValidator, crc16_arc};
use crate::constants::*;
use crate::error::HaierError;
use crate::frame::{Frame, FrameFlags, write_frame};
use bytes::{Buf, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use strum_macros::Display;
use tracing::{debug, warn};

/// Why the decoder dropped bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
pub enum DesyncReason {
    /// Bytes in front of the next preamble
    Garbage,
    /// Length byte outside the range ever observed
    LengthOutOfRange,
    /// Candidate failed its checksum and a valid frame starts inside it
    EmbeddedPreamble,
    /// Input ended in the middle of a frame
    Truncated,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DecodeOutcome {
    Frame(Frame),
    NeedMoreBytes,
    Resync { discarded: usize, reason: DesyncReason },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodecStats {
    pub frames: u64,
    pub invalid_frames: u64,
    pub resyncs: u64,
    pub bytes_discarded: u64,
}

/// What sits at an inner preamble of a frame that failed validation
enum InnerCandidate {
    Valid,
    Invalid,
    Incomplete,
}

#[derive(Debug, Clone, Default)]
pub struct FrameCodec {
    validator: CrcValidator,
    stats: CodecStats,
}

impl FrameCodec {
    pub fn new(validator: CrcValidator) -> Self {
        Self {
            validator,
            stats: CodecStats::default(),
        }
    }

    pub fn stats(&self) -> CodecStats {
        self.stats
    }

    pub fn validator(&self) -> &CrcValidator {
        &self.validator
    }

    /// Try to take one frame off the front of `buf`
    pub fn decode(&mut self, buf: &mut BytesMut) -> DecodeOutcome {
        self.decode_inner(buf, false)
    }

    /// Like [`decode`](Self::decode), but no more input will arrive: an
    /// incomplete frame is dropped as a resync so the bytes behind it can
    /// still be decoded.
    pub fn decode_eof(&mut self, buf: &mut BytesMut) -> DecodeOutcome {
        self.decode_inner(buf, true)
    }

    /// Decode everything currently decodable, resyncs included
    pub fn decode_available(&mut self, buf: &mut BytesMut, eof: bool) -> Vec<DecodeOutcome> {
        let mut outcomes = Vec::new();
        loop {
            match self.decode_inner(buf, eof) {
                DecodeOutcome::NeedMoreBytes => break,
                outcome => outcomes.push(outcome),
            }
        }
        outcomes
    }

    fn decode_inner(&mut self, buf: &mut BytesMut, eof: bool) -> DecodeOutcome {
        let Some(start) = find_preamble(buf, 0) else {
            // keep a trailing 0xFF, it may be the first half of a preamble
            let keep = usize::from(buf.last() == Some(&PREAMBLE[0]) && !eof);
            let discard = buf.len() - keep;
            return if discard > 0 {
                self.resync(buf, discard, DesyncReason::Garbage)
            } else {
                DecodeOutcome::NeedMoreBytes
            };
        };
        if start > 0 {
            return self.resync(buf, start, DesyncReason::Garbage);
        }

        if buf.len() <= FLAGS_OFFSET {
            return self.incomplete(buf, eof);
        }
        let length = buf[LENGTH_OFFSET];
        if !(MIN_LENGTH..=MAX_LENGTH).contains(&length) {
            warn!(length, "Frame length out of range, resynchronizing");
            let next = find_preamble(buf, 1).unwrap_or(buf.len());
            return self.resync(buf, next, DesyncReason::LengthOutOfRange);
        }

        let total = frame_len(length, FrameFlags::from_bytes([buf[FLAGS_OFFSET]]));
        if buf.len() < total {
            return self.incomplete(buf, eof);
        }

        let candidate = Bytes::copy_from_slice(&buf[..total]);
        let frame = match Frame::parse(candidate, &self.validator) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "Unparseable frame candidate, resynchronizing");
                let next = find_preamble(buf, 1).unwrap_or(buf.len());
                return self.resync(buf, next, DesyncReason::LengthOutOfRange);
            }
        };

        if !frame.validation.is_valid() {
            // FF FF is ordinary payload data unless a valid frame starts there
            let mut from = 1;
            while let Some(inner) = find_preamble(&buf[..total], from) {
                match self.inner_candidate(&buf[inner..]) {
                    InnerCandidate::Valid => {
                        warn!(
                            validation = ?frame.validation,
                            offset = inner,
                            "Invalid frame hides another frame, resynchronizing"
                        );
                        return self.resync(buf, inner, DesyncReason::EmbeddedPreamble);
                    }
                    InnerCandidate::Incomplete if !eof => return DecodeOutcome::NeedMoreBytes,
                    InnerCandidate::Incomplete | InnerCandidate::Invalid => from = inner + 1,
                }
            }
            self.stats.invalid_frames += 1;
            warn!(
                bytes = hex::encode(&buf[..total]),
                validation = ?frame.validation,
                "Frame failed validation"
            );
        }

        buf.advance(total);
        self.stats.frames += 1;
        debug!(command = %frame.command, len = total, "Decoded frame");
        DecodeOutcome::Frame(frame)
    }

    fn inner_candidate(&self, bytes: &[u8]) -> InnerCandidate {
        if bytes.len() <= FLAGS_OFFSET {
            return InnerCandidate::Incomplete;
        }
        let length = bytes[LENGTH_OFFSET];
        if !(MIN_LENGTH..=MAX_LENGTH).contains(&length) {
            return InnerCandidate::Invalid;
        }
        let total = frame_len(length, FrameFlags::from_bytes([bytes[FLAGS_OFFSET]]));
        if bytes.len() < total {
            return InnerCandidate::Incomplete;
        }
        match Frame::parse(Bytes::copy_from_slice(&bytes[..total]), &self.validator) {
            Ok(frame) if frame.validation.is_valid() => InnerCandidate::Valid,
            _ => InnerCandidate::Invalid,
        }
    }

    fn incomplete(&mut self, buf: &mut BytesMut, eof: bool) -> DecodeOutcome {
        if !eof {
            return DecodeOutcome::NeedMoreBytes;
        }
        let next = find_preamble(buf, 1).unwrap_or(buf.len());
        self.resync(buf, next, DesyncReason::Truncated)
    }

    fn resync(&mut self, buf: &mut BytesMut, discard: usize, reason: DesyncReason) -> DecodeOutcome {
        buf.advance(discard);
        self.stats.resyncs += 1;
        self.stats.bytes_discarded += discard as u64;
        debug!(discarded = discard, %reason, "Resync");
        DecodeOutcome::Resync {
            discarded: discard,
            reason,
        }
    }

    /// Serialize a frame for sending. The checksum and, when flagged, the CRC
    /// are always recomputed; caller-supplied values are ignored.
    ///
    /// Frames this codec would not decode back are refused.
    pub fn encode(&self, frame: &Frame) -> Result<Bytes, HaierError> {
        frame.check_encodable()?;
        let span = frame.checksum_span();
        let crc = frame
            .has_crc_trailer()
            .then(|| self.validator.trailer_for(&span).unwrap_or_else(|| crc16_arc(&span)));
        Ok(write_frame(&span, crc))
    }
}

/// Wire size of a frame with this length byte and flags
fn frame_len(length: u8, flags: FrameFlags) -> usize {
    PREAMBLE_SIZE + 1 + length as usize + if flags.crc() { CRC_SIZE } else { 0 }
}

/// Index of the first `FF FF` at or after `from`
fn find_preamble(buf: &[u8], from: usize) -> Option<usize> {
    if buf.len() < PREAMBLE_SIZE || from > buf.len() - PREAMBLE_SIZE {
        return None;
    }
    buf[from..]
        .windows(PREAMBLE_SIZE)
        .position(|w| w == PREAMBLE)
        .map(|i| i + from)
}

/// Decode a complete byte sequence (e.g. one capture entry) into frames,
/// returning the frames and the number of resync events.
pub fn decode_all(codec: &mut FrameCodec, bytes: &[u8]) -> (Vec<Frame>, usize) {
    let mut buf = BytesMut::from(bytes);
    let mut frames = Vec::new();
    let mut resyncs = 0;
    for outcome in codec.decode_available(&mut buf, true) {
        match outcome {
            DecodeOutcome::Frame(frame) => frames.push(frame),
            DecodeOutcome::Resync { .. } => resyncs += 1,
            DecodeOutcome::NeedMoreBytes => {}
        }
    }
    (frames, resyncs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{CommandCode, ValidatedBy, Validation};

    fn hex_bytes(s: &str) -> Vec<u8> {
        hex::decode(s.replace(' ', "")).expect("Failed to decode hex")
    }

    const PROGRAM_1: &str = "ff ff 0e 40 00 00 00 00 00 60 00 01 01 00 00 00 b0 34 ad";

    #[test]
    fn test_decode_program_start() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::from(&hex_bytes(PROGRAM_1)[..]);
        match codec.decode(&mut buf) {
            DecodeOutcome::Frame(frame) => {
                assert_eq!(frame.command, CommandCode::Single(0x60));
                assert_eq!(frame.payload.as_ref(), &[0x00, 0x01, 0x01, 0x00, 0x00, 0x00]);
                assert_eq!(frame.checksum, 0xb0);
                assert_eq!(frame.crc, Some(0x34ad));
                assert_eq!(frame.validation, Validation::Valid(ValidatedBy::Algorithm));
            }
            other => panic!("Expected frame, got {:?}", other),
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn test_need_more_bytes_until_complete() {
        let mut codec = FrameCodec::default();
        let bytes = hex_bytes(PROGRAM_1);
        let mut buf = BytesMut::new();
        for (i, b) in bytes.iter().enumerate() {
            buf.extend_from_slice(&[*b]);
            let outcome = codec.decode(&mut buf);
            if i + 1 < bytes.len() {
                assert_eq!(outcome, DecodeOutcome::NeedMoreBytes, "byte {}", i);
            } else {
                assert!(matches!(outcome, DecodeOutcome::Frame(_)));
            }
        }
    }

    #[test]
    fn test_checksum_failure_is_retained() {
        let mut bytes = hex_bytes(PROGRAM_1);
        bytes[16] = 0xb1;
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::from(&bytes[..]);
        match codec.decode(&mut buf) {
            DecodeOutcome::Frame(frame) => {
                assert_eq!(
                    frame.validation,
                    Validation::ChecksumMismatch {
                        expected: 0xb0,
                        actual: 0xb1
                    }
                );
            }
            other => panic!("Expected invalid frame, got {:?}", other),
        }
        assert_eq!(codec.stats().invalid_frames, 1);
    }

    #[test]
    fn test_encode_recomputes_trailers() {
        let codec = FrameCodec::default();
        let mut frame = Frame::new(CommandCode::Single(0x60), vec![0x00, 0x01, 0x01, 0x00, 0x00, 0x00]);
        frame.checksum = 0x00;
        frame.crc = Some(0xdead);
        assert_eq!(codec.encode(&frame).expect("encode").as_ref(), &hex_bytes(PROGRAM_1)[..]);
    }

    #[test]
    fn test_frame_without_crc_flag() {
        let frame = Frame::with_header(
            FrameFlags::link_level(),
            [0; RESERVED_SIZE],
            CommandCode::Single(0x70),
            vec![0x01, 0x02],
        );
        let codec = FrameCodec::default();
        let encoded = codec.encode(&frame).expect("encode");
        assert_eq!(encoded.len(), frame.wire_len());
        assert_eq!(encoded[LENGTH_OFFSET], 0x0a);

        let mut decoder = FrameCodec::default();
        let mut buf = BytesMut::from(&encoded[..]);
        match decoder.decode(&mut buf) {
            DecodeOutcome::Frame(decoded) => {
                assert_eq!(decoded, frame);
                assert_eq!(decoded.validation, Validation::Valid(ValidatedBy::Checksum));
            }
            other => panic!("Expected frame, got {:?}", other),
        }
    }

    #[test]
    fn test_invalid_frame_with_ff_ff_payload_is_kept() {
        // auth challenge whose opaque payload contains FF FF, checksum flipped
        let frame = Frame::new(CommandCode::Double(0x12, 0x10), vec![0x02, 0x00, 0x01, 0xff, 0xff, 0x12, 0x34]);
        let mut bytes = FrameCodec::default().encode(&frame).expect("encode").to_vec();
        let checksum_at = bytes.len() - CRC_SIZE - CHECKSUM_SIZE;
        bytes[checksum_at] ^= 0x01;

        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::from(&bytes[..]);
        let outcomes = codec.decode_available(&mut buf, true);
        assert_eq!(outcomes.len(), 1, "{:?}", outcomes);
        match &outcomes[0] {
            DecodeOutcome::Frame(decoded) => {
                assert!(matches!(decoded.validation, Validation::ChecksumMismatch { .. }));
                assert_eq!(decoded.payload, frame.payload);
            }
            other => panic!("Expected invalid frame, got {:?}", other),
        }
        let stats = codec.stats();
        assert_eq!(stats.invalid_frames, 1);
        assert_eq!(stats.resyncs, 0);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_invalid_frame_waits_for_inner_candidate() {
        // payload ends in FF FF 0e 40: could be the start of a frame
        let frame = Frame::new(CommandCode::Single(0x60), vec![0x00, 0x01, 0xff, 0xff, 0x0e, 0x40]);
        let mut bytes = FrameCodec::default().encode(&frame).expect("encode").to_vec();
        let checksum_at = bytes.len() - CRC_SIZE - CHECKSUM_SIZE;
        bytes[checksum_at] ^= 0x01;

        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::from(&bytes[..]);
        assert_eq!(codec.decode(&mut buf), DecodeOutcome::NeedMoreBytes);
        match codec.decode_eof(&mut buf) {
            DecodeOutcome::Frame(decoded) => assert!(!decoded.validation.is_valid()),
            other => panic!("Expected invalid frame, got {:?}", other),
        }
        assert_eq!(codec.stats().resyncs, 0);
    }

    #[test]
    fn test_encode_refuses_oversized_frame() {
        let codec = FrameCodec::default();
        let command = CommandCode::Double(0x6d, 0x02);
        let limit = Frame::max_payload(command);

        let largest = Frame::new(command, vec![0x01; limit]);
        let wire = codec.encode(&largest).expect("largest frame encodes");
        assert_eq!(wire[LENGTH_OFFSET], MAX_LENGTH);
        let mut decoder = FrameCodec::default();
        let mut buf = BytesMut::from(&wire[..]);
        assert_eq!(decoder.decode(&mut buf), DecodeOutcome::Frame(largest));

        let oversized = Frame::new(command, vec![0x01; limit + 1]);
        assert!(matches!(codec.encode(&oversized), Err(HaierError::InvalidFrame(_))));

        let wrapping = Frame::new(CommandCode::Single(0x60), vec![0x00; 260]);
        assert_eq!(wrapping.declared_length(), 268);
        assert!(codec.encode(&wrapping).is_err());
    }

    #[test]
    fn test_encode_refuses_command_split_that_reads_back_differently() {
        let mut frame = Frame::new(CommandCode::Single(0x61), vec![0x00]);
        frame.command = CommandCode::Single(0x12);
        assert!(matches!(FrameCodec::default().encode(&frame), Err(HaierError::InvalidFrame(_))));
    }

    #[test]
    fn test_truncated_frame_at_eof() {
        let mut codec = FrameCodec::default();
        let mut bytes = hex_bytes(PROGRAM_1);
        bytes.truncate(10);
        let mut buf = BytesMut::from(&bytes[..]);
        assert_eq!(codec.decode(&mut buf), DecodeOutcome::NeedMoreBytes);
        assert_eq!(
            codec.decode_eof(&mut buf),
            DecodeOutcome::Resync {
                discarded: 10,
                reason: DesyncReason::Truncated
            }
        );
        assert!(buf.is_empty());
    }
}
