//! Capture-file parsing.
//!
//! A capture is a text log with one entry per line:
//!
//! ```text
//! machine 1760932567 - ff ff 0a 00 00 00 00 00 00 70 00 01 7b
//! modem 1760932568 - ff ff 25 40 00 00 00 00 00 11 10 02 00 01
//!   a1 b2 c3 ...
//! machine 1760932570 - 00
//! ```
//!
//! Lines holding only hex bytes continue the previous entry. An entry whose
//! bytes are exactly `00` marks a power cycle of that side.

use crate::codec::{DecodeOutcome, DesyncReason, FrameCodec};
use crate::constants::POWER_CYCLE_MARKER;
use crate::error::HaierError;
use crate::frame::{Direction, Frame};
use bytes::{Bytes, BytesMut};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::LazyLock;
use tracing::{debug, warn};

static ENTRY_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?P<source>machine|modem)\s+(?P<ts>\d{1,16})\s*-\s*(?P<hex>(?:[0-9A-Fa-f]{2}\s*)*)$")
        .expect("entry pattern is valid")
});

static CONTINUATION_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(?:[0-9A-Fa-f]{2}\s*)+$").expect("continuation pattern is valid"));

/// Timestamps with at most this many digits are whole seconds
const SECONDS_DIGITS: usize = 10;

/// One timestamped entry of a capture file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureEntry {
    /// 1-based line the entry started on
    pub line: usize,
    pub direction: Direction,
    /// Milliseconds
    pub raw_timestamp: i64,
    pub bytes: Bytes,
}

impl CaptureEntry {
    pub fn is_power_cycle(&self) -> bool {
        self.bytes.as_ref() == POWER_CYCLE_MARKER
    }

    pub fn hex_string(&self) -> String {
        crate::frame::to_spaced_hex(&self.bytes)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedLine {
    pub line: usize,
    pub reason: String,
}

/// What one entry turned into after decoding
#[derive(Debug, Clone, PartialEq)]
pub enum CaptureItem {
    Frame {
        line: usize,
        direction: Direction,
        raw_timestamp: i64,
        frame: Frame,
    },
    Resync {
        line: usize,
        direction: Direction,
        discarded: usize,
        reason: DesyncReason,
    },
    PowerCycle {
        line: usize,
        direction: Direction,
        raw_timestamp: i64,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capture {
    entries: Vec<CaptureEntry>,
    skipped: Vec<SkippedLine>,
}

impl Capture {
    /// Parse capture text. Unrecognised lines are skipped and recorded.
    pub fn parse(text: &str) -> Self {
        let mut capture = Capture::default();
        let mut pending: Option<(CaptureEntry, BytesMut)> = None;

        for (index, line) in text.lines().enumerate() {
            let number = index + 1;
            if line.trim().is_empty() {
                continue;
            }

            if let Some(caps) = ENTRY_LINE.captures(line) {
                if let Some((entry, bytes)) = pending.take() {
                    capture.push(entry, bytes);
                }
                match parse_entry(number, &caps) {
                    Ok((entry, bytes)) => pending = Some((entry, bytes)),
                    Err(e) => capture.skip(number, e.to_string()),
                }
            } else if CONTINUATION_LINE.is_match(line) {
                match pending.as_mut() {
                    Some((_, bytes)) => match decode_hex(line) {
                        Ok(more) => bytes.extend_from_slice(&more),
                        Err(e) => capture.skip(number, e.to_string()),
                    },
                    None => capture.skip(number, "continuation without an entry".to_string()),
                }
            } else {
                capture.skip(number, "unrecognised line".to_string());
            }
        }
        if let Some((entry, bytes)) = pending.take() {
            capture.push(entry, bytes);
        }

        if !capture.skipped.is_empty() {
            warn!(skipped = capture.skipped.len(), "Skipped capture lines");
        }
        debug!(entries = capture.entries.len(), "Parsed capture");
        capture
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, HaierError> {
        let text = std::fs::read_to_string(path)?;
        Ok(Self::parse(&text))
    }

    /// Like [`parse`](Self::parse), but the first bad line is an error
    pub fn parse_strict(text: &str) -> Result<Self, HaierError> {
        let capture = Self::parse(text);
        match capture.skipped.first() {
            Some(skipped) => Err(HaierError::Capture {
                line: skipped.line,
                message: skipped.reason.clone(),
            }),
            None => Ok(capture),
        }
    }

    pub fn entries(&self) -> &[CaptureEntry] {
        &self.entries
    }

    pub fn skipped(&self) -> &[SkippedLine] {
        &self.skipped
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn push(&mut self, mut entry: CaptureEntry, bytes: BytesMut) {
        entry.bytes = bytes.freeze();
        self.entries.push(entry);
    }

    fn skip(&mut self, line: usize, reason: String) {
        debug!(line, %reason, "Skipping capture line");
        self.skipped.push(SkippedLine { line, reason });
    }

    /// Decode every entry in file order. Each direction has its own codec;
    /// each entry is decoded on its own, so a torn entry cannot eat the next.
    pub fn decode(&self, make_codec: impl Fn() -> FrameCodec) -> Vec<CaptureItem> {
        let mut outbound = make_codec();
        let mut inbound = make_codec();
        let mut items = Vec::new();

        for entry in &self.entries {
            if entry.is_power_cycle() {
                items.push(CaptureItem::PowerCycle {
                    line: entry.line,
                    direction: entry.direction,
                    raw_timestamp: entry.raw_timestamp,
                });
                continue;
            }
            let codec = match entry.direction {
                Direction::Outbound => &mut outbound,
                Direction::Inbound => &mut inbound,
            };
            let mut buf = BytesMut::from(entry.bytes.as_ref());
            for outcome in codec.decode_available(&mut buf, true) {
                match outcome {
                    DecodeOutcome::Frame(frame) => items.push(CaptureItem::Frame {
                        line: entry.line,
                        direction: entry.direction,
                        raw_timestamp: entry.raw_timestamp,
                        frame,
                    }),
                    DecodeOutcome::Resync { discarded, reason } => items.push(CaptureItem::Resync {
                        line: entry.line,
                        direction: entry.direction,
                        discarded,
                        reason,
                    }),
                    DecodeOutcome::NeedMoreBytes => {}
                }
            }
        }
        items
    }

    /// Frames sent from one side, in order, for replay
    pub fn frames_from(&self, direction: Direction) -> Vec<Frame> {
        self.decode(FrameCodec::default)
            .into_iter()
            .filter_map(|item| match item {
                CaptureItem::Frame {
                    direction: d, frame, ..
                } if d == direction => Some(frame),
                _ => None,
            })
            .collect()
    }
}

fn parse_entry(line: usize, caps: &regex::Captures<'_>) -> Result<(CaptureEntry, BytesMut), HaierError> {
    let direction = Direction::from_source_name(&caps["source"]).ok_or_else(|| HaierError::Capture {
        line,
        message: format!("unknown source {}", &caps["source"]),
    })?;
    let ts = &caps["ts"];
    let value: i64 = ts.parse().map_err(|e| HaierError::Capture {
        line,
        message: format!("bad timestamp {ts}: {e}"),
    })?;
    let raw_timestamp = if ts.len() <= SECONDS_DIGITS { value * 1000 } else { value };
    let bytes = BytesMut::from(&decode_hex(&caps["hex"])?[..]);
    Ok((
        CaptureEntry {
            line,
            direction,
            raw_timestamp,
            bytes: Bytes::new(),
        },
        bytes,
    ))
}

fn decode_hex(text: &str) -> Result<Vec<u8>, HaierError> {
    let compact: String = text.split_whitespace().collect();
    Ok(hex::decode(compact)?)
}
