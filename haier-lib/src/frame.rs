use crate::checksum::{CrcValidator, additive_checksum, crc16_arc};
use crate::command::CommandKind;
use crate::constants::*;
use crate::error::HaierError;
use bytes::{BufMut, Bytes, BytesMut};
use modular_bitfield::prelude::*;
use num_enum::FromPrimitive;
use serde::{Deserialize, Serialize};
use std::fmt;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// Which physical stream a frame was read from.
///
/// The washer controller is the outbound side, the network modem the inbound
/// side. Direction is never inferred from frame content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Controller (washing machine) -> modem
    Outbound,
    /// Modem -> controller (washing machine)
    Inbound,
}

impl Direction {
    /// Source name used in capture files
    pub fn source_name(&self) -> &'static str {
        match self {
            Direction::Outbound => "machine",
            Direction::Inbound => "modem",
        }
    }

    pub fn from_source_name(name: &str) -> Option<Self> {
        match name {
            "machine" => Some(Direction::Outbound),
            "modem" => Some(Direction::Inbound),
            _ => None,
        }
    }

    pub fn opposite(&self) -> Self {
        match self {
            Direction::Outbound => Direction::Inbound,
            Direction::Inbound => Direction::Outbound,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Outbound => write!(f, "TX"),
            Direction::Inbound => write!(f, "RX"),
        }
    }
}

#[bitfield(bytes = 1)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameFlags {
    pub low: B6,
    pub crc: bool,
    pub high: bool,
}

impl FrameFlags {
    /// Flags of a regular addressed frame carrying a CRC trailer (0x40)
    pub fn with_crc_trailer() -> Self {
        FrameFlags::from_bytes([FLAG_CRC])
    }

    /// Flags of a link-level frame without CRC (0x00)
    pub fn link_level() -> Self {
        FrameFlags::from_bytes([0x00])
    }

    pub fn as_byte(&self) -> u8 {
        self.into_bytes()[0]
    }
}

/// Fixed part of a frame after the preamble
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct FrameHeaderRaw {
    pub length: u8,
    pub flags: u8,
    pub reserved: [u8; RESERVED_SIZE],
}

/// 1- or 2-byte command type. Two bytes are used when the first byte is a
/// known family prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandCode {
    Single(u8),
    Double(u8, u8),
}

impl CommandCode {
    /// Read a command code from the start of `body`, the bytes between the
    /// reserved span and the checksum.
    pub fn parse(body: &[u8]) -> Option<Self> {
        let first = *body.first()?;
        match body.get(1) {
            Some(&second) if COMMAND_FAMILY_PREFIXES.contains(&first) => Some(CommandCode::Double(first, second)),
            _ => Some(CommandCode::Single(first)),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            CommandCode::Single(_) => 1,
            CommandCode::Double(..) => 2,
        }
    }

    pub fn as_u16(&self) -> u16 {
        match *self {
            CommandCode::Single(code) => code as u16,
            CommandCode::Double(family, sub) => u16::from_be_bytes([family, sub]),
        }
    }

    pub fn put(&self, buf: &mut BytesMut) {
        match *self {
            CommandCode::Single(code) => buf.put_u8(code),
            CommandCode::Double(family, sub) => buf.put_slice(&[family, sub]),
        }
    }

    /// Split command and payload the way [`parse`](Self::parse) would read
    /// them back. The bytes on the wire are unchanged.
    pub fn canonical(self, payload: Bytes) -> (Self, Bytes) {
        match self {
            CommandCode::Single(first) if COMMAND_FAMILY_PREFIXES.contains(&first) && !payload.is_empty() => {
                (CommandCode::Double(first, payload[0]), payload.slice(1..))
            }
            CommandCode::Double(first, second) if !COMMAND_FAMILY_PREFIXES.contains(&first) => {
                let mut joined = BytesMut::with_capacity(payload.len() + 1);
                joined.put_u8(second);
                joined.put_slice(&payload);
                (CommandCode::Single(first), joined.freeze())
            }
            code => (code, payload),
        }
    }
}

impl fmt::Display for CommandCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandCode::Single(code) => write!(f, "{:02x}", code),
            CommandCode::Double(family, sub) => write!(f, "{:02x} {:02x}", family, sub),
        }
    }
}

/// How a valid frame's integrity was established
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValidatedBy {
    /// Checksum only, the frame carries no CRC trailer
    Checksum,
    /// CRC trailer matches a CRC algorithm
    Algorithm,
    /// CRC trailer matches a previously observed value for this frame shape
    Table,
}

/// Integrity verdict attached to every decoded frame.
///
/// Invalid frames are kept and passed on, they are diagnostic signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Validation {
    Valid(ValidatedBy),
    LengthMismatch { declared: u8, observed: usize },
    ChecksumMismatch { expected: u8, actual: u8 },
    CrcMismatch { expected: u16, actual: u16 },
}

impl Validation {
    pub fn is_valid(&self) -> bool {
        matches!(self, Validation::Valid(_))
    }
}

/// One protocol frame.
///
/// The preamble and the length byte are not stored: the preamble is fixed and
/// the length is recomputed from the content when encoding.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub flags: FrameFlags,
    pub reserved: [u8; RESERVED_SIZE],
    pub command: CommandCode,
    pub payload: Bytes,
    /// Checksum as seen on the wire (or computed, for locally built frames)
    pub checksum: u8,
    /// CRC trailer as seen on the wire, present iff the CRC flag is set
    pub crc: Option<u16>,
    pub validation: Validation,
}

impl Frame {
    /// Build a regular frame (CRC flag set, zero reserved span) with checksum
    /// and CRC computed.
    pub fn new(command: CommandCode, payload: impl Into<Bytes>) -> Self {
        Self::with_header(FrameFlags::with_crc_trailer(), [0; RESERVED_SIZE], command, payload)
    }

    /// Build a frame with explicit flags and reserved bytes.
    ///
    /// A command that would read back differently is re-split first, see
    /// [`CommandCode::canonical`].
    pub fn with_header(
        flags: FrameFlags,
        reserved: [u8; RESERVED_SIZE],
        command: CommandCode,
        payload: impl Into<Bytes>,
    ) -> Self {
        let (command, payload) = command.canonical(payload.into());
        let mut frame = Self {
            flags,
            reserved,
            command,
            payload,
            checksum: 0,
            crc: None,
            validation: Validation::Valid(ValidatedBy::Checksum),
        };
        let span = frame.checksum_span();
        frame.checksum = additive_checksum(&span);
        if frame.flags.crc() {
            frame.crc = Some(crc16_arc(&span));
            frame.validation = Validation::Valid(ValidatedBy::Algorithm);
        }
        frame
    }

    /// Value of the length byte: flags through checksum, CRC excluded.
    ///
    /// Not truncated to a byte; see [`check_encodable`](Self::check_encodable).
    pub fn declared_length(&self) -> usize {
        FIXED_HEADER_SIZE + self.command.len() + self.payload.len() + CHECKSUM_SIZE
    }

    /// Largest payload a frame with `command` can carry
    pub fn max_payload(command: CommandCode) -> usize {
        MAX_LENGTH as usize - FIXED_HEADER_SIZE - command.len() - CHECKSUM_SIZE
    }

    /// Fails if the decoder would not accept this frame's length byte, or if
    /// the command would not read back as stored.
    pub fn check_encodable(&self) -> Result<(), HaierError> {
        let length = self.declared_length();
        if !(MIN_LENGTH as usize..=MAX_LENGTH as usize).contains(&length) {
            return Err(HaierError::InvalidFrame(format!(
                "length {length:#x} outside {MIN_LENGTH:#x}..={MAX_LENGTH:#x} ({} payload byte(s), at most {})",
                self.payload.len(),
                Self::max_payload(self.command)
            )));
        }
        if self.command.canonical(self.payload.clone()).0 != self.command {
            return Err(HaierError::InvalidFrame(format!(
                "command {} with this payload reads back as a different command",
                self.command
            )));
        }
        Ok(())
    }

    /// Total size on the wire including preamble and trailers
    pub fn wire_len(&self) -> usize {
        PREAMBLE_SIZE + 1 + self.declared_length() + if self.flags.crc() { CRC_SIZE } else { 0 }
    }

    pub fn has_crc_trailer(&self) -> bool {
        self.flags.crc()
    }

    /// Bytes covered by the checksum and CRC: length byte through payload end
    pub fn checksum_span(&self) -> Vec<u8> {
        let header = FrameHeaderRaw {
            // oversized frames get a length byte the decoder refuses
            length: u8::try_from(self.declared_length()).unwrap_or(u8::MAX),
            flags: self.flags.as_byte(),
            reserved: self.reserved,
        };
        let mut span = BytesMut::with_capacity(RAW_HEADER_SIZE + self.command.len() + self.payload.len());
        span.put_slice(header.as_bytes());
        self.command.put(&mut span);
        span.put_slice(&self.payload);
        span.to_vec()
    }

    /// Semantic classification of this frame
    pub fn kind(&self) -> CommandKind {
        if self.flags.as_byte() == 0x00 {
            return CommandKind::SessionStart;
        }
        CommandKind::from_primitive(self.command.as_u16())
    }

    /// True if the payload carries a device error status
    pub fn has_error_status(&self) -> bool {
        self.kind().carries_status() && self.payload.first().is_some_and(|b| ERROR_STATUS_RANGE.contains(b))
    }

    /// Serialize with a freshly computed checksum and CRC-16/ARC trailer.
    ///
    /// Stored checksum/CRC values are ignored. Use `FrameCodec::encode` to
    /// honour observed CRC tables and to refuse frames that cannot be
    /// decoded back.
    pub fn to_bytes(&self) -> Bytes {
        let span = self.checksum_span();
        let crc = self.flags.crc().then(|| crc16_arc(&span));
        write_frame(&span, crc)
    }

    /// Hex dump of the encoded frame, space separated as in capture files
    pub fn hex_string(&self) -> String {
        to_spaced_hex(&self.to_bytes())
    }
}

/// Assemble preamble, span, checksum and optional CRC into wire bytes
pub(crate) fn write_frame(span: &[u8], crc: Option<u16>) -> Bytes {
    let mut buf = BytesMut::with_capacity(PREAMBLE_SIZE + span.len() + CHECKSUM_SIZE + CRC_SIZE);
    buf.put_slice(&PREAMBLE);
    buf.put_slice(span);
    buf.put_u8(additive_checksum(span));
    if let Some(crc) = crc {
        buf.put_u16(crc);
    }
    buf.freeze()
}

pub fn to_spaced_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect::<Vec<_>>().join(" ")
}

impl TryFrom<Bytes> for Frame {
    type Error = HaierError;

    /// Parse one complete frame, checking the CRC with CRC-16/ARC only
    fn try_from(bytes: Bytes) -> Result<Self, Self::Error> {
        Frame::parse(bytes, &CrcValidator::algorithmic())
    }
}

impl Frame {
    /// Parse exactly one complete frame. Integrity problems are reported in
    /// `validation`; only structurally unusable input is an error.
    pub fn parse(bytes: Bytes, validator: &CrcValidator) -> Result<Self, HaierError> {
        let min = PREAMBLE_SIZE + RAW_HEADER_SIZE + 1 + CHECKSUM_SIZE;
        if bytes.len() < min {
            return Err(HaierError::InsufficientData {
                expected: min,
                actual: bytes.len(),
            });
        }
        if bytes[..PREAMBLE_SIZE] != PREAMBLE {
            return Err(HaierError::InvalidFrame(format!(
                "missing preamble, got {:02x?}",
                &bytes[..PREAMBLE_SIZE]
            )));
        }

        let header = FrameHeaderRaw::read_from_bytes(&bytes[LENGTH_OFFSET..COMMAND_OFFSET])
            .map_err(|_| HaierError::InvalidFrame("header too short".to_string()))?;
        let flags = FrameFlags::from_bytes([header.flags]);
        let trailer = if flags.crc() { CRC_SIZE } else { 0 };

        let checksum_at = bytes.len() - trailer - CHECKSUM_SIZE;
        if checksum_at <= COMMAND_OFFSET {
            return Err(HaierError::InvalidFrame("frame has no command type".to_string()));
        }
        let body = &bytes[COMMAND_OFFSET..checksum_at];
        let command = CommandCode::parse(body)
            .ok_or_else(|| HaierError::InvalidFrame("frame has no command type".to_string()))?;
        let payload = bytes.slice(COMMAND_OFFSET + command.len()..checksum_at);
        let checksum = bytes[checksum_at];
        let crc = flags
            .crc()
            .then(|| u16::from_be_bytes([bytes[checksum_at + 1], bytes[checksum_at + 2]]));

        let span = &bytes[LENGTH_OFFSET..checksum_at];
        let observed = bytes.len() - PREAMBLE_SIZE - 1 - trailer;
        let validation = if header.length as usize != observed {
            Validation::LengthMismatch {
                declared: header.length,
                observed,
            }
        } else {
            validator.verify(span, checksum, crc)
        };

        Ok(Frame {
            flags,
            reserved: header.reserved,
            command,
            payload,
            checksum,
            crc,
            validation,
        })
    }
}

impl From<&Frame> for Bytes {
    fn from(frame: &Frame) -> Self {
        frame.to_bytes()
    }
}

/// A decoded frame tagged with the stream it came from and its timestamps
#[derive(Debug, Clone, PartialEq)]
pub struct ObservedFrame {
    pub direction: Direction,
    /// Milliseconds on the producing stream's own clock
    pub raw_timestamp: i64,
    /// Milliseconds on the shared logical clock
    pub timestamp: i64,
    pub frame: Frame,
}

impl ObservedFrame {
    pub fn kind(&self) -> CommandKind {
        self.frame.kind()
    }
}
