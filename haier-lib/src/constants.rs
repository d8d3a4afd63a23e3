// Wire constants for the washer <-> modem serial protocol

/// Two-byte marker in front of every frame
pub const PREAMBLE: [u8; 2] = [0xFF, 0xFF];

/// Size of the preamble
pub const PREAMBLE_SIZE: usize = 2;

/// Offset of the length byte
pub const LENGTH_OFFSET: usize = 2;

/// Offset of the flags byte
pub const FLAGS_OFFSET: usize = 3;

/// Offset of the 5 reserved bytes
pub const RESERVED_OFFSET: usize = 4;

/// Size of the reserved span
pub const RESERVED_SIZE: usize = 5;

/// Offset of the first command-type byte
pub const COMMAND_OFFSET: usize = RESERVED_OFFSET + RESERVED_SIZE;

/// Size of the fixed header covered by the length byte (flags + reserved)
pub const FIXED_HEADER_SIZE: usize = 1 + RESERVED_SIZE;

/// Size of the raw header after the preamble (length + flags + reserved)
pub const RAW_HEADER_SIZE: usize = 1 + FIXED_HEADER_SIZE;

/// Size of the additive checksum
pub const CHECKSUM_SIZE: usize = 1;

/// Size of the optional CRC-16 trailer
pub const CRC_SIZE: usize = 2;

/// Smallest legal value of the length byte: flags, reserved, one command byte, checksum
pub const MIN_LENGTH: u8 = (FIXED_HEADER_SIZE + 1 + CHECKSUM_SIZE) as u8;

/// Largest length byte observed in captured traffic, with headroom.
/// Anything above is treated as a desync rather than a frame.
pub const MAX_LENGTH: u8 = 0x60;

/// Flags bit announcing the CRC-16 trailer
pub const FLAG_CRC: u8 = 0x40;

/// First bytes of two-byte command types
pub const COMMAND_FAMILY_PREFIXES: [u8; 7] = [0x01, 0x0F, 0x11, 0x12, 0x4D, 0x51, 0x6D];

/// Payload status bytes signalling a device-side error
pub const ERROR_STATUS_RANGE: std::ops::RangeInclusive<u8> = 0xE1..=0xEF;

/// Capture payload written when a side power-cycles
pub const POWER_CYCLE_MARKER: [u8; 1] = [0x00];
