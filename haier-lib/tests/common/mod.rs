//! Common test utilities and shared imports

// Shared across test files; not every item is used in every file
#[allow(unused_imports)]
pub use bytes::{Bytes, BytesMut};
#[allow(unused_imports)]
pub use haier_lib::codec::{DecodeOutcome, DesyncReason, FrameCodec, decode_all};
#[allow(unused_imports)]
pub use haier_lib::command::CommandKind;
#[allow(unused_imports)]
pub use haier_lib::frame::{CommandCode, Direction, Frame, FrameFlags};
#[allow(unused_imports)]
pub use hex;

/// Decode a space separated hex string
#[allow(dead_code)]
pub fn hex_to_bytes(hex_data: &str) -> Bytes {
    Bytes::from(hex::decode(hex_data.replace(' ', "")).expect("Failed to decode hex"))
}

/// Program 1 start command as captured from the controller
#[allow(dead_code)]
pub const PROGRAM_1: &str = "ff ff 0e 40 00 00 00 00 00 60 00 01 01 00 00 00 b0 34 ad";

/// Reset command as captured from the controller
#[allow(dead_code)]
pub const RESET: &str = "ff ff 0c 40 00 00 00 00 00 01 5d 1f 00 01 ca bb 9b";

/// Link-level session start frame (flags 0x00, no CRC)
#[allow(dead_code)]
pub fn session_start() -> Frame {
    Frame::with_header(FrameFlags::link_level(), [0; 5], CommandCode::Single(0x70), vec![0x00, 0x01])
}

/// Controller auth challenge with opaque challenge bytes
#[allow(dead_code)]
pub fn auth_challenge(challenge: &[u8]) -> Frame {
    let mut payload = vec![0x02, 0x00, 0x01];
    payload.extend_from_slice(challenge);
    Frame::new(CommandCode::Double(0x12, 0x10), payload)
}

/// Modem auth response with opaque response bytes
#[allow(dead_code)]
pub fn auth_response(response: &[u8]) -> Frame {
    let mut payload = vec![0x02, 0x00, 0x01];
    payload.extend_from_slice(response);
    Frame::new(CommandCode::Double(0x11, 0x10), payload)
}

/// One capture-file line for `frame`
#[allow(dead_code)]
pub fn capture_line(direction: Direction, timestamp_ms: i64, frame: &Frame) -> String {
    format!("{} {} - {}\n", direction.source_name(), timestamp_ms, frame.hex_string())
}

/// Install a test subscriber once; honours RUST_LOG
#[allow(dead_code)]
pub fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_test_writer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .try_init();
}
