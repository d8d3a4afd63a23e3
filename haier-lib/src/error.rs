use std::io;
use thiserror::Error;

/// The primary error type for the `haier-lib` library.
///
/// Wire-level noise never shows up here: desyncs, checksum failures and
/// pairing timeouts are reported as data by the codec, the frames themselves
/// and the pairer counters.
#[derive(Error, Debug)]
pub enum HaierError {
    #[error("Serial port error: {0}")]
    Serial(#[from] tokio_serial::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Timeout during serial operation: {0}")]
    Timeout(#[from] tokio::time::error::Elapsed),

    #[error("Transport on {port} failed after {attempts} attempt(s): {message}")]
    Transport {
        port: String,
        attempts: u32,
        message: String,
    },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("Insufficient data: expected at least {expected} bytes, got {actual}")]
    InsufficientData { expected: usize, actual: usize },

    #[error("Invalid hex: {0}")]
    InvalidHex(#[from] hex::FromHexError),

    #[error("Capture parse error at line {line}: {message}")]
    Capture { line: usize, message: String },

    #[error("Configuration file error: {0}")]
    ConfigFile(#[from] serde_json::Error),

    #[error("Replay stopped before frame {index}")]
    ReplayAborted { index: usize },

    #[error("Link closed")]
    LinkClosed,

    #[error("Event channel closed")]
    ChannelClosed,
}

impl HaierError {
    /// True for failures that only concern one physical link and can be
    /// retried by reopening the port. The monitor gives a link up on
    /// anything else.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            HaierError::Serial(_)
                | HaierError::Io(_)
                | HaierError::Timeout(_)
                | HaierError::Transport { .. }
                | HaierError::LinkClosed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_link_failures_are_retried() {
        assert!(HaierError::LinkClosed.is_transport());
        assert!(HaierError::Io(io::Error::from(io::ErrorKind::BrokenPipe)).is_transport());
        assert!(
            HaierError::Transport {
                port: "/dev/ttyUSB0".to_string(),
                attempts: 3,
                message: "busy".to_string(),
            }
            .is_transport()
        );
        assert!(!HaierError::ChannelClosed.is_transport());
        assert!(!HaierError::InvalidFrame("too long".to_string()).is_transport());
        assert!(!HaierError::Configuration("baud".to_string()).is_transport());
    }
}
