use num_enum::{FromPrimitive, IntoPrimitive};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use strum_macros::Display;

/// Semantic meaning of a frame, keyed by its command code.
///
/// Single-byte codes use the low byte, two-byte codes are big-endian
/// `family << 8 | sub`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, IntoPrimitive, FromPrimitive, Serialize, Deserialize)]
#[repr(u16)]
pub enum CommandKind {
    // two-byte families
    HandshakeInit = 0x014D,
    Reset = 0x015D,
    ResetConfirm = 0x0F5A,
    ImeiBroadcast = 0x1100,
    AuthResponse = 0x1110,
    AuthChallenge = 0x1210,
    HeartbeatAck = 0x4D61,
    ControlSignal = 0x5164,
    StatusResponse = 0x6D01,
    DataResponse = 0x6D02,

    // single byte
    ProgramStart = 0x60,
    Ack = 0x61,
    FirmwareInfo = 0x62,
    ControllerReady = 0x70,
    HandshakeAck = 0x73,
    SerialInfo = 0xEA,
    ModelInfo = 0xEC,
    StatusQuery = 0xF3,
    QueryAck = 0xF5,
    ComplexCommand = 0xF7,

    /// Link-level frame (flags 0x00), assigned from the flags byte rather
    /// than the code. The value cannot collide with a wire code.
    SessionStart = 0xFF00,

    #[num_enum(catch_all)]
    Unknown(u16),
}

/// Groups used to pick replay inter-frame delays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
pub enum TimingCategory {
    Ack,
    Status,
    Auth,
    ProgramStart,
    Reset,
    Default,
}

impl TimingCategory {
    /// Base delay before the next frame, before the timing factor is applied
    pub fn base_delay(&self) -> Duration {
        match self {
            TimingCategory::Ack => Duration::from_millis(50),
            TimingCategory::Status => Duration::from_millis(100),
            TimingCategory::Auth => Duration::from_millis(200),
            TimingCategory::ProgramStart => Duration::from_millis(500),
            TimingCategory::Reset => Duration::from_millis(1000),
            TimingCategory::Default => Duration::from_millis(100),
        }
    }
}

impl CommandKind {
    pub fn timing_category(&self) -> TimingCategory {
        match self {
            CommandKind::Ack | CommandKind::HeartbeatAck | CommandKind::QueryAck => TimingCategory::Ack,
            CommandKind::StatusQuery | CommandKind::StatusResponse | CommandKind::DataResponse => {
                TimingCategory::Status
            }
            CommandKind::AuthChallenge | CommandKind::AuthResponse => TimingCategory::Auth,
            CommandKind::ProgramStart => TimingCategory::ProgramStart,
            CommandKind::Reset | CommandKind::ResetConfirm => TimingCategory::Reset,
            _ => TimingCategory::Default,
        }
    }

    /// Kinds whose first payload byte is a status code
    pub fn carries_status(&self) -> bool {
        matches!(
            self,
            CommandKind::StatusResponse | CommandKind::DataResponse | CommandKind::Ack
        )
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, CommandKind::AuthChallenge | CommandKind::AuthResponse)
    }

    /// Responses that answer a request of this kind. Empty for kinds that
    /// expect no answer.
    pub fn expected_responses(&self) -> &'static [CommandKind] {
        use CommandKind::*;
        match self {
            AuthChallenge => &[AuthResponse],
            ProgramStart => &[Ack, HeartbeatAck, StatusResponse],
            StatusQuery => &[StatusResponse, DataResponse, QueryAck],
            ComplexCommand => &[QueryAck, Ack, StatusResponse],
            Reset => &[ResetConfirm, Ack],
            ControllerReady => &[HandshakeInit],
            ControlSignal => &[Ack, HeartbeatAck],
            ModelInfo => &[ModelInfo],
            FirmwareInfo => &[FirmwareInfo],
            SerialInfo => &[SerialInfo],
            _ => &[],
        }
    }

    pub fn expects_response(&self) -> bool {
        !self.expected_responses().is_empty()
    }

    /// True if `response` is a structurally compatible answer to `self`
    pub fn accepts_response(&self, response: CommandKind) -> bool {
        self.expected_responses().contains(&response)
    }

    /// True if this kind appears as an answer to some request
    pub fn is_response(&self) -> bool {
        use CommandKind::*;
        matches!(
            self,
            AuthResponse
                | Ack
                | HeartbeatAck
                | StatusResponse
                | DataResponse
                | QueryAck
                | ResetConfirm
                | HandshakeInit
                | ModelInfo
                | FirmwareInfo
                | SerialInfo
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_from_code() {
        assert_eq!(CommandKind::from_primitive(0x1210), CommandKind::AuthChallenge);
        assert_eq!(CommandKind::from_primitive(0x60), CommandKind::ProgramStart);
        assert_eq!(CommandKind::from_primitive(0x99), CommandKind::Unknown(0x99));
        let code: u16 = CommandKind::StatusResponse.into();
        assert_eq!(code, 0x6D01);
    }

    #[test]
    fn test_compatibility_is_directional() {
        assert!(CommandKind::AuthChallenge.accepts_response(CommandKind::AuthResponse));
        assert!(!CommandKind::AuthChallenge.accepts_response(CommandKind::Ack));
        assert!(!CommandKind::AuthResponse.accepts_response(CommandKind::AuthChallenge));
        assert!(CommandKind::ProgramStart.accepts_response(CommandKind::Ack));
        assert!(CommandKind::ProgramStart.accepts_response(CommandKind::StatusResponse));
    }

    #[test]
    fn test_every_expected_response_is_a_response_kind() {
        let requests = [
            CommandKind::AuthChallenge,
            CommandKind::ProgramStart,
            CommandKind::StatusQuery,
            CommandKind::ComplexCommand,
            CommandKind::Reset,
            CommandKind::ControllerReady,
            CommandKind::ControlSignal,
            CommandKind::ModelInfo,
            CommandKind::FirmwareInfo,
            CommandKind::SerialInfo,
        ];
        for request in requests {
            for response in request.expected_responses() {
                assert!(response.is_response(), "{} answers {} but is not a response kind", response, request);
            }
        }
    }
}
