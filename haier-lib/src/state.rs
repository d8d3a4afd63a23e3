//! Session-level conversation state machine.
//!
//! Transitions come from one table keyed by `(state, direction, kind)`.
//! Per-state rules are written out explicitly; a short list of global rules
//! (session start, reset, auth challenge) fills in every state that does not
//! define the same key itself. Building the table rejects two per-state rules
//! for the same key, so there is never a silent overwrite. Keys not in the
//! table leave the state unchanged.

use crate::command::CommandKind;
use crate::error::HaierError;
use crate::frame::{Direction, ObservedFrame};
use crate::session::{Session, TransitionRecord};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use strum_macros::Display;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize, Deserialize)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConversationState {
    Idle,
    SessionStart,
    ControllerReady,
    HandshakeInit,
    ImeiBroadcast,
    StatusQuery,
    ComplexCommand,
    Authenticating,
    Authenticated,
    DeviceInfo,
    FirmwareQuery,
    SerialQuery,
    Active,
    Error,
}

impl ConversationState {
    pub const ALL: [ConversationState; 14] = [
        ConversationState::Idle,
        ConversationState::SessionStart,
        ConversationState::ControllerReady,
        ConversationState::HandshakeInit,
        ConversationState::ImeiBroadcast,
        ConversationState::StatusQuery,
        ConversationState::ComplexCommand,
        ConversationState::Authenticating,
        ConversationState::Authenticated,
        ConversationState::DeviceInfo,
        ConversationState::FirmwareQuery,
        ConversationState::SerialQuery,
        ConversationState::Active,
        ConversationState::Error,
    ];

    /// States in which an inbound auth response closes a pending attempt
    pub fn is_authenticated(&self) -> bool {
        matches!(self, ConversationState::Authenticated | ConversationState::Active)
    }
}

/// Direction selector used in rule definitions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum On {
    Tx,
    Rx,
    Either,
}

impl On {
    fn directions(self) -> &'static [Direction] {
        match self {
            On::Tx => &[Direction::Outbound],
            On::Rx => &[Direction::Inbound],
            On::Either => &[Direction::Outbound, Direction::Inbound],
        }
    }
}

/// `(from, direction, kind) -> to`
pub type Rule = (ConversationState, On, CommandKind, ConversationState);

/// `(direction, kind) -> to`, applied to every state without its own rule
pub type GlobalRule = (On, CommandKind, ConversationState);

use CommandKind as K;
use ConversationState as S;

#[rustfmt::skip]
pub const STATE_RULES: &[Rule] = &[
    (S::Idle,            On::Tx,     K::ControllerReady, S::ControllerReady),

    (S::SessionStart,    On::Tx,     K::ControllerReady, S::ControllerReady),
    (S::SessionStart,    On::Rx,     K::HandshakeInit,   S::HandshakeInit),

    (S::ControllerReady, On::Rx,     K::HandshakeInit,   S::HandshakeInit),
    (S::ControllerReady, On::Rx,     K::ImeiBroadcast,   S::ImeiBroadcast),

    (S::HandshakeInit,   On::Rx,     K::ImeiBroadcast,   S::ImeiBroadcast),
    (S::HandshakeInit,   On::Either, K::StatusQuery,     S::StatusQuery),

    (S::ImeiBroadcast,   On::Either, K::StatusQuery,     S::StatusQuery),
    (S::ImeiBroadcast,   On::Either, K::ComplexCommand,  S::ComplexCommand),

    (S::StatusQuery,     On::Either, K::ComplexCommand,  S::ComplexCommand),

    (S::ComplexCommand,  On::Either, K::StatusQuery,     S::StatusQuery),

    (S::Authenticating,  On::Rx,     K::AuthResponse,    S::Authenticated),

    (S::Authenticated,   On::Either, K::ModelInfo,       S::DeviceInfo),
    (S::Authenticated,   On::Either, K::FirmwareInfo,    S::FirmwareQuery),
    (S::Authenticated,   On::Either, K::SerialInfo,      S::SerialQuery),
    (S::Authenticated,   On::Either, K::StatusResponse,  S::Active),
    (S::Authenticated,   On::Either, K::DataResponse,    S::Active),
    (S::Authenticated,   On::Tx,     K::ProgramStart,    S::Active),

    (S::DeviceInfo,      On::Either, K::FirmwareInfo,    S::FirmwareQuery),
    (S::DeviceInfo,      On::Either, K::SerialInfo,      S::SerialQuery),
    (S::DeviceInfo,      On::Either, K::StatusResponse,  S::Active),
    (S::DeviceInfo,      On::Tx,     K::ProgramStart,    S::Active),

    (S::FirmwareQuery,   On::Either, K::ModelInfo,       S::DeviceInfo),
    (S::FirmwareQuery,   On::Either, K::SerialInfo,      S::SerialQuery),
    (S::FirmwareQuery,   On::Either, K::StatusResponse,  S::Active),
    (S::FirmwareQuery,   On::Tx,     K::ProgramStart,    S::Active),

    (S::SerialQuery,     On::Either, K::ModelInfo,       S::DeviceInfo),
    (S::SerialQuery,     On::Either, K::FirmwareInfo,    S::FirmwareQuery),
    (S::SerialQuery,     On::Either, K::StatusResponse,  S::Active),
    (S::SerialQuery,     On::Either, K::DataResponse,    S::Active),
    (S::SerialQuery,     On::Tx,     K::ProgramStart,    S::Active),

    (S::Active,          On::Either, K::ModelInfo,       S::DeviceInfo),

    // only session start and reset leave the error state
    (S::Error,           On::Tx,     K::AuthChallenge,   S::Error),
];

#[rustfmt::skip]
pub const GLOBAL_RULES: &[GlobalRule] = &[
    (On::Either, K::SessionStart,  S::SessionStart),
    (On::Tx,     K::Reset,         S::Idle),
    (On::Tx,     K::AuthChallenge, S::Authenticating),
];

type Key = (ConversationState, Direction, CommandKind);

#[derive(Debug, Clone)]
pub struct TransitionTable {
    rules: HashMap<Key, ConversationState>,
}

impl TransitionTable {
    /// Build a table, rejecting per-state rules that define the same key twice
    pub fn from_rules(state_rules: &[Rule], global_rules: &[GlobalRule]) -> Result<Self, HaierError> {
        let mut rules = HashMap::new();
        for &(from, on, kind, to) in state_rules {
            for &direction in on.directions() {
                if let Some(existing) = rules.insert((from, direction, kind), to) {
                    return Err(HaierError::Configuration(format!(
                        "ambiguous transition {from} {direction} {kind}: {existing} vs {to}"
                    )));
                }
            }
        }
        for &(on, kind, to) in global_rules {
            for state in ConversationState::ALL {
                for &direction in on.directions() {
                    rules.entry((state, direction, kind)).or_insert(to);
                }
            }
        }
        Ok(Self { rules })
    }

    /// The built-in washer/modem table
    pub fn standard() -> Self {
        Self::from_rules(STATE_RULES, GLOBAL_RULES).expect("built-in transition rules are unambiguous")
    }

    /// Next state, or `None` when the key is not in the table
    pub fn next(&self, state: ConversationState, direction: Direction, kind: CommandKind) -> Option<ConversationState> {
        self.rules.get(&(state, direction, kind)).copied()
    }

    /// Total transition function: unknown keys map to the current state
    pub fn transition(&self, state: ConversationState, direction: Direction, kind: CommandKind) -> ConversationState {
        self.next(state, direction, kind).unwrap_or(state)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

impl Default for TransitionTable {
    fn default() -> Self {
        Self::standard()
    }
}

/// What one frame did to a session
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FrameEffect {
    /// Position of the frame in the session history
    pub sequence: u64,
    pub transition: Option<TransitionRecord>,
    pub error_signal: bool,
    pub retry: bool,
    pub auth_opened: bool,
    pub auth_resolved: Option<Duration>,
}

/// Applies frames to a [`Session`]. Holds no session data itself.
#[derive(Debug, Clone)]
pub struct ConversationStateMachine {
    table: TransitionTable,
    error_threshold: u32,
}

impl Default for ConversationStateMachine {
    fn default() -> Self {
        Self::new(TransitionTable::standard(), 3)
    }
}

impl ConversationStateMachine {
    pub fn new(table: TransitionTable, error_threshold: u32) -> Self {
        Self {
            table,
            error_threshold: error_threshold.max(1),
        }
    }

    pub fn table(&self) -> &TransitionTable {
        &self.table
    }

    /// Record `observed` in the session and move the state machine
    pub fn apply(&self, session: &mut Session, observed: &ObservedFrame) -> FrameEffect {
        let direction = observed.direction;
        let frame = &observed.frame;
        let kind = frame.kind();
        let timestamp = observed.timestamp;

        let mut effect = FrameEffect {
            sequence: session.history.len() as u64,
            ..FrameEffect::default()
        };

        if session.is_retry_of_last(direction, frame) {
            session.retry_count += 1;
            effect.retry = true;
        }

        effect.error_signal = !frame.validation.is_valid() || frame.has_error_status();
        if effect.error_signal {
            session.error_count += 1;
            session.consecutive_errors += 1;
        } else {
            session.consecutive_errors = 0;
        }

        session.history.push(crate::session::HistoryEntry {
            direction,
            frame: frame.clone(),
            timestamp,
        });
        session.last_activity = session.last_activity.max(timestamp);

        let from = session.state;
        let to = if effect.error_signal && session.consecutive_errors >= self.error_threshold {
            warn!(
                session = session.id,
                errors = session.consecutive_errors,
                "Consecutive error threshold reached"
            );
            ConversationState::Error
        } else if frame.validation.is_valid() {
            self.table.transition(from, direction, kind)
        } else {
            from
        };

        if to != from {
            let record = TransitionRecord {
                timestamp,
                from,
                to,
                direction,
                kind,
                sequence: effect.sequence,
            };
            info!(session = session.id, %from, %to, %direction, %kind, "State transition");
            session.state = to;
            session.transitions.push(record.clone());
            effect.transition = Some(record);
        }

        if frame.validation.is_valid() {
            match (direction, kind) {
                (Direction::Outbound, CommandKind::AuthChallenge) => {
                    session.open_auth_attempt(frame.payload.clone(), timestamp);
                    effect.auth_opened = true;
                    debug!(session = session.id, challenge = hex::encode(&frame.payload), "Auth challenge");
                }
                (Direction::Inbound, CommandKind::AuthResponse) if session.state.is_authenticated() => {
                    effect.auth_resolved = session.resolve_auth_attempt(frame.payload.clone(), timestamp);
                    if let Some(latency) = effect.auth_resolved {
                        info!(
                            session = session.id,
                            latency_ms = latency.as_millis() as u64,
                            "Auth attempt resolved"
                        );
                    }
                }
                _ => {}
            }
        }

        effect
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_table_builds() {
        let table = TransitionTable::standard();
        assert!(!table.is_empty());
    }

    #[test]
    fn test_duplicate_rule_is_rejected() {
        let rules: &[Rule] = &[
            (S::Idle, On::Either, K::ControllerReady, S::ControllerReady),
            (S::Idle, On::Tx, K::ControllerReady, S::SessionStart),
        ];
        assert!(matches!(
            TransitionTable::from_rules(rules, &[]),
            Err(HaierError::Configuration(_))
        ));
    }

    #[test]
    fn test_state_rule_overrides_global() {
        let table = TransitionTable::standard();
        assert_eq!(
            table.transition(S::Error, Direction::Outbound, K::AuthChallenge),
            S::Error
        );
        assert_eq!(
            table.transition(S::Active, Direction::Outbound, K::AuthChallenge),
            S::Authenticating
        );
        assert_eq!(table.transition(S::Error, Direction::Inbound, K::SessionStart), S::SessionStart);
        assert_eq!(table.transition(S::Error, Direction::Outbound, K::Reset), S::Idle);
    }

    #[test]
    fn test_auth_response_direction_matters() {
        let table = TransitionTable::standard();
        assert_eq!(
            table.transition(S::Authenticating, Direction::Inbound, K::AuthResponse),
            S::Authenticated
        );
        assert_eq!(table.next(S::Authenticating, Direction::Outbound, K::AuthResponse), None);
    }
}
