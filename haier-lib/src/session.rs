use crate::command::CommandKind;
use crate::frame::{Direction, Frame};
use crate::state::ConversationState;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One frame in a session's history
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEntry {
    pub direction: Direction,
    pub frame: Frame,
    pub timestamp: i64,
}

/// One state change with the frame that caused it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub timestamp: i64,
    pub from: ConversationState,
    pub to: ConversationState,
    pub direction: Direction,
    pub kind: CommandKind,
    /// Position of the triggering frame in the session history
    pub sequence: u64,
}

/// An authentication challenge and, once seen, its answer.
///
/// Challenge and response bytes are opaque; nothing here interprets them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthAttempt {
    pub challenge: Bytes,
    pub challenged_at: i64,
    pub resolution: Option<AuthResolution>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthResolution {
    pub response: Bytes,
    pub responded_at: i64,
    pub latency: Duration,
}

impl AuthAttempt {
    pub fn is_pending(&self) -> bool {
        self.resolution.is_none()
    }
}

/// Everything known about one conversation between controller and modem.
///
/// Created by the monitor when the first frame of a session is seen and
/// replaced on reset; there is no global session state.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub id: u64,
    pub started_at: i64,
    pub last_activity: i64,
    pub state: ConversationState,
    pub history: Vec<HistoryEntry>,
    pub transitions: Vec<TransitionRecord>,
    pub auth_attempts: Vec<AuthAttempt>,
    pub error_count: u64,
    pub retry_count: u64,
    pub(crate) consecutive_errors: u32,
}

impl Session {
    pub fn new(id: u64, started_at: i64) -> Self {
        Self {
            id,
            started_at,
            last_activity: started_at,
            state: ConversationState::Idle,
            history: Vec::new(),
            transitions: Vec::new(),
            auth_attempts: Vec::new(),
            error_count: 0,
            retry_count: 0,
            consecutive_errors: 0,
        }
    }

    pub fn frame_count(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    /// True if the previous history entry has the same direction and command
    pub fn is_retry_of_last(&self, direction: Direction, frame: &Frame) -> bool {
        self.history
            .last()
            .is_some_and(|last| last.direction == direction && last.frame.command == frame.command)
    }

    pub fn pending_auth(&self) -> impl Iterator<Item = &AuthAttempt> {
        self.auth_attempts.iter().filter(|a| a.is_pending())
    }

    pub fn resolved_auth(&self) -> impl Iterator<Item = &AuthAttempt> {
        self.auth_attempts.iter().filter(|a| !a.is_pending())
    }

    pub(crate) fn open_auth_attempt(&mut self, challenge: Bytes, at: i64) {
        self.auth_attempts.push(AuthAttempt {
            challenge,
            challenged_at: at,
            resolution: None,
        });
    }

    /// Resolve the most recent pending attempt; returns its latency
    pub(crate) fn resolve_auth_attempt(&mut self, response: Bytes, at: i64) -> Option<Duration> {
        let attempt = self.auth_attempts.iter_mut().rev().find(|a| a.is_pending())?;
        let latency = Duration::from_millis((at - attempt.challenged_at).max(0) as u64);
        attempt.resolution = Some(AuthResolution {
            response,
            responded_at: at,
            latency,
        });
        Some(latency)
    }

    pub fn duration(&self) -> Duration {
        Duration::from_millis((self.last_activity - self.started_at).max(0) as u64)
    }

    /// Lightweight view for consumers that do not need the full history
    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id,
            state: self.state,
            started_at: self.started_at,
            last_activity: self.last_activity,
            frames: self.history.len(),
            transitions: self.transitions.len(),
            auth_attempts: self.auth_attempts.len(),
            auth_pending: self.pending_auth().count(),
            error_count: self.error_count,
            retry_count: self.retry_count,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: u64,
    pub state: ConversationState,
    pub started_at: i64,
    pub last_activity: i64,
    pub frames: usize,
    pub transitions: usize,
    pub auth_attempts: usize,
    pub auth_pending: usize,
    pub error_count: u64,
    pub retry_count: u64,
}
