use crate::command::CommandKind;
use crate::frame::{Direction, Frame};
use crate::sync::SyncQuality;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{debug, trace};

/// An outbound frame and the inbound frame that answered it
#[derive(Debug, Clone, PartialEq)]
pub struct PairedEvent {
    pub request: Frame,
    pub response: Frame,
    pub request_timestamp: i64,
    pub response_timestamp: i64,
    /// Response time on the logical clock, clamped at zero
    pub latency: Duration,
}

impl PairedEvent {
    pub fn request_kind(&self) -> CommandKind {
        self.request.kind()
    }

    pub fn response_kind(&self) -> CommandKind {
        self.response.kind()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairerStats {
    pub paired: u64,
    /// Entries that aged out of the pairing window, or were left over at flush
    pub unpaired: u64,
    /// Entries pushed out because a queue was full
    pub dropped: u64,
}

#[derive(Debug, Clone)]
struct Pending {
    frame: Frame,
    timestamp: i64,
}

/// Pairing window per synchronization quality
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairingWindows {
    #[serde(with = "crate::config::millis")]
    pub excellent: Duration,
    #[serde(with = "crate::config::millis")]
    pub good: Duration,
    #[serde(with = "crate::config::millis")]
    pub fair: Duration,
    #[serde(with = "crate::config::millis")]
    pub poor: Duration,
}

impl Default for PairingWindows {
    fn default() -> Self {
        Self {
            excellent: Duration::from_secs(2),
            good: Duration::from_secs(5),
            fair: Duration::from_secs(8),
            poor: Duration::from_secs(10),
        }
    }
}

impl PairingWindows {
    pub fn for_quality(&self, quality: SyncQuality) -> Duration {
        match quality {
            SyncQuality::Excellent => self.excellent,
            SyncQuality::Good => self.good,
            SyncQuality::Fair => self.fair,
            SyncQuality::Poor => self.poor,
        }
    }
}

/// Correlates outbound requests with the inbound frames that answer them.
///
/// Only outbound frames that expect an answer are queued, and only inbound
/// frames that are answers are queued when nothing matches them. Both queues
/// are bounded; overflow drops the oldest entry and counts it.
#[derive(Debug, Clone)]
pub struct PacketPairer {
    window: Duration,
    capacity: usize,
    outbound: VecDeque<Pending>,
    inbound: VecDeque<Pending>,
    stats: PairerStats,
}

impl PacketPairer {
    pub fn new(window: Duration, capacity: usize) -> Self {
        Self {
            window,
            capacity: capacity.max(1),
            outbound: VecDeque::new(),
            inbound: VecDeque::new(),
            stats: PairerStats::default(),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn set_window(&mut self, window: Duration) {
        self.window = window;
    }

    pub fn stats(&self) -> PairerStats {
        self.stats
    }

    pub fn pending(&self) -> (usize, usize) {
        (self.outbound.len(), self.inbound.len())
    }

    /// Feed one frame; returns the pairing it completes, if any
    pub fn add_frame(&mut self, frame: &Frame, direction: Direction, timestamp: i64) -> Option<PairedEvent> {
        self.evict_expired(timestamp);
        let kind = frame.kind();
        match direction {
            Direction::Outbound => {
                if kind.expects_response() {
                    Self::push_bounded(&mut self.outbound, self.capacity, &mut self.stats, Pending {
                        frame: frame.clone(),
                        timestamp,
                    });
                }
                None
            }
            Direction::Inbound => {
                let position = self
                    .outbound
                    .iter()
                    .position(|p| p.frame.kind().accepts_response(kind) && self.within_window(p.timestamp, timestamp));
                match position {
                    Some(index) => {
                        let request = self.outbound.remove(index)?;
                        self.stats.paired += 1;
                        let latency = Duration::from_millis((timestamp - request.timestamp).max(0) as u64);
                        debug!(
                            request = %request.frame.kind(),
                            response = %kind,
                            latency_ms = latency.as_millis() as u64,
                            "Paired frames"
                        );
                        Some(PairedEvent {
                            request: request.frame,
                            response: frame.clone(),
                            request_timestamp: request.timestamp,
                            response_timestamp: timestamp,
                            latency,
                        })
                    }
                    None => {
                        if kind.is_response() {
                            Self::push_bounded(&mut self.inbound, self.capacity, &mut self.stats, Pending {
                                frame: frame.clone(),
                                timestamp,
                            });
                        }
                        None
                    }
                }
            }
        }
    }

    fn within_window(&self, request_ts: i64, response_ts: i64) -> bool {
        // clock skew can put a response slightly before its request
        (response_ts - request_ts).max(0) as u128 <= self.window.as_millis()
    }

    fn push_bounded(queue: &mut VecDeque<Pending>, capacity: usize, stats: &mut PairerStats, entry: Pending) {
        if queue.len() >= capacity {
            queue.pop_front();
            stats.dropped += 1;
        }
        queue.push_back(entry);
    }

    /// Drop entries older than the window relative to `now`
    pub fn evict_expired(&mut self, now: i64) {
        let window = self.window.as_millis() as i64;
        for queue in [&mut self.outbound, &mut self.inbound] {
            while let Some(front) = queue.front() {
                if now - front.timestamp > window {
                    trace!(kind = %front.frame.kind(), "Evicting unpaired frame");
                    queue.pop_front();
                    self.stats.unpaired += 1;
                } else {
                    break;
                }
            }
        }
    }

    /// Count everything still pending as unpaired and clear the queues
    pub fn flush(&mut self) -> u64 {
        let leftover = (self.outbound.len() + self.inbound.len()) as u64;
        self.outbound.clear();
        self.inbound.clear();
        self.stats.unpaired += leftover;
        leftover
    }
}
