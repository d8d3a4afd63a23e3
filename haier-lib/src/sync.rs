use crate::frame::Direction;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use strum_macros::Display;
use tracing::{info, warn};

/// Coarse rating of how far apart the two capture clocks started
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SyncQuality {
    Excellent,
    Good,
    Fair,
    Poor,
}

impl SyncQuality {
    /// Rate an absolute base-time difference in milliseconds
    pub fn from_difference(diff_ms: u64) -> Self {
        match diff_ms {
            0..100 => SyncQuality::Excellent,
            100..1_000 => SyncQuality::Good,
            1_000..5_000 => SyncQuality::Fair,
            _ => SyncQuality::Poor,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    pub tx_base: Option<i64>,
    pub rx_base: Option<i64>,
    /// `rx_base - tx_base`, once both are known
    pub offset: Option<i64>,
    /// `None` until both bases are known
    pub quality: Option<SyncQuality>,
    pub warned: bool,
}

/// Maps the two independently-started capture clocks onto one timeline.
///
/// The first frame of each direction fixes that direction's base time. Once
/// both are known the offset `rx_base - tx_base` is computed once and added to
/// every outbound timestamp; inbound timestamps are the reference clock.
#[derive(Debug, Clone)]
pub struct TimestampSynchronizer {
    max_base_difference: Duration,
    tx_base: Option<i64>,
    rx_base: Option<i64>,
    offset: Option<i64>,
    warned: bool,
}

impl TimestampSynchronizer {
    pub fn new(max_base_difference: Duration) -> Self {
        Self {
            max_base_difference,
            tx_base: None,
            rx_base: None,
            offset: None,
            warned: false,
        }
    }

    /// Logical timestamp for a raw per-stream timestamp (milliseconds)
    pub fn sync_timestamp(&mut self, raw: i64, direction: Direction) -> i64 {
        match direction {
            Direction::Outbound => {
                self.tx_base.get_or_insert(raw);
            }
            Direction::Inbound => {
                self.rx_base.get_or_insert(raw);
            }
        }

        if self.offset.is_none() {
            if let (Some(tx), Some(rx)) = (self.tx_base, self.rx_base) {
                let offset = rx - tx;
                self.offset = Some(offset);
                let quality = SyncQuality::from_difference(offset.unsigned_abs());
                info!(tx_base = tx, rx_base = rx, offset, %quality, "Stream clocks synchronized");
                if offset.unsigned_abs() > self.max_base_difference.as_millis() as u64 {
                    self.warned = true;
                    warn!(
                        offset,
                        max_ms = self.max_base_difference.as_millis() as u64,
                        "Capture clocks differ more than expected, correlation continues"
                    );
                }
            }
        }

        match direction {
            Direction::Outbound => raw + self.offset.unwrap_or(0),
            Direction::Inbound => raw,
        }
    }

    pub fn offset(&self) -> Option<i64> {
        self.offset
    }

    pub fn quality(&self) -> Option<SyncQuality> {
        self.offset.map(|o| SyncQuality::from_difference(o.unsigned_abs()))
    }

    pub fn report(&self) -> SyncReport {
        SyncReport {
            tx_base: self.tx_base,
            rx_base: self.rx_base,
            offset: self.offset,
            quality: self.quality(),
            warned: self.warned,
        }
    }

    pub fn reset(&mut self) {
        self.tx_base = None;
        self.rx_base = None;
        self.offset = None;
        self.warned = false;
    }
}
