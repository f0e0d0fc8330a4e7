use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Counters kept by the signaling server.
#[derive(Default, Debug)]
pub struct RelayStats {
    frames_forwarded: AtomicU64,
    bytes_forwarded: AtomicU64,
    frames_dropped: AtomicU64,
    control_forwarded: AtomicU64,
    control_dropped: AtomicU64,
}

impl RelayStats {
    pub fn on_frame_forwarded(&self, n: usize) {
        self.frames_forwarded.fetch_add(1, Ordering::Relaxed);
        self.bytes_forwarded.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn on_frame_dropped(&self) {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_control_forwarded(&self) {
        self.control_forwarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_control_dropped(&self) {
        self.control_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> RelayStatsSnapshot {
        RelayStatsSnapshot {
            frames_forwarded: self.frames_forwarded.load(Ordering::Relaxed),
            bytes_forwarded: self.bytes_forwarded.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            control_forwarded: self.control_forwarded.load(Ordering::Relaxed),
            control_dropped: self.control_dropped.load(Ordering::Relaxed),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayStatsSnapshot {
    pub frames_forwarded: u64,
    pub bytes_forwarded: u64,
    pub frames_dropped: u64,
    pub control_forwarded: u64,
    pub control_dropped: u64,
}
