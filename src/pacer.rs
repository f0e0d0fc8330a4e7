use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;

use crate::errors::{TransferError, TransferResult};

const KIB: usize = 1024;
const MIB: u64 = 1024 * 1024;

pub const MIN_CHUNK_SIZE: usize = 32 * KIB;
pub const GROW_BELOW_BUFFERED: u64 = MIB;
pub const SHRINK_ABOVE_BUFFERED: u64 = 8 * MIB;
pub const ADJUST_INTERVAL: Duration = Duration::from_millis(300);

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum TransportKind {
    Direct,
    Relay,
}

impl TransportKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TransportKind::Direct => "direct",
            TransportKind::Relay => "relay",
        }
    }

    pub fn base_chunk_size(self) -> usize {
        match self {
            TransportKind::Direct => 128 * KIB,
            TransportKind::Relay => 64 * KIB,
        }
    }

    pub fn max_chunk_size(self) -> usize {
        match self {
            TransportKind::Direct => 512 * KIB,
            TransportKind::Relay => 256 * KIB,
        }
    }

    /// Hard ceiling on buffered bytes; sends wait until the transport drains below it.
    pub fn buffered_ceiling(self) -> u64 {
        match self {
            TransportKind::Direct => 16 * MIB,
            TransportKind::Relay => 8 * MIB,
        }
    }
}

/// Picks the size of the next chunk from how much the transport still has buffered.
///
/// Growth is time-gated and shrinking is not, and the two thresholds are far
/// apart, so short bursts of buffering do not make the size oscillate.
#[derive(Debug, Clone)]
pub struct AdaptivePacer {
    kind: TransportKind,
    current: usize,
    last_adjust: Instant,
}

impl AdaptivePacer {
    pub fn new(kind: TransportKind) -> Self {
        Self {
            kind,
            current: kind.base_chunk_size(),
            last_adjust: Instant::now(),
        }
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn current_size(&self) -> usize {
        self.current
    }

    pub fn next_chunk_size(&mut self, buffered: u64) -> usize {
        self.next_chunk_size_at(buffered, Instant::now())
    }

    pub fn next_chunk_size_at(&mut self, buffered: u64, now: Instant) -> usize {
        let elapsed = now.saturating_duration_since(self.last_adjust);
        if buffered < GROW_BELOW_BUFFERED && elapsed >= ADJUST_INTERVAL {
            self.current = (self.current * 2).min(self.kind.max_chunk_size());
            self.last_adjust = now;
        } else if buffered > SHRINK_ABOVE_BUFFERED {
            self.current = (self.current / 2).max(MIN_CHUNK_SIZE);
            self.last_adjust = now;
        }
        self.current
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct GaugeState {
    buffered: u64,
    closed: bool,
}

/// Count of bytes handed to a transport but not yet written out, plus a
/// closed flag. Senders await [`BufferGauge::wait_below`] instead of polling.
#[derive(Clone, Debug)]
pub struct BufferGauge {
    state: Arc<watch::Sender<GaugeState>>,
}

impl Default for BufferGauge {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferGauge {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(GaugeState::default());
        Self {
            state: Arc::new(tx),
        }
    }

    pub fn add(&self, n: usize) {
        self.state.send_modify(|s| s.buffered += n as u64);
    }

    pub fn release(&self, n: usize) {
        self.state
            .send_modify(|s| s.buffered = s.buffered.saturating_sub(n as u64));
    }

    pub fn buffered(&self) -> u64 {
        self.state.borrow().buffered
    }

    pub fn close(&self) {
        self.state.send_modify(|s| s.closed = true);
    }

    pub fn is_closed(&self) -> bool {
        self.state.borrow().closed
    }

    /// Resolve once buffered bytes are at or below `ceiling`. Fails with
    /// `Closed` if the transport closes while waiting.
    pub async fn wait_below(&self, ceiling: u64) -> TransferResult<()> {
        let mut rx = self.state.subscribe();
        loop {
            let s = *rx.borrow_and_update();
            if s.closed {
                return Err(TransferError::Closed);
            }
            if s.buffered <= ceiling {
                return Ok(());
            }
            if rx.changed().await.is_err() {
                return Err(TransferError::Closed);
            }
        }
    }

    /// Resolve when the gauge is closed.
    pub async fn closed(&self) {
        let mut rx = self.state.subscribe();
        loop {
            if rx.borrow_and_update().closed {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}
