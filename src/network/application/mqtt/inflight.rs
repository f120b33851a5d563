//! Time keeping and in-flight packet bookkeeping.

use super::packet::PacketType;

/// A monotonic millisecond clock.
///
/// Embedded targets implement this over their tick counter; the `std`
/// feature provides [`StdClock`].
pub trait Clock {
    /// Milliseconds since an arbitrary, fixed origin.
    fn now_ms(&self) -> u64;
}

/// [`Clock`] backed by [`std::time::Instant`].
#[cfg(feature = "std")]
#[derive(Debug, Clone, Copy)]
pub struct StdClock {
    origin: std::time::Instant,
}

#[cfg(feature = "std")]
impl StdClock {
    /// Start a clock whose origin is now.
    pub fn new() -> Self {
        Self {
            origin: std::time::Instant::now(),
        }
    }
}

#[cfg(feature = "std")]
impl Default for StdClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "std")]
impl Clock for StdClock {
    fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }
}

/// A stopwatch measured against a [`Clock`].
///
/// A stopped watch keeps reporting the time between its last start and stop;
/// a zeroed watch reports 0 until started again.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ElapsedTime {
    started_at: Option<u64>,
    frozen: u64,
}

impl ElapsedTime {
    /// Create a zeroed, stopped watch.
    pub const fn new() -> Self {
        Self {
            started_at: None,
            frozen: 0,
        }
    }

    /// (Re)start measuring from `now`.
    pub fn start(&mut self, now: u64) {
        self.started_at = Some(now);
        self.frozen = 0;
    }

    /// Stop measuring, keeping the elapsed value.
    pub fn stop(&mut self, now: u64) {
        if let Some(start) = self.started_at.take() {
            self.frozen = now.saturating_sub(start);
        }
    }

    /// Stop and clear.
    pub fn zero(&mut self) {
        self.started_at = None;
        self.frozen = 0;
    }

    /// Whether the watch is running.
    pub fn is_running(&self) -> bool {
        self.started_at.is_some()
    }

    /// Milliseconds measured so far.
    pub fn elapsed(&self, now: u64) -> u64 {
        match self.started_at {
            Some(start) => now.saturating_sub(start),
            None => self.frozen,
        }
    }
}

/// A control packet being tracked until its handshake completes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InFlight<P> {
    /// The packet, resent as is when a session resumes.
    pub packet: P,
    /// Time since the packet was last sent.
    pub timer: ElapsedTime,
    /// The reply expected next, `None` while the packet has not been sent.
    pub waiting_for: Option<PacketType>,
}

impl<P> InFlight<P> {
    /// Track a packet that has not been sent yet.
    pub fn new(packet: P) -> Self {
        Self {
            packet,
            timer: ElapsedTime::new(),
            waiting_for: None,
        }
    }

    /// Record that the packet was sent and `reply` is expected.
    pub fn sent(&mut self, reply: PacketType, now: u64) {
        self.waiting_for = Some(reply);
        self.timer.start(now);
    }

    /// Whether the entry has waited longer than `timeout_ms`.
    pub fn timed_out(&self, now: u64, timeout_ms: u64) -> bool {
        self.waiting_for.is_some() && self.timer.is_running() && self.timer.elapsed(now) > timeout_ms
    }
}
