/// The timers the connection state machine arms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TimerId {
    /// Repeating; each expiry sends PINGREQ while connected.
    KeepAlive,
    /// One-shot; expiry re-opens the transport.
    Reconnect,
}

impl TimerId {
    fn index(self) -> usize {
        match self {
            TimerId::KeepAlive => 0,
            TimerId::Reconnect => 1,
        }
    }

    const ALL: [TimerId; 2] = [TimerId::KeepAlive, TimerId::Reconnect];
}

#[derive(Debug, Clone, Copy, Default)]
struct Slot {
    deadline: Option<u64>,
    interval: u64,
    repeating: bool,
}

/// Deadlines for the client's named timers.
///
/// The owner of the client polls these with the current time and turns every
/// expiry into [`Event::TimerExpired`](super::Event::TimerExpired).
#[derive(Debug, Clone, Default)]
pub struct Timers {
    slots: [Slot; 2],
}

impl Timers {
    /// All timers stopped.
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm `id` to expire `interval_ms` from `now`; repeating timers re-arm
    /// themselves on expiry.
    pub fn start(&mut self, id: TimerId, interval_ms: u64, repeating: bool, now: u64) {
        self.slots[id.index()] = Slot {
            deadline: Some(now.saturating_add(interval_ms)),
            interval: interval_ms,
            repeating,
        };
    }

    /// Disarm `id`.
    pub fn stop(&mut self, id: TimerId) {
        self.slots[id.index()].deadline = None;
    }

    /// Whether `id` is armed.
    pub fn is_running(&self, id: TimerId) -> bool {
        self.slots[id.index()].deadline.is_some()
    }

    /// Return one expired timer, if any, and re-arm or disarm it.
    pub fn poll(&mut self, now: u64) -> Option<TimerId> {
        for id in TimerId::ALL {
            let slot = &mut self.slots[id.index()];
            match slot.deadline {
                Some(deadline) if deadline <= now => {
                    slot.deadline = if slot.repeating && slot.interval > 0 {
                        Some(now.saturating_add(slot.interval))
                    } else {
                        None
                    };
                    return Some(id);
                }
                _ => {}
            }
        }
        None
    }

    /// Earliest armed deadline.
    pub fn next_deadline(&self) -> Option<u64> {
        self.slots.iter().filter_map(|slot| slot.deadline).min()
    }
}
