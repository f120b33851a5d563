/// Allocates packet identifiers for PUBLISH, SUBSCRIBE and UNSUBSCRIBE.
///
/// Identifiers start at 1, increase by one and wrap from 65535 back to 1;
/// 0 is reserved and never handed out. The client owns one sequence and
/// lends it to whichever manager is enqueuing a packet.
///
/// # Examples
///
/// ```rust
/// use libiot_mqtt::network::application::mqtt::PacketIdentifierSequence;
///
/// let mut ids = PacketIdentifierSequence::starting_at(65535);
/// assert_eq!(ids.next_id(), 65535);
/// assert_eq!(ids.next_id(), 1);
/// ```
#[derive(Debug, Clone)]
pub struct PacketIdentifierSequence {
    next: u16,
}

impl Default for PacketIdentifierSequence {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketIdentifierSequence {
    /// A sequence whose first identifier is 1.
    pub const fn new() -> Self {
        Self { next: 1 }
    }

    /// A sequence whose first identifier is `first`, or 1 if `first` is 0.
    pub const fn starting_at(first: u16) -> Self {
        Self {
            next: if first == 0 { 1 } else { first },
        }
    }

    /// Hand out the next identifier.
    pub fn next_id(&mut self) -> u16 {
        let id = self.next;
        self.next = match self.next.wrapping_add(1) {
            0 => 1,
            n => n,
        };
        id
    }
}
