//! Outgoing publishes and their QoS handshakes.
//!
//! Publishes are sent strictly in order with at most one of them awaiting a
//! reply at any time. The head of the queue is the only entry that is ever
//! sent, acknowledged or timed out.

use heapless::Deque;

use super::client::Session;
use super::error::Error;
use super::inflight::InFlight;
use super::packet::{PacketType, QoS};
use super::packet_id::PacketIdentifierSequence;
use super::packets::{PubAck, PubComp, PubRec, PubRel, Publish};
use super::{MAX_OUTGOING_MESSAGES, MAX_PAYLOAD_LEN, MAX_TOPIC_LEN};

/// Queue of outgoing publishes.
#[derive(Debug, Default)]
pub struct Publication {
    in_progress: Deque<InFlight<Publish>, MAX_OUTGOING_MESSAGES>,
}

/// Check a topic name an application wants to publish to.
pub(crate) fn check_topic_name(topic: &str) -> Result<(), Error> {
    if topic.is_empty() || topic.contains(['+', '#']) {
        return Err(Error::InvalidTopic);
    }
    if topic.len() > MAX_TOPIC_LEN {
        return Err(Error::TopicTooLong);
    }
    Ok(())
}

impl Publication {
    /// An empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a message for publishing.
    ///
    /// A packet identifier is drawn from `ids` for QoS 1 and 2. Never blocks;
    /// a full queue is reported as [`Error::QueueFull`].
    pub fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
        ids: &mut PacketIdentifierSequence,
    ) -> Result<(), Error> {
        check_topic_name(topic)?;
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(Error::PayloadTooLarge);
        }
        if self.in_progress.is_full() {
            return Err(Error::QueueFull);
        }

        let packet_id = match qos {
            QoS::AtMostOnce => 0,
            _ => ids.next_id(),
        };
        let publish = Publish::new(topic, payload, qos, retain, packet_id)?;
        self.in_progress
            .push_back(InFlight::new(publish))
            .map_err(|_| Error::QueueFull)
    }

    /// Advance the head of the queue by one step.
    ///
    /// Sends the head if it has not been sent yet, or forces a disconnect if
    /// it has waited for its reply longer than the ack timeout.
    pub fn publish_next<S: Session>(&mut self, session: &mut S) {
        let now = session.now_ms();
        let timeout = session.ack_timeout_ms();
        let Some(flight) = self.in_progress.front_mut() else {
            return;
        };

        let waiting_for = flight.waiting_for;
        match waiting_for {
            None => {
                let qos = flight.packet.qos;
                if !session.send_packet(&flight.packet) {
                    error!("Could not send publish of QoS {}", qos as u8);
                    return;
                }
                match qos {
                    QoS::AtMostOnce => {
                        trace!("QoS 0 publish completed");
                        self.in_progress.pop_front();
                    }
                    QoS::AtLeastOnce => flight.sent(PacketType::PubAck, now),
                    QoS::ExactlyOnce => flight.sent(PacketType::PubRec, now),
                }
            }
            Some(reply) if flight.timed_out(now, timeout) => {
                error!(
                    "No {} for publish {} in time, forcing disconnect",
                    reply.as_str(),
                    flight.packet.packet_id
                );
                flight.timer.stop(now);
                session.force_disconnect();
            }
            Some(_) => {}
        }
    }

    /// Complete a QoS 1 publish.
    pub fn receive_puback<S: Session>(&mut self, _session: &mut S, ack: &PubAck) {
        if self.head_awaits(PacketType::PubAck, ack.packet_id) {
            debug!("Publish {} acknowledged", ack.packet_id);
            self.in_progress.pop_front();
        }
    }

    /// Answer PUBREC with PUBREL and wait for PUBCOMP.
    ///
    /// A repeated PUBREC finds the entry already waiting for PUBCOMP and is
    /// ignored, so PUBREL goes out once.
    pub fn receive_pubrec<S: Session>(&mut self, session: &mut S, rec: &PubRec) {
        if !self.head_awaits(PacketType::PubRec, rec.packet_id) {
            return;
        }
        let now = session.now_ms();
        if let Some(flight) = self.in_progress.front_mut() {
            if !session.send_packet(&PubRel {
                packet_id: rec.packet_id,
            }) {
                warn!("Could not send PUBREL {}", rec.packet_id);
            }
            // Even if PUBREL did not go out, the broker has the message now.
            flight.sent(PacketType::PubComp, now);
        }
    }

    /// Complete a QoS 2 publish.
    pub fn receive_pubcomp<S: Session>(&mut self, _session: &mut S, comp: &PubComp) {
        if self.head_awaits(PacketType::PubComp, comp.packet_id) {
            debug!("Publish {} completed", comp.packet_id);
            self.in_progress.pop_front();
        }
    }

    fn head_awaits(&self, reply: PacketType, packet_id: u16) -> bool {
        match self.in_progress.front() {
            Some(flight) => flight.waiting_for == Some(reply) && flight.packet.packet_id == packet_id,
            None => false,
        }
    }

    /// Keep the head queued but stop it from timing out while disconnected.
    pub fn handle_disconnect(&mut self) {
        if let Some(flight) = self.in_progress.front_mut() {
            flight.timer.zero();
        }
    }

    /// Resume the handshake of the head after a reconnect.
    ///
    /// Without a clean session the broker still knows the message: the
    /// PUBLISH is resent with DUP set and its original identifier, or PUBREL
    /// is resent if PUBREC already arrived. With a clean session the broker
    /// forgot it, so the handshake starts over with a fresh send on the next
    /// step.
    pub fn resend_outstanding_control_packet<S: Session>(&mut self, session: &mut S, clean_session: bool) {
        let now = session.now_ms();
        let Some(flight) = self.in_progress.front_mut() else {
            return;
        };
        let Some(reply) = flight.waiting_for else {
            return;
        };

        if clean_session {
            debug!("Restarting publish {}", flight.packet.packet_id);
            flight.waiting_for = None;
            flight.packet.dup = false;
            flight.timer.zero();
            return;
        }

        let resent = match reply {
            PacketType::PubComp => session.send_packet(&PubRel {
                packet_id: flight.packet.packet_id,
            }),
            _ => {
                flight.packet.dup = true;
                session.send_packet(&flight.packet)
            }
        };
        if resent {
            debug!("Resent publish {}, waiting for {}", flight.packet.packet_id, reply.as_str());
        } else {
            warn!("Could not resend publish {}", flight.packet.packet_id);
        }
        flight.timer.start(now);
    }

    /// The entry that is sent or acknowledged next.
    pub fn head(&self) -> Option<&InFlight<Publish>> {
        self.in_progress.front()
    }

    /// Number of queued publishes.
    pub fn len(&self) -> usize {
        self.in_progress.len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.in_progress.is_empty()
    }
}
