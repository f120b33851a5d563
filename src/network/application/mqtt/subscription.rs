//! Subscriptions and the receiving side of publishes.
//!
//! SUBSCRIBE and UNSUBSCRIBE requests each have their own queue with the same
//! one-outstanding-request policy as [`Publication`](super::Publication), so
//! one of each can be in flight at once. Incoming QoS 2 messages are held by
//! packet identifier until PUBREL releases them, which keeps a redelivered
//! PUBLISH from reaching the application twice.

use heapless::{Deque, FnvIndexMap, String};

use super::client::Session;
use super::error::Error;
use super::inflight::InFlight;
use super::packet::{PacketType, QoS, RawPacket};
use super::packet_id::PacketIdentifierSequence;
use super::packets::{
    Encode, PubAck, PubComp, PubRec, PubRel, Publish, SubAck, Subscribe, UnsubAck, Unsubscribe,
};
use super::{MAX_INCOMING_QOS2, MAX_PENDING_SUBSCRIPTIONS, MAX_SUBSCRIPTIONS, MAX_TOPIC_LEN};

type Queue<P> = Deque<InFlight<P>, MAX_PENDING_SUBSCRIPTIONS>;

/// Subscription state of the client.
#[derive(Debug, Default)]
pub struct Subscription {
    subscribing: Queue<Subscribe>,
    unsubscribing: Queue<Unsubscribe>,
    receiving: FnvIndexMap<u16, InFlight<Publish>, MAX_INCOMING_QOS2>,
    active_subscription: FnvIndexMap<String<MAX_TOPIC_LEN>, QoS, MAX_SUBSCRIPTIONS>,
}

fn topic_filter(topic: &str) -> Result<String<MAX_TOPIC_LEN>, Error> {
    if topic.is_empty() {
        return Err(Error::InvalidTopic);
    }
    String::try_from(topic).map_err(|_| Error::TopicTooLong)
}

/// Send the head of `queue` if it is unsent, or give up on the connection if
/// its reply is overdue.
fn send_control_packet<P: Encode, S: Session>(queue: &mut Queue<P>, reply: PacketType, session: &mut S) {
    let now = session.now_ms();
    let timeout = session.ack_timeout_ms();
    let Some(flight) = queue.front_mut() else {
        return;
    };

    if flight.waiting_for.is_none() {
        if session.send_packet(&flight.packet) {
            flight.sent(reply, now);
        } else {
            error!("Could not send {}", P::TYPE.as_str());
        }
    } else if flight.timed_out(now, timeout) {
        error!(
            "No {} for {} in time, forcing disconnect",
            reply.as_str(),
            P::TYPE.as_str()
        );
        flight.timer.stop(now);
        session.force_disconnect();
    }
}

fn reset_control_packets<P>(queue: &mut Queue<P>) {
    for flight in queue.iter_mut() {
        flight.waiting_for = None;
        flight.timer.zero();
    }
}

impl Subscription {
    /// No subscriptions.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a subscription to `topic`.
    ///
    /// Subscribing again with the QoS already granted, or already being
    /// requested, does nothing.
    pub fn subscribe(&mut self, topic: &str, qos: QoS, ids: &mut PacketIdentifierSequence) -> Result<(), Error> {
        let topic = topic_filter(topic)?;
        self.internal_subscribe(topic, qos, ids)
    }

    fn internal_subscribe(
        &mut self,
        topic: String<MAX_TOPIC_LEN>,
        qos: QoS,
        ids: &mut PacketIdentifierSequence,
    ) -> Result<(), Error> {
        if self.active_subscription.get(&topic) == Some(&qos) {
            trace!("Already subscribed to {}", topic.as_str());
            return Ok(());
        }
        let pending = self
            .subscribing
            .iter()
            .any(|flight| flight.packet.topic == topic && flight.packet.qos == qos);
        if pending {
            return Ok(());
        }
        if self.subscribing.is_full() {
            return Err(Error::QueueFull);
        }

        let subscribe = Subscribe {
            packet_id: ids.next_id(),
            topic,
            qos,
        };
        self.subscribing
            .push_back(InFlight::new(subscribe))
            .map_err(|_| Error::QueueFull)
    }

    /// Queue removal of a subscription to `topic`.
    pub fn unsubscribe(&mut self, topic: &str, ids: &mut PacketIdentifierSequence) -> Result<(), Error> {
        let topic = topic_filter(topic)?;
        if self.unsubscribing.is_full() {
            return Err(Error::QueueFull);
        }
        let unsubscribe = Unsubscribe {
            packet_id: ids.next_id(),
            topic,
        };
        self.unsubscribing
            .push_back(InFlight::new(unsubscribe))
            .map_err(|_| Error::QueueFull)
    }

    /// Advance both request queues by one step and re-acknowledge incoming
    /// QoS 2 messages whose PUBREL is overdue.
    pub fn subscribe_next<S: Session>(&mut self, session: &mut S) {
        send_control_packet(&mut self.subscribing, PacketType::SubAck, session);
        send_control_packet(&mut self.unsubscribing, PacketType::UnsubAck, session);

        let now = session.now_ms();
        let timeout = session.ack_timeout_ms();
        for (packet_id, flight) in self.receiving.iter_mut() {
            if flight.timed_out(now, timeout) {
                debug!("Resending PUBREC {}", *packet_id);
                if session.send_packet(&PubRec {
                    packet_id: *packet_id,
                }) {
                    flight.timer.start(now);
                }
            }
        }
    }

    /// Complete the pending subscription.
    pub fn receive_suback<S: Session>(&mut self, _session: &mut S, ack: &SubAck) {
        let matches = self.subscribing.front().is_some_and(|flight| {
            flight.waiting_for == Some(PacketType::SubAck) && flight.packet.packet_id == ack.packet_id
        });
        if !matches {
            return;
        }
        let Some(flight) = self.subscribing.pop_front() else {
            return;
        };
        let topic = flight.packet.topic;
        match ack.granted_qos() {
            Some(granted) => {
                debug!("Subscription of topic {} completed, QoS: {}", topic.as_str(), granted as u8);
                if self.active_subscription.insert(topic, granted).is_err() {
                    warn!("Subscription table full, {} will not be restored", ack.packet_id);
                }
            }
            None => warn!("Broker refused subscription to {}", topic.as_str()),
        }
    }

    /// Complete the pending unsubscription.
    pub fn receive_unsuback<S: Session>(&mut self, _session: &mut S, ack: &UnsubAck) {
        let matches = self.unsubscribing.front().is_some_and(|flight| {
            flight.waiting_for == Some(PacketType::UnsubAck) && flight.packet.packet_id == ack.packet_id
        });
        if !matches {
            return;
        }
        if let Some(flight) = self.unsubscribing.pop_front() {
            debug!("Unsubscription of topic {} completed", flight.packet.topic.as_str());
            self.active_subscription.remove(&flight.packet.topic);
        }
    }

    /// Handle a PUBLISH from the broker.
    ///
    /// A publish may legitimately arrive before the SUBACK of its subscription.
    pub fn receive_publish<S: Session>(&mut self, session: &mut S, publish: Publish) {
        match publish.qos {
            QoS::AtMostOnce => session.deliver(&publish.topic, &publish.payload),
            QoS::AtLeastOnce => {
                session.send_packet(&PubAck {
                    packet_id: publish.packet_id,
                });
                session.deliver(&publish.topic, &publish.payload);
            }
            QoS::ExactlyOnce => {
                let packet_id = publish.packet_id;
                if !self.receiving.contains_key(&packet_id) {
                    let mut flight = InFlight::new(publish);
                    flight.sent(PacketType::PubRel, session.now_ms());
                    if self.receiving.insert(packet_id, flight).is_err() {
                        // Without PUBREC the broker will send it again.
                        warn!("Too many incoming QoS 2 messages, dropping {}", packet_id);
                        return;
                    }
                }
                session.send_packet(&PubRec { packet_id });
            }
        }
    }

    /// Acknowledge a PUBLISH whose topic or payload does not fit the receive
    /// buffers, without delivering it.
    ///
    /// Left unacknowledged it would be redelivered on every session.
    pub fn refuse_publish<S: Session>(&mut self, session: &mut S, raw: &RawPacket) {
        if raw.validate_packet().is_err() {
            warn!("Dropping malformed oversized PUBLISH");
            return;
        }
        let packet_id = raw.packet_identifier();
        match raw.qos() {
            Ok(QoS::AtLeastOnce) if packet_id != 0 => {
                warn!("Message {} does not fit, acknowledging without delivery", packet_id);
                session.send_packet(&PubAck { packet_id });
            }
            Ok(QoS::ExactlyOnce) if packet_id != 0 => {
                // PUBREL is answered without a held message, see receive_pubrel.
                warn!("Message {} does not fit, acknowledging without delivery", packet_id);
                session.send_packet(&PubRec { packet_id });
            }
            _ => warn!("Message does not fit, dropping"),
        }
    }

    /// Release a held QoS 2 message to the application.
    pub fn receive_pubrel<S: Session>(&mut self, session: &mut S, rel: &PubRel) {
        if let Some(flight) = self.receiving.remove(&rel.packet_id) {
            debug!("Reception of QoS 2 message {} complete", rel.packet_id);
            session.deliver(&flight.packet.topic, &flight.packet.payload);
        }
        // PUBCOMP is owed even for identifiers we no longer know.
        session.send_packet(&PubComp {
            packet_id: rel.packet_id,
        });
    }

    /// Prepare for the next session.
    ///
    /// Pending requests lose their wait state so they are sent again, active
    /// subscriptions are queued for re-subscription and half-received QoS 2
    /// messages are forgotten; the broker redelivers them.
    pub fn handle_disconnect(&mut self, ids: &mut PacketIdentifierSequence) {
        reset_control_packets(&mut self.subscribing);
        reset_control_packets(&mut self.unsubscribing);
        self.receiving.clear();

        let active = core::mem::take(&mut self.active_subscription);
        for (topic, qos) in active.iter() {
            if self.internal_subscribe(topic.clone(), *qos, ids).is_err() {
                warn!("Subscribe queue full, dropping a subscription");
            }
        }
    }

    /// QoS granted for `topic`, if subscribed.
    pub fn active_qos(&self, topic: &str) -> Option<QoS> {
        self.active_subscription
            .iter()
            .find(|(active, _)| active.as_str() == topic)
            .map(|(_, qos)| *qos)
    }

    /// Number of active subscriptions.
    pub fn active_count(&self) -> usize {
        self.active_subscription.len()
    }

    /// Subscriptions not yet acknowledged.
    pub fn pending_subscribes(&self) -> usize {
        self.subscribing.len()
    }

    /// Unsubscriptions not yet acknowledged.
    pub fn pending_unsubscribes(&self) -> usize {
        self.unsubscribing.len()
    }

    /// Incoming QoS 2 messages waiting for PUBREL.
    pub fn receiving_count(&self) -> usize {
        self.receiving.len()
    }
}
