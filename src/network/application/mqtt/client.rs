//! The MQTT client facade.
//!
//! [`Client`] owns every piece of protocol state and is driven by one task:
//! that task hands it [`Event`]s from the transport and the timers, calls
//! [`Client::tick`] periodically and drains received [`Message`]s. Nothing in
//! here blocks, locks or allocates.
//!
//! # Examples
//!
//! ## Configuring from JSON
//!
//! ```rust
//! use libiot_mqtt::network::application::mqtt::Options;
//!
//! let options = Options::from_json(r#"{"client_id":"weather_station","keep_alive_seconds":120}"#).unwrap();
//! assert_eq!(options.client_id, "weather_station");
//! assert_eq!(options.keep_alive_seconds, 120);
//! assert!(options.clean_session);
//! assert_eq!(options.ack_timeout_ms, 5_000);
//! ```

use heapless::{Deque, String, Vec};
use serde::Deserialize;

use super::error::Error;
use super::framer::Framer;
use super::inflight::Clock;
use super::packet::{QoS, RawPacket};
use super::packet_id::PacketIdentifierSequence;
use super::packets::Encode;
use super::publication::Publication;
use super::state::{Context, StateKind, StateMachine};
use super::subscription::Subscription;
use super::timer::{TimerId, Timers};
use super::{
    DEFAULT_MAX_MESSAGE_SIZE, INBOX_CAPACITY, MAX_CLIENT_ID_LEN, MAX_PAYLOAD_LEN, MAX_TOPIC_LEN,
};
use crate::network::Write;

/// Longest broker address the client remembers for reconnecting.
pub const MAX_ADDRESS_LEN: usize = 128;

/// A byte stream to the broker.
///
/// Writes must not block for long; the transport is expected to buffer and
/// report progress through [`Event::TransmitBufferEmpty`]. Connection
/// establishment is asynchronous: `open` only starts it and the outcome
/// arrives as [`Event::ConnectionStatus`].
pub trait Transport: Write {
    /// Start connecting to `address`.
    fn open(&mut self, address: &str) -> Result<(), Self::Error>;
    /// Drop the connection, if any. Must be safe to call when closed.
    fn close(&mut self);
    /// Remaining-length cap for inbound packets, set once by [`Client::new`].
    ///
    /// Transports that frame the stream themselves size their [`Framer`]
    /// with it; the default ignores it.
    fn set_max_message_size(&mut self, max_message_size: usize) {
        let _ = max_message_size;
    }
}

/// Something that happened outside the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// The transport connected (`true`) or lost its connection (`false`).
    ConnectionStatus(bool),
    /// Everything written so far has left the transport.
    TransmitBufferEmpty,
    /// The framer completed a packet.
    PacketReceived(RawPacket),
    /// A timer returned by [`Client::poll_timers`] expired.
    TimerExpired(TimerId),
}

/// An application message received from the broker.
///
/// # Examples
///
/// ```rust
/// use libiot_mqtt::network::application::mqtt::Message;
/// use heapless::{String, Vec};
///
/// let message = Message {
///     topic: String::try_from("sensors/temperature").unwrap(),
///     payload: Vec::from_slice(b"23.5").unwrap(),
/// };
///
/// assert_eq!(message.topic.as_str(), "sensors/temperature");
/// assert_eq!(&message.payload[..], b"23.5");
/// ```
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Message {
    /// The topic on which the message was published.
    pub topic: String<MAX_TOPIC_LEN>,
    /// The message payload data.
    pub payload: Vec<u8, MAX_PAYLOAD_LEN>,
}

/// Configuration options for the MQTT client.
///
/// Every field except `client_id` has a default, so a configuration document
/// only needs to name what differs.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Options<'a> {
    /// The client identifier, unique within the broker.
    ///
    /// At most [`MAX_CLIENT_ID_LEN`] bytes. May be empty only with a clean
    /// session, in which case the broker assigns one.
    pub client_id: &'a str,

    /// Keep-alive interval in seconds; 0 disables keep-alive.
    ///
    /// Values above 65535 are clamped on the wire. A PINGREQ is sent every
    /// half interval while connected.
    pub keep_alive_seconds: u32,

    /// Whether to start a clean session.
    ///
    /// - `true`: the broker discards previous session state and unfinished
    ///   publishes restart from scratch after a reconnect
    /// - `false`: the broker resumes the session and unfinished publishes are
    ///   resent with their original identifiers
    pub clean_session: bool,

    /// Largest remaining length accepted from the broker; bigger packets are
    /// drained and dropped.
    ///
    /// Clamped to [`DEFAULT_MAX_MESSAGE_SIZE`], the largest PUBLISH the
    /// receive buffers can hold.
    pub max_message_size: usize,

    /// How long a handshake may wait for its reply before the connection is
    /// considered broken.
    pub ack_timeout_ms: u64,

    /// Fixed delay between reconnect attempts.
    pub reconnect_delay_ms: u64,

    /// How long to wait for DISCONNECT to leave before closing anyway.
    pub disconnect_timeout_ms: u64,

    /// Interval between [`Client::tick`] calls made by a run loop.
    pub tick_interval_ms: u64,
}

impl Default for Options<'_> {
    fn default() -> Self {
        Self {
            client_id: "",
            keep_alive_seconds: 60,
            clean_session: true,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            ack_timeout_ms: 5_000,
            reconnect_delay_ms: 5_000,
            disconnect_timeout_ms: 2_000,
            tick_interval_ms: 50,
        }
    }
}

impl<'a> Options<'a> {
    /// Default options for `client_id`.
    pub fn new(client_id: &'a str) -> Self {
        Self {
            client_id,
            ..Self::default()
        }
    }

    /// Parse options from a JSON object.
    ///
    /// Strings are borrowed from `json` and must not contain escapes.
    pub fn from_json(json: &'a str) -> Result<Self, Error> {
        serde_json_core::from_str(json)
            .map(|(options, _)| options)
            .map_err(|_| Error::Config)
    }
}

/// What the publication and subscription managers need from the client.
///
/// Implemented by the client core; tests can provide their own.
pub trait Session {
    /// Current time in milliseconds.
    fn now_ms(&self) -> u64;
    /// How long a handshake may wait for its reply.
    fn ack_timeout_ms(&self) -> u64;
    /// Encode and write a packet; `false` if it could not be sent.
    fn send_packet<P: Encode>(&mut self, packet: &P) -> bool;
    /// Give up on the connection; the state machine reconnects if allowed.
    fn force_disconnect(&mut self);
    /// Hand a received message to the application.
    fn deliver(&mut self, topic: &str, payload: &[u8]);
}

/// Transport, clock, timers and settings shared by all connection states.
#[derive(Debug)]
pub(crate) struct Core<T, C> {
    pub(crate) transport: T,
    pub(crate) clock: C,
    pub(crate) client_id: String<MAX_CLIENT_ID_LEN>,
    pub(crate) keep_alive_seconds: u16,
    pub(crate) clean_session: bool,
    pub(crate) ack_timeout_ms: u64,
    pub(crate) reconnect_delay_ms: u64,
    pub(crate) disconnect_timeout_ms: u64,
    pub(crate) timers: Timers,
    pub(crate) ids: PacketIdentifierSequence,
    pub(crate) address: String<MAX_ADDRESS_LEN>,
    pub(crate) auto_reconnect: bool,
    /// Clock reading when the broker was last heard from.
    last_received_ms: u64,
    inbox: Deque<Message, INBOX_CAPACITY>,
    force_disconnect: bool,
}

impl<T: Transport, C: Clock> Core<T, C> {
    pub(crate) fn take_force_disconnect(&mut self) -> bool {
        core::mem::take(&mut self.force_disconnect)
    }

    /// Restart the silence measurement.
    pub(crate) fn mark_alive(&mut self) {
        self.last_received_ms = self.clock.now_ms();
    }

    /// Whether the broker has been silent for longer than it may be.
    ///
    /// With keep-alive the broker answers at least every keep-alive interval,
    /// so silence beyond that plus a second means the connection is dead.
    /// Without keep-alive only the CONNACK wait is bounded, by the ack
    /// timeout.
    pub(crate) fn broker_silent(&self, awaiting_connack: bool) -> bool {
        let limit = match self.keep_alive_seconds {
            0 if awaiting_connack => self.ack_timeout_ms,
            0 => return false,
            seconds => u64::from(seconds) * 1_000 + 1_000,
        };
        self.clock.now_ms().saturating_sub(self.last_received_ms) > limit
    }

    /// Start connecting to the stored address.
    pub(crate) fn open_transport(&mut self) -> bool {
        if self.address.is_empty() {
            return false;
        }
        match self.transport.open(&self.address) {
            Ok(()) => true,
            Err(_) => {
                warn!("Could not open transport to {}", self.address.as_str());
                false
            }
        }
    }

    pub(crate) fn start_timer(&mut self, id: TimerId, interval_ms: u64, repeating: bool) {
        let now = self.clock.now_ms();
        self.timers.start(id, interval_ms, repeating, now);
    }

    fn write_all(&mut self, mut bytes: &[u8]) -> bool {
        while !bytes.is_empty() {
            match self.transport.write(bytes) {
                Ok(0) => return false,
                Ok(n) => bytes = &bytes[n.min(bytes.len())..],
                Err(_) => return false,
            }
        }
        self.transport.flush().is_ok()
    }
}

impl<T: Transport, C: Clock> Session for Core<T, C> {
    fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    fn ack_timeout_ms(&self) -> u64 {
        self.ack_timeout_ms
    }

    fn send_packet<P: Encode>(&mut self, packet: &P) -> bool {
        let raw = match packet.encode() {
            Ok(raw) => raw,
            Err(e) => {
                error!("Could not encode {}: {}", P::TYPE.as_str(), e);
                return false;
            }
        };
        if let Err(e) = raw.validate_packet() {
            error!("Refusing to send invalid {}: {}", P::TYPE.as_str(), e);
            return false;
        }
        raw.dump("Sending");
        let sent = self.write_all(raw.as_bytes());
        if !sent {
            warn!("Could not send {}", P::TYPE.as_str());
        }
        sent
    }

    fn force_disconnect(&mut self) {
        self.force_disconnect = true;
    }

    fn deliver(&mut self, topic: &str, payload: &[u8]) {
        let (Ok(topic), Ok(payload)) = (String::try_from(topic), Vec::from_slice(payload)) else {
            warn!("Message does not fit the inbox, dropping");
            return;
        };
        if self.inbox.is_full() {
            warn!("Inbox full, dropping oldest message");
            self.inbox.pop_front();
        }
        let _ = self.inbox.push_back(Message { topic, payload });
    }
}

/// An MQTT 3.1.1 client for publish-subscribe messaging.
///
/// # Type Parameters
///
/// * `T` - The transport implementing [`Transport`]
/// * `C` - The time source implementing [`Clock`]
#[derive(Debug)]
pub struct Client<T, C> {
    core: Core<T, C>,
    publication: Publication,
    subscription: Subscription,
    fsm: StateMachine,
    max_message_size: usize,
    tick_interval_ms: u64,
}

impl<T: Transport, C: Clock> Client<T, C> {
    /// Create an idle client.
    ///
    /// # Errors
    ///
    /// * [`Error::InvalidClientId`] - The identifier is too long, or empty
    ///   without a clean session
    pub fn new(mut transport: T, clock: C, options: &Options<'_>) -> Result<Self, Error> {
        if options.client_id.is_empty() && !options.clean_session {
            return Err(Error::InvalidClientId);
        }
        let client_id = String::try_from(options.client_id).map_err(|_| Error::InvalidClientId)?;
        let max_message_size = Framer::new(options.max_message_size.min(DEFAULT_MAX_MESSAGE_SIZE))
            .max_message_size();
        transport.set_max_message_size(max_message_size);

        let core = Core {
            transport,
            clock,
            client_id,
            keep_alive_seconds: u16::try_from(options.keep_alive_seconds).unwrap_or(u16::MAX),
            clean_session: options.clean_session,
            ack_timeout_ms: options.ack_timeout_ms,
            reconnect_delay_ms: options.reconnect_delay_ms,
            disconnect_timeout_ms: options.disconnect_timeout_ms,
            timers: Timers::new(),
            ids: PacketIdentifierSequence::new(),
            address: String::new(),
            auto_reconnect: false,
            last_received_ms: 0,
            inbox: Deque::new(),
            force_disconnect: false,
        };

        Ok(Self {
            core,
            publication: Publication::new(),
            subscription: Subscription::new(),
            fsm: StateMachine::new(),
            max_message_size,
            tick_interval_ms: options.tick_interval_ms,
        })
    }

    fn split(&mut self) -> (&mut StateMachine, Context<'_, T, C>) {
        let cx = Context {
            core: &mut self.core,
            publication: &mut self.publication,
            subscription: &mut self.subscription,
        };
        (&mut self.fsm, cx)
    }

    /// Connect to the broker at `address`.
    ///
    /// Any existing connection is dropped first. With `auto_reconnect` the
    /// client keeps reconnecting to `address` after the connection is lost,
    /// waiting the configured delay between attempts.
    ///
    /// # Errors
    ///
    /// * [`Error::NoAddress`] - `address` is empty or longer than [`MAX_ADDRESS_LEN`]
    /// * [`Error::Transport`] - The transport could not start connecting and
    ///   auto-reconnect is off
    pub fn connect_to(&mut self, address: &str, auto_reconnect: bool) -> Result<(), Error> {
        if address.is_empty() {
            return Err(Error::NoAddress);
        }
        self.core.address = String::try_from(address).map_err(|_| Error::NoAddress)?;
        self.core.auto_reconnect = auto_reconnect;

        let (fsm, mut cx) = self.split();
        match fsm.kind() {
            StateKind::Idle | StateKind::Disconnected => {}
            _ => fsm.transition(super::state::ConnectionState::Disconnected, &mut cx),
        }

        info!("Connecting to {}", address);
        if cx.core.open_transport() {
            return Ok(());
        }
        if auto_reconnect {
            if fsm.kind() != StateKind::Disconnected {
                fsm.transition(super::state::ConnectionState::Disconnected, &mut cx);
            }
            return Ok(());
        }
        Err(Error::Transport)
    }

    /// Disconnect from the broker and stop reconnecting.
    pub fn disconnect(&mut self) {
        self.core.auto_reconnect = false;
        let (fsm, mut cx) = self.split();
        fsm.disconnect(&mut cx);
    }

    /// Queue a subscription.
    ///
    /// # Errors
    ///
    /// * [`Error::InvalidTopic`] - The filter is empty
    /// * [`Error::TopicTooLong`] - The filter exceeds [`MAX_TOPIC_LEN`]
    /// * [`Error::QueueFull`] - Too many requests are pending
    pub fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<(), Error> {
        self.subscription.subscribe(topic, qos, &mut self.core.ids)
    }

    /// Queue removal of a subscription.
    pub fn unsubscribe(&mut self, topic: &str) -> Result<(), Error> {
        self.subscription.unsubscribe(topic, &mut self.core.ids)
    }

    /// Queue a message for publishing; it is sent on a later [`tick`](Self::tick).
    ///
    /// # Errors
    ///
    /// * [`Error::InvalidTopic`] - The topic is empty or contains wildcards
    /// * [`Error::TopicTooLong`] - The topic exceeds [`MAX_TOPIC_LEN`]
    /// * [`Error::PayloadTooLarge`] - The payload exceeds [`MAX_PAYLOAD_LEN`]
    /// * [`Error::QueueFull`] - The outgoing queue is full
    pub fn publish(&mut self, topic: &str, payload: &[u8], qos: QoS, retain: bool) -> Result<(), Error> {
        self.publication
            .publish(topic, payload, qos, retain, &mut self.core.ids)
    }

    /// Process one event.
    pub fn handle(&mut self, event: Event) {
        let (fsm, mut cx) = self.split();
        fsm.handle(event, &mut cx);
    }

    /// Advance queued work by one step.
    pub fn tick(&mut self) {
        let (fsm, mut cx) = self.split();
        fsm.tick(&mut cx);
    }

    /// The next expired timer, to be fed back through [`handle`](Self::handle).
    pub fn poll_timers(&mut self) -> Option<TimerId> {
        let now = self.core.clock.now_ms();
        self.core.timers.poll(now)
    }

    /// Earliest time, in clock milliseconds, at which a timer expires.
    pub fn next_timer_deadline(&self) -> Option<u64> {
        self.core.timers.next_deadline()
    }

    /// Take the oldest received message.
    pub fn next_message(&mut self) -> Option<Message> {
        self.core.inbox.pop_front()
    }

    /// The active connection state.
    pub fn state(&self) -> StateKind {
        self.fsm.kind()
    }

    /// Effective remaining-length cap for inbound packets, as handed to the
    /// transport.
    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    /// A framer sized for this client's maximum message size.
    pub fn framer(&self) -> Framer {
        Framer::new(self.max_message_size)
    }

    /// How often a run loop should call [`tick`](Self::tick).
    pub fn tick_interval_ms(&self) -> u64 {
        self.tick_interval_ms
    }

    /// Outgoing publish queue.
    pub fn publication(&self) -> &Publication {
        &self.publication
    }

    /// Subscription state.
    pub fn subscription(&self) -> &Subscription {
        &self.subscription
    }

    /// The transport.
    pub fn transport(&self) -> &T {
        &self.core.transport
    }

    /// The transport, mutably.
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.core.transport
    }
}
