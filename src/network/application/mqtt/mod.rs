//! MQTT 3.1.1 protocol implementation for embedded systems.
//!
//! This module provides an MQTT 3.1.1 client designed for `no_std`
//! environments. MQTT (Message Queuing Telemetry Transport) is a lightweight
//! publish-subscribe messaging protocol ideal for IoT applications.
//!
//! # Protocol Overview
//!
//! MQTT uses a publish-subscribe pattern where:
//! - **Publishers** send messages to topics
//! - **Subscribers** receive messages from topics they're interested in
//! - **Brokers** route messages between publishers and subscribers
//!
//! # Architecture
//!
//! All protocol state is owned by one [`Client`], driven from one task:
//!
//! - [`Framer`] splits the inbound byte stream into [`RawPacket`]s
//! - [`Packet::decode`] turns a raw packet into a typed one, dropping anything malformed
//! - the connection state machine ([`StateKind`]) decides what a packet means right now
//! - [`Publication`] and [`Subscription`] run the QoS handshakes
//!
//! Transports, timers and the application talk to the client through
//! [`Event`]s and method calls; nothing in here blocks or allocates.
//!
//! # Capacities
//!
//! Every buffer is sized at compile time by the constants below.

/// Client facade, options and events.
pub mod client;
/// Error types.
pub mod error;
/// Stream framing.
pub mod framer;
/// In-flight bookkeeping and time.
pub mod inflight;
/// Raw packet representation and the low-level codec.
pub mod packet;
/// Packet identifier allocation.
pub mod packet_id;
/// Typed control packets.
pub mod packets;
/// Outgoing publish handshakes.
pub mod publication;
/// The thread-based run loop and TCP transport.
#[cfg(feature = "std")]
pub mod runner;
/// Connection state machine.
pub mod state;
/// Subscriptions and incoming publish handshakes.
pub mod subscription;
/// Named protocol timers.
pub mod timer;

pub use client::{Client, Event, Message, Options, Session, Transport};
pub use error::{Error, PacketError};
pub use framer::Framer;
#[cfg(feature = "std")]
pub use inflight::StdClock;
pub use inflight::{Clock, ElapsedTime, InFlight};
pub use packet::{PacketType, QoS, RawPacket};
pub use packet_id::PacketIdentifierSequence;
pub use packets::{ConnectReturnCode, Encode, Packet};
pub use publication::Publication;
pub use state::{STATE_SIZE, StateKind};
pub use subscription::Subscription;
pub use timer::{TimerId, Timers};

/// Size of a raw packet buffer, fixed header included.
pub const MAX_PACKET_SIZE: usize = 1536;

/// Maximum topic length in bytes.
pub const MAX_TOPIC_LEN: usize = 256;

/// Maximum publish payload in bytes.
pub const MAX_PAYLOAD_LEN: usize = 1024;

/// Maximum client identifier length in bytes.
pub const MAX_CLIENT_ID_LEN: usize = 64;

/// Publishes that can be queued or in flight at once.
pub const MAX_OUTGOING_MESSAGES: usize = 8;

/// Subscribe and unsubscribe requests that can be queued, per direction.
pub const MAX_PENDING_SUBSCRIPTIONS: usize = 8;

/// Incoming QoS 2 messages waiting for PUBREL.
pub const MAX_INCOMING_QOS2: usize = 8;

/// Active subscriptions remembered for re-subscription.
pub const MAX_SUBSCRIPTIONS: usize = 16;

/// Received messages buffered until the application drains them.
pub const INBOX_CAPACITY: usize = 4;

/// Default and largest remaining-length cap for incoming packets.
///
/// Large enough for a full-size topic and payload; a longer PUBLISH could
/// never be stored.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = MAX_TOPIC_LEN + MAX_PAYLOAD_LEN + 4;
