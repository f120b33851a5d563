//! # libiot-mqtt - MQTT 3.1.1 client for IoT devices
//!
//! A Rust MQTT client that lets constrained devices publish telemetry and
//! receive commands over a single broker connection. The protocol core is
//! `no_std` and never allocates: every queue, map and packet buffer is a
//! fixed-capacity [`heapless`] container, so the memory footprint is known at
//! compile time.
//!
//! ## Features
//!
//! - **Packet codec** for every MQTT 3.1.1 control packet a client needs
//! - **Stream framer** that pulls exactly the bytes it needs and drains
//!   oversized packets without losing sync
//! - **Connection state machine** with keep-alive, clean/persistent sessions
//!   and fixed-delay automatic reconnect
//! - **QoS 0, 1 and 2** for outgoing publishes and incoming deliveries, with
//!   exactly-once de-duplication of inbound QoS 2 messages
//! - **Subscription management** including re-subscription after reconnect
//!
//! ## Usage
//!
//! Add this to your `Cargo.toml`:
//!
//! ```toml
//! [dependencies]
//! libiot-mqtt = "0.1.0"
//! ```
//!
//! ### Driving the client
//!
//! The [`Client`](network::application::mqtt::Client) is owned by a single task.
//! That task feeds it transport events, expired timers and periodic ticks:
//!
//! ```rust,no_run
//! use libiot_mqtt::network::application::mqtt::{Client, Clock, Event, Options, QoS, Transport};
//! # struct Socket;
//! # impl libiot_mqtt::network::Write for Socket {
//! #     type Error = ();
//! #     fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> { Ok(buf.len()) }
//! #     fn flush(&mut self) -> Result<(), Self::Error> { Ok(()) }
//! # }
//! # impl Transport for Socket {
//! #     fn open(&mut self, _address: &str) -> Result<(), Self::Error> { Ok(()) }
//! #     fn close(&mut self) {}
//! # }
//! # struct Ticks;
//! # impl Clock for Ticks { fn now_ms(&self) -> u64 { 0 } }
//! # fn wait_for_event() -> Option<Event> { None }
//!
//! let options = Options::new("sensor_device_01");
//! let mut client = Client::new(Socket, Ticks, &options).unwrap();
//!
//! client.connect_to("broker.local:1883", true).unwrap();
//! client.subscribe("commands/#", QoS::AtLeastOnce).unwrap();
//! client.publish("sensors/temperature", b"23.5", QoS::AtMostOnce, false).unwrap();
//!
//! loop {
//!     match wait_for_event() {
//!         Some(event) => client.handle(event),
//!         None => match client.poll_timers() {
//!             Some(timer) => client.handle(Event::TimerExpired(timer)),
//!             None => client.tick(),
//!         },
//!     }
//!     while let Some(message) = client.next_message() {
//!         // message.topic, message.payload
//!     }
//! #   break;
//! }
//! ```
//!
//! With the `std` feature, [`runner`](network::application::mqtt::runner)
//! provides that loop on a dedicated thread together with a TCP transport.
//!
//! ## Platform Support
//!
//! This library is designed to work on:
//! - Embedded microcontrollers (ARM Cortex-M, RISC-V, etc.)
//! - Linux-based IoT devices (Raspberry Pi, etc.)
//! - Any platform supporting Rust's `core` library
//!
//! ## Optional Features
//!
//! - `std`: Enable the threaded run loop, TCP transport and system clock
//! - `defmt`: Enable defmt logging support for embedded debugging
//! - `log`: Route diagnostics through the `log` facade

#![cfg_attr(not(feature = "std"), no_std)]
#![deny(missing_docs)]
#![warn(missing_debug_implementations)]
#![doc(html_root_url = "https://shishir-dey.github.io/libiot/")]

#[macro_use]
mod fmt;

/// Network abstraction layer providing the transport traits and the MQTT client.
///
/// This module contains the byte-stream traits a transport implements and the
/// MQTT 3.1.1 protocol implementation built on top of them.
pub mod network;
