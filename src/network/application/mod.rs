//! # Application Layer Network Protocols
//!
//! This module contains the application layer (OSI Layer 7) protocols of the
//! crate. Each protocol works on top of the byte-stream traits in
//! [`network`](crate::network) and keeps its state in fixed-size buffers.
//!
//! ## Available Protocols
//!
//! - **[`mqtt`]**: MQTT 3.1.1 client for lightweight publish-subscribe messaging
//!
//! ## Design Principles
//!
//! - **Transport Agnostic**: Work with any type implementing [`Write`](crate::network::Write)
//! - **No-std Compatible**: Designed for embedded systems without heap allocation
//! - **Resource Conscious**: Use fixed-size buffers and minimal memory
//! - **Error Handling**: Malformed input is dropped and logged, never fatal

/// MQTT client implementation.
///
/// Provides an MQTT 3.1.1 client for lightweight publish-subscribe messaging,
/// commonly used in IoT applications.
pub mod mqtt;
