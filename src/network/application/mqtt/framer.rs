//! Incremental framing of the inbound byte stream.
//!
//! The framer is pull based: the transport asks [`Framer::wanted_amount`] how
//! many bytes to read next, reads at most that many into
//! [`Framer::write_pos`] and reports the count with [`Framer::data_received`].
//! The framer never holds more than one packet and never asks for a byte
//! beyond the end of the current packet, so partial reads and back-to-back
//! packets need no extra buffering.

use super::packet::{MAX_FIXED_HEADER_LEN, RawPacket, decode_remaining_length};
use super::{DEFAULT_MAX_MESSAGE_SIZE, MAX_PACKET_SIZE};
use crate::network::Read;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadState {
    /// Waiting for the type and flags byte.
    Start,
    /// Reading remaining length bytes one at a time.
    RemainingLength,
    /// Reading variable header and payload.
    Data,
}

/// Splits a byte stream into [`RawPacket`]s.
#[derive(Debug)]
pub struct Framer {
    state: ReadState,
    /// Bytes still expected in the current state.
    remaining: usize,
    /// Bytes of the packet stored so far.
    filled: usize,
    /// Fixed header size, known once the remaining length is decoded.
    header_len: usize,
    max_message_size: usize,
    packet: RawPacket,
}

impl Default for Framer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MESSAGE_SIZE)
    }
}

impl Framer {
    /// Create a framer accepting packets whose remaining length is at most
    /// `max_message_size`, clamped to what the packet buffer can hold.
    pub fn new(max_message_size: usize) -> Self {
        Self {
            state: ReadState::Start,
            remaining: 1,
            filled: 0,
            header_len: 0,
            max_message_size: max_message_size.min(MAX_PACKET_SIZE - MAX_FIXED_HEADER_LEN),
            packet: RawPacket::new(),
        }
    }

    /// Effective remaining-length cap.
    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    /// Number of bytes the framer wants next; 0 once a packet is complete or
    /// the header was malformed.
    pub fn wanted_amount(&self) -> usize {
        if self.packet.error {
            return 0;
        }
        match self.state {
            ReadState::Start | ReadState::RemainingLength => 1,
            ReadState::Data if self.packet.too_big => {
                self.remaining.min(MAX_PACKET_SIZE - self.header_len)
            }
            ReadState::Data => self.remaining,
        }
    }

    /// Buffer of exactly [`wanted_amount`](Self::wanted_amount) bytes to read into.
    ///
    /// While draining an oversized packet the same region past the fixed
    /// header is handed out again and again, so nothing accumulates.
    pub fn write_pos(&mut self) -> &mut [u8] {
        let wanted = self.wanted_amount();
        let start = if self.packet.too_big { self.header_len } else { self.filled };
        // start + wanted never exceeds MAX_PACKET_SIZE, see new() and wanted_amount()
        let end = (start + wanted).min(MAX_PACKET_SIZE);
        if self.packet.data.resize(end, 0).is_err() {
            error!("Packet buffer overrun at {}", end);
            self.packet.error = true;
            return &mut [];
        }
        &mut self.packet.data[start..end]
    }

    /// Account for `n` bytes written into [`write_pos`](Self::write_pos).
    pub fn data_received(&mut self, n: usize) {
        let n = n.min(self.wanted_amount());
        if n == 0 {
            return;
        }
        match self.state {
            ReadState::Start => {
                self.filled = 1;
                self.state = ReadState::RemainingLength;
                self.remaining = 1;
            }
            ReadState::RemainingLength => {
                let Some(&byte) = self.packet.data.get(self.filled) else {
                    return;
                };
                self.filled += 1;
                if byte & 0x80 == 0 {
                    self.start_data();
                } else if self.filled == MAX_FIXED_HEADER_LEN {
                    // Continuation bit set on the fourth length byte.
                    warn!("Malformed remaining length");
                    self.packet.error = true;
                }
            }
            ReadState::Data => {
                self.remaining -= n;
                if !self.packet.too_big {
                    self.filled += n;
                }
            }
        }
        self.packet.data.truncate(self.filled);
    }

    fn start_data(&mut self) {
        self.header_len = self.filled;
        self.state = ReadState::Data;
        match decode_remaining_length(&self.packet.data[1..self.filled]) {
            Ok((len, _)) => {
                self.remaining = len;
                if len > self.max_message_size {
                    debug!(
                        "Packet too big ({} > {}), draining",
                        len, self.max_message_size
                    );
                    self.packet.too_big = true;
                }
            }
            Err(e) => {
                warn!("Malformed remaining length: {}", e);
                self.packet.error = true;
            }
        }
    }

    /// Whether a full packet, or a fully drained oversized one, is available.
    pub fn is_complete(&self) -> bool {
        !self.packet.error && self.state == ReadState::Data && self.remaining == 0
    }

    /// Whether the stream carried a malformed fixed header.
    ///
    /// The stream cannot be resynchronized after this; the caller should reset
    /// the framer and normally the connection too.
    pub fn is_error(&self) -> bool {
        self.packet.error
    }

    /// The packet being assembled.
    pub fn packet(&self) -> &RawPacket {
        &self.packet
    }

    /// Hand out the completed packet and start on the next one.
    pub fn take_packet(&mut self) -> RawPacket {
        let packet = core::mem::take(&mut self.packet);
        self.reset();
        packet
    }

    /// Discard the current packet and start on the next one.
    pub fn packet_consumed(&mut self) {
        self.reset();
    }

    /// Return to waiting for a fixed header byte.
    pub fn reset(&mut self) {
        self.state = ReadState::Start;
        self.remaining = 1;
        self.filled = 0;
        self.header_len = 0;
        self.packet.clear();
    }

    /// Push a chunk of the stream through the framer.
    ///
    /// `on_packet` is called for every completed packet, including drained
    /// oversized ones which the dispatcher will reject. A malformed header
    /// resets the framer.
    pub fn feed<F: FnMut(RawPacket)>(&mut self, mut bytes: &[u8], mut on_packet: F) {
        while !bytes.is_empty() {
            let n = self.wanted_amount().min(bytes.len());
            self.write_pos()[..n].copy_from_slice(&bytes[..n]);
            self.data_received(n);
            bytes = &bytes[n..];

            if self.is_error() {
                self.reset();
            } else if self.is_complete() {
                on_packet(self.take_packet());
            }
        }
    }

    /// Perform one read of at most [`wanted_amount`](Self::wanted_amount)
    /// bytes from `reader`.
    ///
    /// Returns the number of bytes read; 0 means the stream ended. Call only
    /// when the framer is neither complete nor in error.
    pub fn read_from<R: Read>(&mut self, reader: &mut R) -> Result<usize, R::Error> {
        let n = reader.read(self.write_pos())?;
        self.data_received(n);
        Ok(n)
    }
}
