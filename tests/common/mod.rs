#![allow(dead_code)]

use std::cell::Cell;
use std::rc::Rc;

use libiot_mqtt::network::Write;
use libiot_mqtt::network::application::mqtt::packets::{ConnAck, Encode, Publish};
use libiot_mqtt::network::application::mqtt::{
    Client, Clock, ConnectReturnCode, Event, Framer, MAX_PACKET_SIZE, Options, PacketType, QoS,
    RawPacket, Session, StateKind, Transport,
};

pub const BROKER: &str = "broker.local:1883";

/// A clock the test advances by hand. Clones share the same time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock(Rc<Cell<u64>>);

impl ManualClock {
    pub fn advance(&self, ms: u64) {
        self.0.set(self.0.get() + ms);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.0.get()
    }
}

/// Records everything written and every open/close.
#[derive(Debug, Default)]
pub struct MockTransport {
    pub written: Vec<u8>,
    pub opened: Vec<String>,
    pub closed: usize,
    pub max_message_size: Option<usize>,
    pub fail_open: bool,
    pub fail_write: bool,
}

impl MockTransport {
    /// Packets written since the last call.
    pub fn take_sent(&mut self) -> Vec<RawPacket> {
        let sent = split_packets(&self.written);
        self.written.clear();
        sent
    }
}

impl Write for MockTransport {
    type Error = ();

    fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        if self.fail_write {
            return Err(());
        }
        self.written.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}

impl Transport for MockTransport {
    fn open(&mut self, address: &str) -> Result<(), Self::Error> {
        if self.fail_open {
            return Err(());
        }
        self.opened.push(address.to_string());
        Ok(())
    }

    fn close(&mut self) {
        self.closed += 1;
    }

    fn set_max_message_size(&mut self, max_message_size: usize) {
        self.max_message_size = Some(max_message_size);
    }
}

/// A session for driving the managers directly.
#[derive(Debug)]
pub struct MockSession {
    pub now: u64,
    pub ack_timeout: u64,
    pub sent: Vec<RawPacket>,
    pub delivered: Vec<(String, Vec<u8>)>,
    pub forced: bool,
    pub fail_send: bool,
}

impl Default for MockSession {
    fn default() -> Self {
        Self {
            now: 0,
            ack_timeout: 5_000,
            sent: Vec::new(),
            delivered: Vec::new(),
            forced: false,
            fail_send: false,
        }
    }
}

impl MockSession {
    pub fn sent_types(&self) -> Vec<PacketType> {
        self.sent.iter().filter_map(RawPacket::packet_type).collect()
    }
}

impl Session for MockSession {
    fn now_ms(&self) -> u64 {
        self.now
    }

    fn ack_timeout_ms(&self) -> u64 {
        self.ack_timeout
    }

    fn send_packet<P: Encode>(&mut self, packet: &P) -> bool {
        if self.fail_send {
            return false;
        }
        self.sent.push(packet.encode().unwrap());
        true
    }

    fn force_disconnect(&mut self) {
        self.forced = true;
    }

    fn deliver(&mut self, topic: &str, payload: &[u8]) {
        self.delivered.push((topic.to_string(), payload.to_vec()));
    }
}

pub fn split_packets(bytes: &[u8]) -> Vec<RawPacket> {
    let mut framer = Framer::new(MAX_PACKET_SIZE);
    let mut packets = Vec::new();
    framer.feed(bytes, |packet| packets.push(packet));
    packets
}

pub fn received<P: Encode>(packet: &P) -> Event {
    Event::PacketReceived(packet.encode().unwrap())
}

pub fn connack(return_code: ConnectReturnCode) -> Event {
    received(&ConnAck {
        session_present: false,
        return_code,
    })
}

pub fn inbound_publish(topic: &str, payload: &[u8], qos: QoS, packet_id: u16) -> Publish {
    Publish::new(topic, payload, qos, false, packet_id).unwrap()
}

pub fn new_client(options: &Options<'_>) -> (Client<MockTransport, ManualClock>, ManualClock) {
    let clock = ManualClock::default();
    let client = Client::new(MockTransport::default(), clock.clone(), options).unwrap();
    (client, clock)
}

/// Take the client from Idle to Run, discarding the CONNECT it sends.
pub fn bring_up(client: &mut Client<MockTransport, ManualClock>) {
    client.connect_to(BROKER, true).unwrap();
    client.handle(Event::ConnectionStatus(true));
    assert_eq!(client.state(), StateKind::ConnectingToBroker);
    client.handle(connack(ConnectReturnCode::Accepted));
    assert_eq!(client.state(), StateKind::Run);
    client.transport_mut().take_sent();
}

/// Feed every expired timer back into the client.
pub fn fire_timers(client: &mut Client<MockTransport, ManualClock>) {
    while let Some(timer) = client.poll_timers() {
        client.handle(Event::TimerExpired(timer));
    }
}
