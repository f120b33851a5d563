mod common;

use common::*;
use libiot_mqtt::network::application::mqtt::packets::{
    PingResp, PubAck, PubRel, SubAck, UnsubAck,
};
use libiot_mqtt::network::application::mqtt::state::ConnectionState;
use libiot_mqtt::network::application::mqtt::{
    Client, ConnectReturnCode, DEFAULT_MAX_MESSAGE_SIZE, Error, Event, Options, PacketType, QoS,
    RawPacket, STATE_SIZE, StateKind, TimerId,
};

#[test]
fn test_end_to_end_subscribe_and_receive() {
    let options = Options {
        client_id: "dev1",
        keep_alive_seconds: 60,
        clean_session: true,
        ..Options::default()
    };
    let (mut client, _clock) = new_client(&options);
    assert_eq!(client.state(), StateKind::Idle);

    client.connect_to(BROKER, false).unwrap();
    assert_eq!(client.transport().opened, vec![BROKER.to_string()]);

    client.handle(Event::ConnectionStatus(true));
    assert_eq!(client.state(), StateKind::ConnectingToBroker);
    let sent = client.transport_mut().take_sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(
        sent[0].as_bytes(),
        &[
            0x10, 0x10, 0x00, 0x04, b'M', b'Q', b'T', b'T', 0x04, 0x02, 0x00, 0x3C, 0x00, 0x04,
            b'd', b'e', b'v', b'1'
        ]
    );

    client.handle(connack(ConnectReturnCode::Accepted));
    assert_eq!(client.state(), StateKind::Run);

    client.subscribe("a/#", QoS::AtLeastOnce).unwrap();
    // The first tick only resumes the previous session.
    client.tick();
    assert!(client.transport_mut().take_sent().is_empty());
    client.tick();
    let sent = client.transport_mut().take_sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].packet_type(), Some(PacketType::Subscribe));
    assert_eq!(
        sent[0].as_bytes(),
        &[0x82, 0x08, 0x00, 0x01, 0x00, 0x03, b'a', b'/', b'#', 0x01]
    );

    client.handle(received(&SubAck {
        packet_id: 1,
        return_codes: heapless::Vec::from_slice(&[1]).unwrap(),
    }));
    assert_eq!(client.subscription().active_qos("a/#"), Some(QoS::AtLeastOnce));
    assert_eq!(client.subscription().pending_subscribes(), 0);

    let publish = inbound_publish("a/b", b"x", QoS::AtLeastOnce, 7);
    client.handle(received(&publish));
    let sent = client.transport_mut().take_sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].as_bytes(), &[0x40, 0x02, 0x00, 0x07]);

    let message = client.next_message().unwrap();
    assert_eq!(message.topic.as_str(), "a/b");
    assert_eq!(&message.payload[..], b"x");
    assert!(client.next_message().is_none());
}

#[test]
fn test_rejected_connack_returns_to_idle() {
    let (mut client, _clock) = new_client(&Options::new("dev1"));
    client.connect_to(BROKER, true).unwrap();
    client.handle(Event::ConnectionStatus(true));
    client.handle(connack(ConnectReturnCode::NotAuthorized));

    assert_eq!(client.state(), StateKind::Idle);
    assert_eq!(client.transport().closed, 1);
    // No retry is scheduled.
    assert_eq!(client.next_timer_deadline(), None);
}

#[test]
fn test_packets_for_other_states_are_ignored() {
    let (mut client, _clock) = new_client(&Options::new("dev1"));
    client.connect_to(BROKER, true).unwrap();
    client.handle(Event::ConnectionStatus(true));
    client.transport_mut().take_sent();

    client.handle(received(&PubAck { packet_id: 1 }));
    client.handle(received(&PingResp));
    assert_eq!(client.state(), StateKind::ConnectingToBroker);
    assert!(client.transport_mut().take_sent().is_empty());
}

#[test]
fn test_malformed_packet_is_dropped() {
    let (mut client, _clock) = new_client(&Options::new("dev1"));
    bring_up(&mut client);

    // PUBREL must carry flags 0x2
    let raw = RawPacket::from_bytes(&[0x60, 0x02, 0x00, 0x01]).unwrap();
    client.handle(Event::PacketReceived(raw));
    assert_eq!(client.state(), StateKind::Run);
    assert!(client.transport_mut().take_sent().is_empty());

    client.handle(received(&PubRel { packet_id: 1 }));
    let sent = client.transport_mut().take_sent();
    assert_eq!(sent[0].packet_type(), Some(PacketType::PubComp));
}

#[test]
fn test_keep_alive_sends_pingreq() {
    let options = Options {
        keep_alive_seconds: 10,
        ..Options::new("dev1")
    };
    let (mut client, clock) = new_client(&options);
    bring_up(&mut client);

    clock.advance(4_999);
    assert_eq!(client.poll_timers(), None);
    clock.advance(1);
    assert_eq!(client.poll_timers(), Some(TimerId::KeepAlive));
    client.handle(Event::TimerExpired(TimerId::KeepAlive));

    let sent = client.transport_mut().take_sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].as_bytes(), &[0xC0, 0x00]);

    client.handle(received(&PingResp));
    assert_eq!(client.state(), StateKind::Run);
}

#[test]
fn test_zero_keep_alive_arms_no_timer() {
    let options = Options {
        keep_alive_seconds: 0,
        ..Options::new("dev1")
    };
    let (mut client, clock) = new_client(&options);
    bring_up(&mut client);
    clock.advance(1_000_000);
    assert_eq!(client.poll_timers(), None);
}

#[test]
fn test_unanswered_pings_drop_the_connection() {
    let options = Options {
        keep_alive_seconds: 10,
        ..Options::new("dev1")
    };
    let (mut client, clock) = new_client(&options);
    bring_up(&mut client);

    // Answered pings keep the session up indefinitely.
    for _ in 0..4 {
        clock.advance(5_000);
        fire_timers(&mut client);
        client.handle(received(&PingResp));
    }
    assert_eq!(client.state(), StateKind::Run);
    client.transport_mut().take_sent();

    // Last heard from at 20 s; the pings at 25 s and 30 s go unanswered.
    clock.advance(5_000);
    fire_timers(&mut client);
    clock.advance(5_000);
    fire_timers(&mut client);
    assert_eq!(client.state(), StateKind::Run);
    let sent = client.transport_mut().take_sent();
    assert_eq!(sent.len(), 2);
    assert!(sent.iter().all(|p| p.as_bytes() == [0xC0, 0x00]));

    clock.advance(5_000);
    fire_timers(&mut client);
    assert_eq!(client.state(), StateKind::Disconnected);
    assert_eq!(client.transport().closed, 1);
    assert!(client.transport_mut().take_sent().is_empty());

    clock.advance(5_000);
    fire_timers(&mut client);
    assert_eq!(client.transport().opened.len(), 2);
}

#[test]
fn test_silence_is_noticed_on_tick() {
    let options = Options {
        keep_alive_seconds: 10,
        ..Options::new("dev1")
    };
    let (mut client, clock) = new_client(&options);
    bring_up(&mut client);

    clock.advance(11_000);
    client.tick();
    assert_eq!(client.state(), StateKind::Run);
    clock.advance(1);
    client.tick();
    assert_eq!(client.state(), StateKind::Disconnected);
}

#[test]
fn test_connack_wait_is_bounded() {
    let options = Options {
        keep_alive_seconds: 0,
        ..Options::new("dev1")
    };
    let (mut client, clock) = new_client(&options);
    client.connect_to(BROKER, true).unwrap();
    client.handle(Event::ConnectionStatus(true));
    assert_eq!(client.state(), StateKind::ConnectingToBroker);

    clock.advance(5_000);
    client.tick();
    assert_eq!(client.state(), StateKind::ConnectingToBroker);
    clock.advance(1);
    client.tick();
    assert_eq!(client.state(), StateKind::Disconnected);
    assert!(client.next_timer_deadline().is_some());

    // Keep-alive 0 leaves an established session unbounded.
    clock.advance(5_000);
    fire_timers(&mut client);
    client.handle(Event::ConnectionStatus(true));
    client.handle(connack(ConnectReturnCode::Accepted));
    clock.advance(1_000_000);
    client.tick();
    assert_eq!(client.state(), StateKind::Run);
}

#[test]
fn test_disconnect_waits_for_flush() {
    let (mut client, _clock) = new_client(&Options::new("dev1"));
    bring_up(&mut client);

    client.disconnect();
    assert_eq!(client.state(), StateKind::Disconnecting);
    let sent = client.transport_mut().take_sent();
    assert_eq!(sent[0].as_bytes(), &[0xE0, 0x00]);

    client.handle(Event::TransmitBufferEmpty);
    assert_eq!(client.state(), StateKind::Idle);
    assert_eq!(client.transport().closed, 1);
}

#[test]
fn test_disconnect_guard_expires() {
    let (mut client, clock) = new_client(&Options::new("dev1"));
    bring_up(&mut client);

    client.disconnect();
    clock.advance(2_000);
    client.tick();
    assert_eq!(client.state(), StateKind::Disconnecting);
    clock.advance(1);
    client.tick();
    assert_eq!(client.state(), StateKind::Idle);

    // Auto-reconnect was switched off by the disconnect.
    clock.advance(60_000);
    assert_eq!(client.poll_timers(), None);
}

#[test]
fn test_lost_connection_reconnects_after_delay() {
    let (mut client, clock) = new_client(&Options::new("dev1"));
    bring_up(&mut client);

    client.handle(Event::ConnectionStatus(false));
    assert_eq!(client.state(), StateKind::Disconnected);

    clock.advance(4_999);
    assert_eq!(client.poll_timers(), None);
    clock.advance(1);
    fire_timers(&mut client);
    assert_eq!(client.transport().opened.len(), 2);

    // The attempt fails; another one follows after the same delay.
    client.handle(Event::ConnectionStatus(false));
    assert_eq!(client.state(), StateKind::Disconnected);
    clock.advance(5_000);
    fire_timers(&mut client);
    assert_eq!(client.transport().opened.len(), 3);

    client.handle(Event::ConnectionStatus(true));
    assert_eq!(client.state(), StateKind::ConnectingToBroker);
    let sent = client.transport_mut().take_sent();
    assert_eq!(sent[0].packet_type(), Some(PacketType::Connect));
}

#[test]
fn test_lost_connection_without_auto_reconnect_stays_down() {
    let (mut client, clock) = new_client(&Options::new("dev1"));
    client.connect_to(BROKER, false).unwrap();
    client.handle(Event::ConnectionStatus(true));
    client.handle(connack(ConnectReturnCode::Accepted));

    client.handle(Event::ConnectionStatus(false));
    assert_eq!(client.state(), StateKind::Disconnected);
    clock.advance(600_000);
    assert_eq!(client.poll_timers(), None);
    assert_eq!(client.transport().opened.len(), 1);
}

#[test]
fn test_failed_open_without_auto_reconnect_is_an_error() {
    let (mut client, _clock) = new_client(&Options::new("dev1"));
    client.transport_mut().fail_open = true;
    assert_eq!(client.connect_to(BROKER, false), Err(Error::Transport));
    assert_eq!(client.connect_to("", true), Err(Error::NoAddress));

    assert_eq!(client.connect_to(BROKER, true), Ok(()));
    assert_eq!(client.state(), StateKind::Disconnected);
    assert!(client.next_timer_deadline().is_some());
}

fn publish_then_time_out(clean_session: bool) -> Client<MockTransport, ManualClock> {
    let options = Options {
        clean_session,
        ..Options::new("dev1")
    };
    let (mut client, clock) = new_client(&options);
    bring_up(&mut client);
    client.tick();

    client.publish("t", b"x", QoS::AtLeastOnce, false).unwrap();
    client.tick();
    let sent = client.transport_mut().take_sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].packet_identifier(), 1);
    assert!(!sent[0].is_dup());

    clock.advance(5_001);
    client.tick();
    assert_eq!(client.state(), StateKind::Disconnected);
    assert_eq!(client.transport().closed, 1);

    clock.advance(5_000);
    fire_timers(&mut client);
    assert_eq!(client.transport().opened.len(), 2);

    client.handle(Event::ConnectionStatus(true));
    client.handle(connack(ConnectReturnCode::Accepted));
    assert_eq!(client.state(), StateKind::Run);
    let sent = client.transport_mut().take_sent();
    assert_eq!(sent[0].packet_type(), Some(PacketType::Connect));
    client
}

#[test]
fn test_resume_resends_publish_with_dup() {
    let mut client = publish_then_time_out(false);

    client.tick();
    let sent = client.transport_mut().take_sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].packet_type(), Some(PacketType::Publish));
    assert!(sent[0].is_dup());
    assert_eq!(sent[0].packet_identifier(), 1);

    client.handle(received(&PubAck { packet_id: 1 }));
    assert!(client.publication().is_empty());
}

#[test]
fn test_clean_session_restarts_publish() {
    let mut client = publish_then_time_out(true);

    client.tick();
    assert!(client.transport_mut().take_sent().is_empty());

    client.tick();
    let sent = client.transport_mut().take_sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].packet_type(), Some(PacketType::Publish));
    assert!(!sent[0].is_dup());
    assert_eq!(
        client.publication().head().and_then(|f| f.waiting_for),
        Some(PacketType::PubAck)
    );
}

#[test]
fn test_subscriptions_are_restored_after_reconnect() {
    let (mut client, clock) = new_client(&Options::new("dev1"));
    bring_up(&mut client);
    client.tick();

    client.subscribe("a/#", QoS::ExactlyOnce).unwrap();
    client.unsubscribe("old/topic").unwrap();
    client.tick();
    let sent = client.transport_mut().take_sent();
    assert_eq!(sent.len(), 2);
    client.handle(received(&SubAck {
        packet_id: 1,
        return_codes: heapless::Vec::from_slice(&[2]).unwrap(),
    }));
    client.handle(received(&UnsubAck { packet_id: 2 }));
    assert_eq!(client.subscription().active_qos("a/#"), Some(QoS::ExactlyOnce));

    client.handle(Event::ConnectionStatus(false));
    assert_eq!(client.subscription().pending_subscribes(), 1);

    clock.advance(5_000);
    fire_timers(&mut client);
    client.handle(Event::ConnectionStatus(true));
    client.handle(connack(ConnectReturnCode::Accepted));
    client.transport_mut().take_sent();
    client.tick();
    client.tick();

    let sent = client.transport_mut().take_sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].packet_type(), Some(PacketType::Subscribe));
    assert_eq!(sent[0].packet_identifier(), 3);
}

/// A PUBLISH with topic "a" and a 1100 byte payload: small enough for the
/// framer, too big for the message buffers.
fn oversized_publish(qos: QoS, packet_id: u16) -> Vec<u8> {
    // Remaining length 1105.
    let mut bytes = vec![0x30 | (qos as u8) << 1, 0xD1, 0x08, 0x00, 0x01, b'a'];
    bytes.extend_from_slice(&packet_id.to_be_bytes());
    bytes.extend_from_slice(&[0x42; 1100]);
    bytes
}

fn frame(client: &Client<MockTransport, ManualClock>, bytes: &[u8]) -> RawPacket {
    let mut framer = client.framer();
    let mut packets = Vec::new();
    framer.feed(bytes, |packet| packets.push(packet));
    assert_eq!(packets.len(), 1);
    packets.remove(0)
}

#[test]
fn test_oversized_publish_is_acknowledged_without_delivery() {
    let (mut client, _clock) = new_client(&Options::new("dev1"));
    bring_up(&mut client);

    let packet = frame(&client, &oversized_publish(QoS::AtLeastOnce, 7));
    assert!(!packet.is_too_big());
    assert_eq!(packet.validate_packet(), Ok(()));
    client.handle(Event::PacketReceived(packet));

    let sent = client.transport_mut().take_sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].as_bytes(), &[0x40, 0x02, 0x00, 0x07]);
    assert_eq!(client.next_message(), None);
    assert_eq!(client.state(), StateKind::Run);

    let packet = frame(&client, &oversized_publish(QoS::ExactlyOnce, 8));
    client.handle(Event::PacketReceived(packet));
    client.handle(received(&PubRel { packet_id: 8 }));
    let sent = client.transport_mut().take_sent();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].as_bytes(), &[0x50, 0x02, 0x00, 0x08]);
    assert_eq!(sent[1].as_bytes(), &[0x70, 0x02, 0x00, 0x08]);
    assert_eq!(client.next_message(), None);
    assert_eq!(client.subscription().receiving_count(), 0);
}

#[test]
fn test_transport_frames_with_the_client_cap() {
    let options = Options {
        max_message_size: 4_000,
        ..Options::new("dev1")
    };
    let (client, _clock) = new_client(&options);
    assert_eq!(client.max_message_size(), DEFAULT_MAX_MESSAGE_SIZE);
    assert_eq!(client.framer().max_message_size(), DEFAULT_MAX_MESSAGE_SIZE);
    assert_eq!(client.transport().max_message_size, Some(DEFAULT_MAX_MESSAGE_SIZE));

    let options = Options {
        max_message_size: 200,
        ..Options::new("dev1")
    };
    let (client, _clock) = new_client(&options);
    assert_eq!(client.max_message_size(), 200);
    assert_eq!(client.transport().max_message_size, Some(200));

    // Anything larger than the biggest storable PUBLISH is drained.
    let mut bytes = vec![0x30, 0x85, 0x0A];
    bytes.resize(3 + DEFAULT_MAX_MESSAGE_SIZE + 1, 0);
    let (client, _clock) = new_client(&Options::new("dev1"));
    assert!(frame(&client, &bytes).is_too_big());
}

#[test]
fn test_application_errors() {
    let (mut client, _clock) = new_client(&Options::new("dev1"));
    assert_eq!(client.publish("a/+", b"", QoS::AtMostOnce, false), Err(Error::InvalidTopic));
    assert_eq!(
        client.publish("t", &[0; 2048], QoS::AtMostOnce, false),
        Err(Error::PayloadTooLarge)
    );
    assert_eq!(client.subscribe("", QoS::AtMostOnce), Err(Error::InvalidTopic));

    let long_id = "x".repeat(65);
    assert!(matches!(
        Client::new(MockTransport::default(), ManualClock::default(), &Options::new(&long_id)),
        Err(Error::InvalidClientId)
    ));
    let anonymous = Options {
        clean_session: false,
        ..Options::new("")
    };
    assert!(matches!(
        Client::new(MockTransport::default(), ManualClock::default(), &anonymous),
        Err(Error::InvalidClientId)
    ));
}

#[test]
fn test_state_storage_is_fixed_size() {
    assert_eq!(STATE_SIZE, std::mem::size_of::<ConnectionState>());

    let (mut client, _clock) = new_client(&Options::new("dev1"));
    for _ in 0..3 {
        bring_up(&mut client);
        client.disconnect();
        client.handle(Event::TransmitBufferEmpty);
        assert_eq!(client.state(), StateKind::Idle);
    }
    assert_eq!(client.transport().opened.len(), 3);
}

#[test]
fn test_options_from_json() {
    let json = r#"{"client_id":"dev1","keep_alive_seconds":30,"clean_session":false,"ack_timeout_ms":2000}"#;
    let options = Options::from_json(json).unwrap();
    assert_eq!(options.client_id, "dev1");
    assert_eq!(options.keep_alive_seconds, 30);
    assert!(!options.clean_session);
    assert_eq!(options.ack_timeout_ms, 2_000);
    assert_eq!(options.reconnect_delay_ms, 5_000);

    assert_eq!(Options::from_json("{\"client_id\":"), Err(Error::Config));
}
