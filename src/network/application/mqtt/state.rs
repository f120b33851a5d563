//! The connection state machine.
//!
//! ```text
//!            connected              CONNACK accepted
//!   Idle ───────────────▶ Connecting ──────────────▶ Run
//!    ▲ ▲  CONNACK refused     │ ▲                     │ │
//!    │ └──────────────────────┘ │ connected /         │ │ disconnect()
//!    │                lost      │ reconnect timer     │ ▼
//!    │              ┌───────────┴──┐  lost / timeout  │ Disconnecting
//!    │              │ Disconnected │◀─────────────────┘ │
//!    │              └──────────────┘                    │
//!    └──────────── flushed / guard expired ─────────────┘
//! ```
//!
//! The active state is a plain enum value owned by [`StateMachine`]; a
//! transition drops the old value before the new one is entered, so the
//! machine occupies [`STATE_SIZE`] bytes whichever state is active.

use core::fmt;

use super::client::{Core, Event, Session, Transport};
use super::inflight::{Clock, ElapsedTime};
use super::error::PacketError;
use super::packet::{PacketType, RawPacket};
use super::packets::{Connect, Disconnect, Packet, PingReq};
use super::publication::Publication;
use super::subscription::Subscription;
use super::timer::TimerId;

/// Size in bytes of the state machine's state, fixed at compile time.
pub const STATE_SIZE: usize = core::mem::size_of::<ConnectionState>();

/// Mutable view of everything a state handler may touch.
pub(crate) struct Context<'a, T, C> {
    pub(crate) core: &'a mut Core<T, C>,
    pub(crate) publication: &'a mut Publication,
    pub(crate) subscription: &'a mut Subscription,
}

/// Connection states and the data each one carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected and not trying to.
    Idle,
    /// Transport up, CONNECT sent, waiting for CONNACK.
    ConnectingToBroker,
    /// Session established.
    Run {
        /// Whether the session was started clean.
        clean_session: bool,
        /// Whether the session resumption step has run.
        first_tick_done: bool,
    },
    /// DISCONNECT sent, waiting for it to leave.
    Disconnecting {
        /// Time since DISCONNECT was sent.
        guard_timer: ElapsedTime,
    },
    /// Connection lost; reconnecting if enabled.
    Disconnected,
}

/// Name of a connection state without its data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StateKind {
    /// See [`ConnectionState::Idle`].
    Idle,
    /// See [`ConnectionState::ConnectingToBroker`].
    ConnectingToBroker,
    /// See [`ConnectionState::Run`].
    Run,
    /// See [`ConnectionState::Disconnecting`].
    Disconnecting,
    /// See [`ConnectionState::Disconnected`].
    Disconnected,
}

impl StateKind {
    /// State name for logs.
    pub fn as_str(self) -> &'static str {
        match self {
            StateKind::Idle => "Idle",
            StateKind::ConnectingToBroker => "ConnectingToBroker",
            StateKind::Run => "Run",
            StateKind::Disconnecting => "Disconnecting",
            StateKind::Disconnected => "Disconnected",
        }
    }
}

impl fmt::Display for StateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ConnectionState {
    /// The state's name.
    pub fn kind(&self) -> StateKind {
        match self {
            ConnectionState::Idle => StateKind::Idle,
            ConnectionState::ConnectingToBroker => StateKind::ConnectingToBroker,
            ConnectionState::Run { .. } => StateKind::Run,
            ConnectionState::Disconnecting { .. } => StateKind::Disconnecting,
            ConnectionState::Disconnected => StateKind::Disconnected,
        }
    }

    fn enter<T: Transport, C: Clock>(&mut self, cx: &mut Context<'_, T, C>) {
        match self {
            ConnectionState::Idle => {
                cx.core.timers.stop(TimerId::KeepAlive);
                cx.core.timers.stop(TimerId::Reconnect);
                cx.core.transport.close();
            }
            ConnectionState::ConnectingToBroker => {
                cx.core.mark_alive();
                let client_id = cx.core.client_id.clone();
                let connect = Connect {
                    client_id: &client_id,
                    keep_alive_seconds: cx.core.keep_alive_seconds,
                    clean_session: cx.core.clean_session,
                };
                if !cx.core.send_packet(&connect) {
                    warn!("Could not send CONNECT");
                }
                match cx.core.keep_alive_seconds {
                    0 => cx.core.timers.stop(TimerId::KeepAlive),
                    seconds => {
                        let interval = u64::from(seconds) * 1_000 / 2;
                        cx.core.start_timer(TimerId::KeepAlive, interval, true);
                    }
                }
            }
            ConnectionState::Run { .. } => {}
            ConnectionState::Disconnecting { guard_timer } => {
                if !cx.core.send_packet(&Disconnect) {
                    warn!("Could not send DISCONNECT");
                }
                guard_timer.start(cx.core.now_ms());
            }
            ConnectionState::Disconnected => {
                cx.core.transport.close();
                cx.publication.handle_disconnect();
                cx.subscription.handle_disconnect(&mut cx.core.ids);
                cx.core.timers.stop(TimerId::KeepAlive);
                if cx.core.auto_reconnect {
                    let delay = cx.core.reconnect_delay_ms;
                    cx.core.start_timer(TimerId::Reconnect, delay, false);
                }
            }
        }
    }

    fn leave<T: Transport, C: Clock>(&mut self, cx: &mut Context<'_, T, C>) {
        if let ConnectionState::Disconnected = self {
            cx.core.timers.stop(TimerId::Reconnect);
        }
    }
}

/// Owner of the active [`ConnectionState`].
#[derive(Debug)]
pub struct StateMachine {
    state: ConnectionState,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    /// A machine in [`ConnectionState::Idle`].
    pub fn new() -> Self {
        Self {
            state: ConnectionState::Idle,
        }
    }

    /// Name of the active state.
    pub fn kind(&self) -> StateKind {
        self.state.kind()
    }

    /// The active state.
    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    /// Leave the active state, replace it with `next` and enter that.
    pub(crate) fn transition<T: Transport, C: Clock>(
        &mut self,
        next: ConnectionState,
        cx: &mut Context<'_, T, C>,
    ) {
        debug!("Leaving state {}", self.state.kind().as_str());
        self.state.leave(cx);
        self.state = next;
        debug!("Entering state {}", self.state.kind().as_str());
        self.state.enter(cx);
    }

    /// Apply a handler's outcome, then honour a forced disconnect.
    fn finish<T: Transport, C: Clock>(&mut self, next: Option<ConnectionState>, cx: &mut Context<'_, T, C>) {
        if let Some(next) = next {
            self.transition(next, cx);
        }
        if cx.core.take_force_disconnect() && self.kind() != StateKind::Disconnected {
            warn!("Forcing disconnect from {}", self.kind().as_str());
            self.transition(ConnectionState::Disconnected, cx);
        }
    }

    pub(crate) fn handle<T: Transport, C: Clock>(&mut self, event: Event, cx: &mut Context<'_, T, C>) {
        let next = match event {
            Event::ConnectionStatus(connected) => self.connection_status(connected, cx),
            Event::TransmitBufferEmpty => match self.state {
                ConnectionState::Disconnecting { .. } => {
                    debug!("DISCONNECT sent");
                    Some(ConnectionState::Idle)
                }
                _ => None,
            },
            Event::PacketReceived(raw) => self.packet_received(&raw, cx),
            Event::TimerExpired(id) => self.timer_expired(id, cx),
        };
        self.finish(next, cx);
    }

    pub(crate) fn tick<T: Transport, C: Clock>(&mut self, cx: &mut Context<'_, T, C>) {
        if self.broker_silent(cx) {
            self.finish(Some(ConnectionState::Disconnected), cx);
            return;
        }
        let next = match &mut self.state {
            ConnectionState::Run {
                clean_session,
                first_tick_done,
            } => {
                if *first_tick_done {
                    cx.publication.publish_next(&mut *cx.core);
                    cx.subscription.subscribe_next(&mut *cx.core);
                } else {
                    *first_tick_done = true;
                    cx.publication
                        .resend_outstanding_control_packet(&mut *cx.core, *clean_session);
                }
                None
            }
            ConnectionState::Disconnecting { guard_timer } => {
                if guard_timer.elapsed(cx.core.now_ms()) > cx.core.disconnect_timeout_ms {
                    debug!("DISCONNECT not confirmed in time");
                    Some(ConnectionState::Idle)
                } else {
                    None
                }
            }
            _ => None,
        };
        self.finish(next, cx);
    }

    /// Whether a connection waiting for or holding a session has heard
    /// nothing from the broker for too long.
    fn broker_silent<T: Transport, C: Clock>(&self, cx: &Context<'_, T, C>) -> bool {
        let awaiting_connack = match self.kind() {
            StateKind::ConnectingToBroker => true,
            StateKind::Run => false,
            _ => return false,
        };
        let silent = cx.core.broker_silent(awaiting_connack);
        if silent {
            warn!("Broker silent in {}, dropping connection", self.kind().as_str());
        }
        silent
    }

    /// Application request to disconnect.
    pub(crate) fn disconnect<T: Transport, C: Clock>(&mut self, cx: &mut Context<'_, T, C>) {
        let next = match self.kind() {
            StateKind::Run => Some(ConnectionState::Disconnecting {
                guard_timer: ElapsedTime::new(),
            }),
            StateKind::ConnectingToBroker | StateKind::Disconnected => Some(ConnectionState::Idle),
            StateKind::Idle | StateKind::Disconnecting => None,
        };
        self.finish(next, cx);
    }

    fn connection_status<T: Transport, C: Clock>(
        &mut self,
        connected: bool,
        cx: &mut Context<'_, T, C>,
    ) -> Option<ConnectionState> {
        info!("Connection status: {}", connected);
        match (self.kind(), connected) {
            (StateKind::Idle | StateKind::Disconnected, true) => Some(ConnectionState::ConnectingToBroker),
            (StateKind::ConnectingToBroker | StateKind::Run, false) => Some(ConnectionState::Disconnected),
            (StateKind::Disconnecting, false) => Some(ConnectionState::Idle),
            (StateKind::Disconnected, false) => {
                // A reconnect attempt failed.
                if cx.core.auto_reconnect {
                    let delay = cx.core.reconnect_delay_ms;
                    cx.core.start_timer(TimerId::Reconnect, delay, false);
                }
                None
            }
            _ => None,
        }
    }

    fn timer_expired<T: Transport, C: Clock>(
        &mut self,
        id: TimerId,
        cx: &mut Context<'_, T, C>,
    ) -> Option<ConnectionState> {
        match (self.kind(), id) {
            (StateKind::ConnectingToBroker | StateKind::Run, TimerId::KeepAlive) if self.broker_silent(cx) => {
                return Some(ConnectionState::Disconnected);
            }
            (StateKind::Run, TimerId::KeepAlive) => {
                trace!("Keep-alive");
                cx.core.send_packet(&PingReq);
            }
            (StateKind::Disconnected, TimerId::Reconnect) => {
                debug!("Reconnecting");
                if !cx.core.open_transport() && cx.core.auto_reconnect {
                    let delay = cx.core.reconnect_delay_ms;
                    cx.core.start_timer(TimerId::Reconnect, delay, false);
                }
            }
            _ => {}
        }
        None
    }

    fn packet_received<T: Transport, C: Clock>(
        &mut self,
        raw: &RawPacket,
        cx: &mut Context<'_, T, C>,
    ) -> Option<ConnectionState> {
        raw.dump("Received");
        cx.core.mark_alive();
        let packet = match Packet::decode(raw) {
            Ok(packet) => packet,
            Err(PacketError::Capacity)
                if self.kind() == StateKind::Run && raw.packet_type() == Some(PacketType::Publish) =>
            {
                cx.subscription.refuse_publish(&mut *cx.core, raw);
                return None;
            }
            Err(e) => {
                warn!("Dropping packet: {}", e);
                return None;
            }
        };

        let (core, publication, subscription) = (&mut *cx.core, &mut *cx.publication, &mut *cx.subscription);
        match (&self.state, packet) {
            (ConnectionState::ConnectingToBroker, Packet::ConnAck(ack)) => {
                if ack.return_code.is_accepted() {
                    info!("Connected to broker, session present: {}", ack.session_present);
                    Some(ConnectionState::Run {
                        clean_session: core.clean_session,
                        first_tick_done: false,
                    })
                } else {
                    warn!("Broker refused connection: {}", ack.return_code.as_str());
                    Some(ConnectionState::Idle)
                }
            }
            (ConnectionState::Run { .. }, packet) => {
                match packet {
                    Packet::Publish(publish) => subscription.receive_publish(core, publish),
                    Packet::PubAck(ack) => publication.receive_puback(core, &ack),
                    Packet::PubRec(rec) => publication.receive_pubrec(core, &rec),
                    Packet::PubRel(rel) => subscription.receive_pubrel(core, &rel),
                    Packet::PubComp(comp) => publication.receive_pubcomp(core, &comp),
                    Packet::SubAck(ack) => subscription.receive_suback(core, &ack),
                    Packet::UnsubAck(ack) => subscription.receive_unsuback(core, &ack),
                    Packet::PingResp => trace!("PINGRESP"),
                    Packet::ConnAck(_) => debug!("Ignoring CONNACK while running"),
                }
                None
            }
            (state, packet) => {
                debug!(
                    "Ignoring {} in state {}",
                    packet.packet_type().as_str(),
                    state.kind().as_str()
                );
                None
            }
        }
    }
}
