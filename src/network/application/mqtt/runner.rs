//! Thread-based run loop and TCP transport for hosted targets.
//!
//! [`spawn`] moves a [`Client`] onto its own thread. That thread blocks on
//! one channel carrying both application commands and transport events,
//! handles exactly one of them per wake-up and otherwise runs expired timers
//! and the periodic tick, so a busy connection cannot starve the queues.
//!
//! Socket I/O never happens on the client thread. [`TcpTransport`] hands
//! connection requests and outgoing bytes to an I/O thread that waits on a
//! [`mio::Poll`], writes whatever the socket accepts, frames inbound bytes
//! and posts the results back as [`Event`]s.
//!
//! ```rust,no_run
//! use libiot_mqtt::network::application::mqtt::runner::{self, TcpTransport};
//! use libiot_mqtt::network::application::mqtt::{Client, Options, QoS, StdClock};
//!
//! let options = Options::new("sensor_node_1");
//! let (events, mailbox) = runner::mailbox();
//! let transport = TcpTransport::new(events).unwrap();
//! let client = Client::new(transport, StdClock::new(), &options).unwrap();
//! let (handle, messages, _thread) = runner::spawn(client, mailbox).unwrap();
//!
//! handle.connect_to("localhost:1883", true).unwrap();
//! handle.subscribe("commands/#", QoS::AtLeastOnce).unwrap();
//! handle.publish("status", b"online", QoS::AtLeastOnce, true).unwrap();
//!
//! for message in messages {
//!     println!("{}: {:?}", message.topic, message.payload);
//! }
//! ```

use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, bounded, unbounded};
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token, Waker};

use super::DEFAULT_MAX_MESSAGE_SIZE;
use super::client::{Client, Event, Message, Transport};
use super::error::Error;
use super::framer::Framer;
use super::inflight::Clock;
use super::packet::QoS;
use crate::network::error::Error as NetworkError;
use crate::network::{Read, Write};

/// A request from the application to the client thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// See [`Client::connect_to`].
    ConnectTo {
        /// Broker address, `host:port`.
        address: std::string::String,
        /// Keep reconnecting after the connection is lost.
        auto_reconnect: bool,
    },
    /// See [`Client::disconnect`].
    Disconnect,
    /// See [`Client::subscribe`].
    Subscribe {
        /// Topic filter.
        topic: std::string::String,
        /// Requested QoS.
        qos: QoS,
    },
    /// See [`Client::unsubscribe`].
    Unsubscribe {
        /// Topic filter.
        topic: std::string::String,
    },
    /// See [`Client::publish`].
    Publish {
        /// Topic name.
        topic: std::string::String,
        /// Message payload.
        payload: std::vec::Vec<u8>,
        /// Delivery guarantee.
        qos: QoS,
        /// Ask the broker to retain the message.
        retain: bool,
    },
    /// Disconnect and stop the thread.
    Shutdown,
}

#[derive(Debug)]
enum Input {
    Command(Command, Sender<Result<(), Error>>),
    /// An event, tagged with the connection it belongs to if any.
    Event(Option<u64>, Event),
}

/// Posts transport events to the client thread.
///
/// Events posted with [`post_from`](Self::post_from) carry the identifier of
/// the connection that produced them. Once that connection has been ended
/// the client thread discards them, so a superseded socket can never report
/// into the state of its successor.
#[derive(Debug, Clone)]
pub struct EventSender {
    sender: Sender<Input>,
    current: Arc<AtomicU64>,
}

impl EventSender {
    /// Queue `event`; `false` once the client thread has stopped.
    pub fn post(&self, event: Event) -> bool {
        self.sender.send(Input::Event(None, event)).is_ok()
    }

    /// Queue `event` on behalf of `connection`.
    pub fn post_from(&self, connection: u64, event: Event) -> bool {
        self.sender.send(Input::Event(Some(connection), event)).is_ok()
    }

    /// Start a new connection, ending the previous one.
    ///
    /// Call on the client thread, from [`Transport::open`].
    pub fn begin_connection(&self) -> u64 {
        self.current.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// End the current connection.
    ///
    /// Call on the client thread, from [`Transport::close`].
    pub fn end_connection(&self) {
        self.current.fetch_add(1, Ordering::SeqCst);
    }

    /// Inputs waiting for the client thread.
    pub fn pending(&self) -> usize {
        self.sender.len()
    }
}

/// Receiving end of the client thread's channel, see [`mailbox`].
#[derive(Debug)]
pub struct Mailbox {
    sender: Sender<Input>,
    receiver: Receiver<Input>,
    current: Arc<AtomicU64>,
}

/// Create the client thread's channel.
///
/// The [`EventSender`] goes to the transport before the client exists; the
/// [`Mailbox`] is handed to [`spawn`] together with the client.
pub fn mailbox() -> (EventSender, Mailbox) {
    let (sender, receiver) = unbounded();
    let current = Arc::new(AtomicU64::new(0));
    let events = EventSender {
        sender: sender.clone(),
        current: Arc::clone(&current),
    };
    (
        events,
        Mailbox {
            sender,
            receiver,
            current,
        },
    )
}

/// Application side of a spawned client. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Handle {
    sender: Sender<Input>,
}

impl Handle {
    fn request(&self, command: Command) -> Result<(), Error> {
        let (reply, response) = bounded(1);
        self.sender
            .send(Input::Command(command, reply))
            .map_err(|_| Error::Closed)?;
        response.recv().map_err(|_| Error::Closed)?
    }

    /// See [`Client::connect_to`].
    pub fn connect_to(&self, address: &str, auto_reconnect: bool) -> Result<(), Error> {
        self.request(Command::ConnectTo {
            address: address.to_owned(),
            auto_reconnect,
        })
    }

    /// See [`Client::disconnect`].
    pub fn disconnect(&self) -> Result<(), Error> {
        self.request(Command::Disconnect)
    }

    /// See [`Client::subscribe`].
    pub fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), Error> {
        self.request(Command::Subscribe {
            topic: topic.to_owned(),
            qos,
        })
    }

    /// See [`Client::unsubscribe`].
    pub fn unsubscribe(&self, topic: &str) -> Result<(), Error> {
        self.request(Command::Unsubscribe {
            topic: topic.to_owned(),
        })
    }

    /// See [`Client::publish`].
    pub fn publish(&self, topic: &str, payload: &[u8], qos: QoS, retain: bool) -> Result<(), Error> {
        self.request(Command::Publish {
            topic: topic.to_owned(),
            payload: payload.to_vec(),
            qos,
            retain,
        })
    }

    /// Disconnect and stop the client thread.
    pub fn shutdown(&self) -> Result<(), Error> {
        self.request(Command::Shutdown)
    }
}

/// Start the client thread.
///
/// Returns the application handle, the receiver of delivered messages and
/// the thread's join handle.
pub fn spawn<T, C>(
    client: Client<T, C>,
    mailbox: Mailbox,
) -> io::Result<(Handle, Receiver<Message>, JoinHandle<()>)>
where
    T: Transport + Send + 'static,
    C: Clock + Send + 'static,
{
    let (messages, delivered) = unbounded();
    let handle = Handle {
        sender: mailbox.sender,
    };
    let (receiver, current) = (mailbox.receiver, mailbox.current);
    let thread = thread::Builder::new()
        .name("mqtt".into())
        .spawn(move || run(client, receiver, current, messages))?;
    Ok((handle, delivered, thread))
}

fn execute<T: Transport, C: Clock>(client: &mut Client<T, C>, command: Command) -> Result<(), Error> {
    match command {
        Command::ConnectTo {
            address,
            auto_reconnect,
        } => client.connect_to(&address, auto_reconnect),
        Command::Disconnect => {
            client.disconnect();
            Ok(())
        }
        Command::Subscribe { topic, qos } => client.subscribe(&topic, qos),
        Command::Unsubscribe { topic } => client.unsubscribe(&topic),
        Command::Publish {
            topic,
            payload,
            qos,
            retain,
        } => client.publish(&topic, &payload, qos, retain),
        Command::Shutdown => Ok(()),
    }
}

fn run<T: Transport, C: Clock>(
    mut client: Client<T, C>,
    receiver: Receiver<Input>,
    current: Arc<AtomicU64>,
    messages: Sender<Message>,
) {
    let tick = Duration::from_millis(client.tick_interval_ms().max(1));
    let mut next_tick = Instant::now() + tick;

    loop {
        let timeout = next_tick.saturating_duration_since(Instant::now());
        match receiver.recv_timeout(timeout) {
            Ok(Input::Event(Some(connection), _)) if connection != current.load(Ordering::SeqCst) => {
                trace!("Dropping event of closed connection {}", connection);
            }
            Ok(Input::Event(_, event)) => client.handle(event),
            Ok(Input::Command(Command::Shutdown, reply)) => {
                client.disconnect();
                client.transport_mut().close();
                let _ = reply.send(Ok(()));
                break;
            }
            Ok(Input::Command(command, reply)) => {
                let _ = reply.send(execute(&mut client, command));
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        // Run the periodic work even when events keep arriving.
        if Instant::now() >= next_tick {
            while let Some(timer) = client.poll_timers() {
                client.handle(Event::TimerExpired(timer));
            }
            client.tick();
            next_tick = Instant::now() + tick;
        }

        while let Some(message) = client.next_message() {
            if messages.send(message).is_err() {
                trace!("Message receiver dropped");
            }
        }
    }
    debug!("MQTT thread stopped");
}

const WAKER: Token = Token(0);
const SOCKET: Token = Token(1);

#[derive(Debug)]
enum Request {
    Open {
        connection: u64,
        address: std::string::String,
        max_message_size: usize,
    },
    Write(u64, std::vec::Vec<u8>),
    Close,
    Shutdown,
}

/// [`Transport`] over a non-blocking [`mio::net::TcpStream`].
///
/// `open`, `write` and `close` only queue requests for the I/O thread and
/// never block. That thread reports [`Event::ConnectionStatus`],
/// [`Event::PacketReceived`] and, whenever its send buffer drains,
/// [`Event::TransmitBufferEmpty`]. Inbound packets are framed with the
/// remaining-length cap the client configures through
/// [`Transport::set_max_message_size`].
#[derive(Debug)]
pub struct TcpTransport {
    events: EventSender,
    requests: Sender<Request>,
    waker: Waker,
    connection: Option<u64>,
    max_message_size: usize,
}

impl TcpTransport {
    /// A closed transport posting to `events`, with its I/O thread started.
    pub fn new(events: EventSender) -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKER)?;
        let (requests, receiver) = unbounded();
        let dispatcher = Dispatcher {
            poll,
            requests: receiver,
            events: events.clone(),
            connection: None,
        };
        thread::Builder::new()
            .name("mqtt-io".into())
            .spawn(move || dispatcher.run())?;
        Ok(Self {
            events,
            requests,
            waker,
            connection: None,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        })
    }

    /// Remaining-length cap applied to inbound packets.
    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    fn request(&self, request: Request) -> Result<(), NetworkError> {
        self.requests.send(request).map_err(|_| NetworkError::NotOpen)?;
        self.waker.wake().map_err(|_| NetworkError::NotOpen)
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        let _ = self.request(Request::Shutdown);
    }
}

impl Write for TcpTransport {
    type Error = NetworkError;

    fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        let connection = self.connection.ok_or(NetworkError::NotOpen)?;
        self.request(Request::Write(connection, buf.to_vec()))
            .map_err(|_| NetworkError::WriteError)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        // The I/O thread writes as soon as the socket accepts data.
        match self.connection {
            Some(_) => Ok(()),
            None => Err(NetworkError::NotOpen),
        }
    }
}

impl Transport for TcpTransport {
    fn open(&mut self, address: &str) -> Result<(), Self::Error> {
        self.close();
        let connection = self.events.begin_connection();
        self.request(Request::Open {
            connection,
            address: address.to_owned(),
            max_message_size: self.max_message_size,
        })
        .map_err(|_| NetworkError::ConnectionRefused)?;
        self.connection = Some(connection);
        Ok(())
    }

    fn close(&mut self) {
        if self.connection.take().is_some() {
            self.events.end_connection();
            let _ = self.request(Request::Close);
        }
    }

    fn set_max_message_size(&mut self, max_message_size: usize) {
        self.max_message_size = max_message_size;
    }
}

/// The I/O thread: one socket, driven by readiness.
struct Dispatcher {
    poll: Poll,
    requests: Receiver<Request>,
    events: EventSender,
    connection: Option<Connection>,
}

impl Dispatcher {
    fn run(mut self) {
        let mut events = Events::with_capacity(16);
        loop {
            if let Err(e) = self.poll.poll(&mut events, None) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!("Poll failed, stopping I/O thread");
                return;
            }
            for event in events.iter() {
                if event.token() == SOCKET {
                    self.ready(event.is_readable(), event.is_writable());
                }
            }

            loop {
                match self.requests.try_recv() {
                    Ok(Request::Shutdown) | Err(TryRecvError::Disconnected) => {
                        self.close();
                        debug!("MQTT I/O thread stopped");
                        return;
                    }
                    Ok(request) => self.request(request),
                    Err(TryRecvError::Empty) => break,
                }
            }
        }
    }

    fn request(&mut self, request: Request) {
        match request {
            Request::Open {
                connection,
                address,
                max_message_size,
            } => self.open(connection, &address, max_message_size),
            Request::Write(connection, bytes) => {
                let Some(current) = self.connection.as_mut() else {
                    return;
                };
                if current.id != connection {
                    return;
                }
                current.outgoing.extend_from_slice(&bytes);
                if let Err(e) = current.transmit(&self.events) {
                    self.lost(e);
                }
            }
            Request::Close => self.close(),
            Request::Shutdown => {}
        }
    }

    fn open(&mut self, id: u64, address: &str, max_message_size: usize) {
        self.close();
        let mut stream = match resolve(address).and_then(TcpStream::connect) {
            Ok(stream) => stream,
            Err(_) => {
                warn!("Could not connect to {}", address);
                self.events.post_from(id, Event::ConnectionStatus(false));
                return;
            }
        };
        let registered = self.poll.registry().register(
            &mut stream,
            SOCKET,
            Interest::READABLE | Interest::WRITABLE,
        );
        if registered.is_err() {
            warn!("Could not register socket for {}", address);
            self.events.post_from(id, Event::ConnectionStatus(false));
            return;
        }
        debug!("Connecting to {}", address);
        self.connection = Some(Connection {
            id,
            stream,
            connected: false,
            outgoing: std::vec::Vec::new(),
            framer: Framer::new(max_message_size),
        });
    }

    fn close(&mut self) {
        if let Some(mut connection) = self.connection.take() {
            let _ = self.poll.registry().deregister(&mut connection.stream);
            let _ = connection.stream.shutdown(std::net::Shutdown::Both);
        }
    }

    /// Drop the connection after an I/O failure and tell the client.
    fn lost(&mut self, e: io::Error) {
        if let Some(connection) = self.connection.as_ref() {
            let id = connection.id;
            match e.kind() {
                io::ErrorKind::UnexpectedEof => info!("Connection closed by broker"),
                _ => info!("Connection lost"),
            }
            self.close();
            self.events.post_from(id, Event::ConnectionStatus(false));
        }
    }

    fn ready(&mut self, readable: bool, writable: bool) {
        let Some(connection) = self.connection.as_mut() else {
            return;
        };
        let mut result = Ok(());
        if !connection.connected {
            result = connection.finish_connect(&self.events);
        }
        if result.is_ok() && connection.connected {
            if readable {
                result = connection.receive(&self.events);
            }
            if result.is_ok() && writable {
                result = connection.transmit(&self.events);
            }
        }
        if let Err(e) = result {
            self.lost(e);
        }
    }
}

fn resolve(address: &str) -> io::Result<SocketAddr> {
    address
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "could not resolve address"))
}

struct Connection {
    id: u64,
    stream: TcpStream,
    connected: bool,
    /// Bytes the socket has not accepted yet.
    outgoing: std::vec::Vec<u8>,
    framer: Framer,
}

impl Connection {
    /// Check whether a pending non-blocking connect has completed.
    fn finish_connect(&mut self, events: &EventSender) -> io::Result<()> {
        if let Some(e) = self.stream.take_error()? {
            return Err(e);
        }
        match self.stream.peer_addr() {
            Ok(_) => {}
            // Still in progress.
            Err(e) if e.kind() == io::ErrorKind::NotConnected => return Ok(()),
            Err(e) => return Err(e),
        }
        self.stream.set_nodelay(true)?;
        self.connected = true;
        info!("TCP connection established");
        events.post_from(self.id, Event::ConnectionStatus(true));
        self.transmit(events)
    }

    /// Frame everything readable and post the completed packets.
    fn receive(&mut self, events: &EventSender) -> io::Result<()> {
        loop {
            match self.framer.read_from(&mut SocketReader(&mut self.stream)) {
                Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
            if self.framer.is_error() {
                // No way to find the next packet boundary.
                error!("Malformed packet header, dropping connection");
                return Err(io::ErrorKind::InvalidData.into());
            }
            if self.framer.is_complete() {
                events.post_from(self.id, Event::PacketReceived(self.framer.take_packet()));
            }
        }
    }

    /// Write as much of the buffer as the socket takes.
    fn transmit(&mut self, events: &EventSender) -> io::Result<()> {
        if !self.connected || self.outgoing.is_empty() {
            return Ok(());
        }
        while !self.outgoing.is_empty() {
            match io::Write::write(&mut self.stream, &self.outgoing) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    self.outgoing.drain(..n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        events.post_from(self.id, Event::TransmitBufferEmpty);
        Ok(())
    }
}

struct SocketReader<'a>(&'a mut TcpStream);

impl Read for SocketReader<'_> {
    type Error = io::Error;

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        io::Read::read(&mut *self.0, buf)
    }
}
