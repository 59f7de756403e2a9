//! TCP hub for clicker connections: accept, framed reads, send fan-out
//! from the event bus, keepalive bookkeeping. A single readiness poll
//! multiplexes the listener and every connection; the main loop calls
//! `process_once` each tick.

use crate::events::{Event, EventBus};
use crate::net::frame::{self, Command, Packet};
use crate::net::{NetError, NetResult};
use flint::logging;
use flint::ClickerId;
use hashbrown::HashMap;
use indexmap::IndexMap;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use std::io::{self, Read, Write};
use std::net::{Ipv6Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const LISTENER: Token = Token(0);
const POLL_TIMEOUT: Duration = Duration::from_millis(2);
const READ_BUF_SIZE: usize = 1024;

const KEEPALIVE_INTERVAL_MS: u64 = 2000;
const CHECK_CONNECTIONS_INTERVAL_MS: u64 = 2000;
const KEEPALIVE_TIMEOUT_MS: u64 = 30_000;

/// Peer address of a live connection, visible to other components.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Peer {
    pub ip: String,
    pub port: u16,
}

/// Shared id -> peer map. The endpoint writes it on accept/disconnect;
/// the session layer reads it for name generation. Never held across a
/// send.
pub type PeerDirectory = Arc<Mutex<HashMap<ClickerId, Peer>>>;

struct Connection {
    stream: TcpStream,
    last_keepalive_ms: u64,
}

pub struct Endpoint {
    listener: TcpListener,
    poll: Poll,
    events: Events,
    connections: IndexMap<ClickerId, Connection>,
    peers: PeerDirectory,
    bus: Arc<EventBus>,
    next_id: ClickerId,
    last_keepalive_send_ms: u64,
    last_check_ms: u64,
    log: logging::Logger,
}

impl Endpoint {
    /// Binds the IPv6 listening socket and registers it on the poll.
    pub fn bind(port: u16, bus: Arc<EventBus>, log: &logging::Logger) -> NetResult<Endpoint> {
        let addr = SocketAddr::from((Ipv6Addr::UNSPECIFIED, port));
        let mut listener = TcpListener::bind(addr).map_err(|err| NetError::Bind(err.kind()))?;

        let poll = Poll::new()?;
        poll.registry().register(&mut listener, LISTENER, Interest::READABLE)?;

        Ok(Endpoint {
            listener,
            poll,
            events: Events::with_capacity(128),
            connections: IndexMap::new(),
            peers: Arc::new(Mutex::new(HashMap::new())),
            bus,
            next_id: 0,
            last_keepalive_send_ms: 0,
            last_check_ms: 0,
            log: log.new(logging::o!()),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn peers(&self) -> PeerDirectory {
        Arc::clone(&self.peers)
    }

    pub fn count(&self) -> usize {
        self.connections.len()
    }

    /// One tick: waits up to 2 ms for readiness, accepts and reads, then
    /// runs the keepalive and timeout sweeps.
    pub fn process_once(&mut self, now_ms: u64) {
        if let Err(err) = self.poll.poll(&mut self.events, Some(POLL_TIMEOUT)) {
            if err.kind() != io::ErrorKind::Interrupted {
                logging::crit!(self.log, "readiness poll failed"; "error" => ?err);
            }
            return;
        }

        let ready: Vec<Token> = self.events.iter().map(|event| event.token()).collect();

        for token in ready {
            if token == LISTENER {
                self.accept_pending(now_ms);
            } else {
                self.drain_reads(token.0 as ClickerId, now_ms);
            }
        }

        self.send_keepalives(now_ms);
        self.check_connections(now_ms);
    }

    /// Accepts everything waiting on the listener. The edge-triggered
    /// poll reports the backlog once, so it must be drained here.
    fn accept_pending(&mut self, now_ms: u64) {
        loop {
            match self.listener.accept() {
                Ok((mut stream, addr)) => {
                    self.next_id += 1;
                    let id = self.next_id;

                    if let Err(err) =
                        self.poll
                            .registry()
                            .register(&mut stream, Token(id as usize), Interest::READABLE)
                    {
                        logging::crit!(self.log, "connection registration failed";
                                       "clicker_id" => id,
                                       "error" => ?err);
                        continue;
                    }

                    let peer = Peer {
                        ip: addr.ip().to_string(),
                        port: addr.port(),
                    };

                    logging::info!(self.log, "clicker connected";
                                   "clicker_id" => id,
                                   "ip" => %peer.ip,
                                   "port" => peer.port);

                    self.peers
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .insert(id, peer);
                    self.connections.insert(
                        id,
                        Connection {
                            stream,
                            last_keepalive_ms: now_ms,
                        },
                    );

                    self.bus.push(Event::ClickerCreate(id));
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    logging::crit!(self.log, "error accepting connection"; "error" => ?err);
                    break;
                }
            }
        }
    }

    /// Reads a connection until it would block. Each successful read is
    /// treated as one frame.
    fn drain_reads(&mut self, id: ClickerId, now_ms: u64) {
        let mut buf = [0u8; READ_BUF_SIZE];

        loop {
            let result = match self.connections.get_mut(&id) {
                Some(connection) => connection.stream.read(&mut buf),
                None => return,
            };

            match result {
                Ok(0) => {
                    self.disconnect_inner(id, "zero length read");
                    return;
                }
                Ok(count) => self.handle_frame(id, &buf[..count], now_ms),
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    logging::debug!(self.log, "read error";
                                    "clicker_id" => id,
                                    "error" => ?err);
                    self.disconnect_inner(id, "read error");
                    return;
                }
            }
        }
    }

    fn handle_frame(&mut self, id: ClickerId, bytes: &[u8], now_ms: u64) {
        if bytes[0] == Command::KeepAlive.byte() {
            if let Some(connection) = self.connections.get_mut(&id) {
                connection.last_keepalive_ms = now_ms;
            }
            return;
        }

        match frame::parse(id, bytes) {
            Ok(packet) => self.bus.push(Event::ReceivedCommand(packet)),
            Err(err) => {
                logging::debug!(self.log, "dropping malformed frame";
                                "clicker_id" => id,
                                "error" => ?err);
            }
        }
    }

    /// Closes the connection and announces the departure.
    pub fn disconnect(&mut self, id: ClickerId) {
        self.disconnect_inner(id, "requested");
    }

    fn disconnect_inner(&mut self, id: ClickerId, reason: &str) {
        if let Some(mut connection) = self.connections.shift_remove(&id) {
            drop(self.poll.registry().deregister(&mut connection.stream));
            self.peers
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .remove(&id);

            logging::info!(self.log, "clicker disconnected";
                           "clicker_id" => id,
                           "reason" => reason);

            self.bus.push(Event::ClickerDestroy(id));
        }
    }

    fn send_keepalives(&mut self, now_ms: u64) {
        if now_ms.saturating_sub(self.last_keepalive_send_ms) <= KEEPALIVE_INTERVAL_MS {
            return;
        }
        self.last_keepalive_send_ms = now_ms;

        let keepalive = [Command::KeepAlive.byte()];
        for (id, connection) in self.connections.iter_mut() {
            if let Err(err) = connection.stream.write(&keepalive) {
                logging::warn!(self.log, "keepalive send failed";
                               "clicker_id" => *id,
                               "error" => ?err);
            }
        }
    }

    fn check_connections(&mut self, now_ms: u64) {
        if now_ms.saturating_sub(self.last_check_ms) <= CHECK_CONNECTIONS_INTERVAL_MS {
            return;
        }
        self.last_check_ms = now_ms;

        let stale: Vec<ClickerId> = self
            .connections
            .iter()
            .filter(|(_, connection)| {
                now_ms.saturating_sub(connection.last_keepalive_ms) > KEEPALIVE_TIMEOUT_MS
            })
            .map(|(id, _)| *id)
            .collect();

        for id in stale {
            self.disconnect_inner(id, "keepalive timeout");
        }
    }

    pub fn consume_event(&mut self, event: &Event) {
        if let Event::SendCommand(packet) = event {
            self.send_packet(packet);
        }
    }

    fn send_packet(&mut self, packet: &Packet) {
        if packet.command.carries_data() && packet.data.is_empty() {
            logging::warn!(self.log, "tried to send a data command with no data";
                           "clicker_id" => packet.clicker,
                           "command" => packet.command.byte());
            return;
        }

        let connection = match self.connections.get_mut(&packet.clicker) {
            Some(connection) => connection,
            None => {
                logging::crit!(self.log, "cannot send, connection not found";
                               "clicker_id" => packet.clicker,
                               "command" => packet.command.byte());
                return;
            }
        };

        let bytes = match frame::encode(packet) {
            Ok(bytes) => bytes,
            Err(err) => {
                logging::error!(self.log, "refusing to send frame";
                                "clicker_id" => packet.clicker,
                                "command" => packet.command.byte(),
                                "size" => packet.data.len(),
                                "error" => ?err);
                return;
            }
        };

        // Send errors are logged only; a dead connection is caught by the
        // next keepalive sweep.
        match connection.stream.write(&bytes) {
            Ok(count) if count < bytes.len() => {
                logging::warn!(self.log, "short write";
                               "clicker_id" => packet.clicker,
                               "written" => count,
                               "size" => bytes.len());
            }
            Ok(_) => {}
            Err(err) => {
                logging::warn!(self.log, "send failed";
                               "clicker_id" => packet.clicker,
                               "error" => ?err);
            }
        }
    }
}
