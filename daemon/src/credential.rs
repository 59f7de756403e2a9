//! PSK credential client. The round trip to the trust service can take
//! seconds, so requests run on a dedicated worker thread; the answer
//! comes back as a `PSK_OBTAINED` event and no clicker work happens on
//! the worker itself.

use crate::events::{Event, EventBus};
use flint::logging;
use flint::ClickerId;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const SHUTDOWN_POLL: Duration = Duration::from_millis(250);

#[derive(Debug)]
pub enum BusError {
    /// The bus socket could not be reached.
    Unavailable,
    /// No reply within the invocation deadline.
    Timeout,
    /// The remote side reported an error or sent something unparseable.
    Protocol(String),
    Io(io::ErrorKind),
}

impl fmt::Display for BusError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BusError::Unavailable => write!(f, "bus unavailable"),
            BusError::Timeout => write!(f, "bus invocation timed out"),
            BusError::Protocol(reason) => write!(f, "bus protocol error: {}", reason),
            BusError::Io(kind) => write!(f, "bus io error: {:?}", kind),
        }
    }
}

impl From<io::Error> for BusError {
    fn from(err: io::Error) -> Self {
        BusError::Io(err.kind())
    }
}

/// A successful credential from the trust service: the PSK as a hex
/// string plus the identity it is registered under.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct PskReply {
    pub psk: String,
    pub identity: String,
}

/// Outcome delivered on the event bus. `psk == None` covers both a
/// service-side error and a timed-out request.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct PskResult {
    pub clicker: ClickerId,
    pub psk: Option<String>,
    pub identity: Option<String>,
}

/// The trust-service operation the daemon consumes. The production
/// implementation lives on the IPC bus agent; tests substitute mocks.
pub trait PskService: Send + Sync {
    fn generate_psk(&self, clicker: ClickerId) -> Result<PskReply, BusError>;
}

/// Cheap handle for firing PSK requests at the worker.
#[derive(Clone)]
pub struct CredentialClient {
    tx: mpsc::Sender<ClickerId>,
    log: logging::Logger,
}

impl CredentialClient {
    /// Queues a PSK request. Returns immediately; the outcome arrives as
    /// a `PSK_OBTAINED` event.
    pub fn request_psk(&self, clicker: ClickerId) {
        if self.tx.send(clicker).is_err() {
            logging::error!(self.log, "credential worker is gone, dropping psk request";
                            "clicker_id" => clicker);
        }
    }
}

/// Client wired to a bare channel, with the receiving end handed back so
/// a test can observe and answer requests itself.
#[cfg(test)]
pub fn test_client() -> (CredentialClient, mpsc::Receiver<ClickerId>) {
    let (tx, rx) = mpsc::channel();
    (
        CredentialClient {
            tx,
            log: logging::discard(),
        },
        rx,
    )
}

pub struct CredentialWorker {
    handle: thread::JoinHandle<()>,
}

impl CredentialWorker {
    pub fn join(self) {
        drop(self.handle.join());
    }
}

/// Starts the worker thread. It drains requests until the shutdown flag
/// is raised or every client handle is dropped.
pub fn spawn(
    service: Arc<dyn PskService>,
    bus: Arc<EventBus>,
    shutdown: Arc<AtomicBool>,
    log: &logging::Logger,
) -> (CredentialClient, CredentialWorker) {
    let (tx, rx) = mpsc::channel::<ClickerId>();
    let worker_log = log.new(logging::o!());
    let client_log = log.new(logging::o!());

    let handle = thread::spawn(move || {
        logging::info!(worker_log, "credential worker started");

        loop {
            let clicker = match rx.recv_timeout(SHUTDOWN_POLL) {
                Ok(clicker) => clicker,
                Err(RecvTimeoutError::Timeout) => {
                    if shutdown.load(Ordering::Relaxed) {
                        break;
                    }
                    continue;
                }
                Err(RecvTimeoutError::Disconnected) => break,
            };

            let result = match service.generate_psk(clicker) {
                Ok(reply) => {
                    logging::info!(worker_log, "psk obtained"; "clicker_id" => clicker);
                    PskResult {
                        clicker,
                        psk: Some(reply.psk),
                        identity: Some(reply.identity),
                    }
                }
                Err(err) => {
                    logging::warn!(worker_log, "psk generation failed";
                                   "clicker_id" => clicker,
                                   "error" => %err);
                    PskResult {
                        clicker,
                        psk: None,
                        identity: None,
                    }
                }
            };

            bus.push(Event::PskObtained(result));
        }

        logging::info!(worker_log, "credential worker finished");
    });

    (
        CredentialClient {
            tx,
            log: client_log,
        },
        CredentialWorker { handle },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use flint::logging;
    use std::time::Instant;

    struct FixedService {
        reply: Result<PskReply, ()>,
    }

    impl PskService for FixedService {
        fn generate_psk(&self, _clicker: ClickerId) -> Result<PskReply, BusError> {
            match &self.reply {
                Ok(reply) => Ok(reply.clone()),
                Err(_) => Err(BusError::Timeout),
            }
        }
    }

    fn wait_for_event(bus: &EventBus) -> Event {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(event) = bus.pop() {
                return event;
            }
            if Instant::now() > deadline {
                panic!("No event arrived");
            }
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_successful_reply_becomes_psk_obtained() {
        let bus = Arc::new(EventBus::new(&logging::discard()));
        let shutdown = Arc::new(AtomicBool::new(false));
        let service = Arc::new(FixedService {
            reply: Ok(PskReply {
                psk: "00112233".to_string(),
                identity: "ep1".to_string(),
            }),
        });

        let (client, worker) =
            spawn(service, Arc::clone(&bus), Arc::clone(&shutdown), &logging::discard());

        client.request_psk(7);

        match wait_for_event(&bus) {
            Event::PskObtained(result) => {
                assert_eq!(result.clicker, 7);
                assert_eq!(result.psk.as_deref(), Some("00112233"));
                assert_eq!(result.identity.as_deref(), Some("ep1"));
            }
            other => panic!("Unexpected event {:?}", other),
        }

        shutdown.store(true, Ordering::Relaxed);
        drop(client);
        worker.join();
    }

    #[test]
    fn test_service_error_becomes_null_psk() {
        let bus = Arc::new(EventBus::new(&logging::discard()));
        let shutdown = Arc::new(AtomicBool::new(false));
        let service = Arc::new(FixedService { reply: Err(()) });

        let (client, worker) =
            spawn(service, Arc::clone(&bus), Arc::clone(&shutdown), &logging::discard());

        client.request_psk(3);

        match wait_for_event(&bus) {
            Event::PskObtained(result) => {
                assert_eq!(result.clicker, 3);
                assert_eq!(result.psk, None);
                assert_eq!(result.identity, None);
            }
            other => panic!("Unexpected event {:?}", other),
        }

        drop(client);
        worker.join();
    }

    #[test]
    fn test_worker_exits_on_shutdown_flag() {
        let bus = Arc::new(EventBus::new(&logging::discard()));
        let shutdown = Arc::new(AtomicBool::new(true));
        let service = Arc::new(FixedService { reply: Err(()) });

        let (client, worker) = spawn(service, bus, shutdown, &logging::discard());

        // The worker notices the flag on its next poll and joins cleanly.
        worker.join();
        drop(client);
    }
}
