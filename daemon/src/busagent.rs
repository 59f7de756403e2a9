//! Local IPC bus agent. The daemon registers a `provisioning-daemon`
//! object with three methods (`getState`, `select`, `startProvision`) and
//! invokes `creator.generatePsk` on the trust service. The bus transport
//! is a unix-domain socket carrying one JSON message per line; replies
//! are matched to invocations by id.

use crate::controls::Controls;
use crate::credential::{BusError, PskReply, PskService};
use crate::events::{Event, EventBus};
use crate::history::History;
use crate::registry::Registry;
use flint::logging;
use flint::time;
use flint::ClickerId;
use hashbrown::HashMap;
use serde_derive::{Deserialize, Serialize};
use serde_json::Value;
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;

pub const OBJECT_NAME: &str = "provisioning-daemon";

const TRUST_OBJECT: &str = "creator";
const GENERATE_PSK_METHOD: &str = "generatePsk";
const INVOKE_TIMEOUT: Duration = Duration::from_secs(10);
const READ_POLL: Duration = Duration::from_millis(500);

/// One bus message. Invocations carry `object`/`method`/`params`,
/// replies carry `result` or `error` under the invocation's id.
#[derive(Debug, Serialize, Deserialize)]
struct BusMessage {
    id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    object: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl BusMessage {
    fn reply(id: u64, outcome: Result<Value, String>) -> BusMessage {
        let (result, error) = match outcome {
            Ok(result) => (Some(result), None),
            Err(error) => (None, Some(error)),
        };
        BusMessage {
            id,
            object: None,
            method: None,
            params: None,
            result,
            error,
        }
    }
}

#[derive(Debug, Deserialize)]
struct GeneratePskResponse {
    #[serde(rename = "pskIdentity", default)]
    psk_identity: Option<String>,
    #[serde(rename = "pskSecret", default)]
    psk_secret: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// One row of the `getState` reply.
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct ClickerState {
    pub id: ClickerId,
    pub name: String,
    pub selected: bool,
    #[serde(rename = "inProvisionState")]
    pub in_provision_state: bool,
    #[serde(rename = "isProvisioned")]
    pub is_provisioned: bool,
    #[serde(rename = "isError")]
    pub is_error: bool,
}

/// The daemon state the served methods read and poke.
pub struct StateHandles {
    pub registry: Arc<Registry>,
    pub controls: Arc<Controls>,
    pub history: Arc<History>,
    pub bus: Arc<EventBus>,
}

pub struct BusAgent {
    writer: Mutex<UnixStream>,
    reader: Mutex<Option<UnixStream>>,
    pending: Mutex<HashMap<u64, mpsc::Sender<Result<Value, BusError>>>>,
    seq: AtomicU64,
    remote_control: AtomicBool,
    log: logging::Logger,
}

impl BusAgent {
    /// Connects to the bus socket. Failure here is fatal to the daemon.
    pub fn connect(path: &str, log: &logging::Logger) -> Result<BusAgent, BusError> {
        let stream = UnixStream::connect(path).map_err(|_| BusError::Unavailable)?;
        BusAgent::from_stream(stream, log)
    }

    /// Wraps an already-connected stream. Used directly by tests.
    pub fn from_stream(stream: UnixStream, log: &logging::Logger) -> Result<BusAgent, BusError> {
        stream.set_read_timeout(Some(READ_POLL))?;
        let writer = stream.try_clone()?;

        Ok(BusAgent {
            writer: Mutex::new(writer),
            reader: Mutex::new(Some(stream)),
            pending: Mutex::new(HashMap::new()),
            seq: AtomicU64::new(0),
            remote_control: AtomicBool::new(false),
            log: log.new(logging::o!()),
        })
    }

    /// Opens the served object for `select`/`startProvision`. Without
    /// this only `getState` answers.
    pub fn enable_remote_control(&self) {
        logging::info!(self.log, "enabling provision control through the bus");
        self.remote_control.store(true, Ordering::Relaxed);
    }

    pub fn remote_control_enabled(&self) -> bool {
        self.remote_control.load(Ordering::Relaxed)
    }

    fn next_id(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn write_message(&self, message: &BusMessage) -> Result<(), BusError> {
        let mut line =
            serde_json::to_string(message).map_err(|err| BusError::Protocol(err.to_string()))?;
        line.push('\n');

        let mut writer = self.writer.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        writer.write_all(line.as_bytes())?;
        Ok(())
    }

    fn handle_line(&self, line: &str, handles: &StateHandles) {
        if line.is_empty() {
            return;
        }

        let message: BusMessage = match serde_json::from_str(line) {
            Ok(message) => message,
            Err(err) => {
                logging::warn!(self.log, "unparseable bus message"; "error" => %err);
                return;
            }
        };

        if message.method.is_some() {
            self.handle_invocation(message, handles);
        } else {
            self.route_reply(message);
        }
    }

    fn route_reply(&self, message: BusMessage) {
        let waiter = {
            let mut pending =
                self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            pending.remove(&message.id)
        };

        match waiter {
            Some(waiter) => {
                let outcome = match message.error {
                    Some(error) => Err(BusError::Protocol(error)),
                    None => Ok(message.result.unwrap_or(Value::Null)),
                };
                drop(waiter.send(outcome));
            }
            None => {
                logging::debug!(self.log, "bus reply with no waiter"; "id" => message.id);
            }
        }
    }

    fn handle_invocation(&self, message: BusMessage, handles: &StateHandles) {
        let method = message.method.as_deref().unwrap_or("");
        logging::debug!(self.log, "bus invocation"; "method" => method);

        if message.object.as_deref() != Some(OBJECT_NAME) {
            let object = message.object.unwrap_or_default();
            drop(self.write_message(&BusMessage::reply(
                message.id,
                Err(format!("unknown object {}", object)),
            )));
            return;
        }

        let outcome = match method {
            "getState" => Ok(serde_json::json!({ "clickers": state_snapshot(handles) })),
            "select" => self.handle_select(&message, handles),
            "startProvision" => self.handle_start_provision(handles),
            _ => Err(format!("unknown method {}", method)),
        };

        if let Err(err) = self.write_message(&BusMessage::reply(message.id, outcome)) {
            logging::warn!(self.log, "cannot send bus reply"; "error" => %err);
        }
    }

    fn handle_select(&self, message: &BusMessage, handles: &StateHandles) -> Result<Value, String> {
        if !self.remote_control_enabled() {
            return Err("remote control is disabled".to_string());
        }

        let id = message
            .params
            .as_ref()
            .and_then(|params| params.get("clickerID"))
            .and_then(Value::as_u64)
            .ok_or_else(|| "missing clickerID".to_string())? as ClickerId;

        if !handles.controls.ids().contains(&id) {
            return Err(format!("no clicker with id {}", id));
        }

        handles.bus.push(Event::ClickerSelect(id));
        Ok(Value::Null)
    }

    fn handle_start_provision(&self, handles: &StateHandles) -> Result<Value, String> {
        if !self.remote_control_enabled() {
            return Err("remote control is disabled".to_string());
        }

        if handles.controls.start_provision(&handles.bus) {
            Ok(Value::Null)
        } else {
            Err("no clicker is selected".to_string())
        }
    }
}

impl PskService for BusAgent {
    /// Blocking invocation of `creator.generatePsk` with a 10 s deadline.
    /// Runs on the credential worker, never on the main loop.
    fn generate_psk(&self, clicker: ClickerId) -> Result<PskReply, BusError> {
        let id = self.next_id();
        let (tx, rx) = mpsc::channel();
        {
            let mut pending =
                self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            pending.insert(id, tx);
        }

        let message = BusMessage {
            id,
            object: Some(TRUST_OBJECT.to_string()),
            method: Some(GENERATE_PSK_METHOD.to_string()),
            params: Some(serde_json::json!({ "id": clicker })),
            result: None,
            error: None,
        };

        if let Err(err) = self.write_message(&message) {
            let mut pending =
                self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            pending.remove(&id);
            return Err(err);
        }

        let outcome = match rx.recv_timeout(INVOKE_TIMEOUT) {
            Ok(outcome) => outcome,
            Err(_) => {
                let mut pending =
                    self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                pending.remove(&id);
                return Err(BusError::Timeout);
            }
        };

        let response: GeneratePskResponse = serde_json::from_value(outcome?)
            .map_err(|err| BusError::Protocol(err.to_string()))?;

        if let Some(error) = response.error {
            return Err(BusError::Protocol(error));
        }

        let psk = match response.psk_secret {
            Some(psk) => psk,
            None => return Err(BusError::Protocol("unknown psk".to_string())),
        };

        Ok(PskReply {
            psk,
            identity: response.psk_identity.unwrap_or_default(),
        })
    }
}

/// Starts the reader thread serving invocations and routing replies.
pub fn start(
    agent: Arc<BusAgent>,
    handles: StateHandles,
    shutdown: Arc<AtomicBool>,
) -> Result<thread::JoinHandle<()>, BusError> {
    let stream = {
        let mut reader = agent.reader.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        reader
            .take()
            .ok_or_else(|| BusError::Protocol("bus reader already started".to_string()))?
    };

    let handle = thread::spawn(move || {
        let log = agent.log.new(logging::o!());
        logging::info!(log, "bus thread started");

        let mut reader = BufReader::new(stream);
        let mut line = String::new();

        loop {
            if shutdown.load(Ordering::Relaxed) {
                break;
            }

            match reader.read_line(&mut line) {
                Ok(0) => {
                    logging::crit!(log, "bus connection closed");
                    break;
                }
                Ok(_) => {
                    // A poll timeout can split a line; only a complete
                    // one is parsed.
                    if line.ends_with('\n') {
                        agent.handle_line(line.trim(), &handles);
                        line.clear();
                    }
                }
                Err(ref err)
                    if err.kind() == std::io::ErrorKind::WouldBlock
                        || err.kind() == std::io::ErrorKind::TimedOut =>
                {
                    continue;
                }
                Err(err) => {
                    logging::crit!(log, "bus read failed"; "error" => ?err);
                    break;
                }
            }
        }

        logging::info!(log, "bus thread finished");
    });

    Ok(handle)
}

/// The `getState` rows: history entries first (already provisioned),
/// then the live clickers that are not in the history.
pub fn state_snapshot(handles: &StateHandles) -> Vec<ClickerState> {
    let now_ms = time::monotonic_ms();
    let history = handles.history.get_all(now_ms);
    let selected = handles.controls.selected_id();

    let mut states = Vec::new();

    for entry in &history {
        states.push(ClickerState {
            id: entry.id,
            name: entry.name.clone(),
            selected: false,
            in_provision_state: false,
            is_provisioned: true,
            is_error: entry.errored,
        });
    }

    for id in handles.registry.ids() {
        if history.iter().any(|entry| entry.id == id) {
            continue;
        }
        if let Some(clicker) = handles.registry.acquire(id) {
            states.push(ClickerState {
                id,
                name: clicker.name.clone(),
                selected: selected == Some(id),
                in_provision_state: clicker.provisioning,
                is_provisioned: false,
                is_error: clicker.has_fault(),
            });
        }
    }

    states
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controls::NullLeds;
    use flint::logging;

    fn handles() -> StateHandles {
        let log = logging::discard();
        StateHandles {
            registry: Arc::new(Registry::new(&log)),
            controls: Arc::new(Controls::new(Box::new(NullLeds), &log)),
            history: Arc::new(History::new(&log)),
            bus: Arc::new(EventBus::new(&log)),
        }
    }

    fn read_reply(reader: &mut BufReader<UnixStream>) -> BusMessage {
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        serde_json::from_str(&line).unwrap()
    }

    #[test]
    fn test_message_roundtrip() {
        let message = BusMessage {
            id: 3,
            object: Some("creator".to_string()),
            method: Some("generatePsk".to_string()),
            params: Some(serde_json::json!({ "id": 9 })),
            result: None,
            error: None,
        };

        let line = serde_json::to_string(&message).unwrap();
        let parsed: BusMessage = serde_json::from_str(&line).unwrap();

        assert_eq!(parsed.id, 3);
        assert_eq!(parsed.object.as_deref(), Some("creator"));
        assert_eq!(parsed.method.as_deref(), Some("generatePsk"));
        assert!(parsed.result.is_none());
        // None fields stay off the wire entirely.
        assert!(!line.contains("result"));
        assert!(!line.contains("error"));
    }

    #[test]
    fn test_state_snapshot_merges_history_and_live() {
        let handles = handles();

        handles.history.add(1, "old".to_string(), false, time::monotonic_ms());
        handles.registry.create(2);
        handles.registry.acquire(2).unwrap().name = "live".to_string();
        handles
            .controls
            .consume_event(&Event::ClickerCreate(2), &handles.bus);

        let states = state_snapshot(&handles);

        assert_eq!(states.len(), 2);
        assert_eq!(states[0].id, 1);
        assert!(states[0].is_provisioned);
        assert!(!states[0].selected);
        assert_eq!(states[1].id, 2);
        assert!(!states[1].is_provisioned);
        assert!(states[1].selected);
        assert_eq!(states[1].name, "live");
    }

    #[test]
    fn test_state_snapshot_skips_live_clickers_already_in_history() {
        let handles = handles();

        handles.registry.create(5);
        handles.history.add(5, "done".to_string(), false, time::monotonic_ms());

        let states = state_snapshot(&handles);

        assert_eq!(states.len(), 1);
        assert!(states[0].is_provisioned);
    }

    #[test]
    fn test_generate_psk_roundtrip() {
        let (ours, mut theirs) = UnixStream::pair().unwrap();
        let agent = Arc::new(BusAgent::from_stream(ours, &logging::discard()).unwrap());
        let shutdown = Arc::new(AtomicBool::new(false));
        let reader = start(Arc::clone(&agent), handles(), Arc::clone(&shutdown)).unwrap();

        // The trust service side answers the invocation.
        let service = thread::spawn(move || {
            let mut reader = BufReader::new(theirs.try_clone().unwrap());
            let mut line = String::new();
            reader.read_line(&mut line).unwrap();
            let request: BusMessage = serde_json::from_str(&line).unwrap();

            assert_eq!(request.object.as_deref(), Some("creator"));
            assert_eq!(request.method.as_deref(), Some("generatePsk"));
            assert_eq!(request.params.unwrap()["id"], 7);

            let reply = serde_json::json!({
                "id": request.id,
                "result": { "id": 7, "pskIdentity": "ep7", "pskSecret": "00ff" }
            });
            theirs
                .write_all(format!("{}\n", reply).as_bytes())
                .unwrap();
        });

        let reply = agent.generate_psk(7).unwrap();
        assert_eq!(reply.psk, "00ff");
        assert_eq!(reply.identity, "ep7");

        service.join().unwrap();
        shutdown.store(true, Ordering::Relaxed);
        reader.join().unwrap();
    }

    #[test]
    fn test_generate_psk_error_reply() {
        let (ours, mut theirs) = UnixStream::pair().unwrap();
        let agent = Arc::new(BusAgent::from_stream(ours, &logging::discard()).unwrap());
        let shutdown = Arc::new(AtomicBool::new(false));
        let reader = start(Arc::clone(&agent), handles(), Arc::clone(&shutdown)).unwrap();

        let service = thread::spawn(move || {
            let mut reader = BufReader::new(theirs.try_clone().unwrap());
            let mut line = String::new();
            reader.read_line(&mut line).unwrap();
            let request: BusMessage = serde_json::from_str(&line).unwrap();

            let reply = serde_json::json!({
                "id": request.id,
                "result": { "id": 7, "error": "no device server" }
            });
            theirs
                .write_all(format!("{}\n", reply).as_bytes())
                .unwrap();
        });

        match agent.generate_psk(7) {
            Err(BusError::Protocol(reason)) => assert_eq!(reason, "no device server"),
            other => panic!("Unexpected outcome {:?}", other),
        }

        service.join().unwrap();
        shutdown.store(true, Ordering::Relaxed);
        reader.join().unwrap();
    }

    #[test]
    fn test_select_requires_remote_control() {
        let (ours, mut theirs) = UnixStream::pair().unwrap();
        let agent = Arc::new(BusAgent::from_stream(ours, &logging::discard()).unwrap());
        let shutdown = Arc::new(AtomicBool::new(false));
        let handles = handles();
        let bus = Arc::clone(&handles.bus);
        let controls = Arc::clone(&handles.controls);
        controls.consume_event(&Event::ClickerCreate(3), &bus);

        let reader = start(Arc::clone(&agent), handles, Arc::clone(&shutdown)).unwrap();

        let invocation = serde_json::json!({
            "id": 50,
            "object": OBJECT_NAME,
            "method": "select",
            "params": { "clickerID": 3 }
        });

        let mut replies = BufReader::new(theirs.try_clone().unwrap());

        // Disabled: the call is refused.
        theirs
            .write_all(format!("{}\n", invocation).as_bytes())
            .unwrap();
        let reply = read_reply(&mut replies);
        assert_eq!(reply.id, 50);
        assert!(reply.error.is_some());

        // Enabled: the selection event is posted.
        agent.enable_remote_control();
        theirs
            .write_all(format!("{}\n", invocation).as_bytes())
            .unwrap();
        let reply = read_reply(&mut replies);
        assert!(reply.error.is_none());

        // Drop the highlight broadcast from the create, keep the select.
        let mut saw_select = false;
        while let Some(event) = bus.pop() {
            if let Event::ClickerSelect(id) = event {
                assert_eq!(id, 3);
                saw_select = true;
            }
        }
        assert!(saw_select);

        shutdown.store(true, Ordering::Relaxed);
        reader.join().unwrap();
    }

    #[test]
    fn test_get_state_invocation() {
        let (ours, mut theirs) = UnixStream::pair().unwrap();
        let agent = Arc::new(BusAgent::from_stream(ours, &logging::discard()).unwrap());
        let shutdown = Arc::new(AtomicBool::new(false));
        let handles = handles();
        handles.registry.create(1);
        handles.registry.acquire(1).unwrap().name = "cd_1".to_string();
        handles
            .controls
            .consume_event(&Event::ClickerCreate(1), &handles.bus);

        let reader = start(Arc::clone(&agent), handles, Arc::clone(&shutdown)).unwrap();

        let invocation = serde_json::json!({
            "id": 51,
            "object": OBJECT_NAME,
            "method": "getState"
        });
        let mut replies = BufReader::new(theirs.try_clone().unwrap());
        theirs
            .write_all(format!("{}\n", invocation).as_bytes())
            .unwrap();

        let reply = read_reply(&mut replies);
        let clickers = &reply.result.unwrap()["clickers"];
        assert_eq!(clickers[0]["id"], 1);
        assert_eq!(clickers[0]["name"], "cd_1");
        assert_eq!(clickers[0]["selected"], true);
        assert_eq!(clickers[0]["isProvisioned"], false);

        shutdown.store(true, Ordering::Relaxed);
        reader.join().unwrap();
    }

    #[test]
    fn test_unknown_method_is_refused() {
        let (ours, mut theirs) = UnixStream::pair().unwrap();
        let agent = Arc::new(BusAgent::from_stream(ours, &logging::discard()).unwrap());
        let shutdown = Arc::new(AtomicBool::new(false));
        let reader = start(Arc::clone(&agent), handles(), Arc::clone(&shutdown)).unwrap();

        let mut replies = BufReader::new(theirs.try_clone().unwrap());
        theirs
            .write_all(b"{\"id\":60,\"object\":\"provisioning-daemon\",\"method\":\"reboot\"}\n")
            .unwrap();

        let reply = read_reply(&mut replies);
        assert_eq!(reply.id, 60);
        assert!(reply.error.unwrap().contains("unknown method"));

        shutdown.store(true, Ordering::Relaxed);
        reader.join().unwrap();
    }
}
