//! Thread-safe FIFO event bus. All cross-component communication inside
//! the daemon is an event; consumers stay pure and never block on IPC.

use crate::credential::PskResult;
use crate::net::frame::Packet;
use flint::logging;
use flint::ClickerId;
use std::collections::VecDeque;
use std::sync::Mutex;

/// A single bus event. Variants own their payloads; dropping the event
/// releases them.
#[derive(Debug)]
pub enum Event {
    /// A clicker connected and was assigned an id.
    ClickerCreate(ClickerId),
    /// A clicker connection went away.
    ClickerDestroy(ClickerId),
    /// Explicit selection, from the remote control surface.
    ClickerSelect(ClickerId),
    /// Provisioning requested for a clicker.
    StartProvision(ClickerId),
    /// A frame to be written to the clicker's socket.
    SendCommand(Packet),
    /// A frame read off a clicker's socket.
    ReceivedCommand(Packet),
    /// The credential service answered (or failed to).
    PskObtained(PskResult),
    /// Re-check whether the encrypted configs can be delivered.
    TrySendPsk(ClickerId),
    HistoryAdd(ClickerId),
    HistoryRemove(ClickerId),
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::ClickerCreate(_) => "CLICKER_CREATE",
            Event::ClickerDestroy(_) => "CLICKER_DESTROY",
            Event::ClickerSelect(_) => "CLICKER_SELECT",
            Event::StartProvision(_) => "CLICKER_START_PROVISION",
            Event::SendCommand(_) => "CONNECTION_SEND_COMMAND",
            Event::ReceivedCommand(_) => "CONNECTION_RECEIVED_COMMAND",
            Event::PskObtained(_) => "PSK_OBTAINED",
            Event::TrySendPsk(_) => "TRY_TO_SEND_PSK_TO_CLICKER",
            Event::HistoryAdd(_) => "HISTORY_ADD",
            Event::HistoryRemove(_) => "HISTORY_REMOVE",
        }
    }
}

/// Unbounded FIFO shared by every producer and drained by the main loop.
/// Strict FIFO across producers; a single mutex orders enqueue/dequeue.
pub struct EventBus {
    queue: Mutex<VecDeque<Event>>,
    log: logging::Logger,
}

impl EventBus {
    pub fn new(log: &logging::Logger) -> EventBus {
        EventBus {
            queue: Mutex::new(VecDeque::new()),
            log: log.new(logging::o!()),
        }
    }

    /// Appends an event. Never blocks beyond the queue mutex.
    pub fn push(&self, event: Event) {
        logging::trace!(self.log, "event queued"; "event" => event.name());

        let mut queue = self.queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        queue.push_back(event);
    }

    /// Removes and returns the oldest event, if any.
    pub fn pop(&self) -> Option<Event> {
        let mut queue = self.queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        queue.pop_front()
    }

    pub fn len(&self) -> usize {
        let queue = self.queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        queue.len()
    }
}
