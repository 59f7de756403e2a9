//! Selection and local feedback. Keeps the ordered list of connected
//! clickers and the single selected one, mirrors the selection to the
//! devices as highlight commands, drives the front-panel LEDs and
//! disconnects clickers a few seconds after their provisioning finished.
//!
//! The physical button bindings live outside the daemon; `select_next`
//! and `start_provision` are the operations they call into.

use crate::events::{Event, EventBus};
use crate::net::endpoint::Endpoint;
use crate::net::frame::{Command, Packet};
use crate::registry::Registry;
use flint::logging;
use flint::ClickerId;
use std::sync::Mutex;

/// A provisioned clicker is kept connected this long so the device can
/// read its configs before the link drops.
pub const DISCONNECT_AFTER_PROVISION_MS: u64 = 3000;

const LED_SLOW_BLINK_INTERVAL_MS: u64 = 500;
const LED_FAST_BLINK_INTERVAL_MS: u64 = 100;
const LED_COUNT: usize = 8;

/// Front-panel LED bank. The hardware binding is external; the daemon
/// only computes the mask.
pub trait LedSink: Send {
    fn set_mask(&mut self, mask: u8);
    fn release(&mut self);
}

/// Sink for gateways without a LED bank.
pub struct NullLeds;

impl LedSink for NullLeds {
    fn set_mask(&mut self, _mask: u8) {}
    fn release(&mut self) {}
}

struct Selection {
    ids: Vec<ClickerId>,
    selected: Option<usize>,
}

struct Blink {
    last_toggle_ms: u64,
    led_on: bool,
}

pub struct Controls {
    selection: Mutex<Selection>,
    blink: Mutex<Blink>,
    leds: Mutex<Box<dyn LedSink>>,
    log: logging::Logger,
}

impl Controls {
    pub fn new(leds: Box<dyn LedSink>, log: &logging::Logger) -> Controls {
        Controls {
            selection: Mutex::new(Selection {
                ids: Vec::new(),
                selected: None,
            }),
            blink: Mutex::new(Blink {
                last_toggle_ms: 0,
                led_on: true,
            }),
            leds: Mutex::new(leds),
            log: log.new(logging::o!()),
        }
    }

    pub fn selected_id(&self) -> Option<ClickerId> {
        let selection = self.selection.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        selection.selected.map(|index| selection.ids[index])
    }

    pub fn ids(&self) -> Vec<ClickerId> {
        let selection = self.selection.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        selection.ids.clone()
    }

    /// Moves the selection to the next clicker, wrapping around. Button
    /// operation.
    pub fn select_next(&self, bus: &EventBus) {
        {
            let mut selection =
                self.selection.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

            selection.selected = match selection.selected {
                Some(index) if index + 1 < selection.ids.len() => Some(index + 1),
                _ if selection.ids.is_empty() => None,
                _ => Some(0),
            };

            match selection.selected {
                Some(index) => {
                    logging::info!(self.log, "selected clicker";
                                   "clicker_id" => selection.ids[index]);
                }
                None => logging::info!(self.log, "no clicker is selected now"),
            }
        }

        self.broadcast_highlights(bus);
    }

    /// Requests provisioning of the selected clicker. Button operation.
    pub fn start_provision(&self, bus: &EventBus) -> bool {
        match self.selected_id() {
            Some(id) => {
                bus.push(Event::StartProvision(id));
                true
            }
            None => {
                logging::crit!(self.log, "can't start provision, no clicker is selected");
                false
            }
        }
    }

    pub fn consume_event(&self, event: &Event, bus: &EventBus) {
        match *event {
            Event::ClickerCreate(id) => {
                {
                    let mut selection =
                        self.selection.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                    selection.ids.push(id);
                    if selection.selected.is_none() {
                        selection.selected = Some(0);
                        logging::info!(self.log, "selected clicker";
                                       "clicker_id" => selection.ids[0]);
                    }
                }
                self.broadcast_highlights(bus);
            }
            Event::ClickerDestroy(id) => {
                self.remove_clicker(id);
                self.broadcast_highlights(bus);
            }
            Event::ClickerSelect(id) => {
                {
                    let mut selection =
                        self.selection.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                    match selection.ids.iter().position(|&known| known == id) {
                        Some(index) => {
                            selection.selected = Some(index);
                            logging::info!(self.log, "selected clicker"; "clicker_id" => id);
                        }
                        None => {
                            logging::warn!(self.log, "select for an unknown clicker";
                                           "clicker_id" => id);
                        }
                    }
                }
                self.broadcast_highlights(bus);
            }
            _ => {}
        }
    }

    fn remove_clicker(&self, id: ClickerId) {
        let mut selection = self.selection.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Some(index) = selection.ids.iter().position(|&known| known == id) {
            selection.ids.remove(index);

            if let Some(selected) = selection.selected {
                if selected >= selection.ids.len() {
                    selection.selected = selection.ids.len().checked_sub(1);
                    match selection.selected {
                        Some(index) => {
                            logging::info!(self.log, "selected clicker";
                                           "clicker_id" => selection.ids[index]);
                        }
                        None => logging::info!(self.log, "no clicker is selected now"),
                    }
                }
            }
        }
    }

    /// ENABLE_HIGHLIGHT to the selected clicker, DISABLE_HIGHLIGHT to all
    /// others.
    fn broadcast_highlights(&self, bus: &EventBus) {
        let selection = self.selection.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        for (index, &id) in selection.ids.iter().enumerate() {
            let command = if selection.selected == Some(index) {
                Command::EnableHighlight
            } else {
                Command::DisableHighlight
            };
            bus.push(Event::SendCommand(Packet::bare(id, command)));
        }
    }

    /// Periodic work: LED refresh and the finished-provisioning
    /// disconnect sweep. The selection mutex is never held across an
    /// `acquire`.
    pub fn tick(&self, registry: &Registry, endpoint: &mut Endpoint, now_ms: u64) {
        let selected = self.selected_id();

        let interval = match selected.and_then(|id| registry.acquire(id)) {
            Some(clicker) if clicker.provisioning => LED_FAST_BLINK_INTERVAL_MS,
            _ => LED_SLOW_BLINK_INTERVAL_MS,
        };

        let led_on = {
            let mut blink = self.blink.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            if now_ms.saturating_sub(blink.last_toggle_ms) > interval {
                blink.last_toggle_ms = now_ms;
                blink.led_on = !blink.led_on;
            }
            blink.led_on
        };

        self.refresh_leds(led_on);

        for id in self.ids() {
            let finished = match self.registry_finished_at(registry, id) {
                Some(finished) => finished,
                None => continue,
            };
            if finished > 0 && now_ms.saturating_sub(finished) > DISCONNECT_AFTER_PROVISION_MS {
                endpoint.disconnect(id);
            }
        }
    }

    fn registry_finished_at(&self, registry: &Registry, id: ClickerId) -> Option<u64> {
        match registry.acquire(id) {
            Some(clicker) => Some(clicker.finished_at),
            None => {
                logging::debug!(self.log, "clicker vanished during sweep"; "clicker_id" => id);
                None
            }
        }
    }

    fn refresh_leds(&self, led_on: bool) {
        let (count, selected) = {
            let selection =
                self.selection.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            (selection.ids.len(), selection.selected)
        };

        let mut leds = self.leds.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        if count == 0 {
            leds.release();
            return;
        }

        let mut mask = 0u8;
        for index in 0..count.min(LED_COUNT) {
            mask |= 1 << index;
        }
        if let Some(index) = selected {
            if index < LED_COUNT && led_on {
                mask ^= 1 << index;
            }
        }

        leds.set_mask(mask);
    }
}
