//! Per-clicker provisioning state machine. Progress is keyed on which of
//! the two inputs have landed: the remote public key (gives the shared
//! secret) and the PSK credential. Both arrival paths emit the same
//! `TRY_TO_SEND_PSK_TO_CLICKER` event, so the encrypted configs go out
//! exactly when the last of the two lands, regardless of order.

use crate::config::DaemonConfig;
use crate::credential::{CredentialClient, PskResult};
use crate::events::{Event, EventBus};
use crate::naming;
use crate::net::endpoint::PeerDirectory;
use crate::net::frame::{Command, Packet};
use crate::registry::{Fault, Registry};
use flint::encoder;
use flint::logging;
use flint::time;
use flint::ClickerId;
use std::sync::Arc;

const SECURITY_MODE_PSK: u8 = 0;
const PSK_FIELD_SIZE: usize = 32;
const BOOTSTRAP_URI_SIZE: usize = 200;
const ROUTE_URI_SIZE: usize = 100;
const DNS_SERVER_SIZE: usize = 100;

/// Everything in the device-server payload except the identity bytes.
const DEVICE_CONFIG_FIXED: usize = 2 + PSK_FIELD_SIZE + 1 + BOOTSTRAP_URI_SIZE;

/// The encrypted payload must fit the one-byte frame length, so the
/// padded size is capped at 240 and the 235 fixed bytes leave five for
/// the identity. Longer identities are silently truncated.
const IDENTITY_MAX: usize = 240 - DEVICE_CONFIG_FIXED;

/// The slice of the daemon configuration the session layer consumes.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub bootstrap_uri: String,
    pub default_route_uri: String,
    pub dns_server: String,
    pub endpoint_name_pattern: String,
}

impl SessionConfig {
    pub fn from_daemon(config: &DaemonConfig) -> SessionConfig {
        SessionConfig {
            bootstrap_uri: config.bootstrap_uri.clone(),
            default_route_uri: config.default_route_uri.clone(),
            dns_server: config.dns_server.clone(),
            endpoint_name_pattern: config.endpoint_name_pattern.clone(),
        }
    }
}

pub struct SessionSm {
    registry: Arc<Registry>,
    bus: Arc<EventBus>,
    credentials: CredentialClient,
    peers: PeerDirectory,
    config: SessionConfig,
    log: logging::Logger,
}

impl SessionSm {
    pub fn new(
        registry: Arc<Registry>,
        bus: Arc<EventBus>,
        credentials: CredentialClient,
        peers: PeerDirectory,
        config: SessionConfig,
        log: &logging::Logger,
    ) -> SessionSm {
        SessionSm {
            registry,
            bus,
            credentials,
            peers,
            config,
            log: log.new(logging::o!()),
        }
    }

    pub fn consume_event(&self, event: &Event) {
        match event {
            Event::ClickerCreate(id) => self.on_create(*id),
            Event::ReceivedCommand(packet) => {
                if packet.command == Command::Key {
                    self.on_remote_key(packet);
                }
            }
            Event::StartProvision(id) => self.on_start_provision(*id),
            Event::PskObtained(result) => self.on_psk_obtained(result),
            Event::TrySendPsk(id) => self.try_send_configs(*id),
            _ => {}
        }
    }

    /// Names the clicker and opens the exchange by sending our public key.
    fn on_create(&self, id: ClickerId) {
        let ip = self
            .peers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&id)
            .map(|peer| peer.ip.clone());
        let ip = ip.as_deref().unwrap_or("Unknown");
        let name = naming::generate(&self.config.endpoint_name_pattern, ip);

        let mut clicker = match self.registry.acquire(id) {
            Some(clicker) => clicker,
            None => {
                logging::crit!(self.log, "cannot acquire clicker on create";
                               "clicker_id" => id);
                return;
            }
        };

        clicker.name = name.clone();
        logging::info!(self.log, "new clicker";
                       "clicker_id" => id,
                       "ip" => ip,
                       "name" => %name);

        let public = match clicker.exchanger.generate_local() {
            Ok(public) => public,
            Err(err) => {
                logging::crit!(self.log, "cannot generate local key";
                               "clicker_id" => id,
                               "error" => ?err);
                return;
            }
        };
        clicker.local_key = Some(public.clone());
        drop(clicker);

        logging::info!(self.log, "sending local key"; "clicker_id" => id);
        self.bus
            .push(Event::SendCommand(Packet::with_data(id, Command::Key, public)));
    }

    /// Stores the peer key and derives the shared secret.
    fn on_remote_key(&self, packet: &Packet) {
        let id = packet.clicker;

        let mut clicker = match self.registry.acquire(id) {
            Some(clicker) => clicker,
            None => {
                logging::crit!(self.log, "cannot acquire clicker for remote key";
                               "clicker_id" => id);
                return;
            }
        };

        logging::info!(self.log, "received exchange key"; "clicker_id" => id);
        clicker.remote_key = Some(packet.data.clone());

        match clicker.exchanger.complete(&packet.data) {
            Ok(shared) => {
                if clicker.shared_key.is_none() {
                    clicker.shared_key = Some(shared);
                    logging::info!(self.log, "shared key derived"; "clicker_id" => id);
                } else {
                    logging::debug!(self.log, "shared key already set, keeping it";
                                    "clicker_id" => id);
                }
            }
            Err(err) => {
                logging::warn!(self.log, "cannot derive shared key";
                               "clicker_id" => id,
                               "error" => ?err);
                return;
            }
        }
        drop(clicker);

        self.bus.push(Event::TrySendPsk(id));
    }

    fn on_start_provision(&self, id: ClickerId) {
        let mut clicker = match self.registry.acquire(id) {
            Some(clicker) => clicker,
            None => {
                logging::crit!(self.log, "cannot acquire clicker to start provisioning";
                               "clicker_id" => id);
                return;
            }
        };
        clicker.provisioning = true;
        drop(clicker);

        self.bus.push(Event::HistoryRemove(id));
        self.credentials.request_psk(id);
    }

    fn on_psk_obtained(&self, result: &PskResult) {
        let id = result.clicker;

        let mut clicker = match self.registry.acquire(id) {
            Some(clicker) => clicker,
            None => {
                logging::crit!(self.log, "cannot acquire clicker for obtained psk";
                               "clicker_id" => id);
                return;
            }
        };

        let psk_hex = match &result.psk {
            Some(psk_hex) => psk_hex,
            None => {
                logging::warn!(self.log, "couldn't get psk from device server";
                               "clicker_id" => id);
                clicker.fault = Some(Fault::GeneratePsk);
                clicker.provisioning = false;
                return;
            }
        };

        let psk = match hex::decode(psk_hex) {
            Ok(psk) => psk,
            Err(err) => {
                logging::warn!(self.log, "psk is not valid hex";
                               "clicker_id" => id,
                               "error" => ?err);
                clicker.fault = Some(Fault::GeneratePsk);
                clicker.provisioning = false;
                return;
            }
        };

        if clicker.psk.is_none() {
            clicker.psk = Some(psk);
            clicker.identity = Some(
                result
                    .identity
                    .as_deref()
                    .unwrap_or("")
                    .as_bytes()
                    .to_vec(),
            );
        }
        drop(clicker);

        self.bus.push(Event::HistoryAdd(id));
        self.bus.push(Event::TrySendPsk(id));
    }

    /// Delivers the encrypted configs once both the shared key and the
    /// PSK exist. A missing piece makes this a no-op; its arrival
    /// re-emits the event.
    fn try_send_configs(&self, id: ClickerId) {
        let mut clicker = match self.registry.acquire(id) {
            Some(clicker) => clicker,
            None => {
                logging::crit!(self.log, "cannot acquire clicker, wont send configs";
                               "clicker_id" => id);
                return;
            }
        };

        if clicker.finished_at > 0 {
            logging::debug!(self.log, "configs already delivered"; "clicker_id" => id);
            return;
        }

        let (shared, psk) = match (&clicker.shared_key, &clicker.psk) {
            (Some(shared), Some(psk)) => (shared.clone(), psk.clone()),
            _ => {
                logging::debug!(self.log, "not all data available yet, waiting";
                                "clicker_id" => id);
                return;
            }
        };

        if shared.len() < encoder::KEY_SIZE {
            logging::error!(self.log, "shared key too short for the encoder";
                            "clicker_id" => id,
                            "len" => shared.len());
            clicker.fault = Some(Fault::EncodePayload);
            clicker.provisioning = false;
            return;
        }
        let mut key = [0u8; encoder::KEY_SIZE];
        key.copy_from_slice(&shared[..encoder::KEY_SIZE]);

        let identity = clicker.identity.clone().unwrap_or_default();
        let device = build_device_server_config(&psk, &identity, &self.config.bootstrap_uri);
        let network = build_network_config(
            &self.config.default_route_uri,
            &self.config.dns_server,
            &clicker.name,
        );

        clicker.finished_at = time::monotonic_ms();
        clicker.provisioning = false;
        drop(clicker);

        logging::info!(self.log, "sending device server config"; "clicker_id" => id);
        self.bus.push(Event::SendCommand(Packet::with_data(
            id,
            Command::DeviceServerConfig,
            encoder::encode(&device, &key),
        )));

        logging::info!(self.log, "sending network config"; "clicker_id" => id);
        self.bus.push(Event::SendCommand(Packet::with_data(
            id,
            Command::NetworkConfig,
            encoder::encode(&network, &key),
        )));

        logging::info!(self.log, "provisioning finished, back to listening";
                       "clicker_id" => id);
    }
}

/// Packed device-server payload: securityMode, pskKeySize, psk[32],
/// identitySize, identity bytes, bootstrapUri[200].
fn build_device_server_config(psk: &[u8], identity: &[u8], bootstrap_uri: &str) -> Vec<u8> {
    let psk_len = psk.len().min(PSK_FIELD_SIZE);
    let identity_len = identity.len().min(IDENTITY_MAX);

    let mut plain = Vec::with_capacity(DEVICE_CONFIG_FIXED + identity_len);
    plain.push(SECURITY_MODE_PSK);
    plain.push(psk_len as u8);

    let mut psk_field = [0u8; PSK_FIELD_SIZE];
    psk_field[..psk_len].copy_from_slice(&psk[..psk_len]);
    plain.extend_from_slice(&psk_field);

    plain.push(identity_len as u8);
    plain.extend_from_slice(&identity[..identity_len]);

    push_text_field(&mut plain, bootstrap_uri, BOOTSTRAP_URI_SIZE, false);
    plain
}

/// Packed network payload: defaultRouteUri[100], dnsServer[100],
/// endpointName[24].
fn build_network_config(route_uri: &str, dns_server: &str, name: &str) -> Vec<u8> {
    let mut plain = Vec::with_capacity(ROUTE_URI_SIZE + DNS_SERVER_SIZE + naming::ENDPOINT_NAME_LEN);
    push_text_field(&mut plain, route_uri, ROUTE_URI_SIZE, true);
    push_text_field(&mut plain, dns_server, DNS_SERVER_SIZE, true);
    push_text_field(&mut plain, name, naming::ENDPOINT_NAME_LEN, true);
    plain
}

/// Zero-padded fixed-width text field. `reserve_nul` keeps the last byte
/// clear so the firmware always finds a terminator.
fn push_text_field(out: &mut Vec<u8>, text: &str, size: usize, reserve_nul: bool) {
    let cap = if reserve_nul { size - 1 } else { size };
    let count = text.len().min(cap);

    let mut field = vec![0u8; size];
    field[..count].copy_from_slice(&text.as_bytes()[..count]);
    out.extend_from_slice(&field);
}
