//! Provisioning daemon. Accepts clicker connections on a TCP port,
//! performs a DH key exchange with each one, obtains a PSK credential
//! from the trust service over the local IPC bus and pushes the
//! encrypted device-server and network configs back to the device.

mod busagent;
mod config;
mod controls;
mod credential;
mod events;
mod history;
mod naming;
mod net;
mod registry;
mod session;

use crate::busagent::{BusAgent, StateHandles};
use crate::config::DaemonConfig;
use crate::controls::{Controls, NullLeds};
use crate::events::EventBus;
use crate::history::History;
use crate::net::endpoint::Endpoint;
use crate::registry::Registry;
use crate::session::{SessionConfig, SessionSm};
use clap::{App, Arg};
use flint::logging;
use flint::time;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const TICK_MS: u64 = 50;

fn main() {
    std::process::exit(run());
}

fn run() -> i32 {
    let matches = App::new("Provisioning Daemon")
        .version("0.1.0")
        .about("Enrolls clicker endpoints into the device management service.")
        .arg(
            Arg::with_name("config")
                .short("c")
                .value_name("PATH")
                .takes_value(true)
                .help("Path to the config file"),
        )
        .arg(
            Arg::with_name("verbosity")
                .short("v")
                .value_name("LEVEL")
                .takes_value(true)
                .help("Log level, 1 (errors only) to 5 (trace)"),
        )
        .arg(
            Arg::with_name("logfile")
                .short("l")
                .value_name("FILE")
                .takes_value(true)
                .help("Write the log to a file"),
        )
        .arg(
            Arg::with_name("daemonize")
                .short("d")
                .help("Detach and run in the background"),
        )
        .arg(
            Arg::with_name("remote")
                .short("r")
                .help("Force enable remote provision control"),
        )
        .get_matches();

    let config_path = matches
        .value_of("config")
        .unwrap_or(config::DEFAULT_CONFIG_PATH);
    let mut config = match DaemonConfig::load(config_path) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{}", err);
            return -1;
        }
    };

    if let Some(level) = matches.value_of("verbosity") {
        match level.parse::<u8>() {
            Ok(level) if (1..=5).contains(&level) => config.log_level = level,
            _ => {
                eprintln!("Invalid debug level");
                return -1;
            }
        }
    }
    if matches.is_present("remote") {
        config.remote_provision_ctrl = true;
    }
    if matches.is_present("daemonize") {
        daemonize();
    }

    let log = match matches.value_of("logfile") {
        Some(path) => logging::init_file(config.log_level, Path::new(path)),
        None => logging::init(config.log_level),
    };
    let log = match log {
        Ok(log) => log,
        Err(err) => {
            eprintln!("cannot initialize logging: {}", err);
            return -1;
        }
    };

    let shutdown = Arc::new(AtomicBool::new(false));
    if let Err(err) =
        signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&shutdown))
    {
        logging::crit!(log, "cannot install the signal handler"; "error" => ?err);
        return -1;
    }

    let bus = Arc::new(EventBus::new(&log));
    let registry = Arc::new(Registry::new(&log));
    let history = Arc::new(History::new(&log));
    let controls = Arc::new(Controls::new(Box::new(NullLeds), &log));
    if config.local_provision_ctrl {
        logging::info!(log, "local provision control is enabled");
    }

    let agent = match BusAgent::connect(&config.bus_socket, &log) {
        Ok(agent) => Arc::new(agent),
        Err(err) => {
            logging::crit!(log, "unable to reach the ipc bus";
                           "socket" => %config.bus_socket,
                           "error" => %err);
            return -1;
        }
    };
    if config.remote_provision_ctrl {
        agent.enable_remote_control();
    }

    let handles = StateHandles {
        registry: Arc::clone(&registry),
        controls: Arc::clone(&controls),
        history: Arc::clone(&history),
        bus: Arc::clone(&bus),
    };
    let bus_thread = match busagent::start(Arc::clone(&agent), handles, Arc::clone(&shutdown)) {
        Ok(handle) => handle,
        Err(err) => {
            logging::crit!(log, "cannot start the bus thread"; "error" => %err);
            return -1;
        }
    };

    let service: Arc<dyn credential::PskService> = agent.clone();
    let (credentials, credential_worker) =
        credential::spawn(service, Arc::clone(&bus), Arc::clone(&shutdown), &log);

    let mut endpoint = match Endpoint::bind(config.port, Arc::clone(&bus), &log) {
        Ok(endpoint) => endpoint,
        Err(err) => {
            logging::crit!(log, "cannot bind the listening socket";
                           "port" => config.port,
                           "error" => ?err);
            return -1;
        }
    };

    let session = SessionSm::new(
        Arc::clone(&registry),
        Arc::clone(&bus),
        credentials,
        endpoint.peers(),
        SessionConfig::from_daemon(&config),
        &log,
    );

    logging::info!(log, "entering main loop"; "port" => config.port);

    while !shutdown.load(Ordering::Relaxed) {
        let tick_start = time::monotonic_ms();

        endpoint.process_once(tick_start);
        controls.tick(&registry, &mut endpoint, time::monotonic_ms());

        // Consumer order matters: the registry must see CLICKER_CREATE
        // before the session acquires the record, and the session must
        // see CLICKER_DESTROY before the history runs.
        while let Some(event) = bus.pop() {
            endpoint.consume_event(&event);
            registry.consume_event(&event);
            controls.consume_event(&event, &bus);
            session.consume_event(&event);
            history.consume_event(&event, &registry);
        }

        let elapsed = time::monotonic_ms().saturating_sub(tick_start);
        if elapsed < TICK_MS {
            thread::sleep(Duration::from_millis(TICK_MS - elapsed));
        }
    }

    logging::info!(log, "exit triggered");

    // Teardown in reverse of initialization.
    credential_worker.join();
    drop(bus_thread.join());

    logging::info!(log, "done");
    0
}

/// Forks into the background, clears the umask and closes the standard
/// descriptors.
fn daemonize() {
    unsafe {
        let pid = libc::fork();
        if pid < 0 {
            eprintln!("Failed to start daemon");
            std::process::exit(-1);
        }
        if pid > 0 {
            std::process::exit(0);
        }

        libc::umask(0);
        libc::close(libc::STDIN_FILENO);
        libc::close(libc::STDOUT_FILENO);
        libc::close(libc::STDERR_FILENO);
    }
}
