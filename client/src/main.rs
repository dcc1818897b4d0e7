//! CLI entry point: `pagekite KITENAME KITESECRET [--config FILE] [--webroot DIR]
//! [--listen ADDR] [--log-level LEVEL]`. Grounded on
//! `services/authenticator/src/main.rs` and `util/src/bin/gen_keys.rs`'s clap
//! `App::new(...).arg(Arg::with_name(...))` builder style.

use std::fs;
use std::process;
use std::sync::Arc;

use clap::{App, Arg};

use pagekite_core::crypto;
use pagekite_core::logging;
use pagekite_ddns::{HttpDdnsUpdater, PersistedState};
use pagekite_tunnel::config::ClientConfig;
use pagekite_tunnel::http::response::HttpServer;
use pagekite_tunnel::kite::Kite;
use pagekite_tunnel::supervisor::Supervisor;

fn main() {
    let matches = App::new("pagekite")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Dials a public relay and exposes a local HTTP server as a public kite.")
        .arg(Arg::with_name("KITENAME").help("Public name for this kite, e.g. foo.pagekite.me").required(true))
        .arg(Arg::with_name("KITESECRET").help("Shared secret registered for KITENAME").required(true))
        .arg(Arg::with_name("config").long("config").takes_value(true).help("Path to a JSON config file"))
        .arg(Arg::with_name("webroot").long("webroot").takes_value(true).help("Directory of static files to serve"))
        .arg(Arg::with_name("listen").long("listen").takes_value(true).help("Local address to accept direct connections on"))
        .arg(Arg::with_name("log-level").long("log-level").takes_value(true).help("trace|debug|info|warning|error"))
        .arg(Arg::with_name("state").long("state").takes_value(true).help("Path to the persisted bootstrap state file"))
        .get_matches();

    let log = logging::init(matches.value_of("log-level").unwrap_or("info"));

    let kite_name = matches.value_of("KITENAME").unwrap().to_owned();
    let kite_secret = matches.value_of("KITESECRET").unwrap().to_owned();

    let mut config = match matches.value_of("config") {
        Some(path) => match fs::read_to_string(path).map_err(|e| e.to_string()).and_then(|s| ClientConfig::from_json_str(&s).map_err(|e| e.to_string())) {
            Ok(config) => config,
            Err(err) => {
                logging::error!(log, "failed to load config"; "path" => path, "err" => %err);
                process::exit(1);
            }
        },
        None => ClientConfig::default(),
    };

    if let Some(webroot) = matches.value_of("webroot") {
        config.webroot = webroot.to_owned();
    }
    if let Some(listen) = matches.value_of("listen") {
        config.listen_addr = listen.to_owned();
    }

    let http_server = Arc::new(HttpServer::new(&config, log.new(logging::o!("component" => "http"))));
    let kite = Kite::new(kite_name.clone(), kite_secret.clone(), "http", http_server);

    let state_path = matches.value_of("state").map(std::path::PathBuf::from).unwrap_or_else(default_state_path);
    let global_secret = load_or_create_global_secret(&state_path, &kite_name, &kite_secret, &log);
    let ddns = HttpDdnsUpdater::new(config.ddns_url.clone(), kite_secret);

    let mut supervisor = match Supervisor::new(config, vec![kite], global_secret, ddns, log.clone()) {
        Ok(supervisor) => supervisor,
        Err(err) => {
            logging::error!(log, "failed to start supervisor"; "err" => format!("{:?}", err));
            process::exit(1);
        }
    };

    logging::info!(log, "starting pagekite client"; "kite" => %kite_name);

    if let Err(err) = supervisor.run() {
        logging::error!(log, "supervisor exited"; "err" => format!("{:?}", err));
        process::exit(1);
    }
}

fn default_state_path() -> std::path::PathBuf {
    std::env::temp_dir().join("pagekite-state.json")
}

/// Reuses the `key` field of a previously persisted bootstrap state as this process's
/// global secret (so a restart doesn't re-sign with a different client token), or
/// generates and persists a fresh one on first run. Per spec §6/§3's `PersistedState`
/// contract.
fn load_or_create_global_secret(path: &std::path::Path, kite_name: &str, kite_secret: &str, log: &logging::Logger) -> String {
    if let Ok(Some(state)) = PersistedState::load(path) {
        return state.key;
    }

    let key = crypto::make_random_secret();
    let state = PersistedState {
        ssid: crypto::make_random_secret(),
        key: key.clone(),
        kite_name: kite_name.to_owned(),
        kite_secret: kite_secret.to_owned(),
        src: "bootstrap".into(),
    };

    if let Err(err) = state.save(path) {
        logging::warn!(log, "failed to persist bootstrap state"; "err" => format!("{:?}", err));
    }

    key
}
