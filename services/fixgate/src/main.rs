//! The FIX gateway: wires a client (or server) session to a message
//! handler and runs the reactor. Session settings come from a TOML
//! configuration file, overridable from the command line.

use clap::{App, Arg};
use conduit::applink::AppLink;
use conduit::error::EngineError;
use conduit::reactor::Reactor;
use conduit::session::{AppEnd, Session};
use fixwire::dict::Dictionary;
use fixwire::logging;
use hashbrown::HashMap;
use std::path::PathBuf;
use std::process;

mod handlers;

type ConfigFile = HashMap<String, HashMap<String, String>>;

fn main() {
    let matches = App::new("FIX Gateway")
        .version("1.0")
        .about("Runs a FIX session connected to a message handler.")
        .arg(
            Arg::with_name("HANDLER")
                .help("Handler expression: sink:<path> or source:<path>")
                .required(true),
        )
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .takes_value(true)
                .help("Configuration file"),
        )
        .arg(
            Arg::with_name("name")
                .short("n")
                .long("name")
                .takes_value(true)
                .default_value("fixsession")
                .help("Session name (section in configuration file)"),
        )
        .arg(
            Arg::with_name("dest")
                .short("d")
                .long("dest")
                .takes_value(true)
                .help("Destination address [tls:]//<host>:<port>"),
        )
        .arg(
            Arg::with_name("listen")
                .short("L")
                .long("listen")
                .help("Run the server side of the session"),
        )
        .arg(
            Arg::with_name("sender")
                .short("S")
                .long("sender")
                .takes_value(true)
                .help("Sender Company ID"),
        )
        .arg(
            Arg::with_name("target")
                .short("T")
                .long("target")
                .takes_value(true)
                .help("Target Company ID"),
        )
        .arg(
            Arg::with_name("heartbeat")
                .short("H")
                .long("heartbeat")
                .takes_value(true)
                .help("Heartbeat seconds"),
        )
        .arg(
            Arg::with_name("resend")
                .short("R")
                .long("resend")
                .takes_value(true)
                .help("Resend mode (FULL or GAPFILL)"),
        )
        .arg(
            Arg::with_name("reset")
                .short("r")
                .long("reset")
                .help("Reset message seqno at logon"),
        )
        .arg(
            Arg::with_name("fixversion")
                .short("f")
                .long("fixversion")
                .takes_value(true)
                .help("FIX protocol version"),
        )
        .arg(
            Arg::with_name("state")
                .short("s")
                .long("state")
                .takes_value(true)
                .help("Session state snapshot path"),
        )
        .arg(
            Arg::with_name("messages")
                .short("m")
                .long("messages")
                .takes_value(true)
                .help("Message store URL (file:<path>)"),
        )
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .long("verbose")
                .takes_value(true)
                .default_value("info")
                .help("Logging verbosity (trace,debug,info,warning,error)"),
        )
        .get_matches();

    let log = logging::init_with_level(matches.value_of("verbose").unwrap());

    // Configuration file first, command line on top.
    let name = matches.value_of("name").unwrap();
    let mut session_conf: HashMap<String, String> = HashMap::new();
    if let Some(path) = matches.value_of("config") {
        let file: ConfigFile =
            serdeconv::from_toml_file(path).expect("Error parsing configuration file");
        if let Some(section) = file.get(name) {
            session_conf.extend(section.clone());
        }
    }
    for (key, option) in &[
        ("sender_comp_id", "sender"),
        ("target_comp_id", "target"),
        ("heartbeat_interval", "heartbeat"),
        ("resend_mode", "resend"),
        ("fixversion", "fixversion"),
        ("state_path", "state"),
        ("message_store", "messages"),
        ("destination", "dest"),
    ] {
        if let Some(value) = matches.value_of(option) {
            session_conf.insert(key.to_string(), value.to_string());
        }
    }
    if matches.is_present("reset") {
        session_conf.insert("reset_seqno".to_string(), "true".to_string());
    }

    let destination = match session_conf.remove("destination") {
        Some(destination) => destination,
        None => {
            logging::error!(log, "no destination address defined");
            process::exit(1);
        }
    };

    let mut config = conduit::config::SessionConfig::default();
    for (key, value) in &session_conf {
        if let Err(err) = config.set(key, value) {
            logging::error!(log, "bad configuration"; "error" => %err);
            process::exit(1);
        }
    }

    let dict = match Dictionary::builtin(&config.fix_version) {
        Some(dict) => dict,
        None => {
            logging::error!(log, "unsupported FIX version"; "version" => &config.fix_version);
            process::exit(1);
        }
    };

    let handler = handlers::make_handler(matches.value_of("HANDLER").unwrap())
        .unwrap_or_else(|err| {
            logging::error!(log, "bad handler expression"; "error" => &err);
            process::exit(1);
        });

    let state_path = config.state_path.clone();
    let server_side = matches.is_present("listen");
    let mut session = if server_side {
        Session::server(dict, config, name, &log)
    } else {
        Session::client(dict, config, name, &log)
    };

    let app = AppLink::worker(handler, &log).expect("Error spawning handler worker");
    session.linkup(AppEnd::Worker(app));

    let mut reactor = Reactor::new(&log).expect("Error creating reactor");
    let id = reactor.add_session(session);

    logging::info!(log, "starting session";
                   "name" => name,
                   "destination" => &destination,
                   "server" => server_side);
    if let Err(err) = reactor.start(id, &destination) {
        logging::error!(log, "session start failed"; "error" => %err);
        process::exit(1);
    }

    let savelist: Vec<(usize, PathBuf)> = state_path
        .into_iter()
        .map(|path| (id, path))
        .collect();

    // Session-rule violations are logged and the session keeps recovering;
    // anything else tears the loop down.
    let policy_log = log.clone();
    let mut policy = move |err: &EngineError| -> bool {
        logging::warn!(policy_log, "reactor exception"; "error" => %err);
        matches!(err, EngineError::Session(_))
    };

    if let Err(err) = reactor.run(&savelist, &mut policy) {
        logging::error!(log, "reactor stopped on error"; "error" => %err);
        process::exit(1);
    }
}
