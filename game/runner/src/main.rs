mod config;

use clap::{App, Arg};
use keel::crypto::BbKeyFile;
use keel::logging;
use keel::text::SjisTable;
use shipcore::addresses;
use shipcore::data::{BattleParamTable, CommonItemCreator, Ep3CardIndex, Ep3MapIndex, LevelTable, RareItemTable};
use shipcore::dispatch::ShipServer;
use shipcore::license::LicenseStore;
use shipcore::menu::{MenuItem, MenuItemFlags, INFORMATION_MENU_GO_BACK};
use shipcore::proxy::ProxyServer;
use shipcore::quest::QuestIndex;
use shipcore::state::ServerState;
use sloggers::types::Severity;
use std::fs;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::process;
use std::sync::Arc;

use crate::config::Config;

const BB_STREAM_FILE_NAMES: &[&str] = &[
    "ItemMagEdit.prs",
    "ItemPMT.prs",
    "BattleParamEntry.dat",
    "BattleParamEntry_on.dat",
    "BattleParamEntry_lab.dat",
    "BattleParamEntry_lab_on.dat",
    "BattleParamEntry_ep4.dat",
    "BattleParamEntry_ep4_on.dat",
    "PlyLevelTbl.prs",
];

fn main() {
    let matches = App::new("shiprunner")
        .about("Multi-version private game server")
        .arg(
            Arg::with_name("config")
                .long("config")
                .takes_value(true)
                .default_value("system/config.json")
                .help("Path to the configuration file"),
        )
        .arg(
            Arg::with_name("verbose")
                .long("verbose")
                .short("v")
                .help("Log at debug severity"),
        )
        .arg(
            Arg::with_name("proxy-destination")
                .long("proxy-destination")
                .takes_value(true)
                .help("Run the interceptor proxy against this host:port"),
        )
        .arg(
            Arg::with_name("proxy-port")
                .long("proxy-port")
                .takes_value(true)
                .default_value("9110")
                .help("Listen port for the interceptor proxy"),
        )
        .get_matches();

    let severity = if matches.is_present("verbose") { Severity::Debug } else { Severity::Info };
    let log = logging::init(severity);

    logging::info!(log, "loading configuration");
    let config = match Config::load(matches.value_of("config").unwrap()) {
        Ok(config) => config,
        Err(err) => {
            logging::crit!(log, "cannot read configuration"; "error" => %err);
            process::exit(1);
        }
    };

    let local_address = match addresses::parse_ipv4(&config.local_address) {
        Some(address) => address,
        None => {
            logging::crit!(log, "LocalAddress is not a valid IPv4 address");
            process::exit(1);
        }
    };
    let external_address = match addresses::parse_ipv4(&config.external_address) {
        Some(address) => address,
        None => {
            logging::crit!(log, "ExternalAddress is not a valid IPv4 address");
            process::exit(1);
        }
    };

    logging::info!(log, "loading text transcoding table");
    match SjisTable::load("system/sjis-table.ini") {
        Ok(table) => keel::text::install_table(table),
        Err(err) => {
            logging::warn!(log, "no transcoding table; falling back to ascii"; "error" => %err);
        }
    }

    logging::info!(log, "loading license list");
    let license_store = match LicenseStore::open("system/licenses.psl") {
        Ok(store) => Arc::new(store),
        Err(err) => {
            logging::crit!(log, "cannot read the license file"; "error" => %err);
            process::exit(1);
        }
    };
    logging::info!(log, "licenses loaded"; "count" => license_store.count());

    let mut state = ServerState::new(config.server_name.clone(), license_store, &log);
    state.local_address = local_address;
    state.external_address = external_address;
    state.num_threads = if config.threads == 0 {
        std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
    } else {
        config.threads
    };

    populate_information_menu(&mut state, &config);
    *state.common_items.write().unwrap() = Arc::new(CommonItemCreator::new(
        config.common_item_drop_rates_enemy.clone(),
        config.common_item_drop_rates_box.clone(),
        config.common_unit_types.clone(),
    ));

    load_static_data(&mut state, &log);

    let state = Arc::new(state);
    state.create_default_lobbies();

    if config.run_dns_server {
        logging::warn!(log, "RunDNSServer is set, but this build relies on an external resolver");
    }
    if config.run_interactive_shell == Some(true) {
        logging::warn!(log, "RunInteractiveShell is set, but this build has no shell");
    }

    // The interceptor proxy runs instead of the game server when asked to.
    if let Some(destination) = matches.value_of("proxy-destination") {
        run_proxy(destination, matches.value_of("proxy-port").unwrap(), &log);
        return;
    }

    logging::info!(log, "starting game server"; "workers" => state.num_threads);
    let app = Arc::new(ShipServer::new(state.clone(), &log));
    let mut endpoint = rigging::endpoint::Endpoint::new(app, state.num_threads, &log);

    for spec in &state.port_configuration {
        let address = SocketAddr::from((Ipv4Addr::UNSPECIFIED, spec.port));
        if let Err(err) = endpoint.listen(address, spec.version, spec.behavior.to_tag()) {
            logging::crit!(log, "cannot bind listener";
                           "port" => spec.port,
                           "name" => spec.name,
                           "error" => %err);
            process::exit(1);
        }
    }

    if let Err(err) = endpoint.start() {
        logging::crit!(log, "cannot start workers"; "error" => %err);
        process::exit(1);
    }

    logging::info!(log, "server is up"; "name" => &state.name);
    endpoint.wait_for_stop();
}

fn populate_information_menu(state: &mut ServerState, config: &Config) {
    state.information_menu.push(MenuItem::new(
        INFORMATION_MENU_GO_BACK,
        "Go back",
        "Return to the\nmain menu",
        MenuItemFlags::empty(),
    ));
    for (index, entry) in config.information_menu_contents.iter().enumerate() {
        state.information_menu.push(MenuItem::new(
            index as u32,
            &entry[0],
            &entry[1],
            MenuItemFlags::REQUIRES_MESSAGE_BOXES,
        ));
        state.information_contents.push(entry[2].clone());
    }
}

/// Loads the static data indices. Missing data files degrade features but
/// never abort startup; unreadable essential files are logged loudly.
fn load_static_data(state: &mut ServerState, log: &logging::Logger) {
    logging::info!(log, "loading level table");
    match LevelTable::load("system/blueburst/PlyLevelTbl.prs", true) {
        Ok(table) => *state.level_table.write().unwrap() = Arc::new(table),
        Err(err) => logging::warn!(log, "level table unavailable"; "error" => %err),
    }

    logging::info!(log, "loading battle parameters");
    match BattleParamTable::load("system/blueburst/BattleParamEntry") {
        Ok(table) => *state.battle_params.write().unwrap() = Arc::new(table),
        Err(err) => logging::warn!(log, "battle parameters unavailable"; "error" => %err),
    }

    logging::info!(log, "loading rare item tables");
    match RareItemTable::load("system/blueburst/ItemRT.rel") {
        Ok(table) => *state.rare_items.write().unwrap() = Arc::new(table),
        Err(err) => logging::warn!(log, "rare item tables unavailable"; "error" => %err),
    }

    logging::info!(log, "collecting quest metadata");
    *state.quest_index.write().unwrap() = Arc::new(QuestIndex::load("system/quests", log));

    logging::info!(log, "loading episode 3 data");
    match Ep3CardIndex::load("system/ep3/cards.mnr") {
        Ok(index) => *state.ep3_cards.write().unwrap() = Arc::new(index),
        Err(err) => logging::warn!(log, "ep3 card definitions unavailable"; "error" => %err),
    }
    match Ep3MapIndex::load("system/ep3/maps") {
        Ok(index) => *state.ep3_maps.write().unwrap() = Arc::new(index),
        Err(err) => logging::warn!(log, "ep3 maps unavailable"; "error" => %err),
    }

    logging::info!(log, "loading blue burst keys");
    if let Ok(entries) = fs::read_dir("system/blueburst/keys") {
        for entry in entries.flatten() {
            match fs::read(entry.path()).map_err(|e| e.to_string()).and_then(|data| {
                BbKeyFile::from_bytes(&data).map_err(|e| e.to_string())
            }) {
                Ok(key) => {
                    logging::info!(log, "loaded key file"; "file" => %entry.path().display());
                    state.bb_keys.push(Arc::new(key));
                }
                Err(err) => {
                    logging::warn!(log, "skipping key file";
                                   "file" => %entry.path().display(),
                                   "error" => err);
                }
            }
        }
    }
    if state.bb_keys.is_empty() {
        logging::warn!(log, "no blue burst keys loaded; BB clients cannot connect");
    }

    for name in BB_STREAM_FILE_NAMES {
        let path = Path::new("system/blueburst").join(name);
        match fs::read(&path) {
            Ok(data) => state.bb_stream_files.push((name.to_string(), data)),
            Err(_) => logging::debug!(log, "stream file missing"; "file" => *name),
        }
    }
}

fn run_proxy(destination: &str, port_text: &str, log: &logging::Logger) {
    let destination: SocketAddr = match destination.parse() {
        Ok(destination) => destination,
        Err(_) => {
            logging::crit!(log, "proxy destination must be host:port");
            process::exit(1);
        }
    };
    let listen_port: u16 = match port_text.parse() {
        Ok(port) => port,
        Err(_) => {
            logging::crit!(log, "proxy port must be numeric");
            process::exit(1);
        }
    };

    let listen_addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, listen_port));
    let proxy = match ProxyServer::new(listen_addr, destination, log) {
        Ok(proxy) => proxy,
        Err(err) => {
            logging::crit!(log, "cannot start proxy"; "error" => %err);
            process::exit(1);
        }
    };
    logging::info!(log, "running in proxy mode"; "destination" => %destination);
    let handle = proxy.start();
    let _ = handle.join();
}
