use std::io::{self, BufRead};
use std::rc::Rc;

use tracing::{error, info};

use sigbridge::signal::{empty_args, NativeSlot};
use sigbridge::{Config, LocalHost, ScriptManager, SignalHost};

const DEFAULT_CONFIG: &str = "sigbridge.toml";

fn load_config(path: &str) -> Config {
    let mut config = match Config::load(path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load {path}: {e}");
            eprintln!("Using default configuration.");
            Config::default()
        }
    };
    config.apply_env_overrides();
    config
}

/// Feed one input line to the host: `/name args` runs a command, anything
/// else is raised as "send text".
fn handle_line(host: &LocalHost, line: &str) {
    if let Some(command) = line.strip_prefix('/') {
        let (name, data) = command.split_once(' ').unwrap_or((command, ""));
        if !host.run_command(name, data, None, None) {
            println!("Unknown command: {name}");
        }
    } else {
        let mut args = empty_args();
        args[0] = NativeSlot::Str(line.to_string());
        host.raw_emit("send text", 3, &mut args);
    }

    for message in host.take_diagnostics() {
        println!("! {message}");
    }
}

fn main() {
    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG.to_string());
    let config = load_config(&path);

    // Initialize logging
    if let Err(e) = sigbridge::logging::init(&config.logging) {
        eprintln!("Failed to initialize logging: {e}");
        // Fall back to console-only logging
        sigbridge::logging::init_console_only(&config.logging.level);
    }

    if let Err(e) = config.validate() {
        error!("Invalid configuration: {}", e);
        std::process::exit(1);
    }

    let host = Rc::new(LocalHost::new());
    let mut manager = match ScriptManager::new(&config, host.clone()) {
        Ok(manager) => manager,
        Err(e) => {
            error!("Failed to start signal bridge: {}", e);
            std::process::exit(1);
        }
    };

    let loaded = manager.autoload(&config.scripts.autoload);
    info!(
        "sigbridge ready: {} script(s) loaded from {}",
        loaded, config.scripts.path
    );

    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                error!("Failed to read input: {}", e);
                break;
            }
        };
        let line = line.trim_end();
        if line == "/quit" {
            break;
        }
        if !line.is_empty() {
            handle_line(&host, line);
        }
    }

    manager.shutdown();
    info!("sigbridge stopped");
}
