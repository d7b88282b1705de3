//! The server binary: reads `./config.ini`, wires up the logger, and
//! serves until killed. Exits non-zero when startup fails.

use std::process::ExitCode;

use erebus::logger::AsyncLogger;
use erebus::{Server, ServerConfig, StatusCode};

const CONFIG_PATH: &str = "./config.ini";

fn main() -> ExitCode {
    let config = match ServerConfig::from_file(CONFIG_PATH) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("cannot load {CONFIG_PATH}: {err}");
            return ExitCode::FAILURE;
        }
    };

    let builder = if config.log_path.is_empty() {
        AsyncLogger::to_stderr()
    } else {
        match AsyncLogger::to_file(&config.log_path) {
            Ok(builder) => builder,
            Err(err) => {
                eprintln!("cannot open log file {:?}: {err}", config.log_path);
                return ExitCode::FAILURE;
            }
        }
    };
    let logger = match builder.level(config.log_level).build().install() {
        Ok(logger) => logger,
        Err(err) => {
            eprintln!("cannot install logger: {err}");
            return ExitCode::FAILURE;
        }
    };

    let exit = run(&config);
    logger.shutdown();
    exit
}

fn run(config: &ServerConfig) -> ExitCode {
    let server = match Server::with_config(config) {
        Ok(server) => server,
        Err(err) => {
            log::error!("cannot create server: {err}");
            return ExitCode::FAILURE;
        }
    };

    let registered = server.handle("/", |resp, _req| {
        resp.set_version("1.1");
        resp.set_status_code(StatusCode::Ok);
        resp.header_mut().set("Content-Type", "text/plain");
        resp.write_str("erebus is up\n");
    });
    if let Err(err) = registered {
        log::error!("cannot register handler: {err}");
        return ExitCode::FAILURE;
    }

    let address = config.address.to_string();
    let address = if address == "0.0.0.0" { "" } else { &address };
    if let Err(err) = server.listen_with_backlog(config.port, address, config.backlog) {
        log::error!("cannot listen on {}:{}: {err}", config.address, config.port);
        return ExitCode::FAILURE;
    }

    match server.start() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("server failed: {err}");
            ExitCode::FAILURE
        }
    }
}
