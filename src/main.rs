//! frame-relay server
//!
//! Runs the accept loop on its own thread and the operator console on
//! another; `exit` on the console closes every client and ends the process.

use frame_relay::config::ServerConfig;
use frame_relay::console::{Console, ConsoleExit};
use frame_relay::server::Server;
use std::io;
use std::process::ExitCode;
use std::thread;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Server failed");
            eprintln!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = ServerConfig::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    info!(
        listen = %config.listen,
        protocol_version = config.protocol_version,
        write_timeout_ms = config.write_timeout_ms,
        backlog = config.backlog,
        "Starting frame-relay server"
    );

    let server = Server::bind(&config)?;
    println!("Server is listening on {}", server.local_addr()?);

    let state = server.state();
    let acceptor = server.spawn()?;

    let console = thread::Builder::new()
        .name("console".to_string())
        .spawn(move || {
            let stdin = io::stdin();
            Console::new(&state, stdin.lock(), io::stdout()).run()
        })?;

    match console.join() {
        Ok(Ok(ConsoleExit::Exit)) => {
            info!("Shutting down");
            std::process::exit(0);
        }
        Ok(Ok(ConsoleExit::InputClosed)) => {
            info!("Console input closed, serving until terminated");
        }
        Ok(Err(e)) => {
            error!(error = %e, "Console failed, serving until terminated");
        }
        Err(_) => error!("Console thread panicked, serving until terminated"),
    }

    match acceptor.join() {
        Ok(result) => Ok(result?),
        Err(_) => Err("accept loop panicked".into()),
    }
}
