//! relay-client: terminal front end for frame-relay
//!
//! Usage: `relay-client <host> <port>`

use clap::Parser;
use frame_relay::client::Client;
use frame_relay::config::ClientArgs;
use std::io;
use std::process::ExitCode;
use tracing::error;
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    let args = ClientArgs::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Client failed");
            eprintln!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &ClientArgs) -> Result<(), Box<dyn std::error::Error>> {
    let addr = args.server_addr()?;
    let mut client = Client::connect(addr, args.protocol_version)?;

    client.spawn_receiver(|event| println!("{event}"))?;

    let stdin = io::stdin();
    let result = client.run(stdin.lock(), io::stdout());
    client.close();

    Ok(result?)
}
