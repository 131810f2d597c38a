//! Operator console for the relay server.
//!
//! Reads one command per line:
//!
//! | command   | effect                                          |
//! |-----------|-------------------------------------------------|
//! | `msg`     | print the last received message                 |
//! | `clients` | print the number of clients and their addresses |
//! | `exit`    | close every connection and stop the server      |
//!
//! The console never touches client sockets for I/O; it only copies data
//! out of the cache and registry and prints after the locks are released.

use crate::server::RelayState;
use std::io::{self, BufRead, Write};
use tracing::{debug, info};

const PROMPT: &str = "Please enter command: ";

/// Parsed console command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Msg,
    Clients,
    Exit,
    Invalid(String),
}

impl ConsoleCommand {
    pub fn parse(line: &str) -> Self {
        match line.trim() {
            "msg" => ConsoleCommand::Msg,
            "clients" => ConsoleCommand::Clients,
            "exit" => ConsoleCommand::Exit,
            other => ConsoleCommand::Invalid(other.to_string()),
        }
    }
}

/// Why the console loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleExit {
    /// The operator asked to stop the server.
    Exit,
    /// Operator input ended.
    InputClosed,
}

/// Interactive command loop over any line source and sink.
pub struct Console<'a, R, W> {
    state: &'a RelayState,
    input: R,
    output: W,
}

impl<'a, R: BufRead, W: Write> Console<'a, R, W> {
    pub fn new(state: &'a RelayState, input: R, output: W) -> Self {
        Self {
            state,
            input,
            output,
        }
    }

    /// Prompt and execute commands until `exit` or end of input.
    pub fn run(&mut self) -> io::Result<ConsoleExit> {
        let mut line = String::new();

        loop {
            write!(self.output, "{PROMPT}")?;
            self.output.flush()?;

            line.clear();
            if self.input.read_line(&mut line)? == 0 {
                writeln!(self.output)?;
                return Ok(ConsoleExit::InputClosed);
            }

            let command = ConsoleCommand::parse(&line);
            debug!(?command, "Console command");

            if self.execute(&command)? {
                return Ok(ConsoleExit::Exit);
            }
        }
    }

    /// Run one command. Returns `true` when the server should stop.
    pub fn execute(&mut self, command: &ConsoleCommand) -> io::Result<bool> {
        match command {
            ConsoleCommand::Msg => {
                match self.state.cache.latest() {
                    Some(cached) => {
                        writeln!(self.output, "Last Message: {}", cached.frame.payload_text())?;
                        writeln!(
                            self.output,
                            "  from {} at {}",
                            cached.from,
                            cached.received_at.format("%Y-%m-%d %H:%M:%S")
                        )?;
                    }
                    None => writeln!(self.output, "No message received yet.")?,
                }
                Ok(false)
            }
            ConsoleCommand::Clients => {
                let peers = self.state.registry.snapshot();
                writeln!(self.output, "Number of Clients: {}", peers.len())?;
                for peer in peers {
                    writeln!(
                        self.output,
                        "IP Address: {} | Port: {}",
                        peer.addr.ip(),
                        peer.addr.port()
                    )?;
                }
                Ok(false)
            }
            ConsoleCommand::Exit => {
                let closed = self.state.registry.close_all();
                info!(closed, "Closed all client connections");
                Ok(true)
            }
            ConsoleCommand::Invalid(_) => {
                writeln!(self.output, "Invalid command")?;
                Ok(false)
            }
        }
    }
}
