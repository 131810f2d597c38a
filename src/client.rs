//! Terminal client endpoint.
//!
//! After connecting, a background thread prints every frame the server
//! sends while the foreground loop turns operator commands into frames:
//!
//! - `v <n>` sets the protocol version used for later sends
//! - `t <n> <text>` sends `text` with message type `n`
//! - `q` quits
//!
//! Quitting sets a stop flag and shuts the socket down, which wakes the
//! receiver out of its blocking read; the receiver is then joined.

use crate::frame::{read_frame, write_frame, Frame, FrameError, MAX_PAYLOAD_LEN};
use std::fmt;
use std::io::{self, BufRead, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

const PROMPT: &str = "Please enter command: ";

/// Parsed operator command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientCommand {
    SetVersion(u8),
    Send { kind: u8, text: String },
    Quit,
    Invalid(String),
}

impl ClientCommand {
    /// Parse one input line.
    ///
    /// For `t`, only the first space after the type token separates it from
    /// the text, so the text keeps any spaces it contains.
    pub fn parse(line: &str) -> Self {
        let line = line.trim_end_matches(['\r', '\n']);

        if line.trim() == "q" {
            return ClientCommand::Quit;
        }

        if let Some(rest) = line.strip_prefix("v ") {
            return match rest.trim().parse() {
                Ok(version) => ClientCommand::SetVersion(version),
                Err(_) => ClientCommand::Invalid(line.to_string()),
            };
        }

        if let Some(rest) = line.strip_prefix("t ") {
            let (kind, text) = rest.split_once(' ').unwrap_or((rest, ""));
            return match kind.parse() {
                Ok(kind) => ClientCommand::Send {
                    kind,
                    text: text.to_string(),
                },
                Err(_) => ClientCommand::Invalid(line.to_string()),
            };
        }

        ClientCommand::Invalid(line.to_string())
    }
}

/// Something the receiver loop observed.
#[derive(Debug)]
pub enum ReceiverEvent {
    Frame(Frame),
    Disconnected,
    Failed(FrameError),
}

impl fmt::Display for ReceiverEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReceiverEvent::Frame(frame) => write!(
                f,
                "Received Msg Type: {}; Msg: {}",
                frame.kind,
                frame.payload_text()
            ),
            ReceiverEvent::Disconnected => write!(f, "Server disconnected"),
            ReceiverEvent::Failed(e) => write!(f, "Error receiving message: {e}"),
        }
    }
}

/// Read frames until the stream ends, reporting each to `sink`.
///
/// Once `stop` is set, the close that follows is not reported.
pub fn receive_loop<R, F>(mut reader: R, stop: &AtomicBool, mut sink: F)
where
    R: Read,
    F: FnMut(ReceiverEvent),
{
    loop {
        let event = match read_frame(&mut reader) {
            Ok(Some(frame)) => {
                sink(ReceiverEvent::Frame(frame));
                continue;
            }
            Ok(None) => ReceiverEvent::Disconnected,
            Err(e) => ReceiverEvent::Failed(e),
        };

        if stop.load(Ordering::Acquire) {
            debug!("Receiver stopped");
        } else {
            sink(event);
        }
        return;
    }
}

/// A connected client session.
pub struct Client {
    stream: TcpStream,
    version: u8,
    stop: Arc<AtomicBool>,
    receiver: Option<JoinHandle<()>>,
}

impl Client {
    pub fn connect(addr: SocketAddr, version: u8) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr).map_err(|e| ClientError::Connect(addr, e))?;
        info!(server = %addr, "Connected");

        Ok(Self {
            stream,
            version,
            stop: Arc::new(AtomicBool::new(false)),
            receiver: None,
        })
    }

    /// Protocol version stamped on outgoing frames.
    pub fn version(&self) -> u8 {
        self.version
    }

    /// Start the background receiver, handing every event to `sink`.
    pub fn spawn_receiver<F>(&mut self, sink: F) -> Result<(), ClientError>
    where
        F: FnMut(ReceiverEvent) + Send + 'static,
    {
        let reader = self.stream.try_clone()?;
        let stop = Arc::clone(&self.stop);
        let handle = thread::Builder::new()
            .name("receiver".to_string())
            .spawn(move || receive_loop(reader, &stop, sink))?;
        self.receiver = Some(handle);
        Ok(())
    }

    /// Build and send one frame. Returns `true` if the text was truncated.
    pub fn send(&mut self, kind: u8, text: &str) -> Result<bool, ClientError> {
        let (frame, truncated) = Frame::with_text(self.version, kind, text);
        write_frame(&mut self.stream, &frame)?;
        debug!(kind, length = frame.length, "Frame sent");
        Ok(truncated)
    }

    /// Run one command. Returns `true` when the session should end.
    ///
    /// A frame that cannot be sent is reported on `output` and the session
    /// carries on; only failures writing to `output` are returned.
    pub fn execute<W: Write>(
        &mut self,
        command: &ClientCommand,
        output: &mut W,
    ) -> Result<bool, ClientError> {
        match command {
            ClientCommand::SetVersion(version) => {
                self.version = *version;
                debug!(version, "Protocol version changed");
            }
            ClientCommand::Send { kind, text } => match self.send(*kind, text) {
                Ok(true) => writeln!(output, "Message truncated to {MAX_PAYLOAD_LEN} bytes")?,
                Ok(false) => {}
                Err(e) => {
                    warn!(error = %e, "Send failed");
                    writeln!(output, "Error sending message: {e}")?;
                }
            },
            ClientCommand::Quit => return Ok(true),
            ClientCommand::Invalid(_) => writeln!(output, "Invalid command")?,
        }
        Ok(false)
    }

    /// Prompt and execute commands until `q` or end of input.
    pub fn run<R: BufRead, W: Write>(
        &mut self,
        mut input: R,
        mut output: W,
    ) -> Result<(), ClientError> {
        let mut line = String::new();

        loop {
            write!(output, "{PROMPT}")?;
            output.flush()?;

            line.clear();
            if input.read_line(&mut line)? == 0 {
                writeln!(output)?;
                return Ok(());
            }

            if self.execute(&ClientCommand::parse(&line), &mut output)? {
                return Ok(());
            }
        }
    }

    /// Stop the receiver, close the socket and wait for the receiver to end.
    pub fn close(mut self) {
        self.stop.store(true, Ordering::Release);
        if let Err(e) = self.stream.shutdown(Shutdown::Both) {
            debug!(error = %e, "Shutdown failed");
        }
        if let Some(handle) = self.receiver.take() {
            if handle.join().is_err() {
                warn!("Receiver thread panicked");
            }
        }
    }
}

/// Client errors
#[derive(Debug)]
pub enum ClientError {
    Connect(SocketAddr, io::Error),
    Io(io::Error),
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientError::Connect(addr, e) => write!(f, "Error connecting to server {addr}: {e}"),
            ClientError::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for ClientError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ClientError::Connect(_, e) | ClientError::Io(e) => Some(e),
        }
    }
}

impl From<io::Error> for ClientError {
    fn from(e: io::Error) -> Self {
        ClientError::Io(e)
    }
}
