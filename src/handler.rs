//! Per-connection receive loop.
//!
//! Each accepted client gets one thread running [`ClientHandler::run`]:
//!
//! ```text
//! Connected -> Dispatching -> (next frame) -> ... -> Disconnected
//! ```
//!
//! Every full frame is written to the last-message cache first. Then the
//! version, type and declared length are checked in that order; a frame that
//! fails any check is logged and dropped, and the connection stays open. Only
//! transport failures and orderly closes end the loop.

use crate::dispatch::{Dispatched, Dispatcher};
use crate::frame::{read_frame, Frame, FrameError, MessageType, MAX_PAYLOAD_LEN};
use crate::registry::ConnectionId;
use crate::server::RelayState;
use std::fmt;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// Lifecycle of one client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Accepted and registered, no frame read yet.
    Connected,
    /// Reading and dispatching frames.
    Dispatching,
    /// Closed; the entry has been removed from the registry.
    Disconnected,
}

/// Reasons a frame is dropped without closing the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Violation {
    BadVersion { got: u8, expected: u8 },
    UnknownType(u8),
    LengthOutOfRange(u16),
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Violation::BadVersion { got, expected } => {
                write!(f, "invalid version {got} (expected {expected})")
            }
            Violation::UnknownType(kind) => write!(f, "invalid type {kind}"),
            Violation::LengthOutOfRange(len) => {
                write!(f, "declared length {len} exceeds {MAX_PAYLOAD_LEN}")
            }
        }
    }
}

/// What happened to a single frame.
#[derive(Debug)]
pub enum FrameOutcome {
    Dispatched(Dispatched),
    Dropped(Violation),
    /// Replying to the sender failed; the connection should be closed.
    Failed(FrameError),
}

/// Check a frame against the protocol.
pub fn validate(frame: &Frame, expected_version: u8) -> Result<MessageType, Violation> {
    if frame.version != expected_version {
        return Err(Violation::BadVersion {
            got: frame.version,
            expected: expected_version,
        });
    }

    let kind = frame
        .message_type()
        .ok_or(Violation::UnknownType(frame.kind))?;

    if usize::from(frame.length) > MAX_PAYLOAD_LEN {
        return Err(Violation::LengthOutOfRange(frame.length));
    }

    Ok(kind)
}

/// Cache, validate and dispatch one frame received from `origin`.
pub fn process_frame(
    state: &RelayState,
    origin: ConnectionId,
    from: SocketAddr,
    frame: Frame,
) -> FrameOutcome {
    // The cache lock is released before dispatch takes the registry lock.
    state.cache.store(&frame, from);

    let kind = match validate(&frame, state.expected_version) {
        Ok(kind) => kind,
        Err(violation) => {
            warn!(peer = %from, %violation, "Message ignored");
            return FrameOutcome::Dropped(violation);
        }
    };

    match Dispatcher::new(&state.registry).dispatch(kind, frame, origin) {
        Ok(done) => FrameOutcome::Dispatched(done),
        Err(e) => FrameOutcome::Failed(e),
    }
}

/// Receive loop for one connection.
pub struct ClientHandler {
    id: ConnectionId,
    addr: SocketAddr,
    stream: TcpStream,
    state: Arc<RelayState>,
    conn_state: ConnState,
}

impl ClientHandler {
    /// `id` must already be registered for this socket.
    pub fn new(
        id: ConnectionId,
        addr: SocketAddr,
        stream: TcpStream,
        state: Arc<RelayState>,
    ) -> Self {
        Self {
            id,
            addr,
            stream,
            state,
            conn_state: ConnState::Connected,
        }
    }

    pub fn conn_state(&self) -> ConnState {
        self.conn_state
    }

    fn transition(&mut self, next: ConnState) {
        trace!(peer = %self.addr, from = ?self.conn_state, to = ?next, "Connection state change");
        self.conn_state = next;
    }

    /// Serve frames until the peer closes or the socket fails.
    pub fn run(mut self) -> ConnState {
        self.transition(ConnState::Dispatching);

        loop {
            let frame = match read_frame(&mut self.stream) {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    info!(peer = %self.addr, "Client disconnected");
                    break;
                }
                Err(e) => {
                    warn!(peer = %self.addr, error = %e, "Read error, closing connection");
                    break;
                }
            };

            trace!(peer = %self.addr, ?frame, "Frame received");

            match process_frame(&self.state, self.id, self.addr, frame) {
                FrameOutcome::Dispatched(done) => {
                    debug!(peer = %self.addr, outcome = ?done, "Frame dispatched");
                }
                FrameOutcome::Dropped(_) => {}
                FrameOutcome::Failed(e) => {
                    warn!(peer = %self.addr, error = %e, "Reply failed, closing connection");
                    break;
                }
            }
        }

        self.close()
    }

    fn close(mut self) -> ConnState {
        self.state.registry.unregister(self.id);
        let _ = self.stream.shutdown(Shutdown::Both);
        self.transition(ConnState::Disconnected);
        self.conn_state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{write_frame, PROTOCOL_VERSION};
    use std::net::TcpListener;
    use std::thread;
    use std::time::Duration;

    struct Peer {
        id: ConnectionId,
        addr: SocketAddr,
        client: TcpStream,
    }

    fn connect(listener: &TcpListener, state: &RelayState) -> Peer {
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        client
            .set_read_timeout(Some(Duration::from_millis(200)))
            .unwrap();
        let (server, addr) = listener.accept().unwrap();
        let id = state.registry.register(server, addr);
        Peer { id, addr, client }
    }

    #[test]
    fn test_validate_order() {
        let (mut frame, _) = Frame::with_text(1, 99, "x");
        frame.length = 5000;
        assert_eq!(
            validate(&frame, PROTOCOL_VERSION),
            Err(Violation::BadVersion {
                got: 1,
                expected: PROTOCOL_VERSION
            })
        );

        frame.version = PROTOCOL_VERSION;
        assert_eq!(
            validate(&frame, PROTOCOL_VERSION),
            Err(Violation::UnknownType(99))
        );

        frame.kind = 77;
        assert_eq!(
            validate(&frame, PROTOCOL_VERSION),
            Err(Violation::LengthOutOfRange(5000))
        );

        frame.length = 1;
        assert_eq!(
            validate(&frame, PROTOCOL_VERSION),
            Ok(MessageType::Broadcast)
        );
    }

    #[test]
    fn test_bad_version_cached_but_not_dispatched() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let state = RelayState::new(PROTOCOL_VERSION);
        let a = connect(&listener, &state);
        let mut b = connect(&listener, &state);

        let (frame, _) = Frame::with_text(PROTOCOL_VERSION + 1, 77, "sneaky");
        let outcome = process_frame(&state, a.id, a.addr, frame.clone());
        assert!(matches!(
            outcome,
            FrameOutcome::Dropped(Violation::BadVersion { .. })
        ));

        let cached = state.cache.latest().unwrap();
        assert_eq!(cached.frame, frame);
        assert_eq!(cached.from, a.addr);
        assert!(read_frame(&mut b.client).is_err());
    }

    #[test]
    fn test_unknown_type_cached_and_dropped() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let state = RelayState::new(PROTOCOL_VERSION);
        let a = connect(&listener, &state);

        let (frame, _) = Frame::with_text(PROTOCOL_VERSION, 5, "huh");
        let outcome = process_frame(&state, a.id, a.addr, frame.clone());
        assert!(matches!(
            outcome,
            FrameOutcome::Dropped(Violation::UnknownType(5))
        ));
        assert_eq!(state.cache.latest().unwrap().frame, frame);
    }

    #[test]
    fn test_cache_tracks_most_recent_valid_frame() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let state = RelayState::new(PROTOCOL_VERSION);
        let mut a = connect(&listener, &state);

        let (first, _) = Frame::with_text(PROTOCOL_VERSION, 77, "first");
        let (second, _) = Frame::with_text(PROTOCOL_VERSION, 201, "second");
        process_frame(&state, a.id, a.addr, first);
        let outcome = process_frame(&state, a.id, a.addr, second.clone());
        assert!(matches!(
            outcome,
            FrameOutcome::Dispatched(Dispatched::Reversed)
        ));

        // The cache holds the frame as received, not the reversed reply.
        assert_eq!(state.cache.latest().unwrap().frame, second);
        let reply = read_frame(&mut a.client).unwrap().unwrap();
        assert_eq!(&reply.payload[..6], b"dnoces");
    }

    #[test]
    fn test_run_survives_violations_and_unregisters_on_close() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let state = Arc::new(RelayState::new(PROTOCOL_VERSION));

        let mut client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let (server, addr) = listener.accept().unwrap();
        let id = state.registry.register(server.try_clone().unwrap(), addr);

        let handler = ClientHandler::new(id, addr, server, Arc::clone(&state));
        assert_eq!(handler.conn_state(), ConnState::Connected);
        let worker = thread::spawn(move || handler.run());

        let (bad, _) = Frame::with_text(9, 201, "nope");
        write_frame(&mut client, &bad).unwrap();
        let (good, _) = Frame::with_text(PROTOCOL_VERSION, 201, "abc");
        write_frame(&mut client, &good).unwrap();

        let reply = read_frame(&mut client).unwrap().unwrap();
        assert_eq!(&reply.payload[..3], b"cba");

        client.shutdown(Shutdown::Both).unwrap();
        assert_eq!(worker.join().unwrap(), ConnState::Disconnected);
        assert!(state.registry.is_empty());
    }
}
