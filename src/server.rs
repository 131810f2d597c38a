//! TCP listener and accept loop for the relay.
//!
//! Thread-per-connection with blocking I/O: the accept loop registers each
//! new socket and hands it to its own handler thread. Shared state lives in
//! [`RelayState`], which the admin console reads as well.

use crate::cache::LastMessageCache;
use crate::config::ServerConfig;
use crate::handler::ClientHandler;
use crate::registry::ConnectionRegistry;
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// State shared by the accept loop, every handler and the console.
pub struct RelayState {
    pub registry: ConnectionRegistry,
    pub cache: LastMessageCache,
    pub expected_version: u8,
}

impl RelayState {
    pub fn new(expected_version: u8) -> Self {
        Self {
            registry: ConnectionRegistry::new(),
            cache: LastMessageCache::new(),
            expected_version,
        }
    }
}

/// Server instance
pub struct Server {
    listener: TcpListener,
    state: Arc<RelayState>,
    write_timeout: Option<Duration>,
}

impl Server {
    /// Bind the listening socket.
    pub fn bind(config: &ServerConfig) -> io::Result<Self> {
        let listener = create_listener(config.listen, config.backlog)?;
        let write_timeout = match config.write_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        };

        Ok(Self {
            listener,
            state: Arc::new(RelayState::new(config.protocol_version)),
            write_timeout,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn state(&self) -> Arc<RelayState> {
        Arc::clone(&self.state)
    }

    /// Accept connections until the listener fails.
    pub fn run(self) -> io::Result<()> {
        info!(address = %self.local_addr()?, "Server listening");

        loop {
            match self.listener.accept() {
                Ok((stream, addr)) => self.admit(stream, addr),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                    return Err(e);
                }
            }
        }
    }

    /// Run the accept loop on its own thread.
    pub fn spawn(self) -> io::Result<JoinHandle<io::Result<()>>> {
        thread::Builder::new()
            .name("acceptor".to_string())
            .spawn(move || self.run())
    }

    fn admit(&self, stream: TcpStream, addr: SocketAddr) {
        info!(peer = %addr, "New connection");

        if let Err(e) = stream.set_write_timeout(self.write_timeout) {
            warn!(peer = %addr, error = %e, "Failed to set write timeout");
        }

        let writer = match stream.try_clone() {
            Ok(writer) => writer,
            Err(e) => {
                error!(peer = %addr, error = %e, "Failed to clone socket, dropping connection");
                return;
            }
        };

        let id = self.state.registry.register(writer, addr);
        let handler = ClientHandler::new(id, addr, stream, Arc::clone(&self.state));

        let spawned = thread::Builder::new()
            .name(format!("client-{addr}"))
            .spawn(move || {
                let end = handler.run();
                debug!(peer = %addr, state = ?end, "Handler finished");
            });

        if let Err(e) = spawned {
            error!(peer = %addr, error = %e, "Failed to spawn handler thread");
            self.state.registry.unregister(id);
        }
    }
}

fn create_listener(addr: SocketAddr, backlog: i32) -> io::Result<TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{read_frame, write_frame, Frame, PROTOCOL_VERSION};
    use std::time::Instant;

    fn test_config() -> ServerConfig {
        ServerConfig {
            listen: "127.0.0.1:0".parse().unwrap(),
            backlog: 16,
            write_timeout_ms: 1000,
            protocol_version: PROTOCOL_VERSION,
            log_level: "info".to_string(),
        }
    }

    fn wait_for_clients(state: &RelayState, n: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while state.registry.len() != n {
            assert!(Instant::now() < deadline, "timed out waiting for {n} clients");
            thread::sleep(Duration::from_millis(10));
        }
    }

    fn connect(addr: SocketAddr) -> TcpStream {
        let stream = TcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_millis(500)))
            .unwrap();
        stream
    }

    #[test]
    fn test_server_creation() {
        let server = Server::bind(&test_config()).unwrap();
        assert!(server.local_addr().unwrap().port() != 0);
        assert!(server.state().registry.is_empty());
        assert!(server.state().cache.latest().is_none());
    }

    #[test]
    fn test_broadcast_and_reverse_scenario() {
        let server = Server::bind(&test_config()).unwrap();
        let addr = server.local_addr().unwrap();
        let state = server.state();
        server.spawn().unwrap();

        let mut a = connect(addr);
        let mut b = connect(addr);
        wait_for_clients(&state, 2);

        let (ping, _) = Frame::with_text(PROTOCOL_VERSION, 77, "ping");
        write_frame(&mut a, &ping).unwrap();

        let got = read_frame(&mut b).unwrap().unwrap();
        assert_eq!(got.kind, 77);
        assert_eq!(got.payload_text(), "ping");

        let (abc, _) = Frame::with_text(PROTOCOL_VERSION, 201, "abc");
        write_frame(&mut a, &abc).unwrap();

        // Frames on one connection are handled in order, so the first thing A
        // sees is the reply to its second frame: its own broadcast never
        // came back.
        let reply = read_frame(&mut a).unwrap().unwrap();
        assert_eq!(reply.kind, 201);
        assert_eq!(reply.payload_text(), "cba");

        assert!(read_frame(&mut b).is_err());
        assert_eq!(state.cache.latest().unwrap().frame, abc);
    }

    #[test]
    fn test_disconnect_removes_client() {
        let server = Server::bind(&test_config()).unwrap();
        let addr = server.local_addr().unwrap();
        let state = server.state();
        server.spawn().unwrap();

        let a = connect(addr);
        let _b = connect(addr);
        wait_for_clients(&state, 2);

        drop(a);
        wait_for_clients(&state, 1);
        assert_eq!(state.registry.snapshot().len(), 1);
    }

    #[test]
    fn test_stalled_client_dropped_after_write_timeout() {
        let mut config = test_config();
        config.write_timeout_ms = 100;
        let server = Server::bind(&config).unwrap();
        let addr = server.local_addr().unwrap();
        let state = server.state();
        server.spawn().unwrap();

        let mut sender = connect(addr);
        sender
            .set_write_timeout(Some(Duration::from_secs(2)))
            .unwrap();

        // A small receive window that is never drained.
        let stalled = socket2::Socket::new(
            socket2::Domain::IPV4,
            socket2::Type::STREAM,
            Some(socket2::Protocol::TCP),
        )
        .unwrap();
        stalled.set_recv_buffer_size(4096).unwrap();
        stalled.connect(&addr.into()).unwrap();
        let stalled: TcpStream = stalled.into();
        wait_for_clients(&state, 2);

        let (frame, _) = Frame::with_text(PROTOCOL_VERSION, 77, "flood");
        let deadline = Instant::now() + Duration::from_secs(10);
        while state.registry.len() == 2 {
            assert!(Instant::now() < deadline, "stalled client was never dropped");
            write_frame(&mut sender, &frame).unwrap();
        }

        let peers = state.registry.snapshot();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].addr, sender.local_addr().unwrap());
        drop(stalled);
    }

    #[test]
    fn test_short_frame_closes_connection() {
        use std::io::Write;

        let server = Server::bind(&test_config()).unwrap();
        let addr = server.local_addr().unwrap();
        let state = server.state();
        server.spawn().unwrap();

        let mut a = connect(addr);
        wait_for_clients(&state, 1);

        let bytes = Frame::with_text(PROTOCOL_VERSION, 77, "cut").0.encode();
        a.write_all(&bytes[..10]).unwrap();
        a.shutdown(std::net::Shutdown::Write).unwrap();

        wait_for_clients(&state, 0);
        assert!(state.cache.latest().is_none());
    }
}
