//! Actions taken for validated frames.
//!
//! - Broadcast (77): forward the frame unchanged to every other client.
//! - Reverse (201): reverse the declared payload and send it back to the
//!   sender only.

use crate::frame::{Frame, FrameError, MessageType};
use crate::registry::{BroadcastReport, ConnectionId, ConnectionRegistry};
use tracing::{debug, info};

/// What the dispatcher did with a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatched {
    Broadcast(BroadcastReport),
    Reversed,
}

/// Routes frames through the connection registry.
pub struct Dispatcher<'a> {
    registry: &'a ConnectionRegistry,
}

impl<'a> Dispatcher<'a> {
    pub fn new(registry: &'a ConnectionRegistry) -> Self {
        Self { registry }
    }

    /// Run the action for `kind`.
    ///
    /// An `Io` error means the reply to `origin` could not be written.
    pub fn dispatch(
        &self,
        kind: MessageType,
        frame: Frame,
        origin: ConnectionId,
    ) -> Result<Dispatched, FrameError> {
        match kind {
            MessageType::Broadcast => Ok(Dispatched::Broadcast(self.broadcast(&frame, origin))),
            MessageType::Reverse => {
                self.reverse_echo(frame, origin)?;
                Ok(Dispatched::Reversed)
            }
        }
    }

    /// Forward `frame` as received to everyone except `origin`.
    pub fn broadcast(&self, frame: &Frame, origin: ConnectionId) -> BroadcastReport {
        info!(msg = %frame.payload_text(), "Broadcasting message");
        let report = self.registry.broadcast(frame, origin);
        debug!(
            delivered = report.delivered,
            failed = report.failed,
            "Broadcast complete"
        );
        report
    }

    /// Reverse the first `length` payload bytes and reply to `origin`.
    pub fn reverse_echo(&self, mut frame: Frame, origin: ConnectionId) -> Result<(), FrameError> {
        info!(msg = %frame.payload_text(), "Reversing message");
        frame.reverse_payload()?;
        self.registry.send_to(origin, &frame)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{read_frame, PROTOCOL_VERSION};
    use std::net::{TcpListener, TcpStream};
    use std::time::Duration;

    fn connect(listener: &TcpListener, registry: &ConnectionRegistry) -> (ConnectionId, TcpStream) {
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        client
            .set_read_timeout(Some(Duration::from_millis(200)))
            .unwrap();
        let (server, addr) = listener.accept().unwrap();
        (registry.register(server, addr), client)
    }

    #[test]
    fn test_reverse_echo_replies_to_sender_only() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let registry = ConnectionRegistry::new();
        let (a, mut client_a) = connect(&listener, &registry);
        let (_b, mut client_b) = connect(&listener, &registry);

        let (frame, _) = Frame::with_text(PROTOCOL_VERSION, 201, "hello");
        let outcome = Dispatcher::new(&registry)
            .dispatch(MessageType::Reverse, frame, a)
            .unwrap();
        assert_eq!(outcome, Dispatched::Reversed);

        let reply = read_frame(&mut client_a).unwrap().unwrap();
        assert_eq!(&reply.payload[..5], b"olleh");
        assert_eq!(reply.length, 5);
        assert_eq!(reply.kind, 201);

        assert!(read_frame(&mut client_b).is_err());
    }

    #[test]
    fn test_broadcast_forwards_unmodified() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let registry = ConnectionRegistry::new();
        let (a, _client_a) = connect(&listener, &registry);
        let (_b, mut client_b) = connect(&listener, &registry);

        let (mut frame, _) = Frame::with_text(PROTOCOL_VERSION, 77, "ping");
        frame.payload[10] = 0xAB;

        let outcome = Dispatcher::new(&registry)
            .dispatch(MessageType::Broadcast, frame.clone(), a)
            .unwrap();
        assert_eq!(
            outcome,
            Dispatched::Broadcast(BroadcastReport {
                delivered: 1,
                failed: 0
            })
        );
        assert_eq!(read_frame(&mut client_b).unwrap(), Some(frame));
    }

    #[test]
    fn test_reverse_echo_to_departed_client_fails() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let registry = ConnectionRegistry::new();
        let (a, _client_a) = connect(&listener, &registry);
        registry.unregister(a);

        let (frame, _) = Frame::with_text(PROTOCOL_VERSION, 201, "abc");
        let result = Dispatcher::new(&registry).reverse_echo(frame, a);
        assert!(matches!(result, Err(FrameError::Io(_))));
    }
}
