//! Fixed-layout wire frame shared by the relay server and client.
//!
//! Every message on the wire is exactly [`FRAME_SIZE`] bytes:
//!
//! ```text
//! +---------+------+-----------------+----------------------------+
//! | version | type | length          | payload                    |
//! | u8      | u8   | u16 host order  | 1000 bytes, NUL-terminated |
//! +---------+------+-----------------+----------------------------+
//! ```
//!
//! The layout mirrors the in-memory record both peers were built against, so
//! `length` travels in host-native byte order. Both ends must run on hosts
//! with the same endianness; this is a closed two-party protocol.
//!
//! There is no reassembly: a reader fills one frame or fails. Nothing read
//! from the socket is carried over to the next frame.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use std::io::{self, Read, Write};

/// Protocol version the server accepts and the client starts with.
pub const PROTOCOL_VERSION: u8 = 102;

/// Size of the payload window on the wire.
pub const PAYLOAD_CAPACITY: usize = 1000;

/// Largest meaningful payload; one byte of the window is kept for the terminator.
pub const MAX_PAYLOAD_LEN: usize = PAYLOAD_CAPACITY - 1;

/// Size of the header (version, type, length).
pub const HEADER_SIZE: usize = 4;

/// Total size of one frame on the wire.
pub const FRAME_SIZE: usize = HEADER_SIZE + PAYLOAD_CAPACITY;

/// Recognised message kinds.
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MessageType {
    /// Forward the frame to every other connected client.
    Broadcast = 77,
    /// Reverse the payload and send it back to the sender only.
    Reverse = 201,
}

impl MessageType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            77 => Some(MessageType::Broadcast),
            201 => Some(MessageType::Reverse),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// One wire frame.
///
/// `kind` is kept as the raw byte so unknown types survive a round trip and
/// can be reported by the receiver. `length` is whatever the sender declared;
/// use [`Frame::declared_payload`] before trusting it.
#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
    pub version: u8,
    pub kind: u8,
    pub length: u16,
    pub payload: [u8; PAYLOAD_CAPACITY],
}

impl Frame {
    /// An all-zero frame.
    pub fn empty() -> Self {
        Self {
            version: 0,
            kind: 0,
            length: 0,
            payload: [0u8; PAYLOAD_CAPACITY],
        }
    }

    /// Build a frame carrying `text`.
    ///
    /// Text longer than [`MAX_PAYLOAD_LEN`] bytes is cut at the last character
    /// boundary that fits. The second value is `true` when that happened.
    pub fn with_text(version: u8, kind: u8, text: &str) -> (Self, bool) {
        let mut end = text.len().min(MAX_PAYLOAD_LEN);
        while !text.is_char_boundary(end) {
            end -= 1;
        }

        let mut frame = Self::empty();
        frame.version = version;
        frame.kind = kind;
        frame.payload[..end].copy_from_slice(&text.as_bytes()[..end]);
        frame.length = end as u16;

        (frame, end < text.len())
    }

    /// The recognised message type, if any.
    pub fn message_type(&self) -> Option<MessageType> {
        MessageType::from_u8(self.kind)
    }

    /// The first `length` payload bytes, provided `length` is in range.
    pub fn declared_payload(&self) -> Result<&[u8], FrameError> {
        let len = usize::from(self.length);
        if len > MAX_PAYLOAD_LEN {
            return Err(FrameError::LengthOutOfRange(self.length));
        }
        Ok(&self.payload[..len])
    }

    /// Payload up to the first NUL, for display.
    pub fn payload_text(&self) -> String {
        let end = self
            .payload
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(PAYLOAD_CAPACITY);
        String::from_utf8_lossy(&self.payload[..end]).into_owned()
    }

    /// Reverse the first `length` payload bytes in place.
    ///
    /// Bytes past `length` are left untouched.
    pub fn reverse_payload(&mut self) -> Result<(), FrameError> {
        let len = self.declared_payload()?.len();
        self.payload[..len].reverse();
        Ok(())
    }

    /// Serialize into a new buffer of exactly [`FRAME_SIZE`] bytes.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(FRAME_SIZE);
        self.encode_into(&mut buf);
        buf.freeze()
    }

    /// Append the wire form to `buf`.
    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.reserve(FRAME_SIZE);
        buf.put_u8(self.version);
        buf.put_u8(self.kind);
        buf.put_u16_ne(self.length);
        buf.put_slice(&self.payload);
    }

    /// Parse one frame from exactly [`FRAME_SIZE`] bytes.
    ///
    /// `length` is not checked here; that is the receiver's call.
    pub fn decode(mut input: &[u8]) -> Result<Self, FrameError> {
        if input.len() != FRAME_SIZE {
            return Err(FrameError::ShortFrame { received: input.len() });
        }

        let version = input.get_u8();
        let kind = input.get_u8();
        let length = input.get_u16_ne();
        let mut payload = [0u8; PAYLOAD_CAPACITY];
        input.copy_to_slice(&mut payload);

        Ok(Self {
            version,
            kind,
            length,
            payload,
        })
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("version", &self.version)
            .field("kind", &self.kind)
            .field("length", &self.length)
            .field("payload", &self.payload_text())
            .finish()
    }
}

/// Read exactly one frame.
///
/// Returns `Ok(None)` when the peer closed the stream before sending any byte
/// of a new frame. A stream that ends part way through a frame is an error.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Option<Frame>, FrameError> {
    let mut buf = [0u8; FRAME_SIZE];
    let mut filled = 0;

    while filled < FRAME_SIZE {
        match reader.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => return Err(FrameError::ShortFrame { received: filled }),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(FrameError::Io(e)),
        }
    }

    Frame::decode(&buf).map(Some)
}

/// Write one frame in full.
pub fn write_frame<W: Write>(writer: &mut W, frame: &Frame) -> io::Result<()> {
    writer.write_all(&frame.encode())?;
    writer.flush()
}

/// Frame-level errors.
#[derive(Debug)]
pub enum FrameError {
    /// The stream ended, or the buffer was cut, before a whole frame arrived.
    ShortFrame { received: usize },
    /// `length` points past the usable payload.
    LengthOutOfRange(u16),
    /// Transport failure while reading.
    Io(io::Error),
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::ShortFrame { received } => write!(
                f,
                "short frame: received {received} of {FRAME_SIZE} bytes"
            ),
            FrameError::LengthOutOfRange(len) => write!(
                f,
                "declared length {len} exceeds payload limit of {MAX_PAYLOAD_LEN}"
            ),
            FrameError::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for FrameError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FrameError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for FrameError {
    fn from(e: io::Error) -> Self {
        FrameError::Io(e)
    }
}
