//! Length-prefixed framing over a blocking byte pipe.
//!
//! Frame layout: `u32` big-endian payload length, then that many bytes of
//! UTF-8 JSON. Lengths of zero or above [`MAX_MESSAGE_SIZE`] are protocol
//! violations.

use crate::{into_inner_or_recover, lock_or_recover};
use serde::Serialize;
use serde_json::Value;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use super::protocol::{HEADER_SIZE, JSONRPC_VERSION, MAX_MESSAGE_SIZE};

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,
    #[error("received zero-length frame header")]
    ZeroLength,
    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    TooLarge { len: usize, max: usize },
    #[error("malformed JSON payload: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("transport i/o failed: {0}")]
    Io(#[from] io::Error),
}

impl TransportError {
    /// Whether a read that failed this way leaves the stream unusable.
    ///
    /// A malformed payload still consumed exactly one frame, so the next
    /// header is where the peer expects it.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, TransportError::Malformed(_))
    }
}

// ============================================================================
// Frame Codec
// ============================================================================

/// Serialize `message`, adding `"jsonrpc": "2.0"` when it is an object without one.
pub fn encode_message<T: Serialize + ?Sized>(message: &T) -> Result<Vec<u8>, TransportError> {
    let mut value = serde_json::to_value(message)?;
    if let Value::Object(map) = &mut value {
        map.entry("jsonrpc")
            .or_insert_with(|| Value::String(JSONRPC_VERSION.to_string()));
    }
    Ok(serde_json::to_vec(&value)?)
}

/// Prefix `payload` with its length header.
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>, TransportError> {
    if payload.len() > MAX_MESSAGE_SIZE {
        return Err(TransportError::TooLarge {
            len: payload.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }
    let mut frame = Vec::with_capacity(HEADER_SIZE + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

pub fn decode_length(header: [u8; HEADER_SIZE]) -> usize {
    u32::from_be_bytes(header) as usize
}

fn read_exact_or_closed<R: Read + ?Sized>(
    reader: &mut R,
    buf: &mut [u8],
) -> Result<(), TransportError> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => Err(TransportError::Closed),
        Err(err) => Err(TransportError::Io(err)),
    }
}

/// Read one frame and parse its payload.
///
/// The payload is never read when the header is out of range.
pub fn read_frame<R: Read + ?Sized>(reader: &mut R) -> Result<Value, TransportError> {
    let mut header = [0u8; HEADER_SIZE];
    read_exact_or_closed(reader, &mut header)?;

    let len = decode_length(header);
    if len == 0 {
        return Err(TransportError::ZeroLength);
    }
    if len > MAX_MESSAGE_SIZE {
        return Err(TransportError::TooLarge {
            len,
            max: MAX_MESSAGE_SIZE,
        });
    }

    let mut payload = vec![0u8; len];
    read_exact_or_closed(reader, &mut payload)?;
    Ok(serde_json::from_slice(&payload)?)
}

/// Encode and write one frame as a single write, then flush.
///
/// Returns the payload length. Nothing is written when encoding fails.
pub fn write_frame<W: Write + ?Sized, T: Serialize + ?Sized>(
    writer: &mut W,
    message: &T,
) -> Result<usize, TransportError> {
    let payload = encode_message(message)?;
    let frame = encode_frame(&payload)?;
    writer.write_all(&frame)?;
    writer.flush()?;
    Ok(payload.len())
}

// ============================================================================
// Transport
// ============================================================================

/// Anything a handler can push outbound messages through.
pub trait MessageSink {
    fn send_message(&self, message: &Value) -> Result<(), TransportError>;
}

/// Bidirectional framed transport.
///
/// Reads and writes take separate locks, so a reader blocked on the
/// inbound pipe never holds up a writer.
pub struct Transport<R, W> {
    reader: Mutex<R>,
    writer: Mutex<W>,
    closed: AtomicBool,
}

pub type StdioTransport = Transport<io::Stdin, io::Stdout>;

impl StdioTransport {
    pub fn stdio() -> Self {
        Transport::new(io::stdin(), io::stdout())
    }
}

impl<R: Read, W: Write> Transport<R, W> {
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            closed: AtomicBool::new(false),
        }
    }

    /// Block until one message arrives.
    ///
    /// Any fatal failure closes the transport permanently.
    pub fn read_message(&self) -> Result<Value, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let mut reader = lock_or_recover(&self.reader, "transport reader");
        match read_frame(&mut *reader) {
            Ok(message) => Ok(message),
            Err(err) => {
                if err.is_fatal() {
                    self.close();
                }
                Err(err)
            }
        }
    }

    pub fn write_message<T: Serialize + ?Sized>(&self, message: &T) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let mut writer = lock_or_recover(&self.writer, "transport writer");
        write_frame(&mut *writer, message).map(|_| ())
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn into_inner(self) -> (R, W) {
        (
            into_inner_or_recover(self.reader, "transport reader"),
            into_inner_or_recover(self.writer, "transport writer"),
        )
    }
}

impl<R: Read, W: Write> MessageSink for Transport<R, W> {
    fn send_message(&self, message: &Value) -> Result<(), TransportError> {
        self.write_message(message)
    }
}
