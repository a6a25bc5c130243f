//! Webspace RPC wire protocol
//!
//! Every message travels in a length-prefixed frame so that calls and
//! replies can be delimited on a stream socket:
//!
//! ```text
//! ┌────────────┬──────────────┬──────────────────────┐
//! │   Length   │  Message ID  │   Payload (JSON)     │
//! │  (4 bytes) │  (4 bytes)   │  (variable length)   │
//! └────────────┴──────────────┴──────────────────────┘
//! ```
//!
//! Length is little-endian and counts the message ID plus the payload. The
//! reply to a call reuses the call's message ID.

use crate::error::{Error, Fault, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::{self, Read, Write};

/// Maximum frame size (10MB to prevent memory exhaustion)
const MAX_MESSAGE_SIZE: u32 = 10 * 1024 * 1024;

/// Message ID counter type (request/response correlation)
pub type MessageId = u32;

/// Message envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Message {
    /// Client invokes a method
    Call(Call),
    /// Server answers the call with the same message ID
    Reply(Reply),
}

/// A method invocation (Client → Daemon)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Call {
    /// Registered method name
    pub method: String,
    /// Positional arguments
    #[serde(default)]
    pub args: Vec<Value>,
    /// Account to act as; only honoured for administrators
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub impersonate: Option<String>,
}

impl Call {
    pub fn new(method: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            method: method.into(),
            args,
            impersonate: None,
        }
    }

    /// Request that the daemon act as `user` for this call
    pub fn impersonating(mut self, user: Option<String>) -> Self {
        self.impersonate = user;
        self
    }
}

/// Outcome of a call (Daemon → Client)
///
/// Either a success value (`null` when the method has nothing to return) or
/// a fault; the enum makes "both" and "neither" unrepresentable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reply {
    Ok(Value),
    Fault(Fault),
}

impl Reply {
    pub fn into_result(self) -> Result<Value> {
        match self {
            Reply::Ok(value) => Ok(value),
            Reply::Fault(fault) => Err(fault.into()),
        }
    }
}

impl From<Result<Value>> for Reply {
    fn from(result: Result<Value>) -> Self {
        match result {
            Ok(value) => Reply::Ok(value),
            Err(e) => Reply::Fault(e.to_fault()),
        }
    }
}

/// Encode a message into the wire format
///
/// Format: [4-byte length][4-byte message ID][JSON payload]
pub fn encode_message(message: &Message, message_id: MessageId) -> Result<Vec<u8>> {
    let payload = serde_json::to_vec(message)
        .map_err(|e| Error::Protocol(format!("Failed to serialize message: {}", e)))?;

    let payload_len = u32::try_from(payload.len())
        .ok()
        .filter(|len| *len <= MAX_MESSAGE_SIZE - 4)
        .ok_or_else(|| Error::Protocol(format!("Message too large: {} bytes", payload.len())))?;

    let mut buffer = Vec::with_capacity(8 + payload.len());
    buffer.extend_from_slice(&(payload_len + 4).to_le_bytes());
    buffer.extend_from_slice(&message_id.to_le_bytes());
    buffer.extend_from_slice(&payload);

    Ok(buffer)
}

/// Decode one message from a reader
///
/// A clean EOF before the first byte is `ConnectionLost`; anything that
/// starts a frame but does not complete a valid one is `Protocol`.
pub fn decode_message<R: Read>(reader: &mut R) -> Result<(Message, MessageId)> {
    let mut len_bytes = [0u8; 4];
    let mut filled = 0;
    while filled < len_bytes.len() {
        match reader.read(&mut len_bytes[filled..]) {
            Ok(0) if filled == 0 => return Err(Error::ConnectionLost),
            Ok(0) => return Err(Error::Protocol("Truncated length prefix".to_string())),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(Error::Io(e)),
        }
    }
    let frame_len = u32::from_le_bytes(len_bytes);

    if frame_len < 4 {
        return Err(Error::Protocol("Message length too small".to_string()));
    }
    if frame_len > MAX_MESSAGE_SIZE {
        return Err(Error::Protocol(format!("Message too large: {} bytes", frame_len)));
    }

    let mut frame = vec![0u8; frame_len as usize];
    reader.read_exact(&mut frame).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => Error::Protocol("Truncated frame".to_string()),
        _ => Error::Io(e),
    })?;

    let (id_bytes, payload) = frame.split_at(4);
    let message_id = u32::from_le_bytes([id_bytes[0], id_bytes[1], id_bytes[2], id_bytes[3]]);

    let message: Message = serde_json::from_slice(payload)
        .map_err(|e| Error::Protocol(format!("Malformed payload: {}", e)))?;

    Ok((message, message_id))
}

/// Write a message to a stream
pub fn write_message<W: Write>(
    writer: &mut W,
    message: &Message,
    message_id: MessageId,
) -> Result<()> {
    let bytes = encode_message(message, message_id)?;
    writer.write_all(&bytes)?;
    writer.flush()?;
    Ok(())
}

/// Read a message from a stream
pub fn read_message<R: Read>(reader: &mut R) -> Result<(Message, MessageId)> {
    decode_message(reader)
}
