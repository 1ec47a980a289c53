//! Protocol codec
//!
//! Encoding and decoding functions for the wire protocol.
//!
//! ## Wire Format
//!
//! ### Request (Command) Format
//! ```text
//! ┌──────────┬──────────┬─────────────────────────────┐
//! │ Cmd (1)  │ Len (4)  │         Payload             │
//! └──────────┴──────────┴─────────────────────────────┘
//! ```
//!
//! ### Payload by Command Type
//! Strings and byte blobs are `len (4 bytes BE) + bytes`.
//! - GET:       key
//! - SET:       key + ttl_ms (8) + value
//! - DELETE:    key
//! - PING:      empty
//! - COMMIT:    n_checks (4) + [key + has_version (1) + version (8)?]
//!              + n_writes (4) + [tag (1) + key + (ttl_ms (8) + value)?]
//! - SCAN:      prefix
//! - PUBLISH:   channel + payload
//! - SUBSCRIBE: channel
//!
//! ### Response Format
//! ```text
//! ┌──────────┬──────────┬─────────────────────────────┐
//! │Status(1) │ Len (4)  │         Payload             │
//! └──────────┴──────────┴─────────────────────────────┘
//! ```

use std::io::{Read, Write};
use std::time::Duration;

use bytes::Bytes;

use crate::error::{PartyError, Result};
use crate::store::{Transaction, Version, WriteOp};
use super::{Command, Response, Status};

/// Header size: 1 byte command/status + 4 bytes length
pub const HEADER_SIZE: usize = 5;

/// Maximum payload size (16 MB)
pub const MAX_PAYLOAD_SIZE: u32 = 16 * 1024 * 1024;

const WRITE_PUT: u8 = 0x01;
const WRITE_DELETE: u8 = 0x02;

// =============================================================================
// Payload Builders
// =============================================================================

/// Appends length-prefixed fields to a payload
#[derive(Default)]
pub(crate) struct PayloadWriter {
    buf: Vec<u8>,
}

impl PayloadWriter {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn u8(mut self, value: u8) -> Self {
        self.buf.push(value);
        self
    }

    pub(crate) fn u32(mut self, value: u32) -> Self {
        self.buf.extend_from_slice(&value.to_be_bytes());
        self
    }

    pub(crate) fn u64(mut self, value: u64) -> Self {
        self.buf.extend_from_slice(&value.to_be_bytes());
        self
    }

    pub(crate) fn bytes(self, value: &[u8]) -> Self {
        let mut this = self.u32(value.len() as u32);
        this.buf.extend_from_slice(value);
        this
    }

    pub(crate) fn str(self, value: &str) -> Self {
        self.bytes(value.as_bytes())
    }

    pub(crate) fn finish(self) -> Vec<u8> {
        self.buf
    }
}

/// Reads length-prefixed fields, naming the message in errors
pub(crate) struct PayloadReader<'a> {
    buf: &'a [u8],
    pos: usize,
    what: &'static str,
}

impl<'a> PayloadReader<'a> {
    pub(crate) fn new(buf: &'a [u8], what: &'static str) -> Self {
        Self { buf, pos: 0, what }
    }

    fn take(&mut self, len: usize, field: &str) -> Result<&'a [u8]> {
        if self.buf.len() - self.pos < len {
            return Err(PartyError::Protocol(format!(
                "{}: incomplete {} (expected {} bytes, got {})",
                self.what,
                field,
                len,
                self.buf.len() - self.pos
            )));
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    pub(crate) fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1, "byte")?[0])
    }

    pub(crate) fn u32(&mut self) -> Result<u32> {
        let b = self.take(4, "u32")?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub(crate) fn u64(&mut self) -> Result<u64> {
        let b = self.take(8, "u64")?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(u64::from_be_bytes(raw))
    }

    pub(crate) fn bytes(&mut self) -> Result<&'a [u8]> {
        let len = self.u32()? as usize;
        self.take(len, "field")
    }

    pub(crate) fn string(&mut self) -> Result<String> {
        let raw = self.bytes()?;
        String::from_utf8(raw.to_vec())
            .map_err(|_| PartyError::Protocol(format!("{}: field is not UTF-8", self.what)))
    }

    /// Fail if bytes remain
    pub(crate) fn finish(self) -> Result<()> {
        if self.pos != self.buf.len() {
            return Err(PartyError::Protocol(format!(
                "{}: unexpected trailing {} bytes",
                self.what,
                self.buf.len() - self.pos
            )));
        }
        Ok(())
    }
}

// =============================================================================
// Command Encoding/Decoding
// =============================================================================

/// Encode a command to bytes
///
/// Format: cmd_type (1) + payload_len (4) + payload
pub fn encode_command(command: &Command) -> Vec<u8> {
    let cmd_type = command.command_type() as u8;

    // Build payload based on command type
    let payload = match command {
        Command::Get { key } => PayloadWriter::new().str(key).finish(),
        Command::Set { key, value, ttl_ms } => PayloadWriter::new()
            .str(key)
            .u64(*ttl_ms)
            .bytes(value)
            .finish(),
        Command::Delete { key } => PayloadWriter::new().str(key).finish(),
        Command::Ping => Vec::new(),
        Command::Commit { txn } => encode_transaction(txn),
        Command::Scan { prefix } => PayloadWriter::new().str(prefix).finish(),
        Command::Publish { channel, payload } => {
            PayloadWriter::new().str(channel).bytes(payload).finish()
        }
        Command::Subscribe { channel } => PayloadWriter::new().str(channel).finish(),
    };

    frame(cmd_type, &payload)
}

fn encode_transaction(txn: &Transaction) -> Vec<u8> {
    let mut w = PayloadWriter::new().u32(txn.checks.len() as u32);
    for (key, expected) in &txn.checks {
        w = w.str(key);
        w = match expected {
            Some(version) => w.u8(1).u64(version.0),
            None => w.u8(0),
        };
    }
    w = w.u32(txn.writes.len() as u32);
    for write in &txn.writes {
        w = match write {
            WriteOp::Put { key, value, ttl } => w
                .u8(WRITE_PUT)
                .str(key)
                .u64(ttl.map(|t| t.as_millis() as u64).unwrap_or(0))
                .bytes(value),
            WriteOp::Delete { key } => w.u8(WRITE_DELETE).str(key),
        };
    }
    w.finish()
}

fn frame(kind: u8, payload: &[u8]) -> Vec<u8> {
    let mut message = Vec::with_capacity(HEADER_SIZE + payload.len());
    message.push(kind);
    message.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    message.extend_from_slice(payload);
    message
}

/// Split a full frame into its type byte and payload
fn unframe<'a>(bytes: &'a [u8], what: &str) -> Result<(u8, &'a [u8])> {
    if bytes.len() < HEADER_SIZE {
        return Err(PartyError::Protocol(format!(
            "Incomplete {} header: expected {} bytes, got {}",
            what,
            HEADER_SIZE,
            bytes.len()
        )));
    }

    let payload_len = u32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]) as usize;

    if payload_len > MAX_PAYLOAD_SIZE as usize {
        return Err(PartyError::Protocol(format!(
            "{} payload too large: {} bytes (max {})",
            what, payload_len, MAX_PAYLOAD_SIZE
        )));
    }

    let total_len = HEADER_SIZE + payload_len;
    if bytes.len() < total_len {
        return Err(PartyError::Protocol(format!(
            "Incomplete {} payload: expected {} bytes, got {}",
            what,
            total_len,
            bytes.len()
        )));
    }

    Ok((bytes[0], &bytes[HEADER_SIZE..total_len]))
}

/// Decode a command from bytes
pub fn decode_command(bytes: &[u8]) -> Result<Command> {
    let (cmd_type, payload) = unframe(bytes, "command")?;

    let command = match cmd_type {
        0x01 => {
            let mut r = PayloadReader::new(payload, "GET command");
            let key = r.string()?;
            r.finish()?;
            Command::Get { key }
        }
        0x02 => {
            let mut r = PayloadReader::new(payload, "SET command");
            let key = r.string()?;
            let ttl_ms = r.u64()?;
            let value = r.bytes()?.to_vec();
            r.finish()?;
            Command::Set { key, value, ttl_ms }
        }
        0x03 => {
            let mut r = PayloadReader::new(payload, "DELETE command");
            let key = r.string()?;
            r.finish()?;
            Command::Delete { key }
        }
        0x04 => {
            if !payload.is_empty() {
                return Err(PartyError::Protocol(format!(
                    "PING command: unexpected payload of {} bytes",
                    payload.len()
                )));
            }
            Command::Ping
        }
        0x05 => Command::Commit {
            txn: decode_transaction(payload)?,
        },
        0x06 => {
            let mut r = PayloadReader::new(payload, "SCAN command");
            let prefix = r.string()?;
            r.finish()?;
            Command::Scan { prefix }
        }
        0x07 => {
            let mut r = PayloadReader::new(payload, "PUBLISH command");
            let channel = r.string()?;
            let body = r.bytes()?.to_vec();
            r.finish()?;
            Command::Publish {
                channel,
                payload: body,
            }
        }
        0x08 => {
            let mut r = PayloadReader::new(payload, "SUBSCRIBE command");
            let channel = r.string()?;
            r.finish()?;
            Command::Subscribe { channel }
        }
        _ => {
            return Err(PartyError::Protocol(format!(
                "Unknown command type: 0x{:02x}",
                cmd_type
            )))
        }
    };

    Ok(command)
}

fn decode_transaction(payload: &[u8]) -> Result<Transaction> {
    let mut r = PayloadReader::new(payload, "COMMIT command");
    let mut txn = Transaction::new();

    let checks = r.u32()?;
    for _ in 0..checks {
        let key = r.string()?;
        let expected = match r.u8()? {
            0 => None,
            1 => Some(Version(r.u64()?)),
            other => {
                return Err(PartyError::Protocol(format!(
                    "COMMIT command: bad version flag 0x{:02x}",
                    other
                )))
            }
        };
        txn.checks.push((key, expected));
    }

    let writes = r.u32()?;
    for _ in 0..writes {
        match r.u8()? {
            WRITE_PUT => {
                let key = r.string()?;
                let ttl_ms = r.u64()?;
                let value = Bytes::copy_from_slice(r.bytes()?);
                let ttl = (ttl_ms > 0).then(|| Duration::from_millis(ttl_ms));
                txn.writes.push(WriteOp::Put { key, value, ttl });
            }
            WRITE_DELETE => {
                let key = r.string()?;
                txn.writes.push(WriteOp::Delete { key });
            }
            other => {
                return Err(PartyError::Protocol(format!(
                    "COMMIT command: unknown write tag 0x{:02x}",
                    other
                )))
            }
        }
    }

    r.finish()?;
    Ok(txn)
}

// =============================================================================
// Response Encoding/Decoding
// =============================================================================

/// Encode a response to bytes
///
/// Format: status (1) + payload_len (4) + payload
pub fn encode_response(response: &Response) -> Vec<u8> {
    frame(response.status as u8, response.body())
}

/// Decode a response from bytes
pub fn decode_response(bytes: &[u8]) -> Result<Response> {
    let (status_byte, body) = unframe(bytes, "response")?;

    let status = match status_byte {
        0x00 => Status::Ok,
        0x01 => Status::NotFound,
        0x02 => Status::Error,
        0x03 => Status::Conflict,
        0x04 => Status::Message,
        _ => {
            return Err(PartyError::Protocol(format!(
                "Unknown response status: 0x{:02x}",
                status_byte
            )))
        }
    };

    let payload = if body.is_empty() {
        None
    } else {
        Some(body.to_vec())
    };

    Ok(Response { status, payload })
}

// =============================================================================
// Stream-based I/O helpers
// =============================================================================

/// Read one frame (header + payload) from a stream
fn read_frame<R: Read>(reader: &mut R) -> Result<Vec<u8>> {
    let mut header = [0u8; HEADER_SIZE];
    reader.read_exact(&mut header)?;

    let payload_len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;

    if payload_len > MAX_PAYLOAD_SIZE as usize {
        return Err(PartyError::Protocol(format!(
            "Payload too large: {} bytes (max {})",
            payload_len, MAX_PAYLOAD_SIZE
        )));
    }

    let mut full_message = vec![0u8; HEADER_SIZE + payload_len];
    full_message[..HEADER_SIZE].copy_from_slice(&header);
    if payload_len > 0 {
        reader.read_exact(&mut full_message[HEADER_SIZE..])?;
    }

    Ok(full_message)
}

/// Read a complete command from a stream
///
/// Blocks until a complete command is received or an error occurs
pub fn read_command<R: Read>(reader: &mut R) -> Result<Command> {
    let message = read_frame(reader)?;
    decode_command(&message)
}

/// Write a command to a stream
pub fn write_command<W: Write>(writer: &mut W, command: &Command) -> Result<()> {
    let bytes = encode_command(command);
    writer.write_all(&bytes)?;
    writer.flush()?;
    Ok(())
}

/// Read a complete response from a stream
pub fn read_response<R: Read>(reader: &mut R) -> Result<Response> {
    let message = read_frame(reader)?;
    decode_response(&message)
}

/// Write a response to a stream
pub fn write_response<W: Write>(writer: &mut W, response: &Response) -> Result<()> {
    let bytes = encode_response(response);
    writer.write_all(&bytes)?;
    writer.flush()?;
    Ok(())
}
