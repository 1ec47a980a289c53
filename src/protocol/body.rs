//! Response bodies
//!
//! Typed payloads carried inside OK and MESSAGE responses.

use bytes::Bytes;

use crate::error::Result;
use crate::store::{Message, Version, Versioned};
use super::codec::{PayloadReader, PayloadWriter};

/// GET body: version (8) + raw value
pub fn encode_versioned(versioned: &Versioned) -> Vec<u8> {
    let mut body = Vec::with_capacity(8 + versioned.value.len());
    body.extend_from_slice(&versioned.version.0.to_be_bytes());
    body.extend_from_slice(&versioned.value);
    body
}

pub fn decode_versioned(body: &[u8]) -> Result<Versioned> {
    let mut r = PayloadReader::new(body, "GET response");
    let version = Version(r.u64()?);
    Ok(Versioned {
        value: Bytes::copy_from_slice(&body[8..]),
        version,
    })
}

/// SET/COMMIT body
pub fn encode_version(version: Version) -> Vec<u8> {
    version.0.to_be_bytes().to_vec()
}

pub fn decode_version(body: &[u8]) -> Result<Version> {
    let mut r = PayloadReader::new(body, "version response");
    let version = Version(r.u64()?);
    r.finish()?;
    Ok(version)
}

/// SCAN body: count (4) + [key + version (8) + value]
pub fn encode_entries(entries: &[(String, Versioned)]) -> Vec<u8> {
    let mut w = PayloadWriter::new().u32(entries.len() as u32);
    for (key, versioned) in entries {
        w = w.str(key).u64(versioned.version.0).bytes(&versioned.value);
    }
    w.finish()
}

pub fn decode_entries(body: &[u8]) -> Result<Vec<(String, Versioned)>> {
    if body.is_empty() {
        return Ok(Vec::new());
    }
    let mut r = PayloadReader::new(body, "SCAN response");
    let count = r.u32()? as usize;
    let mut entries = Vec::with_capacity(count.min(4096));
    for _ in 0..count {
        let key = r.string()?;
        let version = Version(r.u64()?);
        let value = Bytes::copy_from_slice(r.bytes()?);
        entries.push((key, Versioned { value, version }));
    }
    r.finish()?;
    Ok(entries)
}

/// PUBLISH body: number of subscribers reached
pub fn encode_receivers(receivers: usize) -> Vec<u8> {
    (receivers as u32).to_be_bytes().to_vec()
}

pub fn decode_receivers(body: &[u8]) -> Result<usize> {
    let mut r = PayloadReader::new(body, "PUBLISH response");
    let receivers = r.u32()? as usize;
    r.finish()?;
    Ok(receivers)
}

/// MESSAGE body: channel + payload
pub fn encode_message(message: &Message) -> Vec<u8> {
    PayloadWriter::new()
        .str(&message.channel)
        .bytes(&message.payload)
        .finish()
}

pub fn decode_message(body: &[u8]) -> Result<Message> {
    let mut r = PayloadReader::new(body, "MESSAGE frame");
    let channel = r.string()?;
    let payload = Bytes::copy_from_slice(r.bytes()?);
    r.finish()?;
    Ok(Message { channel, payload })
}
