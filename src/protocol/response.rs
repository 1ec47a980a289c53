//! Response definitions
//!
//! Represents responses (and pushed messages) sent to clients.

/// Response status codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    Ok = 0x00,
    NotFound = 0x01,
    Error = 0x02,
    /// A transaction expectation did not hold; payload is the key
    Conflict = 0x03,
    /// Pushed pub/sub message on a subscribed connection
    Message = 0x04,
}

/// A response to send to client
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    /// Status code
    pub status: Status,

    /// Optional payload (body for OK, key for CONFLICT, message for ERROR)
    pub payload: Option<Vec<u8>>,
}

impl Response {
    /// Create an OK response with optional payload
    pub fn ok(payload: Option<Vec<u8>>) -> Self {
        Self {
            status: Status::Ok,
            payload,
        }
    }

    /// Create a NOT_FOUND response
    pub fn not_found() -> Self {
        Self {
            status: Status::NotFound,
            payload: None,
        }
    }

    /// Create an ERROR response
    pub fn error(message: &str) -> Self {
        Self {
            status: Status::Error,
            payload: Some(message.as_bytes().to_vec()),
        }
    }

    /// Create a CONFLICT response naming the key that changed
    pub fn conflict(key: &str) -> Self {
        Self {
            status: Status::Conflict,
            payload: Some(key.as_bytes().to_vec()),
        }
    }

    /// Create a pushed MESSAGE frame
    pub fn message(body: Vec<u8>) -> Self {
        Self {
            status: Status::Message,
            payload: Some(body),
        }
    }

    /// Payload bytes, empty when absent
    pub fn body(&self) -> &[u8] {
        self.payload.as_deref().unwrap_or(&[])
    }
}
