//! Protocol Module
//!
//! Defines the wire protocol between store clients and the store server.
//!
//! ## Protocol Format (V1 - Simple Binary)
//!
//! ### Request Format
//! ```text
//! ┌──────────┬──────────┬─────────────────────────────┐
//! │ Cmd (1)  │ Len (4)  │         Payload             │
//! └──────────┴──────────┴─────────────────────────────┘
//! ```
//!
//! ### Commands
//! - 0x01: GET       - Payload: key
//! - 0x02: SET       - Payload: key + ttl_ms (8) + value
//! - 0x03: DEL       - Payload: key
//! - 0x04: PING      - Payload: empty
//! - 0x05: COMMIT    - Payload: version checks + writes
//! - 0x06: SCAN      - Payload: prefix
//! - 0x07: PUBLISH   - Payload: channel + payload
//! - 0x08: SUBSCRIBE - Payload: channel
//!
//! ### Response Format
//! ```text
//! ┌──────────┬──────────┬─────────────────────────────┐
//! │Status(1) │ Len (4)  │         Payload             │
//! └──────────┴──────────┴─────────────────────────────┘
//! ```
//!
//! ### Status Codes
//! - 0x00: OK
//! - 0x01: NOT_FOUND
//! - 0x02: ERROR
//! - 0x03: CONFLICT (payload: key whose version did not match)
//! - 0x04: MESSAGE  (pushed on a subscribed connection)
//!
//! ### Response Bodies
//! - GET:      version (8) + value
//! - SET:      version (8)
//! - COMMIT:   version (8)
//! - SCAN:     count (4) + [key + version (8) + value]
//! - PUBLISH:  receivers (4)
//! - MESSAGE:  channel + payload

mod body;
mod codec;
mod command;
mod response;

pub use body::{
    decode_entries, decode_message, decode_receivers, decode_version, decode_versioned,
    encode_entries, encode_message, encode_receivers, encode_version, encode_versioned,
};
pub use codec::{
    decode_command, decode_response, encode_command, encode_response, read_command,
    read_response, write_command, write_response, HEADER_SIZE, MAX_PAYLOAD_SIZE,
};
pub use command::{Command, CommandType};
pub use response::{Response, Status};
