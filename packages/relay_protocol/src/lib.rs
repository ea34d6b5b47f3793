//! Relay Protocol - events and echo suppression for the serial relay
//!
//! Shared by the relay server and the terminal client so both sides agree on
//! event names, payload shape, and how duplicate bodies are recognised.

pub mod dedup;
mod error;
pub mod events;

pub use dedup::DedupCache;
pub use error::ProtocolError;
pub use events::{
    ClientEvent, RATE_MISMATCH_REASON, RelayMessage, ServerEvent, encode, parse_client_event,
    parse_server_event,
};
