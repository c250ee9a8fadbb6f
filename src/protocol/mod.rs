//! RESP protocol (client side)
//!
//! Request encoding and incremental reply parsing for the connections the
//! HA manager opens itself: discovery probes, pings and sentinel channels.

pub mod parser;
pub mod types;

pub use parser::Parser;
pub use types::{RespValue, encode_command, write_command};
