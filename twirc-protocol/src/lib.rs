//! # twirc-protocol
//!
//! IRC wire protocol implementation for twirc (RFC 1459 line grammar).
//!
//! This crate provides:
//! - Parsing of single wire lines into [`Message`] values
//! - Reassembly of `\r\n`-terminated lines from a partial-read byte stream
//! - Outbound line encoding
//! - Command and numeric reply constants

pub mod codec;
pub mod command;
pub mod error;
pub mod message;

pub use codec::{encode_line, LineDecoder};
pub use error::ProtocolError;
pub use message::{irc_lower, Message};

/// Line terminator used for every outbound line.
pub const LINE_TERMINATOR: &str = "\r\n";

/// Default plain-text IRC port.
pub const DEFAULT_PORT: u16 = 6667;

/// Maximum accepted inbound line length, terminator excluded (IRCv3 tags included).
pub const MAX_INBOUND_LINE_LENGTH: usize = 8191;
