//! Protocol error types.

use thiserror::Error;

/// Errors raised while framing inbound lines.
///
/// None of these are fatal to a connection: the offending line is skipped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("line too long: {len} bytes (max {max})")]
    LineTooLong { len: usize, max: usize },

    #[error("invalid UTF-8 in line")]
    InvalidUtf8,
}
