//! # twirc-client
//!
//! Connection engine for Twitch-flavored IRC bots.
//!
//! This crate provides:
//! - Async socket read/write loops over any `AsyncRead + AsyncWrite` stream
//! - Per-channel outbound queues gated on join confirmation
//! - Sliding-window flood control
//! - Inbound routing with automatic PONG and user handlers
//! - YAML configuration with environment overrides

pub mod channel;
pub mod config;
pub mod connection;
pub mod error;
pub mod router;
pub mod throttle;

pub use channel::{ChannelQueue, ChannelStats, Enqueued, SYSTEM_CHANNEL};
pub use config::{Config, ConfigError, Credentials};
pub use connection::{write_line, Connection, ConnectionConfig, ConnectionState};
pub use error::ClientError;
pub use router::{HandlerError, MessageHandler, Router, RouterStats};
pub use throttle::DecayingWindow;
pub use twirc_protocol::Message;
