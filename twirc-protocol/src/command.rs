//! Command names and numeric replies the engine reacts to.

pub const PASS: &str = "PASS";
pub const NICK: &str = "NICK";
pub const USER: &str = "USER";
pub const JOIN: &str = "JOIN";
pub const PING: &str = "PING";
pub const PONG: &str = "PONG";
pub const PRIVMSG: &str = "PRIVMSG";

/// NAMES reply, first half of the join handshake.
pub const RPL_NAMREPLY: &str = "353";
/// End of NAMES list, second half of the join handshake.
pub const RPL_ENDOFNAMES: &str = "366";
/// End of MOTD, treated as "login complete".
pub const RPL_ENDOFMOTD: &str = "376";
