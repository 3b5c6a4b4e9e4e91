//! IRC message model.
//!
//! RFC 1459 line grammar:
//!
//! ```text
//! <message>  ::= [':' <prefix> <SPACE> ] <command> <params> <crlf>
//! <params>   ::= <SPACE> [ ':' <trailing> | <middle> <params> ]
//! ```
//!
//! Parsing is whitespace-token based and never fails: malformed input yields
//! a best-effort message instead of an error.

use std::fmt;

/// A single IRC line, split into its parts.
///
/// `prefix` keeps its leading `:`, and so does the first trailing token.
/// Only [`Message::content`] strips it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Message {
    raw: String,
    prefix: Option<String>,
    command: String,
    middle: Option<Vec<String>>,
    trailing: Option<Vec<String>>,
}

impl Message {
    /// Parses one wire line (without its terminator).
    ///
    /// Any line with a token after the optional prefix has a non-empty
    /// command. Two inputs have none and yield an empty `command`: a line of
    /// only whitespace, and a line holding nothing but a `:prefix` token.
    /// Both keep their `raw` text, so they are not [`Message::is_empty`].
    pub fn parse(line: &str) -> Self {
        if line.is_empty() {
            return Self::default();
        }

        let mut tokens = line.split_whitespace();
        let (prefix, command) = match tokens.next() {
            Some(first) if first.starts_with(':') => {
                (Some(first.to_owned()), tokens.next().unwrap_or_default())
            }
            Some(first) => (None, first),
            None => (None, ""),
        };

        let params: Vec<&str> = tokens.collect();
        let (middle, trailing) = match params.iter().position(|p| p.starts_with(':')) {
            Some(idx) => (&params[..idx], &params[idx..]),
            None => (&params[..], &params[params.len()..]),
        };

        Self {
            raw: line.to_owned(),
            prefix,
            command: command.to_owned(),
            middle: to_owned_tokens(middle),
            trailing: to_owned_tokens(trailing),
        }
    }

    /// The line exactly as received or built.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn prefix(&self) -> Option<&str> {
        self.prefix.as_deref()
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn middle(&self) -> Option<&[String]> {
        self.middle.as_deref()
    }

    pub fn trailing(&self) -> Option<&[String]> {
        self.trailing.as_deref()
    }

    /// Middle parameters joined by single spaces.
    pub fn params(&self) -> String {
        self.middle.as_ref().map(|m| m.join(" ")).unwrap_or_default()
    }

    /// Trailing parameters joined by single spaces, leading `:` kept.
    pub fn trailing_text(&self) -> String {
        self.trailing.as_ref().map(|t| t.join(" ")).unwrap_or_default()
    }

    /// Trailing parameters joined by single spaces, one leading `:` removed.
    pub fn content(&self) -> String {
        let text = self.trailing_text();
        match text.strip_prefix(':') {
            Some(stripped) => stripped.to_owned(),
            None => text,
        }
    }

    /// Returns whether this message is the empty (default) message.
    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    /// Returns whether the command is a three-digit numeric reply.
    pub fn is_numeric(&self) -> bool {
        self.command.len() == 3 && self.command.bytes().all(|b| b.is_ascii_digit())
    }

    /// Channel this message refers to, if any.
    ///
    /// Looks at middle parameters first (`PRIVMSG #chan`, `353 bot = #chan`,
    /// `366 bot #chan`), then at the first trailing token (`JOIN :#chan`).
    pub fn channel(&self) -> Option<&str> {
        if let Some(chan) = self
            .middle
            .iter()
            .flatten()
            .find(|token| is_channel_name(token))
        {
            return Some(chan.as_str());
        }

        self.trailing
            .as_ref()
            .and_then(|t| t.first())
            .map(|first| first.strip_prefix(':').unwrap_or(first))
            .filter(|token| is_channel_name(token))
    }

    /// Nickname part of a `:nick!user@host` prefix.
    pub fn nick(&self) -> Option<&str> {
        let prefix = self.prefix.as_deref()?.strip_prefix(':')?;
        let nick = prefix.split(['!', '@']).next().unwrap_or_default();
        (!nick.is_empty()).then_some(nick)
    }
}

fn to_owned_tokens(tokens: &[&str]) -> Option<Vec<String>> {
    if tokens.is_empty() {
        None
    } else {
        Some(tokens.iter().map(|t| (*t).to_owned()).collect())
    }
}

/// Case-folds a channel or nick name for comparison (ASCII casemapping).
pub fn irc_lower(name: &str) -> String {
    name.to_ascii_lowercase()
}

fn is_channel_name(token: &str) -> bool {
    token.len() > 1 && (token.starts_with('#') || token.starts_with('&'))
}

impl From<&str> for Message {
    fn from(line: &str) -> Self {
        Self::parse(line)
    }
}

impl From<String> for Message {
    fn from(line: String) -> Self {
        Self::parse(&line)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_parse_empty_line() {
        let msg = Message::parse("");
        assert_eq!(msg, Message::default());
        assert!(msg.is_empty());
        assert_eq!(msg.prefix(), None);
        assert_eq!(msg.command(), "");
        assert_eq!(msg.params(), "");
        assert_eq!(msg.content(), "");
    }

    #[test]
    fn test_parse_motd_line() {
        let msg = Message::parse(":srv 372 bot :hello there");
        assert_eq!(msg.prefix(), Some(":srv"));
        assert_eq!(msg.command(), "372");
        assert_eq!(msg.params(), "bot");
        assert_eq!(msg.trailing_text(), ":hello there");
        assert_eq!(msg.content(), "hello there");
        assert!(msg.is_numeric());
    }

    #[test]
    fn test_parse_twitch_motd() {
        let line = ":tmi.twitch.tv 372 my_bot :You are in a maze of twisty passages.";
        let msg = Message::parse(line);
        assert_eq!(msg.raw(), line);
        assert_eq!(msg.prefix(), Some(":tmi.twitch.tv"));
        assert_eq!(msg.command(), "372");
        assert_eq!(msg.params(), "my_bot");
        assert_eq!(
            msg.trailing_text(),
            ":You are in a maze of twisty passages."
        );
    }

    #[test]
    fn test_no_prefix_no_middle() {
        let msg = Message::parse("PING :tmi.twitch.tv callback");
        assert_eq!(msg.prefix(), None);
        assert_eq!(msg.middle(), None);
        assert_eq!(msg.command(), "PING");
        assert_eq!(msg.trailing_text(), ":tmi.twitch.tv callback");
        assert_eq!(msg.content(), "tmi.twitch.tv callback");
    }

    #[test]
    fn test_no_trailing() {
        let msg = Message::parse(":my_bot!my_bot@my_bot.tmi.twitch.tv JOIN #my_bot params");
        assert_eq!(msg.trailing(), None);
        assert_eq!(msg.params(), "#my_bot params");
        assert_eq!(msg.channel(), Some("#my_bot"));
        assert_eq!(msg.nick(), Some("my_bot"));
    }

    #[test]
    fn test_no_params() {
        let msg = Message::parse("QUIT");
        assert_eq!(msg.command(), "QUIT");
        assert_eq!(msg.middle(), None);
        assert_eq!(msg.trailing(), None);
    }

    #[test]
    fn test_trailing_keeps_later_colons() {
        let msg = Message::parse("PRIVMSG #chan ::) :D");
        assert_eq!(msg.params(), "#chan");
        assert_eq!(msg.content(), ":) :D");
    }

    #[test]
    fn test_runs_of_whitespace() {
        let msg = Message::parse("PRIVMSG   #chan    :hi   there");
        assert_eq!(msg.middle(), Some(&["#chan".to_string()][..]));
        assert_eq!(msg.content(), "hi there");
    }

    #[test]
    fn test_channel_from_names_replies() {
        let names = Message::parse(":tmi 353 bot = #chan :bot other");
        assert_eq!(names.command(), "353");
        assert_eq!(names.channel(), Some("#chan"));

        let end = Message::parse(":tmi 366 bot #chan :End of /NAMES list");
        assert_eq!(end.channel(), Some("#chan"));
    }

    #[test]
    fn test_channel_from_trailing_join() {
        let msg = Message::parse(":nick!u@h JOIN :#chan");
        assert_eq!(msg.channel(), Some("#chan"));
        assert_eq!(Message::parse("PING :tmi.twitch.tv").channel(), None);
    }

    #[test]
    fn test_bad_message() {
        assert_eq!(Message::parse("break").command(), "break");

        let colons = Message::parse(": : : : : : : :  : : : : : :  ");
        assert_eq!(colons.prefix(), Some(":"));
        assert_eq!(colons.command(), ":");

        let blank = Message::parse("   \t ");
        assert_eq!(blank.command(), "");
        assert!(!blank.is_empty());

        let prefix_only = Message::parse(":prefix_only");
        assert_eq!(prefix_only.prefix(), Some(":prefix_only"));
        assert_eq!(prefix_only.command(), "");
        assert_eq!(prefix_only.nick(), Some("prefix_only"));
    }

    #[test]
    fn test_irc_lower() {
        assert_eq!(irc_lower("#TravelCast_Bot"), "#travelcast_bot");
        assert_eq!(irc_lower("#bot"), irc_lower("#BOT"));
    }

    #[test]
    fn test_display_is_raw() {
        let msg = Message::from("PRIVMSG #x :hi");
        assert_eq!(msg.to_string(), "PRIVMSG #x :hi");
    }

    proptest! {
        #[test]
        fn parse_never_panics(line in "\\PC{0,200}") {
            let msg = Message::parse(&line);
            let _ = msg.params();
            let _ = msg.content();
            let _ = msg.channel();
            let _ = msg.nick();
        }

        #[test]
        fn non_blank_lines_have_a_command(line in "[A-Za-z0-9#:]{1,20}( [A-Za-z0-9#:]{1,20}){0,5}") {
            let msg = Message::parse(&line);
            prop_assume!(!line.starts_with(':') || line.contains(' '));
            prop_assert!(!msg.command().is_empty());
        }

        #[test]
        fn only_prefix_or_blank_lines_lack_a_command(line in "[ \t]{0,4}(:[a-z]{1,8})?[ \t]{0,4}") {
            let msg = Message::parse(&line);
            prop_assert!(msg.command().is_empty());
            prop_assert_eq!(msg.raw(), line.as_str());
        }
    }
}
