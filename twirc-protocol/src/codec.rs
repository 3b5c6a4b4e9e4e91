//! Line framing for the IRC byte stream.
//!
//! Reads arrive in arbitrary chunks; a line may be split across reads. The
//! decoder keeps the incomplete tail as carry-over until its terminator shows up.

use crate::error::ProtocolError;
use crate::message::Message;
use crate::{LINE_TERMINATOR, MAX_INBOUND_LINE_LENGTH};
use bytes::{Buf, BufMut, BytesMut};

/// Encodes one outbound line, appending `\r\n`.
///
/// Anything from the first embedded CR or LF onwards is dropped so a single
/// call can never put more than one line on the wire.
pub fn encode_line(line: &str) -> BytesMut {
    let line = line.split(['\r', '\n']).next().unwrap_or_default();
    let mut buf = BytesMut::with_capacity(line.len() + LINE_TERMINATOR.len());
    buf.put_slice(line.as_bytes());
    buf.put_slice(LINE_TERMINATOR.as_bytes());
    buf
}

/// Reassembles `\r\n` (or bare `\n`) terminated lines from partial reads.
pub struct LineDecoder {
    buffer: BytesMut,
    max_line_length: usize,
    /// Set after an oversized carry-over was dropped; the rest of that line
    /// is skipped up to its terminator.
    discarding: bool,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::with_max_line_length(MAX_INBOUND_LINE_LENGTH)
    }

    pub fn with_max_line_length(max_line_length: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(4096),
            max_line_length,
            discarding: false,
        }
    }

    /// Appends data to the carry-over buffer.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Returns the next complete, non-empty line without its terminator.
    ///
    /// An error consumes the offending line, so the caller can log it and
    /// keep decoding. An oversized carry-over is dropped together with
    /// everything up to its eventual terminator.
    pub fn next_line(&mut self) -> Result<Option<String>, ProtocolError> {
        loop {
            let newline = self.buffer.iter().position(|&b| b == b'\n');

            if self.discarding {
                match newline {
                    Some(pos) => {
                        self.buffer.advance(pos + 1);
                        self.discarding = false;
                        continue;
                    }
                    None => {
                        self.buffer.clear();
                        return Ok(None);
                    }
                }
            }

            let Some(pos) = newline else {
                if self.buffer.len() > self.max_line_length {
                    let len = self.buffer.len();
                    self.buffer.clear();
                    self.discarding = true;
                    return Err(ProtocolError::LineTooLong {
                        len,
                        max: self.max_line_length,
                    });
                }
                return Ok(None);
            };

            let mut line = self.buffer.split_to(pos + 1);
            line.truncate(pos);
            if line.last() == Some(&b'\r') {
                line.truncate(pos - 1);
            }
            if line.is_empty() {
                continue;
            }
            if line.len() > self.max_line_length {
                return Err(ProtocolError::LineTooLong {
                    len: line.len(),
                    max: self.max_line_length,
                });
            }

            return String::from_utf8(line.to_vec())
                .map(Some)
                .map_err(|_| ProtocolError::InvalidUtf8);
        }
    }

    /// Returns the next complete line parsed as a [`Message`].
    pub fn next_message(&mut self) -> Result<Option<Message>, ProtocolError> {
        Ok(self.next_line()?.map(|line| Message::parse(&line)))
    }

    /// Returns the number of carry-over bytes buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Clears the carry-over buffer.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.discarding = false;
    }
}

impl Default for LineDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn drain(decoder: &mut LineDecoder) -> Vec<String> {
        let mut lines = Vec::new();
        while let Some(line) = decoder.next_line().unwrap() {
            lines.push(line);
        }
        lines
    }

    #[test]
    fn test_encode_line_appends_crlf() {
        assert_eq!(&encode_line("PRIVMSG #x :hi")[..], b"PRIVMSG #x :hi\r\n");
    }

    #[test]
    fn test_encode_line_cuts_embedded_newlines() {
        assert_eq!(
            &encode_line("PRIVMSG #x :hi\r\nQUIT")[..],
            b"PRIVMSG #x :hi\r\n"
        );
        assert_eq!(&encode_line("PONG :a\nJOIN #y")[..], b"PONG :a\r\n");
    }

    #[test]
    fn test_complete_line() {
        let mut decoder = LineDecoder::new();
        decoder.extend(b"PING :tmi.twitch.tv\r\n");
        assert_eq!(drain(&mut decoder), vec!["PING :tmi.twitch.tv"]);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_line_split_across_reads() {
        let mut decoder = LineDecoder::new();
        decoder.extend(b":tmi.twitch.tv 372 bot :You are");
        assert!(decoder.next_line().unwrap().is_none());

        decoder.extend(b" in a maze\r\n:tmi.twitch.tv 376 bot :>\r");
        assert_eq!(
            drain(&mut decoder),
            vec![":tmi.twitch.tv 372 bot :You are in a maze"]
        );

        decoder.extend(b"\n");
        let msg = decoder.next_message().unwrap().unwrap();
        assert_eq!(msg.command(), "376");
    }

    #[test]
    fn test_split_between_cr_and_lf() {
        let mut decoder = LineDecoder::new();
        decoder.extend(b"PING :a\r");
        assert!(decoder.next_line().unwrap().is_none());
        decoder.extend(b"\nPING :b\r\n");
        assert_eq!(drain(&mut decoder), vec!["PING :a", "PING :b"]);
    }

    #[test]
    fn test_bare_newline_and_blank_lines() {
        let mut decoder = LineDecoder::new();
        decoder.extend(b"NICK a\n\r\n\nNICK b\r\n");
        assert_eq!(drain(&mut decoder), vec!["NICK a", "NICK b"]);
    }

    #[test]
    fn test_invalid_utf8_skips_only_that_line() {
        let mut decoder = LineDecoder::new();
        decoder.extend(b"PRIVMSG #x :\xff\xfe\r\nPING :ok\r\n");
        assert_eq!(decoder.next_line(), Err(ProtocolError::InvalidUtf8));
        assert_eq!(decoder.next_line().unwrap().as_deref(), Some("PING :ok"));
    }

    #[test]
    fn test_multibyte_char_split_across_reads() {
        let line = "PRIVMSG #x :héllo\r\n".as_bytes();
        let mut decoder = LineDecoder::new();
        decoder.extend(&line[..14]);
        assert!(decoder.next_line().unwrap().is_none());
        decoder.extend(&line[14..]);
        assert_eq!(drain(&mut decoder), vec!["PRIVMSG #x :héllo"]);
    }

    #[test]
    fn test_oversized_carry_over_is_discarded() {
        let mut decoder = LineDecoder::with_max_line_length(16);
        decoder.extend(&[b'A'; 17]);
        assert!(matches!(
            decoder.next_line(),
            Err(ProtocolError::LineTooLong { len: 17, max: 16 })
        ));
        assert_eq!(decoder.buffered(), 0);

        decoder.extend(b"AAAA\r\nPING :ok\r\n");
        assert_eq!(decoder.next_line().unwrap().as_deref(), Some("PING :ok"));
    }

    #[test]
    fn test_tail_of_oversized_line_is_not_a_new_line() {
        let mut decoder = LineDecoder::with_max_line_length(16);
        decoder.extend(format!("PRIVMSG #x :{}", "A".repeat(20)).as_bytes());
        assert!(matches!(
            decoder.next_line(),
            Err(ProtocolError::LineTooLong { len: 32, max: 16 })
        ));

        // Still inside the dropped line: no terminator yet.
        decoder.extend(b"AAAA PING");
        assert_eq!(decoder.next_line(), Ok(None));
        assert_eq!(decoder.buffered(), 0);

        decoder.extend(b" :injected\r\nPING :real\r\n");
        let msg = decoder.next_message().unwrap().unwrap();
        assert_eq!(msg.raw(), "PING :real");
        assert_eq!(decoder.next_line(), Ok(None));
    }

    #[test]
    fn test_clear_ends_discarding() {
        let mut decoder = LineDecoder::with_max_line_length(4);
        decoder.extend(b"toolong");
        assert!(decoder.next_line().is_err());
        decoder.clear();
        decoder.extend(b"NICK\r\n");
        assert_eq!(decoder.next_line().unwrap().as_deref(), Some("NICK"));
    }

    #[test]
    fn test_oversized_complete_line() {
        let mut decoder = LineDecoder::with_max_line_length(8);
        decoder.extend(b"PRIVMSG #x :too long\r\nPING\r\n");
        assert!(matches!(
            decoder.next_line(),
            Err(ProtocolError::LineTooLong { .. })
        ));
        assert_eq!(decoder.next_line().unwrap().as_deref(), Some("PING"));
    }

    #[test]
    fn test_decoder_clear_and_default() {
        let mut decoder = LineDecoder::default();
        decoder.extend(b"partial");
        assert_eq!(decoder.buffered(), 7);
        decoder.clear();
        assert_eq!(decoder.buffered(), 0);
    }

    proptest! {
        #[test]
        fn reassembles_any_split(
            lines in proptest::collection::vec("[a-zA-Z0-9#:! ]{1,40}", 1..8),
            cut in 0usize..400,
        ) {
            let lines: Vec<String> = lines
                .into_iter()
                .map(|l| l.trim().to_string())
                .filter(|l| !l.is_empty())
                .collect();
            let wire: Vec<u8> = lines.iter().flat_map(|l| format!("{l}\r\n").into_bytes()).collect();
            let cut = cut.min(wire.len());

            let mut decoder = LineDecoder::new();
            decoder.extend(&wire[..cut]);
            let mut out = drain(&mut decoder);
            decoder.extend(&wire[cut..]);
            out.extend(drain(&mut decoder));

            prop_assert_eq!(out, lines);
            prop_assert_eq!(decoder.buffered(), 0);
        }
    }
}
