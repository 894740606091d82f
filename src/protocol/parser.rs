//! Incremental RESP Reply Parser
//!
//! The connection task appends socket data to a `BytesMut` and calls
//! [`RespParser::parse`] until it reports that more data is needed:
//!
//! - `Ok(Some((value, consumed)))` - a full reply was decoded from the first
//!   `consumed` bytes
//! - `Ok(None)` - the buffer holds only part of a reply
//! - `Err(ParseError)` - the stream is not valid RESP
//!
//! A parse error means the reply stream can no longer be matched against the
//! command queue, so callers treat it as fatal for the connection.

use crate::protocol::types::{prefix, RespValue, CRLF};
use bytes::Bytes;
use thiserror::Error;

/// Errors that can occur during RESP parsing.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ParseError {
    /// Unknown type prefix byte
    #[error("unknown type prefix: {0:#04x}")]
    UnknownPrefix(u8),

    /// Invalid integer format
    #[error("invalid integer: {0}")]
    InvalidInteger(String),

    /// Invalid UTF-8 in a simple string or error message
    #[error("invalid UTF-8: {0}")]
    InvalidUtf8(String),

    /// Bulk string length is negative (but not -1 for null)
    #[error("invalid bulk string length: {0}")]
    InvalidBulkLength(i64),

    /// Array length is negative (but not -1 for null)
    #[error("invalid array length: {0}")]
    InvalidArrayLength(i64),

    /// Protocol violation (missing CRLF, etc.)
    #[error("protocol error: {0}")]
    ProtocolError(String),

    /// The message exceeds maximum allowed size
    #[error("message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },
}

/// Result type for parsing operations.
pub type ParseResult<T> = Result<T, ParseError>;

/// Maximum size for a single bulk string (512 MB, same as Redis)
pub const MAX_BULK_SIZE: usize = 512 * 1024 * 1024;

/// Maximum array nesting depth (prevent stack overflow)
pub const MAX_NESTING_DEPTH: usize = 32;

/// A RESP reply parser.
///
/// # Example
///
/// ```
/// use flashkv_driver::protocol::{RespParser, RespValue};
///
/// let mut parser = RespParser::new();
/// let (value, consumed) = parser.parse(b"+OK\r\n:1\r\n").unwrap().unwrap();
/// assert_eq!(value, RespValue::ok());
/// assert_eq!(consumed, 5);
/// ```
#[derive(Debug, Default)]
pub struct RespParser {
    depth: usize,
}

impl RespParser {
    pub fn new() -> Self {
        Self { depth: 0 }
    }

    /// Attempts to parse one complete reply from the start of `buf`.
    pub fn parse(&mut self, buf: &[u8]) -> ParseResult<Option<(RespValue, usize)>> {
        self.depth = 0;
        self.parse_value(buf)
    }

    fn parse_value(&mut self, buf: &[u8]) -> ParseResult<Option<(RespValue, usize)>> {
        if buf.is_empty() {
            return Ok(None);
        }

        if self.depth > MAX_NESTING_DEPTH {
            return Err(ParseError::ProtocolError(format!(
                "maximum nesting depth exceeded: {}",
                MAX_NESTING_DEPTH
            )));
        }

        if !matches!(
            buf[0],
            prefix::SIMPLE_STRING
                | prefix::ERROR
                | prefix::INTEGER
                | prefix::BULK_STRING
                | prefix::ARRAY
        ) {
            return Err(ParseError::UnknownPrefix(buf[0]));
        }

        let (line, header_len) = match read_line(&buf[1..]) {
            Some(pos) => (&buf[1..1 + pos], 1 + pos + CRLF.len()),
            None => return Ok(None),
        };

        match buf[0] {
            prefix::SIMPLE_STRING => {
                Ok(Some((RespValue::SimpleString(utf8(line)?), header_len)))
            }
            prefix::ERROR => Ok(Some((RespValue::Error(utf8(line)?), header_len))),
            prefix::INTEGER => Ok(Some((RespValue::Integer(integer(line)?), header_len))),
            prefix::BULK_STRING => Self::parse_bulk_string(buf, integer(line)?, header_len),
            prefix::ARRAY => self.parse_array(buf, integer(line)?, header_len),
            other => Err(ParseError::UnknownPrefix(other)),
        }
    }

    /// `$<length>\r\n<data>\r\n`, header already consumed.
    fn parse_bulk_string(
        buf: &[u8],
        length: i64,
        header_len: usize,
    ) -> ParseResult<Option<(RespValue, usize)>> {
        if length == -1 {
            return Ok(Some((RespValue::Null, header_len)));
        }
        if length < 0 {
            return Err(ParseError::InvalidBulkLength(length));
        }

        let length = length as usize;
        if length > MAX_BULK_SIZE {
            return Err(ParseError::MessageTooLarge {
                size: length,
                max: MAX_BULK_SIZE,
            });
        }

        let total = header_len + length + CRLF.len();
        if buf.len() < total {
            return Ok(None);
        }
        if &buf[header_len + length..total] != CRLF {
            return Err(ParseError::ProtocolError(
                "bulk string missing trailing CRLF".to_string(),
            ));
        }

        let data = Bytes::copy_from_slice(&buf[header_len..header_len + length]);
        Ok(Some((RespValue::BulkString(data), total)))
    }

    /// `*<count>\r\n<elements...>`, header already consumed.
    fn parse_array(
        &mut self,
        buf: &[u8],
        count: i64,
        header_len: usize,
    ) -> ParseResult<Option<(RespValue, usize)>> {
        if count == -1 {
            return Ok(Some((RespValue::Null, header_len)));
        }
        if count < 0 {
            return Err(ParseError::InvalidArrayLength(count));
        }

        let count = count as usize;
        // Cap the pre-allocation; a hostile count must not reserve gigabytes.
        let mut elements = Vec::with_capacity(count.min(1024));
        let mut consumed = header_len;

        self.depth += 1;
        for _ in 0..count {
            match self.parse_value(&buf[consumed..])? {
                Some((value, used)) => {
                    elements.push(value);
                    consumed += used;
                }
                None => return Ok(None),
            }
        }
        self.depth -= 1;

        Ok(Some((RespValue::Array(elements), consumed)))
    }
}

/// Returns the offset of the first CRLF in `buf`.
#[inline]
fn read_line(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|window| window == CRLF)
}

fn utf8(line: &[u8]) -> ParseResult<String> {
    std::str::from_utf8(line)
        .map(str::to_string)
        .map_err(|e| ParseError::InvalidUtf8(e.to_string()))
}

fn integer(line: &[u8]) -> ParseResult<i64> {
    let s = std::str::from_utf8(line).map_err(|e| ParseError::InvalidUtf8(e.to_string()))?;
    s.parse()
        .map_err(|e: std::num::ParseIntError| ParseError::InvalidInteger(e.to_string()))
}

/// Parses a single reply with a throwaway parser.
pub fn parse_message(buf: &[u8]) -> ParseResult<Option<(RespValue, usize)>> {
    RespParser::new().parse(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_status() {
        let (value, consumed) = parse_message(b"+OK\r\n").unwrap().unwrap();
        assert_eq!(value, RespValue::ok());
        assert_eq!(consumed, 5);
    }

    #[test]
    fn test_parse_redirect_error() {
        let input = b"-MOVED 3999 127.0.0.1:6381\r\n";
        let (value, consumed) = parse_message(input).unwrap().unwrap();
        assert_eq!(value, RespValue::error("MOVED 3999 127.0.0.1:6381"));
        assert_eq!(consumed, input.len());
    }

    #[test]
    fn test_parse_integer() {
        let (value, _) = parse_message(b":-42\r\n").unwrap().unwrap();
        assert_eq!(value, RespValue::Integer(-42));
        assert!(matches!(
            parse_message(b":abc\r\n"),
            Err(ParseError::InvalidInteger(_))
        ));
    }

    #[test]
    fn test_parse_bulk_and_null() {
        let (value, consumed) = parse_message(b"$5\r\nhel\x00o\r\n").unwrap().unwrap();
        assert_eq!(value, RespValue::BulkString(Bytes::from(&b"hel\x00o"[..])));
        assert_eq!(consumed, 11);

        let (value, consumed) = parse_message(b"$-1\r\n").unwrap().unwrap();
        assert_eq!(value, RespValue::Null);
        assert_eq!(consumed, 5);

        let (value, _) = parse_message(b"*-1\r\n").unwrap().unwrap();
        assert_eq!(value, RespValue::Null);
    }

    #[test]
    fn test_parse_incomplete() {
        assert!(parse_message(b"+OK").unwrap().is_none());
        assert!(parse_message(b"$5\r\nhel").unwrap().is_none());
        assert!(parse_message(b"*2\r\n:1\r\n").unwrap().is_none());
        assert!(parse_message(b"").unwrap().is_none());
    }

    #[test]
    fn test_parse_nested_array_with_nil() {
        let input = b"*3\r\n$1\r\na\r\n$-1\r\n*1\r\n:7\r\n";
        let (value, consumed) = parse_message(input).unwrap().unwrap();
        assert_eq!(
            value,
            RespValue::Array(vec![
                RespValue::bulk_string("a"),
                RespValue::Null,
                RespValue::Array(vec![RespValue::Integer(7)]),
            ])
        );
        assert_eq!(consumed, input.len());
    }

    #[test]
    fn test_pipelined_replies_parse_one_at_a_time() {
        let input = b"+OK\r\n:2\r\n$1\r\nx\r\n";
        let mut parser = RespParser::new();
        let mut offset = 0;
        let mut replies = Vec::new();
        while let Some((value, consumed)) = parser.parse(&input[offset..]).unwrap() {
            replies.push(value);
            offset += consumed;
        }
        assert_eq!(
            replies,
            vec![
                RespValue::ok(),
                RespValue::Integer(2),
                RespValue::bulk_string("x")
            ]
        );
        assert_eq!(offset, input.len());
    }

    #[test]
    fn test_unknown_prefix_is_rejected() {
        assert_eq!(
            parse_message(b"@invalid\r\n"),
            Err(ParseError::UnknownPrefix(b'@'))
        );
    }

    #[test]
    fn test_bulk_missing_crlf() {
        assert!(matches!(
            parse_message(b"$2\r\nabXY"),
            Err(ParseError::ProtocolError(_))
        ));
    }
}
